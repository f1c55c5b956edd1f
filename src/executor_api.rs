//! Wire contract toward the scheduler-facing executor endpoint: outbound
//! SUBSCRIBE/UPDATE calls, the inbound event stream, and the client seam the
//! executor actor talks through.

use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::mpsc, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::data_model::{
    ContainerId, ExecutorId, FrameworkId, FrameworkInfo, KillPolicy, TaskGroupInfo, TaskId,
    TaskInfo, TaskStatus,
};

/// A status update awaiting acknowledgement; replayed on resubscribe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallKind {
    Subscribe {
        unacknowledged_updates: Vec<Update>,
        unacknowledged_tasks: Vec<TaskInfo>,
    },
    Update {
        status: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    #[serde(flatten)]
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Subscribed {
        framework_info: FrameworkInfo,
        container_id: ContainerId,
    },
    Launch {
        task: TaskInfo,
    },
    LaunchGroup {
        task_group: TaskGroupInfo,
    },
    Kill {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kill_policy: Option<KillPolicy>,
    },
    Acknowledged {
        task_id: TaskId,
        uuid: Uuid,
    },
    Shutdown,
    Message {
        #[serde(default)]
        data: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl Event {
    /// Short name used in logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Subscribed { .. } => "SUBSCRIBED",
            Event::Launch { .. } => "LAUNCH",
            Event::LaunchGroup { .. } => "LAUNCH_GROUP",
            Event::Kill { .. } => "KILL",
            Event::Acknowledged { .. } => "ACKNOWLEDGED",
            Event::Shutdown => "SHUTDOWN",
            Event::Message { .. } => "MESSAGE",
            Event::Error { .. } => "ERROR",
            Event::Unknown => "UNKNOWN",
        }
    }
}

/// Upcalls surfaced by an endpoint client into the executor actor.
#[derive(Debug)]
pub enum EndpointEvent {
    Connected,
    Disconnected,
    Event(Event),
}

/// Client half of the subscribe/event stream. `send` must preserve the
/// order in which calls are handed over; the actor relies on it for status
/// update ordering.
pub trait EndpointClient: Send + Sync {
    fn send(&self, call: Call) -> Result<()>;
}

/// Endpoint client over HTTP. A SUBSCRIBE call (re)opens the event stream
/// (newline-delimited JSON frames); UPDATE calls are plain posts. Upcalls
/// are delivered through the channel given at spawn time.
pub struct HttpEndpoint {
    calls: mpsc::UnboundedSender<Call>,
}

impl EndpointClient for HttpEndpoint {
    fn send(&self, call: Call) -> Result<()> {
        self.calls
            .send(call)
            .map_err(|_| anyhow!("endpoint client task is gone"))
    }
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

impl HttpEndpoint {
    pub fn spawn(
        url: String,
        authority: String,
        auth_header: Option<String>,
        upcalls: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url, authority, auth_header, calls_rx, upcalls));
        HttpEndpoint { calls: calls_tx }
    }
}

async fn run(
    url: String,
    authority: String,
    auth_header: Option<String>,
    mut calls: mpsc::UnboundedReceiver<Call>,
    upcalls: mpsc::UnboundedSender<EndpointEvent>,
) {
    let http = reqwest::Client::new();

    loop {
        // Probe reachability before announcing a connection.
        while TcpStream::connect(&authority).await.is_err() {
            sleep(RECONNECT_BACKOFF).await;
        }
        if upcalls.send(EndpointEvent::Connected).is_err() {
            return;
        }

        let mut events: Option<EventStream> = None;
        loop {
            let streaming = events.is_some();
            tokio::select! {
                maybe_call = calls.recv() => {
                    let Some(call) = maybe_call else { return };
                    match call.kind {
                        CallKind::Subscribe { .. } => {
                            match open_event_stream(&http, &url, &auth_header, &call).await {
                                Ok(stream) => events = Some(stream),
                                Err(err) => {
                                    warn!(error = %err, "subscribe call failed");
                                    break;
                                }
                            }
                        }
                        CallKind::Update { .. } => {
                            // Scheduler-side failures are logged and otherwise
                            // ignored; the journal covers redelivery.
                            if let Err(err) = post_call(&http, &url, &auth_header, &call).await {
                                warn!(error = %err, "update call failed");
                            }
                        }
                    }
                }
                frame = next_frame(&mut events), if streaming => {
                    match frame {
                        Ok(Some(event)) => {
                            if upcalls.send(EndpointEvent::Event(event)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("event stream closed by remote");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "event stream interrupted");
                            break;
                        }
                    }
                }
            }
        }

        if upcalls.send(EndpointEvent::Disconnected).is_err() {
            return;
        }
        sleep(RECONNECT_BACKOFF).await;
    }
}

async fn post_call(
    http: &reqwest::Client,
    url: &str,
    auth_header: &Option<String>,
    call: &Call,
) -> Result<()> {
    let mut request = http.post(url).json(call);
    if let Some(header) = auth_header {
        request = request.header(reqwest::header::AUTHORIZATION, header);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("endpoint returned {}", response.status()));
    }
    Ok(())
}

async fn open_event_stream(
    http: &reqwest::Client,
    url: &str,
    auth_header: &Option<String>,
    call: &Call,
) -> Result<EventStream> {
    let mut request = http.post(url).json(call);
    if let Some(header) = auth_header {
        request = request.header(reqwest::header::AUTHORIZATION, header);
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("endpoint returned {}", response.status()));
    }
    Ok(EventStream {
        body: Box::pin(response.bytes_stream()),
        buffer: BytesMut::new(),
    })
}

struct EventStream {
    body: std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: BytesMut,
}

impl EventStream {
    /// Next newline-delimited frame, decoded. `Ok(None)` on clean EOF.
    async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let event = serde_json::from_slice(line)
                    .map_err(|err| anyhow!("malformed event frame: {err}"))?;
                return Ok(Some(event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.chunk()),
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }
}

async fn next_frame(events: &mut Option<EventStream>) -> Result<Option<Event>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
