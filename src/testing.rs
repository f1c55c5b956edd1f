//! In-process harness for driving the executor actor against scripted
//! collaborators: a mock agent whose wait calls block until the test
//! resolves them, a recording endpoint, and inspectable probe handles.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{layer::SubscriberExt, Layer};
use uuid::Uuid;

use crate::{
    agent_api::{AgentApi, AgentCall, AgentConnection, AgentError, AgentResponse},
    config::ExecutorConfig,
    data_model::{
        CheckInfo, CheckKind, CommandCheck, CommandInfo, ContainerId, DiskInfo, DurationInfo,
        FrameworkInfo, HealthCheck, KillPolicy, Resource, TaskGroupInfo, TaskId, TaskInfo,
        TaskState, TaskStatus, Volume, VolumeMode,
    },
    executor::{Executor, Message},
    executor_api::{Call, CallKind, EndpointClient, EndpointEvent, Event, Update},
    probes::{CheckerFactory, HealthCheckerFactory, ProbeHandle, ProbeTarget, ProbeUpdate},
};

// Mock agent.

/// Outcome of a scripted agent call.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// 200 with an empty body.
    Success,
    /// 200 wait response carrying a raw wait status word.
    WaitExit(i32),
    /// 200 wait response with no exit status.
    WaitNoStatus,
    HttpStatus(u16),
    NetworkError,
}

fn respond(disposition: Disposition) -> Result<AgentResponse, AgentError> {
    match disposition {
        Disposition::Success => Ok(AgentResponse::new(StatusCode::OK, Bytes::from_static(b"{}"))),
        Disposition::WaitExit(status) => Ok(AgentResponse::new(
            StatusCode::OK,
            Bytes::from(format!(
                r#"{{"type":"WAIT_NESTED_CONTAINER","wait_nested_container":{{"exit_status":{status}}}}}"#
            )),
        )),
        Disposition::WaitNoStatus => Ok(AgentResponse::new(
            StatusCode::OK,
            Bytes::from_static(br#"{"type":"WAIT_NESTED_CONTAINER","wait_nested_container":{}}"#),
        )),
        Disposition::HttpStatus(code) => Ok(AgentResponse::new(
            StatusCode::from_u16(code).unwrap(),
            Bytes::new(),
        )),
        Disposition::NetworkError => Err(AgentError::Connect("injected failure".to_string())),
    }
}

#[derive(Default)]
struct AgentState {
    calls: Vec<AgentCall>,
    scripted_waits: HashMap<String, VecDeque<Disposition>>,
    pending_waits: HashMap<String, Vec<oneshot::Sender<Disposition>>>,
    launch_disposition: Option<Disposition>,
    kill_disposition: Option<Disposition>,
    connect_disposition: Option<Disposition>,
}

enum Pending {
    Ready(Disposition),
    Blocked(oneshot::Receiver<Disposition>),
}

pub struct MockAgent {
    state: Arc<Mutex<AgentState>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentState::default())),
        }
    }

    pub fn set_launch_disposition(&self, disposition: Disposition) {
        self.state.lock().unwrap().launch_disposition = Some(disposition);
    }

    pub fn set_kill_disposition(&self, disposition: Disposition) {
        self.state.lock().unwrap().kill_disposition = Some(disposition);
    }

    pub fn set_connect_disposition(&self, disposition: Disposition) {
        self.state.lock().unwrap().connect_disposition = Some(disposition);
    }

    /// Resolves the oldest in-flight wait for the container, or scripts the
    /// outcome for the next wait call if none is blocked yet.
    pub fn resolve_wait(&self, container_id: &ContainerId, disposition: Disposition) {
        let mut state = self.state.lock().unwrap();
        let key = container_id.value.clone();
        let pending = state
            .pending_waits
            .get_mut(&key)
            .and_then(|waiters| if waiters.is_empty() { None } else { Some(waiters.remove(0)) });
        match pending {
            Some(waiter) => {
                // A dropped receiver means the wait was torn down; the
                // response would have been ignored anyway.
                let _ = waiter.send(disposition);
            }
            None => {
                state
                    .scripted_waits
                    .entry(key)
                    .or_default()
                    .push_back(disposition);
            }
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn launched_container_ids(&self) -> Vec<ContainerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::LaunchNestedContainer { container_id, .. } => Some(container_id),
                _ => None,
            })
            .collect()
    }

    pub fn launch_calls(&self) -> Vec<AgentCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, AgentCall::LaunchNestedContainer { .. }))
            .collect()
    }

    pub fn wait_call_count(&self, container_id: &ContainerId) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(call, AgentCall::WaitNestedContainer { container_id: id }
                    if id.value == container_id.value)
            })
            .count()
    }

    /// `(container value, signal)` pairs in the order kills were issued.
    pub fn kill_signals(&self) -> Vec<(String, i32)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::KillNestedContainer {
                    container_id,
                    signal,
                } => Some((container_id.value, signal)),
                _ => None,
            })
            .collect()
    }

    fn begin(state: &Arc<Mutex<AgentState>>, call: AgentCall) -> Result<Pending, AgentError> {
        let mut locked = state.lock().unwrap();
        locked.calls.push(call.clone());
        match call {
            AgentCall::WaitNestedContainer { container_id } => {
                let key = container_id.value;
                if let Some(disposition) = locked
                    .scripted_waits
                    .get_mut(&key)
                    .and_then(|queue| queue.pop_front())
                {
                    Ok(Pending::Ready(disposition))
                } else {
                    let (tx, rx) = oneshot::channel();
                    locked.pending_waits.entry(key).or_default().push(tx);
                    Ok(Pending::Blocked(rx))
                }
            }
            AgentCall::LaunchNestedContainer { .. } => Ok(Pending::Ready(
                locked
                    .launch_disposition
                    .clone()
                    .unwrap_or(Disposition::Success),
            )),
            AgentCall::KillNestedContainer { .. } => Ok(Pending::Ready(
                locked
                    .kill_disposition
                    .clone()
                    .unwrap_or(Disposition::Success),
            )),
        }
    }

    async fn dispatch(
        state: Arc<Mutex<AgentState>>,
        call: AgentCall,
    ) -> Result<AgentResponse, AgentError> {
        match Self::begin(&state, call)? {
            Pending::Ready(disposition) => respond(disposition),
            Pending::Blocked(rx) => match rx.await {
                Ok(disposition) => respond(disposition),
                Err(_) => Err(AgentError::Connect("wait connection dropped".to_string())),
            },
        }
    }
}

#[async_trait]
impl AgentApi for MockAgent {
    async fn connect(&self) -> Result<Box<dyn AgentConnection>, AgentError> {
        let disposition = self.state.lock().unwrap().connect_disposition.clone();
        if let Some(Disposition::NetworkError) = disposition {
            return Err(AgentError::Connect("injected connect failure".to_string()));
        }
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }

    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError> {
        Self::dispatch(self.state.clone(), call).await
    }
}

struct MockConnection {
    state: Arc<Mutex<AgentState>>,
}

#[async_trait]
impl AgentConnection for MockConnection {
    async fn call(&self, call: AgentCall) -> Result<AgentResponse, AgentError> {
        MockAgent::dispatch(self.state.clone(), call).await
    }
}

// Mock endpoint.

#[derive(Default)]
pub struct MockEndpoint {
    calls: Mutex<Vec<Call>>,
}

impl EndpointClient for MockEndpoint {
    fn send(&self, call: Call) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<TaskStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call.kind {
                CallKind::Update { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn updates_for(&self, task_id: &str) -> Vec<TaskStatus> {
        self.updates()
            .into_iter()
            .filter(|status| status.task_id == task_id)
            .collect()
    }

    pub fn states_of(&self, task_id: &str) -> Vec<TaskState> {
        self.updates_for(task_id)
            .into_iter()
            .map(|status| status.state)
            .collect()
    }

    /// `(unacknowledged_updates, unacknowledged_tasks)` of every SUBSCRIBE.
    pub fn subscribes(&self) -> Vec<(Vec<Update>, Vec<TaskInfo>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call.kind {
                CallKind::Subscribe {
                    unacknowledged_updates,
                    unacknowledged_tasks,
                } => Some((unacknowledged_updates, unacknowledged_tasks)),
                _ => None,
            })
            .collect()
    }
}

// Mock probes.

pub struct MockProbeState {
    pub task_id: TaskId,
    pub paused: AtomicBool,
    pub dropped: AtomicBool,
}

struct MockProbeHandle {
    state: Arc<MockProbeState>,
}

impl ProbeHandle for MockProbeHandle {
    fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.state.paused.store(false, Ordering::SeqCst);
    }
}

impl Drop for MockProbeHandle {
    fn drop(&mut self) {
        self.state.dropped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockProbeFactory {
    created: Mutex<Vec<Arc<MockProbeState>>>,
    fail_creation: AtomicBool,
}

impl MockProbeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockProbeState>> {
        self.created.lock().unwrap().clone()
    }

    pub fn probe_for(&self, task_id: &str) -> Option<Arc<MockProbeState>> {
        self.created()
            .into_iter()
            .find(|probe| probe.task_id == task_id)
    }

    fn make(&self, target: ProbeTarget) -> Result<Box<dyn ProbeHandle>> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(anyhow!("probe creation failure injected"));
        }
        let state = Arc::new(MockProbeState {
            task_id: target.task_id,
            paused: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(state.clone());
        Ok(Box::new(MockProbeHandle { state }))
    }
}

impl CheckerFactory for MockProbeFactory {
    fn create(
        &self,
        _check: &CheckInfo,
        target: ProbeTarget,
        _updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>> {
        self.make(target)
    }
}

impl HealthCheckerFactory for MockProbeFactory {
    fn create(
        &self,
        _health_check: &HealthCheck,
        target: ProbeTarget,
        _updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>> {
        self.make(target)
    }
}

// Fixtures.

pub fn task(task_id: &str) -> TaskInfo {
    TaskInfo {
        task_id: task_id.to_string(),
        name: format!("task {task_id}"),
        command: Some(CommandInfo {
            value: Some("exec sleep 1000".to_string()),
            arguments: vec![],
            environment: Default::default(),
        }),
        container: None,
        resources: vec![],
        check: None,
        health_check: None,
        kill_policy: None,
    }
}

pub fn kill_policy_secs(seconds: u64) -> KillPolicy {
    KillPolicy {
        grace_period: Some(DurationInfo {
            nanoseconds: (seconds * 1_000_000_000) as i64,
        }),
    }
}

pub fn task_with_kill_policy(task_id: &str, grace_secs: u64) -> TaskInfo {
    let mut task = task(task_id);
    task.kill_policy = Some(kill_policy_secs(grace_secs));
    task
}

pub fn task_with_check(task_id: &str) -> TaskInfo {
    let mut task = task(task_id);
    task.check = Some(CheckInfo {
        kind: CheckKind::Command,
        command: Some(CommandCheck {
            command: CommandInfo {
                value: Some("true".to_string()),
                arguments: vec![],
                environment: Default::default(),
            },
        }),
        http: None,
        tcp: None,
        delay_seconds: None,
        interval_seconds: None,
        timeout_seconds: None,
    });
    task
}

pub fn task_with_health_check(task_id: &str) -> TaskInfo {
    let mut task = task(task_id);
    task.health_check = Some(HealthCheck {
        kind: CheckKind::Command,
        command: Some(CommandCheck {
            command: CommandInfo {
                value: Some("true".to_string()),
                arguments: vec![],
                environment: Default::default(),
            },
        }),
        http: None,
        tcp: None,
        delay_seconds: None,
        interval_seconds: None,
        timeout_seconds: None,
        grace_period_seconds: None,
        consecutive_failures: None,
    });
    task
}

pub fn task_with_disk_volume(task_id: &str, container_path: &str) -> TaskInfo {
    let mut task = task(task_id);
    task.resources = vec![Resource {
        name: "disk".to_string(),
        disk: Some(DiskInfo {
            volume: Some(Volume {
                mode: Some(VolumeMode::Rw),
                container_path: container_path.to_string(),
                source: None,
            }),
        }),
    }];
    task
}

pub fn launch_group(tasks: Vec<TaskInfo>) -> Event {
    Event::LaunchGroup {
        task_group: TaskGroupInfo { tasks },
    }
}

pub fn subscribed(capabilities: Vec<String>) -> Event {
    Event::Subscribed {
        framework_info: FrameworkInfo {
            name: Some("test framework".to_string()),
            capabilities,
        },
        container_id: ContainerId::root("executor-container"),
    }
}

// Harness.

pub struct TestHarness {
    pub agent: Arc<MockAgent>,
    pub endpoint: Arc<MockEndpoint>,
    pub checkers: Arc<MockProbeFactory>,
    pub health_checkers: Arc<MockProbeFactory>,
    pub config: Arc<ExecutorConfig>,
    pub mailbox: mpsc::UnboundedSender<Message>,
    pub actor: tokio::task::JoinHandle<()>,
    _sandbox: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let sandbox = tempfile::tempdir().expect("failed to create sandbox dir");
        let config = Arc::new(ExecutorConfig {
            framework_id: "framework-1".to_string(),
            executor_id: "default-executor".to_string(),
            agent_api_url: "http://127.0.0.1:5051/slave(1)/api/v1".to_string(),
            agent_authority: "127.0.0.1:5051".to_string(),
            sandbox_dir: sandbox.path().to_path_buf(),
            launcher_dir: sandbox.path().to_path_buf(),
            auth_header: None,
            container_ip: "127.0.0.1".parse().unwrap(),
        });

        let agent = Arc::new(MockAgent::new());
        let endpoint = Arc::new(MockEndpoint::new());
        let checkers = Arc::new(MockProbeFactory::new());
        let health_checkers = Arc::new(MockProbeFactory::new());

        let executor = Executor::new(
            config.clone(),
            agent.clone(),
            endpoint.clone(),
            checkers.clone(),
            health_checkers.clone(),
        );
        let mailbox = executor.mailbox();
        let actor = tokio::spawn(executor.run());

        Self {
            agent,
            endpoint,
            checkers,
            health_checkers,
            config,
            mailbox,
            actor,
            _sandbox: sandbox,
        }
    }

    pub fn send(&self, message: Message) {
        let _ = self.mailbox.send(message);
    }

    pub fn deliver(&self, event: Event) {
        self.send(Message::Endpoint(EndpointEvent::Event(event)));
    }

    pub fn connect(&self) {
        self.send(Message::Endpoint(EndpointEvent::Connected));
    }

    pub fn disconnect(&self) {
        self.send(Message::Endpoint(EndpointEvent::Disconnected));
    }

    pub fn subscribe(&self, capabilities: Vec<String>) {
        self.deliver(subscribed(capabilities));
    }

    pub fn acknowledge(&self, task_id: &str, uuid: Uuid) {
        self.deliver(Event::Acknowledged {
            task_id: task_id.to_string(),
            uuid,
        });
    }

    /// Acknowledges every update forwarded so far.
    pub fn acknowledge_all(&self) {
        for status in self.endpoint.updates() {
            self.acknowledge(&status.task_id, status.uuid);
        }
    }

    /// Lets the actor and its side tasks drain without advancing the clock.
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    /// Advances paused time and drains again.
    pub async fn advance(&self, duration: Duration) {
        self.settle().await;
        tokio::time::advance(duration).await;
        self.settle().await;
    }

    pub fn terminated(&self) -> bool {
        self.actor.is_finished()
    }
}
