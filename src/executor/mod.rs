//! The executor actor. All mutable state lives here and is touched only from
//! the actor's event loop; every outward I/O completion, timer and probe
//! result re-enters as a [`Message`] through the mailbox. Deferred messages
//! carry the connection generation they were scheduled under and are dropped
//! when it no longer matches.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::future::join_all;
use indexmap::IndexMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    agent_api::{AgentApi, AgentCall, AgentConnection, AgentError, AgentResponse},
    config::{ExecutorConfig, CONTAINER_IP_ENV},
    data_model::{
        CheckKind, CheckStatusInfo, CommandCheckStatus, ContainerId, ContainerInfo,
        ContainerKind, ContainerStatus, EnvironmentVariable, FrameworkInfo, HttpCheckStatus,
        KillPolicy, SandboxPath, SandboxPathKind, StatusReason, StatusSource, TaskGroupInfo,
        TaskHealthStatus, TaskId, TaskInfo, TaskState, TaskStatus, TcpCheckStatus, Volume,
        VolumeSource, VolumeSourceKind,
    },
    executor_api::{Call, CallKind, EndpointClient, EndpointEvent, Event, Update},
    exit_status,
    probes::{CheckerFactory, HealthCheckerFactory, ProbeHandle, ProbeTarget, ProbeUpdate},
};

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

const REGISTRATION_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(3);
const TERMINATION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
enum ConnectionState {
    Disconnected,
    Connected,
    Subscribed,
}

/// Everything the actor reacts to. Variants carrying `generation` are
/// deferred continuations fenced against resubscription.
pub enum Message {
    Endpoint(EndpointEvent),
    Probe(ProbeUpdate),
    RegistrationTick,
    LaunchResolved {
        task_group: TaskGroupInfo,
        container_ids: Vec<ContainerId>,
        outcome: Result<Vec<AgentResponse>, AgentError>,
    },
    WaitConnected {
        generation: Uuid,
        task_id: TaskId,
        outcome: Result<Box<dyn AgentConnection>, AgentError>,
        retrying: bool,
    },
    IssueWait {
        generation: Uuid,
        task_id: TaskId,
        connection: Box<dyn AgentConnection>,
    },
    Waited {
        generation: Uuid,
        task_id: TaskId,
        outcome: Result<AgentResponse, AgentError>,
    },
    RetryWait {
        generation: Uuid,
        task_id: TaskId,
    },
    Escalated {
        generation: Uuid,
        container_id: ContainerId,
        task_id: TaskId,
        grace_period: Duration,
    },
    KillBatchFailed,
    TerminationDeadline,
}

/// An in-flight `WAIT_NESTED_CONTAINER` long poll. Aborting the task drops
/// the dedicated connection.
struct WaitHandle {
    task: JoinHandle<()>,
}

impl WaitHandle {
    fn disconnect(self) {
        self.task.abort();
    }
}

/// One child container of the executor's own container.
struct Container {
    container_id: ContainerId,
    task_info: TaskInfo,
    task_group: TaskGroupInfo,
    /// Template for check/health updates so accumulated fields survive.
    last_task_status: Option<TaskStatus>,
    checker: Option<Box<dyn ProbeHandle>>,
    health_checker: Option<Box<dyn ProbeHandle>>,
    waiting: Option<WaitHandle>,
    /// True once any status update for this task was acknowledged.
    acknowledged: bool,
    /// This container has been told to die.
    killing: bool,
    /// The group-kill fan-out has observed or initiated death here.
    killing_task_group: bool,
}

pub struct Executor {
    config: Arc<ExecutorConfig>,
    agent: Arc<dyn AgentApi>,
    endpoint: Arc<dyn EndpointClient>,
    checker_factory: Arc<dyn CheckerFactory>,
    health_checker_factory: Arc<dyn HealthCheckerFactory>,

    state: ConnectionState,
    /// Identifies the current subscription epoch; regenerated on connect,
    /// cleared on disconnect.
    connection_generation: Option<Uuid>,
    launched: bool,
    shutting_down: bool,
    terminating: bool,
    force_terminate: bool,
    /// Latched when any task is reported unhealthy.
    unhealthy: bool,
    framework_info: Option<FrameworkInfo>,
    executor_container_id: Option<ContainerId>,

    /// Unacknowledged updates in send order, keyed by update UUID.
    unack_updates: IndexMap<Uuid, Update>,
    containers: IndexMap<TaskId, Container>,

    mailbox_tx: mpsc::UnboundedSender<Message>,
    mailbox_rx: Option<mpsc::UnboundedReceiver<Message>>,
    probe_tx: mpsc::UnboundedSender<ProbeUpdate>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Executor {
    pub fn new(
        config: Arc<ExecutorConfig>,
        agent: Arc<dyn AgentApi>,
        endpoint: Arc<dyn EndpointClient>,
        checker_factory: Arc<dyn CheckerFactory>,
        health_checker_factory: Arc<dyn HealthCheckerFactory>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel();
        {
            let mailbox = mailbox_tx.clone();
            tokio::spawn(async move {
                while let Some(update) = probe_rx.recv().await {
                    if mailbox.send(Message::Probe(update)).is_err() {
                        break;
                    }
                }
            });
        }
        Self {
            config,
            agent,
            endpoint,
            checker_factory,
            health_checker_factory,
            state: ConnectionState::Disconnected,
            connection_generation: None,
            launched: false,
            shutting_down: false,
            terminating: false,
            force_terminate: false,
            unhealthy: false,
            framework_info: None,
            executor_container_id: None,
            unack_updates: IndexMap::new(),
            containers: IndexMap::new(),
            mailbox_tx,
            mailbox_rx: Some(mailbox_rx),
            probe_tx,
        }
    }

    pub fn mailbox(&self) -> mpsc::UnboundedSender<Message> {
        self.mailbox_tx.clone()
    }

    /// Runs the actor to completion. Returns once termination finishes.
    pub async fn run(mut self) {
        let Some(mut mailbox_rx) = self.mailbox_rx.take() else {
            error!("executor is already running");
            return;
        };
        while let Some(message) = mailbox_rx.recv().await {
            self.handle(message);
            if self.should_stop() {
                break;
            }
        }
        info!("executor terminated");
    }

    fn should_stop(&self) -> bool {
        self.force_terminate || (self.terminating && self.unack_updates.is_empty())
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Endpoint(EndpointEvent::Connected) => self.connected(),
            Message::Endpoint(EndpointEvent::Disconnected) => self.disconnected(),
            Message::Endpoint(EndpointEvent::Event(event)) => self.received(event),
            Message::Probe(ProbeUpdate::Check { task_id, status }) => {
                self.task_check_updated(task_id, status)
            }
            Message::Probe(ProbeUpdate::Health(health)) => self.task_health_updated(health),
            Message::RegistrationTick => self.do_reliable_registration(),
            Message::LaunchResolved {
                task_group,
                container_ids,
                outcome,
            } => self.launch_group_resolved(task_group, container_ids, outcome),
            Message::WaitConnected {
                generation,
                task_id,
                outcome,
                retrying,
            } => self.wait_connected(generation, task_id, outcome, retrying),
            Message::IssueWait {
                generation,
                task_id,
                connection,
            } => self.issue_wait(generation, task_id, connection),
            Message::Waited {
                generation,
                task_id,
                outcome,
            } => self.waited(generation, task_id, outcome),
            Message::RetryWait {
                generation,
                task_id,
            } => self.retry_wait(generation, task_id),
            Message::Escalated {
                generation,
                container_id,
                task_id,
                grace_period,
            } => self.escalated(generation, container_id, task_id, grace_period),
            Message::KillBatchFailed => {
                error!("unable to complete the operation of killing child containers");
                self.initiate_termination();
            }
            Message::TerminationDeadline => {
                self.force_terminate = true;
            }
        }
    }

    fn stale(&self, generation: &Uuid) -> bool {
        self.connection_generation.as_ref() != Some(generation)
    }

    fn delay(&self, after: Duration, message: Message) {
        let tx = self.mailbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message);
        });
    }

    // Subscription state machine.

    fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.connection_generation = Some(Uuid::new_v4());
        self.do_reliable_registration();
    }

    fn disconnected(&mut self) {
        info!("disconnected from agent");
        self.state = ConnectionState::Disconnected;
        self.connection_generation = None;

        // Tear down active wait connections and silence probes; containers
        // and the update journal survive the disconnect.
        for container in self.containers.values_mut() {
            if let Some(waiting) = container.waiting.take() {
                waiting.disconnect();
            }
        }
        for container in self.containers.values() {
            if let Some(checker) = &container.checker {
                checker.pause();
            }
            if let Some(health_checker) = &container.health_checker {
                health_checker.pause();
            }
        }
    }

    fn do_reliable_registration(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }

        let call = Call {
            framework_id: self.config.framework_id.clone(),
            executor_id: self.config.executor_id.clone(),
            kind: CallKind::Subscribe {
                unacknowledged_updates: self.unack_updates.values().cloned().collect(),
                // Unacknowledged terminated tasks are already known to the
                // agent (their wait succeeded) and are not re-announced.
                unacknowledged_tasks: self
                    .containers
                    .values()
                    .filter(|container| !container.acknowledged)
                    .map(|container| container.task_info.clone())
                    .collect(),
            },
        };
        if let Err(err) = self.endpoint.send(call) {
            warn!(error = %err, "failed to send SUBSCRIBE call");
        }

        self.delay(REGISTRATION_INTERVAL, Message::RegistrationTick);
    }

    fn received(&mut self, event: Event) {
        info!(event = event.name(), "received event");
        match event {
            Event::Subscribed {
                framework_info,
                container_id,
            } => {
                self.framework_info = Some(framework_info);
                self.executor_container_id = Some(container_id);
                self.state = ConnectionState::Subscribed;

                // The agent may have failed after the children were
                // launched; resume waiting on them.
                if self.launched {
                    let task_ids: Vec<TaskId> = self.containers.keys().cloned().collect();
                    self.wait_for_all(task_ids);
                }

                for container in self.containers.values() {
                    if let Some(checker) = &container.checker {
                        checker.resume();
                    }
                    if let Some(health_checker) = &container.health_checker {
                        health_checker.resume();
                    }
                }
            }
            Event::Launch { .. } => {
                error!("LAUNCH event is not supported");
                self.shutdown();
            }
            Event::LaunchGroup { task_group } => self.launch_group(task_group),
            Event::Kill {
                task_id,
                kill_policy,
            } => self.kill_task(&task_id, kill_policy),
            Event::Acknowledged { task_id, uuid } => self.acknowledged(task_id, uuid),
            Event::Shutdown => self.shutdown(),
            Event::Message { .. } => {}
            Event::Error { message } => error!(message = %message, "error from endpoint"),
            Event::Unknown => warn!("received an UNKNOWN event and ignored"),
        }
    }

    // Launch protocol.

    fn launch_group(&mut self, task_group: TaskGroupInfo) {
        if self.state != ConnectionState::Subscribed {
            warn!(state = %self.state, "ignoring LAUNCH_GROUP while not subscribed");
            return;
        }
        let Some(parent) = self.executor_container_id.clone() else {
            warn!("ignoring LAUNCH_GROUP without an executor container id");
            return;
        };

        self.launched = true;

        info!(ip = %self.config.container_ip, "setting MESOS_CONTAINER_IP for tasks");

        let mut container_ids = Vec::with_capacity(task_group.tasks.len());
        let mut calls = Vec::with_capacity(task_group.tasks.len());
        for task in &task_group.tasks {
            let container_id = ContainerId::child_of(&parent);
            calls.push(self.build_launch_call(task, &container_id));
            container_ids.push(container_id);
        }

        let agent = self.agent.clone();
        let tx = self.mailbox_tx.clone();
        tokio::spawn(async move {
            let outcome = async {
                let connection = agent.connect().await?;
                let responses =
                    join_all(calls.into_iter().map(|call| {
                        let connection = &connection;
                        async move { connection.call(call).await }
                    }))
                    .await;
                responses.into_iter().collect::<Result<Vec<_>, AgentError>>()
            }
            .await;
            let _ = tx.send(Message::LaunchResolved {
                task_group,
                container_ids,
                outcome,
            });
        });
    }

    fn build_launch_call(&self, task: &TaskInfo, container_id: &ContainerId) -> AgentCall {
        let mut command = task.command.clone().unwrap_or_default();
        command.environment.variables.push(EnvironmentVariable {
            name: CONTAINER_IP_ENV.to_string(),
            value: self.config.container_ip.to_string(),
        });

        let mut container = task.container.clone();

        // Disk resources are mounted in the executor container; share them
        // with the child through sandbox-path volumes at the same path.
        for resource in &task.resources {
            let Some(disk) = &resource.disk else { continue };
            let Some(volume) = &disk.volume else { continue };

            let container = container.get_or_insert_with(|| ContainerInfo {
                kind: ContainerKind::Mesos,
                volumes: Vec::new(),
            });
            container.volumes.push(Volume {
                mode: volume.mode,
                container_path: volume.container_path.clone(),
                source: Some(VolumeSource {
                    kind: VolumeSourceKind::SandboxPath,
                    sandbox_path: Some(SandboxPath {
                        kind: SandboxPathKind::Parent,
                        path: volume.container_path.clone(),
                    }),
                }),
            });
        }

        AgentCall::LaunchNestedContainer {
            container_id: container_id.clone(),
            command: Some(command),
            container,
        }
    }

    fn launch_group_resolved(
        &mut self,
        task_group: TaskGroupInfo,
        container_ids: Vec<ContainerId>,
        outcome: Result<Vec<AgentResponse>, AgentError>,
    ) {
        if self.shutting_down {
            warn!("ignoring the launch operation as the executor is shutting down");
            return;
        }

        let responses = match outcome {
            Ok(responses) => responses,
            Err(err) => {
                error!(error = %err, "unable to launch child containers");
                self.initiate_termination();
                return;
            }
        };

        for response in &responses {
            if !response.is_ok() {
                error!(
                    status = %response.status(),
                    body = %response.body_text(),
                    "received failure while launching child container"
                );
                self.initiate_termination();
                return;
            }
        }

        // The agent may have failed after the children were launched.
        if self.state != ConnectionState::Subscribed {
            error!(state = %self.state, "unable to complete the launch operation");
            self.initiate_termination();
            return;
        }

        for (task, container_id) in task_group.tasks.iter().zip(&container_ids) {
            let mut container = Container {
                container_id: container_id.clone(),
                task_info: task.clone(),
                task_group: task_group.clone(),
                last_task_status: None,
                checker: None,
                health_checker: None,
                waiting: None,
                acknowledged: false,
                killing: false,
                killing_task_group: false,
            };

            if let Some(check) = &task.check {
                match self.checker_factory.create(
                    check,
                    self.probe_target(&task.task_id, container_id),
                    self.probe_tx.clone(),
                ) {
                    Ok(handle) => container.checker = Some(handle),
                    Err(err) => {
                        error!(task_id = %task.task_id, error = %err, "failed to create checker");
                        self.initiate_termination();
                        return;
                    }
                }
            }

            if let Some(health_check) = &task.health_check {
                match self.health_checker_factory.create(
                    health_check,
                    self.probe_target(&task.task_id, container_id),
                    self.probe_tx.clone(),
                ) {
                    Ok(handle) => container.health_checker = Some(handle),
                    Err(err) => {
                        error!(task_id = %task.task_id, error = %err, "failed to create health checker");
                        self.initiate_termination();
                        return;
                    }
                }
            }

            self.create_task_symlink(&task.task_id, container_id);

            self.containers.insert(task.task_id.clone(), container);
        }

        // TASK_RUNNING must precede any check or health update so those can
        // reuse the last status as a template.
        for task in &task_group.tasks {
            let Some(status) = self
                .containers
                .get(&task.task_id)
                .map(|container| self.create_task_status(container, TaskState::Running, None, None))
            else {
                continue;
            };
            self.forward(status);
        }

        info!(
            tasks = ?task_group.task_ids(),
            "successfully launched tasks in child containers"
        );

        self.wait_for_all(task_group.task_ids());
    }

    fn probe_target(&self, task_id: &TaskId, container_id: &ContainerId) -> ProbeTarget {
        ProbeTarget {
            task_id: task_id.clone(),
            container_id: container_id.clone(),
            agent_url: self.config.agent_api_url.clone(),
            launcher_dir: self.config.launcher_dir.clone(),
            auth_header: self.config.auth_header.clone(),
        }
    }

    /// The agent exposes no nested-container to task mapping, so the
    /// sandbox carries `tasks/<task_id>` links for anything that wants the
    /// task's files.
    fn create_task_symlink(&self, task_id: &TaskId, container_id: &ContainerId) {
        let tasks_dir = self.config.sandbox_dir.join("tasks");
        if let Err(err) = std::fs::create_dir_all(&tasks_dir) {
            panic!("unable to create task directory: {err}");
        }

        let link = tasks_dir.join(task_id);
        let target = self
            .config
            .sandbox_dir
            .join("containers")
            .join(&container_id.value);

        // A crashed executor re-run in the same sandbox leaves an identical
        // link behind; anything else is fatal.
        if let Ok(existing) = std::fs::read_link(&link) {
            if existing == target {
                return;
            }
        }
        if let Err(err) = std::os::unix::fs::symlink(&target, &link) {
            panic!(
                "unable to create symbolic link for container {container_id} of task '{task_id}': {err}"
            );
        }
    }

    // Wait protocol.

    fn wait_for_all(&mut self, task_ids: Vec<TaskId>) {
        let Some(generation) = self.connection_generation else {
            return;
        };
        for task_id in task_ids {
            self.connect_and_wait(generation, task_id, false);
        }
    }

    fn connect_and_wait(&self, generation: Uuid, task_id: TaskId, retrying: bool) {
        let agent = self.agent.clone();
        let tx = self.mailbox_tx.clone();
        tokio::spawn(async move {
            let outcome = agent.connect().await;
            let _ = tx.send(Message::WaitConnected {
                generation,
                task_id,
                outcome,
                retrying,
            });
        });
    }

    fn wait_connected(
        &mut self,
        generation: Uuid,
        task_id: TaskId,
        outcome: Result<Box<dyn AgentConnection>, AgentError>,
        retrying: bool,
    ) {
        if self.stale(&generation) {
            debug!("ignoring the wait operation from a stale connection");
            return;
        }
        match outcome {
            Err(err) if retrying => {
                warn!(
                    task_id = %task_id,
                    error = %err,
                    "unable to establish connection with the agent; retrying"
                );
                self.delay(
                    WAIT_RETRY_INTERVAL,
                    Message::RetryWait {
                        generation,
                        task_id,
                    },
                );
            }
            Err(err) => {
                error!(error = %err, "unable to establish connection with the agent");
                self.initiate_termination();
            }
            Ok(connection) if retrying => {
                // The agent may accept connections while still recovering;
                // waiting before the call avoids hammering it with calls
                // that fail with 503 right away.
                self.delay(
                    WAIT_RETRY_INTERVAL,
                    Message::IssueWait {
                        generation,
                        task_id,
                        connection,
                    },
                );
            }
            Ok(connection) => self.issue_wait(generation, task_id, connection),
        }
    }

    fn retry_wait(&mut self, generation: Uuid, task_id: TaskId) {
        if self.stale(&generation) {
            debug!("ignoring retry attempt from a stale connection");
            return;
        }
        if !self.containers.contains_key(&task_id) {
            debug!(task_id = %task_id, "ignoring retry for a task that is no longer active");
            return;
        }
        self.connect_and_wait(generation, task_id, true);
    }

    fn issue_wait(
        &mut self,
        generation: Uuid,
        task_id: TaskId,
        connection: Box<dyn AgentConnection>,
    ) {
        if self.stale(&generation) {
            debug!("ignoring the wait operation from a stale connection");
            return;
        }
        let Some(container) = self.containers.get_mut(&task_id) else {
            debug!(task_id = %task_id, "ignoring wait for a task that is no longer active");
            return;
        };
        if container.waiting.is_some() {
            debug!(task_id = %task_id, "wait already outstanding for child container");
            return;
        }

        info!(
            container_id = %container.container_id,
            task_id = %task_id,
            "waiting for child container"
        );

        let call = AgentCall::WaitNestedContainer {
            container_id: container.container_id.clone(),
        };
        let tx = self.mailbox_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = connection.call(call).await;
            let _ = tx.send(Message::Waited {
                generation,
                task_id,
                outcome,
            });
        });
        container.waiting = Some(WaitHandle { task });
    }

    fn retry_after_disconnect(&mut self, generation: Uuid, task_id: TaskId) {
        if let Some(container) = self.containers.get_mut(&task_id) {
            if let Some(waiting) = container.waiting.take() {
                waiting.disconnect();
            }
        }
        self.delay(
            WAIT_RETRY_INTERVAL,
            Message::RetryWait {
                generation,
                task_id,
            },
        );
    }

    fn waited(
        &mut self,
        generation: Uuid,
        task_id: TaskId,
        outcome: Result<AgentResponse, AgentError>,
    ) {
        if self.stale(&generation) {
            debug!("ignoring the waited callback from a stale connection");
            return;
        }
        if !self.containers.contains_key(&task_id) {
            debug!(task_id = %task_id, "ignoring waited callback for inactive task");
            return;
        }

        let response = match outcome {
            Err(err) => {
                error!(
                    task_id = %task_id,
                    error = %err,
                    "connection for waiting on child container interrupted"
                );
                self.retry_after_disconnect(generation, task_id);
                return;
            }
            Ok(response) => response,
        };

        // The agent can still be recovering right after a restart.
        if response.is_service_unavailable() {
            warn!(
                task_id = %task_id,
                status = %response.status(),
                "agent unavailable while waiting on child container"
            );
            self.retry_after_disconnect(generation, task_id);
            return;
        }

        if !response.is_ok() {
            error!(
                task_id = %task_id,
                status = %response.status(),
                body = %response.body_text(),
                "failure while waiting on child container"
            );
            self.initiate_termination();
            return;
        }

        let wait = match response.wait_nested_container() {
            Ok(wait) => wait,
            Err(err) => {
                error!(error = %err, "malformed wait response");
                self.initiate_termination();
                return;
            }
        };

        let shutting_down = self.shutting_down;
        let (task_state, message, container_id, task_group, kill_group) = {
            let Some(container) = self.containers.get_mut(&task_id) else {
                return;
            };
            container.waiting = None;

            // Silence probes before the terminal update so no check or
            // health update can follow it.
            if let Some(checker) = container.checker.take() {
                checker.pause();
            }
            if let Some(health_checker) = container.health_checker.take() {
                health_checker.pause();
            }

            let (task_state, message) = match wait.exit_status {
                None => (TaskState::Failed, None),
                Some(raw) => {
                    let state = if exit_status::succeeded(raw) {
                        TaskState::Finished
                    } else if container.killing {
                        TaskState::Killed
                    } else {
                        TaskState::Failed
                    };
                    (state, Some(format!("Command {}", exit_status::describe(raw))))
                }
            };

            let doomed = matches!(task_state, TaskState::Failed | TaskState::Killed);
            let kill_group = doomed && !shutting_down && !container.killing_task_group;
            if kill_group {
                container.killing_task_group = true;
            }

            (
                task_state,
                message,
                container.container_id.clone(),
                container.task_group.clone(),
                kill_group,
            )
        };

        let Some(mut status) = self
            .containers
            .get(&task_id)
            .map(|container| self.create_task_status(container, task_state, None, message))
        else {
            return;
        };
        if self.unhealthy {
            status.healthy = Some(false);
        }
        self.forward(status);

        self.containers.shift_remove(&task_id);

        info!(
            container_id = %container_id,
            task_id = %task_id,
            state = %task_state,
            "child container terminated"
        );

        if self.containers.is_empty() {
            self.initiate_termination();
            return;
        }

        if self.shutting_down || !kill_group {
            return;
        }

        // Default restart policy for a task group: a non-zero exit of any
        // member dooms the whole group.
        info!(tasks = ?task_group.task_ids(), "killing task group");
        for task in &task_group.tasks {
            if task.task_id == task_id {
                continue;
            }
            let Some(sibling) = self.containers.get_mut(&task.task_id) else {
                continue;
            };
            sibling.killing_task_group = true;
            if !sibling.killing {
                self.kill(&task.task_id, None);
            }
        }
    }

    // Kill protocol.

    fn kill_task(&mut self, task_id: &TaskId, kill_policy: Option<KillPolicy>) {
        if self.shutting_down {
            warn!(
                task_id = %task_id,
                "ignoring kill for task since the executor is shutting down"
            );
            return;
        }
        if self.state != ConnectionState::Subscribed {
            warn!(
                task_id = %task_id,
                state = %self.state,
                "ignoring kill for task while not subscribed"
            );
            return;
        }

        info!(task_id = %task_id, "received kill for task");

        match self.containers.get(task_id) {
            None => {
                warn!(task_id = %task_id, "ignoring kill for task as it is no longer active");
            }
            Some(container) if container.killing => {
                warn!(
                    task_id = %task_id,
                    "ignoring kill for task as it is in the process of getting killed"
                );
            }
            Some(_) => {
                self.kill(task_id, kill_policy);
            }
        }
    }

    /// Starts the SIGTERM/SIGKILL sequence for a single container. Returns
    /// the in-flight SIGTERM call so shutdown can watch the whole batch.
    fn kill(
        &mut self,
        task_id: &TaskId,
        kill_policy: Option<KillPolicy>,
    ) -> Option<JoinHandle<Result<(), AgentError>>> {
        if self.state != ConnectionState::Subscribed {
            warn!(state = %self.state, "unable to kill while not subscribed");
            return None;
        }
        let Some(generation) = self.connection_generation else {
            return None;
        };

        let (container_id, grace_period) = {
            let Some(container) = self.containers.get_mut(task_id) else {
                return None;
            };
            if container.killing {
                return None;
            }
            container.killing = true;

            if let Some(checker) = container.checker.take() {
                checker.pause();
            }
            if let Some(health_checker) = container.health_checker.take() {
                health_checker.pause();
            }

            // Kill policy in the event takes precedence over the task's own.
            let grace_period = kill_policy
                .and_then(|policy| policy.grace_period)
                .or_else(|| {
                    container
                        .task_info
                        .kill_policy
                        .and_then(|policy| policy.grace_period)
                })
                .map(|duration| duration.as_duration())
                .unwrap_or(DEFAULT_KILL_GRACE_PERIOD);

            (container.container_id.clone(), grace_period)
        };

        info!(
            task_id = %task_id,
            container_id = %container_id,
            "killing task running in child container with SIGTERM signal"
        );
        info!(grace_period = ?grace_period, "scheduling escalation to SIGKILL");

        self.delay(
            grace_period,
            Message::Escalated {
                generation,
                container_id: container_id.clone(),
                task_id: task_id.clone(),
                grace_period,
            },
        );

        // TASK_KILLING only after the probes above were discarded, so a
        // late probe update cannot race past it.
        if self
            .framework_info
            .as_ref()
            .is_some_and(|info| info.has_task_killing_capability())
        {
            let status = self
                .containers
                .get(task_id)
                .map(|container| self.create_task_status(container, TaskState::Killing, None, None));
            if let Some(status) = status {
                self.forward(status);
            }
        }

        Some(self.spawn_agent_kill(container_id, SIGTERM))
    }

    fn spawn_agent_kill(
        &self,
        container_id: ContainerId,
        signal: i32,
    ) -> JoinHandle<Result<(), AgentError>> {
        let agent = self.agent.clone();
        tokio::spawn(async move {
            let id = container_id.to_string();
            match agent
                .call(AgentCall::KillNestedContainer {
                    container_id,
                    signal,
                })
                .await
            {
                Ok(_) => Ok(()),
                Err(err) => {
                    warn!(container_id = %id, signal, error = %err, "kill call failed");
                    Err(err)
                }
            }
        })
    }

    fn escalated(
        &mut self,
        generation: Uuid,
        container_id: ContainerId,
        task_id: TaskId,
        grace_period: Duration,
    ) {
        if self.stale(&generation) {
            debug!("ignoring signal escalation timeout from a stale connection");
            return;
        }
        if !self.containers.contains_key(&task_id) {
            warn!(
                task_id = %task_id,
                container_id = %container_id,
                "ignoring escalation to SIGKILL since the task has already terminated"
            );
            return;
        }

        info!(
            task_id = %task_id,
            container_id = %container_id,
            grace_period = ?grace_period,
            "child container did not terminate within the grace period, sending SIGKILL"
        );
        let _ = self.spawn_agent_kill(container_id, SIGKILL);
    }

    // Probe coupling.

    fn task_check_updated(&mut self, task_id: TaskId, check_status: CheckStatusInfo) {
        // A terminal update may already have been sent.
        let Some(container) = self.containers.get(&task_id) else {
            debug!(task_id = %task_id, "received check update for terminated task; ignoring");
            return;
        };
        // The probe handle is dropped when the task starts terminating.
        if container.checker.is_none() {
            debug!(task_id = %task_id, "received check update for terminating task; ignoring");
            return;
        }

        info!(task_id = %task_id, "received check update for task");

        let Some(last) = container.last_task_status.clone() else {
            debug!(task_id = %task_id, "no previous status to overlay check update onto");
            return;
        };
        let mut status = last;
        status.uuid = Uuid::new_v4();
        status.timestamp = now_secs();
        status.reason = Some(StatusReason::TaskCheckStatusUpdated);
        status.check_status = Some(check_status);
        self.forward(status);
    }

    fn task_health_updated(&mut self, health: TaskHealthStatus) {
        // Nothing can be forwarded while disconnected.
        if self.state == ConnectionState::Disconnected {
            debug!(
                task_id = %health.task_id,
                "ignoring task health update because the executor is not connected to the agent"
            );
            return;
        }
        let Some(container) = self.containers.get(&health.task_id) else {
            debug!(
                task_id = %health.task_id,
                "received task health update for terminated task; ignoring"
            );
            return;
        };
        if container.health_checker.is_none() {
            debug!(
                task_id = %health.task_id,
                "received task health update for terminating task; ignoring"
            );
            return;
        }

        info!(
            task_id = %health.task_id,
            healthy = health.healthy,
            "received task health update"
        );

        let Some(last) = container.last_task_status.clone() else {
            debug!(
                task_id = %health.task_id,
                "no previous status to overlay health update onto"
            );
            return;
        };
        let mut status = last;
        status.uuid = Uuid::new_v4();
        status.timestamp = now_secs();
        status.reason = Some(StatusReason::TaskHealthCheckStatusUpdated);
        status.healthy = Some(health.healthy);
        self.forward(status);

        if health.kill_task {
            self.unhealthy = true;
            self.kill_task(&health.task_id, None);
        }
    }

    // Status updates and acknowledgements.

    /// Builds a status update from scratch, as opposed to overlaying onto
    /// the previous one.
    fn create_task_status(
        &self,
        container: &Container,
        state: TaskState,
        reason: Option<StatusReason>,
        message: Option<String>,
    ) -> TaskStatus {
        let mut status = TaskStatus {
            task_id: container.task_info.task_id.clone(),
            state,
            uuid: Uuid::new_v4(),
            timestamp: now_secs(),
            executor_id: Some(self.config.executor_id.clone()),
            source: Some(StatusSource::Executor),
            reason,
            message,
            healthy: None,
            check_status: None,
            container_status: Some(ContainerStatus {
                container_id: container.container_id.clone(),
            }),
        };

        // A checked task always carries a well-typed check_status slot so
        // later check updates can overlay onto it.
        if let Some(check) = &container.task_info.check {
            status.check_status = Some(zero_check_status(check.kind));
        }

        status
    }

    fn forward(&mut self, status: TaskStatus) {
        self.unack_updates.insert(
            status.uuid,
            Update {
                status: status.clone(),
            },
        );
        if let Some(container) = self.containers.get_mut(&status.task_id) {
            container.last_task_status = Some(status.clone());
        }
        let call = Call {
            framework_id: self.config.framework_id.clone(),
            executor_id: self.config.executor_id.clone(),
            kind: CallKind::Update { status },
        };
        if let Err(err) = self.endpoint.send(call) {
            warn!(error = %err, "failed to send UPDATE call");
        }
    }

    fn acknowledged(&mut self, task_id: TaskId, uuid: Uuid) {
        if self.unack_updates.shift_remove(&uuid).is_none() {
            warn!(uuid = %uuid, "received acknowledgement for unknown status update");
            return;
        }

        // The acknowledgement of a terminal update may arrive after the
        // container is gone; that is fine.
        if let Some(container) = self.containers.get_mut(&task_id) {
            container.acknowledged = true;
        }
    }

    // Shutdown.

    fn shutdown(&mut self) {
        if self.shutting_down {
            warn!("ignoring shutdown since it is in progress");
            return;
        }

        info!("shutting down");
        self.shutting_down = true;

        if !self.launched {
            self.initiate_termination();
            return;
        }

        // The endpoint may have asked us to shut down while not subscribed;
        // nothing can be killed then.
        if self.state != ConnectionState::Subscribed {
            self.initiate_termination();
            return;
        }

        let task_ids: Vec<TaskId> = self
            .containers
            .iter()
            .filter(|(_, container)| !container.killing)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        let mut kill_calls = Vec::new();
        for task_id in task_ids {
            if let Some(handle) = self.kill(&task_id, None) {
                kill_calls.push(handle);
            }
        }

        // Fail fast if the agent dies while the children are being killed.
        let tx = self.mailbox_tx.clone();
        tokio::spawn(async move {
            for handle in kill_calls {
                if !matches!(handle.await, Ok(Ok(()))) {
                    let _ = tx.send(Message::KillBatchFailed);
                    return;
                }
            }
        });
    }

    /// Final stage of shutdown. The actor stops once every pending status
    /// update is acknowledged, or after a short deadline.
    fn initiate_termination(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        if self.unack_updates.is_empty() {
            info!("terminating");
        } else {
            info!(
                pending = self.unack_updates.len(),
                "terminating once pending status updates are acknowledged"
            );
            self.delay(TERMINATION_GRACE, Message::TerminationDeadline);
        }
    }
}

fn zero_check_status(kind: CheckKind) -> CheckStatusInfo {
    let mut status = CheckStatusInfo {
        kind,
        command: None,
        http: None,
        tcp: None,
    };
    match kind {
        CheckKind::Command => status.command = Some(CommandCheckStatus::default()),
        CheckKind::Http => status.http = Some(HttpCheckStatus::default()),
        CheckKind::Tcp => status.tcp = Some(TcpCheckStatus::default()),
        CheckKind::Unknown => panic!("UNKNOWN check type is invalid"),
    }
    status
}
