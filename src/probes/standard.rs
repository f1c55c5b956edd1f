//! Default probe implementations: COMMAND probes run a process, HTTP probes
//! issue a GET against the task's port, TCP probes attempt a connect. Both
//! checker and health checker share the same execution machinery and differ
//! in how results are interpreted.

use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, Result};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use crate::data_model::{
    CheckInfo, CheckKind, CheckStatusInfo, CommandCheck, CommandCheckStatus, HealthCheck,
    HttpCheck, HttpCheckStatus, TaskHealthStatus, TcpCheck, TcpCheckStatus,
};

use super::{CheckerFactory, HealthCheckerFactory, ProbeHandle, ProbeTarget, ProbeUpdate};

const DEFAULT_DELAY_SECS: f64 = 15.0;
const DEFAULT_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_TIMEOUT_SECS: f64 = 20.0;
const DEFAULT_GRACE_PERIOD_SECS: f64 = 10.0;
const DEFAULT_CONSECUTIVE_FAILURES: u32 = 3;

/// What a probe does on each tick, independent of interpretation.
#[derive(Debug, Clone)]
enum ProbeAction {
    Command(CommandCheck),
    Http(HttpCheck),
    Tcp(TcpCheck),
}

#[derive(Debug, Clone)]
struct ProbeSchedule {
    delay: Duration,
    interval: Duration,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProbeOutcome {
    Command(Option<i32>),
    Http(Option<u32>),
    Tcp(bool),
}

impl ProbeOutcome {
    fn succeeded(self) -> bool {
        match self {
            ProbeOutcome::Command(code) => code == Some(0),
            ProbeOutcome::Http(status) => {
                status.is_some_and(|s| (200..400).contains(&s))
            }
            ProbeOutcome::Tcp(connected) => connected,
        }
    }
}

fn secs(value: Option<f64>, default: f64) -> Duration {
    Duration::from_secs_f64(value.unwrap_or(default).max(0.0))
}

fn action_for(
    kind: CheckKind,
    command: &Option<CommandCheck>,
    http: &Option<HttpCheck>,
    tcp: &Option<TcpCheck>,
) -> Result<ProbeAction> {
    match kind {
        CheckKind::Command => command
            .clone()
            .map(ProbeAction::Command)
            .ok_or_else(|| anyhow!("COMMAND check is missing its command")),
        CheckKind::Http => http
            .clone()
            .map(ProbeAction::Http)
            .ok_or_else(|| anyhow!("HTTP check is missing its http descriptor")),
        CheckKind::Tcp => tcp
            .clone()
            .map(ProbeAction::Tcp)
            .ok_or_else(|| anyhow!("TCP check is missing its tcp descriptor")),
        CheckKind::Unknown => Err(anyhow!("UNKNOWN check type is invalid")),
    }
}

async fn execute(action: &ProbeAction, schedule: &ProbeSchedule, target: &ProbeTarget) -> ProbeOutcome {
    match action {
        ProbeAction::Command(check) => {
            let mut command = if let Some(line) = &check.command.value {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            } else {
                let mut args = check.command.arguments.iter();
                let Some(program) = args.next() else {
                    warn!(task_id = %target.task_id, "command check has no command");
                    return ProbeOutcome::Command(None);
                };
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                cmd
            };
            // Helper binaries live in the launcher directory.
            let path = std::env::var("PATH").unwrap_or_default();
            command.env(
                "PATH",
                format!("{}:{path}", target.launcher_dir.display()),
            );
            for variable in &check.command.environment.variables {
                command.env(&variable.name, &variable.value);
            }
            command.stdout(Stdio::null()).stderr(Stdio::null());
            let exit_code = match command.spawn() {
                Ok(mut child) => match timeout(schedule.timeout, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(err)) => {
                        warn!(task_id = %target.task_id, error = %err, "command check wait failed");
                        None
                    }
                    Err(_) => {
                        let _ = child.start_kill();
                        None
                    }
                },
                Err(err) => {
                    warn!(task_id = %target.task_id, error = %err, "failed to spawn command check");
                    None
                }
            };
            ProbeOutcome::Command(exit_code)
        }
        ProbeAction::Http(check) => {
            let path = check.path.as_deref().unwrap_or("/");
            let url = format!("http://127.0.0.1:{}{}", check.port, path);
            let client = reqwest::Client::new();
            let status = match timeout(schedule.timeout, client.get(&url).send()).await {
                Ok(Ok(response)) => Some(response.status().as_u16() as u32),
                Ok(Err(err)) => {
                    debug!(task_id = %target.task_id, error = %err, "http check failed");
                    None
                }
                Err(_) => None,
            };
            ProbeOutcome::Http(status)
        }
        ProbeAction::Tcp(check) => {
            let address = format!("127.0.0.1:{}", check.port);
            let connected = matches!(
                timeout(schedule.timeout, TcpStream::connect(&address)).await,
                Ok(Ok(_))
            );
            ProbeOutcome::Tcp(connected)
        }
    }
}

/// Gate shared by every standard probe: the loop parks while paused.
async fn wait_while_paused(paused: &mut watch::Receiver<bool>) {
    while *paused.borrow() {
        if paused.changed().await.is_err() {
            // Handle dropped; the loop task is about to be aborted.
            std::future::pending::<()>().await;
        }
    }
}

struct StandardProbe {
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProbeHandle for StandardProbe {
    fn pause(&self) {
        let _ = self.paused.send(true);
    }

    fn resume(&self) {
        let _ = self.paused.send(false);
    }
}

impl Drop for StandardProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct StandardCheckerFactory;

impl CheckerFactory for StandardCheckerFactory {
    fn create(
        &self,
        check: &CheckInfo,
        target: ProbeTarget,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>> {
        let action = action_for(check.kind, &check.command, &check.http, &check.tcp)?;
        let schedule = ProbeSchedule {
            delay: secs(check.delay_seconds, DEFAULT_DELAY_SECS),
            interval: secs(check.interval_seconds, DEFAULT_INTERVAL_SECS),
            timeout: secs(check.timeout_seconds, DEFAULT_TIMEOUT_SECS),
        };
        let kind = check.kind;
        let (paused_tx, paused_rx) = watch::channel(false);
        let task = tokio::spawn(run_checker(
            kind, action, schedule, target, updates, paused_rx,
        ));
        Ok(Box::new(StandardProbe {
            paused: paused_tx,
            task,
        }))
    }
}

async fn run_checker(
    kind: CheckKind,
    action: ProbeAction,
    schedule: ProbeSchedule,
    target: ProbeTarget,
    updates: mpsc::UnboundedSender<ProbeUpdate>,
    mut paused: watch::Receiver<bool>,
) {
    sleep(schedule.delay).await;
    let mut previous: Option<ProbeOutcome> = None;
    loop {
        wait_while_paused(&mut paused).await;
        let outcome = execute(&action, &schedule, &target).await;
        // Unchanged results are not re-announced.
        if previous != Some(outcome) {
            previous = Some(outcome);
            let status = check_status_of(kind, outcome);
            if updates
                .send(ProbeUpdate::Check {
                    task_id: target.task_id.clone(),
                    status,
                })
                .is_err()
            {
                return;
            }
        }
        sleep(schedule.interval).await;
    }
}

fn check_status_of(kind: CheckKind, outcome: ProbeOutcome) -> CheckStatusInfo {
    let mut status = CheckStatusInfo {
        kind,
        command: None,
        http: None,
        tcp: None,
    };
    match outcome {
        ProbeOutcome::Command(exit_code) => {
            status.command = Some(CommandCheckStatus { exit_code });
        }
        ProbeOutcome::Http(status_code) => {
            status.http = Some(HttpCheckStatus { status_code });
        }
        ProbeOutcome::Tcp(connected) => {
            status.tcp = Some(TcpCheckStatus {
                succeeded: Some(connected),
            });
        }
    }
    status
}

pub struct StandardHealthCheckerFactory;

impl HealthCheckerFactory for StandardHealthCheckerFactory {
    fn create(
        &self,
        health_check: &HealthCheck,
        target: ProbeTarget,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>> {
        let action = action_for(
            health_check.kind,
            &health_check.command,
            &health_check.http,
            &health_check.tcp,
        )?;
        let schedule = ProbeSchedule {
            delay: secs(health_check.delay_seconds, DEFAULT_DELAY_SECS),
            interval: secs(health_check.interval_seconds, DEFAULT_INTERVAL_SECS),
            timeout: secs(health_check.timeout_seconds, DEFAULT_TIMEOUT_SECS),
        };
        let grace_period = secs(
            health_check.grace_period_seconds,
            DEFAULT_GRACE_PERIOD_SECS,
        );
        let max_failures = health_check
            .consecutive_failures
            .unwrap_or(DEFAULT_CONSECUTIVE_FAILURES)
            .max(1);
        let (paused_tx, paused_rx) = watch::channel(false);
        let task = tokio::spawn(run_health_checker(
            action,
            schedule,
            grace_period,
            max_failures,
            target,
            updates,
            paused_rx,
        ));
        Ok(Box::new(StandardProbe {
            paused: paused_tx,
            task,
        }))
    }
}

async fn run_health_checker(
    action: ProbeAction,
    schedule: ProbeSchedule,
    grace_period: Duration,
    max_failures: u32,
    target: ProbeTarget,
    updates: mpsc::UnboundedSender<ProbeUpdate>,
    mut paused: watch::Receiver<bool>,
) {
    sleep(schedule.delay).await;
    let started = tokio::time::Instant::now();
    let mut consecutive_failures: u32 = 0;
    let mut ever_healthy = false;
    let mut last_reported: Option<bool> = None;
    loop {
        wait_while_paused(&mut paused).await;
        let healthy = execute(&action, &schedule, &target).await.succeeded();
        if healthy {
            consecutive_failures = 0;
            ever_healthy = true;
        } else {
            // Failures before the first success are forgiven while the grace
            // period lasts.
            let in_grace = !ever_healthy && started.elapsed() < grace_period;
            if !in_grace {
                consecutive_failures += 1;
            }
        }
        let kill_task = consecutive_failures >= max_failures;
        if last_reported != Some(healthy) || kill_task {
            last_reported = Some(healthy);
            let update = ProbeUpdate::Health(TaskHealthStatus {
                task_id: target.task_id.clone(),
                healthy,
                kill_task,
            });
            if updates.send(update).is_err() {
                return;
            }
        }
        if kill_task {
            // The executor discards this probe once it starts the kill.
            return;
        }
        sleep(schedule.interval).await;
    }
}
