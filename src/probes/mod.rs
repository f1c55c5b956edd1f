//! Seams for the liveness and health probes attached to tasks. The executor
//! actor only creates, pauses, resumes and drops probe handles; results come
//! back asynchronously over the update channel handed to the factory.

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::data_model::{
    CheckInfo, CheckStatusInfo, ContainerId, HealthCheck, TaskHealthStatus, TaskId,
};

pub mod standard;

/// Asynchronous probe results delivered into the executor actor.
#[derive(Debug, Clone)]
pub enum ProbeUpdate {
    Check {
        task_id: TaskId,
        status: CheckStatusInfo,
    },
    Health(TaskHealthStatus),
}

/// The task/container a probe observes, plus what it needs to reach the
/// agent and helper binaries.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub task_id: TaskId,
    pub container_id: ContainerId,
    pub agent_url: String,
    pub launcher_dir: PathBuf,
    pub auth_header: Option<String>,
}

/// A live probe. Dropping the handle destroys the probe; a paused probe
/// emits no updates until resumed.
pub trait ProbeHandle: Send {
    fn pause(&self);
    fn resume(&self);
}

pub trait CheckerFactory: Send + Sync {
    fn create(
        &self,
        check: &CheckInfo,
        target: ProbeTarget,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>>;
}

pub trait HealthCheckerFactory: Send + Sync {
    fn create(
        &self,
        health_check: &HealthCheck,
        target: ProbeTarget,
        updates: mpsc::UnboundedSender<ProbeUpdate>,
    ) -> Result<Box<dyn ProbeHandle>>;
}
