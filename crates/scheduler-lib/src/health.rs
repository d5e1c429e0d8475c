//! Health tracking for the power scheduler
//!
//! Each job owns one component whose status reflects its latest run:
//! healthy after a clean run, degraded after per-VM errors or missing
//! settings, unhealthy after a systemic failure.

use crate::models::{JobKind, RunOutcome};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Last run processed every VM without errors
    Healthy,
    /// Last run completed with per-VM errors or was aborted
    Degraded,
    /// Last run failed
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Counters of the latest completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDigest {
    pub transitioned: usize,
    pub skipped: usize,
    pub errored: usize,
    pub elapsed_ms: u64,
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunDigest>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_run: None,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Derive a component's health from a run result
    pub fn from_run(result: &Result<RunOutcome>) -> Self {
        match result {
            Ok(RunOutcome::Completed(summary)) => {
                let mut health = if summary.errored > 0 {
                    Self::degraded(format!(
                        "{} of {} VMs failed",
                        summary.errored,
                        summary.processed()
                    ))
                } else {
                    Self::healthy()
                };
                health.last_run = Some(RunDigest {
                    transitioned: summary.transitioned,
                    skipped: summary.skipped,
                    errored: summary.errored,
                    elapsed_ms: summary.elapsed.as_millis() as u64,
                });
                health
            }
            Ok(RunOutcome::Aborted { missing }) => {
                Self::degraded(format!("missing settings: {}", missing.join(", ")))
            }
            Err(err) => Self::unhealthy(format!("{:#}", err)),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    use crate::models::JobKind;

    pub const DEALLOCATE_JOB: &str = "deallocate";
    pub const START_JOB: &str = "start";

    pub fn for_job(job: JobKind) -> &'static str {
        match job {
            JobKind::Deallocate => DEALLOCATE_JOB,
            JobKind::Start => START_JOB,
        }
    }
}

/// Shared registry of per-job health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record the result of a job run under that job's component
    pub async fn record_run(&self, job: JobKind, result: &Result<RunOutcome>) {
        self.update(components::for_job(job), ComponentHealth::from_run(result))
            .await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let (ready, reason) = if !ready {
            (false, Some("Timer loops not yet armed"))
        } else if !health.status.is_operational() {
            (false, Some("Last run of a job failed"))
        } else {
            (true, None)
        };

        ReadinessResponse {
            ready,
            reason: reason.map(str::to_string),
        }
    }
}
