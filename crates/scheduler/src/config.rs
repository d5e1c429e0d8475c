//! Scheduler daemon configuration

use anyhow::{Context, Result};
use scheduler_lib::JobKind;
use serde::Deserialize;
use std::time::Duration;

/// Daemon configuration, read from `SCHEDULER_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Name attached to every log line
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health checks
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_deallocate_schedule")]
    pub deallocate_schedule: String,

    #[serde(default = "default_start_schedule")]
    pub start_schedule: String,

    /// Lateness after which a firing is reported as past due
    #[serde(default = "default_past_due_threshold")]
    pub past_due_threshold_secs: u64,

    /// Run this job once and exit instead of arming timers
    #[serde(default)]
    pub run_once: Option<String>,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "vm-power-scheduler".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_deallocate_schedule() -> String {
    "0 0 19 * * Mon-Fri".to_string()
}

fn default_start_schedule() -> String {
    "0 0 7 * * Mon-Fri".to_string()
}

fn default_past_due_threshold() -> u64 {
    30
}

impl SchedulerConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::build(config::Environment::with_prefix("SCHEDULER"))
    }

    /// Load configuration from an explicit variable map
    #[cfg(test)]
    pub fn from_map(vars: std::collections::HashMap<String, String>) -> Result<Self> {
        Self::build(config::Environment::with_prefix("SCHEDULER").source(Some(vars)))
    }

    fn build(source: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(source.try_parsing(true).ignore_empty(true))
            .build()
            .context("Failed to read scheduler configuration")?;

        config
            .try_deserialize()
            .context("Invalid scheduler configuration")
    }

    pub fn past_due_threshold(&self) -> Duration {
        Duration::from_secs(self.past_due_threshold_secs)
    }

    /// Job selected for a single run, if any
    pub fn run_once_job(&self) -> Result<Option<JobKind>> {
        self.run_once
            .as_deref()
            .map(|job| job.parse::<JobKind>().map_err(anyhow::Error::msg))
            .transpose()
    }

    pub fn schedule_for(&self, job: JobKind) -> &str {
        match job {
            JobKind::Deallocate => &self.deallocate_schedule,
            JobKind::Start => &self.start_schedule,
        }
    }
}
