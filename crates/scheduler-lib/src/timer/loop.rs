//! Timer loop
//!
//! Sleeps until the next scheduled firing, runs the job to completion and
//! records the outcome in the health registry. A job never overlaps with
//! itself: the next firing is only armed once the current run returns.

use super::{TimerSchedule, TimerTrigger};
use crate::health::HealthRegistry;
use crate::jobs::PowerJob;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration for a timer loop
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// A firing later than this is flagged past due (default: 30 seconds)
    pub past_due_threshold: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            past_due_threshold: Duration::from_secs(30),
        }
    }
}

/// Drives one job on its schedule until shutdown
pub struct TimerLoop {
    job: Arc<PowerJob>,
    schedule: TimerSchedule,
    health: HealthRegistry,
    config: TimerConfig,
}

impl TimerLoop {
    pub fn new(
        job: Arc<PowerJob>,
        schedule: TimerSchedule,
        health: HealthRegistry,
        config: TimerConfig,
    ) -> Self {
        Self {
            job,
            schedule,
            health,
            config,
        }
    }

    /// Run until a shutdown signal is received
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let job = self.job.kind();
        info!(
            job = %job,
            schedule = %self.schedule.expression(),
            "Starting timer loop"
        );

        let mut last = Utc::now();

        loop {
            let now = Utc::now();
            let Some(scheduled_at) = self.schedule.next_due(last, now) else {
                warn!(job = %job, "Schedule has no future firings, stopping timer loop");
                break;
            };
            let wait = (scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %job, next = %scheduled_at, wait_secs = wait.as_secs(), "Timer armed");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let trigger = TimerTrigger::fire(
                        scheduled_at,
                        Utc::now(),
                        self.config.past_due_threshold,
                    );
                    self.fire(&trigger).await;
                    last = scheduled_at;
                }
                _ = shutdown.recv() => {
                    info!(job = %job, "Shutting down timer loop");
                    break;
                }
            }
        }
    }

    /// Run the job once for `trigger` and record the outcome
    pub async fn fire(&self, trigger: &TimerTrigger) {
        let result = self.job.invoke(trigger).await;
        self.health.record_run(self.job.kind(), &result).await;
    }
}

/// Builder for creating a timer loop
pub struct TimerLoopBuilder {
    job: Option<Arc<PowerJob>>,
    schedule: Option<TimerSchedule>,
    health: Option<HealthRegistry>,
    config: TimerConfig,
}

impl TimerLoopBuilder {
    pub fn new() -> Self {
        Self {
            job: None,
            schedule: None,
            health: None,
            config: TimerConfig::default(),
        }
    }

    pub fn job(mut self, job: Arc<PowerJob>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn schedule(mut self, schedule: TimerSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn past_due_threshold(mut self, threshold: Duration) -> Self {
        self.config.past_due_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<TimerLoop> {
        let job = self.job.ok_or_else(|| anyhow::anyhow!("Job is required"))?;
        let schedule = self
            .schedule
            .ok_or_else(|| anyhow::anyhow!("Schedule is required"))?;
        let health = self.health.unwrap_or_default();

        Ok(TimerLoop::new(job, schedule, health, self.config))
    }
}

impl Default for TimerLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
