//! Structured logging for scheduler events
//!
//! Every significant event is emitted as a single tracing line with an
//! `event` field so log sinks can filter and aggregate runs.

use crate::models::{JobKind, PowerState, RunSummary};
use tracing::{error, info, warn};

/// Why a VM was left untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Excluded,
    TagMismatch,
    AlreadyInTargetState,
    Duplicate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Excluded => "excluded",
            SkipReason::TagMismatch => "tag_mismatch",
            SkipReason::AlreadyInTargetState => "already_in_target_state",
            SkipReason::Duplicate => "duplicate",
        }
    }
}

/// Structured logger for scheduler events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log the start of a job invocation
    pub fn log_job_started(&self, job: JobKind, scheduled_at: &str) {
        info!(
            event = "job_started",
            instance = %self.instance,
            job = %job,
            scheduled_at = %scheduled_at,
            "Power job invoked"
        );
    }

    /// Log a timer firing that happened later than scheduled
    pub fn log_past_due(&self, job: JobKind, lateness_secs: i64) {
        warn!(
            event = "timer_past_due",
            instance = %self.instance,
            job = %job,
            lateness_secs = lateness_secs,
            "The timer is running late"
        );
    }

    pub fn log_enumerated(&self, job: JobKind, resource_group: &str, vm_count: usize) {
        info!(
            event = "vms_enumerated",
            instance = %self.instance,
            job = %job,
            resource_group = %resource_group,
            vm_count = vm_count,
            "Found virtual machines in resource group"
        );
    }

    pub fn log_vm_skipped(
        &self,
        job: JobKind,
        vm_name: &str,
        reason: SkipReason,
        detail: &str,
    ) {
        info!(
            event = "vm_skipped",
            instance = %self.instance,
            job = %job,
            vm = %vm_name,
            reason = reason.as_str(),
            detail = %detail,
            "Skipping VM"
        );
    }

    pub fn log_transition_requested(&self, job: JobKind, vm_name: &str, state: &PowerState) {
        info!(
            event = "vm_transition_requested",
            instance = %self.instance,
            job = %job,
            vm = %vm_name,
            power_state = %state,
            "Requesting power state change"
        );
    }

    pub fn log_transitioned(&self, job: JobKind, vm_name: &str) {
        info!(
            event = "vm_transitioned",
            instance = %self.instance,
            job = %job,
            vm = %vm_name,
            outcome = job.past_tense(),
            "Power state change completed"
        );
    }

    /// Log a provider error isolated to one VM
    pub fn log_vm_error(&self, job: JobKind, vm_name: &str, err: &dyn std::error::Error, transient: bool) {
        error!(
            event = "vm_error",
            instance = %self.instance,
            job = %job,
            vm = %vm_name,
            transient = transient,
            error = %err,
            "Error processing VM"
        );
    }

    pub fn log_summary(&self, summary: &RunSummary) {
        info!(
            event = "run_summary",
            instance = %self.instance,
            job = %summary.job,
            transitioned = summary.transitioned,
            outcome = summary.job.past_tense(),
            skipped = summary.skipped,
            errored = summary.errored,
            elapsed_secs = format_args!("{:.2}", summary.elapsed.as_secs_f64()),
            "Power job completed"
        );
    }

    /// Log a run that ended early because required settings were missing
    pub fn log_run_aborted(&self, job: JobKind, missing: &[&'static str]) {
        error!(
            event = "run_aborted",
            instance = %self.instance,
            job = %job,
            missing = %missing.join(","),
            "Missing required environment variables, no changes made"
        );
    }

    /// Log a systemic failure that fails the invocation
    pub fn log_run_failed(&self, job: JobKind, err: &anyhow::Error) {
        error!(
            event = "run_failed",
            instance = %self.instance,
            job = %job,
            error = format_args!("{:#}", err),
            "Power job failed"
        );
    }

    pub fn log_startup(&self, version: &str, schedules: &[(JobKind, String)]) {
        for (job, schedule) in schedules {
            info!(
                event = "scheduler_started",
                instance = %self.instance,
                version = %version,
                job = %job,
                schedule = %schedule,
                "Power scheduler armed"
            );
        }
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scheduler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Power scheduler shutting down"
        );
    }
}
