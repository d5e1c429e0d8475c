//! Core data models for the power scheduler

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Prefix of the instance-view status code carrying the power state
pub const POWER_STATE_PREFIX: &str = "PowerState/";

/// A virtual machine as reported by the compute provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub name: String,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
}

impl VmDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: None,
        }
    }

    /// Attach a tag, creating the tag set if the VM had none
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Look up a tag value by exact key
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.get(key).map(String::as_str)
    }
}

/// One entry of a VM instance view's status list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_status: Option<String>,
}

impl InstanceStatus {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display_status: None,
        }
    }
}

/// Power state derived from the provider's status codes.
///
/// Only two classes matter for scheduling decisions: running, and everything
/// else (stopped, deallocated, starting, deallocating, unknown or absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerState {
    code: Option<String>,
}

impl PowerState {
    /// Derive the power state from the first `PowerState/` status entry
    pub fn from_statuses(statuses: &[InstanceStatus]) -> Self {
        let code = statuses
            .iter()
            .find(|status| status.code.starts_with(POWER_STATE_PREFIX))
            .map(|status| status.code.clone());
        Self { code }
    }

    /// Power state with no status reported at all
    pub fn unknown() -> Self {
        Self { code: None }
    }

    /// Full status code, e.g. `PowerState/running`
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// State name after the prefix, e.g. `running`
    pub fn name(&self) -> Option<&str> {
        self.code
            .as_deref()
            .and_then(|code| code.strip_prefix(POWER_STATE_PREFIX))
    }

    pub fn is_running(&self) -> bool {
        self.name()
            .map(|name| name.to_ascii_lowercase().contains("running"))
            .unwrap_or(false)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.as_deref().unwrap_or("unknown"))
    }
}

/// The two scheduled jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Deallocate running VMs carrying the shutdown tag
    Deallocate,
    /// Start stopped VMs carrying the start tag
    Start,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Deallocate => "deallocate",
            JobKind::Start => "start",
        }
    }

    /// Verb used in log lines for a completed transition
    pub fn past_tense(&self) -> &'static str {
        match self {
            JobKind::Deallocate => "deallocated",
            JobKind::Start => "started",
        }
    }

    /// Whether a VM in `state` already satisfies this job's target state
    pub fn is_satisfied_by(&self, state: &PowerState) -> bool {
        match self {
            JobKind::Deallocate => !state.is_running(),
            JobKind::Start => state.is_running(),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deallocate" | "shutdown" => Ok(JobKind::Deallocate),
            "start" => Ok(JobKind::Start),
            other => Err(format!("unknown job '{}'", other)),
        }
    }
}

/// Counters for a single job invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub job: JobKind,
    /// VMs started or deallocated
    pub transitioned: usize,
    pub skipped: usize,
    pub errored: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(job: JobKind) -> Self {
        Self {
            job,
            transitioned: 0,
            skipped: 0,
            errored: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn processed(&self) -> usize {
        self.transitioned + self.skipped + self.errored
    }
}

/// Result of one job invocation that did not fail systemically
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// All VMs were processed
    Completed(RunSummary),
    /// Required settings were missing; no provider call was made
    Aborted { missing: Vec<&'static str> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(codes: &[&str]) -> Vec<InstanceStatus> {
        codes.iter().map(|c| InstanceStatus::new(*c)).collect()
    }

    #[test]
    fn test_power_state_running() {
        let state = PowerState::from_statuses(&statuses(&[
            "ProvisioningState/succeeded",
            "PowerState/running",
        ]));
        assert!(state.is_running());
        assert_eq!(state.code(), Some("PowerState/running"));
        assert_eq!(state.name(), Some("running"));
    }

    #[test]
    fn test_power_state_deallocated() {
        let state = PowerState::from_statuses(&statuses(&["PowerState/deallocated"]));
        assert!(!state.is_running());
    }

    #[test]
    fn test_power_state_case_insensitive() {
        let state = PowerState::from_statuses(&statuses(&["PowerState/Running"]));
        assert!(state.is_running());
    }

    #[test]
    fn test_power_state_absent() {
        let state = PowerState::from_statuses(&statuses(&["ProvisioningState/succeeded"]));
        assert!(!state.is_running());
        assert_eq!(state.code(), None);
        assert_eq!(state.to_string(), "unknown");

        assert!(!PowerState::from_statuses(&[]).is_running());
    }

    #[test]
    fn test_power_state_uses_first_match() {
        let state = PowerState::from_statuses(&statuses(&[
            "PowerState/stopped",
            "PowerState/running",
        ]));
        assert!(!state.is_running());
    }

    #[test]
    fn test_prefix_must_lead_the_code() {
        // "running" outside a PowerState/ code does not count
        let state = PowerState::from_statuses(&statuses(&["Other/PowerState/running"]));
        assert!(!state.is_running());
    }

    #[test]
    fn test_job_target_states() {
        let running = PowerState::from_statuses(&statuses(&["PowerState/running"]));
        let stopped = PowerState::from_statuses(&statuses(&["PowerState/stopped"]));

        assert!(JobKind::Deallocate.is_satisfied_by(&stopped));
        assert!(!JobKind::Deallocate.is_satisfied_by(&running));
        assert!(JobKind::Start.is_satisfied_by(&running));
        assert!(!JobKind::Start.is_satisfied_by(&stopped));
        assert!(!JobKind::Start.is_satisfied_by(&PowerState::unknown()));
    }

    #[test]
    fn test_job_kind_parse() {
        assert_eq!("deallocate".parse::<JobKind>(), Ok(JobKind::Deallocate));
        assert_eq!(" Start ".parse::<JobKind>(), Ok(JobKind::Start));
        assert!("resize".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_vm_tags() {
        let vm = VmDescriptor::new("web-1").with_tag("AutoShutdown", "true");
        assert_eq!(vm.tag("AutoShutdown"), Some("true"));
        assert_eq!(vm.tag("autoshutdown"), None);
        assert_eq!(VmDescriptor::new("db-1").tag("AutoShutdown"), None);
    }
}
