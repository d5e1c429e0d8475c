//! Per-invocation job settings
//!
//! Settings are resolved from the process environment at the start of every
//! job invocation and passed down by value. Nothing is read at module load.

use crate::models::{JobKind, VmDescriptor};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

pub const SUBSCRIPTION_ID_VAR: &str = "AZURE_SUBSCRIPTION_ID";
pub const RESOURCE_GROUP_VAR: &str = "RESOURCE_GROUP";

const DEFAULT_SHUTDOWN_TAG: &str = "AutoShutdown";
const DEFAULT_START_TAG: &str = "AutoStart";
const DEFAULT_TAG_VALUE: &str = "true";

/// Errors raised while resolving job settings
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("failed to read settings source: {0}")]
    Source(#[from] config::ConfigError),
}

/// Subscription and resource group a job operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTarget {
    pub subscription_id: String,
    pub resource_group: String,
}

/// Tag key/value a VM must carry to be eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Exact key lookup, case-insensitive value comparison
    pub fn matches(&self, vm: &VmDescriptor) -> bool {
        vm.tag(&self.key)
            .map(|value| value.to_lowercase() == self.value.to_lowercase())
            .unwrap_or(false)
    }
}

impl std::fmt::Display for TagFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Resolved settings for one job invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub job: JobKind,
    pub target: ResourceTarget,
    /// `None` disables tag filtering
    pub tag_filter: Option<TagFilter>,
    /// VM names never acted upon; always empty for the start job
    pub excluded: BTreeSet<String>,
}

/// Raw environment view, keys lowercased by the `config` crate
#[derive(Debug, Default, Deserialize)]
struct RawEnvironment {
    azure_subscription_id: Option<String>,
    resource_group: Option<String>,
    shutdown_tag: Option<String>,
    shutdown_tag_value: Option<String>,
    excluded_vms: Option<String>,
    start_tag: Option<String>,
    start_tag_value: Option<String>,
}

impl JobSettings {
    /// Resolve settings for `job` from the process environment
    pub fn from_env(job: JobKind) -> Result<Self, SettingsError> {
        Self::load(job, None)
    }

    /// Resolve settings for `job` from an explicit variable map
    pub fn from_map(job: JobKind, vars: HashMap<String, String>) -> Result<Self, SettingsError> {
        Self::load(job, Some(vars))
    }

    fn load(job: JobKind, vars: Option<HashMap<String, String>>) -> Result<Self, SettingsError> {
        let environment = config::Environment::default().source(vars);

        let raw: RawEnvironment = config::Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        Self::resolve(job, raw)
    }

    fn resolve(job: JobKind, raw: RawEnvironment) -> Result<Self, SettingsError> {
        let subscription_id = non_empty(raw.azure_subscription_id);
        let resource_group = non_empty(raw.resource_group);

        let (subscription_id, resource_group) = match (subscription_id, resource_group) {
            (Some(subscription_id), Some(resource_group)) => (subscription_id, resource_group),
            (subscription_id, resource_group) => {
                let mut missing = Vec::new();
                if subscription_id.is_none() {
                    missing.push(SUBSCRIPTION_ID_VAR);
                }
                if resource_group.is_none() {
                    missing.push(RESOURCE_GROUP_VAR);
                }
                return Err(SettingsError::Missing(missing));
            }
        };

        // An explicitly empty tag or tag value turns filtering off
        let (tag, tag_value) = match job {
            JobKind::Deallocate => (
                raw.shutdown_tag
                    .unwrap_or_else(|| DEFAULT_SHUTDOWN_TAG.to_string()),
                raw.shutdown_tag_value
                    .unwrap_or_else(|| DEFAULT_TAG_VALUE.to_string()),
            ),
            JobKind::Start => (
                raw.start_tag.unwrap_or_else(|| DEFAULT_START_TAG.to_string()),
                raw.start_tag_value
                    .unwrap_or_else(|| DEFAULT_TAG_VALUE.to_string()),
            ),
        };
        let tag_filter = if tag.is_empty() || tag_value.is_empty() {
            None
        } else {
            Some(TagFilter::new(tag, tag_value))
        };

        let excluded = match job {
            JobKind::Deallocate => parse_name_list(raw.excluded_vms.as_deref().unwrap_or("")),
            JobKind::Start => BTreeSet::new(),
        };

        Ok(Self {
            job,
            target: ResourceTarget {
                subscription_id,
                resource_group,
            },
            tag_filter,
            excluded,
        })
    }

    pub fn is_excluded(&self, vm: &VmDescriptor) -> bool {
        self.excluded.contains(&vm.name)
    }

    /// True when tag filtering is off or the VM carries the configured tag
    pub fn tag_matches(&self, vm: &VmDescriptor) -> bool {
        self.tag_filter
            .as_ref()
            .map(|filter| filter.matches(vm))
            .unwrap_or(true)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Split a comma-separated VM name list, dropping blanks
fn parse_name_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
