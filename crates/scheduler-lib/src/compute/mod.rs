//! Compute provider abstraction
//!
//! Jobs talk to the cloud through the narrow [`ComputeProvider`] capability
//! so the decision logic can run against an in-memory fake. The Azure
//! Resource Manager implementation lives in [`azure`].

pub mod azure;
mod credential;
mod operation;

#[cfg(test)]
mod tests;

pub use azure::{ArmClient, ArmClientConfig, AzureProviderFactory};
pub use credential::{AccessToken, CredentialChain, TokenSource};
pub use operation::{OperationPoller, PollConfig};

use crate::models::{PowerState, VmDescriptor};
use crate::settings::ResourceTarget;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a compute provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("request throttled by provider{}", retry_hint(.retry_after_secs))]
    Throttled { retry_after_secs: Option<u64> },

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("HTTP {status}: {code}: {message}")]
    Http {
        status: u16,
        code: String,
        message: String,
    },

    #[error("refusing to send credentials to {url}: origin differs from the endpoint")]
    UntrustedUrl { url: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("operation {operation} on {vm} ended with status {status}")]
    OperationFailed {
        operation: String,
        vm: String,
        status: String,
    },

    #[error("operation {operation} on {vm} did not complete within {timeout_secs}s")]
    OperationTimedOut {
        operation: String,
        vm: String,
        timeout_secs: u64,
    },
}

fn retry_hint(retry_after_secs: &Option<u64>) -> String {
    match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    }
}

impl ProviderError {
    /// Whether the error is likely to clear on a later run
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Throttled { .. } | ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::OperationTimedOut { .. } => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Capability interface over the cloud compute surface.
///
/// `start` and `deallocate` return only once the provider reports the
/// long-running operation as finished.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// List every VM in the target resource group
    async fn list_vms(&self) -> Result<Vec<VmDescriptor>, ProviderError>;

    /// Fetch the current power state of a VM
    async fn power_state(&self, vm_name: &str) -> Result<PowerState, ProviderError>;

    /// Start a VM and wait for completion
    async fn start(&self, vm_name: &str) -> Result<(), ProviderError>;

    /// Deallocate a VM and wait for completion
    async fn deallocate(&self, vm_name: &str) -> Result<(), ProviderError>;
}

/// Builds a provider for a resolved target.
///
/// Construction happens after settings resolution so a run with missing
/// settings never touches the provider.
pub trait ProviderFactory: Send + Sync {
    fn connect(&self, target: &ResourceTarget) -> anyhow::Result<Arc<dyn ComputeProvider>>;
}
