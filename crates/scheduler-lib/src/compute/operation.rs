//! Long-running operation polling
//!
//! Start and deallocate requests are accepted asynchronously by Resource
//! Manager. The response carries either an `Azure-AsyncOperation` status
//! URL or a `Location` URL that is polled until the operation settles.

use super::azure::ArmClient;
use super::ProviderError;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const LOCATION_HEADER: &str = "location";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Polling behaviour for long-running operations
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Interval used when the provider sends no Retry-After (default: 10 seconds)
    pub default_interval: Duration,
    /// Upper bound for any single wait (default: 60 seconds)
    pub max_interval: Duration,
    /// Give up after this long (default: 30 minutes)
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// How an accepted operation reports progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollTarget {
    /// Status document with a `status` field
    AsyncOperation(Url),
    /// 202 while running, 200/204 once done
    Location(Url),
}

impl PollTarget {
    /// Extract the poll target from an accepted response's headers
    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header_url = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Url::parse(v).ok())
        };

        header_url(ASYNC_OPERATION_HEADER)
            .map(PollTarget::AsyncOperation)
            .or_else(|| header_url(LOCATION_HEADER).map(PollTarget::Location))
    }
}

/// Parse a `Retry-After` header given in seconds
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[derive(Debug, Deserialize)]
struct OperationStatusBody {
    status: String,
    #[serde(default)]
    error: Option<OperationErrorBody>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Terminal or in-flight state of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Running,
    Succeeded,
    Ended(String),
}

impl Progress {
    fn from_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "succeeded" => Progress::Succeeded,
            "failed" | "canceled" | "cancelled" => Progress::Ended(status.to_string()),
            _ => Progress::Running,
        }
    }
}

/// Waits for a long-running operation to reach a terminal state
#[derive(Debug, Clone, Default)]
pub struct OperationPoller {
    config: PollConfig,
}

impl OperationPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    fn next_wait(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.config.default_interval)
            .min(self.config.max_interval)
    }

    /// Poll `target` until the operation succeeds, fails or times out
    pub(crate) async fn wait(
        &self,
        client: &ArmClient,
        target: PollTarget,
        first_wait: Option<Duration>,
        operation: &str,
        vm_name: &str,
    ) -> Result<(), ProviderError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut wait = self.next_wait(first_wait);

        loop {
            if Instant::now() + wait > deadline {
                return Err(ProviderError::OperationTimedOut {
                    operation: operation.to_string(),
                    vm: vm_name.to_string(),
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
            tokio::time::sleep(wait).await;

            let (progress, hint) = match &target {
                PollTarget::AsyncOperation(url) => {
                    let response = client.get_checked(url.clone()).await?;
                    let hint = retry_after(response.headers());
                    let body: OperationStatusBody = response.json().await?;
                    let progress = match Progress::from_status(&body.status) {
                        Progress::Ended(status) => {
                            let detail = body
                                .error
                                .map(|e| {
                                    format!(
                                        "{} ({}: {})",
                                        status,
                                        e.code.unwrap_or_default(),
                                        e.message.unwrap_or_default()
                                    )
                                })
                                .unwrap_or(status);
                            Progress::Ended(detail)
                        }
                        other => other,
                    };
                    (progress, hint)
                }
                PollTarget::Location(url) => {
                    let response = client.get_checked(url.clone()).await?;
                    let hint = retry_after(response.headers());
                    let progress = if response.status() == StatusCode::ACCEPTED {
                        Progress::Running
                    } else {
                        Progress::Succeeded
                    };
                    (progress, hint)
                }
            };

            match progress {
                Progress::Succeeded => return Ok(()),
                Progress::Ended(status) => {
                    return Err(ProviderError::OperationFailed {
                        operation: operation.to_string(),
                        vm: vm_name.to_string(),
                        status,
                    })
                }
                Progress::Running => {
                    debug!(vm = %vm_name, operation = %operation, "Operation still in progress");
                    wait = self.next_wait(hint);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_poll_target_prefers_async_operation() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Location",
            HeaderValue::from_static("https://management.azure.com/loc"),
        );
        headers.insert(
            "Azure-AsyncOperation",
            HeaderValue::from_static("https://management.azure.com/op"),
        );

        assert_eq!(
            PollTarget::from_headers(&headers),
            Some(PollTarget::AsyncOperation(
                Url::parse("https://management.azure.com/op").unwrap()
            ))
        );
    }

    #[test]
    fn test_poll_target_location_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Location",
            HeaderValue::from_static("https://management.azure.com/loc"),
        );

        assert!(matches!(
            PollTarget::from_headers(&headers),
            Some(PollTarget::Location(_))
        ));
        assert_eq!(PollTarget::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert("Retry-After", HeaderValue::from_static("15"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_wait_is_capped() {
        let poller = OperationPoller::new(PollConfig {
            default_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
        });

        assert_eq!(poller.next_wait(None), Duration::from_secs(5));
        assert_eq!(
            poller.next_wait(Some(Duration::from_secs(120))),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn test_progress_classification() {
        assert_eq!(Progress::from_status("Succeeded"), Progress::Succeeded);
        assert_eq!(Progress::from_status("InProgress"), Progress::Running);
        assert_eq!(
            Progress::from_status("Canceled"),
            Progress::Ended("Canceled".to_string())
        );
    }
}
