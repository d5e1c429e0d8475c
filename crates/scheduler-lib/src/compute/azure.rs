//! Azure Resource Manager compute client

use super::credential::{CredentialChain, TokenSource};
use super::operation::{retry_after, OperationPoller, PollConfig, PollTarget};
use super::{ComputeProvider, ProviderError, ProviderFactory};
use crate::models::{InstanceStatus, PowerState, VmDescriptor};
use crate::settings::ResourceTarget;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header::CONTENT_LENGTH, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";
pub const DEFAULT_API_VERSION: &str = "2024-07-01";

/// Configuration for the Resource Manager client
#[derive(Debug, Clone)]
pub struct ArmClientConfig {
    /// Resource Manager endpoint
    pub endpoint: String,
    /// Compute API version
    pub api_version: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Long-running operation polling
    pub poll: PollConfig,
}

impl Default for ArmClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmListPage {
    #[serde(default)]
    value: Vec<VmDescriptor>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceStatus>,
}

#[derive(Debug, Deserialize)]
struct ArmErrorEnvelope {
    error: ArmErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ArmErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Split an ARM error body into code and message, falling back to the raw text
fn parse_arm_error(body: &str) -> (String, String) {
    match serde_json::from_str::<ArmErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => ("Unknown".to_string(), body.trim().to_string()),
    }
}

/// Map a non-success response to a provider error
async fn check(response: Response, resource: &str) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_secs = retry_after(response.headers()).map(|d| d.as_secs());
    let body = response.text().await.unwrap_or_default();
    let (code, message) = parse_arm_error(&body);

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Authentication(format!("{}: {}", code, message))
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            resource: resource.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled { retry_after_secs },
        _ => ProviderError::Http {
            status: status.as_u16(),
            code,
            message,
        },
    })
}

/// Compute client scoped to one subscription and resource group
pub struct ArmClient {
    http: Client,
    base_url: Url,
    api_version: String,
    target: ResourceTarget,
    credential: Arc<CredentialChain>,
    poller: OperationPoller,
}

impl ArmClient {
    pub fn new(
        http: Client,
        credential: Arc<CredentialChain>,
        target: ResourceTarget,
        config: &ArmClientConfig,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(&config.endpoint)
            .map_err(|e| ProviderError::Transport(format!("invalid endpoint {}: {}", config.endpoint, e)))?;

        Ok(Self {
            http,
            base_url,
            api_version: config.api_version.clone(),
            target,
            credential,
            poller: OperationPoller::new(config.poll.clone()),
        })
    }

    /// URL of the VM collection, or of one VM and an optional action below it
    fn vm_url(&self, vm_name: Option<&str>, action: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ProviderError::Transport("endpoint cannot be a base URL".to_string()))?;
            segments.pop_if_empty().extend([
                "subscriptions",
                self.target.subscription_id.as_str(),
                "resourceGroups",
                self.target.resource_group.as_str(),
                "providers",
                "Microsoft.Compute",
                "virtualMachines",
            ]);
            if let Some(name) = vm_name {
                segments.push(name);
            }
            if let Some(action) = action {
                segments.push(action);
            }
        }
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let token = self.credential.token().await?;
        Ok(request.bearer_auth(token).send().await?)
    }

    /// Authenticated GET that maps error statuses; 2xx responses are returned as-is.
    ///
    /// Follow-up URLs taken from responses (`nextLink`, operation status) must
    /// share the endpoint's origin, otherwise the token is never sent.
    pub(crate) async fn get_checked(&self, url: Url) -> Result<Response, ProviderError> {
        if url.origin() != self.base_url.origin() {
            return Err(ProviderError::UntrustedUrl {
                url: url.to_string(),
            });
        }
        let resource = url.path().to_string();
        let response = self.send(self.http.get(url)).await?;
        check(response, &resource).await
    }

    /// Issue a VM action and wait for the resulting operation to settle
    async fn run_action(&self, vm_name: &str, action: &str) -> Result<(), ProviderError> {
        let url = self.vm_url(Some(vm_name), Some(action))?;
        let request = self.http.post(url).header(CONTENT_LENGTH, "0");
        let response = check(self.send(request).await?, vm_name).await?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED => {
                match PollTarget::from_headers(response.headers()) {
                    Some(target) => {
                        let first_wait = retry_after(response.headers());
                        debug!(vm = %vm_name, action = %action, "Waiting for operation to complete");
                        self.poller
                            .wait(self, target, first_wait, action, vm_name)
                            .await
                    }
                    None => {
                        warn!(
                            vm = %vm_name,
                            action = %action,
                            "Operation accepted without a status URL, assuming completion"
                        );
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ComputeProvider for ArmClient {
    async fn list_vms(&self) -> Result<Vec<VmDescriptor>, ProviderError> {
        let mut vms = Vec::new();
        let mut next = Some(self.vm_url(None, None)?);

        while let Some(url) = next.take() {
            let page: VmListPage = self.get_checked(url).await?.json().await?;
            vms.extend(page.value);

            next = match page.next_link {
                Some(link) => Some(
                    Url::parse(&link)
                        .map_err(|e| ProviderError::Decode(format!("invalid nextLink: {e}")))?,
                ),
                None => None,
            };
        }

        Ok(vms)
    }

    async fn power_state(&self, vm_name: &str) -> Result<PowerState, ProviderError> {
        let url = self.vm_url(Some(vm_name), Some("instanceView"))?;
        let response = check(self.send(self.http.get(url)).await?, vm_name).await?;
        let view: InstanceView = response.json().await?;
        Ok(PowerState::from_statuses(&view.statuses))
    }

    async fn start(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.run_action(vm_name, "start").await
    }

    async fn deallocate(&self, vm_name: &str) -> Result<(), ProviderError> {
        self.run_action(vm_name, "deallocate").await
    }
}

/// Builds [`ArmClient`]s sharing one HTTP client and token cache
pub struct AzureProviderFactory {
    http: Client,
    credential: Arc<CredentialChain>,
    config: ArmClientConfig,
}

impl AzureProviderFactory {
    pub fn new(source: TokenSource, config: ArmClientConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;
        let credential = Arc::new(CredentialChain::new(source, http.clone()));

        Ok(Self {
            http,
            credential,
            config,
        })
    }

    /// Factory using the credential source found in the process environment
    pub fn from_env(config: ArmClientConfig) -> anyhow::Result<Self> {
        let source = TokenSource::from_env().context("Failed to resolve Azure credentials")?;
        Self::new(source, config)
    }
}

impl ProviderFactory for AzureProviderFactory {
    fn connect(&self, target: &ResourceTarget) -> anyhow::Result<Arc<dyn ComputeProvider>> {
        let client = ArmClient::new(
            self.http.clone(),
            self.credential.clone(),
            target.clone(),
            &self.config,
        )?;
        Ok(Arc::new(client))
    }
}
