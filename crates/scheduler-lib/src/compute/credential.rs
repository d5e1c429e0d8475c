//! Bearer token acquisition for Azure Resource Manager
//!
//! Sources are tried in a fixed order: a static token, a service principal
//! secret, then the managed identity of the host (App Service style identity
//! endpoint first, instance metadata service otherwise).

use super::ProviderError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const ARM_SCOPE: &str = "https://management.azure.com/.default";
const ARM_RESOURCE: &str = "https://management.azure.com/";
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const IDENTITY_API_VERSION: &str = "2019-08-01";

/// Refresh tokens this long before they expire
const REFRESH_MARGIN_SECS: i64 = 300;
/// Lifetime assumed when the token endpoint reports none
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// A bearer token and its expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// True while the token is valid beyond the refresh margin
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(REFRESH_MARGIN_SECS) > now
    }
}

/// Where tokens come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Pre-acquired token, never refreshed
    Static(String),
    /// Service principal with a client secret
    ClientSecret {
        authority_host: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// App Service / Functions managed identity endpoint
    IdentityEndpoint {
        endpoint: String,
        header: String,
        client_id: Option<String>,
    },
    /// Instance metadata service managed identity
    InstanceMetadata {
        endpoint: String,
        client_id: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct CredentialEnvironment {
    azure_access_token: Option<String>,
    azure_tenant_id: Option<String>,
    azure_client_id: Option<String>,
    azure_client_secret: Option<String>,
    azure_authority_host: Option<String>,
    identity_endpoint: Option<String>,
    identity_header: Option<String>,
}

impl TokenSource {
    /// Pick a token source from the process environment
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::load(None)
    }

    /// Pick a token source from an explicit variable map
    pub fn from_map(vars: HashMap<String, String>) -> Result<Self, ProviderError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, ProviderError> {
        let env: CredentialEnvironment = config::Config::builder()
            .add_source(config::Environment::default().source(vars).ignore_empty(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProviderError::Authentication(format!("invalid credential settings: {e}")))?;

        if let Some(token) = env.azure_access_token {
            return Ok(TokenSource::Static(token));
        }

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            env.azure_tenant_id,
            env.azure_client_id.clone(),
            env.azure_client_secret,
        ) {
            return Ok(TokenSource::ClientSecret {
                authority_host: env
                    .azure_authority_host
                    .unwrap_or_else(|| AUTHORITY_HOST.to_string()),
                tenant_id,
                client_id,
                client_secret,
            });
        }

        if let (Some(endpoint), Some(header)) = (env.identity_endpoint, env.identity_header) {
            return Ok(TokenSource::IdentityEndpoint {
                endpoint,
                header,
                client_id: env.azure_client_id,
            });
        }

        Ok(TokenSource::InstanceMetadata {
            endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
            client_id: env.azure_client_id,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TokenSource::Static(_) => "static",
            TokenSource::ClientSecret { .. } => "client_secret",
            TokenSource::IdentityEndpoint { .. } => "identity_endpoint",
            TokenSource::InstanceMetadata { .. } => "instance_metadata",
        }
    }

    async fn fetch(&self, http: &Client) -> Result<AccessToken, ProviderError> {
        let request = match self {
            TokenSource::Static(token) => {
                // Lifetime is unknown; the caller supplied it, so trust it for a day
                return Ok(AccessToken {
                    token: token.clone(),
                    expires_at: Utc::now() + ChronoDuration::days(1),
                });
            }
            TokenSource::ClientSecret {
                authority_host,
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{}/oauth2/v2.0/token",
                    authority_host.trim_end_matches('/'),
                    tenant_id
                );
                http.post(url).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", ARM_SCOPE),
                ])
            }
            TokenSource::IdentityEndpoint {
                endpoint,
                header,
                client_id,
            } => {
                let mut query = vec![
                    ("api-version", IDENTITY_API_VERSION),
                    ("resource", ARM_RESOURCE),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                http.get(endpoint.as_str())
                    .header("X-IDENTITY-HEADER", header.as_str())
                    .query(&query)
            }
            TokenSource::InstanceMetadata {
                endpoint,
                client_id,
            } => {
                let mut query = vec![
                    ("api-version", IMDS_API_VERSION),
                    ("resource", ARM_RESOURCE),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                http.get(endpoint.as_str())
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Authentication(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Authentication(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Authentication(format!("malformed token response: {e}")))?;

        Ok(body.into_access_token(Utc::now()))
    }
}

/// Token endpoint response; the identity endpoints report numbers as strings
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
}

impl TokenResponse {
    fn into_access_token(self, now: DateTime<Utc>) -> AccessToken {
        let expires_at = self
            .expires_in
            .as_ref()
            .and_then(json_seconds)
            .map(|secs| now + ChronoDuration::seconds(secs))
            .or_else(|| {
                self.expires_on
                    .as_ref()
                    .and_then(json_seconds)
                    .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
            })
            .unwrap_or_else(|| now + ChronoDuration::seconds(DEFAULT_LIFETIME_SECS));

        AccessToken {
            token: self.access_token,
            expires_at,
        }
    }
}

fn json_seconds(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Caching token provider shared by all requests of a client
pub struct CredentialChain {
    source: TokenSource,
    http: Client,
    cached: RwLock<Option<AccessToken>>,
}

impl CredentialChain {
    pub fn new(source: TokenSource, http: Client) -> Self {
        Self {
            source,
            http,
            cached: RwLock::new(None),
        }
    }

    /// Return a valid bearer token, refreshing it when close to expiry
    pub async fn token(&self) -> Result<String, ProviderError> {
        let now = Utc::now();
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.token.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(now) {
                return Ok(token.token.clone());
            }
        }

        debug!(source = self.source.kind(), "Acquiring access token");
        let token = self.source.fetch(&self.http).await?;
        info!(
            source = self.source.kind(),
            expires_at = %token.expires_at,
            "Acquired access token"
        );

        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}
