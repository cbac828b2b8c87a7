//! Identity service session (v3 password authentication)
//!
//! A [`KeystoneSession`] authenticates lazily, keeps the issued token and the
//! service catalog that came with it, and re-authenticates once the token is
//! about to expire. Nothing is shared between sessions.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use nimbus_core::{Credential, IdentityProvider, Result, ServiceError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::IdentityConfig;
use crate::http::{build_client, checked, decode, parse_time, transport};

/// Header carrying the issued token in the authentication response
pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Tokens expiring within this window are renewed before use
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenBody {
    expires_at: Option<String>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

impl CatalogEndpoint {
    fn in_region(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region) || self.region_id.as_deref() == Some(region)
    }
}

struct Authenticated {
    credential: Credential,
    catalog: Vec<CatalogEntry>,
}

/// Identity session bound to one set of credentials
pub struct KeystoneSession {
    config: IdentityConfig,
    client: reqwest::Client,
    state: Mutex<Option<Authenticated>>,
}

impl KeystoneSession {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        Ok(Self {
            config,
            client: build_client()?,
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Drop the cached token; the next call authenticates again
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    async fn authenticate(&self) -> Result<Authenticated> {
        let password = self.config.password.as_deref().ok_or_else(|| {
            ServiceError::Auth(format!("no password configured for user {}", self.config.username))
        })?;
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        debug!(url = %url, user = %self.config.username, "Authenticating");

        let response = self
            .client
            .post(&url)
            .json(&password_auth_body(&self.config, password))
            .send()
            .await
            .map_err(transport)?;
        let response = checked(response, "identity token").await?;

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Auth(format!("response lacks {}", SUBJECT_TOKEN_HEADER)))?;
        let body: TokenResponse = decode(response).await?;

        let credential = Credential {
            token,
            expires_at: body.token.expires_at.as_deref().and_then(parse_time),
        };
        info!(
            user = %self.config.username,
            project = %self.config.project_name,
            expires_at = ?credential.expires_at,
            "Authenticated"
        );
        Ok(Authenticated {
            credential,
            catalog: body.token.catalog,
        })
    }

    /// Run `f` against a fresh session state
    async fn with_session<T>(&self, f: impl FnOnce(&Authenticated) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let stale = state.as_ref().map_or(true, |s| {
            s.credential
                .is_stale(Utc::now(), Duration::seconds(EXPIRY_SKEW_SECS))
        });
        if stale {
            *state = Some(self.authenticate().await?);
        }
        match state.as_ref() {
            Some(session) => f(session),
            None => Err(ServiceError::Auth("session not established".to_string())),
        }
    }
}

#[async_trait]
impl IdentityProvider for KeystoneSession {
    async fn endpoint(&self, service_type: &str, region: Option<&str>) -> Result<String> {
        let region = region.or(self.config.region.as_deref());
        let interface = self.config.interface.as_str();
        self.with_session(|session| select_endpoint(&session.catalog, service_type, interface, region))
            .await
    }

    async fn credential(&self) -> Result<Credential> {
        self.with_session(|session| Ok(session.credential.clone())).await
    }
}

fn password_auth_body(config: &IdentityConfig, password: &str) -> Value {
    json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": config.username,
                        "domain": { "name": config.user_domain_name },
                        "password": password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": config.project_name,
                    "domain": { "name": config.project_domain_name },
                }
            }
        }
    })
}

fn select_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| ep.interface == interface && region.map_or(true, |r| ep.in_region(r)))
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            ServiceError::not_found(format!(
                "{} endpoint ({}, region {})",
                service_type,
                interface,
                region.unwrap_or("any")
            ))
        })
}
