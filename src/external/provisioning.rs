use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ProvisioningConfig;
use crate::error::{AppError, AppResult};
use crate::external::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("provisioning request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("panel rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProvisioningError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisioningError::Timeout | ProvisioningError::Transport(_) => true,
            ProvisioningError::Rejected { status, .. } => *status >= 500,
            ProvisioningError::NotFound(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredential {
    pub credential_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The VPN panel, seen as a non-transactional key/value store of credentials.
///
/// Credential ids are minted by us, so `create` is addressed by id and a
/// lost credential can be re-created under the same id.
#[async_trait]
pub trait ProvisioningPort: Send + Sync {
    async fn create(
        &self,
        account_id: i64,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ProvisioningError>;

    async fn update(
        &self,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ProvisioningError>;

    async fn remove(&self, credential_id: &str) -> Result<(), ProvisioningError>;

    async fn lookup(
        &self,
        credential_id: &str,
    ) -> Result<Option<RemoteCredential>, ProvisioningError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Updated,
    Recreated,
}

/// Push `expires_at` to the panel; a missing credential is re-created with the same id.
pub async fn sync_expiry(
    port: &dyn ProvisioningPort,
    account_id: i64,
    credential_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<SyncAction, ProvisioningError> {
    match port.update(credential_id, expires_at).await {
        Ok(()) => Ok(SyncAction::Updated),
        Err(ProvisioningError::NotFound(_)) => {
            log::info!("Credential {credential_id} missing on panel, re-creating");
            port.create(account_id, credential_id, expires_at).await?;
            Ok(SyncAction::Recreated)
        }
        Err(e) => Err(e),
    }
}

/// Remove a credential, treating "already gone" as done.
pub async fn remove_credential(
    port: &dyn ProvisioningPort,
    credential_id: &str,
) -> Result<(), ProvisioningError> {
    match port.remove(credential_id).await {
        Ok(()) | Err(ProvisioningError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Serialize)]
struct CreateUserBody<'a> {
    id: &'a str,
    account_id: i64,
    expires_at: i64,
}

#[derive(Debug, Serialize)]
struct UpdateUserBody {
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct PanelUser {
    id: String,
    expires_at: i64,
}

/// HTTP adapter for the panel's `/api/users` resource.
#[derive(Clone)]
pub struct PanelClient {
    client: Client,
    base_url: String,
    api_token: String,
    retry: RetryPolicy,
}

impl PanelClient {
    pub fn new(config: &ProvisioningConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(format!("cannot build panel client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }

    fn user_url(&self, credential_id: &str) -> String {
        format!("{}/api/users/{}", self.base_url, credential_id)
    }

    async fn check(
        resp: Result<reqwest::Response, reqwest::Error>,
        credential_id: &str,
    ) -> Result<reqwest::Response, ProvisioningError> {
        let resp = resp.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProvisioningError::NotFound(credential_id.to_string()));
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ProvisioningError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn put_expiry(
        &self,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        let resp = self
            .client
            .put(self.user_url(credential_id))
            .bearer_auth(&self.api_token)
            .json(&UpdateUserBody {
                expires_at: expires_at.timestamp(),
            })
            .send()
            .await;
        Self::check(resp, credential_id).await.map(|_| ())
    }
}

fn transport_error(e: reqwest::Error) -> ProvisioningError {
    if e.is_timeout() {
        ProvisioningError::Timeout
    } else {
        ProvisioningError::Transport(e.to_string())
    }
}

#[async_trait]
impl ProvisioningPort for PanelClient {
    async fn create(
        &self,
        account_id: i64,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ProvisioningError> {
        self.retry
            .run("create", move || async move {
                let resp = self
                    .client
                    .post(format!("{}/api/users", self.base_url))
                    .bearer_auth(&self.api_token)
                    .json(&CreateUserBody {
                        id: credential_id,
                        account_id,
                        expires_at: expires_at.timestamp(),
                    })
                    .send()
                    .await;
                match Self::check(resp, credential_id).await {
                    Ok(_) => Ok(credential_id.to_string()),
                    // an earlier attempt got through before timing out
                    Err(ProvisioningError::Rejected { status: 409, .. }) => {
                        self.put_expiry(credential_id, expires_at).await?;
                        Ok(credential_id.to_string())
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn update(
        &self,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        self.retry
            .run("update", move || self.put_expiry(credential_id, expires_at))
            .await
    }

    async fn remove(&self, credential_id: &str) -> Result<(), ProvisioningError> {
        self.retry
            .run("remove", move || async move {
                let resp = self
                    .client
                    .delete(self.user_url(credential_id))
                    .bearer_auth(&self.api_token)
                    .send()
                    .await;
                Self::check(resp, credential_id).await.map(|_| ())
            })
            .await
    }

    async fn lookup(
        &self,
        credential_id: &str,
    ) -> Result<Option<RemoteCredential>, ProvisioningError> {
        self.retry
            .run("lookup", move || async move {
                let resp = self
                    .client
                    .get(self.user_url(credential_id))
                    .bearer_auth(&self.api_token)
                    .send()
                    .await;
                let resp = match Self::check(resp, credential_id).await {
                    Ok(resp) => resp,
                    Err(ProvisioningError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                };
                let user: PanelUser = resp.json().await.map_err(transport_error)?;
                let expires_at = Utc
                    .timestamp_opt(user.expires_at, 0)
                    .single()
                    .ok_or_else(|| ProvisioningError::Rejected {
                        status: 200,
                        message: format!("invalid expires_at {}", user.expires_at),
                    })?;
                Ok(Some(RemoteCredential {
                    credential_id: user.id,
                    expires_at,
                }))
            })
            .await
    }
}
