//! Job client - caller side of the job protocol
//!
//! Handles:
//! - Logging in and caching the bearer token with a refresh margin
//! - Submitting jobs, with exactly one forced re-login and retry on a 401
//! - Turning every transport or protocol failure into a failed `JobResult`
//!
//! Does NOT handle:
//! - Reinterpreting exit codes. `success` is taken from the server as-is
//! - Retrying anything other than an authorization failure

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::job::{JobRequest, JobResult, TokenResponse};

/// Timeout for `/run`, which blocks for the whole job
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to authenticate with runtime service: {status} - {body}")]
    AuthRejected { status: u16, body: String },

    #[error("Still unauthorized after re-authentication: {0}")]
    Unauthorized(String),

    #[error("Failed to connect to runtime service: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error from runtime: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("Malformed response from runtime: {0}")]
    Decode(String),
}

/// Connection and credential settings for [`JobClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
    pub auth_timeout: Duration,
    /// Lifetime assumed when the server does not report `expires_in`
    pub assumed_token_lifetime: chrono::Duration,
    /// Refresh this long before the token would expire
    pub refresh_margin: chrono::Duration,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            assumed_token_lifetime: chrono::Duration::minutes(30),
            refresh_margin: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_at: DateTime<Utc>,
}

/// Result of one `/run` attempt
enum RunAttempt {
    Done(JobResult),
    Unauthorized(String),
}

/// Client for the job service
///
/// The token cache sits behind a single lock, so concurrent submissions share
/// one login instead of racing to re-authenticate.
pub struct JobClient {
    http: Client,
    config: ClientConfig,
    token: Mutex<Option<CachedToken>>,
}

impl JobClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder().build()?;
        info!("Job client initialized for {}", config.base_url);
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Return a token that is not due for refresh, logging in if needed
    pub async fn ensure_authenticated(&self) -> Result<String, ClientError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Utc::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
            info!("Token expired or about to expire, re-authenticating");
        }

        let token = self.authenticate().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    /// Replace `stale` with a fresh token, unless another caller already did
    async fn reauthenticate(&self, stale: &str) -> Result<String, ClientError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.access_token != stale && Utc::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.authenticate().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn authenticate(&self) -> Result<CachedToken, ClientError> {
        info!("Authenticating with runtime service at {}", self.config.base_url);

        let response = self
            .http
            .post(format!("{}/token", self.config.base_url))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .timeout(self.config.auth_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!("Authentication failed: {} - {}", status.as_u16(), body);
            return Err(ClientError::AuthRejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))?;

        let lifetime = token
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
            .unwrap_or(self.config.assumed_token_lifetime);
        let usable = (lifetime - self.config.refresh_margin).max(chrono::Duration::zero());

        info!("Authenticated with runtime service");
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Utc::now() + usable,
        })
    }

    /// Submit a job and return its result.
    ///
    /// Never fails at the type level: transport, authorization and protocol
    /// failures come back as `success = false, exit_code = -1` with the reason
    /// in stderr.
    pub async fn submit(&self, job: &JobRequest) -> JobResult {
        info!(
            "Submitting job with {} file(s): {}",
            job.files.len(),
            job.command
        );
        for file in &job.files {
            debug!("  - {} ({} bytes)", file.filename, file.content.len());
            if file.content.is_empty() {
                warn!("Content for {} is empty", file.filename);
            }
        }

        match self.try_submit(job).await {
            Ok(result) => {
                info!("Job completed with exit code {}", result.exit_code);
                result
            }
            Err(e) => {
                error!("Job submission failed: {}", e);
                JobResult::failure(e.to_string())
            }
        }
    }

    async fn try_submit(&self, job: &JobRequest) -> Result<JobResult, ClientError> {
        let token = self.ensure_authenticated().await?;
        match self.post_run(job, &token).await? {
            RunAttempt::Done(result) => Ok(result),
            RunAttempt::Unauthorized(_) => {
                warn!("Received 401 Unauthorized, re-authenticating and retrying once");
                let token = self.reauthenticate(&token).await?;
                match self.post_run(job, &token).await? {
                    RunAttempt::Done(result) => Ok(result),
                    RunAttempt::Unauthorized(body) => Err(ClientError::Unauthorized(body)),
                }
            }
        }
    }

    async fn post_run(&self, job: &JobRequest, token: &str) -> Result<RunAttempt, ClientError> {
        let response = self
            .http
            .post(format!("{}/run", self.config.base_url))
            .bearer_auth(token)
            .json(job)
            .timeout(self.config.request_timeout)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Ok(RunAttempt::Unauthorized(body));
        }
        if status.is_success() {
            let result =
                serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
            return Ok(RunAttempt::Done(result));
        }
        // Server-side failures carry a JobResult when the job got far enough
        if status.is_server_error() {
            if let Ok(result) = serde_json::from_str::<JobResult>(&body) {
                return Ok(RunAttempt::Done(result));
            }
        }

        Err(ClientError::Http {
            status: status.as_u16(),
            body,
        })
    }
}
