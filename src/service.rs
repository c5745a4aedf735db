//! Job service - request handling independent of HTTP
//!
//! Each `/run` request moves through
//! `Received -> Authenticated -> Validated -> Staged -> Executing -> Completed | Failed`.
//! Nothing is allocated before the caller is authenticated, the payload is
//! valid and the admission rate allows it.

use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{AccessToken, AuthError, Authenticator, Credential};
use crate::job::{JobRequest, JobResult};
use crate::policy::ResourcePolicy;
use crate::sandbox::{RunOutcome, SandboxRunner};
use crate::workspace::{WorkspaceError, WorkspaceManager};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[source] AuthError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The container engine failed; the result carries its error text
    #[error("Container engine failure: {}", .0.stderr)]
    EngineFailed(JobResult),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Shared state behind the HTTP handlers
pub struct JobService {
    auth: Authenticator,
    workspaces: WorkspaceManager,
    runner: SandboxRunner,
    policy: Arc<ResourcePolicy>,
    limiter: DefaultDirectRateLimiter,
}

impl JobService {
    pub fn new(
        auth: Authenticator,
        workspaces: WorkspaceManager,
        runner: SandboxRunner,
        policy: Arc<ResourcePolicy>,
    ) -> Self {
        let limiter = RateLimiter::direct(Quota::per_minute(policy.jobs_per_minute()));
        Self {
            auth,
            workspaces,
            runner,
            policy,
            limiter,
        }
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    pub fn token_lifetime(&self) -> chrono::Duration {
        self.auth.issuer().lifetime()
    }

    /// Exchange credentials for a token. Password hashing runs off the async workers.
    pub async fn login(&self, username: &str, password: &str) -> Result<AccessToken, ServiceError> {
        let auth = self.auth.clone();
        let (username, password) = (username.to_string(), password.to_string());

        tokio::task::spawn_blocking(move || auth.login(&username, &password))
            .await
            .map_err(|e| ServiceError::Internal(format!("login task failed: {}", e)))?
            .map_err(|e| match e {
                AuthError::Hashing(_) | AuthError::Signing(_) => {
                    ServiceError::Internal(e.to_string())
                }
                other => ServiceError::Unauthorized(other),
            })
    }

    /// Resolve a bearer token to an enabled user
    pub fn authorize(&self, bearer: Option<&str>) -> Result<Credential, ServiceError> {
        let token = bearer.ok_or(ServiceError::Unauthorized(AuthError::MissingToken))?;
        self.auth.verify_token(token).map_err(|e| {
            debug!("Rejected bearer token: {}", e);
            ServiceError::Unauthorized(e)
        })
    }

    /// Authenticate, then run the job
    pub async fn handle_run(
        &self,
        job: JobRequest,
        bearer: Option<&str>,
    ) -> Result<JobResult, ServiceError> {
        let caller = self.authorize(bearer)?;
        self.run_authorized(&caller, job).await
    }

    /// Validate, admit, stage and execute a job for an already authenticated caller
    pub async fn run_authorized(
        &self,
        caller: &Credential,
        job: JobRequest,
    ) -> Result<JobResult, ServiceError> {
        debug!("Job received from {}", caller.username);

        job.validate().map_err(ServiceError::Validation)?;

        if let Err(not_until) = self.limiter.check() {
            let retry_after = not_until.wait_time_from(DefaultClock::default().now());
            warn!(
                "Rate limit of {} jobs/minute exceeded by {}",
                self.policy.max_jobs_per_minute, caller.username
            );
            return Err(ServiceError::RateLimited { retry_after });
        }

        let mut workspace = self
            .workspaces
            .stage(&job, self.policy.storage_limit_bytes())
            .await
            .map_err(|e| {
                warn!(user = %caller.username, "Staging failed: {}", e);
                e
            })?;
        let job_id = workspace.id;
        info!(
            job_id = %job_id,
            user = %caller.username,
            workspace = %workspace.root_path.display(),
            "Job staged, search path {}",
            workspace.search_path
        );

        let runner = self.runner.clone();
        let policy = Arc::clone(&self.policy);
        let command = job.command;

        // Own task so a dropped connection cannot skip teardown
        let handle = tokio::spawn(async move {
            info!(job_id = %job_id, "Job executing: {}", command);
            let result = runner.run(&workspace, &command, &policy).await;
            if let Err(e) = workspace.teardown().await {
                warn!(job_id = %job_id, "Failed to tear down workspace: {}", e);
            }
            result
        });

        match handle.await {
            Ok(RunOutcome::Finished(result)) => {
                info!(
                    job_id = %job_id,
                    success = result.success,
                    exit_code = result.exit_code,
                    "Job completed"
                );
                Ok(result)
            }
            Ok(RunOutcome::EngineFailed(result)) => {
                error!(job_id = %job_id, "Job failed to launch: {}", result.stderr);
                Err(ServiceError::EngineFailed(result))
            }
            Err(e) => {
                error!(job_id = %job_id, "Job task failed: {}", e);
                Err(ServiceError::Internal(format!("job task failed: {}", e)))
            }
        }
    }
}
