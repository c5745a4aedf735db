//! Sandbox runner implementation
//!
//! Runs one job command in a fresh container bound to the job workspace. The
//! container is removed on every path out of [`SandboxRunner::run`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use super::engine::{ContainerEngine, ContainerSpec, ExitStatus};
use crate::job::JobResult;
use crate::policy::ResourcePolicy;
use crate::workspace::Workspace;

pub const CONTAINER_NAME_PREFIX: &str = "sandbox-job-";
pub const MANAGED_LABEL: &str = "sandbox-runtime.managed";
pub const JOB_ID_LABEL: &str = "sandbox-runtime.job_id";

/// Image and in-container layout used for every job
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub image: String,
    /// Where the workspace is mounted, also the working directory
    pub mount_path: String,
    /// Shell snippet run before the job command to install tooling; skipped when empty
    pub bootstrap: Option<String>,
    /// Environment variable receiving the module search path
    pub search_path_var: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            image: "python:3.10-slim".to_string(),
            mount_path: "/app".to_string(),
            bootstrap: Some(
                "pip install --quiet --disable-pip-version-check pytest flake8".to_string(),
            ),
            search_path_var: "PYTHONPATH".to_string(),
        }
    }
}

/// The two separate questions a job outcome answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitClass {
    /// The command ran to completion (a test runner reporting failures counts)
    pub ran_successfully: bool,
    /// The command exited cleanly with nothing failing
    pub all_checks_passed: bool,
}

/// Whether `command` invokes a test runner whose exit code 1 means "some tests failed"
pub fn is_test_runner(command: &str) -> bool {
    let tokens: Vec<&str> = command
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')'))
        .filter(|t| !t.is_empty())
        .collect();

    let runner_binary = tokens.iter().any(|token| {
        let name = token.rsplit('/').next().unwrap_or(token);
        matches!(name, "pytest" | "py.test")
    });

    let runner_module = tokens
        .windows(2)
        .any(|pair| pair[0] == "-m" && matches!(pair[1], "pytest" | "unittest"));

    runner_binary || runner_module
}

/// Classify an exit code for `command`
pub fn classify_exit(command: &str, exit_code: i32) -> ExitClass {
    ExitClass {
        ran_successfully: exit_code == 0 || (exit_code == 1 && is_test_runner(command)),
        all_checks_passed: exit_code == 0,
    }
}

/// How far a run got
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container ran to an exit, an OOM kill, or the timeout
    Finished(JobResult),
    /// The engine failed to create, start or wait on the container
    EngineFailed(JobResult),
}

impl RunOutcome {
    pub fn result(&self) -> &JobResult {
        match self {
            RunOutcome::Finished(result) | RunOutcome::EngineFailed(result) => result,
        }
    }

    pub fn into_result(self) -> JobResult {
        match self {
            RunOutcome::Finished(result) | RunOutcome::EngineFailed(result) => result,
        }
    }
}

/// Runs job commands in containers through a [`ContainerEngine`]
#[derive(Clone)]
pub struct SandboxRunner {
    engine: Arc<dyn ContainerEngine>,
    settings: RunnerSettings,
}

impl SandboxRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: RunnerSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Run `command` against `workspace` under `policy`.
    ///
    /// Engine errors and timeouts come back as a failed [`JobResult`] with
    /// exit code -1; the outcome says which of the two happened.
    pub async fn run(
        &self,
        workspace: &Workspace,
        command: &str,
        policy: &ResourcePolicy,
    ) -> RunOutcome {
        let spec = self.container_spec(workspace, command, policy);
        info!(
            job_id = %workspace.id,
            container = %spec.name,
            "Launching container (image {}, search path {})",
            spec.image,
            workspace.search_path
        );

        let id = match self.engine.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(container = %spec.name, "Failed to create container: {}", e);
                return RunOutcome::EngineFailed(JobResult::failure(e.to_string()));
            }
        };

        let result = self.execute(&id, command, policy).await;

        if let Err(e) = self.engine.remove(&id).await {
            warn!(container = %id, "Failed to remove container: {}", e);
        }
        result
    }

    async fn execute(&self, id: &str, command: &str, policy: &ResourcePolicy) -> RunOutcome {
        if let Err(e) = self.engine.start(id).await {
            error!(container = %id, "Failed to start container: {}", e);
            return RunOutcome::EngineFailed(JobResult::failure(e.to_string()));
        }

        match tokio::time::timeout(policy.execution_timeout, self.engine.wait(id)).await {
            Ok(Ok(status)) => {
                let output = self.collect_logs(id, policy).await;
                RunOutcome::Finished(completed(command, status, output, policy))
            }
            Ok(Err(e)) => {
                error!(container = %id, "Failed waiting on container: {}", e);
                RunOutcome::EngineFailed(JobResult::failure(e.to_string()))
            }
            Err(_) => {
                warn!(
                    container = %id,
                    "Container exceeded {}s, killing",
                    policy.execution_timeout.as_secs()
                );
                if let Err(e) = self.engine.kill(id).await {
                    warn!(container = %id, "Failed to kill container: {}", e);
                }
                RunOutcome::Finished(JobResult {
                    success: false,
                    exit_code: -1,
                    stdout: self.collect_logs(id, policy).await,
                    stderr: format!(
                        "Execution timed out after {} seconds",
                        policy.execution_timeout.as_secs()
                    ),
                })
            }
        }
    }

    async fn collect_logs(&self, id: &str, policy: &ResourcePolicy) -> String {
        self.engine
            .logs(id, policy.output_limit_bytes())
            .await
            .unwrap_or_else(|e| {
                warn!(container = %id, "Failed to read logs: {}", e);
                String::new()
            })
    }

    fn container_spec(
        &self,
        workspace: &Workspace,
        command: &str,
        policy: &ResourcePolicy,
    ) -> ContainerSpec {
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (JOB_ID_LABEL.to_string(), workspace.id.to_string()),
        ]);

        ContainerSpec {
            name: format!("{}{}", CONTAINER_NAME_PREFIX, workspace.id),
            image: self.settings.image.clone(),
            command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                self.wrap_command(command, policy),
            ],
            env: vec![format!(
                "{}={}",
                self.settings.search_path_var, workspace.search_path
            )],
            mount_source: workspace.root_path.clone(),
            mount_target: self.settings.mount_path.clone(),
            working_dir: self.settings.mount_path.clone(),
            labels,
            policy: policy.clone(),
        }
    }

    /// Prefix the job command with the tooling bootstrap.
    ///
    /// Bootstrap output is discarded so job output stays clean; a failed
    /// bootstrap is noted on stderr and the job command still runs.
    fn wrap_command(&self, command: &str, policy: &ResourcePolicy) -> String {
        let bootstrap = self
            .settings
            .bootstrap
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty());

        match bootstrap {
            // Installing tooling needs the network
            Some(bootstrap) if policy.network_enabled => format!(
                "if ! ( {} ) >/dev/null 2>&1; then echo 'sandbox: tooling bootstrap failed' >&2; fi\n{}",
                bootstrap, command
            ),
            _ => command.to_string(),
        }
    }
}

fn completed(command: &str, status: ExitStatus, output: String, policy: &ResourcePolicy) -> JobResult {
    let exit_code = i32::try_from(status.code).unwrap_or(-1);

    if status.oom_killed {
        warn!("Job killed by the OOM killer (exit code {})", exit_code);
        return JobResult {
            success: false,
            exit_code,
            stdout: output,
            stderr: format!(
                "Job was killed: memory limit of {} bytes exceeded",
                policy.memory_limit
            ),
        };
    }

    let class = classify_exit(command, exit_code);
    if class.ran_successfully && !class.all_checks_passed {
        info!("Test runner reported failures (exit code {}), job ran successfully", exit_code);
    }

    JobResult {
        success: class.ran_successfully,
        exit_code,
        stdout: output,
        stderr: String::new(),
    }
}
