//! Docker-backed container engine
//!
//! Talks to the local Docker daemon through bollard. Every field of the
//! resource policy is translated into the container's host config by
//! [`container_config`], which is pure so the mapping can be tested without a
//! daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, warn};

use super::engine::{ContainerEngine, ContainerSpec, EngineError, ExitStatus, OutputBuffer};

/// Container engine backed by the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_defaults().map_err(api_error)?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check the daemon is reachable
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(api_error)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::ImageNotFound(spec.image.clone()),
                other => api_error(other),
            })?;

        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }
        debug!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found_or_api(id, e))
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        let code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(not_found_or_api(id, e)),
            None => return Err(EngineError::Api(format!("wait on {} ended without status", id))),
        };

        let oom_killed = match self.docker.inspect_container(id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Failed to inspect container {} after exit: {}", id, e);
                false
            }
        };

        Ok(ExitStatus { code, oom_killed })
    }

    async fn logs(&self, id: &str, limit: usize) -> Result<String, EngineError> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = OutputBuffer::new(limit);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| not_found_or_api(id, e))?;
            if !output.push(&chunk.into_bytes()) {
                warn!(container = %id, "Output exceeded {} bytes, truncating", limit);
                break;
            }
        }

        Ok(output.into_string())
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(not_found_or_api(id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(api_error(e)),
        }
    }
}

/// Translate a container spec and its resource policy into a Docker create config
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let policy = &spec.policy;

    let tmpfs = policy.read_only_root.then(|| {
        HashMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}", policy.tmpfs_size),
        )])
    });

    let host_config = HostConfig {
        binds: Some(vec![format!(
            "{}:{}:rw",
            spec.mount_source.display(),
            spec.mount_target
        )]),
        cpu_quota: Some(to_i64(policy.cpu_quota_micros)),
        cpu_period: Some(to_i64(policy.cpu_period_micros)),
        cpu_shares: Some(to_i64(policy.cpu_shares)),
        memory: Some(to_i64(policy.memory_limit)),
        memory_swap: Some(to_i64(policy.memory_swap_limit)),
        memory_reservation: Some(to_i64(policy.memory_reservation)),
        pids_limit: Some(to_i64(policy.pids_limit)),
        network_mode: (!policy.network_enabled).then(|| "none".to_string()),
        readonly_rootfs: Some(policy.read_only_root),
        tmpfs,
        cap_drop: policy
            .drop_all_capabilities
            .then(|| vec!["ALL".to_string()]),
        security_opt: policy
            .no_new_privileges
            .then(|| vec!["no-new-privileges:true".to_string()]),
        privileged: Some(false),
        auto_remove: Some(false),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(spec.env.clone()),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(spec.labels.clone()),
        network_disabled: Some(!policy.network_enabled),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn api_error(e: DockerError) -> EngineError {
    EngineError::Api(e.to_string())
}

fn not_found_or_api(id: &str, e: DockerError) -> EngineError {
    match e {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(id.to_string()),
        other => api_error(other),
    }
}
