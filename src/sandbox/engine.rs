//! Container engine abstraction

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::ResourcePolicy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container engine error: {0}")]
    Api(String),
}

/// Everything needed to create one job container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Full argv, typically `["/bin/sh", "-c", script]`
    pub command: Vec<String>,
    /// Environment variables (KEY=value)
    pub env: Vec<String>,
    /// Host directory bind-mounted read-write into the container
    pub mount_source: PathBuf,
    pub mount_target: String,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
    pub policy: ResourcePolicy,
}

/// How a container terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
    /// The kernel OOM killer ended the main process
    pub oom_killed: bool,
}

/// Lifecycle operations the sandbox runner needs from a container runtime
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create (but do not start) a container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Block until the container stops
    async fn wait(&self, id: &str) -> Result<ExitStatus, EngineError>;

    /// Combined stdout and stderr produced so far, at most `limit` bytes of it
    async fn logs(&self, id: &str, limit: usize) -> Result<String, EngineError>;

    /// Forcibly stop a running container
    async fn kill(&self, id: &str) -> Result<(), EngineError>;

    /// Force-remove the container. Removing a container that no longer exists is not an error.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;
}

/// Collects container output up to a byte limit
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk; returns false once the limit has been reached
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
            return false;
        }
        self.bytes.extend_from_slice(chunk);
        true
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        let mut output = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            output.push_str(&format!("\n[output truncated at {} bytes]\n", self.limit));
        }
        output
    }
}
