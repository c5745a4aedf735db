//! Sandbox module - Container execution layer
//!
//! This module runs one job command inside one container:
//! - `ContainerEngine`: lifecycle operations on a container runtime
//! - `DockerEngine`: the engine backed by a local Docker daemon
//! - `SandboxRunner`: launches, waits, collects output and always removes the container
//!
//! The sandbox module does NOT:
//! - Create or delete workspaces (see `workspace`)
//! - Authenticate callers or rate-limit jobs
//! - Retry failed launches

pub mod docker;
pub mod engine;
pub mod runner;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ContainerSpec, EngineError, ExitStatus, OutputBuffer};
pub use runner::{
    classify_exit, is_test_runner, ExitClass, RunOutcome, RunnerSettings, SandboxRunner,
};
