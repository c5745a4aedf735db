//! Secure Agent Runtime
//!
//! An HTTP service that runs a shell command against a set of submitted files
//! inside a resource-bounded container, plus the client used to call it.

pub mod auth;
pub mod client;
pub mod config;
pub mod job;
pub mod logging;
pub mod policy;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod workspace;

pub use client::{ClientConfig, JobClient};
pub use job::{FilePayload, JobRequest, JobResult};
pub use policy::ResourcePolicy;
