use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use sandbox_runtime::auth::{
    Authenticator, Credential, CredentialStore, StaticCredentialStore, TokenIssuer,
};
use sandbox_runtime::config::{LogFormat, PasswordSource, ServiceConfig};
use sandbox_runtime::sandbox::{DockerEngine, SandboxRunner};
use sandbox_runtime::service::JobService;
use sandbox_runtime::workspace::WorkspaceManager;
use sandbox_runtime::{logging, server, ResourcePolicy};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init(LogFormat::from_env(), &["sandbox_runtime=info"])?;

    info!("Starting Secure Agent Runtime...");

    let config = ServiceConfig::from_env().context("Invalid service configuration")?;

    let policy = ResourcePolicy::load(config.policy_path.as_deref())
        .context("Failed to load resource policy")?;
    match &config.policy_path {
        Some(path) => info!("Loaded resource policy from {}", path.display()),
        None => info!("Using built-in resource policy"),
    }
    info!(
        "Policy: cpu {}/{}us, memory {} bytes, pids {}, timeout {}s, network {}, read-only root {}, {} jobs/min",
        policy.cpu_quota_micros,
        policy.cpu_period_micros,
        policy.memory_limit,
        policy.pids_limit,
        policy.execution_timeout.as_secs(),
        policy.network_enabled,
        policy.read_only_root,
        policy.max_jobs_per_minute
    );
    if !policy.network_enabled && config.runner.bootstrap.is_some() {
        warn!("Network is disabled; tooling bootstrap will be skipped and the image must provide it");
    }

    let credential = match &config.password {
        PasswordSource::Hashed(hash) => Credential::new(&config.username, hash),
        PasswordSource::Plain(password) => Credential::new(
            &config.username,
            sandbox_runtime::auth::hash_password(password)?,
        ),
    };
    let store: Arc<dyn CredentialStore> = Arc::new(StaticCredentialStore::new([credential]));
    let issuer = TokenIssuer::new(config.secret_key.as_bytes(), config.token_lifetime);
    info!(
        "Credential store loaded for user {} (token lifetime {} minutes)",
        config.username,
        config.token_lifetime.num_minutes()
    );

    // Bind mounts need an absolute host path
    let workspace_root = std::path::absolute(&config.workspace_root)
        .context("Failed to resolve WORKSPACE_ROOT")?;
    tokio::fs::create_dir_all(&workspace_root)
        .await
        .with_context(|| format!("Failed to create {}", workspace_root.display()))?;
    info!("Workspaces under {}", workspace_root.display());

    let engine = DockerEngine::connect().context("Failed to connect to Docker")?;
    match engine.ping().await {
        Ok(()) => info!("Connected to Docker daemon"),
        Err(e) => warn!("Docker daemon not reachable yet: {}", e),
    }
    info!("Sandbox image: {}", config.runner.image);

    let workspaces = WorkspaceManager::new(workspace_root, config.runner.mount_path.clone());
    let runner = SandboxRunner::new(Arc::new(engine), config.runner.clone());
    let service = Arc::new(JobService::new(
        Authenticator::new(store, issuer),
        workspaces,
        runner,
        Arc::new(policy),
    ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    server::serve(listener, service, shutdown_signal()).await?;

    info!("Secure Agent Runtime stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, finishing in-flight jobs");
}
