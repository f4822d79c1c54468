#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use config_manager_core::config::{DEFAULT_LOG_LEVEL, ENV_LOG_LEVEL};
use config_manager_core::credentials::agent;
use config_manager_core::{
    admin, server, ConfigManager, ManagerComponents, ManagerConfig, SnapshotCache,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var(ENV_LOG_LEVEL)
        .map(|val| val.to_lowercase())
        .unwrap_or(DEFAULT_LOG_LEVEL.to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ManagerConfig::from_os_env() {
        Ok(config) => config.sanitise(),
        Err(e) => {
            error!("Error loading config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid config: {e}");
        return ExitCode::FAILURE;
    }

    let store = Arc::new(SnapshotCache::new());
    let components = match ManagerComponents::connect(&config, store.clone()).await {
        Ok(components) => components,
        Err(e) => {
            error!("Failed to set up config manager: {e}");
            return ExitCode::FAILURE;
        }
    };
    let tokens = components.tokens.clone();
    let admin_port = config.admin_port;
    let token_agent_port = config.token_agent_port;

    let handle = match ConfigManager::start(config, components).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start config manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = handle.shutdown_token();
    let mut servers: Vec<JoinHandle<std::io::Result<()>>> = Vec::new();

    if let Some(port) = admin_port {
        match server::bind_local(port).await {
            Ok(listener) => {
                info!("Admin endpoint listening on 127.0.0.1:{port}");
                servers.push(tokio::spawn(server::serve(
                    "admin",
                    listener,
                    admin::router(handle.status(), handle.store()),
                    shutdown.clone(),
                )));
            }
            Err(e) => {
                error!("Failed to bind admin port {port}: {e}");
                handle.shutdown().await;
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(port) = token_agent_port {
        match server::bind_local(port).await {
            Ok(listener) => {
                info!("Token agent listening on 127.0.0.1:{port}");
                servers.push(tokio::spawn(server::serve(
                    "token-agent",
                    listener,
                    agent::router(tokens),
                    shutdown.clone(),
                )));
            }
            Err(e) => {
                error!("Failed to bind token agent port {port}: {e}");
                shutdown.cancel();
                join_servers(servers).await;
                handle.shutdown().await;
                return ExitCode::FAILURE;
            }
        }
    }

    wait_for_signal(&shutdown).await;
    info!("Shutting down config manager");
    shutdown.cancel();
    join_servers(servers).await;
    handle.shutdown().await;
    ExitCode::SUCCESS
}

async fn join_servers(servers: Vec<JoinHandle<std::io::Result<()>>>) {
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Local server failed: {e}"),
            Err(e) => error!("Local server task failed: {e}"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal(shutdown: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {e}");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.cancelled() => {}
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("Received SIGINT"),
        _ = sigterm.recv() => debug!("Received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("Received ctrl-c"),
        _ = shutdown.cancelled() => {}
    }
}
