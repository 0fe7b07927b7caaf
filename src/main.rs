mod config;
mod convert;
mod endpoint;
mod error;
mod health;
mod logging;
mod oauth;
mod proxy;
mod rewrite;
mod selector;
mod tagging;
mod validator;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::Router;
use clap::{Parser, Subcommand};
use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{
    default_config_path, load_or_init, save_config, update_endpoint_oauth,
};
use crate::endpoint::EndpointRegistry;
use crate::health::HealthChecker;
use crate::oauth::{OAuthManager, PersistFn};
use crate::proxy::{ProxyService, router as proxy_router};

#[derive(Parser, Debug)]
#[command(name = "claude-relay")]
#[command(
    about = "Reverse proxy for Anthropic Messages API clients with tagged multi-upstream failover",
    long_about = None
)]
struct Cli {
    /// Config file path; defaults to ~/.claude-relay/config.yaml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server (default)
    Serve {
        /// Listen port; overrides server.port from the config
        #[arg(long)]
        port: Option<u16>,
    },
    /// Config helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the commented config template
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path that would be used
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Config { cmd } => {
            init_tracing("info");
            match cmd {
                ConfigCommand::Init { force } => {
                    let path = config::init_template(&config_path, force)?;
                    println!("wrote config template to {}", path.display());
                }
                ConfigCommand::Path => {
                    println!("{}", config_path.display());
                }
            }
            Ok(())
        }
        Command::Serve { port } => run_server(config_path, port).await,
    }
}

fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn run_server(config_path: PathBuf, port_override: Option<u16>) -> Result<()> {
    let cfg = Arc::new(load_or_init(&config_path)?);
    init_tracing(&cfg.logging.level);

    if cfg.endpoints.is_empty() {
        anyhow::bail!(
            "no endpoints configured in {}; add at least one endpoint and restart",
            config_path.display()
        );
    }

    // One shared client; connect timeout covers the TLS handshake, read
    // timeout covers idle upstream connections.
    let client = Client::builder()
        .connect_timeout(cfg.timeouts.tls_handshake())
        .read_timeout(cfg.timeouts.idle_connection())
        .build()?;

    let registry = Arc::new(EndpointRegistry::from_configs(
        &cfg.endpoints,
        cfg.timeouts.unhealthy_threshold,
    ));

    // OAuth persistence: rewrite the endpoint's config section on disk; the
    // in-memory copy is updated only after a successful write.
    let persist_state = Arc::new(Mutex::new((*cfg).clone()));
    let persist_path = config_path.clone();
    let persist: PersistFn = Arc::new(move |name, tokens| {
        let mut current = persist_state.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = current.clone();
        if !update_endpoint_oauth(&mut next, name, tokens) {
            anyhow::bail!("endpoint '{name}' not found in configuration");
        }
        save_config(&next, &persist_path)?;
        *current = next;
        Ok(())
    });

    let oauth = Arc::new(OAuthManager::new(client.clone(), persist));
    oauth.register_endpoints(&registry.snapshot());

    let checker = Arc::new(HealthChecker::new(
        registry.clone(),
        oauth.clone(),
        client.clone(),
        &cfg.timeouts,
    ));
    let _health_task = checker.spawn();

    spawn_reload_task(config_path.clone(), registry.clone(), oauth.clone());

    let service = ProxyService::new(client, cfg.clone(), registry.clone(), oauth);
    let app: Router = proxy_router(service);

    let port = port_override.unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port).parse()?;
    info!(
        "claude-relay listening on http://{addr} ({} endpoints)",
        registry.list_all().len()
    );

    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// SIGHUP reloads the endpoint list from disk. The registry swap preserves
/// the runtime health of endpoints whose name survives; server address and
/// listen port are not hot-reloadable.
fn spawn_reload_task(
    config_path: PathBuf,
    registry: Arc<EndpointRegistry>,
    oauth: Arc<OAuthManager>,
) {
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!("failed to install SIGHUP handler: {err}");
                return;
            }
        };
        while sighup.recv().await.is_some() {
            match load_or_init(&config_path) {
                Ok(new_cfg) => {
                    let endpoints = new_cfg
                        .endpoints
                        .iter()
                        .map(crate::endpoint::Endpoint::from_config)
                        .collect();
                    registry.update(endpoints);
                    oauth.register_endpoints(&registry.snapshot());
                    info!("configuration reloaded from {}", config_path.display());
                }
                Err(err) => {
                    tracing::warn!("config reload failed, keeping previous endpoints: {err}");
                }
            }
        }
    });
    #[cfg(not(unix))]
    let _ = (config_path, registry, oauth);
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}
