//! Fieldgate integrated edge gateway binary.
//!
//! Loads configuration, builds the protocol handler table and security
//! boundary, starts the engine's background tasks, and serves the network
//! API until a shutdown signal arrives. Shutdown stops scheduling, lets the
//! in-flight poll cycle observe cancellation, flushes the outbound buffer,
//! closes pooled connections, and drops stream subscribers, in that order.

use anyhow::{Context, Result};
use clap::Parser;
use fieldgate_api::ApiState;
use fieldgate_core::config::AuthMethod;
use fieldgate_core::GatewayConfig;
use fieldgate_engine::{install_prometheus, GatewayEngine};
use fieldgate_protocol::{FramedTcpHandler, HandlerRegistry, SimulatedHandler};
use fieldgate_security::{IdentityKind, SecurityContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fieldgate - industrial edge gateway bridging field devices into a
/// tag-based data model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "FIELDGATE_CONFIG",
        default_value = "config/fieldgate.yaml"
    )]
    config: PathBuf,

    /// Override API bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Operator API key id for initial setup (requires auth to be enabled)
    #[arg(long, default_value = "operator")]
    api_key_id: String,

    /// Operator API key secret for initial setup
    #[arg(long, env = "FIELDGATE_API_KEY", default_value = "changeme")]
    api_key_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        GatewayConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        GatewayConfig::default()
    };
    if let Some(bind) = args.bind {
        config.api.bind_addr = bind;
    }

    init_tracing(&config);
    info!(
        config = ?args.config,
        bind = %config.api.bind_addr,
        auth = config.security.auth_enabled,
        transport_encryption = config.security.transport_encryption_enabled,
        "Starting Fieldgate gateway"
    );

    let prometheus = if config.metrics.enabled {
        install_prometheus()
    } else {
        None
    };

    let handlers = Arc::new(
        HandlerRegistry::builder()
            .register(Arc::new(FramedTcpHandler::new(
                config.pool.connect_timeout(),
                config.polling.call_timeout(),
            )))
            .register(Arc::new(SimulatedHandler::new()))
            .build(),
    );

    let security = SecurityContext::from_settings(&config.security)?;
    if security.authenticator.enabled() {
        match config.security.auth_method {
            AuthMethod::ApiKey => security.authenticator.add_credential(
                &args.api_key_id,
                &args.api_key_secret,
                IdentityKind::Operator,
            )?,
        }
    }

    let engine = GatewayEngine::new(config.clone(), handlers, security);
    engine.start().await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let state = ApiState {
        engine: engine.clone(),
        prometheus,
    };
    fieldgate_api::serve(
        state,
        &config.api.bind_addr,
        config.api.cors_enabled,
        shutdown,
    )
    .await?;

    engine.shutdown().await;
    info!("Fieldgate gateway stopped");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
