//! Lifecycle Daemon - keeps Kyma modules converged
//!
//! Watches Kyma resources in the control plane, resolves their modules to
//! ModuleTemplates and keeps one Manifest per module applied.

use anyhow::Context;
use clap::Parser;
use lifecycle_daemon::{controller, LifecycleConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Lifecycle Daemon CLI
#[derive(Parser)]
#[command(name = "lifecycled")]
#[command(about = "Lifecycle manager - module convergence controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "LIFECYCLE_CONFIG")]
    config: Option<String>,

    /// Watched namespace
    #[arg(short, long, env = "LIFECYCLE_NAMESPACE")]
    namespace: Option<String>,

    /// Install manifests into runtime clusters
    #[arg(long, env = "LIFECYCLE_KCP_MODE")]
    kcp_mode: bool,

    /// Log level
    #[arg(long, env = "LIFECYCLE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "LIFECYCLE_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        LifecycleConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(namespace) = cli.namespace {
        config.controller.namespace = namespace;
    }
    config.logging.json |= cli.json;
    config.remote.in_kcp_mode |= cli.kcp_mode;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lifecycle manager starting");

    let client = kube::Client::try_default()
        .await
        .context("connecting to the control plane")?;
    controller::run(client, config).await?;
    Ok(())
}
