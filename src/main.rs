use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use murmur_server::{driver_config, JwtVerifier, ServerConfig};
use murmur_settings::MurmurSettings;
use murmur_telemetry::{RelayMetrics, TelemetryConfig};
use murmur_upstream::TtsDriver;

/// Real-time speech synthesis relay.
#[derive(Debug, Parser)]
#[command(name = "murmur", version)]
struct Cli {
    /// Settings file (defaults to ~/.murmur/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override `server.host`.
    #[arg(long)]
    host: Option<String>,
    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,
}

fn load(cli: &Cli) -> anyhow::Result<MurmurSettings> {
    let mut settings = match &cli.config {
        Some(path) => murmur_settings::load_settings_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => murmur_settings::load_settings().context("loading settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let telemetry = TelemetryConfig::from_level_str(&settings.logging.level, settings.logging.json);
    murmur_telemetry::init_telemetry(&telemetry)?;

    if settings.auth.jwt_secret.is_empty() {
        bail!("auth.jwtSecret is not set; refusing to start without token verification");
    }
    if settings.upstream.app_key.is_empty() || settings.upstream.access_key.is_empty() {
        tracing::warn!("upstream credentials are empty, the provider will refuse connections");
    }

    let driver = TtsDriver::new(driver_config(&settings.upstream));
    let verifier = JwtVerifier::new(settings.auth.jwt_secret.as_bytes(), settings.auth.leeway_secs);
    let metrics = Arc::new(RelayMetrics::new());

    let handle = murmur_server::start(
        ServerConfig::from_settings(&settings),
        driver,
        Arc::new(verifier),
        metrics,
    )
    .await
    .context("starting server")?;

    tracing::info!(addr = %handle.addr, path = %settings.server.path, "murmur ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
