//! # shuttle-agent
//!
//! Shuttle broadcast server binary. Loads settings, builds the credential
//! verifier, and starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shuttle_auth::JwtVerifier;
use shuttle_server::metrics;
use shuttle_server::{ServerConfig, ShuttleServer};
use shuttle_settings::{AuthSettings, LoggingSettings, ShuttleSettings};
use tracing::{info, warn};

/// Live bus location broadcast server.
#[derive(Parser, Debug)]
#[command(name = "shuttle-agent", about = "Live bus location broadcast server")]
struct Cli {
    /// Settings file (defaults to `~/.shuttle/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Mount the unauthenticated all-buses channel at `/ws`.
    #[arg(long)]
    global_channel: bool,

    /// Do not install the Prometheus recorder or serve `/metrics`.
    #[arg(long)]
    no_metrics: bool,
}

impl Cli {
    fn apply(&self, settings: &mut ShuttleSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.global_channel {
            settings.server.global_channel = true;
        }
    }
}

/// File, then env, then command line.
fn load(cli: &Cli) -> Result<ShuttleSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(shuttle_settings::settings_path);
    let mut settings = shuttle_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn init_tracing(logging: &LoggingSettings) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if logging.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    init_tracing(&settings.logging);

    if settings.auth.secret_key == AuthSettings::default().secret_key {
        warn!("auth.secretKey is the built-in placeholder; set SHUTTLE_SECRET_KEY");
    }
    let verifier = JwtVerifier::new(
        &settings.auth.secret_key,
        &settings.auth.algorithm,
        settings.auth.leeway_secs,
    )
    .context("Failed to build credential verifier")?;

    let config = ServerConfig::from_settings(&settings.server);
    let mut server = ShuttleServer::new(config, Arc::new(verifier));
    if !cli.no_metrics {
        server = server.with_metrics(metrics::install_recorder());
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!("shuttle broadcast listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("shuttle-agent").chain(args.iter().copied()))
    }

    #[test]
    fn cli_defaults() {
        let cli = cli(&[]);
        assert_eq!(cli.config, None);
        assert_eq!(cli.host, None);
        assert_eq!(cli.port, None);
        assert!(!cli.global_channel);
        assert!(!cli.no_metrics);
    }

    #[test]
    fn cli_flags() {
        let cli = cli(&[
            "--config",
            "/tmp/shuttle.json",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
            "--global-channel",
            "--no-metrics",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/shuttle.json")));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(8080));
        assert!(cli.global_channel);
        assert!(cli.no_metrics);
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["shuttle-agent", "--port", "70000"]).is_err());
    }

    #[test]
    fn cli_overrides_settings() {
        let mut settings = ShuttleSettings::default();
        cli(&["--host", "10.1.1.1", "--port", "9000", "--global-channel"]).apply(&mut settings);
        assert_eq!(settings.server.host, "10.1.1.1");
        assert_eq!(settings.server.port, 9000);
        assert!(settings.server.global_channel);
    }

    #[test]
    fn absent_flags_keep_settings() {
        let mut settings = ShuttleSettings::default();
        settings.server.port = 1234;
        cli(&[]).apply(&mut settings);
        assert_eq!(settings.server.port, 1234);
        assert!(!settings.server.global_channel);
    }

    #[test]
    fn load_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"maxSubscribersPerBus": 3}, "auth": {"secretKey": "s3cret"}}"#,
        )
        .unwrap();
        let path_arg = path.to_string_lossy().into_owned();

        let settings = load(&cli(&["--config", &path_arg, "--port", "7000"])).unwrap();
        assert_eq!(settings.server.max_subscribers_per_bus, 3);
        assert_eq!(settings.server.port, 7000);
    }

    #[test]
    fn load_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"maxSubscribersPerBus": 0}}"#).unwrap();
        let path_arg = path.to_string_lossy().into_owned();

        let err = load(&cli(&["--config", &path_arg])).unwrap_err();
        assert!(format!("{err:#}").contains("maxSubscribersPerBus"));
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let path_arg = path.to_string_lossy().into_owned();

        assert!(load(&cli(&["--config", &path_arg])).is_err());
    }
}
