//! Hearth gateway daemon.
//!
//! Startup order: configuration → identity key → database → service
//! container (gateway core, which itself brings up storage
//! verification, bus, plugins, adapters, scheduler). Any startup
//! failure exits with code 1; clean shutdown exits 0.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use hearth_config::HearthConfig;
use hearth_crypto::IdentityKeyPair;
use hearth_gateway::{GatewayCore, Service, ServiceContainer};
use hearth_storage::Database;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the configuration file.
const CONFIG_ENV: &str = "HEARTH_CONFIG";

/// Environment toggle: `false` prints verbose startup lines to stdout,
/// `true` (detached) keeps stdout quiet.
const DETACH_ENV: &str = "HEARTH_DETACH_MODE";

fn detached() -> bool {
    std::env::var(DETACH_ENV).map_or(true, |value| value != "false")
}

/// Print a startup line unless running detached.
fn startup_line(message: &str) {
    if !detached() {
        println!("[+] {message}");
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
}

fn load_config() -> Result<HearthConfig> {
    match config_path() {
        Some(path) => {
            let config = HearthConfig::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            startup_line(&format!("Configuration loaded from {}", path.display()));
            Ok(config)
        }
        None => {
            startup_line("No configuration file given, using defaults");
            Ok(HearthConfig::default())
        }
    }
}

/// Load the gateway identity key, creating one on first run.
///
/// A present-but-corrupt key file is fatal: starting with a fresh
/// identity would silently invalidate every provisioned client.
fn load_identity(storage_path: &str) -> Result<IdentityKeyPair> {
    let key_path = Path::new(storage_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("identity.key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path)
            .with_context(|| format!("failed to read master key {}", key_path.display()))?;
        let keypair = IdentityKeyPair::from_secret_key(&bytes)
            .with_context(|| format!("master key {} is corrupt", key_path.display()))?;
        startup_line(&format!("Identity loaded from {}", key_path.display()));
        return Ok(keypair);
    }

    let keypair = IdentityKeyPair::generate();
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&key_path, keypair.secret_key_bytes().as_slice())
        .with_context(|| format!("failed to write master key {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }

    startup_line(&format!("New identity written to {}", key_path.display()));
    Ok(keypair)
}

async fn run() -> Result<()> {
    let config = load_config()?;

    let identity = load_identity(&config.storage.path)?;

    let db = Database::open(&config.storage.path, config.storage.encryption_key.as_deref())
        .await
        .context("failed to open database")?;
    db.migrate().await.context("failed to migrate database")?;
    startup_line("Database ready");

    let container = ServiceContainer::new();
    let core = Arc::new(
        GatewayCore::new(config, db, identity).context("failed to build gateway")?,
    );

    {
        let core = Arc::clone(&core);
        container
            .register(
                "gateway",
                move |_| Ok(Arc::clone(&core) as Arc<dyn Service>),
                vec![],
                0,
                true,
            )
            .map_err(|err| anyhow::anyhow!(err))?;
    }

    container
        .start_all()
        .await
        .context("gateway startup failed")?;
    startup_line("Hearth gateway started");
    info!("Hearth gateway running");

    wait_for_shutdown().await;

    info!("Shutdown signal received");
    container.stop_all().await;
    startup_line("Hearth gateway stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(error) => {
                error!(%error, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start async runtime: {error}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %format!("{error:#}"), "Fatal startup error");
            eprintln!("hearthd: {error:#}");
            ExitCode::from(1)
        }
    }
}
