//! dobby - the loom server command.
//!
//! Connects to one dobby loom (or a simulated one) and serves it to a web
//! client over WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use dobby_core::MAX_SHAFTS;
use dobby_server::{
    serve, ExampleLoom, LoomSession, SessionConfig, SqlitePatternStore, MOCK_PORT_NAME,
};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_DB_NAME: &str = "dobby_patterns.sqlite";

/// Dobby loom server
#[derive(Parser, Debug)]
#[command(name = "dobby")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Weave on a dobby loom from a web browser", long_about = None)]
struct Cli {
    /// Serial port of the loom, or "mock" for a simulated loom
    #[arg(value_name = "SERIAL_PORT")]
    serial_port: String,

    /// Loom name (default: the saved name, or "example")
    #[arg(short, long)]
    name: Option<String>,

    /// Number of shafts
    #[arg(short = 's', long, default_value_t = 24,
          value_parser = clap::value_parser!(u32).range(1..=MAX_SHAFTS as i64))]
    num_shafts: u32,

    /// HTTP port
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Pattern database (default: dobby_patterns.sqlite in the temp directory)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Settings file (default: ~/.config/dobby/settings.toml)
    #[arg(long, value_name = "PATH")]
    settings_path: Option<PathBuf>,

    /// Delete the pattern database before starting
    #[arg(long)]
    reset_db: bool,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,

    /// The loom only accepts direction changes from its own controls
    #[arg(long)]
    loom_direction: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DB_NAME));
    let store = if cli.reset_db {
        log::info!("Resetting pattern database {}", db_path.display());
        SqlitePatternStore::open_reset(&db_path)
    } else {
        SqlitePatternStore::open(&db_path)
    }
    .with_context(|| format!("Failed to open pattern database {}", db_path.display()))?;

    let loom = ExampleLoom::new(cli.num_shafts as usize)
        .with_full_direction_control(!cli.loom_direction);
    let session = LoomSession::new(Arc::new(loom), session_config(&cli), Box::new(store));
    session.start().await;

    let result = serve(session.clone(), cli.port, shutdown_signal()).await;
    session.close().await;
    result
}

fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn session_config(cli: &Cli) -> SessionConfig {
    let mut config = SessionConfig::new(cli.serial_port.clone());
    config.loom_name = cli.name.clone();
    config.settings_path = cli.settings_path.clone().or_else(default_settings_path);
    if config.settings_path.is_none() {
        log::warn!("Could not determine a config directory; settings will not be saved");
    }
    if cli.serial_port == MOCK_PORT_NAME {
        log::info!("Using a simulated loom");
    }
    config
}

/// `settings.toml` in the platform config directory.
fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "dobby").map(|dirs| dirs.config_dir().join("settings.toml"))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}
