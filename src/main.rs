//! The tradedesk daemon: loads configuration and the reference catalog,
//! wires the core, constructs the configured adapters and runs until
//! interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tradedesk::catalog::db;
use tradedesk::{AdapterRegistry, Config, Core, CoreOptions};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tradedesk", about = "electronic trading platform core")]
struct Cli {
    /// Config file path.
    #[arg(short, long = "config_file", default_value = "tradedesk.conf")]
    config_file: PathBuf,

    /// Log filter file: one tracing directive per line.
    #[arg(short, long = "log_config_file", default_value = "log.conf")]
    log_config_file: PathBuf,

    /// Database path (sqlite). Overrides the config-file setting.
    #[arg(long = "db_url")]
    db_url: Option<String>,

    /// Create database tables before loading the catalog.
    #[arg(long = "db_create_tables", default_value_t = false)]
    db_create_tables: bool,

    /// Listen port reserved for the frontend transport.
    #[arg(long, default_value_t = 9111)]
    port: u16,

    /// Shared task-pool worker threads.
    #[arg(long = "io_threads", default_value_t = 1)]
    io_threads: usize,

    /// Algo shard threads.
    #[arg(long = "algo_threads", default_value_t = 1)]
    algo_threads: usize,

    /// Turn every risk check off.
    #[arg(long = "disable_rms", default_value_t = false)]
    disable_rms: bool,
}

fn init_logging(path: &PathBuf) {
    let filter = std::fs::read_to_string(path)
        .ok()
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .collect::<Vec<_>>()
                .join(",")
        })
        .filter(|f| !f.is_empty());
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> Result<(), ExitCode> {
    let config = match Config::load(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {e}", cli.config_file.display());
            return Err(ExitCode::from(1));
        }
    };

    let db_url = cli
        .db_url
        .or_else(|| config.setting("db_url").map(String::from));
    let Some(db_url) = db_url else {
        error!("db_url not configured");
        return Err(ExitCode::from(1));
    };
    let db_path = PathBuf::from(&db_url);

    let catalog = {
        let conn = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(e) => {
                error!("failed to open database {db_url}: {e}");
                return Err(ExitCode::from(1));
            }
        };
        if cli.db_create_tables {
            if let Err(e) = db::create_tables(&conn) {
                error!("failed to create tables: {e}");
                return Err(ExitCode::from(1));
            }
        }
        match db::load_catalog(&conn) {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                error!("failed to load catalog: {e}");
                return Err(ExitCode::from(1));
            }
        }
    };

    let core = Core::open(
        catalog,
        CoreOptions {
            store_dir: PathBuf::from("./store"),
            db_path,
            algo_threads: cli.algo_threads,
            io_threads: cli.io_threads,
            disable_rms: cli.disable_rms,
            pnl_start_delay: Duration::from_secs(
                std::env::var("UPDATE_PNL_WAIT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(15),
            ),
        },
    )
    .map_err(|e| {
        error!("failed to start core: {e}");
        ExitCode::from(2)
    })?;

    let mut registry = AdapterRegistry::new();
    tradedesk::sim::register(&mut registry);
    core.load_adapters(&config, &registry).map_err(|e| {
        error!("failed to load adapters: {e}");
        ExitCode::from(2)
    })?;
    if core.md.default_feed().is_none() {
        error!("At least one market data adapter required");
        return Err(ExitCode::from(2));
    }

    info!(
        "tradedesk up; session {} (frontend transport attaches on port {})",
        core.session.started_at, cli.port
    );

    let result = core.runtime().block_on(tokio::signal::ctrl_c());
    if let Err(e) = result {
        error!("signal wait failed: {e}");
    }
    core.shutdown(Duration::from_secs(1));
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_config_file);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
