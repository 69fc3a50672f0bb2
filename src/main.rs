//! taskport
//!
//! Project and task tracking backend with a race-safe port allocator,
//! served over a JSON HTTP API.

use anyhow::Result;
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Arc;
use taskport::api::{AppState, start_server};
use taskport::cli::{Cli, Command, ServeArgs, orders, ports};
use taskport::config::{Config, ConfigLoader};
use taskport::db::Database;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match cli.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn open_database(config: &Config) -> Result<Database> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)?;
    info!("Database opened at {:?}", config.server.db_path);
    Ok(db)
}

async fn run_server(config: Config, args: ServeArgs) -> Result<()> {
    let db = Arc::new(open_database(&config)?);
    let state = AppState::with_port_config(db, config.ports.clone());

    let host = args.host.unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    info!(
        min_port = config.ports.min_port,
        max_port = config.ports.max_port,
        "port pool configured"
    );

    let handle = start_server(state, &host, port).await?;
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli)?;

    // If explicit config path given, set it as env var for ConfigLoader to pick up
    // SAFETY: This is safe at program startup before any other threads are spawned
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("TASKPORT_CONFIG_PATH", config_path);
        }
    }
    let mut loader = ConfigLoader::load()?;
    if let Some(path) = loader.config_path() {
        info!("Loaded config from {}", path.display());
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.into();
    }
    let config = loader.into_config();
    config.validate()?;

    match cli.command {
        Some(Command::Allocate(args)) => {
            let db = open_database(&config)?;
            ports::run_allocate(&db, &config.ports, &args).await?;
        }
        Some(Command::Ports(args)) => {
            let db = open_database(&config)?;
            ports::run_ports(&db, &config.ports, &args)?;
        }
        Some(Command::BackfillOrders) => {
            let db = open_database(&config)?;
            orders::run_backfill_orders(&db)?;
        }
        Some(Command::Serve(args)) => run_server(config, args).await?,
        None => run_server(config, ServeArgs::default()).await?,
    }

    Ok(())
}
