//! Port allocation commands.

use crate::config::PortConfig;
use crate::db::Database;
use crate::ports::{AllocatedPort, PortAllocator, PortStore};
use anyhow::Result;
use clap::Args;
use std::sync::Arc;

/// Arguments for the allocate command.
#[derive(Args, Debug)]
pub struct AllocateArgs {
    /// Project to allocate ports to
    pub project_id: String,

    /// Number of ports (default: ports.default_count)
    #[arg(short = 'n', long)]
    pub count: Option<i64>,
}

/// Arguments for the ports command.
#[derive(Args, Debug)]
pub struct PortsArgs {
    /// Project whose ports to show
    pub project_id: String,

    /// Print the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

fn allocator_for(db: &Database, config: &PortConfig) -> PortAllocator {
    let store: Arc<dyn PortStore> = Arc::new(db.clone());
    PortAllocator::new(store, config.clone())
}

/// Run the allocate command.
pub async fn run_allocate(db: &Database, config: &PortConfig, args: &AllocateArgs) -> Result<()> {
    let allocator = allocator_for(db, config);
    let count = args.count.unwrap_or_else(|| i64::from(config.default_count));
    let ports = allocator.allocate(&args.project_id, count).await?;

    println!(
        "Allocated {} port(s) to {}:",
        ports.len(),
        args.project_id
    );
    print_ports(&ports);
    Ok(())
}

/// Run the ports command.
pub fn run_ports(db: &Database, config: &PortConfig, args: &PortsArgs) -> Result<()> {
    let allocator = allocator_for(db, config);
    let ports = allocator.get_allocated_ports(&args.project_id)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    match ports {
        None => println!("No ports allocated to {}.", args.project_id),
        Some(ports) => print_ports(&ports),
    }
    Ok(())
}

fn print_ports(ports: &[AllocatedPort]) {
    for port in ports {
        if port.remark.is_empty() {
            println!("  {}", port.port);
        } else {
            println!("  {}  {}", port.port, port.remark);
        }
    }
}
