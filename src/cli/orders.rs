//! Task order maintenance.

use crate::db::Database;
use anyhow::Result;

/// Run the backfill-orders command.
pub fn run_backfill_orders(db: &Database) -> Result<()> {
    let updated = db.backfill_task_orders()?;
    if updated == 0 {
        println!("All tasks already have an order.");
    } else {
        println!("Assigned orders to {} task(s).", updated);
    }
    Ok(())
}
