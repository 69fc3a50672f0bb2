//! Layered configuration.
//!
//! Tiers, merged field-by-field (later wins):
//! 1. **Defaults** - compiled in
//! 2. **Project** - `$CWD/taskport/config.yaml`
//! 3. **User** - `~/.taskport/config.yaml`
//! 4. **Environment** - process environment, after loading `.env`
//!
//! ## Environment Variables
//! - `TASKPORT_CONFIG_PATH` - Explicit config file (replaces file tiers)
//! - `TASKPORT_DB_PATH` - Database path
//! - `TASKPORT_HOST` / `PORT` - HTTP bind address
//! - `TASKPORT_USER_DIR` / `TASKPORT_PROJECT_DIR` - Tier directories
//! - `PORT_ALLOCATION_MIN`, `PORT_ALLOCATION_MAX` - Pool range
//! - `PORT_ALLOCATION_DEFAULT_COUNT`, `PORT_ALLOCATION_MAX_PER_PROJECT`
//! - `PORT_ALLOCATION_MAX_RETRIES`, `PORT_ALLOCATION_RETRY_DELAY_MS`

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
