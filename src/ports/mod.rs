//! Port range allocation for projects.
//!
//! Each project may receive a single batch of ports from a shared pool.
//! Assignments are recorded twice:
//! - the global `port_allocations` ledger, whose primary key on `port` keeps
//!   any two projects from holding the same port
//! - a JSON snapshot on the project row, which is what readers see and the
//!   only place remarks live
//!
//! Both are written in one transaction. See [`PortAllocator`] for the retry
//! policy applied when two allocations race on the ledger.

mod allocator;

pub use allocator::PortAllocator;

use crate::error::{PortAllocationError, PortResult};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Closed interval `[min, max]` of allocatable ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    /// Number of ports in the range (0 if inverted).
    pub fn len(&self) -> usize {
        if self.min > self.max {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A port held by a project, as stored in the project's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPort {
    pub port: u16,
    #[serde(default)]
    pub remark: String,
    pub allocated_at: i64,
}

/// Requested remark change for one port.
///
/// `allocated_at` is optional; when supplied it must match the stored value,
/// since the allocation time is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRemark {
    pub port: u16,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub allocated_at: Option<i64>,
}

impl PortRemark {
    pub fn new(port: u16, remark: impl Into<String>) -> Self {
        Self {
            port,
            remark: remark.into(),
            allocated_at: None,
        }
    }
}

/// Allocation state of a project as seen by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectPorts {
    /// No such project.
    Missing,
    /// Project exists and has never been allocated ports.
    Unallocated,
    /// Project holds this snapshot.
    Allocated(Vec<AllocatedPort>),
}

/// Transactional storage the allocator runs against.
///
/// Implementations must provide an atomic `allocate_ports` and a uniqueness
/// guarantee on ledger ports; lost races must surface as a unique-constraint
/// error (see [`crate::error::is_unique_violation`]) so the allocator can retry.
pub trait PortStore: Send + Sync {
    /// Read the project's current allocation state.
    fn project_ports(&self, project_id: &str) -> Result<ProjectPorts>;

    /// In one transaction: pick the `count` lowest free ports in `range`,
    /// insert ledger rows stamped with `allocated_at`, and write the snapshot
    /// onto the project. Nothing is written on failure.
    fn allocate_ports(
        &self,
        project_id: &str,
        count: usize,
        range: PortRange,
        allocated_at: i64,
    ) -> PortResult<Vec<AllocatedPort>>;

    /// In one transaction: read the project's snapshot, apply the remark
    /// changes with [`merge_remarks`], and write it back. Concurrent calls
    /// must compose; none may overwrite another's remarks.
    fn update_port_remarks(
        &self,
        project_id: &str,
        updates: &[PortRemark],
    ) -> PortResult<Vec<AllocatedPort>>;

    /// Ports recorded in the ledger for a project, ascending.
    fn ledger_ports(&self, project_id: &str) -> Result<Vec<u16>>;
}

/// Collect the `count` lowest ports in `range` that are not in `used`.
///
/// Returns `Err(available)` with the number of free ports found when the
/// range cannot satisfy the request.
pub fn pick_free_ports(
    used: &HashSet<u16>,
    range: PortRange,
    count: usize,
) -> std::result::Result<Vec<u16>, usize> {
    let mut free = Vec::with_capacity(count);
    if !range.is_empty() {
        for port in range.min..=range.max {
            if free.len() == count {
                break;
            }
            if !used.contains(&port) {
                free.push(port);
            }
        }
    }

    if free.len() < count {
        Err(free.len())
    } else {
        Ok(free)
    }
}

/// Apply remark changes to a snapshot.
///
/// Every entry is checked before any remark changes, so on error `ports` is
/// left as it was. Ports not named keep their remarks.
pub fn merge_remarks(ports: &mut [AllocatedPort], updates: &[PortRemark]) -> PortResult<()> {
    let index: HashMap<u16, usize> = ports
        .iter()
        .enumerate()
        .map(|(i, p)| (p.port, i))
        .collect();

    for update in updates {
        let Some(&i) = index.get(&update.port) else {
            return Err(PortAllocationError::InvalidPortUpdate { port: update.port });
        };
        if let Some(allocated_at) = update.allocated_at
            && allocated_at != ports[i].allocated_at
        {
            return Err(PortAllocationError::InvalidPortModification { port: update.port });
        }
    }

    for update in updates {
        ports[index[&update.port]].remark = update.remark.clone();
    }
    Ok(())
}
