//! Allocation policy on top of a [`PortStore`].

use super::{AllocatedPort, PortRemark, PortStore, ProjectPorts};
use crate::config::PortConfig;
use crate::db::now_ms;
use crate::error::{PortAllocationError, PortResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hands out port ranges to projects.
///
/// Validation happens before any write. The store performs the pick and both
/// writes in one transaction; if that transaction loses a race on the ledger
/// the allocator waits `retry_delay_ms` and tries again, up to `max_retries`
/// extra attempts.
///
/// Store calls are synchronous SQLite calls. Under contention one can block
/// the calling thread for up to the connection's busy timeout (5 s), so
/// async callers on a busy server should expect that latency.
#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<dyn PortStore>,
    config: PortConfig,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn PortStore>, config: PortConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Allocate `count` ports to a project that holds none yet.
    ///
    /// Returns the new snapshot: ascending ports, empty remarks, one shared
    /// `allocated_at`.
    pub async fn allocate(&self, project_id: &str, count: i64) -> PortResult<Vec<AllocatedPort>> {
        if count <= 0 {
            return Err(PortAllocationError::InvalidCount { count });
        }
        if count > i64::from(self.config.max_per_project) {
            return Err(PortAllocationError::ExceedsMaxPerProject {
                requested: count,
                max: self.config.max_per_project,
            });
        }
        let count = count as usize;

        match self.store.project_ports(project_id)? {
            ProjectPorts::Missing => {
                return Err(PortAllocationError::ProjectNotFound {
                    project_id: project_id.to_string(),
                });
            }
            ProjectPorts::Allocated(_) => {
                return Err(PortAllocationError::AlreadyAllocated {
                    project_id: project_id.to_string(),
                });
            }
            ProjectPorts::Unallocated => {}
        }

        let range = self.config.range();
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 1;
        loop {
            match self
                .store
                .allocate_ports(project_id, count, range, now_ms())
            {
                Ok(ports) => {
                    info!(
                        project_id,
                        count,
                        first = ports.first().map(|p| p.port),
                        last = ports.last().map(|p| p.port),
                        "allocated ports"
                    );
                    return Ok(ports);
                }
                Err(err) if err.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!(project_id, attempts = attempt, "port allocation retries exhausted");
                        return Err(PortAllocationError::AllocationFailed {
                            attempts: attempt,
                            source: match err {
                                PortAllocationError::Store(source) => source,
                                other => other.into(),
                            },
                        });
                    }
                    warn!(
                        project_id,
                        attempt,
                        delay_ms = self.config.retry_delay_ms,
                        error = %err,
                        "port allocation conflict, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Allocate the configured default number of ports.
    pub async fn allocate_default(&self, project_id: &str) -> PortResult<Vec<AllocatedPort>> {
        self.allocate(project_id, i64::from(self.config.default_count))
            .await
    }

    /// The project's snapshot, or `None` if it has never been allocated.
    pub fn get_allocated_ports(&self, project_id: &str) -> PortResult<Option<Vec<AllocatedPort>>> {
        match self.store.project_ports(project_id)? {
            ProjectPorts::Missing => Err(PortAllocationError::ProjectNotFound {
                project_id: project_id.to_string(),
            }),
            ProjectPorts::Unallocated => Ok(None),
            ProjectPorts::Allocated(ports) => Ok(Some(ports)),
        }
    }

    /// Change remarks on ports the project already holds.
    ///
    /// The store reads, checks and rewrites the snapshot in one transaction,
    /// so a bad entry leaves it untouched and concurrent updates to different
    /// ports both land. Ports not named keep their remarks.
    pub fn update_remarks(
        &self,
        project_id: &str,
        updates: &[PortRemark],
    ) -> PortResult<Vec<AllocatedPort>> {
        let ports = self.store.update_port_remarks(project_id, updates)?;
        debug!(project_id, updated = updates.len(), "updated port remarks");
        Ok(ports)
    }

    /// Whether the project's snapshot names exactly the ports the ledger
    /// records for it.
    pub fn check_consistency(&self, project_id: &str) -> PortResult<bool> {
        let mut ledger = self.store.ledger_ports(project_id)?;
        ledger.sort_unstable();

        let mut snapshot: Vec<u16> = match self.store.project_ports(project_id)? {
            ProjectPorts::Allocated(ports) => ports.iter().map(|p| p.port).collect(),
            _ => Vec::new(),
        };
        snapshot.sort_unstable();

        Ok(ledger == snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ports::PortRange;
    use anyhow::Result;
    use rusqlite::ffi;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> PortConfig {
        PortConfig {
            min_port: 1000,
            max_port: 1009,
            default_count: 3,
            max_per_project: 5,
            max_retries: 2,
            retry_delay_ms: 1,
        }
    }

    fn setup() -> (Database, PortAllocator, String) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("demo", None, None, None).unwrap();
        let allocator = PortAllocator::new(Arc::new(db.clone()), test_config());
        (db, allocator, project.id)
    }

    fn unique_violation() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: ffi::SQLITE_CONSTRAINT_PRIMARYKEY,
            },
            None,
        )
        .into()
    }

    /// Fails the first `failures` allocation attempts, then delegates.
    struct FlakyStore {
        inner: Database,
        failures: u32,
        retryable: bool,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: Database, failures: u32, retryable: bool) -> Self {
            Self {
                inner,
                failures,
                retryable,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl PortStore for FlakyStore {
        fn project_ports(&self, project_id: &str) -> Result<ProjectPorts> {
            self.inner.project_ports(project_id)
        }

        fn allocate_ports(
            &self,
            project_id: &str,
            count: usize,
            range: PortRange,
            allocated_at: i64,
        ) -> PortResult<Vec<AllocatedPort>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.retryable {
                    PortAllocationError::Store(unique_violation())
                } else {
                    PortAllocationError::Store(anyhow::anyhow!("disk I/O error"))
                });
            }
            self.inner
                .allocate_ports(project_id, count, range, allocated_at)
        }

        fn update_port_remarks(
            &self,
            project_id: &str,
            updates: &[PortRemark],
        ) -> PortResult<Vec<AllocatedPort>> {
            self.inner.update_port_remarks(project_id, updates)
        }

        fn ledger_ports(&self, project_id: &str) -> Result<Vec<u16>> {
            self.inner.ledger_ports(project_id)
        }
    }

    #[tokio::test]
    async fn test_allocate_lowest_ports() {
        let (_db, allocator, id) = setup();
        let ports = allocator.allocate(&id, 3).await.unwrap();
        let numbers: Vec<u16> = ports.iter().map(|p| p.port).collect();
        assert_eq!(numbers, vec![1000, 1001, 1002]);
        assert!(ports.iter().all(|p| p.allocated_at == ports[0].allocated_at));
        assert!(allocator.check_consistency(&id).unwrap());
    }

    #[tokio::test]
    async fn test_count_validation_precedes_store() {
        let (db, allocator, id) = setup();

        for count in [0, -1] {
            let err = allocator.allocate(&id, count).await.unwrap_err();
            assert!(matches!(err, PortAllocationError::InvalidCount { .. }));
        }
        let err = allocator.allocate(&id, 6).await.unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::ExceedsMaxPerProject {
                requested: 6,
                max: 5
            }
        ));

        // Invalid count wins over a missing project.
        let err = allocator.allocate("missing", 0).await.unwrap_err();
        assert!(matches!(err, PortAllocationError::InvalidCount { .. }));

        assert!(db.ledger_ports(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_project_and_double_allocation() {
        let (_db, allocator, id) = setup();

        let err = allocator.allocate("missing", 2).await.unwrap_err();
        assert!(matches!(err, PortAllocationError::ProjectNotFound { .. }));

        allocator.allocate(&id, 2).await.unwrap();
        let err = allocator.allocate(&id, 1).await.unwrap_err();
        assert!(matches!(err, PortAllocationError::AlreadyAllocated { .. }));
    }

    #[tokio::test]
    async fn test_allocate_default_uses_configured_count() {
        let (_db, allocator, id) = setup();
        let ports = allocator.allocate_default(&id).await.unwrap();
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn test_retries_after_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_project("demo", None, None, None).unwrap().id;
        let store = Arc::new(FlakyStore::new(db.clone(), 2, true));
        let allocator = PortAllocator::new(store.clone(), test_config());

        let ports = allocator.allocate(&id, 2).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(allocator.check_consistency(&id).unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_allocation_failed() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_project("demo", None, None, None).unwrap().id;
        let store = Arc::new(FlakyStore::new(db.clone(), u32::MAX, true));
        let allocator = PortAllocator::new(store.clone(), test_config());

        let err = allocator.allocate(&id, 2).await.unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::AllocationFailed { attempts: 3, .. }
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(db.ledger_ports(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_store_errors_not_retried() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_project("demo", None, None, None).unwrap().id;
        let store = Arc::new(FlakyStore::new(db, 1, false));
        let allocator = PortAllocator::new(store.clone(), test_config());

        let err = allocator.allocate(&id, 2).await.unwrap_err();
        assert!(matches!(err, PortAllocationError::Store(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_update_remarks_merges_into_snapshot() {
        let (_db, allocator, id) = setup();
        allocator.allocate(&id, 3).await.unwrap();

        allocator
            .update_remarks(&id, &[PortRemark::new(1000, "web")])
            .unwrap();
        let ports = allocator
            .update_remarks(&id, &[PortRemark::new(1002, "db")])
            .unwrap();

        let remarks: Vec<&str> = ports.iter().map(|p| p.remark.as_str()).collect();
        assert_eq!(remarks, vec!["web", "", "db"]);
        assert_eq!(allocator.get_allocated_ports(&id).unwrap(), Some(ports));
    }

    #[tokio::test]
    async fn test_update_remarks_rejects_foreign_port_atomically() {
        let (_db, allocator, id) = setup();
        allocator.allocate(&id, 2).await.unwrap();

        let err = allocator
            .update_remarks(
                &id,
                &[PortRemark::new(1000, "web"), PortRemark::new(9999, "x")],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::InvalidPortUpdate { port: 9999 }
        ));

        let ports = allocator.get_allocated_ports(&id).unwrap().unwrap();
        assert!(ports.iter().all(|p| p.remark.is_empty()));
    }

    #[tokio::test]
    async fn test_update_remarks_rejects_changed_allocated_at() {
        let (_db, allocator, id) = setup();
        let ports = allocator.allocate(&id, 1).await.unwrap();

        let mut remark = PortRemark::new(1000, "web");
        remark.allocated_at = Some(ports[0].allocated_at + 1);
        let err = allocator.update_remarks(&id, &[remark]).unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::InvalidPortModification { port: 1000 }
        ));

        let mut remark = PortRemark::new(1000, "web");
        remark.allocated_at = Some(ports[0].allocated_at);
        assert!(allocator.update_remarks(&id, &[remark]).is_ok());
    }

    #[test]
    fn test_update_remarks_without_allocation() {
        let (_db, allocator, id) = setup();
        let err = allocator
            .update_remarks(&id, &[PortRemark::new(1000, "web")])
            .unwrap_err();
        assert!(matches!(err, PortAllocationError::NoPortsAllocated { .. }));

        let err = allocator
            .update_remarks("missing", &[PortRemark::new(1000, "web")])
            .unwrap_err();
        assert!(matches!(err, PortAllocationError::NoPortsAllocated { .. }));

        assert_eq!(allocator.get_allocated_ports(&id).unwrap(), None);
        assert!(matches!(
            allocator.get_allocated_ports("missing").unwrap_err(),
            PortAllocationError::ProjectNotFound { .. }
        ));
    }

    /// Delegates to a database but stalls every snapshot read.
    struct SlowReadStore {
        inner: Database,
    }

    impl PortStore for SlowReadStore {
        fn project_ports(&self, project_id: &str) -> Result<ProjectPorts> {
            std::thread::sleep(Duration::from_millis(50));
            self.inner.project_ports(project_id)
        }

        fn allocate_ports(
            &self,
            project_id: &str,
            count: usize,
            range: PortRange,
            allocated_at: i64,
        ) -> PortResult<Vec<AllocatedPort>> {
            self.inner
                .allocate_ports(project_id, count, range, allocated_at)
        }

        fn update_port_remarks(
            &self,
            project_id: &str,
            updates: &[PortRemark],
        ) -> PortResult<Vec<AllocatedPort>> {
            self.inner.update_port_remarks(project_id, updates)
        }

        fn ledger_ports(&self, project_id: &str) -> Result<Vec<u16>> {
            self.inner.ledger_ports(project_id)
        }
    }

    #[test]
    fn test_overlapping_remark_updates_both_land() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_project("demo", None, None, None).unwrap().id;
        db.allocate_ports(&id, 2, PortRange::new(1000, 1009), 1).unwrap();
        let allocator = PortAllocator::new(
            Arc::new(SlowReadStore { inner: db.clone() }),
            test_config(),
        );

        std::thread::scope(|scope| {
            for (port, remark) in [(1000, "web"), (1001, "api")] {
                let allocator = &allocator;
                let id = &id;
                scope.spawn(move || {
                    allocator
                        .update_remarks(id, &[PortRemark::new(port, remark)])
                        .unwrap();
                });
            }
        });

        let ports = allocator.get_allocated_ports(&id).unwrap().unwrap();
        let remarks: Vec<&str> = ports.iter().map(|p| p.remark.as_str()).collect();
        assert_eq!(remarks, vec!["web", "api"]);
    }
}
