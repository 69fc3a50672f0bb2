//! SQLite-backed port ledger and project snapshots.

use super::Database;
use super::projects::parse_ports_column;
use crate::error::{PortAllocationError, PortResult};
use crate::ports::{
    AllocatedPort, PortRange, PortRemark, PortStore, ProjectPorts, merge_remarks, pick_free_ports,
};
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::HashSet;

fn read_project_ports(conn: &Connection, project_id: &str) -> Result<ProjectPorts> {
    let snapshot = conn
        .query_row(
            "SELECT ports FROM projects WHERE id = ?1",
            params![project_id],
            |row| parse_ports_column(row, "ports"),
        )
        .optional()?;

    Ok(match snapshot {
        None => ProjectPorts::Missing,
        Some(None) => ProjectPorts::Unallocated,
        Some(Some(ports)) => ProjectPorts::Allocated(ports),
    })
}

/// Ports already in the ledger that fall inside `range`.
fn used_ports_in_range(conn: &Connection, range: PortRange) -> Result<HashSet<u16>> {
    let mut stmt =
        conn.prepare("SELECT port FROM port_allocations WHERE port BETWEEN ?1 AND ?2")?;
    let used = stmt
        .query_map(params![range.min, range.max], |row| row.get::<_, u16>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(used)
}

impl PortStore for Database {
    fn project_ports(&self, project_id: &str) -> Result<ProjectPorts> {
        self.with_conn(|conn| read_project_ports(conn, project_id))
    }

    fn allocate_ports(
        &self,
        project_id: &str,
        count: usize,
        range: PortRange,
        allocated_at: i64,
    ) -> PortResult<Vec<AllocatedPort>> {
        let ports = self.with_conn_mut(|conn| {
            // IMMEDIATE takes the write lock up front so the free-port scan
            // and the inserts see the same ledger.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let used = used_ports_in_range(&tx, range)?;
            let picked = pick_free_ports(&used, range, count).map_err(|available| {
                PortAllocationError::InsufficientPorts {
                    requested: count,
                    available,
                }
            })?;

            {
                let mut insert = tx.prepare(
                    "INSERT INTO port_allocations (port, project_id, allocated_at) VALUES (?1, ?2, ?3)",
                )?;
                for port in &picked {
                    insert
                        .execute(params![port, project_id, allocated_at])
                        .with_context(|| format!("recording port {} in ledger", port))?;
                }
            }

            let ports: Vec<AllocatedPort> = picked
                .into_iter()
                .map(|port| AllocatedPort {
                    port,
                    remark: String::new(),
                    allocated_at,
                })
                .collect();
            let snapshot = serde_json::to_string(&ports)?;

            let updated = tx.execute(
                "UPDATE projects SET ports = ?1, updated_at = ?2 WHERE id = ?3 AND ports IS NULL",
                params![snapshot, allocated_at, project_id],
            )?;
            if updated == 0 {
                // Dropping tx rolls back the ledger rows.
                return Err(match read_project_ports(&tx, project_id)? {
                    ProjectPorts::Missing => PortAllocationError::ProjectNotFound {
                        project_id: project_id.to_string(),
                    },
                    _ => PortAllocationError::AlreadyAllocated {
                        project_id: project_id.to_string(),
                    },
                }
                .into());
            }

            tx.commit()?;
            Ok(ports)
        })?;

        Ok(ports)
    }

    fn update_port_remarks(
        &self,
        project_id: &str,
        updates: &[PortRemark],
    ) -> PortResult<Vec<AllocatedPort>> {
        let ports = self.with_conn_mut(|conn| {
            // The read and the rewrite must sit under one write lock or a
            // concurrent update to another port is lost.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut ports = match read_project_ports(&tx, project_id)? {
                ProjectPorts::Allocated(ports) if !ports.is_empty() => ports,
                _ => {
                    return Err(PortAllocationError::NoPortsAllocated {
                        project_id: project_id.to_string(),
                    }
                    .into());
                }
            };
            merge_remarks(&mut ports, updates)?;

            let snapshot = serde_json::to_string(&ports)?;
            tx.execute(
                "UPDATE projects SET ports = ?1, updated_at = ?2 WHERE id = ?3",
                params![snapshot, super::now_ms(), project_id],
            )?;

            tx.commit()?;
            Ok(ports)
        })?;

        Ok(ports)
    }

    fn ledger_ports(&self, project_id: &str) -> Result<Vec<u16>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT port FROM port_allocations WHERE project_id = ?1 ORDER BY port ASC",
            )?;
            let ports = stmt
                .query_map(params![project_id], |row| row.get::<_, u16>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ports)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_unique_violation;

    fn setup_db() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let project = db.create_project("demo", None, None, None).unwrap();
        (db, project.id)
    }

    #[test]
    fn test_allocate_writes_ledger_and_snapshot() {
        let (db, id) = setup_db();
        let ports = db
            .allocate_ports(&id, 3, PortRange::new(1000, 1009), 42)
            .unwrap();

        let numbers: Vec<u16> = ports.iter().map(|p| p.port).collect();
        assert_eq!(numbers, vec![1000, 1001, 1002]);
        assert!(ports.iter().all(|p| p.remark.is_empty() && p.allocated_at == 42));

        assert_eq!(db.ledger_ports(&id).unwrap(), numbers);
        assert_eq!(db.project_ports(&id).unwrap(), ProjectPorts::Allocated(ports));
    }

    #[test]
    fn test_unknown_project_rolls_back_ledger() {
        let (db, _) = setup_db();
        let err = db
            .allocate_ports("missing", 2, PortRange::new(1000, 1009), 1)
            .unwrap_err();
        assert!(matches!(err, PortAllocationError::ProjectNotFound { .. }));
        assert!(db.ledger_ports("missing").unwrap().is_empty());
        assert_eq!(db.project_ports("missing").unwrap(), ProjectPorts::Missing);
    }

    #[test]
    fn test_second_allocation_rejected_without_new_rows() {
        let (db, id) = setup_db();
        db.allocate_ports(&id, 2, PortRange::new(1000, 1009), 1).unwrap();

        let err = db
            .allocate_ports(&id, 2, PortRange::new(1000, 1009), 2)
            .unwrap_err();
        assert!(matches!(err, PortAllocationError::AlreadyAllocated { .. }));
        assert_eq!(db.ledger_ports(&id).unwrap(), vec![1000, 1001]);
    }

    #[test]
    fn test_insufficient_reports_available() {
        let (db, id) = setup_db();
        let err = db
            .allocate_ports(&id, 4, PortRange::new(1000, 1002), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            PortAllocationError::InsufficientPorts {
                requested: 4,
                available: 3
            }
        ));
        assert_eq!(db.project_ports(&id).unwrap(), ProjectPorts::Unallocated);
    }

    #[test]
    fn test_ledger_rejects_duplicate_port() {
        let (db, id) = setup_db();
        db.allocate_ports(&id, 1, PortRange::new(1000, 1000), 1).unwrap();

        let err = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO port_allocations (port, project_id, allocated_at) VALUES (1000, 'other', 2)",
                    [],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn test_remarks_need_allocated_project() {
        let (db, id) = setup_db();
        for project_id in [id.as_str(), "missing"] {
            let err = db
                .update_port_remarks(project_id, &[PortRemark::new(1000, "web")])
                .unwrap_err();
            assert!(matches!(err, PortAllocationError::NoPortsAllocated { .. }));
        }
    }

    #[test]
    fn test_remarks_rewrite_snapshot_in_place() {
        let (db, id) = setup_db();
        db.allocate_ports(&id, 2, PortRange::new(1000, 1009), 5).unwrap();

        db.update_port_remarks(&id, &[PortRemark::new(1001, "api")])
            .unwrap();
        let ports = db
            .update_port_remarks(&id, &[PortRemark::new(1000, "web")])
            .unwrap();

        let remarks: Vec<&str> = ports.iter().map(|p| p.remark.as_str()).collect();
        assert_eq!(remarks, vec!["web", "api"]);
        assert_eq!(db.project_ports(&id).unwrap(), ProjectPorts::Allocated(ports));
        assert_eq!(db.ledger_ports(&id).unwrap(), vec![1000, 1001]);
    }

    #[test]
    fn test_rejected_remarks_leave_snapshot() {
        let (db, id) = setup_db();
        let before = db
            .allocate_ports(&id, 2, PortRange::new(1000, 1009), 5)
            .unwrap();

        let err = db
            .update_port_remarks(
                &id,
                &[PortRemark::new(1000, "web"), PortRemark::new(2000, "x")],
            )
            .unwrap_err();
        assert!(matches!(err, PortAllocationError::InvalidPortUpdate { port: 2000 }));
        assert_eq!(db.project_ports(&id).unwrap(), ProjectPorts::Allocated(before));
    }
}
