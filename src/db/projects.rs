//! Project CRUD and AI status tracking.

use super::tasks::{TASK_ORDER_CLAUSE, parse_task_row};
use super::{Database, now_ms};
use crate::error::ApiError;
use crate::ports::AllocatedPort;
use crate::types::{
    AiStatus, AiStatusUpdate, Project, ProjectDetails, ProjectStatus, ProjectUpdate,
    RunningAiProject,
};
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

const PROJECT_SELECT: &str = "SELECT p.*, \
     (SELECT COUNT(*) FROM tasks t WHERE t.project_id = p.id) AS task_count \
     FROM projects p";

/// Decode the JSON port snapshot column.
pub(crate) fn parse_ports_column(
    row: &Row,
    column: &str,
) -> rusqlite::Result<Option<Vec<AllocatedPort>>> {
    let raw: Option<String> = row.get(column)?;
    match raw {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                row.as_ref().column_index(column).unwrap_or(0),
                Type::Text,
                Box::new(e),
            )
        }),
    }
}

pub fn parse_project_row(row: &Row) -> rusqlite::Result<Project> {
    let status: String = row.get("status")?;
    let ai_status: String = row.get("ai_status")?;

    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        cursor_key: row.get("cursor_key")?,
        description: row.get("description")?,
        status: ProjectStatus::from_str(&status).unwrap_or_default(),
        ai_status: AiStatus::from_str(&ai_status).unwrap_or_default(),
        ai_command: row.get("ai_command")?,
        ai_result: row.get("ai_result")?,
        ai_duration: row.get("ai_duration")?,
        ai_started_at: row.get("ai_started_at")?,
        ai_completed_at: row.get("ai_completed_at")?,
        ports: parse_ports_column(row, "ports")?,
        task_count: row.get("task_count")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Internal helper to get a project using an existing connection (avoids deadlock).
fn get_project_internal(conn: &Connection, project_id: &str) -> Result<Option<Project>> {
    let sql = format!("{} WHERE p.id = ?1", PROJECT_SELECT);
    let project = conn
        .query_row(&sql, params![project_id], parse_project_row)
        .optional()?;
    Ok(project)
}

impl Database {
    /// Create a new project. Status defaults to `active`.
    pub fn create_project(
        &self,
        name: &str,
        cursor_key: Option<String>,
        description: Option<String>,
        status: Option<ProjectStatus>,
    ) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::missing_field("name").into());
        }

        let id = Uuid::now_v7().to_string();
        let now = now_ms();
        let status = status.unwrap_or_default();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, cursor_key, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, name, cursor_key, description, status.as_str(), now],
            )?;

            get_project_internal(conn, &id)?
                .ok_or_else(|| anyhow::anyhow!("project {} vanished after insert", id))
        })
    }

    /// Get a project by ID.
    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        self.with_conn(|conn| get_project_internal(conn, project_id))
    }

    /// List all projects, most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let sql = format!("{} ORDER BY p.updated_at DESC, p.id DESC", PROJECT_SELECT);
            let mut stmt = conn.prepare(&sql)?;
            let projects = stmt
                .query_map([], parse_project_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }

    /// Apply a partial update. Returns `None` if the project does not exist.
    pub fn update_project(&self, project_id: &str, update: ProjectUpdate) -> Result<Option<Project>> {
        if let Some(ref name) = update.name
            && name.trim().is_empty()
        {
            return Err(ApiError::invalid_value("name", "name must not be empty").into());
        }

        let now = now_ms();
        self.with_conn(|conn| {
            let Some(existing) = get_project_internal(conn, project_id)? else {
                return Ok(None);
            };

            let name = update.name.map(|n| n.trim().to_string()).unwrap_or(existing.name);
            let cursor_key = update.cursor_key.or(existing.cursor_key);
            let description = update.description.or(existing.description);
            let status = update.status.unwrap_or(existing.status);

            conn.execute(
                "UPDATE projects SET name = ?1, cursor_key = ?2, description = ?3, status = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![name, cursor_key, description, status.as_str(), now, project_id],
            )?;

            get_project_internal(conn, project_id)
        })
    }

    /// Delete a project and its tasks. Allocated ports stay in the ledger.
    pub fn delete_project(&self, project_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
            Ok(deleted > 0)
        })
    }

    /// Get a project with its tasks in display order.
    pub fn get_project_details(&self, project_id: &str) -> Result<Option<ProjectDetails>> {
        self.with_conn(|conn| {
            let Some(project) = get_project_internal(conn, project_id)? else {
                return Ok(None);
            };

            let sql = format!(
                "SELECT * FROM tasks WHERE project_id = ?1 ORDER BY {}",
                TASK_ORDER_CLAUSE
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![project_id], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(ProjectDetails { project, tasks }))
        })
    }

    /// Record an AI status change.
    ///
    /// `running` stamps the start time and clears the completion time; any
    /// other non-idle status stamps the completion time.
    pub fn update_ai_status(&self, project_id: &str, update: AiStatusUpdate) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let mut changed = tx.execute(
                "UPDATE projects SET ai_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![update.status.as_str(), now, project_id],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            if let Some(ref command) = update.command {
                tx.execute(
                    "UPDATE projects SET ai_command = ?1 WHERE id = ?2",
                    params![command, project_id],
                )?;
            }
            if let Some(ref result) = update.result {
                tx.execute(
                    "UPDATE projects SET ai_result = ?1 WHERE id = ?2",
                    params![result, project_id],
                )?;
            }
            if let Some(duration) = update.duration {
                tx.execute(
                    "UPDATE projects SET ai_duration = ?1 WHERE id = ?2",
                    params![duration, project_id],
                )?;
            }

            match update.status {
                AiStatus::Running => {
                    changed = tx.execute(
                        "UPDATE projects SET ai_started_at = ?1, ai_completed_at = NULL WHERE id = ?2",
                        params![now, project_id],
                    )?;
                }
                AiStatus::Idle => {}
                _ => {
                    changed = tx.execute(
                        "UPDATE projects SET ai_completed_at = ?1 WHERE id = ?2",
                        params![now, project_id],
                    )?;
                }
            }

            tx.commit()?;
            Ok(changed > 0)
        })
    }

    /// Mark a project's automation as running.
    pub fn start_ai(&self, project_id: &str) -> Result<bool> {
        self.update_ai_status(
            project_id,
            AiStatusUpdate {
                status: AiStatus::Running,
                command: None,
                result: None,
                duration: None,
            },
        )
    }

    /// Mark a project's automation as finished with `completed`, `aborted` or `error`.
    pub fn stop_ai(&self, project_id: &str, outcome: AiStatus) -> Result<bool> {
        if !outcome.is_stop_outcome() {
            return Err(ApiError::invalid_value(
                "status",
                "stop status must be one of: completed, aborted, error",
            )
            .into());
        }
        self.update_ai_status(
            project_id,
            AiStatusUpdate {
                status: outcome,
                command: None,
                result: None,
                duration: None,
            },
        )
    }

    /// Projects whose automation is currently running.
    pub fn list_running_ai(&self) -> Result<Vec<RunningAiProject>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, ai_status, ai_command, ai_started_at
                 FROM projects WHERE ai_status = 'running'
                 ORDER BY ai_started_at DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let ai_status: String = row.get(2)?;
                    Ok(RunningAiProject {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        ai_status: AiStatus::from_str(&ai_status).unwrap_or_default(),
                        ai_command: row.get(3)?,
                        ai_started_at: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
