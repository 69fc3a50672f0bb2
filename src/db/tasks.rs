//! Task CRUD and ordering.

use super::{Database, now_ms};
use crate::error::ApiError;
use crate::types::{
    ActiveTask, PRIORITY_DEFAULT, Priority, Task, TaskStatus, TaskUpdate, clamp_priority,
};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

/// Display order: priority first, then manual order, newest last among equals.
pub(crate) const TASK_ORDER_CLAUSE: &str =
    "priority ASC, sort_order IS NULL, sort_order ASC, created_at DESC";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;

    Ok(Task {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        status: TaskStatus::from_str(&status).unwrap_or_default(),
        priority: row.get("priority")?,
        order: row.get("sort_order")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

fn project_exists(conn: &Connection, project_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM projects WHERE id = ?1",
            params![project_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

impl Database {
    /// Create a task. Priority defaults to 3 and is clamped into 1..=5.
    pub fn create_task(
        &self,
        project_id: &str,
        title: &str,
        priority: Option<Priority>,
    ) -> Result<Task> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ApiError::missing_field("title").into());
        }

        let id = Uuid::now_v7().to_string();
        let now = now_ms();
        let priority = clamp_priority(priority.unwrap_or(PRIORITY_DEFAULT));

        self.with_conn(|conn| {
            if !project_exists(conn, project_id)? {
                return Err(ApiError::project_not_found(project_id).into());
            }

            conn.execute(
                "INSERT INTO tasks (id, project_id, title, status, priority, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id,
                    project_id,
                    title,
                    TaskStatus::Pending.as_str(),
                    priority,
                    now
                ],
            )?;
            conn.execute(
                "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
                params![now, project_id],
            )?;

            get_task_internal(conn, &id)?
                .ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", id))
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// List a project's tasks in display order.
    pub fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT * FROM tasks WHERE project_id = ?1 ORDER BY {}",
                TASK_ORDER_CLAUSE
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params![project_id], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Apply a partial update. Returns `None` if the task does not exist.
    pub fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        if let Some(ref title) = update.title
            && title.trim().is_empty()
        {
            return Err(ApiError::invalid_value("title", "title must not be empty").into());
        }

        let now = now_ms();
        self.with_conn(|conn| {
            let Some(existing) = get_task_internal(conn, task_id)? else {
                return Ok(None);
            };

            let title = update
                .title
                .map(|t| t.trim().to_string())
                .unwrap_or(existing.title);
            let status = update.status.unwrap_or(existing.status);
            let priority = update.priority.map(clamp_priority).unwrap_or(existing.priority);
            let order = update.order.or(existing.order);

            conn.execute(
                "UPDATE tasks SET title = ?1, status = ?2, priority = ?3, sort_order = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![title, status.as_str(), priority, order, now, task_id],
            )?;
            conn.execute(
                "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
                params![now, existing.project_id],
            )?;

            get_task_internal(conn, task_id)
        })
    }

    /// Delete a task.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            Ok(deleted > 0)
        })
    }

    /// Set a task's manual order.
    pub fn set_task_order(&self, task_id: &str, order: i64) -> Result<Option<Task>> {
        self.update_task(
            task_id,
            TaskUpdate {
                order: Some(order),
                ..TaskUpdate::default()
            },
        )
    }

    /// Unfinished tasks across all projects, with their project names.
    pub fn list_active_tasks(&self) -> Result<Vec<ActiveTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.*, p.name AS project_name
                 FROM tasks t JOIN projects p ON p.id = t.project_id
                 WHERE t.status != 'completed'
                 ORDER BY t.priority ASC, t.sort_order IS NULL, t.sort_order ASC, t.created_at DESC",
            )?;
            let tasks = stmt
                .query_map([], |row| {
                    Ok(ActiveTask {
                        task: parse_task_row(row)?,
                        project_name: row.get("project_name")?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Give every unordered task an order after the project's current maximum.
    ///
    /// Within a project, tasks are numbered by priority then creation time.
    /// Returns the number of tasks updated.
    pub fn backfill_task_orders(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let pending: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, project_id FROM tasks WHERE sort_order IS NULL
                     ORDER BY project_id, priority ASC, created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut current_project: Option<String> = None;
            let mut next_order = 0i64;
            for (task_id, project_id) in &pending {
                if current_project.as_deref() != Some(project_id.as_str()) {
                    let max: Option<i64> = tx.query_row(
                        "SELECT MAX(sort_order) FROM tasks WHERE project_id = ?1",
                        params![project_id],
                        |row| row.get(0),
                    )?;
                    next_order = max.map_or(1, |m| m + 1);
                    current_project = Some(project_id.clone());
                }

                tx.execute(
                    "UPDATE tasks SET sort_order = ?1 WHERE id = ?2",
                    params![next_order, task_id],
                )?;
                next_order += 1;
            }

            tx.commit()?;
            info!(updated = pending.len(), "backfilled task orders");
            Ok(pending.len())
        })
    }
}
