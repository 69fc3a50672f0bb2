//! Core types for projects and tasks.

use crate::ports::AllocatedPort;
use serde::{Deserialize, Serialize};

/// Task priority, 1 (highest) to 5 (lowest).
pub type Priority = i32;

pub const PRIORITY_HIGHEST: Priority = 1;
pub const PRIORITY_DEFAULT: Priority = 3;
pub const PRIORITY_LOWEST: Priority = 5;

/// Clamp a priority into the supported 1..=5 range.
pub fn clamp_priority(p: Priority) -> Priority {
    p.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST)
}

/// Visibility of a project in the project list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Hidden,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Hidden => "hidden",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProjectStatus::Active),
            "hidden" => Some(ProjectStatus::Hidden),
            _ => None,
        }
    }
}

/// Status of the AI automation attached to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    #[default]
    Idle,
    Active,
    Running,
    Success,
    Failed,
    Warning,
    Completed,
    Aborted,
    Error,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::Idle => "idle",
            AiStatus::Active => "active",
            AiStatus::Running => "running",
            AiStatus::Success => "success",
            AiStatus::Failed => "failed",
            AiStatus::Warning => "warning",
            AiStatus::Completed => "completed",
            AiStatus::Aborted => "aborted",
            AiStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AiStatus::Idle),
            "active" => Some(AiStatus::Active),
            "running" => Some(AiStatus::Running),
            "success" => Some(AiStatus::Success),
            "failed" => Some(AiStatus::Failed),
            "warning" => Some(AiStatus::Warning),
            "completed" => Some(AiStatus::Completed),
            "aborted" => Some(AiStatus::Aborted),
            "error" => Some(AiStatus::Error),
            _ => None,
        }
    }

    /// Terminal outcomes accepted when stopping a run.
    pub fn is_stop_outcome(&self) -> bool {
        matches!(self, AiStatus::Completed | AiStatus::Aborted | AiStatus::Error)
    }
}

/// Progress state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

/// A project with its AI status and port snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub cursor_key: Option<String>,
    pub description: Option<String>,
    pub status: ProjectStatus,

    pub ai_status: AiStatus,
    pub ai_command: Option<String>,
    pub ai_result: Option<String>,
    pub ai_duration: Option<i64>,
    pub ai_started_at: Option<i64>,
    pub ai_completed_at: Option<i64>,

    /// `None` until ports have been allocated.
    pub ports: Option<Vec<AllocatedPort>>,
    pub task_count: i64,

    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial project update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub cursor_key: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
}

/// AI status change reported by an automation runner.
#[derive(Debug, Clone, Deserialize)]
pub struct AiStatusUpdate {
    pub status: AiStatus,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
}

/// Summary row for projects whose automation is currently running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningAiProject {
    pub id: String,
    pub name: String,
    pub ai_status: AiStatus,
    pub ai_command: Option<String>,
    pub ai_started_at: Option<i64>,
}

/// A project together with its tasks in display order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDetails {
    #[serde(flatten)]
    pub project: Project,
    pub tasks: Vec<Task>,
}

/// A task belonging to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub order: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial task update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub order: Option<i64>,
}

/// An unfinished task with the name of its project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTask {
    #[serde(flatten)]
    pub task: Task,
    pub project_name: String,
}
