//! Projects with their phases, tasks, members and documents.
//!
//! Progress is a roll-up of task completion and is recomputed in the same
//! transaction as any task mutation.

use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::auth::Permission;
use crate::db::{like_pattern, now, parse_column};
use crate::error::{AppError, AppResult};
use crate::users::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Active,
    OnHold,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 5] = [
        ProjectStatus::Draft,
        ProjectStatus::Active,
        ProjectStatus::OnHold,
        ProjectStatus::Completed,
        ProjectStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Archived => "archived",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProjectStatus::Draft => "Draft",
            ProjectStatus::Active => "Active",
            ProjectStatus::OnHold => "On Hold",
            ProjectStatus::Completed => "Completed",
            ProjectStatus::Archived => "Archived",
        }
    }

    /// Statuses reachable from this one.
    pub fn allowed_next(self) -> &'static [ProjectStatus] {
        use ProjectStatus::*;

        match self {
            Draft => &[Active, Archived],
            Active => &[OnHold, Completed],
            OnHold => &[Active, Archived],
            Completed => &[Active, Archived],
            Archived => &[],
        }
    }

    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| AppError::validation(format!("Unknown project status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 3] = [TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Done];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Todo => "To do",
            TaskStatus::InProgress => "In progress",
            TaskStatus::Done => "Done",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| AppError::validation(format!("Unknown task status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Lead,
    Member,
    Viewer,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberRole::Lead => "lead",
            MemberRole::Member => "member",
            MemberRole::Viewer => "viewer",
        }
    }
}

impl FromStr for MemberRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "lead" => Ok(MemberRole::Lead),
            "member" => Ok(MemberRole::Member),
            "viewer" => Ok(MemberRole::Viewer),
            other => Err(AppError::validation(format!("Unknown member role '{other}'"))),
        }
    }
}

/// A project with its owner's name and task counts
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    /// Row id
    pub id: i64,

    /// `PRJ-YYYY-NNN`, numbered per creation year
    pub code: String,

    pub name: String,
    pub description: String,

    /// Current lifecycle status
    pub status: ProjectStatus,

    /// The owner is always a `lead` member
    pub owner_id: i64,
    pub owner_name: String,

    /// Planned dates, `YYYY-MM-DD`; the end is never before the start
    pub start_date: Option<String>,
    pub end_date: Option<String>,

    /// Percentage of tasks done, 0-100
    pub progress: i64,

    pub created_at: String,
    pub updated_at: String,

    /// Number of tasks, and how many of them are done
    pub task_count: i64,
    pub done_count: i64,
}

/// A named group of tasks with its own progress.
#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub position: i64,
    pub progress: i64,
    pub task_count: i64,
}

/// A unit of work, optionally in a phase and assigned to a member.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub project_code: String,
    pub phase_id: Option<i64>,
    pub phase_name: Option<String>,
    pub title: String,
    pub assignee_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub role: MemberRole,
}

/// Metadata of an uploaded file
///
/// The bytes live in the upload directory under `stored_name`.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// Row id
    pub id: i64,

    /// Owning project
    pub project_id: i64,

    /// Original (sanitized) file name, used for downloads
    pub file_name: String,

    /// UUID name on disk
    pub stored_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_by: i64,
    pub uploaded_by_name: String,
    pub uploaded_at: String,
}

/// Fields of the create and edit forms
#[derive(Debug, Clone, Default)]
pub struct ProjectInput {
    pub name: String,
    pub description: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Defaults to the acting user on create.
    pub owner_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub phase_id: Option<i64>,
    pub assignee_id: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_name: String,
    pub stored_name: String,
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub q: Option<String>,
    /// Only projects this user owns or is a member of.
    pub member_of: Option<i64>,
}

/// Rounded percentage of completed tasks; 0 when there are none.
pub fn progress_percent(done: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    (done * 100 + total / 2) / total
}

/// `PRJ-YYYY-NNN`.
pub fn format_project_code(year: i32, seq: i64) -> String {
    format!("PRJ-{year}-{seq:03}")
}

fn next_project_code(tx: &Transaction<'_>, year: i32) -> AppResult<String> {
    let prefix = format!("PRJ-{year}-");
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(CAST(substr(code, ?2) AS INTEGER)) FROM projects \
         WHERE substr(code, 1, ?3) = ?1",
        params![prefix, prefix.len() as i64 + 1, prefix.len() as i64],
        |row| row.get(0),
    )?;
    Ok(format_project_code(year, last.unwrap_or(0) + 1))
}

const PROJECT_SELECT: &str = "SELECT p.id, p.code, p.name, p.description, p.status, p.owner_id, \
     COALESCE(u.full_name, ''), p.start_date, p.end_date, p.progress, p.created_at, p.updated_at, \
     (SELECT COUNT(*) FROM project_tasks t WHERE t.project_id = p.id), \
     (SELECT COUNT(*) FROM project_tasks t WHERE t.project_id = p.id AND t.status = 'done') \
     FROM projects p LEFT JOIN users u ON u.id = p.owner_id";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        status: parse_column(row, 4)?,
        owner_id: row.get(5)?,
        owner_name: row.get(6)?,
        start_date: row.get(7)?,
        end_date: row.get(8)?,
        progress: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        task_count: row.get(12)?,
        done_count: row.get(13)?,
    })
}

const TASK_SELECT: &str = "SELECT t.id, t.project_id, p.code, t.phase_id, ph.name, t.title, \
     t.assignee_id, u.full_name, t.status, t.due_date, t.created_at, t.completed_at \
     FROM project_tasks t JOIN projects p ON p.id = t.project_id \
     LEFT JOIN project_phases ph ON ph.id = t.phase_id \
     LEFT JOIN users u ON u.id = t.assignee_id";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        project_code: row.get(2)?,
        phase_id: row.get(3)?,
        phase_name: row.get(4)?,
        title: row.get(5)?,
        assignee_id: row.get(6)?,
        assignee_name: row.get(7)?,
        status: parse_column(row, 8)?,
        due_date: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn validate_input(input: &ProjectInput) -> AppResult<()> {
    if input.name.trim().is_empty() {
        return Err(AppError::validation("Project name is required"));
    }
    if let (Some(start), Some(end)) = (input.start_date, input.end_date) {
        if end < start {
            return Err(AppError::validation("End date cannot be before the start date"));
        }
    }
    Ok(())
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn member_role(conn: &Connection, project_id: i64, user_id: i64) -> AppResult<Option<MemberRole>> {
    Ok(conn
        .query_row(
            "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
            params![project_id, user_id],
            |row| parse_column(row, 0),
        )
        .optional()?)
}

/// Users with ManageProjects, or the project's leads, manage a project.
pub fn can_manage(conn: &Connection, user: &User, project: &Project) -> AppResult<bool> {
    if user.can(Permission::ManageProjects) || project.owner_id == user.id {
        return Ok(true);
    }
    Ok(member_role(conn, project.id, user.id)? == Some(MemberRole::Lead))
}

pub fn is_member(conn: &Connection, project_id: i64, user_id: i64) -> AppResult<bool> {
    Ok(member_role(conn, project_id, user_id)?.is_some())
}

fn ensure_manager(conn: &Connection, user: &User, project: &Project) -> AppResult<()> {
    if can_manage(conn, user, project)? {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn ensure_not_archived(project: &Project) -> AppResult<()> {
    if project.status == ProjectStatus::Archived {
        return Err(AppError::conflict("Archived projects are read-only"));
    }
    Ok(())
}

fn require_view(user: &User) -> AppResult<()> {
    if user.can(Permission::ViewProjects) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn ensure_active_owner(conn: &Connection, owner_id: i64) -> AppResult<()> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM users WHERE id = ?1", [owner_id], |row| row.get(0))
        .optional()?;
    if status.as_deref() != Some("active") {
        return Err(AppError::validation("The owner must be an active user"));
    }
    Ok(())
}

/// Create a project
///
/// Assigns the next code for the current year and adds the owner as `lead`.
///
/// # Arguments
/// * `conn` - Open database connection
/// * `actor` - The creating user (needs `ManageProjects`)
/// * `input` - Form fields; a missing owner defaults to `actor`
///
/// # Returns
/// * `AppResult<i64>` - The new project id
///
/// # Errors
/// * `Forbidden` without `ManageProjects`
/// * `Validation` for an empty name, an end date before the start date, or an
///   owner who is not an active user
pub fn create_project(conn: &Connection, actor: &User, input: &ProjectInput) -> AppResult<i64> {
    if !actor.can(Permission::ManageProjects) {
        return Err(AppError::Forbidden);
    }
    validate_input(input)?;
    let owner_id = input.owner_id.unwrap_or(actor.id);

    let tx = conn.unchecked_transaction()?;
    ensure_active_owner(&tx, owner_id)?;

    let code = next_project_code(&tx, Utc::now().year())?;
    let ts = now();
    tx.execute(
        "INSERT INTO projects (code, name, description, status, owner_id, start_date, end_date, \
         progress, created_at, updated_at) VALUES (?1, ?2, ?3, 'draft', ?4, ?5, ?6, 0, ?7, ?7)",
        params![
            code,
            input.name.trim(),
            input.description.trim(),
            owner_id,
            date_text(input.start_date),
            date_text(input.end_date),
            ts
        ],
    )?;
    let project_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, 'lead')",
        params![project_id, owner_id],
    )?;
    tx.commit()?;

    log::info!("{} created project {} '{}'", actor.username, code, input.name.trim());
    Ok(project_id)
}

pub fn update_project(conn: &Connection, actor: &User, id: i64, input: &ProjectInput) -> AppResult<()> {
    let project = get_project(conn, id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;
    validate_input(input)?;

    let tx = conn.unchecked_transaction()?;
    let owner_id = input.owner_id.unwrap_or(project.owner_id);
    if owner_id != project.owner_id {
        ensure_active_owner(&tx, owner_id)?;
        tx.execute(
            "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, 'lead') \
             ON CONFLICT (project_id, user_id) DO UPDATE SET role = 'lead'",
            params![id, owner_id],
        )?;
    }
    tx.execute(
        "UPDATE projects SET name = ?1, description = ?2, start_date = ?3, end_date = ?4, \
         owner_id = ?5, updated_at = ?6 WHERE id = ?7",
        params![
            input.name.trim(),
            input.description.trim(),
            date_text(input.start_date),
            date_text(input.end_date),
            owner_id,
            now(),
            id
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn find_project(conn: &Connection, id: i64) -> AppResult<Option<Project>> {
    let sql = format!("{PROJECT_SELECT} WHERE p.id = ?1");
    Ok(conn.query_row(&sql, [id], project_from_row).optional()?)
}

pub fn get_project(conn: &Connection, id: i64) -> AppResult<Project> {
    find_project(conn, id)?.ok_or(AppError::NotFound)
}

pub fn list_projects(conn: &Connection, actor: &User, filter: &ProjectFilter) -> AppResult<Vec<Project>> {
    require_view(actor)?;
    let mut sql = format!("{PROJECT_SELECT} WHERE 1 = 1");
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND p.status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        sql.push_str(" AND (p.code LIKE ? ESCAPE '\\' OR p.name LIKE ? ESCAPE '\\')");
        let pattern = like_pattern(q);
        values.push(Value::Text(pattern.clone()));
        values.push(Value::Text(pattern));
    }
    if let Some(user_id) = filter.member_of {
        sql.push_str(
            " AND (p.owner_id = ? OR EXISTS (SELECT 1 FROM project_members m \
             WHERE m.project_id = p.id AND m.user_id = ?))",
        );
        values.push(Value::Integer(user_id));
        values.push(Value::Integer(user_id));
    }
    sql.push_str(" ORDER BY p.updated_at DESC, p.id DESC");

    let mut stmt = conn.prepare(&sql)?;
    let projects = stmt
        .query_map(params_from_iter(values.iter()), project_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(projects)
}

/// Guarded status transition.
pub fn change_status(
    conn: &Connection,
    actor: &User,
    id: i64,
    next: ProjectStatus,
) -> AppResult<ProjectStatus> {
    let project = get_project(conn, id)?;
    ensure_manager(conn, actor, &project)?;
    if !project.status.can_transition_to(next) {
        return Err(AppError::conflict(format!(
            "A project cannot go from {} to {}",
            project.status.label(),
            next.label()
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![next.as_str(), now(), id, project.status.as_str()],
    )?;
    if changed == 0 {
        return Err(AppError::conflict(
            "The project was changed by someone else; reload and try again",
        ));
    }
    tx.commit()?;

    log::info!(
        "{} moved project {} from {} to {}",
        actor.username,
        project.code,
        project.status,
        next
    );
    Ok(next)
}

/// Recompute phase and project progress from task counts.
fn recalc_progress(tx: &Transaction<'_>, project_id: i64) -> AppResult<()> {
    let mut stmt = tx.prepare(
        "SELECT ph.id, \
           (SELECT COUNT(*) FROM project_tasks t WHERE t.phase_id = ph.id), \
           (SELECT COUNT(*) FROM project_tasks t WHERE t.phase_id = ph.id AND t.status = 'done') \
         FROM project_phases ph WHERE ph.project_id = ?1",
    )?;
    let phases = stmt
        .query_map([project_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (phase_id, total, done) in phases {
        tx.execute(
            "UPDATE project_phases SET progress = ?1 WHERE id = ?2",
            params![progress_percent(done, total), phase_id],
        )?;
    }

    let (total, done): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(status = 'done'), 0) FROM project_tasks WHERE project_id = ?1",
        [project_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    tx.execute(
        "UPDATE projects SET progress = ?1, updated_at = ?2 WHERE id = ?3",
        params![progress_percent(done, total), now(), project_id],
    )?;
    Ok(())
}

pub fn phases_for(conn: &Connection, project_id: i64) -> AppResult<Vec<Phase>> {
    let mut stmt = conn.prepare(
        "SELECT ph.id, ph.project_id, ph.name, ph.position, ph.progress, \
           (SELECT COUNT(*) FROM project_tasks t WHERE t.phase_id = ph.id) \
         FROM project_phases ph WHERE ph.project_id = ?1 ORDER BY ph.position, ph.id",
    )?;
    let phases = stmt
        .query_map([project_id], |row| {
            Ok(Phase {
                id: row.get(0)?,
                project_id: row.get(1)?,
                name: row.get(2)?,
                position: row.get(3)?,
                progress: row.get(4)?,
                task_count: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(phases)
}

pub fn add_phase(conn: &Connection, actor: &User, project_id: i64, name: &str) -> AppResult<i64> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Phase name is required"));
    }

    conn.execute(
        "INSERT INTO project_phases (project_id, name, position, progress) \
         VALUES (?1, ?2, (SELECT COALESCE(MAX(position), 0) + 1 FROM project_phases WHERE project_id = ?1), 0)",
        params![project_id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Delete a phase; its tasks stay on the project without a phase.
pub fn delete_phase(conn: &Connection, actor: &User, project_id: i64, phase_id: i64) -> AppResult<()> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE project_tasks SET phase_id = NULL WHERE phase_id = ?1 AND project_id = ?2",
        params![phase_id, project_id],
    )?;
    let deleted = tx.execute(
        "DELETE FROM project_phases WHERE id = ?1 AND project_id = ?2",
        params![phase_id, project_id],
    )?;
    if deleted == 0 {
        return Err(AppError::NotFound);
    }
    recalc_progress(&tx, project_id)?;
    tx.commit()?;
    Ok(())
}

pub fn tasks_for(conn: &Connection, project_id: i64) -> AppResult<Vec<Task>> {
    let sql = format!(
        "{TASK_SELECT} WHERE t.project_id = ?1 \
         ORDER BY COALESCE(ph.position, 1000000), t.status = 'done', t.due_date IS NULL, t.due_date, t.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map([project_id], task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

/// Tasks assigned to the user that are not done, in projects that are not archived.
pub fn open_tasks_for(conn: &Connection, user_id: i64) -> AppResult<Vec<Task>> {
    let sql = format!(
        "{TASK_SELECT} WHERE t.assignee_id = ?1 AND t.status != 'done' AND p.status != 'archived' \
         ORDER BY t.due_date IS NULL, t.due_date, t.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map([user_id], task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

fn get_task(conn: &Connection, project_id: i64, task_id: i64) -> AppResult<Task> {
    let sql = format!("{TASK_SELECT} WHERE t.id = ?1 AND t.project_id = ?2");
    conn.query_row(&sql, params![task_id, project_id], task_from_row)
        .optional()?
        .ok_or(AppError::NotFound)
}

pub fn add_task(conn: &Connection, actor: &User, project_id: i64, task: &NewTask) -> AppResult<i64> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;
    let title = task.title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Task title is required"));
    }
    if let Some(assignee) = task.assignee_id {
        if !is_member(conn, project_id, assignee)? {
            return Err(AppError::validation("The assignee must be a project member"));
        }
    }

    let tx = conn.unchecked_transaction()?;
    if let Some(phase_id) = task.phase_id {
        let belongs: Option<i64> = tx
            .query_row(
                "SELECT id FROM project_phases WHERE id = ?1 AND project_id = ?2",
                params![phase_id, project_id],
                |row| row.get(0),
            )
            .optional()?;
        if belongs.is_none() {
            return Err(AppError::validation("Unknown phase"));
        }
    }
    tx.execute(
        "INSERT INTO project_tasks (project_id, phase_id, title, assignee_id, status, due_date, created_at) \
         VALUES (?1, ?2, ?3, ?4, 'todo', ?5, ?6)",
        params![
            project_id,
            task.phase_id,
            title,
            task.assignee_id,
            date_text(task.due_date),
            now()
        ],
    )?;
    let task_id = tx.last_insert_rowid();
    recalc_progress(&tx, project_id)?;
    tx.commit()?;
    Ok(task_id)
}

/// Project managers and the task's assignee may move a task.
pub fn set_task_status(
    conn: &Connection,
    actor: &User,
    project_id: i64,
    task_id: i64,
    status: TaskStatus,
) -> AppResult<()> {
    let project = get_project(conn, project_id)?;
    ensure_not_archived(&project)?;
    let task = get_task(conn, project_id, task_id)?;
    if task.assignee_id != Some(actor.id) && !can_manage(conn, actor, &project)? {
        return Err(AppError::Forbidden);
    }

    let tx = conn.unchecked_transaction()?;
    let completed_at = (status == TaskStatus::Done).then(now);
    tx.execute(
        "UPDATE project_tasks SET status = ?1, completed_at = ?2 WHERE id = ?3 AND project_id = ?4",
        params![status.as_str(), completed_at, task_id, project_id],
    )?;
    recalc_progress(&tx, project_id)?;
    tx.commit()?;
    log::info!(
        "{} set task {} of {} to {}",
        actor.username,
        task_id,
        project.code,
        status.as_str()
    );
    Ok(())
}

pub fn delete_task(conn: &Connection, actor: &User, project_id: i64, task_id: i64) -> AppResult<()> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;

    let tx = conn.unchecked_transaction()?;
    let deleted = tx.execute(
        "DELETE FROM project_tasks WHERE id = ?1 AND project_id = ?2",
        params![task_id, project_id],
    )?;
    if deleted == 0 {
        return Err(AppError::NotFound);
    }
    recalc_progress(&tx, project_id)?;
    tx.commit()?;
    Ok(())
}

pub fn members_for(conn: &Connection, project_id: i64) -> AppResult<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT m.user_id, u.username, u.full_name, m.role FROM project_members m \
         JOIN users u ON u.id = m.user_id WHERE m.project_id = ?1 \
         ORDER BY m.role = 'lead' DESC, u.full_name",
    )?;
    let members = stmt
        .query_map([project_id], |row| {
            Ok(Member {
                user_id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                role: parse_column(row, 3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

/// Add a member, or change the role of an existing one.
pub fn add_member(
    conn: &Connection,
    actor: &User,
    project_id: i64,
    user_id: i64,
    role: MemberRole,
) -> AppResult<()> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;
    if user_id == project.owner_id && role != MemberRole::Lead {
        return Err(AppError::conflict("The project owner is always a lead"));
    }
    let active: Option<String> = conn
        .query_row("SELECT status FROM users WHERE id = ?1", [user_id], |row| row.get(0))
        .optional()?;
    if active.as_deref() != Some("active") {
        return Err(AppError::validation("Only active users can be added"));
    }

    conn.execute(
        "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3) \
         ON CONFLICT (project_id, user_id) DO UPDATE SET role = excluded.role",
        params![project_id, user_id, role.as_str()],
    )?;
    Ok(())
}

/// Remove a member and unassign their tasks. The owner stays.
pub fn remove_member(conn: &Connection, actor: &User, project_id: i64, user_id: i64) -> AppResult<()> {
    let project = get_project(conn, project_id)?;
    ensure_manager(conn, actor, &project)?;
    ensure_not_archived(&project)?;
    if user_id == project.owner_id {
        return Err(AppError::conflict("The project owner cannot be removed"));
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE project_tasks SET assignee_id = NULL WHERE project_id = ?1 AND assignee_id = ?2",
        params![project_id, user_id],
    )?;
    let removed = tx.execute(
        "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
        params![project_id, user_id],
    )?;
    if removed == 0 {
        return Err(AppError::NotFound);
    }
    tx.commit()?;
    Ok(())
}

const DOCUMENT_SELECT: &str = "SELECT d.id, d.project_id, d.file_name, d.stored_name, d.content_type, \
     d.size_bytes, d.uploaded_by, COALESCE(u.full_name, ''), d.uploaded_at \
     FROM project_documents d LEFT JOIN users u ON u.id = d.uploaded_by";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        project_id: row.get(1)?,
        file_name: row.get(2)?,
        stored_name: row.get(3)?,
        content_type: row.get(4)?,
        size_bytes: row.get(5)?,
        uploaded_by: row.get(6)?,
        uploaded_by_name: row.get(7)?,
        uploaded_at: row.get(8)?,
    })
}

pub fn documents_for(conn: &Connection, project_id: i64) -> AppResult<Vec<Document>> {
    let sql = format!("{DOCUMENT_SELECT} WHERE d.project_id = ?1 ORDER BY d.uploaded_at DESC, d.id DESC");
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map([project_id], document_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs)
}

pub fn get_document(conn: &Connection, project_id: i64, document_id: i64) -> AppResult<Document> {
    let sql = format!("{DOCUMENT_SELECT} WHERE d.id = ?1 AND d.project_id = ?2");
    conn.query_row(&sql, params![document_id, project_id], document_from_row)
        .optional()?
        .ok_or(AppError::NotFound)
}

/// Members (other than viewers) and managers may upload.
pub fn can_upload(conn: &Connection, user: &User, project: &Project) -> AppResult<bool> {
    if can_manage(conn, user, project)? {
        return Ok(true);
    }
    Ok(matches!(
        member_role(conn, project.id, user.id)?,
        Some(MemberRole::Member)
    ))
}

/// Record an uploaded file. The bytes are already on disk under `stored_name`.
pub fn add_document(
    conn: &Connection,
    actor: &User,
    project_id: i64,
    doc: &NewDocument,
) -> AppResult<i64> {
    let project = get_project(conn, project_id)?;
    ensure_not_archived(&project)?;
    if !can_upload(conn, actor, &project)? {
        return Err(AppError::Forbidden);
    }
    if doc.file_name.trim().is_empty() {
        return Err(AppError::validation("Choose a file to upload"));
    }

    conn.execute(
        "INSERT INTO project_documents (project_id, file_name, stored_name, content_type, \
         size_bytes, uploaded_by, uploaded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            project_id,
            doc.file_name.trim(),
            doc.stored_name,
            doc.content_type,
            doc.size_bytes,
            actor.id,
            now()
        ],
    )?;
    log::info!(
        "{} uploaded '{}' to {}",
        actor.username,
        doc.file_name,
        project.code
    );
    Ok(conn.last_insert_rowid())
}

/// Delete the document row; returns it so the caller can remove the file.
pub fn delete_document(
    conn: &Connection,
    actor: &User,
    project_id: i64,
    document_id: i64,
) -> AppResult<Document> {
    let project = get_project(conn, project_id)?;
    ensure_not_archived(&project)?;
    let doc = get_document(conn, project_id, document_id)?;
    if doc.uploaded_by != actor.id && !can_manage(conn, actor, &project)? {
        return Err(AppError::Forbidden);
    }
    conn.execute("DELETE FROM project_documents WHERE id = ?1", [document_id])?;
    Ok(doc)
}

pub fn status_counts(conn: &Connection) -> AppResult<Vec<(ProjectStatus, i64)>> {
    ProjectStatus::ALL
        .into_iter()
        .map(|status| -> AppResult<(ProjectStatus, i64)> {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM projects WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?;
            Ok((status, count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_rounds_to_nearest_percent() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
    }

    #[test]
    fn status_transitions() {
        use ProjectStatus::*;

        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(OnHold));
        assert!(OnHold.can_transition_to(Active));
        assert!(Completed.can_transition_to(Archived));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Archived));
        assert!(Archived.allowed_next().is_empty());
    }

    #[test]
    fn project_codes() {
        assert_eq!(format_project_code(2024, 7), "PRJ-2024-007");
        assert_eq!("on_hold".parse::<ProjectStatus>().unwrap(), ProjectStatus::OnHold);
    }
}
