use axum::{
    Extension, Form,
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    response::{Html, Redirect, Response},
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;
use crate::auth::Permission;
use crate::downloader;
use crate::error::{AppError, AppResult};
use crate::handlers::{attachment, flash_failure, non_empty, parse_field, parse_filter, redirect_after};
use crate::login::{CurrentUser, FlashKind};
use crate::projects::{
    self, MemberRole, NewDocument, NewTask, Project, ProjectFilter, ProjectInput, ProjectStatus,
    TaskStatus,
};
use crate::render;
use crate::users;

#[derive(Debug, Default, Deserialize)]
pub struct ProjectFilterQuery {
    pub status: Option<String>,
    pub q: Option<String>,
    pub mine: Option<String>,
}

impl ProjectFilterQuery {
    fn to_filter(&self, current: &CurrentUser) -> ProjectFilter {
        ProjectFilter {
            status: parse_filter(&self.status),
            q: non_empty(&self.q).map(str::to_string),
            member_of: non_empty(&self.mine)
                .filter(|v| *v != "0")
                .map(|_| current.user.id),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProjectForm {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub owner_id: Option<String>,
}

impl ProjectForm {
    fn to_input(&self) -> AppResult<ProjectInput> {
        Ok(ProjectInput {
            name: self.name.clone(),
            description: self.description.clone(),
            start_date: parse_field::<NaiveDate>(&self.start_date, "start date")?,
            end_date: parse_field::<NaiveDate>(&self.end_date, "end date")?,
            owner_id: parse_field::<i64>(&self.owner_id, "owner")?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusForm {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct PhaseForm {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskForm {
    pub title: String,
    pub phase_id: Option<String>,
    pub assignee_id: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemberForm {
    pub user_id: Option<String>,
    pub role: String,
}

fn detail_url(id: i64) -> String {
    format!("/projects/{id}")
}

fn status_options(selected: Option<ProjectStatus>) -> Vec<Value> {
    ProjectStatus::ALL
        .iter()
        .map(|s| json!({"value": s.as_str(), "label": s.label(), "selected": Some(*s) == selected}))
        .collect()
}

fn owner_options(state: &AppState, selected: i64) -> AppResult<Vec<Value>> {
    let conn = state.db()?;
    Ok(users::list_active(&conn)?
        .into_iter()
        .map(|u| json!({"id": u.id, "full_name": u.full_name, "selected": u.id == selected}))
        .collect())
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<ProjectFilterQuery>,
) -> AppResult<Html<String>> {
    let filter = query.to_filter(&current);
    let list = {
        let conn = state.db()?;
        projects::list_projects(&conn, &current.user, &filter)?
    };
    let rows: Vec<Value> = list
        .iter()
        .map(|p| json!({"project": p, "status_label": p.status.label()}))
        .collect();

    render::page(
        &state,
        &current,
        "projects_list",
        "Projects",
        json!({
            "rows": rows,
            "statuses": status_options(filter.status),
            "filter": {"q": filter.q, "mine": filter.member_of.is_some()},
        }),
    )
}

pub async fn new_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    current.require(Permission::ManageProjects)?;
    let owners = owner_options(&state, current.user.id)?;
    render::page(
        &state,
        &current,
        "project_form",
        "New project",
        json!({ "is_new": true, "action": "/projects", "owners": owners }),
    )
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Form(form): Form<ProjectForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<i64> {
        let input = form.to_input()?;
        let conn = state.db()?;
        projects::create_project(&conn, &current.user, &input)
    })();
    match result {
        Ok(id) => {
            current.flash(FlashKind::Success, "Project created");
            Ok(Redirect::to(&detail_url(id)))
        }
        Err(err) => {
            flash_failure(&current, err)?;
            Ok(Redirect::to("/projects/new"))
        }
    }
}

pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> AppResult<Html<String>> {
    current.require(Permission::ViewProjects)?;
    let (project, phases, tasks, members, documents, active, can_manage, can_upload) = {
        let conn = state.db()?;
        let project = projects::get_project(&conn, id)?;
        let can_manage = projects::can_manage(&conn, &current.user, &project)?;
        let can_upload = projects::can_upload(&conn, &current.user, &project)?;
        (
            project,
            projects::phases_for(&conn, id)?,
            projects::tasks_for(&conn, id)?,
            projects::members_for(&conn, id)?,
            projects::documents_for(&conn, id)?,
            users::list_active(&conn)?,
            can_manage,
            can_upload,
        )
    };
    let writable = project.status != ProjectStatus::Archived;

    let next_statuses: Vec<Value> = project
        .status
        .allowed_next()
        .iter()
        .map(|s| json!({"value": s.as_str(), "label": s.label()}))
        .collect();
    let task_rows: Vec<Value> = tasks
        .iter()
        .map(|task| {
            let can_update = writable && (can_manage || task.assignee_id == Some(current.user.id));
            let statuses: Vec<Value> = TaskStatus::ALL
                .iter()
                .map(|s| json!({"value": s.as_str(), "label": s.label(), "selected": *s == task.status}))
                .collect();
            json!({
                "task": task,
                "status_label": task.status.label(),
                "can_update": can_update,
                "statuses": statuses,
            })
        })
        .collect();
    let member_ids: Vec<i64> = members.iter().map(|m| m.user_id).collect();
    let candidates: Vec<Value> = active
        .iter()
        .filter(|u| !member_ids.contains(&u.id))
        .map(|u| json!({"id": u.id, "full_name": u.full_name}))
        .collect();
    let member_rows: Vec<Value> = members
        .iter()
        .map(|m| json!({"member": m, "is_owner": m.user_id == project.owner_id}))
        .collect();

    let title = format!("{} {}", project.code, project.name);
    render::page(
        &state,
        &current,
        "project_detail",
        &title,
        json!({
            "status_label": project.status.label(),
            "can_manage": can_manage && writable,
            "can_upload": can_upload && writable,
            "can_change_status": can_manage,
            "archived": !writable,
            "next_statuses": next_statuses,
            "project": project,
            "phases": phases,
            "tasks": task_rows,
            "members": member_rows,
            "member_options": members,
            "candidates": candidates,
            "documents": documents,
        }),
    )
}

pub async fn edit_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> AppResult<Html<String>> {
    let project = {
        let conn = state.db()?;
        let project = projects::get_project(&conn, id)?;
        if !projects::can_manage(&conn, &current.user, &project)? {
            return Err(AppError::Forbidden);
        }
        project
    };
    let owners = owner_options(&state, project.owner_id)?;

    let title = format!("Edit {}", project.code);
    render::page(
        &state,
        &current,
        "project_form",
        &title,
        json!({
            "is_new": false,
            "action": detail_url(project.id),
            "owners": owners,
            "project": project,
        }),
    )
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<ProjectForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let input = form.to_input()?;
        let conn = state.db()?;
        projects::update_project(&conn, &current.user, id, &input)
    })();
    match result {
        Ok(()) => {
            current.flash(FlashKind::Success, "Project updated");
            Ok(Redirect::to(&detail_url(id)))
        }
        Err(err) => {
            flash_failure(&current, err)?;
            Ok(Redirect::to(&format!("/projects/{id}/edit")))
        }
    }
}

pub async fn change_status(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<StatusForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<ProjectStatus> {
        let next: ProjectStatus = form.status.parse()?;
        let conn = state.db()?;
        projects::change_status(&conn, &current.user, id, next)
    })();
    let message = match &result {
        Ok(status) => format!("Project is now {}", status.label()),
        Err(_) => String::new(),
    };
    redirect_after(&current, result, &message, &detail_url(id))
}

pub async fn add_phase(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<PhaseForm>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        projects::add_phase(&conn, &current.user, id, &form.name)
    };
    redirect_after(&current, result, "Phase added", &detail_url(id))
}

pub async fn delete_phase(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, phase_id)): Path<(i64, i64)>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        projects::delete_phase(&conn, &current.user, id, phase_id)
    };
    redirect_after(&current, result, "Phase deleted", &detail_url(id))
}

pub async fn add_task(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<TaskForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<i64> {
        let task = NewTask {
            title: form.title.clone(),
            phase_id: parse_field(&form.phase_id, "phase")?,
            assignee_id: parse_field(&form.assignee_id, "assignee")?,
            due_date: parse_field(&form.due_date, "due date")?,
        };
        let conn = state.db()?;
        projects::add_task(&conn, &current.user, id, &task)
    })();
    redirect_after(&current, result, "Task added", &detail_url(id))
}

pub async fn set_task_status(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, task_id)): Path<(i64, i64)>,
    Form(form): Form<StatusForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let status: TaskStatus = form.status.parse()?;
        let conn = state.db()?;
        projects::set_task_status(&conn, &current.user, id, task_id, status)
    })();
    redirect_after(&current, result, "Task updated", &detail_url(id))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        projects::delete_task(&conn, &current.user, id, task_id)
    };
    redirect_after(&current, result, "Task deleted", &detail_url(id))
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<MemberForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let user_id = parse_field::<i64>(&form.user_id, "user")?
            .ok_or_else(|| AppError::validation("Choose a user"))?;
        let role: MemberRole = form.role.parse()?;
        let conn = state.db()?;
        projects::add_member(&conn, &current.user, id, user_id, role)
    })();
    redirect_after(&current, result, "Member saved", &detail_url(id))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, user_id)): Path<(i64, i64)>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        projects::remove_member(&conn, &current.user, id, user_id)
    };
    redirect_after(&current, result, "Member removed", &detail_url(id))
}

struct Upload {
    file_name: String,
    content_type: String,
    bytes: Bytes,
}

/// Read the `file` field of the upload form.
async fn read_upload(mut multipart: Multipart) -> AppResult<Option<Upload>> {
    let bad_upload = |e: axum::extract::multipart::MultipartError| {
        AppError::validation(format!("Upload failed: {}", e.body_text()))
    };

    while let Some(field) = multipart.next_field().await.map_err(bad_upload)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .and_then(|name| name.rsplit(['/', '\\']).next())
            .unwrap_or_default()
            .trim()
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(bad_upload)?;
        if file_name.is_empty() || bytes.is_empty() {
            return Ok(None);
        }
        return Ok(Some(Upload {
            file_name,
            content_type,
            bytes,
        }));
    }
    Ok(None)
}

pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> AppResult<Redirect> {
    let back = detail_url(id);
    {
        let conn = state.db()?;
        let project = projects::get_project(&conn, id)?;
        if !projects::can_upload(&conn, &current.user, &project)? {
            return Err(AppError::Forbidden);
        }
    }

    let upload = match read_upload(multipart).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            current.flash(FlashKind::Error, "Choose a file to upload");
            return Ok(Redirect::to(&back));
        }
        Err(err) => {
            flash_failure(&current, err)?;
            return Ok(Redirect::to(&back));
        }
    };
    let limit = state.config.max_upload_bytes;
    if upload.bytes.len() > limit {
        current.flash(
            FlashKind::Error,
            format!("Files may be at most {} KiB", limit / 1024),
        );
        return Ok(Redirect::to(&back));
    }

    let stored_name = Uuid::new_v4().to_string();
    let path = state.config.upload_dir.join(&stored_name);
    tokio::fs::create_dir_all(&state.config.upload_dir).await?;
    tokio::fs::write(&path, &upload.bytes).await?;

    let doc = NewDocument {
        file_name: upload.file_name,
        stored_name,
        content_type: upload.content_type,
        size_bytes: upload.bytes.len() as i64,
    };
    let result = {
        let conn = state.db()?;
        projects::add_document(&conn, &current.user, id, &doc)
    };
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::warn!("could not remove orphaned upload {}: {}", path.display(), e);
        }
    }
    redirect_after(&current, result, "Document uploaded", &back)
}

pub async fn download_document(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, doc_id)): Path<(i64, i64)>,
) -> AppResult<Response> {
    current.require(Permission::ViewProjects)?;
    let doc = {
        let conn = state.db()?;
        projects::get_document(&conn, id, doc_id)?
    };
    let bytes = tokio::fs::read(state.config.upload_dir.join(&doc.stored_name))
        .await
        .map_err(|e| {
            log::error!("document {} missing on disk: {}", doc.stored_name, e);
            AppError::NotFound
        })?;
    Ok(attachment(&doc.content_type, &doc.file_name, bytes))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, doc_id)): Path<(i64, i64)>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        projects::delete_document(&conn, &current.user, id, doc_id)
    };
    if let Ok(doc) = &result {
        let path = state.config.upload_dir.join(&doc.stored_name);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            log::warn!("could not remove {}: {}", path.display(), e);
        }
    }
    redirect_after(&current, result, "Document deleted", &detail_url(id))
}

pub async fn export_csv(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<ProjectFilterQuery>,
) -> AppResult<Response> {
    let filter = query.to_filter(&current);
    let list: Vec<Project> = {
        let conn = state.db()?;
        projects::list_projects(&conn, &current.user, &filter)?
    };
    let csv = downloader::to_csv(&downloader::projects_table(&list));
    Ok(attachment("text/csv; charset=utf-8", "projects.csv", csv))
}
