use axum::{Extension, extract::State, response::Html};
use serde_json::json;
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::Permission;
use crate::error::AppResult;
use crate::login::CurrentUser;
use crate::render;
use crate::{payroll, projects, users};

pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    let data = {
        let conn = state.db()?;
        let payroll_counts: Vec<serde_json::Value> = if current.user.can(Permission::ViewPayroll) {
            payroll::status_counts(&conn)?
                .into_iter()
                .map(|(status, count)| json!({"status": status, "label": status.label(), "count": count}))
                .collect()
        } else {
            Vec::new()
        };
        let project_counts: Vec<serde_json::Value> = projects::status_counts(&conn)?
            .into_iter()
            .map(|(status, count)| json!({"status": status, "label": status.label(), "count": count}))
            .collect();

        json!({
            "active_users": users::count_active(&conn)?,
            "payroll_counts": payroll_counts,
            "project_counts": project_counts,
            "open_tasks": projects::open_tasks_for(&conn, current.user.id)?,
        })
    };

    render::page(&state, &current, "dashboard", "Dashboard", data)
}
