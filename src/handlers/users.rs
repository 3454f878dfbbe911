use axum::{
    Extension, Form, Json,
    extract::{Path, Query, State},
    response::{Html, Redirect, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::{Permission, Role, UserStatus};
use crate::downloader;
use crate::error::{AppError, AppResult, JsonError};
use crate::handlers::{attachment, flash_failure, non_empty, parse_filter, redirect_after};
use crate::login::{self, CurrentUser, FlashKind};
use crate::money::Money;
use crate::render;
use crate::users::{self, NewUser, UserAction, UserFilter, UserUpdate};

#[derive(Debug, Default, Deserialize)]
pub struct UserFilterQuery {
    pub q: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
}

impl UserFilterQuery {
    fn to_filter(&self) -> UserFilter {
        UserFilter {
            q: non_empty(&self.q).map(str::to_string),
            role: parse_filter(&self.role),
            status: parse_filter(&self.status),
        }
    }
}

/// Fields of the create and edit forms. `username` is only read on create.
#[derive(Debug, Deserialize)]
pub struct UserForm {
    pub username: Option<String>,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub status: Option<String>,
    #[serde(default)]
    pub basic_salary: String,
    pub password: Option<String>,
}

fn parse_salary(text: &str) -> AppResult<Money> {
    if text.trim().is_empty() {
        return Ok(Money::ZERO);
    }
    text.parse()
        .map_err(|_| AppError::validation("Basic salary must be an amount like 2500.00"))
}

fn role_options(selected: Option<Role>) -> Vec<Value> {
    Role::ALL
        .iter()
        .map(|role| {
            json!({
                "value": role.as_str(),
                "label": role.label(),
                "selected": Some(*role) == selected,
            })
        })
        .collect()
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<UserFilterQuery>,
) -> AppResult<Html<String>> {
    current.require(Permission::ManageUsers)?;
    let filter = query.to_filter();
    let list = {
        let conn = state.db()?;
        users::list_users(&conn, &filter)?
    };

    let rows: Vec<Value> = list
        .iter()
        .map(|user| {
            json!({
                "user": user,
                "role_label": user.role.label(),
                "active": user.is_active(),
                "is_self": user.id == current.user.id,
            })
        })
        .collect();

    render::page(
        &state,
        &current,
        "users_list",
        "Users",
        json!({
            "rows": rows,
            "filter": {"q": filter.q, "status": filter.status.map(UserStatus::as_str)},
            "roles": role_options(filter.role),
        }),
    )
}

pub async fn new_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    current.require(Permission::ManageUsers)?;
    render::page(
        &state,
        &current,
        "user_form",
        "New user",
        json!({
            "is_new": true,
            "action": "/users",
            "roles": role_options(Some(Role::Employee)),
        }),
    )
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Form(form): Form<UserForm>,
) -> AppResult<Redirect> {
    current.require(Permission::ManageUsers)?;

    let result = (|| -> AppResult<i64> {
        let new_user = NewUser {
            username: form.username.clone().unwrap_or_default(),
            email: form.email.clone(),
            full_name: form.full_name.clone(),
            role: form.role.parse()?,
            basic_salary: parse_salary(&form.basic_salary)?,
            password: form.password.clone().unwrap_or_default(),
        };
        let conn = state.db()?;
        users::create_user(&conn, &new_user)
    })();

    match result {
        Ok(_) => {
            current.flash(FlashKind::Success, "User created");
            Ok(Redirect::to("/users"))
        }
        Err(err) => {
            flash_failure(&current, err)?;
            Ok(Redirect::to("/users/new"))
        }
    }
}

pub async fn edit_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> AppResult<Html<String>> {
    current.require(Permission::ManageUsers)?;
    let user = {
        let conn = state.db()?;
        users::get_user(&conn, id)?
    };

    let title = format!("Edit {}", user.username);
    render::page(
        &state,
        &current,
        "user_form",
        &title,
        json!({
            "is_new": false,
            "action": format!("/users/{}", user.id),
            "roles": role_options(Some(user.role)),
            "active": user.is_active(),
            "user": user,
        }),
    )
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<UserForm>,
) -> AppResult<Redirect> {
    current.require(Permission::ManageUsers)?;

    let result = (|| -> AppResult<UserStatus> {
        let status = match non_empty(&form.status) {
            Some(status) => status.parse()?,
            None => UserStatus::Active,
        };
        let role: Role = form.role.parse()?;
        if id == current.user.id && (status != UserStatus::Active || role != Role::Admin) {
            return Err(AppError::conflict(
                "You cannot deactivate or demote your own account",
            ));
        }
        let update = UserUpdate {
            email: form.email.clone(),
            full_name: form.full_name.clone(),
            role,
            status,
            basic_salary: parse_salary(&form.basic_salary)?,
            password: form.password.clone().filter(|p| !p.is_empty()),
        };
        let conn = state.db()?;
        users::update_user(&conn, id, &update)?;
        Ok(status)
    })();

    if let Ok(UserStatus::Inactive) = result {
        login::destroy_sessions_for(id);
    }
    redirect_after(&current, result, "User updated", &format!("/users/{id}/edit"))
}

pub async fn api_list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<UserFilterQuery>,
) -> Result<Json<Value>, JsonError> {
    current.require(Permission::ManageUsers)?;
    let list = {
        let conn = state.db()?;
        users::list_users(&conn, &query.to_filter())?
    };
    Ok(Json(json!({ "success": true, "users": list })))
}

/// `POST /api/users/actions` with `{"action": "...", "id": N, ...}`.
pub async fn api_action(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, JsonError> {
    let action: UserAction = serde_json::from_value(body)
        .map_err(|e| AppError::validation(format!("Invalid action: {e}")))?;

    let outcome = {
        let conn = state.db()?;
        users::apply_action(&conn, &current.user, &action)?
    };

    match action {
        UserAction::Deactivate { id }
        | UserAction::ResetPassword { id }
        | UserAction::Delete { id } => login::destroy_sessions_for(id),
        UserAction::Activate { .. } | UserAction::SetRole { .. } => {}
    }

    Ok(Json(json!({
        "success": true,
        "message": outcome.message,
        "temporary_password": outcome.temporary_password,
    })))
}

pub async fn export_csv(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<UserFilterQuery>,
) -> AppResult<Response> {
    current.require(Permission::ManageUsers)?;
    let list = {
        let conn = state.db()?;
        users::list_users(&conn, &query.to_filter())?
    };
    let csv = downloader::to_csv(&downloader::users_table(&list));
    Ok(attachment("text/csv; charset=utf-8", "users.csv", csv))
}
