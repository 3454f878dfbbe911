//! Sessions, flash messages, the authentication middleware and the
//! login/logout/password handlers.

use axum::{
    Extension, Form,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::render;
use crate::users::{self, User};

pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashKind {
    Success,
    Error,
}

/// One-shot notice shown on the next rendered page.
#[derive(Debug, Clone, Serialize)]
pub struct Flash {
    pub kind: FlashKind,
    pub message: String,
}

/// User session data
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i64,
    pub expires_at: SystemTime,
    pub flash: Option<Flash>,
}

lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
}

/// The authenticated user of the current request, placed in request
/// extensions by [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub session_id: String,
}

impl CurrentUser {
    pub fn flash(&self, kind: FlashKind, message: impl Into<String>) {
        set_flash(&self.session_id, kind, message);
    }

    pub fn require(&self, permission: crate::auth::Permission) -> AppResult<()> {
        if self.user.can(permission) {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

/// Create and store a new session; returns its id.
pub fn create_session(user_id: i64, lifetime: Duration) -> String {
    let session_id = Uuid::new_v4().to_string();
    let session = Session {
        user_id,
        expires_at: SystemTime::now() + lifetime,
        flash: None,
    };

    let mut sessions = SESSIONS.write().unwrap_or_else(PoisonError::into_inner);
    sessions.retain(|_, s| s.expires_at > SystemTime::now());
    sessions.insert(session_id.clone(), session);

    session_id
}

/// The user id for a valid, unexpired session.
pub fn validate_session(session_id: &str) -> Option<i64> {
    let sessions = SESSIONS.read().unwrap_or_else(PoisonError::into_inner);

    sessions
        .get(session_id)
        .filter(|session| session.expires_at > SystemTime::now())
        .map(|session| session.user_id)
}

pub fn destroy_session(session_id: &str) {
    let mut sessions = SESSIONS.write().unwrap_or_else(PoisonError::into_inner);
    sessions.remove(session_id);
}

/// Drop every session of a user (password reset, deactivation).
pub fn destroy_sessions_for(user_id: i64) {
    let mut sessions = SESSIONS.write().unwrap_or_else(PoisonError::into_inner);
    sessions.retain(|_, s| s.user_id != user_id);
}

pub fn set_flash(session_id: &str, kind: FlashKind, message: impl Into<String>) {
    let mut sessions = SESSIONS.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(session) = sessions.get_mut(session_id) {
        session.flash = Some(Flash {
            kind,
            message: message.into(),
        });
    }
}

pub fn take_flash(session_id: &str) -> Option<Flash> {
    let mut sessions = SESSIONS.write().unwrap_or_else(PoisonError::into_inner);
    sessions.get_mut(session_id).and_then(|s| s.flash.take())
}

fn session_cookie(session_id: String, hours: u64) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::hours(hours as i64))
        .build()
}

fn removal_cookie() -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, "")).path("/").build()
}

/// Authentication middleware.
///
/// Loads the session's user from the database on every request, so a user
/// deactivated since logging in loses access immediately.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let is_api = request.uri().path().starts_with("/api/");

    let session_id = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    let user = match session_id.as_deref().and_then(|id| validate_session(id).map(|uid| (id, uid))) {
        Some((id, user_id)) => {
            let loaded = state.db().and_then(|conn| users::find_user(&conn, user_id));
            match loaded {
                Ok(Some(user)) if user.is_active() => Some((id.to_string(), user)),
                Ok(_) => {
                    destroy_session(id);
                    None
                }
                Err(err) => return err.into_response(),
            }
        }
        None => None,
    };

    match user {
        Some((session_id, user)) => {
            request
                .extensions_mut()
                .insert(CurrentUser { user, session_id });
            next.run(request).await
        }
        None if is_api => (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"success": false, "message": "Not logged in"})),
        )
            .into_response(),
        None => (jar.remove(removal_cookie()), Redirect::to("/login")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct NoticeQuery {
    pub error: Option<String>,
    pub success: Option<String>,
    pub email: Option<String>,
}

fn notice_context(query: &NoticeQuery) -> serde_json::Value {
    let flash = match (&query.error, &query.success) {
        (Some(message), _) => Some(Flash {
            kind: FlashKind::Error,
            message: message.clone(),
        }),
        (None, Some(message)) => Some(Flash {
            kind: FlashKind::Success,
            message: message.clone(),
        }),
        _ => None,
    };
    json!({ "flash": flash, "email": query.email })
}

pub async fn serve_login_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NoticeQuery>,
) -> AppResult<Html<String>> {
    render::public_page(&state, "login", "Sign in", notice_context(&query))
}

/// Processes login form submissions, validates credentials and creates a session.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> AppResult<Response> {
    let user = {
        let conn = state.db()?;
        users::authenticate(&conn, &form.username, &form.password)?
    };

    match user {
        Some(user) => {
            let hours = state.config.session_hours;
            let session_id = create_session(user.id, Duration::from_secs(hours * 60 * 60));
            log::info!("{} logged in", user.username);
            Ok((jar.add(session_cookie(session_id, hours)), Redirect::to("/")).into_response())
        }
        None => {
            log::warn!("failed login for '{}'", form.username);
            let page = render::public_page(
                &state,
                "login",
                "Sign in",
                json!({
                    "flash": Flash { kind: FlashKind::Error, message: "Invalid username or password".to_string() },
                    "username": form.username,
                }),
            )?;
            Ok((StatusCode::UNAUTHORIZED, page).into_response())
        }
    }
}

/// Clears the session and its cookie.
pub async fn handle_logout(jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if let Some(user_id) = validate_session(cookie.value()) {
            log::info!("user {} logged out", user_id);
        }
        destroy_session(cookie.value());
    }
    (jar.remove(removal_cookie()), Redirect::to("/login"))
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeForm {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

pub async fn serve_change_password_page(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    render::page(&state, &current, "password_change", "Change password", json!({}))
}

pub async fn handle_change_password(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Form(form): Form<PasswordChangeForm>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        users::change_password(
            &conn,
            current.user.id,
            &form.old_password,
            &form.new_password,
            &form.confirm_password,
        )
    };
    match result {
        Ok(()) => {
            current.flash(FlashKind::Success, "Password changed successfully");
            Ok(Redirect::to("/"))
        }
        Err(err @ AppError::Validation(_)) => {
            current.flash(FlashKind::Error, err.public_message());
            Ok(Redirect::to("/password/change"))
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    pub email: String,
    pub reset_code: String,
    pub new_password: String,
    pub confirm_password: String,
}

pub async fn serve_forgot_password_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NoticeQuery>,
) -> AppResult<Html<String>> {
    render::public_page(&state, "password_forgot", "Forgot password", notice_context(&query))
}

pub async fn serve_reset_password_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NoticeQuery>,
) -> AppResult<Html<String>> {
    render::public_page(&state, "password_reset", "Reset password", notice_context(&query))
}

/// Sends a reset code by mail. The response does not reveal whether the
/// address belongs to an account.
pub async fn handle_forgot_password(
    State(state): State<Arc<AppState>>,
    Form(request): Form<PasswordResetRequest>,
) -> AppResult<Redirect> {
    let started = {
        let conn = state.db()?;
        users::start_password_reset(&conn, &request.email)?
    };

    if let Some((user, code)) = started {
        match state.mailer.clone() {
            Some(mailer) => {
                let to = user.email.clone();
                let sent =
                    tokio::task::spawn_blocking(move || mailer.send_password_reset(&to, &code))
                        .await
                        .map_err(|e| AppError::Internal(format!("mail task: {e}")))?;
                if let Err(err) = sent {
                    log::error!("password reset mail to {} failed: {}", user.email, err);
                    return Ok(Redirect::to(
                        "/password/forgot?error=Failed+to+send+email",
                    ));
                }
            }
            None => log::info!("SMTP not configured; reset code for {} is {}", user.username, code),
        }
    }

    Ok(Redirect::to(&format!(
        "/password/reset?success={}&email={}",
        urlencoding::encode("If the address is registered, a reset code has been sent"),
        urlencoding::encode(request.email.trim())
    )))
}

pub async fn handle_reset_password(
    State(state): State<Arc<AppState>>,
    Form(confirm): Form<PasswordResetConfirm>,
) -> AppResult<Redirect> {
    let back = |message: &str| {
        Redirect::to(&format!(
            "/password/reset?error={}&email={}",
            urlencoding::encode(message),
            urlencoding::encode(confirm.email.trim())
        ))
    };
    if confirm.new_password != confirm.confirm_password {
        return Ok(back("New passwords don't match"));
    }

    let result = {
        let conn = state.db()?;
        users::complete_password_reset(&conn, &confirm.email, &confirm.reset_code, &confirm.new_password)
            .and_then(|()| users::find_by_email(&conn, &confirm.email))
    };
    match result {
        Ok(user) => {
            if let Some(user) = user {
                destroy_sessions_for(user.id);
            }
            Ok(Redirect::to("/login?success=Password+reset+successful"))
        }
        Err(err @ AppError::Validation(_)) => Ok(back(&err.public_message())),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_expire_and_carry_one_flash() {
        let id = create_session(42, Duration::from_secs(60));
        assert_eq!(validate_session(&id), Some(42));

        set_flash(&id, FlashKind::Success, "Saved");
        assert_eq!(take_flash(&id).map(|f| f.message), Some("Saved".to_string()));
        assert!(take_flash(&id).is_none());

        destroy_session(&id);
        assert_eq!(validate_session(&id), None);

        let expired = create_session(7, Duration::from_secs(0));
        assert_eq!(validate_session(&expired), None);
    }

    #[test]
    fn destroying_a_users_sessions_leaves_others() {
        let a = create_session(1001, Duration::from_secs(60));
        let b = create_session(1002, Duration::from_secs(60));
        destroy_sessions_for(1001);
        assert_eq!(validate_session(&a), None);
        assert_eq!(validate_session(&b), Some(1002));
    }
}
