use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use handlebars::Handlebars;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

use crate::config::ErpConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::handlers::{dashboard, payroll, projects, users};
use crate::login;
use crate::mailer::Mailer;
use crate::render;

pub struct AppState {
    db: Mutex<Connection>,
    pub config: ErpConfig,
    pub templates: Handlebars<'static>,
    pub mailer: Option<Mailer>,
}

impl AppState {
    pub fn new(conn: Connection, config: ErpConfig) -> AppResult<Self> {
        let mailer = match &config.smtp {
            Some(smtp) => Some(Mailer::new(smtp)?),
            None => None,
        };
        Ok(AppState {
            db: Mutex::new(conn),
            templates: render::build_templates()?,
            config,
            mailer,
        })
    }

    /// Lock the shared connection. Never hold the guard across an `.await`.
    pub fn db(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    log::info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Build the full router. Everything except sign-in, password reset and
/// static assets goes through [`login::require_auth`].
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", get(dashboard::show))
        .route(
            "/password/change",
            get(login::serve_change_password_page).post(login::handle_change_password),
        )
        // users
        .route("/users", get(users::list).post(users::create))
        .route("/users/new", get(users::new_form))
        .route("/users/export.csv", get(users::export_csv))
        .route("/users/:id/edit", get(users::edit_form))
        .route("/users/:id", post(users::update))
        .route("/api/users", get(users::api_list))
        .route("/api/users/actions", post(users::api_action))
        // payroll
        .route("/payroll", get(payroll::list).post(payroll::create))
        .route("/payroll/new", get(payroll::new_form))
        .route("/payroll/actions", post(payroll::actions))
        .route("/payroll/:id", get(payroll::show))
        .route("/payroll/:id/title", post(payroll::update_title))
        .route("/payroll/:id/records", post(payroll::add_record))
        .route("/payroll/:id/export", get(payroll::export))
        .route(
            "/payroll/:id/records/:record_id/items",
            post(payroll::add_item),
        )
        .route(
            "/payroll/:id/records/:record_id/salary",
            post(payroll::update_salary),
        )
        .route(
            "/payroll/:id/records/:record_id/delete",
            post(payroll::remove_record),
        )
        .route("/api/payroll/items/update", post(payroll::api_update_items))
        .route("/api/payroll/items/delete", post(payroll::api_delete_item))
        .route("/payslips", get(payroll::payslips))
        // projects
        .route("/projects", get(projects::list).post(projects::create))
        .route("/projects/new", get(projects::new_form))
        .route("/projects/export.csv", get(projects::export_csv))
        .route("/projects/:id", get(projects::show).post(projects::update))
        .route("/projects/:id/edit", get(projects::edit_form))
        .route("/projects/:id/status", post(projects::change_status))
        .route("/projects/:id/phases", post(projects::add_phase))
        .route(
            "/projects/:id/phases/:phase_id/delete",
            post(projects::delete_phase),
        )
        .route("/projects/:id/tasks", post(projects::add_task))
        .route(
            "/projects/:id/tasks/:task_id/status",
            post(projects::set_task_status),
        )
        .route(
            "/projects/:id/tasks/:task_id/delete",
            post(projects::delete_task),
        )
        .route("/projects/:id/members", post(projects::add_member))
        .route(
            "/projects/:id/members/:user_id/delete",
            post(projects::remove_member),
        )
        .route(
            "/projects/:id/documents",
            post(projects::upload_document)
                .layer(DefaultBodyLimit::max(state.config.max_upload_bytes + 64 * 1024)),
        )
        .route(
            "/projects/:id/documents/:doc_id",
            get(projects::download_document),
        )
        .route(
            "/projects/:id/documents/:doc_id/delete",
            post(projects::delete_document),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            login::require_auth,
        ));

    Router::new()
        .route(
            "/login",
            get(login::serve_login_page).post(login::handle_login),
        )
        .route("/logout", get(login::handle_logout))
        .route(
            "/password/forgot",
            get(login::serve_forgot_password_page).post(login::handle_forgot_password),
        )
        .route(
            "/password/reset",
            get(login::serve_reset_password_page).post(login::handle_reset_password),
        )
        .merge(protected)
        .nest_service("/static", ServeDir::new("static"))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub async fn run(config: ErpConfig) -> Result<(), Box<dyn std::error::Error>> {
    let conn = db::open(&config.database_path)?;
    std::fs::create_dir_all(&config.upload_dir)?;
    let bind_addr = config.bind_addr.clone();

    if crate::users::count_admins(&conn)? == 0 {
        log::warn!("no active administrator exists; create one with `erp-cli create-user`");
    }

    let app_state = Arc::new(AppState::new(conn, config)?);
    let app = router(app_state);

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
