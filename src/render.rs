//! Handlebars templates compiled into the binary, and the page context every
//! template receives.

use axum::response::Html;
use handlebars::Handlebars;
use serde_json::{Map, Value, json};

use crate::app::AppState;
use crate::auth::Permission;
use crate::error::{AppError, AppResult};
use crate::login::{CurrentUser, take_flash};

const TEMPLATES: &[(&str, &str)] = &[
    ("login", include_str!("../templates/login.hbs")),
    ("password_change", include_str!("../templates/password_change.hbs")),
    ("password_forgot", include_str!("../templates/password_forgot.hbs")),
    ("password_reset", include_str!("../templates/password_reset.hbs")),
    ("dashboard", include_str!("../templates/dashboard.hbs")),
    ("users_list", include_str!("../templates/users_list.hbs")),
    ("user_form", include_str!("../templates/user_form.hbs")),
    ("payroll_list", include_str!("../templates/payroll_list.hbs")),
    ("payroll_new", include_str!("../templates/payroll_new.hbs")),
    ("payroll_detail", include_str!("../templates/payroll_detail.hbs")),
    ("payslips", include_str!("../templates/payslips.hbs")),
    ("projects_list", include_str!("../templates/projects_list.hbs")),
    ("project_form", include_str!("../templates/project_form.hbs")),
    ("project_detail", include_str!("../templates/project_detail.hbs")),
];

/// Register the layout partial and every page template.
pub fn build_templates() -> AppResult<Handlebars<'static>> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(false);
    hb.register_partial("layout", include_str!("../templates/layout.hbs"))
        .map_err(|e| AppError::Internal(format!("layout template: {e}")))?;
    for (name, source) in TEMPLATES {
        hb.register_template_string(name, *source)
            .map_err(|e| AppError::Internal(format!("template {name}: {e}")))?;
    }
    Ok(hb)
}

/// Capabilities exposed to templates for showing or hiding navigation and buttons.
fn permissions_context(current: &CurrentUser) -> Value {
    let user = &current.user;
    json!({
        "manage_users": user.can(Permission::ManageUsers),
        "view_payroll": user.can(Permission::ViewPayroll),
        "edit_payroll": user.can(Permission::EditPayroll),
        "manage_projects": user.can(Permission::ManageProjects),
        "view_projects": user.can(Permission::ViewProjects),
    })
}

fn merge(base: &mut Map<String, Value>, data: Value) {
    if let Value::Object(extra) = data {
        for (key, value) in extra {
            base.insert(key, value);
        }
    }
}

/// Render a page for a logged-in user, consuming the pending flash message.
pub fn page(
    state: &AppState,
    current: &CurrentUser,
    template: &str,
    title: &str,
    data: Value,
) -> AppResult<Html<String>> {
    let mut context = Map::new();
    context.insert("title".to_string(), json!(title));
    context.insert(
        "current_user".to_string(),
        json!({
            "id": current.user.id,
            "username": current.user.username,
            "full_name": current.user.full_name,
            "role": current.user.role.label(),
        }),
    );
    context.insert("can".to_string(), permissions_context(current));
    context.insert("currency".to_string(), json!(state.config.currency));
    context.insert("flash".to_string(), json!(take_flash(&current.session_id)));
    merge(&mut context, data);

    Ok(Html(state.templates.render(template, &Value::Object(context))?))
}

/// Render a page that needs no session (login, password reset).
pub fn public_page(state: &AppState, template: &str, title: &str, data: Value) -> AppResult<Html<String>> {
    let mut context = Map::new();
    context.insert("title".to_string(), json!(title));
    merge(&mut context, data);

    Ok(Html(state.templates.render(template, &Value::Object(context))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_compiles() {
        let hb = build_templates().unwrap();
        for (name, _) in TEMPLATES {
            assert!(hb.has_template(name), "{name} missing");
        }
    }

    #[test]
    fn login_page_escapes_input() {
        let hb = build_templates().unwrap();
        let html = hb
            .render(
                "login",
                &json!({"title": "Sign in", "username": "<b>x</b>"}),
            )
            .unwrap();
        assert!(html.contains("&lt;b&gt;x&lt;/b&gt;"));
    }
}
