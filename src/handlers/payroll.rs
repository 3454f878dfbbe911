use axum::{
    Extension, Form, Json,
    extract::{Path, Query, State},
    response::{Html, Redirect, Response},
};
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::Permission;
use crate::downloader;
use crate::error::{AppError, AppResult, JsonError};
use crate::handlers::{attachment, flash_failure, non_empty, parse_field, parse_filter, redirect_after};
use crate::login::{CurrentUser, FlashKind};
use crate::money::Money;
use crate::payroll::{
    self, ItemInput, ItemKind, PayrollAction, PayrollFilter, PayrollRecord, PayrollStatus,
};
use crate::render;
use crate::users;

#[derive(Debug, Default, Deserialize)]
pub struct PayrollFilterQuery {
    pub status: Option<String>,
    pub period: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewPayrollForm {
    pub period: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct TitleForm {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct AddRecordForm {
    pub employee_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ItemForm {
    pub kind: String,
    pub description: String,
    pub amount: String,
}

#[derive(Debug, Deserialize)]
pub struct SalaryForm {
    pub basic_salary: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: PayrollAction,
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ItemsUpdateRequest {
    pub record_id: i64,
    pub items: Vec<ItemInput>,
}

#[derive(Debug, Deserialize)]
pub struct ItemDeleteRequest {
    pub item_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

fn parse_amount(text: &str, field: &str) -> AppResult<Money> {
    text.parse()
        .map_err(|_| AppError::validation(format!("{field} must be an amount like 150.00")))
}

/// The record must belong to the payroll named in the path.
fn record_in(conn: &Connection, payroll_id: i64, record_id: i64) -> AppResult<PayrollRecord> {
    let record = payroll::get_record(conn, record_id)?;
    if record.payroll_id != payroll_id {
        return Err(AppError::NotFound);
    }
    Ok(record)
}

fn detail_url(id: i64) -> String {
    format!("/payroll/{id}")
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<PayrollFilterQuery>,
) -> AppResult<Html<String>> {
    current.require(Permission::ViewPayroll)?;
    let filter = PayrollFilter {
        status: parse_filter(&query.status),
        period: non_empty(&query.period).map(str::to_string),
        q: non_empty(&query.q).map(str::to_string),
    };
    let batches = {
        let conn = state.db()?;
        payroll::list_payrolls(&conn, &filter)?
    };

    let statuses: Vec<Value> = PayrollStatus::ALL
        .iter()
        .map(|s| json!({"value": s.as_str(), "label": s.label(), "selected": Some(*s) == filter.status}))
        .collect();
    let rows: Vec<Value> = batches
        .iter()
        .map(|m| json!({"payroll": m, "status_label": m.status.label()}))
        .collect();

    render::page(
        &state,
        &current,
        "payroll_list",
        "Payroll",
        json!({
            "rows": rows,
            "statuses": statuses,
            "filter": {"period": filter.period, "q": filter.q},
        }),
    )
}

pub async fn new_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    current.require(Permission::EditPayroll)?;
    let period = Utc::now().format("%Y-%m").to_string();
    render::page(
        &state,
        &current,
        "payroll_new",
        "New payroll",
        json!({ "period": period, "title": format!("Salaries {period}") }),
    )
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Form(form): Form<NewPayrollForm>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        payroll::create_payroll(&conn, &current.user, form.period.trim(), &form.title)
    };
    match result {
        Ok(id) => {
            current.flash(FlashKind::Success, "Payroll created");
            Ok(Redirect::to(&detail_url(id)))
        }
        Err(err) => {
            flash_failure(&current, err)?;
            Ok(Redirect::to("/payroll/new"))
        }
    }
}

pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> AppResult<Html<String>> {
    current.require(Permission::ViewPayroll)?;
    let (master, records, active) = {
        let conn = state.db()?;
        (
            payroll::get_payroll(&conn, id)?,
            payroll::records_for(&conn, id)?,
            users::list_active(&conn)?,
        )
    };

    let on_payroll: HashSet<i64> = records.iter().map(|r| r.employee_id).collect();
    let candidates: Vec<Value> = active
        .iter()
        .filter(|u| !on_payroll.contains(&u.id))
        .map(|u| json!({"id": u.id, "full_name": u.full_name, "username": u.username}))
        .collect();
    let actions: Vec<Value> = PayrollAction::available(master.status, &current.user)
        .into_iter()
        .map(|a| json!({"action": a.as_str(), "label": a.label()}))
        .collect();
    let can_edit = current.user.can(Permission::EditPayroll);

    let title = format!("{} {}", master.transaction_no, master.title);
    render::page(
        &state,
        &current,
        "payroll_detail",
        &title,
        json!({
            "status_label": master.status.label(),
            "items_editable": can_edit && master.status.items_editable(),
            "header_editable": can_edit && master.status.header_editable(),
            "payroll": master,
            "records": records,
            "candidates": candidates,
            "actions": actions,
        }),
    )
}

pub async fn update_title(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<TitleForm>,
) -> AppResult<Redirect> {
    let result = {
        let conn = state.db()?;
        payroll::update_title(&conn, &current.user, id, &form.title)
    };
    redirect_after(&current, result, "Title updated", &detail_url(id))
}

pub async fn add_record(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Form(form): Form<AddRecordForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let employee_id = parse_field::<i64>(&form.employee_id, "employee")?
            .ok_or_else(|| AppError::validation("Choose an employee"))?;
        let conn = state.db()?;
        payroll::add_record(&conn, &current.user, id, employee_id)
    })();
    redirect_after(&current, result, "Employee added", &detail_url(id))
}

pub async fn add_item(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, record_id)): Path<(i64, i64)>,
    Form(form): Form<ItemForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let kind: ItemKind = form.kind.parse()?;
        let amount = parse_amount(&form.amount, "Amount")?;
        let conn = state.db()?;
        record_in(&conn, id, record_id)?;
        payroll::add_item(&conn, &current.user, record_id, kind, &form.description, amount)?;
        Ok(())
    })();
    redirect_after(&current, result, "Item added", &detail_url(id))
}

pub async fn update_salary(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, record_id)): Path<(i64, i64)>,
    Form(form): Form<SalaryForm>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<()> {
        let amount = parse_amount(&form.basic_salary, "Basic salary")?;
        let conn = state.db()?;
        record_in(&conn, id, record_id)?;
        payroll::update_basic_salary(&conn, &current.user, record_id, amount)?;
        Ok(())
    })();
    redirect_after(&current, result, "Basic salary updated", &detail_url(id))
}

pub async fn remove_record(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, record_id)): Path<(i64, i64)>,
) -> AppResult<Redirect> {
    let result = (|| -> AppResult<i64> {
        let conn = state.db()?;
        record_in(&conn, id, record_id)?;
        payroll::remove_record(&conn, &current.user, record_id)
    })();
    redirect_after(&current, result, "Employee removed", &detail_url(id))
}

/// `POST /payroll/actions` with `{"action": "review", "id": 7}`.
pub async fn actions(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, JsonError> {
    let request: ActionRequest = serde_json::from_value(body)
        .map_err(|e| AppError::validation(format!("Invalid action: {e}")))?;

    let status = {
        let conn = state.db()?;
        payroll::apply_action(&conn, &current.user, request.id, request.action)?
    };

    Ok(Json(match status {
        Some(status) => json!({
            "success": true,
            "message": format!("Payroll is now {}", status.label()),
            "status": status,
            "status_label": status.label(),
        }),
        None => json!({
            "success": true,
            "message": "Payroll deleted",
            "redirect": "/payroll",
        }),
    }))
}

/// `POST /api/payroll/items/update`: upsert a record's items and return the new totals.
pub async fn api_update_items(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, JsonError> {
    let request: ItemsUpdateRequest = serde_json::from_value(body)
        .map_err(|e| AppError::validation(format!("Invalid items: {e}")))?;

    let totals = {
        let conn = state.db()?;
        payroll::update_items(&conn, &current.user, request.record_id, &request.items)?
    };
    Ok(Json(json!({
        "success": true,
        "message": "Items saved",
        "totals": totals,
    })))
}

pub async fn api_delete_item(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, JsonError> {
    let request: ItemDeleteRequest = serde_json::from_value(body)
        .map_err(|e| AppError::validation(format!("Invalid request: {e}")))?;

    let totals = {
        let conn = state.db()?;
        payroll::delete_item(&conn, &current.user, request.item_id)?
    };
    Ok(Json(json!({
        "success": true,
        "message": "Item deleted",
        "totals": totals,
    })))
}

pub async fn export(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> AppResult<Response> {
    current.require(Permission::ViewPayroll)?;
    let (master, records) = {
        let conn = state.db()?;
        (payroll::get_payroll(&conn, id)?, payroll::records_for(&conn, id)?)
    };
    let table = downloader::payroll_table(&master, &records);
    let base = master.transaction_no.clone();

    match non_empty(&query.format).unwrap_or("csv") {
        "csv" => Ok(attachment(
            "text/csv; charset=utf-8",
            &format!("{base}.csv"),
            downloader::to_csv(&table),
        )),
        "xlsx" => Ok(attachment(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            &format!("{base}.xlsx"),
            downloader::to_xlsx(&table)?,
        )),
        "html" => Ok(attachment(
            "application/vnd.ms-excel",
            &format!("{base}.xls"),
            downloader::to_html_table(&table),
        )),
        other => Err(AppError::validation(format!("Unknown export format '{other}'"))),
    }
}

/// The signed-in user's paid payslips.
pub async fn payslips(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> AppResult<Html<String>> {
    let slips = {
        let conn = state.db()?;
        payroll::payslips_for(&conn, current.user.id)?
    };
    render::page(&state, &current, "payslips", "My payslips", json!({ "payslips": slips }))
}
