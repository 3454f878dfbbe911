//! Payroll batches (`payroll_master`), their per-employee records and line items.
//!
//! Every mutation runs in one transaction together with the aggregate updates
//! that keep record and batch totals equal to the sum of their items.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::auth::Permission;
use crate::db::{like_pattern, now, parse_column};
use crate::error::{AppError, AppResult};
use crate::money::Money;
use crate::users::User;

lazy_static! {
    static ref PERIOD_RE: Regex = Regex::new(r"^\d{4}-(0[1-9]|1[0-2])$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayrollStatus {
    Draft,
    Reviewed,
    Locked,
    Paid,
}

impl PayrollStatus {
    pub const ALL: [PayrollStatus; 4] = [
        PayrollStatus::Draft,
        PayrollStatus::Reviewed,
        PayrollStatus::Locked,
        PayrollStatus::Paid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PayrollStatus::Draft => "draft",
            PayrollStatus::Reviewed => "reviewed",
            PayrollStatus::Locked => "locked",
            PayrollStatus::Paid => "paid",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PayrollStatus::Draft => "Draft",
            PayrollStatus::Reviewed => "Reviewed",
            PayrollStatus::Locked => "Locked",
            PayrollStatus::Paid => "Paid",
        }
    }

    /// Line items can be changed until the batch is locked.
    pub fn items_editable(self) -> bool {
        matches!(self, PayrollStatus::Draft | PayrollStatus::Reviewed)
    }

    /// Title, employee list and basic salaries are only editable in draft.
    pub fn header_editable(self) -> bool {
        self == PayrollStatus::Draft
    }
}

impl fmt::Display for PayrollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayrollStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "draft" => Ok(PayrollStatus::Draft),
            "reviewed" => Ok(PayrollStatus::Reviewed),
            "locked" => Ok(PayrollStatus::Locked),
            "paid" => Ok(PayrollStatus::Paid),
            other => Err(AppError::validation(format!("Unknown payroll status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayrollAction {
    Review,
    Return,
    Lock,
    Unlock,
    Pay,
    Delete,
}

impl PayrollAction {
    pub const ALL: [PayrollAction; 6] = [
        PayrollAction::Review,
        PayrollAction::Return,
        PayrollAction::Lock,
        PayrollAction::Unlock,
        PayrollAction::Pay,
        PayrollAction::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PayrollAction::Review => "review",
            PayrollAction::Return => "return",
            PayrollAction::Lock => "lock",
            PayrollAction::Unlock => "unlock",
            PayrollAction::Pay => "pay",
            PayrollAction::Delete => "delete",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PayrollAction::Review => "Mark reviewed",
            PayrollAction::Return => "Return to draft",
            PayrollAction::Lock => "Lock",
            PayrollAction::Unlock => "Unlock",
            PayrollAction::Pay => "Mark paid",
            PayrollAction::Delete => "Delete",
        }
    }

    pub fn permission(self) -> Permission {
        match self {
            PayrollAction::Review | PayrollAction::Return => Permission::ReviewPayroll,
            PayrollAction::Lock => Permission::LockPayroll,
            PayrollAction::Unlock => Permission::UnlockPayroll,
            PayrollAction::Pay => Permission::PayPayroll,
            PayrollAction::Delete => Permission::EditPayroll,
        }
    }

    /// The only status this action may start from.
    pub fn from_status(self) -> PayrollStatus {
        match self {
            PayrollAction::Review | PayrollAction::Delete => PayrollStatus::Draft,
            PayrollAction::Return | PayrollAction::Lock => PayrollStatus::Reviewed,
            PayrollAction::Unlock | PayrollAction::Pay => PayrollStatus::Locked,
        }
    }

    /// Resulting status; `None` for delete.
    pub fn to_status(self) -> Option<PayrollStatus> {
        match self {
            PayrollAction::Review | PayrollAction::Unlock => Some(PayrollStatus::Reviewed),
            PayrollAction::Return => Some(PayrollStatus::Draft),
            PayrollAction::Lock => Some(PayrollStatus::Locked),
            PayrollAction::Pay => Some(PayrollStatus::Paid),
            PayrollAction::Delete => None,
        }
    }

    /// Actions a user may take on a batch in the given status.
    pub fn available(status: PayrollStatus, user: &User) -> Vec<PayrollAction> {
        Self::ALL
            .into_iter()
            .filter(|a| a.from_status() == status && user.can(a.permission()))
            .collect()
    }
}

impl FromStr for PayrollAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s.trim())
            .ok_or_else(|| AppError::validation(format!("Unknown payroll action '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Earning,
    Deduction,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Earning => "earning",
            ItemKind::Deduction => "deduction",
        }
    }
}

impl FromStr for ItemKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "earning" => Ok(ItemKind::Earning),
            "deduction" => Ok(ItemKind::Deduction),
            other => Err(AppError::validation(format!("Unknown item kind '{other}'"))),
        }
    }
}

/// A payroll batch
///
/// One row of `payroll_master` plus the creator's name and the number of
/// records, as shown in the list and on the detail page.
#[derive(Debug, Clone, Serialize)]
pub struct PayrollMaster {
    /// Row id
    pub id: i64,

    /// Human-readable number, `PAY-YYYYMM-NNNN`
    pub transaction_no: String,

    /// Pay month, `YYYY-MM`
    pub period: String,

    /// Free text such as "May salaries"
    pub title: String,

    /// Current position in the draft → paid progression
    pub status: PayrollStatus,

    /// Sum of the records' net amounts
    pub total: Money,

    /// User who created the batch
    pub created_by: i64,
    pub created_by_name: String,
    pub created_at: String,

    /// Set when the batch was last reviewed, cleared when it is returned
    pub reviewed_at: Option<String>,

    /// Set when the batch was locked, cleared on unlock
    pub locked_at: Option<String>,

    /// Set once, when the batch is paid
    pub paid_at: Option<String>,

    /// Number of employee records
    pub record_count: i64,
}

/// An earning or deduction line on a record.
#[derive(Debug, Clone, Serialize)]
pub struct PayrollItem {
    pub id: i64,
    pub record_id: i64,
    pub kind: ItemKind,
    pub description: String,
    pub amount: Money,
}

/// One employee's line in a batch
///
/// `earnings`, `deductions` and `net` are stored aggregates kept equal to
/// the items by every mutation: `net = basic_salary + earnings - deductions`.
#[derive(Debug, Clone, Serialize)]
pub struct PayrollRecord {
    /// Row id
    pub id: i64,

    /// Owning batch
    pub payroll_id: i64,

    /// The employee's user id, with their display and login names
    pub employee_id: i64,
    pub employee_name: String,
    pub employee_username: String,

    /// Salary copied from the user when the record was created
    pub basic_salary: Money,

    /// Sum of the earning items
    pub earnings: Money,

    /// Sum of the deduction items
    pub deductions: Money,

    /// Amount paid out
    pub net: Money,

    /// Line items, earnings before deductions
    pub items: Vec<PayrollItem>,
}

/// Item as submitted by the bulk update endpoint. Items without an id are new.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemInput {
    #[serde(default)]
    pub id: Option<i64>,
    pub kind: ItemKind,
    pub description: String,
    pub amount: Money,
}

/// Totals returned to the AJAX endpoints after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub payroll_id: i64,
    pub record_id: i64,
    pub earnings: Money,
    pub deductions: Money,
    pub net: Money,
    pub payroll_total: Money,
}

/// Filters of the payroll list; `None` fields don't restrict.
#[derive(Debug, Clone, Default)]
pub struct PayrollFilter {
    pub status: Option<PayrollStatus>,
    pub period: Option<String>,
    pub q: Option<String>,
}

/// A paid record shown on the employee's payslip page.
#[derive(Debug, Clone, Serialize)]
pub struct Payslip {
    pub transaction_no: String,
    pub period: String,
    pub title: String,
    pub paid_at: Option<String>,
    pub record: PayrollRecord,
}

/// A period is a zero-padded `YYYY-MM` month, e.g. `2024-03`.
pub fn validate_period(period: &str) -> AppResult<()> {
    let period = period.trim();
    if !PERIOD_RE.is_match(period) {
        return Err(AppError::validation("Period must look like YYYY-MM"));
    }
    NaiveDate::parse_from_str(&format!("{}-01", period), "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| AppError::validation("Period must look like YYYY-MM"))
}

/// `PAY-YYYYMM-NNNN`.
pub fn format_transaction_no(period: &str, seq: i64) -> String {
    format!("PAY-{}-{:04}", period.replace('-', ""), seq)
}

fn next_transaction_no(tx: &Transaction<'_>, period: &str) -> AppResult<String> {
    let prefix = format!("PAY-{}-", period.replace('-', ""));
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(CAST(substr(transaction_no, ?2) AS INTEGER)) FROM payroll_master \
         WHERE substr(transaction_no, 1, ?3) = ?1",
        params![prefix, prefix.len() as i64 + 1, prefix.len() as i64],
        |row| row.get(0),
    )?;
    Ok(format_transaction_no(period, last.unwrap_or(0) + 1))
}

fn require(user: &User, permission: Permission) -> AppResult<()> {
    if user.can(permission) {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

const MASTER_SELECT: &str = "SELECT m.id, m.transaction_no, m.period, m.title, m.status, m.total_cents, \
     m.created_by, COALESCE(u.full_name, ''), m.created_at, m.reviewed_at, m.locked_at, m.paid_at, \
     (SELECT COUNT(*) FROM payroll_records r WHERE r.payroll_id = m.id) \
     FROM payroll_master m LEFT JOIN users u ON u.id = m.created_by";

fn master_from_row(row: &Row<'_>) -> rusqlite::Result<PayrollMaster> {
    Ok(PayrollMaster {
        id: row.get(0)?,
        transaction_no: row.get(1)?,
        period: row.get(2)?,
        title: row.get(3)?,
        status: parse_column(row, 4)?,
        total: Money::from_cents(row.get(5)?),
        created_by: row.get(6)?,
        created_by_name: row.get(7)?,
        created_at: row.get(8)?,
        reviewed_at: row.get(9)?,
        locked_at: row.get(10)?,
        paid_at: row.get(11)?,
        record_count: row.get(12)?,
    })
}

const RECORD_SELECT: &str = "SELECT r.id, r.payroll_id, r.employee_id, u.full_name, u.username, \
     r.basic_salary_cents, r.earnings_cents, r.deductions_cents, r.net_cents \
     FROM payroll_records r JOIN users u ON u.id = r.employee_id";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PayrollRecord> {
    Ok(PayrollRecord {
        id: row.get(0)?,
        payroll_id: row.get(1)?,
        employee_id: row.get(2)?,
        employee_name: row.get(3)?,
        employee_username: row.get(4)?,
        basic_salary: Money::from_cents(row.get(5)?),
        earnings: Money::from_cents(row.get(6)?),
        deductions: Money::from_cents(row.get(7)?),
        net: Money::from_cents(row.get(8)?),
        items: Vec::new(),
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<PayrollItem> {
    Ok(PayrollItem {
        id: row.get(0)?,
        record_id: row.get(1)?,
        kind: parse_column(row, 2)?,
        description: row.get(3)?,
        amount: Money::from_cents(row.get(4)?),
    })
}

/// Create a payroll batch
///
/// Issues the next transaction number for the period and adds one record per
/// active employee with a non-zero basic salary, all in one transaction.
///
/// # Arguments
/// * `conn` - Open database connection
/// * `actor` - The user creating the batch (needs `EditPayroll`)
/// * `period` - Pay month as `YYYY-MM`
/// * `title` - Non-empty title
///
/// # Returns
/// * `AppResult<i64>` - The new batch id
///
/// # Errors
/// * `Forbidden` without `EditPayroll`
/// * `Validation` for a malformed period or an empty title
pub fn create_payroll(conn: &Connection, actor: &User, period: &str, title: &str) -> AppResult<i64> {
    require(actor, Permission::EditPayroll)?;
    let period = period.trim();
    validate_period(period)?;
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Title is required"));
    }

    let tx = conn.unchecked_transaction()?;
    let transaction_no = next_transaction_no(&tx, period)?;
    tx.execute(
        "INSERT INTO payroll_master (transaction_no, period, title, status, created_by, created_at) \
         VALUES (?1, ?2, ?3, 'draft', ?4, ?5)",
        params![transaction_no, period, title, actor.id, now()],
    )?;
    let payroll_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO payroll_records (payroll_id, employee_id, basic_salary_cents) \
         SELECT ?1, id, basic_salary_cents FROM users \
         WHERE status = 'active' AND basic_salary_cents > 0",
        [payroll_id],
    )?;
    recalc_all_records(&tx, payroll_id)?;
    recalc_master(&tx, payroll_id)?;
    tx.commit()?;

    log::info!("{} created payroll {} for {}", actor.username, transaction_no, period);
    Ok(payroll_id)
}

pub fn find_payroll(conn: &Connection, id: i64) -> AppResult<Option<PayrollMaster>> {
    let sql = format!("{MASTER_SELECT} WHERE m.id = ?1");
    Ok(conn.query_row(&sql, [id], master_from_row).optional()?)
}

pub fn get_payroll(conn: &Connection, id: i64) -> AppResult<PayrollMaster> {
    find_payroll(conn, id)?.ok_or(AppError::NotFound)
}

pub fn list_payrolls(conn: &Connection, filter: &PayrollFilter) -> AppResult<Vec<PayrollMaster>> {
    let mut sql = format!("{MASTER_SELECT} WHERE 1 = 1");
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = filter.status {
        sql.push_str(" AND m.status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(period) = filter.period.as_deref().filter(|p| !p.trim().is_empty()) {
        sql.push_str(" AND m.period = ?");
        values.push(Value::Text(period.trim().to_string()));
    }
    if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        sql.push_str(" AND (m.transaction_no LIKE ? ESCAPE '\\' OR m.title LIKE ? ESCAPE '\\')");
        let pattern = like_pattern(q);
        values.push(Value::Text(pattern.clone()));
        values.push(Value::Text(pattern));
    }
    sql.push_str(" ORDER BY m.period DESC, m.id DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), master_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn items_for_record(conn: &Connection, record_id: i64) -> AppResult<Vec<PayrollItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, record_id, kind, description, amount_cents FROM payroll_items \
         WHERE record_id = ?1 ORDER BY kind DESC, id",
    )?;
    let items = stmt
        .query_map([record_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// All records of a batch, with their items, ordered by employee name.
pub fn records_for(conn: &Connection, payroll_id: i64) -> AppResult<Vec<PayrollRecord>> {
    let sql = format!("{RECORD_SELECT} WHERE r.payroll_id = ?1 ORDER BY u.full_name, r.id");
    let mut stmt = conn.prepare(&sql)?;
    let mut records = stmt
        .query_map([payroll_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for record in &mut records {
        record.items = items_for_record(conn, record.id)?;
    }
    Ok(records)
}

pub fn get_record(conn: &Connection, record_id: i64) -> AppResult<PayrollRecord> {
    let sql = format!("{RECORD_SELECT} WHERE r.id = ?1");
    let mut record = conn
        .query_row(&sql, [record_id], record_from_row)
        .optional()?
        .ok_or(AppError::NotFound)?;
    record.items = items_for_record(conn, record_id)?;
    Ok(record)
}

fn recalc_record(tx: &Transaction<'_>, record_id: i64) -> AppResult<()> {
    tx.execute(
        "UPDATE payroll_records SET \
           earnings_cents = basic_salary_cents + COALESCE((SELECT SUM(amount_cents) FROM payroll_items \
               WHERE record_id = payroll_records.id AND kind = 'earning'), 0), \
           deductions_cents = COALESCE((SELECT SUM(amount_cents) FROM payroll_items \
               WHERE record_id = payroll_records.id AND kind = 'deduction'), 0) \
         WHERE id = ?1",
        [record_id],
    )?;
    tx.execute(
        "UPDATE payroll_records SET net_cents = earnings_cents - deductions_cents WHERE id = ?1",
        [record_id],
    )?;
    Ok(())
}

fn recalc_all_records(tx: &Transaction<'_>, payroll_id: i64) -> AppResult<()> {
    let mut stmt = tx.prepare("SELECT id FROM payroll_records WHERE payroll_id = ?1")?;
    let ids = stmt
        .query_map([payroll_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in ids {
        recalc_record(tx, id)?;
    }
    Ok(())
}

fn recalc_master(tx: &Transaction<'_>, payroll_id: i64) -> AppResult<()> {
    tx.execute(
        "UPDATE payroll_master SET total_cents = \
           COALESCE((SELECT SUM(net_cents) FROM payroll_records WHERE payroll_id = ?1), 0) \
         WHERE id = ?1",
        [payroll_id],
    )?;
    Ok(())
}

fn totals(tx: &Transaction<'_>, record_id: i64) -> AppResult<Totals> {
    Ok(tx.query_row(
        "SELECT r.payroll_id, r.id, r.earnings_cents, r.deductions_cents, r.net_cents, m.total_cents \
         FROM payroll_records r JOIN payroll_master m ON m.id = r.payroll_id WHERE r.id = ?1",
        [record_id],
        |row| {
            Ok(Totals {
                payroll_id: row.get(0)?,
                record_id: row.get(1)?,
                earnings: Money::from_cents(row.get(2)?),
                deductions: Money::from_cents(row.get(3)?),
                net: Money::from_cents(row.get(4)?),
                payroll_total: Money::from_cents(row.get(5)?),
            })
        },
    )?)
}

/// Status of the batch owning a record, checked inside the transaction.
fn record_status(tx: &Transaction<'_>, record_id: i64) -> AppResult<(i64, PayrollStatus)> {
    tx.query_row(
        "SELECT m.id, m.status FROM payroll_records r \
         JOIN payroll_master m ON m.id = r.payroll_id WHERE r.id = ?1",
        [record_id],
        |row| Ok((row.get(0)?, parse_column(row, 1)?)),
    )
    .optional()?
    .ok_or(AppError::NotFound)
}

fn ensure_items_editable(status: PayrollStatus) -> AppResult<()> {
    if status.items_editable() {
        Ok(())
    } else {
        Err(AppError::conflict(format!(
            "Payroll is {}; items can no longer be changed",
            status.label().to_lowercase()
        )))
    }
}

fn validate_item(description: &str, amount: Money) -> AppResult<()> {
    if description.trim().is_empty() {
        return Err(AppError::validation("Item description is required"));
    }
    if !amount.is_positive() {
        return Err(AppError::validation("Item amount must be greater than zero"));
    }
    if amount > Money::MAX {
        return Err(AppError::validation("Item amount is too large"));
    }
    Ok(())
}

pub fn add_item(
    conn: &Connection,
    actor: &User,
    record_id: i64,
    kind: ItemKind,
    description: &str,
    amount: Money,
) -> AppResult<Totals> {
    require(actor, Permission::EditPayroll)?;
    validate_item(description, amount)?;

    let tx = conn.unchecked_transaction()?;
    let (payroll_id, status) = record_status(&tx, record_id)?;
    ensure_items_editable(status)?;
    tx.execute(
        "INSERT INTO payroll_items (record_id, kind, description, amount_cents) VALUES (?1, ?2, ?3, ?4)",
        params![record_id, kind.as_str(), description.trim(), amount.cents()],
    )?;
    recalc_record(&tx, record_id)?;
    recalc_master(&tx, payroll_id)?;
    let result = totals(&tx, record_id)?;
    tx.commit()?;
    Ok(result)
}

/// Upsert the items of one record: items with an id are updated, the rest inserted.
pub fn update_items(
    conn: &Connection,
    actor: &User,
    record_id: i64,
    items: &[ItemInput],
) -> AppResult<Totals> {
    require(actor, Permission::EditPayroll)?;
    for item in items {
        validate_item(&item.description, item.amount)?;
    }

    let tx = conn.unchecked_transaction()?;
    let (payroll_id, status) = record_status(&tx, record_id)?;
    ensure_items_editable(status)?;

    for item in items {
        match item.id {
            Some(item_id) => {
                let changed = tx.execute(
                    "UPDATE payroll_items SET kind = ?1, description = ?2, amount_cents = ?3 \
                     WHERE id = ?4 AND record_id = ?5",
                    params![
                        item.kind.as_str(),
                        item.description.trim(),
                        item.amount.cents(),
                        item_id,
                        record_id
                    ],
                )?;
                if changed == 0 {
                    return Err(AppError::validation(format!(
                        "Item {item_id} does not belong to this record"
                    )));
                }
            }
            None => {
                tx.execute(
                    "INSERT INTO payroll_items (record_id, kind, description, amount_cents) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record_id,
                        item.kind.as_str(),
                        item.description.trim(),
                        item.amount.cents()
                    ],
                )?;
            }
        }
    }

    recalc_record(&tx, record_id)?;
    recalc_master(&tx, payroll_id)?;
    let result = totals(&tx, record_id)?;
    tx.commit()?;
    log::info!(
        "{} updated {} item(s) on payroll record {}",
        actor.username,
        items.len(),
        record_id
    );
    Ok(result)
}

pub fn delete_item(conn: &Connection, actor: &User, item_id: i64) -> AppResult<Totals> {
    require(actor, Permission::EditPayroll)?;

    let tx = conn.unchecked_transaction()?;
    let record_id: i64 = tx
        .query_row(
            "SELECT record_id FROM payroll_items WHERE id = ?1",
            [item_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(AppError::NotFound)?;
    let (payroll_id, status) = record_status(&tx, record_id)?;
    ensure_items_editable(status)?;

    tx.execute("DELETE FROM payroll_items WHERE id = ?1", [item_id])?;
    recalc_record(&tx, record_id)?;
    recalc_master(&tx, payroll_id)?;
    let result = totals(&tx, record_id)?;
    tx.commit()?;
    log::info!("{} deleted payroll item {}", actor.username, item_id);
    Ok(result)
}

/// Change the basic salary on a record. Draft only.
pub fn update_basic_salary(
    conn: &Connection,
    actor: &User,
    record_id: i64,
    amount: Money,
) -> AppResult<Totals> {
    require(actor, Permission::EditPayroll)?;
    if amount.cents() < 0 {
        return Err(AppError::validation("Basic salary cannot be negative"));
    }
    if amount > Money::MAX {
        return Err(AppError::validation("Basic salary is too large"));
    }

    let tx = conn.unchecked_transaction()?;
    let (payroll_id, status) = record_status(&tx, record_id)?;
    if !status.header_editable() {
        return Err(AppError::conflict(
            "Basic salaries can only be changed while the payroll is a draft",
        ));
    }
    tx.execute(
        "UPDATE payroll_records SET basic_salary_cents = ?1 WHERE id = ?2",
        params![amount.cents(), record_id],
    )?;
    recalc_record(&tx, record_id)?;
    recalc_master(&tx, payroll_id)?;
    let result = totals(&tx, record_id)?;
    tx.commit()?;
    Ok(result)
}

pub fn update_title(conn: &Connection, actor: &User, payroll_id: i64, title: &str) -> AppResult<()> {
    require(actor, Permission::EditPayroll)?;
    let title = title.trim();
    if title.is_empty() {
        return Err(AppError::validation("Title is required"));
    }
    let changed = conn.execute(
        "UPDATE payroll_master SET title = ?1 WHERE id = ?2 AND status = 'draft'",
        params![title, payroll_id],
    )?;
    if changed == 0 {
        get_payroll(conn, payroll_id)?;
        return Err(AppError::conflict(
            "The title can only be changed while the payroll is a draft",
        ));
    }
    Ok(())
}

/// Add an employee to a draft batch.
pub fn add_record(conn: &Connection, actor: &User, payroll_id: i64, employee_id: i64) -> AppResult<()> {
    require(actor, Permission::EditPayroll)?;

    let tx = conn.unchecked_transaction()?;
    let status: PayrollStatus = tx
        .query_row(
            "SELECT status FROM payroll_master WHERE id = ?1",
            [payroll_id],
            |row| parse_column(row, 0),
        )
        .optional()?
        .ok_or(AppError::NotFound)?;
    if !status.header_editable() {
        return Err(AppError::conflict(
            "Employees can only be added while the payroll is a draft",
        ));
    }
    let salary: i64 = tx
        .query_row(
            "SELECT basic_salary_cents FROM users WHERE id = ?1 AND status = 'active'",
            [employee_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::validation("Unknown or inactive employee"))?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO payroll_records (payroll_id, employee_id, basic_salary_cents) \
         VALUES (?1, ?2, ?3)",
        params![payroll_id, employee_id, salary],
    )?;
    if inserted == 0 {
        return Err(AppError::conflict("Employee is already on this payroll"));
    }
    let record_id = tx.last_insert_rowid();
    recalc_record(&tx, record_id)?;
    recalc_master(&tx, payroll_id)?;
    tx.commit()?;
    Ok(())
}

/// Remove an employee's record (and its items) from a draft batch.
pub fn remove_record(conn: &Connection, actor: &User, record_id: i64) -> AppResult<i64> {
    require(actor, Permission::EditPayroll)?;

    let tx = conn.unchecked_transaction()?;
    let (payroll_id, status) = record_status(&tx, record_id)?;
    if !status.header_editable() {
        return Err(AppError::conflict(
            "Employees can only be removed while the payroll is a draft",
        ));
    }
    tx.execute("DELETE FROM payroll_records WHERE id = ?1", [record_id])?;
    recalc_master(&tx, payroll_id)?;
    tx.commit()?;
    Ok(payroll_id)
}

/// Apply a guarded status transition
///
/// The UPDATE only matches when the batch is still in the action's source
/// status; otherwise nothing changes.
///
/// # Arguments
/// * `conn` - Open database connection
/// * `actor` - The acting user; the action's permission is checked first
/// * `payroll_id` - The batch to move
/// * `action` - One of review, return, lock, unlock, pay, delete
///
/// # Returns
/// * `AppResult<Option<PayrollStatus>>` - The new status, `None` after delete
///
/// # Errors
/// * `Forbidden` without the action's permission
/// * `NotFound` for an unknown batch
/// * `Conflict` when the batch is not in the action's source status, or an
///   empty batch is reviewed
pub fn apply_action(
    conn: &Connection,
    actor: &User,
    payroll_id: i64,
    action: PayrollAction,
) -> AppResult<Option<PayrollStatus>> {
    require(actor, action.permission())?;

    let tx = conn.unchecked_transaction()?;
    let current: PayrollStatus = tx
        .query_row(
            "SELECT status FROM payroll_master WHERE id = ?1",
            [payroll_id],
            |row| parse_column(row, 0),
        )
        .optional()?
        .ok_or(AppError::NotFound)?;
    let from = action.from_status();
    if current != from {
        return Err(AppError::conflict(format!(
            "Cannot {} a payroll that is {} (must be {})",
            action.as_str(),
            current.label().to_lowercase(),
            from.label().to_lowercase()
        )));
    }

    let ts = now();
    let changed = match action {
        PayrollAction::Review => {
            let records: i64 = tx.query_row(
                "SELECT COUNT(*) FROM payroll_records WHERE payroll_id = ?1",
                [payroll_id],
                |row| row.get(0),
            )?;
            if records == 0 {
                return Err(AppError::conflict("An empty payroll cannot be reviewed"));
            }
            tx.execute(
                "UPDATE payroll_master SET status = 'reviewed', reviewed_by = ?1, reviewed_at = ?2 \
                 WHERE id = ?3 AND status = 'draft'",
                params![actor.id, ts, payroll_id],
            )?
        }
        PayrollAction::Return => tx.execute(
            "UPDATE payroll_master SET status = 'draft', reviewed_by = NULL, reviewed_at = NULL \
             WHERE id = ?1 AND status = 'reviewed'",
            [payroll_id],
        )?,
        PayrollAction::Lock => {
            recalc_all_records(&tx, payroll_id)?;
            recalc_master(&tx, payroll_id)?;
            tx.execute(
                "UPDATE payroll_master SET status = 'locked', locked_by = ?1, locked_at = ?2 \
                 WHERE id = ?3 AND status = 'reviewed'",
                params![actor.id, ts, payroll_id],
            )?
        }
        PayrollAction::Unlock => tx.execute(
            "UPDATE payroll_master SET status = 'reviewed', locked_by = NULL, locked_at = NULL \
             WHERE id = ?1 AND status = 'locked'",
            [payroll_id],
        )?,
        PayrollAction::Pay => tx.execute(
            "UPDATE payroll_master SET status = 'paid', paid_by = ?1, paid_at = ?2 \
             WHERE id = ?3 AND status = 'locked'",
            params![actor.id, ts, payroll_id],
        )?,
        PayrollAction::Delete => tx.execute(
            "DELETE FROM payroll_master WHERE id = ?1 AND status = 'draft'",
            [payroll_id],
        )?,
    };
    if changed == 0 {
        return Err(AppError::conflict(
            "The payroll was changed by someone else; reload and try again",
        ));
    }
    tx.commit()?;

    log::info!(
        "{} applied '{}' to payroll {}",
        actor.username,
        action.as_str(),
        payroll_id
    );
    Ok(action.to_status())
}

/// The employee's records in paid batches, newest first.
pub fn payslips_for(conn: &Connection, employee_id: i64) -> AppResult<Vec<Payslip>> {
    let mut stmt = conn.prepare(
        "SELECT m.transaction_no, m.period, m.title, m.paid_at, r.id FROM payroll_records r \
         JOIN payroll_master m ON m.id = r.payroll_id \
         WHERE r.employee_id = ?1 AND m.status = 'paid' ORDER BY m.period DESC, m.id DESC",
    )?;
    let heads = stmt
        .query_map([employee_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    heads
        .into_iter()
        .map(|(transaction_no, period, title, paid_at, record_id)| -> AppResult<Payslip> {
            Ok(Payslip {
                transaction_no,
                period,
                title,
                paid_at,
                record: get_record(conn, record_id)?,
            })
        })
        .collect()
}

pub fn status_counts(conn: &Connection) -> AppResult<Vec<(PayrollStatus, i64)>> {
    PayrollStatus::ALL
        .into_iter()
        .map(|status| -> AppResult<(PayrollStatus, i64)> {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM payroll_master WHERE status = ?1",
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
    fn transaction_numbers_are_zero_padded() {
        assert_eq!(format_transaction_no("2024-03", 7), "PAY-202403-0007");
        assert_eq!(format_transaction_no("2024-12", 12345), "PAY-202412-12345");
    }

    #[test]
    fn periods_must_be_year_month() {
        assert!(validate_period("2024-02").is_ok());
        assert!(validate_period("2024-13").is_err());
        assert!(validate_period("March").is_err());
    }

    #[test]
    fn periods_need_a_two_digit_month() {
        assert!(validate_period("2024-3").is_err());
        assert!(validate_period("2024-003").is_err());
        assert!(validate_period("24-03").is_err());
        assert!(validate_period("2024-03").is_ok());
        assert_eq!(format_transaction_no("2024-03", 1), "PAY-202403-0001");
    }

    #[test]
    fn transitions_are_linear() {
        assert_eq!(PayrollAction::Review.from_status(), PayrollStatus::Draft);
        assert_eq!(PayrollAction::Lock.from_status(), PayrollStatus::Reviewed);
        assert_eq!(PayrollAction::Pay.from_status(), PayrollStatus::Locked);
        assert_eq!(PayrollAction::Pay.to_status(), Some(PayrollStatus::Paid));
        assert_eq!(PayrollAction::Delete.to_status(), None);
    }

    #[test]
    fn editing_is_gated_by_status() {
        assert!(PayrollStatus::Draft.header_editable());
        assert!(!PayrollStatus::Reviewed.header_editable());
        assert!(PayrollStatus::Reviewed.items_editable());
        assert!(!PayrollStatus::Locked.items_editable());
        assert!(!PayrollStatus::Paid.items_editable());
    }
}
