//! User accounts: storage, validation and the administrative actions behind
//! the users JSON API.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::auth::{
    self, Role, UserStatus, check_password_strength, generate_reset_code,
    generate_temporary_password, hash_password, verify_password,
};
use crate::db::{like_pattern, now, parse_column};
use crate::error::{AppError, AppResult};
use crate::money::Money;

/// Lifetime of a password reset code.
pub const RESET_CODE_TTL_MINUTES: i64 = 60;

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// A registered application user
///
/// One row of the `users` table. The password hash and any pending reset
/// code never leave the server: they are skipped when the user is serialized
/// into a template or a JSON response.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Row id
    pub id: i64,

    /// Login name, unique, 3-32 characters of `[A-Za-z0-9_.-]`
    pub username: String,

    /// Email address (unique, used for password recovery)
    pub email: String,

    /// Display name
    pub full_name: String,

    /// Argon2 hash of the user's password
    #[serde(skip)]
    pub password_hash: String,

    /// Role deciding the user's permissions
    pub role: Role,

    /// Inactive users cannot log in and get no payroll record
    pub status: UserStatus,

    /// Monthly salary copied into new payroll batches
    pub basic_salary: Money,

    /// Password reset code (if a reset has been requested)
    #[serde(skip)]
    pub reset_code: Option<String>,

    /// Expiration time for the reset code, RFC 3339
    #[serde(skip)]
    pub reset_code_expires: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn can(&self, permission: auth::Permission) -> bool {
        self.role.can(permission)
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// Data for a new account
///
/// Used by the create form and the `create-user` CLI command. New accounts
/// start out active.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login name (cannot be changed later)
    pub username: String,

    /// Email address
    pub email: String,

    /// Display name
    pub full_name: String,

    /// Initial role
    pub role: Role,

    /// Monthly basic salary, zero for users outside payroll
    pub basic_salary: Money,

    /// Password in plaintext (hashed before storage)
    pub password: String,
}

/// Editable fields of an existing account
#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub status: UserStatus,
    pub basic_salary: Money,
    /// `None` or empty keeps the current password.
    pub password: Option<String>,
}

/// Filters of the users list; `None` fields don't restrict.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    /// Substring of username, full name or email
    pub q: Option<String>,
    pub role: Option<Role>,
    pub status: Option<UserStatus>,
}

/// Actions accepted by the users JSON API.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    Activate { id: i64 },
    Deactivate { id: i64 },
    SetRole { id: i64, role: Role },
    ResetPassword { id: i64 },
    Delete { id: i64 },
}

/// Result of a users API action, merged into the JSON response.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Human-readable confirmation
    pub message: String,

    /// Only set by `reset_password`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporary_password: Option<String>,
}

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, role, status, \
     basic_salary_cents, reset_code, reset_code_expires, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        full_name: row.get(3)?,
        password_hash: row.get(4)?,
        role: parse_column(row, 5)?,
        status: parse_column(row, 6)?,
        basic_salary: Money::from_cents(row.get(7)?),
        reset_code: row.get(8)?,
        reset_code_expires: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn validate_profile(email: &str, full_name: &str, basic_salary: Money) -> AppResult<()> {
    if !EMAIL_RE.is_match(email.trim()) {
        return Err(AppError::validation("Please enter a valid email address"));
    }
    if full_name.trim().is_empty() {
        return Err(AppError::validation("Full name is required"));
    }
    if basic_salary.cents() < 0 {
        return Err(AppError::validation("Basic salary cannot be negative"));
    }
    if basic_salary > Money::MAX {
        return Err(AppError::validation("Basic salary is too large"));
    }
    Ok(())
}

pub fn validate_new_user(user: &NewUser) -> AppResult<()> {
    if !USERNAME_RE.is_match(user.username.trim()) {
        return Err(AppError::validation(
            "Username must be 3-32 characters of letters, digits, '.', '_' or '-'",
        ));
    }
    validate_profile(&user.email, &user.full_name, user.basic_salary)?;
    check_password_strength(&user.password)
}

/// Register a new user
///
/// Validates the fields, hashes the password and inserts an active account.
///
/// # Arguments
/// * `conn` - Open database connection
/// * `user` - The account to create
///
/// # Returns
/// * `AppResult<i64>` - The new user's id
///
/// # Errors
/// * `Validation` if a field is malformed or the password is too short
/// * `Conflict` if the username or email is already in use
pub fn create_user(conn: &Connection, user: &NewUser) -> AppResult<i64> {
    validate_new_user(user)?;
    let username = user.username.trim();
    let email = user.email.trim();

    if find_by_username(conn, username)?.is_some() {
        return Err(AppError::conflict("Username already exists"));
    }
    if find_by_email(conn, email)?.is_some() {
        return Err(AppError::conflict("Email address is already registered"));
    }

    let password_hash = hash_password(&user.password)?;
    let ts = now();
    conn.execute(
        "INSERT INTO users (username, email, full_name, password_hash, role, status, \
         basic_salary_cents, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?7)",
        params![
            username,
            email,
            user.full_name.trim(),
            password_hash,
            user.role.as_str(),
            user.basic_salary.cents(),
            ts
        ],
    )?;
    let id = conn.last_insert_rowid();
    log::info!("created user {} ({}) as {}", username, id, user.role);
    Ok(id)
}

pub fn find_user(conn: &Connection, id: i64) -> AppResult<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

pub fn get_user(conn: &Connection, id: i64) -> AppResult<User> {
    find_user(conn, id)?.ok_or(AppError::NotFound)
}

pub fn find_by_username(conn: &Connection, username: &str) -> AppResult<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1");
    Ok(conn.query_row(&sql, [username], user_from_row).optional()?)
}

pub fn find_by_email(conn: &Connection, email: &str) -> AppResult<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower(?1)");
    Ok(conn.query_row(&sql, [email.trim()], user_from_row).optional()?)
}

pub fn list_users(conn: &Connection, filter: &UserFilter) -> AppResult<Vec<User>> {
    let mut sql = format!("SELECT {USER_COLUMNS} FROM users WHERE 1 = 1");
    let mut values: Vec<Value> = Vec::new();

    if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        sql.push_str(
            " AND (username LIKE ? ESCAPE '\\' OR full_name LIKE ? ESCAPE '\\' \
             OR email LIKE ? ESCAPE '\\')",
        );
        let pattern = like_pattern(q);
        for _ in 0..3 {
            values.push(Value::Text(pattern.clone()));
        }
    }
    if let Some(role) = filter.role {
        sql.push_str(" AND role = ?");
        values.push(Value::Text(role.as_str().to_string()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    sql.push_str(" ORDER BY username");

    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map(params_from_iter(values.iter()), user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Active users, for pickers (project members, task assignees).
pub fn list_active(conn: &Connection) -> AppResult<Vec<User>> {
    list_users(
        conn,
        &UserFilter {
            status: Some(UserStatus::Active),
            ..UserFilter::default()
        },
    )
}

pub fn count_active(conn: &Connection) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users WHERE status = 'active'",
        [],
        |row| row.get(0),
    )?)
}

pub fn count_admins(conn: &Connection) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM users WHERE role = 'admin' AND status = 'active'",
        [],
        |row| row.get(0),
    )?)
}

/// Update an account's profile and, optionally, its password
///
/// Everything is validated before the first write, and the profile and
/// password changes commit together or not at all.
///
/// # Arguments
/// * `conn` - Open database connection
/// * `id` - The user to update
/// * `update` - The new field values
///
/// # Errors
/// * `Validation` for malformed fields or a too short password
/// * `Conflict` for a taken email or when the last active administrator
///   would be demoted or deactivated
pub fn update_user(conn: &Connection, id: i64, update: &UserUpdate) -> AppResult<()> {
    validate_profile(&update.email, &update.full_name, update.basic_salary)?;
    let current = get_user(conn, id)?;

    if let Some(other) = find_by_email(conn, &update.email)? {
        if other.id != id {
            return Err(AppError::conflict("Email address is already registered"));
        }
    }
    if current.role == Role::Admin
        && current.is_active()
        && (update.role != Role::Admin || update.status != UserStatus::Active)
        && count_admins(conn)? <= 1
    {
        return Err(AppError::conflict(
            "The last active administrator cannot be demoted or deactivated",
        ));
    }

    let password_hash = match update.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            check_password_strength(password)?;
            Some(hash_password(password)?)
        }
        None => None,
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE users SET email = ?1, full_name = ?2, role = ?3, status = ?4, \
         basic_salary_cents = ?5, updated_at = ?6 WHERE id = ?7",
        params![
            update.email.trim(),
            update.full_name.trim(),
            update.role.as_str(),
            update.status.as_str(),
            update.basic_salary.cents(),
            now(),
            id
        ],
    )?;
    if let Some(hash) = &password_hash {
        store_password_hash(&tx, id, hash)?;
    }
    tx.commit()?;

    log::info!("updated user {} ({})", current.username, id);
    Ok(())
}

pub fn set_password(conn: &Connection, id: i64, password: &str) -> AppResult<()> {
    check_password_strength(password)?;
    let hash = hash_password(password)?;
    store_password_hash(conn, id, &hash)
}

/// Replace the stored hash and drop any pending reset code.
fn store_password_hash(conn: &Connection, id: i64, hash: &str) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE users SET password_hash = ?1, reset_code = NULL, reset_code_expires = NULL, \
         updated_at = ?2 WHERE id = ?3",
        params![hash, now(), id],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

/// Verify credentials. Unknown users, wrong passwords and disabled accounts
/// all come back as `None`.
pub fn authenticate(conn: &Connection, username: &str, password: &str) -> AppResult<Option<User>> {
    let Some(user) = find_by_username(conn, username.trim())? else {
        return Ok(None);
    };
    if !verify_password(password, &user.password_hash)? {
        return Ok(None);
    }
    if !user.is_active() {
        log::warn!("login attempt for inactive user {}", user.username);
        return Ok(None);
    }
    Ok(Some(user))
}

pub fn change_password(
    conn: &Connection,
    user_id: i64,
    old_password: &str,
    new_password: &str,
    confirm_password: &str,
) -> AppResult<()> {
    let user = get_user(conn, user_id)?;
    if !verify_password(old_password, &user.password_hash)? {
        return Err(AppError::validation("Current password is incorrect"));
    }
    if new_password != confirm_password {
        return Err(AppError::validation("New passwords don't match"));
    }
    set_password(conn, user_id, new_password)?;
    log::info!("user {} changed their password", user.username);
    Ok(())
}

/// Store a fresh reset code on the account with this email. Returns the user
/// and the code so the caller can mail it; `None` when no account matches.
pub fn start_password_reset(conn: &Connection, email: &str) -> AppResult<Option<(User, String)>> {
    let Some(user) = find_by_email(conn, email)? else {
        return Ok(None);
    };
    if !user.is_active() {
        return Ok(None);
    }
    let code = generate_reset_code();
    let expires = Utc::now() + Duration::minutes(RESET_CODE_TTL_MINUTES);
    conn.execute(
        "UPDATE users SET reset_code = ?1, reset_code_expires = ?2 WHERE id = ?3",
        params![code, expires.to_rfc3339(), user.id],
    )?;
    Ok(Some((user, code)))
}

pub fn complete_password_reset(
    conn: &Connection,
    email: &str,
    code: &str,
    new_password: &str,
) -> AppResult<()> {
    let user = find_by_email(conn, email)?
        .ok_or_else(|| AppError::validation("Invalid reset code"))?;

    let (Some(stored), Some(expires)) = (&user.reset_code, &user.reset_code_expires) else {
        return Err(AppError::validation("No reset code found"));
    };
    let expires: DateTime<Utc> = DateTime::parse_from_rfc3339(expires)
        .map_err(|_| AppError::validation("Reset code expired"))?
        .with_timezone(&Utc);
    if Utc::now() > expires {
        return Err(AppError::validation("Reset code expired"));
    }
    if !stored.eq_ignore_ascii_case(code.trim()) {
        return Err(AppError::validation("Invalid reset code"));
    }

    set_password(conn, user.id, new_password)?;
    log::info!("password reset completed for {}", user.username);
    Ok(())
}

fn set_status(conn: &Connection, id: i64, status: UserStatus) -> AppResult<()> {
    conn.execute(
        "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now(), id],
    )?;
    Ok(())
}

fn is_referenced(conn: &Connection, id: i64) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM payroll_records WHERE employee_id = ?1) \
              + (SELECT COUNT(*) FROM payroll_master WHERE created_by = ?1 OR reviewed_by = ?1 \
                    OR locked_by = ?1 OR paid_by = ?1) \
              + (SELECT COUNT(*) FROM projects WHERE owner_id = ?1) \
              + (SELECT COUNT(*) FROM project_documents WHERE uploaded_by = ?1)",
        [id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Run one users API action on behalf of `actor`.
pub fn apply_action(conn: &Connection, actor: &User, action: &UserAction) -> AppResult<ActionOutcome> {
    if !actor.can(auth::Permission::ManageUsers) {
        return Err(AppError::Forbidden);
    }

    let target_id = match action {
        UserAction::Activate { id }
        | UserAction::Deactivate { id }
        | UserAction::SetRole { id, .. }
        | UserAction::ResetPassword { id }
        | UserAction::Delete { id } => *id,
    };
    let target = get_user(conn, target_id)?;
    let is_self = target.id == actor.id;

    let outcome = |message: String| ActionOutcome {
        message,
        temporary_password: None,
    };

    match action {
        UserAction::Activate { .. } => {
            set_status(conn, target.id, UserStatus::Active)?;
            log::info!("{} activated {}", actor.username, target.username);
            Ok(outcome(format!("{} activated", target.username)))
        }
        UserAction::Deactivate { .. } => {
            if is_self {
                return Err(AppError::conflict("You cannot deactivate your own account"));
            }
            set_status(conn, target.id, UserStatus::Inactive)?;
            log::info!("{} deactivated {}", actor.username, target.username);
            Ok(outcome(format!("{} deactivated", target.username)))
        }
        UserAction::SetRole { role, .. } => {
            if is_self && *role != Role::Admin {
                return Err(AppError::conflict("You cannot change your own role"));
            }
            conn.execute(
                "UPDATE users SET role = ?1, updated_at = ?2 WHERE id = ?3",
                params![role.as_str(), now(), target.id],
            )?;
            log::info!("{} set role of {} to {}", actor.username, target.username, role);
            Ok(outcome(format!("{} is now {}", target.username, role.label())))
        }
        UserAction::ResetPassword { .. } => {
            let temporary = generate_temporary_password();
            set_password(conn, target.id, &temporary)?;
            log::info!("{} reset the password of {}", actor.username, target.username);
            Ok(ActionOutcome {
                message: format!("Password of {} reset", target.username),
                temporary_password: Some(temporary),
            })
        }
        UserAction::Delete { .. } => {
            if is_self {
                return Err(AppError::conflict("You cannot delete your own account"));
            }
            if is_referenced(conn, target.id)? {
                return Err(AppError::conflict(format!(
                    "{} has payroll or project history; deactivate the account instead",
                    target.username
                )));
            }
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE project_tasks SET assignee_id = NULL WHERE assignee_id = ?1",
                [target.id],
            )?;
            tx.execute("DELETE FROM project_members WHERE user_id = ?1", [target.id])?;
            tx.execute("DELETE FROM users WHERE id = ?1", [target.id])?;
            tx.commit()?;
            log::info!("{} deleted {}", actor.username, target.username);
            Ok(outcome(format!("{} deleted", target.username)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn new_user(username: &str, role: Role) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            full_name: format!("{username} Example"),
            role,
            basic_salary: Money::from_cents(250_000),
            password: "password123".to_string(),
        }
    }

    #[test]
    fn rejects_bad_usernames_and_emails() {
        let mut user = new_user("ok", Role::Employee);
        assert!(validate_new_user(&user).is_err());

        user.username = "fine.name".to_string();
        user.email = "not-an-email".to_string();
        assert!(validate_new_user(&user).is_err());
    }

    #[test]
    fn duplicate_username_is_a_conflict() {
        let conn = open_in_memory().unwrap();
        create_user(&conn, &new_user("alice", Role::Admin)).unwrap();

        let mut again = new_user("alice", Role::Employee);
        again.email = "other@example.com".to_string();
        let err = create_user(&conn, &again).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn last_admin_cannot_be_demoted() {
        let conn = open_in_memory().unwrap();
        let id = create_user(&conn, &new_user("root", Role::Admin)).unwrap();
        let err = update_user(
            &conn,
            id,
            &UserUpdate {
                email: "root@example.com".to_string(),
                full_name: "Root".to_string(),
                role: Role::Employee,
                status: UserStatus::Active,
                basic_salary: Money::ZERO,
                password: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
    fn profile(email: &str, role: Role, password: Option<&str>) -> UserUpdate {
        UserUpdate {
            email: email.to_string(),
            full_name: "Changed Name".to_string(),
            role,
            status: UserStatus::Active,
            basic_salary: Money::from_cents(99_900),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn rejected_password_leaves_the_profile_untouched() {
        let conn = open_in_memory().unwrap();
        create_user(&conn, &new_user("root", Role::Admin)).unwrap();
        let id = create_user(&conn, &new_user("erin", Role::Employee)).unwrap();

        let err = update_user(&conn, id, &profile("changed@example.com", Role::Hr, Some("short")))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let after = get_user(&conn, id).unwrap();
        assert_eq!(after.email, "erin@example.com");
        assert_eq!(after.full_name, "erin Example");
        assert_eq!(after.role, Role::Employee);
        assert_eq!(after.basic_salary, Money::from_cents(250_000));
        assert!(authenticate(&conn, "erin", "password123").unwrap().is_some());

        update_user(&conn, id, &profile("changed@example.com", Role::Hr, Some("new-password"))).unwrap();
        let after = get_user(&conn, id).unwrap();
        assert_eq!(after.email, "changed@example.com");
        assert_eq!(after.role, Role::Hr);
        assert!(authenticate(&conn, "erin", "new-password").unwrap().is_some());
    }

    #[test]
    fn change_password_checks_the_old_one_and_the_confirmation() {
        let conn = open_in_memory().unwrap();
        let id = create_user(&conn, &new_user("erin", Role::Employee)).unwrap();

        let err = change_password(&conn, id, "wrong-password", "brand-new-1", "brand-new-1").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = change_password(&conn, id, "password123", "brand-new-1", "brand-new-2").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(authenticate(&conn, "erin", "password123").unwrap().is_some());

        change_password(&conn, id, "password123", "brand-new-1", "brand-new-1").unwrap();
        assert!(authenticate(&conn, "erin", "password123").unwrap().is_none());
        assert!(authenticate(&conn, "erin", "brand-new-1").unwrap().is_some());
    }

    #[test]
    fn reset_codes_are_checked_and_single_use() {
        let conn = open_in_memory().unwrap();
        create_user(&conn, &new_user("erin", Role::Employee)).unwrap();

        assert!(start_password_reset(&conn, "nobody@example.com").unwrap().is_none());
        let (user, code) = start_password_reset(&conn, "erin@example.com").unwrap().unwrap();
        assert_eq!(code.len(), 8);

        let err = complete_password_reset(&conn, "erin@example.com", "WRONG123", "reset-pass-1").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        complete_password_reset(&conn, "erin@example.com", &code, "reset-pass-1").unwrap();
        assert!(authenticate(&conn, "erin", "reset-pass-1").unwrap().is_some());
        let cleared = get_user(&conn, user.id).unwrap();
        assert!(cleared.reset_code.is_none());

        let err = complete_password_reset(&conn, "erin@example.com", &code, "reset-pass-2").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(authenticate(&conn, "erin", "reset-pass-1").unwrap().is_some());
    }

    #[test]
    fn expired_reset_codes_are_refused() {
        let conn = open_in_memory().unwrap();
        create_user(&conn, &new_user("erin", Role::Employee)).unwrap();
        let (user, code) = start_password_reset(&conn, "erin@example.com").unwrap().unwrap();
        let past = (Utc::now() - Duration::minutes(5)).to_rfc3339();
        conn.execute(
            "UPDATE users SET reset_code_expires = ?1 WHERE id = ?2",
            params![past, user.id],
        )
        .unwrap();

        let err = complete_password_reset(&conn, "erin@example.com", &code, "reset-pass-1").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(authenticate(&conn, "erin", "password123").unwrap().is_some());
    }

    #[test]
    fn admins_cannot_lock_themselves_out() {
        let conn = open_in_memory().unwrap();
        let id = create_user(&conn, &new_user("root", Role::Admin)).unwrap();
        create_user(&conn, &new_user("second", Role::Admin)).unwrap();
        let root = get_user(&conn, id).unwrap();

        for action in [
            UserAction::Deactivate { id },
            UserAction::SetRole { id, role: Role::Employee },
            UserAction::Delete { id },
        ] {
            let err = apply_action(&conn, &root, &action).unwrap_err();
            assert!(matches!(err, AppError::Conflict(_)), "{action:?}");
        }
        let after = get_user(&conn, id).unwrap();
        assert_eq!(after.role, Role::Admin);
        assert!(after.is_active());
    }

    #[test]
    fn users_with_history_are_deactivated_not_deleted() {
        let conn = open_in_memory().unwrap();
        let root = get_user(&conn, create_user(&conn, &new_user("root", Role::Admin)).unwrap()).unwrap();
        let paid = create_user(&conn, &new_user("paid", Role::Employee)).unwrap();
        let unsalaried = |username: &str, role| NewUser {
            basic_salary: Money::ZERO,
            ..new_user(username, role)
        };
        let owner = create_user(&conn, &unsalaried("owner", Role::Manager)).unwrap();

        crate::payroll::create_payroll(&conn, &root, "2024-05", "May").unwrap();
        // Joined after the payroll run
        let fresh = create_user(&conn, &new_user("fresh", Role::Employee)).unwrap();
        let owner_user = get_user(&conn, owner).unwrap();
        crate::projects::create_project(
            &conn,
            &owner_user,
            &crate::projects::ProjectInput {
                name: "Warehouse".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        for id in [paid, owner] {
            let err = apply_action(&conn, &root, &UserAction::Delete { id }).unwrap_err();
            assert!(matches!(err, AppError::Conflict(_)));
            assert!(find_user(&conn, id).unwrap().is_some());
        }

        apply_action(&conn, &root, &UserAction::Delete { id: fresh }).unwrap();
        assert!(find_user(&conn, fresh).unwrap().is_none());
    }
}
