use rusqlite::{Connection, Row};
use std::fmt;
use std::fs::create_dir_all;
use std::path::Path;
use std::str::FromStr;

use crate::error::AppResult;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    username            TEXT NOT NULL UNIQUE,
    email               TEXT NOT NULL UNIQUE,
    full_name           TEXT NOT NULL,
    password_hash       TEXT NOT NULL,
    role                TEXT NOT NULL DEFAULT 'employee',
    status              TEXT NOT NULL DEFAULT 'active',
    basic_salary_cents  INTEGER NOT NULL DEFAULT 0,
    reset_code          TEXT,
    reset_code_expires  TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS payroll_master (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_no  TEXT NOT NULL UNIQUE,
    period          TEXT NOT NULL,
    title           TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'draft',
    total_cents     INTEGER NOT NULL DEFAULT 0,
    created_by      INTEGER NOT NULL REFERENCES users(id),
    reviewed_by     INTEGER REFERENCES users(id),
    locked_by       INTEGER REFERENCES users(id),
    paid_by         INTEGER REFERENCES users(id),
    created_at      TEXT NOT NULL,
    reviewed_at     TEXT,
    locked_at       TEXT,
    paid_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_payroll_master_period ON payroll_master(period);

CREATE TABLE IF NOT EXISTS payroll_records (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    payroll_id          INTEGER NOT NULL REFERENCES payroll_master(id) ON DELETE CASCADE,
    employee_id         INTEGER NOT NULL REFERENCES users(id),
    basic_salary_cents  INTEGER NOT NULL DEFAULT 0,
    earnings_cents      INTEGER NOT NULL DEFAULT 0,
    deductions_cents    INTEGER NOT NULL DEFAULT 0,
    net_cents           INTEGER NOT NULL DEFAULT 0,
    UNIQUE (payroll_id, employee_id)
);

CREATE TABLE IF NOT EXISTS payroll_items (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id     INTEGER NOT NULL REFERENCES payroll_records(id) ON DELETE CASCADE,
    kind          TEXT NOT NULL CHECK (kind IN ('earning', 'deduction')),
    description   TEXT NOT NULL,
    amount_cents  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    code         TEXT NOT NULL UNIQUE,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    status       TEXT NOT NULL DEFAULT 'draft',
    owner_id     INTEGER NOT NULL REFERENCES users(id),
    start_date   TEXT,
    end_date     TEXT,
    progress     INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_phases (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    position    INTEGER NOT NULL DEFAULT 0,
    progress    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS project_tasks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    phase_id      INTEGER REFERENCES project_phases(id) ON DELETE SET NULL,
    title         TEXT NOT NULL,
    assignee_id   INTEGER REFERENCES users(id),
    status        TEXT NOT NULL DEFAULT 'todo',
    due_date      TEXT,
    created_at    TEXT NOT NULL,
    completed_at  TEXT
);

CREATE TABLE IF NOT EXISTS project_members (
    project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    user_id     INTEGER NOT NULL REFERENCES users(id),
    role        TEXT NOT NULL DEFAULT 'member',
    PRIMARY KEY (project_id, user_id)
);

CREATE TABLE IF NOT EXISTS project_documents (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id    INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    file_name     TEXT NOT NULL,
    stored_name   TEXT NOT NULL,
    content_type  TEXT NOT NULL,
    size_bytes    INTEGER NOT NULL,
    uploaded_by   INTEGER NOT NULL REFERENCES users(id),
    uploaded_at   TEXT NOT NULL
);
";

/// Open (creating if needed) the database file and make sure the schema exists.
pub fn open(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema.
pub fn open_in_memory() -> AppResult<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Current UTC time as stored in timestamp columns.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Read a text column into any type with a `FromStr` impl (status enums, roles).
pub fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

/// Builds a `LIKE` pattern (use with `ESCAPE '\'`) for a free-text filter.
pub fn like_pattern(q: &str) -> String {
    let escaped = q
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 9);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_off "), "%50\\%\\_off%");
    }
}
