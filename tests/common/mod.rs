#![allow(dead_code)]

use erp::auth::Role;
use erp::db;
use erp::money::Money;
use erp::users::{self, NewUser, User};
use rusqlite::Connection;

pub fn conn() -> Connection {
    db::open_in_memory().unwrap()
}

/// Create an active user with the given role and basic salary in cents.
pub fn user(conn: &Connection, username: &str, role: Role, salary_cents: i64) -> User {
    let id = users::create_user(
        conn,
        &NewUser {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            full_name: format!("{} Tester", username),
            role,
            basic_salary: Money::from_cents(salary_cents),
            password: "correct horse".to_string(),
        },
    )
    .unwrap();
    users::get_user(conn, id).unwrap()
}
