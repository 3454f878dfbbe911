/*!
# ERP

An internal business web application for payroll processing, user
administration and project tracking, built in Rust.

## Overview

Every page follows the same shape: read filters or form fields from the
request, run parameterized SQL against one SQLite database, and render a
Handlebars template or a small JSON document for the AJAX endpoints.

## Architecture

### Web Layer
- **Technologies**: axum, Handlebars, session cookies
- **Key Components**:
  - Router and shared state (`app`)
  - Authentication middleware, sessions and flash messages (`login`)
  - Page and JSON handlers per feature area (`handlers`)
  - Page rendering with the shared layout (`render`)

### Domain Layer
- **Users**: accounts, roles, activation, password resets
- **Payroll**: batches moving Draft → Reviewed → Locked → Paid, with
  per-employee records and earning/deduction items
- **Projects**: projects moving Draft → Active → On Hold → Completed → Archived,
  with phases, tasks, members and documents

### Data Persistence Layer
- SQLite through rusqlite, schema created at startup
- Money stored as integer cents
- Guarded status changes as conditional updates inside a transaction

## Modules

- **auth**: roles, permissions and password hashing
- **config**: layered configuration (defaults, TOML file, environment)
- **db**: connection setup and schema
- **downloader**: CSV, XLSX and HTML-table exports
- **error**: the shared error type
- **money**: fixed-point amounts
- **payroll**, **projects**, **users**: the feature areas
- **app**, **handlers**, **login**, **mailer**, **render**: the web server
  (behind the `web` feature)
*/

pub mod auth;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod money;
pub mod payroll;
pub mod projects;
pub mod users;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod handlers;
#[cfg(feature = "web")]
pub mod login;
#[cfg(feature = "web")]
pub mod mailer;
#[cfg(feature = "web")]
pub mod render;

pub use error::{AppError, AppResult};
pub use money::Money;
