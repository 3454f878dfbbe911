//! Request handlers, one module per feature area.

pub mod dashboard;
pub mod payroll;
pub mod projects;
pub mod users;

use axum::{
    http::header,
    response::{IntoResponse, Redirect, Response},
};
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::login::{CurrentUser, FlashKind};

/// Turn a user-correctable failure into an error flash. Other errors propagate
/// and render the error page.
pub(crate) fn flash_failure(current: &CurrentUser, err: AppError) -> AppResult<()> {
    match err {
        AppError::Validation(_) | AppError::Conflict(_) => {
            current.flash(FlashKind::Error, err.public_message());
            Ok(())
        }
        other => Err(other),
    }
}

/// Redirect after a form POST, flashing `success` or the failure message.
pub(crate) fn redirect_after<T>(
    current: &CurrentUser,
    result: AppResult<T>,
    success: &str,
    to: &str,
) -> AppResult<Redirect> {
    match result {
        Ok(_) => current.flash(FlashKind::Success, success),
        Err(err) => flash_failure(current, err)?,
    }
    Ok(Redirect::to(to))
}

/// Empty form and query fields count as absent.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Parse an optional filter field; unknown values are ignored.
pub(crate) fn parse_filter<T: FromStr>(value: &Option<String>) -> Option<T> {
    non_empty(value).and_then(|v| v.parse().ok())
}

/// Parse an optional form field, rejecting values that do not parse.
pub(crate) fn parse_field<T: FromStr>(value: &Option<String>, field: &str) -> AppResult<Option<T>> {
    match non_empty(value) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| AppError::validation(format!("Invalid {field}"))),
        None => Ok(None),
    }
}

/// A file download response.
pub(crate) fn attachment(content_type: &str, file_name: &str, body: impl IntoResponse) -> Response {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file_name.replace(['"', '\\', '\r', '\n'], "_")
    );
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_are_absent() {
        assert_eq!(non_empty(&Some("  ".to_string())), None);
        assert_eq!(non_empty(&Some(" x ".to_string())), Some("x"));
        assert_eq!(parse_filter::<i64>(&Some("abc".to_string())), None);
        assert_eq!(parse_filter::<i64>(&Some("12".to_string())), Some(12));
    }

    #[test]
    fn bad_field_values_are_validation_errors() {
        let err = parse_field::<i64>(&Some("twelve".to_string()), "employee").unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m == "Invalid employee"));
        assert_eq!(parse_field::<i64>(&None, "employee").unwrap(), None);
    }
}
