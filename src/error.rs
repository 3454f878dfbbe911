//! Application error type shared by the storage layer and the web handlers.

#[cfg(feature = "web")]
use axum::{
    Json,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

/// Every failure a request can end in.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "web")]
    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),

    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("you do not have permission to do that")]
    Forbidden,

    #[error("{0}")]
    Conflict(String),

    #[error("not logged in")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Message safe to show to an end user. Storage failures are not echoed.
    pub fn public_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Io(_) | Self::Internal(_) => {
                "An internal error occurred. Please try again.".to_string()
            }
            #[cfg(feature = "web")]
            Self::Template(_) => "An internal error occurred. Please try again.".to_string(),
            other => other.to_string(),
        }
    }

    #[cfg(feature = "web")]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Io(_) | Self::Template(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    #[cfg(feature = "web")]
    fn log(&self) {
        match self {
            Self::Validation(_) | Self::NotFound | Self::Forbidden | Self::Conflict(_) => {
                log::warn!("request rejected: {}", self)
            }
            Self::Unauthorized => log::debug!("unauthenticated request"),
            _ => log::error!("request failed: {}", self),
        }
    }
}

#[cfg(feature = "web")]
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.status_code();
        let message = escape_html(&self.public_message());
        let body = format!(
            "<!DOCTYPE html><html><head><title>{code}</title>\
             <link rel=\"stylesheet\" href=\"/static/app.css\"></head>\
             <body class=\"error-page\"><h1>{code}</h1><p>{message}</p>\
             <p><a href=\"/\">Back to dashboard</a></p></body></html>",
            code = status.as_u16(),
            message = message,
        );
        (status, Html(body)).into_response()
    }
}

/// Error wrapper for the AJAX endpoints; renders `{success: false, message}`.
#[cfg(feature = "web")]
#[derive(Debug)]
pub struct JsonError(pub AppError);

#[cfg(feature = "web")]
impl From<AppError> for JsonError {
    fn from(value: AppError) -> Self {
        Self(value)
    }
}

#[cfg(feature = "web")]
impl From<rusqlite::Error> for JsonError {
    fn from(value: rusqlite::Error) -> Self {
        Self(AppError::Database(value))
    }
}

#[cfg(feature = "web")]
impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        self.0.log();
        let status = self.0.status_code();
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "message": self.0.public_message(),
            })),
        )
            .into_response()
    }
}

#[cfg(feature = "web")]
fn escape_html(text: &str) -> String {
    handlebars::html_escape(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_not_echoed() {
        let err = AppError::Internal("secret path /var/db".to_string());
        assert!(!err.public_message().contains("secret"));

        let err = AppError::validation("Name is required");
        assert_eq!(err.public_message(), "Name is required");
    }

    #[cfg(feature = "web")]
    #[test]
    fn status_codes_follow_variant() {
        assert_eq!(AppError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::conflict("taken").status_code(),
            StatusCode::CONFLICT
        );
    }
}
