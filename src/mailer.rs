use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpConfig;
use crate::error::{AppError, AppResult};
use crate::users::RESET_CODE_TTL_MINUTES;

#[derive(Clone)]
pub struct Mailer {
    smtp: SmtpTransport,
    from: String,
}

impl Mailer {
    pub fn new(config: &SmtpConfig) -> AppResult<Self> {
        let smtp_err = |e: lettre::transport::smtp::Error| AppError::Internal(format!("smtp setup: {e}"));

        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let tls_parameters = TlsParameters::new(config.host.clone()).map_err(smtp_err)?;

        let smtp = SmtpTransport::relay(&config.host)
            .map_err(smtp_err)?
            .credentials(creds)
            .port(config.port)
            .tls(Tls::Wrapper(tls_parameters))
            .build();

        Ok(Mailer {
            smtp,
            from: config.from.clone(),
        })
    }

    pub fn send_password_reset(&self, to_email: &str, reset_code: &str) -> AppResult<()> {
        let from = self
            .from
            .parse()
            .map_err(|e| AppError::Internal(format!("bad from address: {e}")))?;
        let to = to_email
            .parse()
            .map_err(|_| AppError::validation("Invalid email address"))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject("Password Reset Request")
            .body(format!(
                "Your password reset code is: {}\nThis code will expire in {} minutes.",
                reset_code, RESET_CODE_TTL_MINUTES
            ))
            .map_err(|e| AppError::Internal(format!("building reset mail: {e}")))?;

        self.smtp
            .send(&email)
            .map_err(|e| AppError::Internal(format!("sending reset mail: {e}")))?;
        Ok(())
    }
}
