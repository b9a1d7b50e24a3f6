//! SMTP delivery behind an opaque [`Mailer`] capability.
//!
//! A thin abstraction over [lettre](https://lettre.rs) with environment-based
//! configuration. The rest of the crate only sees the [`Mailer`] trait and the
//! [`MailError`] classification, so tests (and the dev fallback) swap in their
//! own implementations.
//!
//! # Environment Variables
//!
//! [`SmtpMailer::from_env`] reads:
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `SMTP_HOST` | Yes | SMTP server hostname |
//! | `SMTP_PORT` | No | Port (default: 587) |
//! | `SMTP_USER` | No | Username for authentication |
//! | `SMTP_PASSWORD` | No | Password for authentication |
//! | `SMTP_FROM` | Yes | Default sender address |
//! | `SMTP_TLS` | No | `starttls` (default), `tls`, or `none` |

mod mailer;
mod message;

pub use mailer::{LogMailer, Mailer, MailerConfig, SmtpMailer};
pub use message::{Attachment, Email, EmailBody, EmailBuilder};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("transport error: {message}")]
    Transport { message: String, permanent: bool },
}

impl MailError {
    /// Whether retrying the same message can possibly succeed.
    ///
    /// Address and message-construction problems are permanent; transport
    /// errors carry the SMTP classification (5xx permanent, everything else
    /// worth another attempt).
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::MissingConfig(_) => true,
            Self::InvalidAddress(_) => true,
            Self::Build(_) => true,
            Self::Transport { permanent, .. } => *permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_variant() {
        assert!(MailError::InvalidAddress("x".into()).is_permanent());
        assert!(MailError::Transport {
            message: "550 no such user".into(),
            permanent: true,
        }
        .is_permanent());
        assert!(!MailError::Transport {
            message: "421 try again later".into(),
            permanent: false,
        }
        .is_permanent());
    }
}
