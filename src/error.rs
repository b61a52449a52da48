//! Typed SMTP errors and the mapping from errors to wire replies.
//!
//! Every checker, authenticator and delivery handler communicates rejection
//! through [`SmtpError`]: a reply code plus message that the session writes
//! back verbatim. Errors that are not an `SmtpError` (e.g. a bare
//! `anyhow::Error` escaping a callback) are widened to `502`.

use thiserror::Error;

/// A reply carrying an explicit SMTP code and message.
///
/// Checkers, the authenticator and the delivery handler all return
/// `Result<T, SmtpError>` so that policy decisions map directly onto the
/// wire reply the client sees, without the session having to guess at an
/// appropriate code for an opaque error.
#[derive(Debug, Clone, Error)]
#[error("{code} {message}")]
pub struct SmtpError {
    pub code: u16,
    pub message: String,
}

impl SmtpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 421, connection concurrency cap exceeded.
    pub fn busy() -> Self {
        Self::new(421, "Too busy, try again later")
    }

    /// 421, the server is shutting down and cannot accept new sessions.
    pub fn shutting_down() -> Self {
        Self::new(421, "Server is shutting down")
    }

    /// 500, a line exceeded the maximum permitted length.
    pub fn line_too_long() -> Self {
        Self::new(500, "Line too long")
    }

    /// 502, an unrecognised verb.
    pub fn unknown_command() -> Self {
        Self::new(502, "Unknown command")
    }

    /// 503, a verb was sent out of the order the state machine permits.
    pub fn sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    /// 501, malformed command syntax or arguments.
    pub fn syntax(detail: impl Into<String>) -> Self {
        Self::new(501, detail.into())
    }

    /// 552, the message body exceeded `max_message_size`.
    pub fn message_too_large(max: usize) -> Self {
        Self::new(552, format!("Message exceeds maximum size of {max} bytes"))
    }

    /// 452, `max_recipients` would be exceeded by accepting the recipient.
    ///
    /// Transient rather than permanent: a session that drops back to a
    /// smaller recipient list (or a fresh connection) can still succeed.
    pub fn too_many_recipients(max: usize) -> Self {
        Self::new(452, format!("Too many recipients, max is {max}"))
    }

    /// 530, a command requiring TLS was attempted before STARTTLS succeeded.
    pub fn tls_required() -> Self {
        Self::new(530, "Must issue STARTTLS first")
    }

    /// 535, AUTH failed (bad credentials, or the authenticator rejected them).
    pub fn auth_failed() -> Self {
        Self::new(535, "Authentication failed")
    }

    /// 554, the connection/session was rejected outright by a checker.
    pub fn denied(detail: impl Into<String>) -> Self {
        Self::new(554, detail.into())
    }
}

/// Renders an arbitrary callback error as a wire reply.
///
/// A typed [`SmtpError`] is written verbatim. Any other error (an opaque
/// `anyhow::Error` escaping a checker or handler) widens to `502` with the
/// error's `Display` text.
pub fn reply_for(err: &anyhow::Error) -> (u16, String) {
    match err.downcast_ref::<SmtpError>() {
        Some(smtp_err) => (smtp_err.code, smtp_err.message.clone()),
        None => (502, err.to_string()),
    }
}

impl From<SmtpError> for anyhow::Error {
    fn from(value: SmtpError) -> Self {
        anyhow::Error::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_reply_is_verbatim() {
        let err: anyhow::Error = SmtpError::tls_required().into();
        let (code, message) = reply_for(&err);
        assert_eq!(code, 530);
        assert_eq!(message, "Must issue STARTTLS first");
    }

    #[test]
    fn opaque_error_widens_to_502() {
        let err = anyhow::anyhow!("database connection refused");
        let (code, message) = reply_for(&err);
        assert_eq!(code, 502);
        assert_eq!(message, "database connection refused");
    }

    #[test]
    fn too_many_recipients_is_transient() {
        let err = SmtpError::too_many_recipients(10);
        assert_eq!(err.code, 452);
    }
}
