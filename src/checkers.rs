//! The pluggable capabilities a session consults at each stage: connection,
//! HELO, sender and recipient checkers, an authenticator, and the delivery
//! handler itself.
//!
//! Each is a single-method async trait so an embedder only implements the
//! hooks it cares about; a `ServerConfig` with none configured behaves as
//! if every checker returned `Ok(())`.

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::SmtpError;
use crate::peer::Peer;

/// Ambient data available to every checker/handler invocation: the local
/// address the connection arrived on, plus whatever an embedder's
/// [`ConnContext`] hook chooses to attach.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub local_addr: std::net::SocketAddr,
}

/// Consulted once per connection, before the greeting is sent. Rejecting
/// closes the session.
#[async_trait]
pub trait ConnectionChecker: Send + Sync {
    async fn check(&self, peer: &Peer, ctx: &SessionContext) -> Result<(), SmtpError>;
}

/// Consulted when a HELO/EHLO name is announced. Rejecting closes the
/// session.
#[async_trait]
pub trait HeloChecker: Send + Sync {
    async fn check(&self, peer: &Peer, helo_name: &str, ctx: &SessionContext) -> Result<(), SmtpError>;
}

/// Consulted when `MAIL FROM` is received. Rejecting keeps the session open
/// (the client may retry with a different sender).
#[async_trait]
pub trait SenderChecker: Send + Sync {
    async fn check(&self, peer: &Peer, sender: &str, ctx: &SessionContext) -> Result<(), SmtpError>;
}

/// Consulted for each `RCPT TO`. Rejecting keeps the session open.
#[async_trait]
pub trait RecipientChecker: Send + Sync {
    async fn check(&self, peer: &Peer, recipient: &str, ctx: &SessionContext) -> Result<(), SmtpError>;
}

/// Validates AUTH PLAIN/LOGIN credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        peer: &Peer,
        username: &str,
        password: &str,
        ctx: &SessionContext,
    ) -> Result<(), SmtpError>;
}

/// Receives the fully-formed envelope after a successful DATA transaction.
///
/// Returning `Ok(queue_id)` yields a `250` reply embedding the queue id;
/// returning `Err(SmtpError)` yields that reply verbatim; any other error a
/// handler implementation surfaces as an opaque `anyhow::Error` widens to
/// `502`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        peer: &Peer,
        envelope: &Envelope,
        ctx: &SessionContext,
    ) -> Result<String, SmtpError>;
}

/// Lets an embedder attach extra data to a connection's [`SessionContext`]
/// before any checker runs (the Rust analogue of a `ConnContext` hook).
#[async_trait]
pub trait ConnContext: Send + Sync {
    async fn extend(&self, peer: &Peer, ctx: SessionContext) -> SessionContext;
}
