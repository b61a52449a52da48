//! An embeddable SMTP/ESMTP relay session engine.
//!
//! This crate owns the wire protocol, connection lifecycle and concurrency
//! control of an SMTP relay; it has no opinion on what happens to a message
//! once it's accepted. An embedding binary builds a [`config::ServerConfig`]
//! wiring in whichever [`checkers`] it needs (connection policy, HELO/sender/
//! recipient checks, AUTH, and the [`checkers::Handler`] that actually does
//! something with a delivered message), then hands it to a [`server::Server`].

pub mod auth;
pub mod checkers;
pub mod config;
pub mod envelope;
pub mod error;
pub mod io;
pub mod peer;
pub mod proxy;
pub mod server;
pub mod session;

pub use config::{ServerConfig, ServerConfigBuilder, TlsSettings};
pub use error::SmtpError;
pub use envelope::Envelope;
pub use peer::{Peer, Protocol, TlsInfo};
pub use server::Server;
