//! Server configuration and the builder that assembles it.
//!
//! This crate is a library, not a standalone daemon: the embedding binary
//! decides how to source these values (env vars, a file, hardcoded), then
//! hands a built [`ServerConfig`] to [`crate::server::Server`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_rustls::TlsAcceptor;

use crate::checkers::{Authenticator, ConnContext, ConnectionChecker, HeloChecker, Handler, RecipientChecker, SenderChecker};

const DEFAULT_HOSTNAME: &str = "localhost.localdomain";
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_CONNECTIONS: i64 = 100;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 10_240_000;
const DEFAULT_MAX_RECIPIENTS: usize = 100;

/// A logger that observes the raw protocol dialogue, independent of the
/// `log` facade used for operational messages.
pub trait ProtocolLogger: Send + Sync {
    fn sent(&self, peer: SocketAddr, line: &str);
    fn received(&self, peer: SocketAddr, line: &str);
}

/// TLS material used to service STARTTLS, built from a PEM certificate
/// chain and private key.
#[derive(Clone)]
pub struct TlsSettings {
    pub acceptor: TlsAcceptor,
}

impl TlsSettings {
    /// Builds server TLS settings from PEM-encoded certificate chain and
    /// private key files.
    pub fn from_pem_files(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Self> {
        let cert_file = std::fs::File::open(cert_path)
            .with_context(|| format!("opening TLS certificate at {}", cert_path.display()))?;
        let mut cert_reader = std::io::BufReader::new(cert_file);
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parsing TLS certificate chain")?;

        let key_file = std::fs::File::open(key_path)
            .with_context(|| format!("opening TLS private key at {}", key_path.display()))?;
        let mut key_reader = std::io::BufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .context("parsing TLS private key")?
            .context("no private key found in key file")?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building rustls server config")?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
        })
    }

    pub fn from_acceptor(acceptor: TlsAcceptor) -> Self {
        Self { acceptor }
    }
}

/// Server-wide configuration. All fields are optional at the builder
/// level; defaults are documented there and materialized by
/// [`ServerConfigBuilder::build`].
pub struct ServerConfig {
    pub hostname: String,
    pub welcome_message: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub data_timeout: Duration,
    /// Non-positive disables the concurrency cap.
    pub max_connections: i64,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub tls: Option<TlsSettings>,
    pub force_tls: bool,
    pub enable_xclient: bool,
    pub enable_proxy_protocol: bool,

    pub connection_checker: Option<Arc<dyn ConnectionChecker>>,
    pub helo_checker: Option<Arc<dyn HeloChecker>>,
    pub sender_checker: Option<Arc<dyn SenderChecker>>,
    pub recipient_checker: Option<Arc<dyn RecipientChecker>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub handler: Option<Arc<dyn Handler>>,
    pub conn_context: Option<Arc<dyn ConnContext>>,
    pub protocol_logger: Option<Arc<dyn ProtocolLogger>>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// `None` when the concurrency cap is disabled (`max_connections <= 0`).
    pub fn connection_limit(&self) -> Option<usize> {
        if self.max_connections > 0 {
            Some(self.max_connections as usize)
        } else {
            None
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.authenticator.is_some()
    }
}

#[derive(Default)]
pub struct ServerConfigBuilder {
    hostname: Option<String>,
    welcome_message: Option<String>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    data_timeout: Option<Duration>,
    max_connections: Option<i64>,
    max_message_size: Option<usize>,
    max_recipients: Option<usize>,
    tls: Option<TlsSettings>,
    force_tls: bool,
    enable_xclient: bool,
    enable_proxy_protocol: bool,
    connection_checker: Option<Arc<dyn ConnectionChecker>>,
    helo_checker: Option<Arc<dyn HeloChecker>>,
    sender_checker: Option<Arc<dyn SenderChecker>>,
    recipient_checker: Option<Arc<dyn RecipientChecker>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Option<Arc<dyn Handler>>,
    conn_context: Option<Arc<dyn ConnContext>>,
    protocol_logger: Option<Arc<dyn ProtocolLogger>>,
}

impl ServerConfigBuilder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn welcome_message(mut self, message: impl Into<String>) -> Self {
        self.welcome_message = Some(message.into());
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = Some(timeout);
        self
    }

    pub fn max_connections(mut self, max: i64) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }

    pub fn max_recipients(mut self, max: usize) -> Self {
        self.max_recipients = Some(max);
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn force_tls(mut self, force: bool) -> Self {
        self.force_tls = force;
        self
    }

    pub fn enable_xclient(mut self, enable: bool) -> Self {
        self.enable_xclient = enable;
        self
    }

    pub fn enable_proxy_protocol(mut self, enable: bool) -> Self {
        self.enable_proxy_protocol = enable;
        self
    }

    pub fn connection_checker(mut self, checker: Arc<dyn ConnectionChecker>) -> Self {
        self.connection_checker = Some(checker);
        self
    }

    pub fn helo_checker(mut self, checker: Arc<dyn HeloChecker>) -> Self {
        self.helo_checker = Some(checker);
        self
    }

    pub fn sender_checker(mut self, checker: Arc<dyn SenderChecker>) -> Self {
        self.sender_checker = Some(checker);
        self
    }

    pub fn recipient_checker(mut self, checker: Arc<dyn RecipientChecker>) -> Self {
        self.recipient_checker = Some(checker);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn conn_context(mut self, hook: Arc<dyn ConnContext>) -> Self {
        self.conn_context = Some(hook);
        self
    }

    pub fn protocol_logger(mut self, logger: Arc<dyn ProtocolLogger>) -> Self {
        self.protocol_logger = Some(logger);
        self
    }

    /// Materializes defaults and validates cross-field invariants.
    ///
    /// Fails if `force_tls` is set without a `tls` config: that's a
    /// programming error in the embedding binary, not a runtime condition.
    pub fn build(self) -> Result<ServerConfig> {
        if self.force_tls && self.tls.is_none() {
            bail!("force_tls is set but no tls config was provided");
        }

        let hostname = self.hostname.unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
        let welcome_message = self
            .welcome_message
            .unwrap_or_else(|| format!("{hostname} ESMTP ready."));

        Ok(ServerConfig {
            hostname,
            welcome_message,
            read_timeout: self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
            write_timeout: self.write_timeout.unwrap_or(DEFAULT_WRITE_TIMEOUT),
            data_timeout: self.data_timeout.unwrap_or(DEFAULT_DATA_TIMEOUT),
            max_connections: self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            max_message_size: self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            max_recipients: self.max_recipients.unwrap_or(DEFAULT_MAX_RECIPIENTS),
            tls: self.tls,
            force_tls: self.force_tls,
            enable_xclient: self.enable_xclient,
            enable_proxy_protocol: self.enable_proxy_protocol,
            connection_checker: self.connection_checker,
            helo_checker: self.helo_checker,
            sender_checker: self.sender_checker,
            recipient_checker: self.recipient_checker,
            authenticator: self.authenticator,
            handler: self.handler,
            conn_context: self.conn_context,
            protocol_logger: self.protocol_logger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::builder().build().unwrap();
        assert_eq!(config.hostname, "localhost.localdomain");
        assert_eq!(config.welcome_message, "localhost.localdomain ESMTP ready.");
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.data_timeout, Duration::from_secs(300));
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_message_size, 10_240_000);
        assert_eq!(config.max_recipients, 100);
        assert_eq!(config.connection_limit(), Some(100));
    }

    #[test]
    fn non_positive_max_connections_disables_cap() {
        let config = ServerConfig::builder().max_connections(0).build().unwrap();
        assert_eq!(config.connection_limit(), None);
    }

    #[test]
    fn force_tls_without_tls_config_is_an_error() {
        let err = ServerConfig::builder().force_tls(true).build().unwrap_err();
        assert!(err.to_string().contains("force_tls"));
    }
}
