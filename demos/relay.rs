//! A runnable demonstration binary wiring [`relay_smtp`] into a minimal
//! standalone relay: it accepts mail for a configured allowlist of
//! recipients and logs each delivered message, in place of forwarding it
//! anywhere. Configuration is read from the environment in a
//! `RELAY_`-prefixed, `.env`-aware style.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info};
use uuid::Uuid;

use relay_smtp::checkers::{RecipientChecker, SessionContext};
use relay_smtp::config::TlsSettings;
use relay_smtp::{Envelope, Peer, Server, ServerConfig, SmtpError};

/// Accepts mail only for a fixed set of recipient addresses.
struct TargetEmailChecker {
    targets: Vec<String>,
}

#[async_trait]
impl RecipientChecker for TargetEmailChecker {
    async fn check(&self, _peer: &Peer, recipient: &str, _ctx: &SessionContext) -> Result<(), SmtpError> {
        let recipient = recipient.to_lowercase();
        if self.targets.iter().any(|t| t.to_lowercase() == recipient) {
            Ok(())
        } else {
            Err(SmtpError::denied("No such user here"))
        }
    }
}

/// Logs each accepted message instead of forwarding it. A real embedder
/// would replace this with something that actually does something with
/// the envelope (queue it, POST it, hand it to a parser).
struct LoggingHandler;

#[async_trait]
impl relay_smtp::checkers::Handler for LoggingHandler {
    async fn handle(&self, peer: &Peer, envelope: &Envelope, _ctx: &SessionContext) -> Result<String, SmtpError> {
        let queue_id = Uuid::new_v4().to_string();
        info!(
            "accepted {} bytes from {} for {:?} via {} (queued as {})",
            envelope.body.len(),
            envelope.sender,
            envelope.recipients,
            peer.addr,
            queue_id
        );
        Ok(queue_id)
    }
}

/// Settings for this demo binary, loaded from `RELAY_`-prefixed
/// environment variables. The library itself has no notion of
/// environment variables; this struct exists only at the edge of the
/// demo binary.
struct DemoSettings {
    bind_address: String,
    port: u16,
    hostname: String,
    target_emails: Vec<String>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    force_tls: bool,
}

impl DemoSettings {
    fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let target_emails_str = env::var("RELAY_TARGET_EMAILS")
            .map_err(|e| anyhow!(e).context("RELAY_TARGET_EMAILS environment variable must be set"))?;
        let target_emails: Vec<String> = target_emails_str
            .split(',')
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if target_emails.is_empty() {
            return Err(anyhow!("RELAY_TARGET_EMAILS must contain at least one address"));
        }
        info!("Config: Using target_emails: {:?}", target_emails);

        let bind_address = env::var("RELAY_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());
        info!("Config: Using bind_address: {}", bind_address);

        let port_str = env::var("RELAY_PORT").unwrap_or_else(|_| "2525".to_string());
        let port: u16 = port_str
            .parse()
            .map_err(|e| anyhow!("RELAY_PORT ('{}') must be a valid u16 port number: {}", port_str, e))?;
        info!("Config: Using port: {}", port);

        let hostname = env::var("RELAY_HOSTNAME").unwrap_or_else(|_| "localhost.localdomain".to_string());

        let tls_cert_path = env::var("RELAY_TLS_CERT").ok().map(PathBuf::from);
        let tls_key_path = env::var("RELAY_TLS_KEY").ok().map(PathBuf::from);

        let force_tls = env::var("RELAY_FORCE_TLS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            bind_address,
            port,
            hostname,
            target_emails,
            tls_cert_path,
            tls_key_path,
            force_tls,
        })
    }
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    if let Err(e) = run().await {
        error!("relay demo error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = DemoSettings::from_env()?;

    let mut builder = ServerConfig::builder()
        .hostname(settings.hostname.clone())
        .recipient_checker(Arc::new(TargetEmailChecker {
            targets: settings.target_emails,
        }))
        .handler(Arc::new(LoggingHandler))
        .force_tls(settings.force_tls);

    if let (Some(cert), Some(key)) = (&settings.tls_cert_path, &settings.tls_key_path) {
        let tls = TlsSettings::from_pem_files(cert, key)?;
        builder = builder.tls(tls);
    } else if settings.force_tls {
        return Err(anyhow!("RELAY_FORCE_TLS is set but RELAY_TLS_CERT/RELAY_TLS_KEY were not provided"));
    }

    let config = builder.build()?;
    let server = Arc::new(Server::new(config));

    let addr: SocketAddr = format!("{}:{}", settings.bind_address, settings.port)
        .parse()
        .map_err(|e| anyhow!("invalid bind address/port: {e}"))?;

    let serve_server = Arc::clone(&server);
    let serve_handle = tokio::spawn(async move { serve_server.serve(&addr.to_string()).await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }
    info!("shutdown requested, draining in-flight sessions");
    server.shutdown();

    serve_handle.await.map_err(|e| anyhow!("server task failed: {e}"))??;
    Ok(())
}
