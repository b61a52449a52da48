//! The connection supervisor: accepts sockets, enforces the concurrency
//! cap, and drives graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::SmtpError;
use crate::session::Session;

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(30);

/// Owns a listening socket and supervises the sessions accepted on it.
///
/// Binds, runs an accept loop, and spawns one task per connection, with a
/// concurrency cap, tracked shutdown, and backoff on accept errors so a
/// transient accept failure doesn't spin the loop hot.
pub struct Server {
    config: Arc<ServerConfig>,
    semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    shutting_down: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let semaphore = config.connection_limit().map(|n| Arc::new(Semaphore::new(n)));
        Self {
            config,
            semaphore,
            shutdown: CancellationToken::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds `addr` and serves connections until [`Server::shutdown`] is
    /// called. Accept errors are logged and retried with exponential
    /// backoff (capped) rather than terminating the loop.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding SMTP listener on {addr}"))?;
        info!("SMTP relay listening on {addr}");

        let mut sessions = JoinSet::new();
        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            backoff = INITIAL_ACCEPT_BACKOFF;
                            self.spawn_session(&mut sessions, stream, addr);
                        }
                        Err(e) => {
                            error!("error accepting connection: {e}");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                        }
                    }
                }
            }
        }

        info!("no longer accepting connections, draining in-flight sessions");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, addr: std::net::SocketAddr) {
        if self.shutting_down.load(Ordering::SeqCst) {
            sessions.spawn(reject_with(stream, addr, SmtpError::shutting_down()));
            return;
        }

        let permit = match &self.semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    sessions.spawn(reject_with(stream, addr, SmtpError::busy()));
                    return;
                }
            },
            None => None,
        };

        let config = Arc::clone(&self.config);
        let local_addr = stream.local_addr().unwrap_or(addr);
        sessions.spawn(async move {
            let _permit = permit;
            let session = Session::new(Box::new(stream), addr, local_addr, config);
            session.run().await;
        });
    }

    /// Stops accepting new connections. Idempotent: a second call is a
    /// no-op. Does not wait for in-flight sessions to finish; call
    /// [`Server::wait`] for that.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
    }

    /// Waits for the accept loop to notice [`Server::shutdown`] was
    /// called. Errors if shutdown was never requested, since waiting on a
    /// server that isn't stopping would block forever.
    pub async fn wait(&self) -> Result<()> {
        if !self.shutting_down.load(Ordering::SeqCst) {
            anyhow::bail!("wait called before shutdown was requested");
        }
        self.shutdown.cancelled().await;
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

/// Used when a connection must be turned away before a `Session` is worth
/// constructing (capacity exhausted, or shutdown already in progress):
/// writes a single reply line and closes, in the same `CODE text` format
/// every other reply on the wire uses.
async fn reject_with(stream: TcpStream, addr: std::net::SocketAddr, err: SmtpError) {
    use tokio::io::AsyncWriteExt;
    let mut stream = stream;
    let line = format!("{} {}\r\n", err.code, err.message);
    if let Err(e) = stream.write_all(line.as_bytes()).await {
        warn!("failed to write rejection reply to {addr}: {e}");
    }
    let _ = stream.shutdown().await;
}
