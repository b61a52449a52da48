//! The per-connection state machine: drives one connection from greeting
//! to close, dispatching SMTP verbs, invoking checkers, and managing
//! STARTTLS, AUTH and DATA ingest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::auth::{decode_login_field, decode_plain, encode_prompt, is_cancel};
use crate::checkers::SessionContext;
use crate::config::ServerConfig;
use crate::envelope::{format_received_header, unstuff_dot_line, Envelope};
use crate::error::SmtpError;
use crate::io::{LineIo, Stream};
use crate::peer::{Peer, Protocol, TlsInfo};
use crate::proxy::{parse_proxy_v1, parse_xclient_attrs};

/// The linger before closing a socket, letting a client observe the final
/// reply bytes before the FIN arrives.
const CLOSE_LINGER: Duration = Duration::from_millis(200);

/// Explicit session states, preferred here over a scatter of boolean flags
/// since the transition table is exhaustive and easier to reason about as
/// an enum. `Authenticating` is entered and exited entirely within
/// [`Session::handle_auth`] and never observed by the outer dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Identified,
    MailFrom,
    Rcpt,
    Data,
}

/// Why a session loop stopped.
enum LoopOutcome {
    ClientQuit,
    ConnectionLost,
}

/// One connection's transient state: the socket, the peer descriptor, any
/// envelope under construction, and a reference to the shared server
/// configuration.
pub struct Session {
    io: LineIo,
    peer: Peer,
    envelope: Option<Envelope>,
    state: SessionState,
    config: Arc<ServerConfig>,
    ctx: SessionContext,
}

impl Session {
    pub fn new(stream: Box<dyn Stream>, addr: SocketAddr, local_addr: SocketAddr, config: Arc<ServerConfig>) -> Self {
        Self {
            io: LineIo::new(stream),
            peer: Peer::new(addr, config.hostname.clone()),
            envelope: None,
            state: SessionState::Connected,
            config,
            ctx: SessionContext { local_addr },
        }
    }

    /// Drives the connection to completion: optional PROXY header, the
    /// connection checker, the banner, and the command loop.
    pub async fn run(mut self) {
        if let Some(hook) = self.config.conn_context.clone() {
            self.ctx = hook.extend(&self.peer, self.ctx.clone()).await;
        }

        if self.config.enable_proxy_protocol {
            if !self.consume_proxy_header().await {
                self.linger_and_close().await;
                return;
            }
        }

        if let Some(checker) = self.config.connection_checker.clone() {
            if let Err(e) = checker.check(&self.peer, &self.ctx).await {
                let _ = self.reply(e.code, &e.message).await;
                self.linger_and_close().await;
                return;
            }
        }

        if self.reply(220, &self.config.welcome_message.clone()).await.is_err() {
            return;
        }

        match self.command_loop().await {
            LoopOutcome::ClientQuit | LoopOutcome::ConnectionLost => {}
        }
        self.linger_and_close().await;
    }

    async fn linger_and_close(&mut self) {
        tokio::time::sleep(CLOSE_LINGER).await;
    }

    async fn consume_proxy_header(&mut self) -> bool {
        let line = match self.io.read_line(self.config.read_timeout).await {
            Ok(line) => line,
            Err(_) => return false,
        };
        let text = String::from_utf8_lossy(&line);
        match parse_proxy_v1(&text) {
            Some(header) => {
                self.peer.addr = header.source;
                true
            }
            None => false,
        }
    }

    async fn command_loop(&mut self) -> LoopOutcome {
        loop {
            let deadline = if self.state == SessionState::Data {
                self.config.data_timeout
            } else {
                self.config.read_timeout
            };

            let raw = match self.io.read_line(deadline).await {
                Ok(raw) => raw,
                Err(crate::io::ReadLineError::TooLong) => {
                    let err = SmtpError::line_too_long();
                    let _ = self.reply(err.code, &err.message).await;
                    self.apply_rset();
                    continue;
                }
                Err(_) => return LoopOutcome::ConnectionLost,
            };

            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(logger) = &self.config.protocol_logger {
                logger.received(self.peer.addr, &line);
            }

            if self.force_tls_violation(&line) {
                let err = SmtpError::tls_required();
                let _ = self.reply(err.code, &err.message).await;
                continue;
            }

            match self.dispatch(&line).await {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Quit => return LoopOutcome::ClientQuit,
                DispatchOutcome::Closed => return LoopOutcome::ConnectionLost,
            }
        }
    }

    fn force_tls_violation(&self, line: &str) -> bool {
        if !self.config.force_tls || self.peer.is_tls() {
            return false;
        }
        let verb = verb_of(line);
        !matches!(verb.as_str(), "NOOP" | "EHLO" | "HELO" | "STARTTLS" | "QUIT" | "RSET")
    }

    async fn dispatch(&mut self, line: &str) -> DispatchOutcome {
        let verb = verb_of(line);
        let rest = line.get(verb.len()..).unwrap_or("").trim_start();

        match verb.as_str() {
            "HELO" => self.handle_helo(rest, Protocol::Smtp).await,
            "EHLO" => self.handle_helo(rest, Protocol::Esmtp).await,
            "STARTTLS" => self.handle_starttls().await,
            "AUTH" => self.handle_auth(rest).await,
            "MAIL" => self.handle_mail(rest).await,
            "RCPT" => self.handle_rcpt(rest).await,
            "DATA" => self.handle_data().await,
            "RSET" => self.handle_rset().await,
            "VRFY" => {
                self.send(252, "Cannot VRFY user, but will accept message and attempt delivery").await
            }
            "NOOP" => self.send(250, "OK").await,
            "QUIT" => {
                let _ = self.send(221, &format!("{} closing connection", self.config.hostname)).await;
                return DispatchOutcome::Quit;
            }
            "HELP" => self.send(214, "See RFC 5321").await,
            "XCLIENT" => self.handle_xclient(rest).await,
            _ => {
                let err = SmtpError::unknown_command();
                self.send(err.code, &err.message).await
            }
        }
    }

    async fn handle_helo(&mut self, rest: &str, protocol: Protocol) -> DispatchOutcome {
        let name = rest.split_whitespace().next().unwrap_or("").to_string();
        if name.is_empty() {
            let err = SmtpError::syntax("HELO/EHLO requires a domain argument");
            return self.send(err.code, &err.message).await;
        }

        self.peer.helo_name = Some(name.clone());
        self.peer.protocol = Some(protocol);
        self.envelope = None;
        self.state = SessionState::Identified;

        if let Some(checker) = self.config.helo_checker.clone() {
            if let Err(e) = checker.check(&self.peer, &name, &self.ctx).await {
                let _ = self.send(e.code, &e.message).await;
                return DispatchOutcome::Closed;
            }
        }

        match protocol {
            Protocol::Smtp => self.send(250, &self.config.hostname.clone()).await,
            Protocol::Esmtp => self.send_ehlo_extensions(&name).await,
        }
    }

    async fn send_ehlo_extensions(&mut self, client_name: &str) -> DispatchOutcome {
        let hostname = self.config.hostname.clone();
        let mut lines = vec![format!("{hostname} greets {client_name}")];
        lines.push(format!("SIZE {}", self.config.max_message_size));
        lines.push("8BITMIME".to_string());
        lines.push("PIPELINING".to_string());
        if self.config.tls.is_some() && !self.peer.is_tls() {
            lines.push("STARTTLS".to_string());
        }
        if self.peer.is_tls() && self.config.auth_enabled() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        if self.config.enable_xclient {
            lines.push("XCLIENT".to_string());
        }
        if self.reply_multiline(250, &lines).await.is_err() {
            return DispatchOutcome::Closed;
        }
        DispatchOutcome::Continue
    }

    async fn handle_starttls(&mut self) -> DispatchOutcome {
        let Some(tls) = self.config.tls.clone() else {
            let err = SmtpError::unknown_command();
            return self.send(err.code, &err.message).await;
        };
        if self.state != SessionState::Identified {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }
        if self.peer.is_tls() {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }

        if self.send(220, "Go ahead").await == DispatchOutcome::Closed {
            return DispatchOutcome::Closed;
        }

        let plain_stream = self.io.take_stream();
        let handshake = tokio::time::timeout(
            self.config.write_timeout + self.config.read_timeout,
            tls.acceptor.accept(plain_stream),
        )
        .await;

        let tls_stream = match handshake {
            Ok(Ok(stream)) => stream,
            _ => {
                log::warn!("TLS handshake failed for {}", self.peer.addr);
                return DispatchOutcome::Closed;
            }
        };

        let (_, server_conn) = tls_stream.get_ref();
        let protocol_version = server_conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        let client_certificate_presented = server_conn.peer_certificates().is_some();

        self.io.replace_stream(Box::new(tls_stream));
        self.peer.tls = Some(TlsInfo {
            protocol_version,
            client_certificate_presented,
        });
        self.peer.reset_identity();
        self.envelope = None;
        self.state = SessionState::Connected;

        DispatchOutcome::Continue
    }

    async fn handle_auth(&mut self, rest: &str) -> DispatchOutcome {
        if self.config.authenticator.is_none() {
            let err = SmtpError::unknown_command();
            return self.send(err.code, &err.message).await;
        }
        if !self.peer.is_tls() {
            let err = SmtpError::tls_required();
            return self.send(err.code, &err.message).await;
        }
        if self.state != SessionState::Identified {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }

        let mut parts = rest.splitn(2, char::is_whitespace);
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        let arg = parts.next().unwrap_or("").trim();

        let credentials = match mechanism.as_str() {
            "PLAIN" => match self.auth_plain(arg).await {
                Ok(creds) => creds,
                Err(outcome) => return outcome,
            },
            "LOGIN" => match self.auth_login().await {
                Ok(creds) => creds,
                Err(outcome) => return outcome,
            },
            _ => {
                let err = SmtpError::syntax("unsupported AUTH mechanism");
                return self.send(err.code, &err.message).await;
            }
        };

        let authenticator = self.config.authenticator.clone().unwrap();
        match authenticator
            .authenticate(&self.peer, &credentials.0, &credentials.1, &self.ctx)
            .await
        {
            Ok(()) => {
                self.peer.username = Some(credentials.0);
                self.peer.password = Some(credentials.1);
                self.envelope = None;
                self.send(235, "Authentication succeeded").await
            }
            Err(e) => self.send(e.code, &e.message).await,
        }
    }

    /// Returns `(username, password)` or a `DispatchOutcome` already sent
    /// to the client (syntax error, cancellation).
    async fn auth_plain(&mut self, arg: &str) -> Result<(String, String), DispatchOutcome> {
        let b64 = if arg.is_empty() {
            match self.prompt_continuation("334 ").await {
                Ok(line) => line,
                Err(outcome) => return Err(outcome),
            }
        } else {
            arg.to_string()
        };

        if is_cancel(&b64) {
            let err = SmtpError::syntax("authentication cancelled");
            let _ = self.send(err.code, &err.message).await;
            return Err(DispatchOutcome::Continue);
        }

        match decode_plain(&b64) {
            Ok(creds) => Ok((creds.username, creds.password)),
            Err(e) => {
                let _ = self.send(e.code, &e.message).await;
                Err(DispatchOutcome::Continue)
            }
        }
    }

    async fn auth_login(&mut self) -> Result<(String, String), DispatchOutcome> {
        let username_prompt = format!("334 {}", encode_prompt("Username:"));
        let username_b64 = match self.prompt_continuation(&username_prompt).await {
            Ok(line) => line,
            Err(outcome) => return Err(outcome),
        };
        if is_cancel(&username_b64) {
            let err = SmtpError::syntax("authentication cancelled");
            let _ = self.send(err.code, &err.message).await;
            return Err(DispatchOutcome::Continue);
        }
        let username = match decode_login_field(&username_b64) {
            Ok(u) => u,
            Err(e) => {
                let _ = self.send(e.code, &e.message).await;
                return Err(DispatchOutcome::Continue);
            }
        };

        let password_prompt = format!("334 {}", encode_prompt("Password:"));
        let password_b64 = match self.prompt_continuation(&password_prompt).await {
            Ok(line) => line,
            Err(outcome) => return Err(outcome),
        };
        if is_cancel(&password_b64) {
            let err = SmtpError::syntax("authentication cancelled");
            let _ = self.send(err.code, &err.message).await;
            return Err(DispatchOutcome::Continue);
        }
        let password = match decode_login_field(&password_b64) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.send(e.code, &e.message).await;
                return Err(DispatchOutcome::Continue);
            }
        };

        Ok((username, password))
    }

    /// Writes a raw continuation prompt (already including its `334 `
    /// prefix) and reads the client's reply line.
    async fn prompt_continuation(&mut self, prompt: &str) -> Result<String, DispatchOutcome> {
        if self.io.write_line(prompt, self.config.write_timeout).await.is_err() {
            return Err(DispatchOutcome::Closed);
        }
        match self.io.read_line(self.config.read_timeout).await {
            Ok(raw) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Err(_) => Err(DispatchOutcome::Closed),
        }
    }

    async fn handle_mail(&mut self, rest: &str) -> DispatchOutcome {
        if self.state != SessionState::Identified {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }
        let Some(address) = parse_angle_address(rest, "FROM:") else {
            let err = SmtpError::syntax("MAIL FROM requires a <address> argument");
            return self.send(err.code, &err.message).await;
        };

        if let Some(checker) = self.config.sender_checker.clone() {
            if let Err(e) = checker.check(&self.peer, &address, &self.ctx).await {
                return self.send(e.code, &e.message).await;
            }
        }

        self.envelope = Some(Envelope::new(address));
        self.state = SessionState::MailFrom;
        self.send(250, "OK").await
    }

    async fn handle_rcpt(&mut self, rest: &str) -> DispatchOutcome {
        if !matches!(self.state, SessionState::MailFrom | SessionState::Rcpt) {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }
        let Some(address) = parse_angle_address(rest, "TO:") else {
            let err = SmtpError::syntax("RCPT TO requires a <address> argument");
            return self.send(err.code, &err.message).await;
        };

        let recipient_count = self.envelope.as_ref().map(|e| e.recipients.len()).unwrap_or(0);
        if recipient_count >= self.config.max_recipients {
            let err = SmtpError::too_many_recipients(self.config.max_recipients);
            return self.send(err.code, &err.message).await;
        }

        if let Some(checker) = self.config.recipient_checker.clone() {
            if let Err(e) = checker.check(&self.peer, &address, &self.ctx).await {
                return self.send(e.code, &e.message).await;
            }
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.recipients.push(address);
        }
        self.state = SessionState::Rcpt;
        self.send(250, "OK").await
    }

    async fn handle_data(&mut self) -> DispatchOutcome {
        if self.state != SessionState::Rcpt {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }
        if self.send(354, "Go ahead").await == DispatchOutcome::Closed {
            return DispatchOutcome::Closed;
        }

        self.state = SessionState::Data;
        let outcome = self.ingest_data().await;
        self.envelope = None;
        self.state = SessionState::Identified;
        outcome
    }

    async fn ingest_data(&mut self) -> DispatchOutcome {
        let max_size = self.config.max_message_size;
        let mut over_limit = false;

        loop {
            let raw = match self.io.read_line(self.config.data_timeout).await {
                Ok(raw) => raw,
                Err(crate::io::ReadLineError::TooLong) => continue,
                Err(_) => return DispatchOutcome::Closed,
            };

            if raw == b"." {
                break;
            }

            if over_limit {
                continue;
            }

            let unstuffed = unstuff_dot_line(&raw);
            if let Some(envelope) = self.envelope.as_mut() {
                if envelope.body.len() + unstuffed.len() + 2 > max_size {
                    over_limit = true;
                    continue;
                }
                envelope.body.extend_from_slice(unstuffed);
                envelope.body.extend_from_slice(b"\r\n");
            }
        }

        if over_limit {
            let err = SmtpError::message_too_large(max_size);
            return self.send(err.code, &err.message).await;
        }

        self.finish_data().await
    }

    async fn finish_data(&mut self) -> DispatchOutcome {
        let Some(mut envelope) = self.envelope.take() else {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        };

        let helo_name = self.peer.helo_name.clone().unwrap_or_default();
        let protocol = self.peer.protocol.map(|p| p.as_str()).unwrap_or("SMTP");
        let received = format_received_header(&helo_name, &self.peer, &self.config.hostname, protocol);
        let mut body = received.into_bytes();
        body.extend_from_slice(&envelope.body);
        envelope.body = body;

        let result = if let Some(handler) = self.config.handler.clone() {
            handler.handle(&self.peer, &envelope, &self.ctx).await
        } else {
            Ok(Uuid::new_v4().to_string())
        };

        match result {
            Ok(queue_id) => {
                self.send(250, &format!("2.0.0 Ok: queued as {queue_id}")).await
            }
            Err(e) => self.send(e.code, &e.message).await,
        }
    }

    async fn handle_rset(&mut self) -> DispatchOutcome {
        if self.peer.helo_name.is_none() {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }
        self.apply_rset();
        self.send(250, "OK").await
    }

    fn apply_rset(&mut self) {
        self.envelope = None;
        self.state = if self.peer.helo_name.is_some() {
            SessionState::Identified
        } else {
            SessionState::Connected
        };
    }

    async fn handle_xclient(&mut self, rest: &str) -> DispatchOutcome {
        if !self.config.enable_xclient {
            let err = SmtpError::unknown_command();
            return self.send(err.code, &err.message).await;
        }
        if self.state != SessionState::Identified {
            let err = SmtpError::sequence();
            return self.send(err.code, &err.message).await;
        }

        let attrs = parse_xclient_attrs(rest);
        if let (Some(addr), Some(port)) = (attrs.addr.as_ref(), attrs.port) {
            if let Ok(ip) = addr.parse() {
                self.peer.addr = SocketAddr::new(ip, port);
            }
        }
        if let Some(proto) = attrs.proto {
            self.peer.protocol = Some(if proto.eq_ignore_ascii_case("ESMTP") {
                Protocol::Esmtp
            } else {
                Protocol::Smtp
            });
        }
        if let Some(login) = attrs.login {
            self.peer.username = Some(login);
        }

        self.peer.reset_identity();
        self.envelope = None;
        self.state = SessionState::Connected;

        self.send(250, "OK").await
    }

    async fn reply(&mut self, code: u16, message: &str) -> Result<(), ()> {
        let line = format!("{code} {message}");
        if let Some(logger) = &self.config.protocol_logger {
            logger.sent(self.peer.addr, &line);
        }
        self.io
            .write_line(&line, self.config.write_timeout)
            .await
            .map_err(|_| ())
    }

    async fn reply_multiline(&mut self, code: u16, lines: &[String]) -> Result<(), ()> {
        for (i, text) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            let line = format!("{code}{sep}{text}");
            if let Some(logger) = &self.config.protocol_logger {
                logger.sent(self.peer.addr, &line);
            }
            self.io
                .write_line(&line, self.config.write_timeout)
                .await
                .map_err(|_| ())?;
        }
        Ok(())
    }

    async fn send(&mut self, code: u16, message: &str) -> DispatchOutcome {
        match self.reply(code, message).await {
            Ok(()) => DispatchOutcome::Continue,
            Err(()) => DispatchOutcome::Closed,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DispatchOutcome {
    Continue,
    Quit,
    Closed,
}

fn verb_of(line: &str) -> String {
    line.split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Parses `MAIL FROM:<addr> ...`/`RCPT TO:<addr> ...`, returning the
/// address between angle brackets. `prefix` is `"FROM:"` or `"TO:"`
/// (case-insensitively matched).
fn parse_angle_address(rest: &str, prefix: &str) -> Option<String> {
    let trimmed = rest.trim_start();
    let lower = trimmed.to_ascii_uppercase();
    if !lower.starts_with(prefix) {
        return None;
    }
    let after_prefix = &trimmed[prefix.len()..];
    let start = after_prefix.find('<')?;
    let end = after_prefix.find('>')?;
    if end < start {
        return None;
    }
    Some(after_prefix[start + 1..end].to_string())
}
