//! The remote party of a session: network address, TLS state, HELO name
//! and authenticated identity.

use std::net::SocketAddr;

/// Negotiated protocol tag, set once HELO/EHLO succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Esmtp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Smtp => "SMTP",
            Protocol::Esmtp => "ESMTP",
        }
    }
}

/// TLS state recorded on the peer once STARTTLS succeeds.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Negotiated TLS protocol version, e.g. "TLSv1.3".
    pub protocol_version: String,
    /// Whether the peer presented a client certificate.
    pub client_certificate_presented: bool,
}

/// Describes the remote party of one SMTP session.
///
/// Mutated only by the session on specific transitions: HELO/EHLO sets
/// `helo_name`/`protocol`; successful AUTH sets `username`/`password`;
/// successful STARTTLS sets `tls`; XCLIENT/PROXY may rewrite `addr`,
/// `helo_name`, `username`, `protocol` and `tls`.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub tls: Option<TlsInfo>,
    pub helo_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: Option<Protocol>,
    pub server_hostname: String,
}

impl Peer {
    pub fn new(addr: SocketAddr, server_hostname: impl Into<String>) -> Self {
        Self {
            addr,
            tls: None,
            helo_name: None,
            username: None,
            password: None,
            protocol: None,
            server_hostname: server_hostname.into(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Clears the announced HELO/EHLO name, leaving everything else
    /// (address, TLS state, authenticated identity) untouched. Used after
    /// STARTTLS and XCLIENT, both of which require the client to re-issue
    /// EHLO before any further mail transaction.
    pub fn reset_identity(&mut self) {
        self.helo_name = None;
    }
}
