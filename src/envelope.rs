//! Accumulating per-message state: sender, recipients, and the DATA body.

use chrono::Local;

use crate::peer::Peer;

/// The SMTP triple of sender, recipient list and message body, plus the
/// metadata accumulated while building it.
///
/// Created on `MAIL FROM`, discarded on `RSET`, a successful
/// `HELO`/`EHLO`/`STARTTLS`, or a successful delivery.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipients: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// Strips a single leading `.` from a DATA line, per RFC 5321 §4.5.2
/// dot-stuffing. A line of exactly `..` becomes `.`; a line that doesn't
/// start with `.` is returned unchanged.
pub fn unstuff_dot_line(line: &[u8]) -> &[u8] {
    if line.first() == Some(&b'.') {
        &line[1..]
    } else {
        line
    }
}

/// Builds the `Received:` trace header prepended to every successfully
/// ingested message.
///
/// `helo_name` is the name the client announced via HELO/EHLO; `peer_addr`
/// and `hostname`/`protocol` describe the relay side of the hop.
pub fn format_received_header(
    helo_name: &str,
    peer: &Peer,
    hostname: &str,
    protocol: &str,
) -> String {
    let timestamp = Local::now().format("%a, %d %b %Y %H:%M:%S %z");
    format!(
        "Received: from {helo_name} ({peer_addr}) by {hostname} with {protocol}; {timestamp}\r\n",
        peer_addr = peer.addr,
    )
}
