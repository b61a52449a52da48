//! PROXY protocol v1 header parsing and XCLIENT attribute parsing.

use std::net::SocketAddr;

/// The source/destination pair carried by a PROXY v1 header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// Parses a PROXY protocol v1 line:
/// `PROXY TCP4|TCP6 SRCIP DSTIP SRCPORT DSTPORT`.
///
/// `line` must not include the trailing CRLF.
pub fn parse_proxy_v1(line: &str) -> Option<ProxyHeader> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "PROXY" {
        return None;
    }
    let proto = tokens.next()?;
    if proto != "TCP4" && proto != "TCP6" {
        return None;
    }
    let src_ip = tokens.next()?;
    let dst_ip = tokens.next()?;
    let src_port: u16 = tokens.next()?.parse().ok()?;
    let dst_port: u16 = tokens.next()?.parse().ok()?;
    if tokens.next().is_some() {
        return None;
    }
    let source = format!("{src_ip}:{src_port}").parse().ok()?;
    let destination = format!("{dst_ip}:{dst_port}").parse().ok()?;
    Some(ProxyHeader { source, destination })
}

/// XCLIENT attributes a trusted front-end may rewrite.
#[derive(Debug, Clone, Default)]
pub struct XclientAttrs {
    pub name: Option<String>,
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub proto: Option<String>,
    pub helo: Option<String>,
    pub login: Option<String>,
}

/// Parses the space-separated `KEY=value` attributes of an `XCLIENT`
/// command line (the verb itself already stripped).
pub fn parse_xclient_attrs(rest: &str) -> XclientAttrs {
    let mut attrs = XclientAttrs::default();
    for token in rest.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        match key.to_ascii_uppercase().as_str() {
            "NAME" => attrs.name = Some(value.to_string()),
            "ADDR" => attrs.addr = Some(value.to_string()),
            "PORT" => attrs.port = value.parse().ok(),
            "PROTO" => attrs.proto = Some(value.to_string()),
            "HELO" => attrs.helo = Some(value.to_string()),
            "LOGIN" => attrs.login = Some(value.to_string()),
            _ => {}
        }
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_tcp4_header() {
        let header = parse_proxy_v1("PROXY TCP4 192.168.1.1 192.168.1.2 56324 25").unwrap();
        assert_eq!(header.source, "192.168.1.1:56324".parse().unwrap());
        assert_eq!(header.destination, "192.168.1.2:25".parse().unwrap());
    }

    #[test]
    fn rejects_wrong_keyword() {
        assert!(parse_proxy_v1("EHLO client.example.com").is_none());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_proxy_v1("PROXY TCP4 1.1.1.1 2.2.2.2 notaport 25").is_none());
    }

    #[test]
    fn parses_xclient_attrs() {
        let attrs = parse_xclient_attrs("NAME=client.example.com ADDR=10.0.0.9 PORT=41000 PROTO=ESMTP LOGIN=alice");
        assert_eq!(attrs.name.as_deref(), Some("client.example.com"));
        assert_eq!(attrs.addr.as_deref(), Some("10.0.0.9"));
        assert_eq!(attrs.port, Some(41000));
        assert_eq!(attrs.proto.as_deref(), Some("ESMTP"));
        assert_eq!(attrs.login.as_deref(), Some("alice"));
        assert!(attrs.helo.is_none());
    }
}
