//! Base64 framing for the AUTH PLAIN/LOGIN sub-dialogue.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::SmtpError;

/// Credentials extracted from an `AUTH PLAIN` payload.
pub struct PlainCredentials {
    pub authorization_id: String,
    pub username: String,
    pub password: String,
}

/// Decodes and splits a base64 `AUTH PLAIN` payload, which is
/// `\0authzid\0authcid\0password` once decoded.
pub fn decode_plain(b64: &str) -> Result<PlainCredentials, SmtpError> {
    let raw = decode_base64(b64)?;
    let mut parts = raw.split(|&b| b == 0);
    let authorization_id = parts.next().ok_or_else(|| SmtpError::syntax("malformed AUTH PLAIN payload"))?;
    let username = parts.next().ok_or_else(|| SmtpError::syntax("malformed AUTH PLAIN payload"))?;
    let password = parts.next().ok_or_else(|| SmtpError::syntax("malformed AUTH PLAIN payload"))?;
    if parts.next().is_some() {
        return Err(SmtpError::syntax("malformed AUTH PLAIN payload"));
    }
    Ok(PlainCredentials {
        authorization_id: String::from_utf8_lossy(authorization_id).into_owned(),
        username: String::from_utf8_lossy(username).into_owned(),
        password: String::from_utf8_lossy(password).into_owned(),
    })
}

/// Decodes a single base64 field used by the AUTH LOGIN continuation
/// prompts (username, then password).
pub fn decode_login_field(b64: &str) -> Result<String, SmtpError> {
    let raw = decode_base64(b64)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub fn encode_prompt(plain: &str) -> String {
    STANDARD.encode(plain.as_bytes())
}

/// `*` cancels an AUTH continuation per RFC 4954.
pub fn is_cancel(line: &str) -> bool {
    line.trim() == "*"
}

fn decode_base64(b64: &str) -> Result<Vec<u8>, SmtpError> {
    STANDARD
        .decode(b64.trim())
        .map_err(|_| SmtpError::syntax("malformed base64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_plain_payload() {
        let b64 = STANDARD.encode(b"\0alice\0s3cret");
        let creds = decode_plain(&b64).unwrap();
        assert_eq!(creds.authorization_id, "");
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn rejects_malformed_base64() {
        let err = decode_plain("not-base64!!!").unwrap_err();
        assert_eq!(err.code, 501);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let b64 = STANDARD.encode(b"onlyonefield");
        let err = decode_plain(&b64).unwrap_err();
        assert_eq!(err.code, 501);
    }

    #[test]
    fn login_field_round_trips() {
        let encoded = encode_prompt("alice");
        assert_eq!(decode_login_field(&encoded).unwrap(), "alice");
    }

    #[test]
    fn recognises_cancel_marker() {
        assert!(is_cancel("*"));
        assert!(!is_cancel("QWxpY2U="));
    }
}
