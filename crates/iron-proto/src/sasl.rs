//! SASL payload encoding for IRC authentication.
//!
//! # Reference
//! - RFC 4616 (PLAIN): <https://tools.ietf.org/html/rfc4616>
//! - IRCv3 SASL 3.2: <https://ircv3.net/specs/extensions/sasl-3.2>

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Encode credentials for the PLAIN mechanism.
///
/// The PLAIN mechanism encodes `authzid NUL authcid NUL password`; for IRC
/// the authzid is left empty.
pub fn encode_plain(username: &str, password: &str) -> String {
    let payload = format!("\0{username}\0{password}");
    BASE64.encode(payload.as_bytes())
}

/// The client response for the EXTERNAL mechanism.
///
/// Authentication is implicit in the TLS client certificate, so the
/// response payload is empty, sent as `+`.
pub const EXTERNAL_RESPONSE: &str = "+";

/// Split an AUTHENTICATE payload into 400-byte chunks per the IRCv3 spec,
/// with a final `+` line when the payload length is a multiple of 400.
pub fn chunk_authenticate(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return vec!["+".to_owned()];
    }
    let mut chunks: Vec<String> = payload
        .as_bytes()
        .chunks(400)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if payload.len() % 400 == 0 {
        chunks.push("+".to_owned());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn plain_payload_layout() {
        let encoded = encode_plain("user", "pass");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, b"\0user\0pass");
    }

    #[test]
    fn short_payload_single_chunk() {
        assert_eq!(chunk_authenticate("abcd"), vec!["abcd"]);
    }

    #[test]
    fn exact_multiple_gets_plus_terminator() {
        let payload = "a".repeat(400);
        let chunks = chunk_authenticate(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "+");
    }
}
