//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Client side of the challenge/response scheme: parse a
//! WWW-Authenticate/Proxy-Authenticate challenge, compute the MD5 digest
//! response and render the credentials value to send back.

use crate::error::{Error, Result};
use rand::Rng;
use std::collections::HashMap;

/// A parsed Digest challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    /// Set when the challenge advertised qop and `auth` was among the
    /// offered modes. Any other advertised qop set is rejected.
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse a WWW-Authenticate or Proxy-Authenticate header value.
    pub fn parse(challenge: &str) -> Result<Self> {
        let params = parse_digest_params(challenge);

        let realm = params
            .get("realm")
            .ok_or_else(|| Error::Protocol("no realm in digest challenge".to_string()))?
            .to_string();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| Error::Protocol("no nonce in digest challenge".to_string()))?
            .to_string();

        let qop_auth = match params.get("qop") {
            None => false,
            Some(qop) => {
                if qop.split(',').any(|q| q.trim() == "auth") {
                    true
                } else {
                    return Err(Error::Protocol(format!("unsupported qop \"{qop}\"")));
                }
            }
        };

        Ok(Self {
            realm,
            nonce,
            qop_auth,
        })
    }

    /// Render a ready-to-send credentials value (`Digest ...`) for the
    /// given request. A fresh client nonce is derived when qop=auth.
    pub fn authorization_value(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        if self.qop_auth {
            let cnonce = generate_cnonce();
            let response = digest_response(
                username,
                password,
                &self.realm,
                &self.nonce,
                method,
                uri,
                Some(&cnonce),
            );
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                 response=\"{}\", algorithm=MD5, qop=auth, nc={}, cnonce=\"{}\"",
                username, self.realm, self.nonce, uri, response, NONCE_COUNT, cnonce
            )
        } else {
            let response = digest_response(
                username,
                password,
                &self.realm,
                &self.nonce,
                method,
                uri,
                None,
            );
            format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                 response=\"{}\", algorithm=MD5",
                username, self.realm, self.nonce, uri, response
            )
        }
    }
}

/// Exactly one exchange per challenge, so the nonce count is fixed.
const NONCE_COUNT: &str = "00000001";

/// Compute the digest response hash. Deterministic for fixed inputs;
/// pass `cnonce` only for qop=auth.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));

    match cnonce {
        Some(cnonce) => md5_hex(&format!(
            "{ha1}:{nonce}:{NONCE_COUNT}:{cnonce}:auth:{ha2}"
        )),
        None => md5_hex(&format!("{ha1}:{nonce}:{ha2}")),
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Parse `key="value"` pairs from a Digest header value.
fn parse_digest_params(challenge: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let digest_str = match challenge.find("Digest") {
        Some(pos) => challenge[pos + "Digest".len()..].trim(),
        None => challenge.trim(),
    };

    for part in digest_str.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            params.insert(key.to_string(), value.to_string());
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str =
        "Digest realm=\"sip.easybell.de\", nonce=\"YKUKemClCU7hC7TQYJoISCtbXfDuXV5P\"";

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "sip.easybell.de");
        assert_eq!(challenge.nonce, "YKUKemClCU7hC7TQYJoISCtbXfDuXV5P");
        assert!(!challenge.qop_auth);
    }

    #[test]
    fn test_parse_challenge_with_qop_auth() {
        let challenge = DigestChallenge::parse(
            "Digest realm=\"r\", nonce=\"n\", qop=\"auth,auth-int\", algorithm=MD5",
        )
        .unwrap();
        assert!(challenge.qop_auth);
    }

    #[test]
    fn test_parse_challenge_missing_realm() {
        let err = DigestChallenge::parse("Digest nonce=\"n\"").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_challenge_missing_nonce() {
        let err = DigestChallenge::parse("Digest realm=\"r\"").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_challenge_unsupported_qop() {
        let err =
            DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\"")
                .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_digest_response_deterministic() {
        let a = digest_response(
            "alice",
            "secret",
            "test.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:test.com",
            None,
        );
        let b = digest_response(
            "alice",
            "secret",
            "test.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:test.com",
            None,
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_digest_response_changes_with_any_input() {
        let base = digest_response("alice", "secret", "r", "n", "REGISTER", "sip:r", None);
        let cases = [
            digest_response("bob", "secret", "r", "n", "REGISTER", "sip:r", None),
            digest_response("alice", "hunter2", "r", "n", "REGISTER", "sip:r", None),
            digest_response("alice", "secret", "r2", "n", "REGISTER", "sip:r", None),
            digest_response("alice", "secret", "r", "n2", "REGISTER", "sip:r", None),
            digest_response("alice", "secret", "r", "n", "OPTIONS", "sip:r", None),
            digest_response("alice", "secret", "r", "n", "REGISTER", "sip:r2", None),
        ];
        for other in cases {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn test_known_rfc2617_style_vector() {
        // HA1 = md5("alice:test.com:secret"), HA2 = md5("REGISTER:sip:test.com")
        let ha1 = format!("{:x}", md5::compute("alice:test.com:secret"));
        let ha2 = format!("{:x}", md5::compute("REGISTER:sip:test.com"));
        let expected = format!("{:x}", md5::compute(format!("{ha1}:nonce1:{ha2}")));
        assert_eq!(
            digest_response("alice", "secret", "test.com", "nonce1", "REGISTER", "sip:test.com", None),
            expected
        );
    }

    #[test]
    fn test_authorization_value_without_qop() {
        let challenge = DigestChallenge::parse(CHALLENGE).unwrap();
        let value = challenge.authorization_value("alice", "secret", "REGISTER", "sip:test.com");
        assert!(value.starts_with("Digest username=\"alice\""));
        assert!(value.contains("realm=\"sip.easybell.de\""));
        assert!(value.contains("algorithm=MD5"));
        assert!(!value.contains("qop="));
        assert!(!value.contains("cnonce"));
    }

    #[test]
    fn test_authorization_value_with_qop() {
        let challenge =
            DigestChallenge::parse("Digest realm=\"r\", nonce=\"n\", qop=\"auth\"").unwrap();
        let value = challenge.authorization_value("alice", "secret", "INVITE", "sip:bob@r");
        assert!(value.contains("qop=auth"));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("cnonce=\""));
    }
}
