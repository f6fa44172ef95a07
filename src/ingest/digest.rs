//! HTTP Digest access authentication (RFC 2617 / RFC 7616, qop=auth).

use md5::Md5;
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn token(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    fn hash_hex(self, input: &str) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// Parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DigestChallenge {
    pub(crate) realm: String,
    pub(crate) nonce: String,
    pub(crate) opaque: Option<String>,
    /// `Some("auth")` when the server offers qop=auth.
    pub(crate) qop: Option<String>,
    pub(crate) algorithm: DigestAlgorithm,
}

impl DigestChallenge {
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = DigestAlgorithm::Md5;
        for (key, value) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    if value.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                        qop = Some("auth".to_string());
                    }
                }
                "algorithm" => {
                    algorithm = match value.to_ascii_uppercase().as_str() {
                        "MD5" => DigestAlgorithm::Md5,
                        "SHA-256" => DigestAlgorithm::Sha256,
                        _ => return None,
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop,
            algorithm,
        })
    }
}

/// Split `key=value, key="quoted, value"` pairs.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    pairs
}

/// Digest state for one endpoint: last challenge plus nonce counter.
#[derive(Debug, Default)]
pub(crate) struct DigestState {
    challenge: Option<DigestChallenge>,
    nonce_count: u32,
}

impl DigestState {
    pub(crate) fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Adopt a new challenge. Returns false if the header is not a usable
    /// Digest challenge.
    pub(crate) fn accept_challenge(&mut self, header: &str) -> bool {
        match DigestChallenge::parse(header) {
            Some(challenge) => {
                if self.challenge.as_ref().map(|c| &c.nonce) != Some(&challenge.nonce) {
                    self.nonce_count = 0;
                }
                self.challenge = Some(challenge);
                true
            }
            None => false,
        }
    }

    /// `Authorization` header value for the next request, if challenged.
    pub(crate) fn authorization(
        &mut self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        self.nonce_count = self.nonce_count.wrapping_add(1);
        let cnonce = hex::encode(rand::random::<[u8; 8]>());
        Some(authorization_header(
            challenge,
            username,
            password,
            method,
            uri,
            self.nonce_count,
            &cnonce,
        ))
    }
}

pub(crate) fn authorization_header(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce_count: u32,
    cnonce: &str,
) -> String {
    let alg = challenge.algorithm;
    let ha1 = alg.hash_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = alg.hash_hex(&format!("{}:{}", method, uri));
    let nc = format!("{:08x}", nonce_count);

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}",
        username,
        challenge.realm,
        challenge.nonce,
        uri,
        alg.token()
    );
    let response = match &challenge.qop {
        Some(qop) => {
            let response = alg.hash_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, nc, cnonce, qop, ha2
            ));
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
            response
        }
        None => alg.hash_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    };
    header.push_str(&format!(", response=\"{}\"", response));
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC2617_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    #[test]
    fn parses_quoted_challenge() {
        let challenge = DigestChallenge::parse(RFC2617_CHALLENGE).expect("challenge");
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(
            challenge.opaque.as_deref(),
            Some("5ccc069c403ebaf9f0171e9517f40e41")
        );
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
    }

    #[test]
    fn rejects_basic_and_unknown_algorithms() {
        assert!(DigestChallenge::parse(r#"Basic realm="cam""#).is_none());
        assert!(
            DigestChallenge::parse(r#"Digest realm="cam", nonce="n", algorithm=SHA-512-256"#)
                .is_none()
        );
    }

    #[test]
    fn rfc2617_mufasa_response() {
        let challenge = DigestChallenge::parse(RFC2617_CHALLENGE).expect("challenge");
        let header = authorization_header(
            &challenge,
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            1,
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn nonce_count_advances_until_nonce_changes() {
        let mut state = DigestState::default();
        assert!(state.authorization("u", "p", "GET", "/").is_none());
        assert!(state.accept_challenge(RFC2617_CHALLENGE));

        let first = state.authorization("u", "p", "GET", "/").expect("header");
        let second = state.authorization("u", "p", "GET", "/").expect("header");
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));

        assert!(state.accept_challenge(r#"Digest realm="r", nonce="fresh", qop="auth""#));
        let third = state.authorization("u", "p", "GET", "/").expect("header");
        assert!(third.contains("nc=00000001"));
    }
}
