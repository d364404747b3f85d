//! SIP Digest authentication (RFC 2617, MD5, no `qop`).
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:HA2)
//! ```

use sipbridge_common::{CallError, CallResult};
use std::fmt;

/// Which header carried the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// `WWW-Authenticate` on a 401
    Www,

    /// `Proxy-Authenticate` on a 407
    Proxy,
}

impl ChallengeKind {
    // ---
    pub fn from_status(status: u16) -> Option<Self> {
        // ---
        match status {
            401 => Some(Self::Www),
            407 => Some(Self::Proxy),
            _ => None,
        }
    }

    /// Header the challenge arrives in.
    pub fn challenge_header(self) -> &'static str {
        // ---
        match self {
            Self::Www => "WWW-Authenticate",
            Self::Proxy => "Proxy-Authenticate",
        }
    }

    /// Header the answer goes in.
    pub fn authorization_header(self) -> &'static str {
        // ---
        match self {
            Self::Www => "Authorization",
            Self::Proxy => "Proxy-Authorization",
        }
    }
}

/// A parsed 401/407 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    // ---
    /// Parses a `Digest realm="..", nonce="..", ...` header value.
    ///
    /// # Errors
    ///
    /// Returns `CallError::MalformedChallenge` if the scheme is not Digest
    /// or realm or nonce is missing.
    pub fn parse(kind: ChallengeKind, header_value: &str) -> CallResult<Self> {
        // ---
        let value = header_value.trim();
        let params = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(CallError::MalformedChallenge(format!(
                    "not a Digest challenge: {value}"
                )))
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = None;
        let mut opaque = None;
        for (key, val) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "algorithm" => algorithm = Some(val),
                "opaque" => opaque = Some(val),
                _ => {}
            }
        }

        let realm = realm.ok_or_else(|| CallError::MalformedChallenge("missing realm".into()))?;
        let nonce = nonce
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CallError::MalformedChallenge("missing nonce".into()))?;

        if let Some(alg) = &algorithm {
            if !alg.eq_ignore_ascii_case("md5") {
                return Err(CallError::MalformedChallenge(format!(
                    "unsupported algorithm {alg}"
                )));
            }
        }

        Ok(Self {
            kind,
            realm,
            nonce,
            algorithm,
            opaque,
        })
    }
}

/// A computed credentials header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaderValue {
    /// `Authorization` or `Proxy-Authorization`
    pub name: &'static str,
    pub value: String,
}

impl fmt::Display for AuthHeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Computes the credentials answering `challenge`.
///
/// # Arguments
///
/// * `method` - Request method being authenticated, e.g. `REGISTER`
/// * `uri` - Request-URI of that request
/// * `challenge` - Parsed 401/407 challenge
/// * `username` / `password` - Account credentials
pub fn build_authorization(
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
    username: &str,
    password: &str,
) -> AuthHeaderValue {
    // ---
    let response = digest_response(
        username,
        &challenge.realm,
        password,
        method,
        uri,
        &challenge.nonce,
    );

    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        username, challenge.realm, challenge.nonce, uri, response
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{opaque}\""));
    }

    AuthHeaderValue {
        name: challenge.kind.authorization_header(),
        value,
    }
}

/// The 32-hex-digit digest response.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    // ---
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Splits `key=value, key="quoted, value"` pairs, honouring quotes.
fn parse_params(input: &str) -> Vec<(String, String)> {
    // ---
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            value = quoted[..end].to_string();
            rest = quoted.get(end + 1..).unwrap_or("");
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        if !key.is_empty() {
            params.push((key, value));
        }
    }
    params
}
