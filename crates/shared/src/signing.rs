//! URL and request signatures.
//!
//! Signatures are HS256 tokens keyed with a shared secret. A URL signature binds
//! the path and query of a URL to an expiry; a request signature additionally
//! binds the HTTP method and a digest of the node identity headers, so one node
//! can prove a call to another.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Query parameter carrying a URL signature.
pub const SIGN_QUERY_PARAM: &str = "sign";

/// Signatures issued without an expiry stay valid for this long.
const UNBOUNDED_TTL_DAYS: i64 = 365 * 100;

/// Errors that can occur while signing or verifying.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// Token encoding failed.
    #[error("failed to encode signature: {0}")]
    Encoding(String),

    /// Signature has expired.
    #[error("signature has expired")]
    Expired,

    /// Signature is malformed or was made with another key.
    #[error("invalid signature")]
    Invalid,

    /// Signature is valid but was issued for a different target.
    #[error("signature does not match the request")]
    Mismatch,

    /// No signature was supplied.
    #[error("signature is missing")]
    Missing,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedClaims {
    /// Signed target: `path?query` for URLs, `METHOD path?query` for requests.
    sub: String,
    /// Hex SHA-256 of the canonical identity headers (requests only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    dig: String,
    exp: i64,
}

/// Signs and verifies URLs and node-to-node requests.
#[derive(Clone)]
pub struct Signer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("encoding_key", &"[hidden]")
            .field("decoding_key", &"[hidden]")
            .finish()
    }
}

impl Signer {
    /// Creates a signer from a shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signs `target` (a URL path with optional query) until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Encoding` if token generation fails.
    pub fn sign(
        &self,
        target: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, SignatureError> {
        self.encode(target.to_string(), String::new(), expires_at)
    }

    /// Verifies a URL signature against `target`.
    ///
    /// # Errors
    ///
    /// Returns `Expired`, `Invalid`, or `Mismatch` when the token does not cover `target`.
    pub fn verify(&self, target: &str, token: &str) -> Result<(), SignatureError> {
        let claims = self.decode(token)?;
        if claims.sub != target || !claims.dig.is_empty() {
            return Err(SignatureError::Mismatch);
        }
        Ok(())
    }

    /// Appends a signature for `target` as the last query parameter.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Encoding` if token generation fails.
    pub fn sign_uri(
        &self,
        target: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, SignatureError> {
        let token = self.sign(target, expires_at)?;
        let separator = if target.contains('?') { '&' } else { '?' };
        Ok(format!("{target}{separator}{SIGN_QUERY_PARAM}={token}"))
    }

    /// Signs a node-to-node request.
    ///
    /// `headers` are the identity headers that travel with the request; their
    /// order does not matter.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Encoding` if token generation fails.
    pub fn sign_request(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, SignatureError> {
        self.encode(
            format!("{} {target}", method.to_ascii_uppercase()),
            header_digest(headers),
            expires_at,
        )
    }

    /// Verifies a node-to-node request signature.
    ///
    /// # Errors
    ///
    /// Returns `Expired`, `Invalid`, or `Mismatch`.
    pub fn verify_request(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, &str)],
        token: &str,
    ) -> Result<(), SignatureError> {
        let claims = self.decode(token)?;
        if claims.sub != format!("{} {target}", method.to_ascii_uppercase())
            || claims.dig != header_digest(headers)
        {
            return Err(SignatureError::Mismatch);
        }
        Ok(())
    }

    fn encode(
        &self,
        sub: String,
        dig: String,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, SignatureError> {
        let exp = expires_at
            .unwrap_or_else(|| Utc::now() + Duration::days(UNBOUNDED_TTL_DAYS))
            .timestamp();
        let claims = SignedClaims { sub, dig, exp };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| SignatureError::Encoding(e.to_string()))
    }

    fn decode(&self, token: &str) -> Result<SignedClaims, SignatureError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.validate_aud = false;

        decode::<SignedClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SignatureError::Expired,
                _ => SignatureError::Invalid,
            })
    }
}

/// Removes the signature parameter from a raw query string.
///
/// Returns the remaining query (possibly empty) and the signature, if present.
#[must_use]
pub fn split_signature(query: &str) -> (String, Option<String>) {
    let mut sign = None;
    let rest: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            if let Some(value) = pair.strip_prefix("sign=") {
                sign = Some(value.to_string());
                false
            } else {
                !pair.is_empty()
            }
        })
        .collect();
    (rest.join("&"), sign)
}

/// Canonical signing target for a request path and raw query without the signature.
#[must_use]
pub fn signing_target(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

fn header_digest(headers: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
        .collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (name, value) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
