//! Request signatures.
//!
//! Requests are signed with HMAC-SHA256 over a payload that proves knowledge
//! of the signing secret without sending it:
//!
//! ```text
//! payload   = timestamp + nonce + canonical
//! signature = hex(HMAC-SHA256(secret, payload))
//! ```
//!
//! The canonical part depends on the method:
//! * GET and HEAD: all query parameters, explicit ones merged with those
//!   already in the URL, without `signature`, sorted by key and joined as
//!   `key=value&key=value`
//! * everything else: the body in its wire form
//!
//! The nonce, timestamp and signature travel in the `X-Nonce`,
//! `X-Timestamp` and `X-Signature` headers.
//!
//! # Exclusions
//!
//! Endpoints that run before a secret is issued, or that issue it, are
//! never signed. See [`Exclusions`].

use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use sha2::Sha256;
use url::Url;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    request::{Body, OutgoingRequest, Param},
    util,
};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_HEADER: HeaderName = HeaderName::from_static("x-nonce");
pub const TIMESTAMP_HEADER: HeaderName = HeaderName::from_static("x-timestamp");
pub const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("x-signature");

/// Query key that never takes part in the canonical string.
const SIGNATURE_PARAM: &str = "signature";

/// Canonical string of the query parameters of `url` and `params`.
///
/// Explicit parameters come first, then those embedded in `url`. The sort is
/// stable, so repeated keys keep that relative order.
#[must_use]
pub fn canonical_query(url: &Url, params: &[(String, Param)]) -> String {
    let explicit = params
        .iter()
        .flat_map(|(key, param)| param.values().map(move |value| (key.clone(), value.to_owned())));
    let embedded = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()));

    let mut pairs: Vec<(String, String)> = explicit
        .chain(embedded)
        .filter(|(key, _)| key != SIGNATURE_PARAM)
        .collect();
    pairs.sort_by(|(a, _), (b, _)| a.cmp(b));

    pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical string of a request body: its exact wire form.
#[must_use]
pub fn canonical_body(body: &Body) -> String {
    body.encode()
}

/// Canonical string of `request`, as it enters the signing payload.
#[must_use]
pub fn canonical_params(request: &OutgoingRequest) -> String {
    if request.method == Method::GET || request.method == Method::HEAD {
        canonical_query(&request.url, &request.query)
    } else {
        canonical_body(&request.body)
    }
}

/// Signature headers for one transmission.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignedEnvelope {
    /// Unix time in whole seconds.
    pub timestamp: u64,
    pub nonce: String,
    /// Lowercase hex HMAC-SHA256.
    pub signature: String,
}

impl SignedEnvelope {
    /// Writes the nonce, timestamp and signature headers.
    ///
    /// # Errors
    ///
    /// Returns error if a header value is invalid or the map is full.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        headers.try_insert(NONCE_HEADER, HeaderValue::from_str(&self.nonce)?)?;
        headers.try_insert(TIMESTAMP_HEADER, HeaderValue::from(self.timestamp))?;
        headers.try_insert(SIGNATURE_HEADER, HeaderValue::from_str(&self.signature)?)?;
        Ok(())
    }
}

/// HMAC-SHA256 request signer keyed with the signing secret.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    /// Creates a signer for `secret`.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the secret is empty.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::failed_precondition(
                "cannot sign requests without a signing secret",
            ));
        }

        let mac = HmacSha256::new_from_slice(secret.as_bytes())?;
        Ok(Self { mac })
    }

    /// Computes the signature of `canonical` for a given timestamp and nonce.
    #[must_use]
    pub fn signature(&self, timestamp: u64, nonce: &str, canonical: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(nonce.as_bytes());
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signs `canonical` with a fresh nonce and the current time.
    #[must_use]
    pub fn sign(&self, canonical: &str) -> SignedEnvelope {
        let timestamp = util::now_from_epoch();
        let nonce = Uuid::new_v4().simple().to_string();
        let signature = self.signature(timestamp, &nonce, canonical);

        SignedEnvelope {
            timestamp,
            nonce,
            signature,
        }
    }
}

/// Signing-exempt endpoint paths.
///
/// A request path is exempt when it contains any of the patterns.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Exclusions(Vec<String>);

impl Exclusions {
    /// Paths exempt by default: login, registration, verification codes,
    /// password reset and the token refresh itself.
    pub const DEFAULT: [&'static str; 5] = [
        "/api/v1/login",
        "/api/v1/register",
        "/api/v1/getVerifyCode",
        "/api/v1/forget",
        "/api/v1/getNewToken",
    ];

    #[must_use]
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(patterns.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.0.iter().any(|pattern| path.contains(pattern.as_str()))
    }
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_query_merges_sorts_and_drops_signature() {
        let url = Url::parse("http://localhost/api/v1/music?signature=xyz&c=3").unwrap();
        let params = vec![
            ("b".to_owned(), Param::from("2")),
            ("a".to_owned(), Param::from("1")),
        ];
        assert_eq!(canonical_query(&url, &params), "a=1&b=2&c=3");
    }

    #[test]
    fn canonical_query_drops_explicit_signature_and_expands_lists() {
        let url = Url::parse("http://localhost/api/v1/music").unwrap();
        let params = vec![
            ("signature".to_owned(), Param::from("forged")),
            ("ids".to_owned(), Param::from(vec!["2", "1"])),
        ];
        assert_eq!(canonical_query(&url, &params), "ids=2&ids=1");
    }

    #[test]
    fn canonical_query_sorts_keys_bytewise() {
        let url = Url::parse("http://localhost/api/v1/music?b=2&B=3&a=1&_t=0").unwrap();
        assert_eq!(canonical_query(&url, &[]), "B=3&_t=0&a=1&b=2");
    }

    #[test]
    fn canonical_params_follow_method() {
        let url = Url::parse("http://localhost/api/v1/user/updateUserInfo?x=1").unwrap();
        let post = OutgoingRequest::post(url.clone()).text("motto=hi");
        assert_eq!(canonical_params(&post), "motto=hi");

        let get = OutgoingRequest::get(url).param("y", "2");
        assert_eq!(canonical_params(&get), "x=1&y=2");

        let mut empty = OutgoingRequest::post(Url::parse("http://localhost/a").unwrap());
        empty.body = Body::Empty;
        assert_eq!(canonical_params(&empty), "");
    }

    #[test]
    fn signature_matches_reference_hmac() {
        // HMAC-SHA256("key", "1700000000abcdefa=1")
        let signer = Signer::new("key").unwrap();
        let signature = signer.signature(1_700_000_000, "abcdef", "a=1");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let mut mac = HmacSha256::new_from_slice(b"key").unwrap();
        mac.update(b"1700000000abcdefa=1");
        assert_eq!(signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn signature_is_deterministic_and_sensitive_to_every_input() {
        let signer = Signer::new("secret").unwrap();
        let base = signer.signature(100, "n1", "a=1");
        assert_eq!(base, signer.signature(100, "n1", "a=1"));

        assert_ne!(base, signer.signature(101, "n1", "a=1"));
        assert_ne!(base, signer.signature(100, "n2", "a=1"));
        assert_ne!(base, signer.signature(100, "n1", "a=2"));
        assert_ne!(
            base,
            Signer::new("other").unwrap().signature(100, "n1", "a=1")
        );
    }

    #[test]
    fn signing_without_secret_fails() {
        let error = Signer::new("").err().unwrap();
        assert_eq!(error.kind, crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn fresh_envelopes_use_unique_nonces() {
        let signer = Signer::new("secret").unwrap();
        let first = signer.sign("a=1");
        let second = signer.sign("a=1");
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(first.nonce.len(), 32);

        let mut headers = HeaderMap::new();
        first.apply(&mut headers).unwrap();
        assert_eq!(headers.get("X-Nonce").unwrap(), first.nonce.as_str());
        assert_eq!(
            headers.get("X-Timestamp").unwrap(),
            first.timestamp.to_string().as_str()
        );
        assert_eq!(headers.get("X-Signature").unwrap(), first.signature.as_str());
    }

    #[test]
    fn exclusions_match_by_containment() {
        let exclusions = Exclusions::default();
        assert!(exclusions.is_excluded("/prod/api/v1/login"));
        assert!(exclusions.is_excluded("/api/v1/getNewToken"));
        assert!(!exclusions.is_excluded("/api/v1/music/list"));
    }
}
