//! The business envelope shared by every endpoint.
//!
//! Every response body, whatever its HTTP status, has the shape:
//!
//! ```json
//! {
//!     "code": 200,
//!     "msg": "success",
//!     "data": { ... }
//! }
//! ```
//!
//! `code` is sometimes sent as a numeric string and is accepted either way.
//! Some endpoints put extra fields next to `data` (the auth endpoints return
//! `token` and `sign` at the root); those are kept in [`Envelope::extra`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

use crate::error::{Error, Result};

/// Business code: success.
pub const SUCCESS: i64 = 200;

/// Business code: token expired, refreshable.
pub const TOKEN_EXPIRED: i64 = -109;

/// Business code: invalid credentials, not recoverable.
pub const INVALID_CREDENTIALS: i64 = -110;

/// Business code: session superseded by another device, not recoverable.
pub const SESSION_SUPERSEDED: i64 = -108;

/// Classification of a business code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    TokenExpired,
    InvalidCredentials,
    SessionSuperseded,
    /// Any other code: a business error to show the user.
    Failure(i64),
}

impl Status {
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            SUCCESS => Self::Success,
            TOKEN_EXPIRED => Self::TokenExpired,
            INVALID_CREDENTIALS => Self::InvalidCredentials,
            SESSION_SUPERSEDED => Self::SessionSuperseded,
            other => Self::Failure(other),
        }
    }

    /// Whether the session can only be repaired by signing in again.
    #[must_use]
    pub fn is_unrecoverable(self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::SessionSuperseded)
    }
}

/// Response envelope.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Envelope<T = Value> {
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub code: i64,

    #[serde(default)]
    pub msg: Option<String>,

    #[serde(default = "Option::default")]
    pub data: Option<T>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_code(self.code)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS
    }

    /// Extra root-level string field, such as `token`.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

impl Envelope<Value> {
    /// Strictly parses `body` as an envelope.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedResponse` error if `body` is not a JSON object
    /// with an integer `code`.
    pub fn parse(body: &str) -> Result<Self> {
        super::json(body, "envelope").map_err(|e| Error::malformed(e.error.to_string()))
    }

    /// Decodes `data` into `T`. Absent data decodes from `null`.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedResponse` error if `data` does not fit `T`.
    pub fn decode<T>(self) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(self.data.unwrap_or(Value::Null))
            .map_err(|e| Error::malformed(format!("unexpected data: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_string_codes() {
        let envelope = Envelope::parse(r#"{"code": 200, "msg": null, "data": {"a": 1}}"#).unwrap();
        assert_eq!(envelope.status(), Status::Success);
        assert_eq!(envelope.data, Some(serde_json::json!({"a": 1})));

        let envelope = Envelope::parse(r#"{"code": "-109", "msg": "expired"}"#).unwrap();
        assert_eq!(envelope.status(), Status::TokenExpired);
        assert_eq!(envelope.msg.as_deref(), Some("expired"));
        assert_eq!(envelope.data, None);
    }

    #[test]
    fn keeps_root_level_extras() {
        let envelope =
            Envelope::parse(r#"{"code": 200, "data": null, "token": "T1", "sign": "S1"}"#).unwrap();
        assert_eq!(envelope.extra_str("token"), Some("T1"));
        assert_eq!(envelope.extra_str("sign"), Some("S1"));
    }

    #[test]
    fn rejects_bodies_that_are_not_envelopes() {
        for body in ["", "<html>", r#"{"msg": "no code"}"#, r#"{"code": "abc"}"#] {
            let error = Envelope::parse(body).unwrap_err();
            assert_eq!(error.kind, crate::error::ErrorKind::DataLoss, "{body}");
        }
    }

    #[test]
    fn classifies_codes() {
        assert!(Status::from_code(-110).is_unrecoverable());
        assert!(Status::from_code(-108).is_unrecoverable());
        assert!(!Status::from_code(-109).is_unrecoverable());
        assert_eq!(Status::from_code(500), Status::Failure(500));
    }

    #[test]
    fn decodes_absent_data_as_null() {
        let envelope = Envelope::parse(r#"{"code": 200}"#).unwrap();
        let data: Option<String> = envelope.decode().unwrap();
        assert_eq!(data, None);
    }
}
