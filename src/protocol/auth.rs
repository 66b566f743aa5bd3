//! Authentication request and grant types.
//!
//! The login and token refresh endpoints grant a bearer token and a signing
//! secret. Depending on the endpoint and server version, they come inside
//! `data` or at the root of the envelope:
//!
//! ```json
//! {
//!     "code": 200,
//!     "msg": "success",
//!     "data": { "token": "...", "sign": "..." }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use veil::Redact;

use super::envelope::Envelope;

/// Login with account and password.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Redact)]
pub struct LoginPayload {
    pub account: String,
    #[redact]
    pub password: String,
    pub channel: u32,
    #[serde(rename = "type")]
    pub kind: u32,
}

/// Request for a verification code sent to `account`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct VerifyCodePayload {
    pub account: String,
    pub channel: u32,
    #[serde(rename = "type")]
    pub kind: u32,
}

/// New account registration.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Redact)]
pub struct RegisterPayload {
    pub username: String,
    pub account: String,
    pub code: String,
    pub channel: u32,
    #[redact]
    pub password: String,
}

/// Password reset with a verification code.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Redact)]
pub struct ForgetPayload {
    pub account: String,
    pub channel: u32,
    pub code: String,
    #[redact]
    pub password: String,
}

#[derive(Default, Deserialize)]
struct GrantData {
    token: Option<String>,
    sign: Option<String>,
}

/// Credentials granted by the login or refresh endpoints.
#[derive(Clone, Default, PartialEq, Eq, Hash, Redact)]
pub struct TokenGrant {
    #[redact]
    pub token: Option<String>,
    #[redact]
    pub sign: Option<String>,
}

impl TokenGrant {
    /// Reads the grant from an envelope.
    ///
    /// The token is taken from `data` first, then the root; the signing
    /// secret from the root first, then `data`.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope<Value>) -> Self {
        let data = envelope
            .data
            .as_ref()
            .and_then(|data| GrantData::deserialize(data).ok())
            .unwrap_or_default();

        let token = data
            .token
            .or_else(|| envelope.extra_str("token").map(str::to_owned))
            .filter(|token| !token.is_empty());
        let sign = envelope
            .extra_str("sign")
            .map(str::to_owned)
            .or(data.sign)
            .filter(|sign| !sign.is_empty());

        Self { token, sign }
    }
}
