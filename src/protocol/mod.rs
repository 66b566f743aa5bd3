//! Wire types of the Joyful API.
//!
//! # Submodules
//!
//! * [`envelope`] - the `{code, msg, data}` business envelope and its codes
//! * [`auth`] - authentication payloads and token grants

pub mod auth;
pub mod envelope;

pub use envelope::{Envelope, Status};

use crate::error::Result;
use serde::Deserialize;

/// Parses a JSON payload, logging failures.
///
/// Parsed payloads are not dumped: auth responses carry credentials.
///
/// # Logging
///
/// * Success: Logs the payload size at TRACE level
/// * Parse Error: Logs the error at ERROR level
/// * Invalid JSON: Also logs the raw text at TRACE level
///
/// # Errors
///
/// Returns error if `body` is not valid JSON or does not fit `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: parsed {} bytes", body.len());
            Ok(result)
        }
        Err(e) => {
            error!("{origin}: failed parsing response ({e})");
            if serde_json::from_str::<serde_json::Value>(body).is_err() {
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
