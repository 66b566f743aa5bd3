//! Session invalidation.
//!
//! Two business codes mean the session cannot be repaired by refreshing the
//! token:
//!
//! * `-110` - the credentials are invalid or expired
//! * `-108` - another device signed in with the same account
//!
//! On either, the [`SessionGuard`] persists a [`LogoutInfo`] for the shell to
//! show after it resets, clears the credentials, emits
//! [`Event::SessionTerminated`] and hands back a sentinel error so the
//! request that triggered it stops instead of retrying.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    credentials::CredentialStore,
    error::Error,
    events::Event,
    protocol::envelope::{Status, INVALID_CREDENTIALS, SESSION_SUPERSEDED},
    storage::{Storage, LOGOUT_REASON_KEY},
};

/// Why the session was terminated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    InvalidCredentials,
    AccountConflict,
}

/// Record of a forced logout, kept until the next successful login.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogoutInfo {
    pub code: i64,
    pub reason: LogoutReason,
    pub message: String,
}

impl LogoutInfo {
    /// Builds the record for an unrecoverable business code.
    ///
    /// Returns `None` for any other code.
    #[must_use]
    pub fn for_code(code: i64, message: Option<&str>) -> Option<Self> {
        let (reason, default_message) = match code {
            SESSION_SUPERSEDED => (
                LogoutReason::AccountConflict,
                "this account signed in on another device, please sign in again",
            ),
            INVALID_CREDENTIALS => (
                LogoutReason::InvalidCredentials,
                "sign-in information is invalid, please sign in again",
            ),
            _ => return None,
        };

        Some(Self {
            code,
            reason,
            message: message.unwrap_or(default_message).to_owned(),
        })
    }
}

/// Detects unrecoverable authentication failures and logs the session out.
pub struct SessionGuard {
    credentials: CredentialStore,
    event_tx: Option<UnboundedSender<Event>>,
}

impl SessionGuard {
    #[must_use]
    pub fn new(credentials: CredentialStore, event_tx: Option<UnboundedSender<Event>>) -> Self {
        Self {
            credentials,
            event_tx,
        }
    }

    /// Checks a business code, terminating the session if it is
    /// unrecoverable.
    ///
    /// Returns the sentinel error to propagate, or `None` when the code
    /// does not concern the session.
    pub fn check(&self, code: i64, message: Option<&str>) -> Option<Error> {
        if !Status::from_code(code).is_unrecoverable() {
            return None;
        }

        LogoutInfo::for_code(code, message).map(|info| self.terminate(info))
    }

    /// Terminates the session for `info`.
    pub fn terminate(&self, info: LogoutInfo) -> Error {
        warn!("session terminated ({}): {}", info.code, info.message);

        self.set_logout_info(Some(&info));
        self.credentials.clear();
        self.emit(Event::SessionTerminated(info.clone()));

        Error::session_terminated(info)
    }

    /// The reason of the last forced logout, if not yet cleared.
    #[must_use]
    pub fn logout_info(&self) -> Option<LogoutInfo> {
        let raw = self.storage()?.get(LOGOUT_REASON_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("discarding unreadable logout reason: {e}");
                None
            }
        }
    }

    pub fn clear_logout_info(&self) {
        self.set_logout_info(None);
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(tx) = &self.event_tx {
            // A shell that stopped listening is not an error.
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
            }
        }
    }

    fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.credentials.storage()
    }

    fn set_logout_info(&self, info: Option<&LogoutInfo>) {
        let Some(storage) = self.storage() else {
            return;
        };

        match info.map(serde_json::to_string) {
            Some(Ok(json)) => storage.set(LOGOUT_REASON_KEY, &json),
            Some(Err(e)) => error!("failed serializing logout reason: {e}"),
            None => storage.remove(LOGOUT_REASON_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tokio::sync::mpsc;

    fn guard() -> (SessionGuard, mpsc::UnboundedReceiver<Event>) {
        let credentials = CredentialStore::new(Some(Arc::new(MemoryStorage::new())));
        credentials.set_token(Some("T1"));
        credentials.set_signing_secret(Some("S1"));

        let (tx, rx) = mpsc::unbounded_channel();
        (SessionGuard::new(credentials, Some(tx)), rx)
    }

    #[test]
    fn invalid_credentials_clear_the_session() {
        let (guard, mut rx) = guard();

        let error = guard.check(-110, Some("bad creds")).unwrap();
        assert!(error.is_session_terminated());

        let credential = guard.credentials().credential();
        assert_eq!(credential.token, None);
        assert_eq!(credential.signing_secret, None);

        let expected = LogoutInfo {
            code: -110,
            reason: LogoutReason::InvalidCredentials,
            message: "bad creds".to_owned(),
        };
        assert_eq!(guard.logout_info(), Some(expected.clone()));
        assert_eq!(rx.try_recv().unwrap(), Event::SessionTerminated(expected));
    }

    #[test]
    fn superseded_session_uses_default_message() {
        let (guard, _rx) = guard();

        guard.check(-108, None).unwrap();
        let info = guard.logout_info().unwrap();
        assert_eq!(info.reason, LogoutReason::AccountConflict);
        assert!(info.message.contains("another device"));
    }

    #[test]
    fn other_codes_are_ignored() {
        let (guard, mut rx) = guard();

        for code in [200, -109, 500, -1] {
            assert!(guard.check(code, Some("nope")).is_none());
        }
        assert_eq!(guard.credentials().token().as_deref(), Some("T1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn terminating_twice_leaves_the_same_state() {
        let (guard, _rx) = guard();

        guard.check(-110, Some("bad creds"));
        let once = (guard.credentials().credential(), guard.logout_info());
        guard.check(-110, Some("bad creds"));
        let twice = (guard.credentials().credential(), guard.logout_info());
        assert_eq!(once, twice);
    }

    #[test]
    fn logout_reason_serializes_in_snake_case() {
        let info = LogoutInfo::for_code(-108, Some("elsewhere")).unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["reason"], "account_conflict");
        assert_eq!(json["code"], -108);

        let (guard, _rx) = guard();
        guard.clear_logout_info();
        assert_eq!(guard.logout_info(), None);
    }
}
