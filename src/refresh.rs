//! Single-flight token refresh.
//!
//! An expired bearer token (business code `-109`) is exchanged for a new one
//! at `GET /api/v1/getNewToken`, authenticated with the expiring token
//! itself. Many requests may hit the expiry at once; the
//! [`RefreshCoordinator`] makes sure that only one exchange is in flight and
//! that every caller waiting for it observes the same outcome.
//!
//! # Outcome
//!
//! [`RefreshCoordinator::refresh_outcome`] never fails. It resolves to a
//! [`RefreshOutcome`]:
//! * `Refreshed(token)` when a new token was granted and stored
//! * `Failed` when there was no token to refresh, or the exchange failed
//! * `Terminated(info)` when the exchange was rejected with an
//!   unrecoverable code and the session was terminated through the
//!   [`SessionGuard`]
//!
//! [`RefreshCoordinator::refresh`] reduces that to the granted token.
//!
//! The exchange runs as its own task. Callers that stop waiting do not
//! cancel it, and the next caller after it ends starts a fresh one.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use url::Url;

use crate::{
    credentials::CredentialStore,
    events::Event,
    http,
    protocol::{auth::TokenGrant, Envelope},
    session::{LogoutInfo, SessionGuard},
};

/// Endpoint path of the token exchange.
pub const REFRESH_PATH: &str = "/api/v1/getNewToken";

/// How a token exchange ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(String),
    Failed,
    Terminated(LogoutInfo),
}

impl RefreshOutcome {
    /// The granted token, if any.
    #[must_use]
    pub fn into_token(self) -> Option<String> {
        match self {
            Self::Refreshed(token) => Some(token),
            Self::Failed | Self::Terminated(_) => None,
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

/// The exchange currently in flight.
struct InFlight {
    id: u64,
    future: RefreshFuture,
}

struct Inner {
    http: Arc<http::Client>,
    endpoint: Url,
    credentials: CredentialStore,
    session: Arc<SessionGuard>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
}

/// Collapses concurrent token refreshes into one exchange.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

/// Clears the in-flight slot when the exchange it belongs to ends.
///
/// Lives inside the exchange task, so it runs on completion as well as when
/// the runtime drops the task unfinished.
struct ResetOnDrop {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        let stale = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some(current) if current.id == self.id => in_flight.take(),
                _ => None,
            }
        };

        // Dropped outside the lock: it may hold the last handle on a future.
        drop(stale);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RefreshCoordinator {
    /// Creates a coordinator exchanging tokens at `endpoint`.
    ///
    /// Requests go through `http` directly: the exchange is neither signed
    /// nor sent with device headers.
    #[must_use]
    pub fn new(http: Arc<http::Client>, endpoint: Url, session: Arc<SessionGuard>) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                endpoint,
                credentials: session.credentials().clone(),
                session,
                in_flight: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Exchanges the current token for a new one, or joins the exchange
    /// already in flight.
    ///
    /// Returns `None` immediately, without network traffic, when there is no
    /// token.
    pub async fn refresh(&self) -> Option<String> {
        self.refresh_outcome().await.into_token()
    }

    /// Like [`refresh`](Self::refresh), but tells a failed exchange apart
    /// from one that terminated the session.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub async fn refresh_outcome(&self) -> RefreshOutcome {
        let future = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some(current) = in_flight.as_ref() {
                debug!("joining token refresh in flight");
                current.future.clone()
            } else {
                let Some(token) = self.inner.credentials.token() else {
                    debug!("no token to refresh");
                    return RefreshOutcome::Failed;
                };

                let id = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                let inner = Arc::clone(&self.inner);
                // The slot is filled before this lock is released, so the
                // task cannot clear it early.
                let task = tokio::spawn(async move {
                    let _reset = ResetOnDrop {
                        inner: Arc::clone(&inner),
                        id,
                    };
                    inner.exchange(&token).await
                });
                let future = async move {
                    task.await.unwrap_or_else(|e| {
                        error!("token refresh did not finish: {e}");
                        RefreshOutcome::Failed
                    })
                }
                .boxed()
                .shared();

                *in_flight = Some(InFlight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        future.await
    }

    /// Whether an exchange is currently in flight.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
    }
}

impl Inner {
    async fn exchange(&self, token: &str) -> RefreshOutcome {
        debug!("refreshing token");

        let mut request = self.http.get(self.endpoint.clone());
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(e) => {
                error!("token cannot be sent: {e}");
                return RefreshOutcome::Failed;
            }
        }

        let body = match self.http.execute(request).await {
            Ok(response) => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    error!("token refresh failed: {e}");
                    return RefreshOutcome::Failed;
                }
            },
            Err(e) => {
                error!("token refresh failed: {e}");
                return RefreshOutcome::Failed;
            }
        };

        let envelope = match Envelope::parse(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("token refresh failed: {e}");
                return RefreshOutcome::Failed;
            }
        };

        if let Some(info) = LogoutInfo::for_code(envelope.code, envelope.msg.as_deref()) {
            let _ = self.session.terminate(info.clone());
            return RefreshOutcome::Terminated(info);
        }

        if !envelope.is_success() {
            warn!(
                "token refresh rejected with code {}: {}",
                envelope.code,
                envelope.msg.as_deref().unwrap_or_default()
            );
            return RefreshOutcome::Failed;
        }

        let grant = TokenGrant::from_envelope(&envelope);
        let Some(new_token) = grant.token else {
            error!("token refresh succeeded without granting a token");
            return RefreshOutcome::Failed;
        };

        self.credentials.set_token(Some(&new_token));
        if let Some(sign) = grant.sign.as_deref() {
            self.credentials.set_signing_secret(Some(sign));
        }

        info!("token refreshed");
        self.session.emit(Event::TokenRefreshed);

        RefreshOutcome::Refreshed(new_token)
    }
}
