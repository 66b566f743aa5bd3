//! Authenticated API client.
//!
//! The [`Client`] runs every request through a fixed pipeline of named
//! stages:
//!
//! 1. [`attach_auth`](Client::attach_auth): `Authorization: Bearer` from the
//!    credential store
//! 2. [`attach_device`](Client::attach_device): device identity headers
//! 3. [`attach_signature`](Client::attach_signature): HMAC signature headers
//!    when a signing secret is stored and the path is not exempt
//! 4. [`send`](Client::send): one transmission over the rate-limited
//!    transport
//! 5. [`handle_response`](Client::handle_response): envelope inspection
//!
//! Stages 1-3 together make up [`prepare`](Client::prepare). Each stage is
//! public so it can be driven on its own.
//!
//! # Response handling
//!
//! | Outcome                 | Handling                                        |
//! |-------------------------|-------------------------------------------------|
//! | code `200`              | `data` is returned                              |
//! | code `-109`             | token refreshed, request reissued once          |
//! | code `-110` or `-108`   | session terminated, sentinel error              |
//! | refresh hit `-110/-108` | session terminated, sentinel error              |
//! | other code              | user notified, business error                   |
//! | no response or non-2xx  | retried with backoff up to the configured count |
//! | not an envelope         | malformed response error                        |
//!
//! The refresh reissue and the transport retries have separate budgets: a
//! reissue does not count as a transport attempt.
//!
//! # Example
//!
//! ```rust,no_run
//! use joyful::{client::Client, config::Config, storage::FileStorage};
//! use std::sync::Arc;
//!
//! # async fn example() -> joyful::error::Result<()> {
//! let config = Config::new("https://api.example.com")?;
//! let client = Client::builder(config)
//!     .storage(Arc::new(FileStorage::open("state.json")?))
//!     .build()?;
//!
//! let profile: serde_json::Value = client.get("/api/v1/user/info").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use exponential_backoff::Backoff;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    config::Config,
    credentials::CredentialStore,
    device::{DeviceContextProvider, SystemDevice},
    error::{BusinessError, Error, HttpStatus, Result},
    events::Event,
    http,
    notify::{LogNotifier, NotificationKind, Notifier},
    protocol::{Envelope, Status},
    refresh::{RefreshCoordinator, RefreshOutcome, REFRESH_PATH},
    request::OutgoingRequest,
    session::SessionGuard,
    signer::{self, Signer},
    storage::Storage,
};

/// Message shown for business errors that come without one.
pub const DEFAULT_FALLBACK_MESSAGE: &str = "request failed";

/// A response as received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

/// What to do after a response was handled.
#[derive(Debug)]
pub enum Step {
    /// The request succeeded.
    Done(Envelope),

    /// Send the request again: the token was refreshed.
    Reissue,

    /// Transport failure: send again if the retry budget allows.
    Retry(Error),

    /// The request failed for good.
    Fail(Error),
}

/// Authenticated client for the Joyful API.
#[derive(Clone)]
pub struct Client {
    config: Config,
    http: Arc<http::Client>,
    credentials: CredentialStore,
    session: Arc<SessionGuard>,
    refresher: RefreshCoordinator,
    device: Arc<dyn DeviceContextProvider>,
    notifier: Arc<dyn Notifier>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: Config,
    storage: Option<Arc<dyn Storage>>,
    device: Option<Arc<dyn DeviceContextProvider>>,
    notifier: Option<Arc<dyn Notifier>>,
    events: Option<UnboundedSender<Event>>,
}

impl ClientBuilder {
    /// Sets the durable storage for credentials and session state.
    ///
    /// Without storage the client is permanently logged out.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the device header provider.
    ///
    /// Defaults to [`SystemDevice`].
    #[must_use]
    pub fn device(mut self, device: Arc<dyn DeviceContextProvider>) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the sink for user-visible messages.
    ///
    /// Defaults to [`LogNotifier`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the channel session events are sent on.
    #[must_use]
    pub fn events(mut self, events: UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be created or the refresh
    /// endpoint cannot be resolved.
    pub fn build(self) -> Result<Client> {
        let http = Arc::new(http::Client::new(&self.config)?);
        let credentials = CredentialStore::new(self.storage.clone());
        let session = Arc::new(SessionGuard::new(credentials.clone(), self.events));

        let endpoint = self.config.endpoint(REFRESH_PATH)?;
        let refresher = RefreshCoordinator::new(Arc::clone(&http), endpoint, Arc::clone(&session));

        let device = self.device.unwrap_or_else(|| {
            Arc::new(SystemDevice::new(
                self.config.app_version.clone(),
                self.storage,
            ))
        });
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        Ok(Client {
            config: self.config,
            http,
            credentials,
            session,
            refresher,
            device,
            notifier,
        })
    }
}

impl Client {
    #[must_use]
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            storage: None,
            device: None,
            notifier: None,
            events: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    #[must_use]
    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    #[must_use]
    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    /// Starts a request to an endpoint path, or an absolute URL.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid.
    pub fn request(&self, method: Method, path: &str) -> Result<OutgoingRequest> {
        Ok(OutgoingRequest::new(method, self.config.endpoint(path)?))
    }

    /// GETs `path` and decodes `data`.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails. See [`Client::execute`].
    pub async fn get<T>(&self, path: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let request = self.request(Method::GET, path)?;
        self.execute(request).await
    }

    /// POSTs `body` as JSON to `path` and decodes `data`.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails. See [`Client::execute`].
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, path)?.json(body)?;
        self.execute(request).await
    }

    /// POSTs a form to `path` and decodes `data`.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails. See [`Client::execute`].
    pub async fn post_form<K, V, T>(
        &self,
        path: &str,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<T>
    where
        K: Into<String>,
        V: Into<String>,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, path)?.form(pairs);
        self.execute(request).await
    }

    /// Executes `request` and decodes `data` as `T`.
    ///
    /// Absent `data` decodes from `null`, so `()` and `Option<_>` accept it.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails, or `data` does not fit `T`.
    pub async fn execute<T>(&self, request: OutgoingRequest) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.execute_envelope(request).await?.decode()
    }

    /// Executes `request` and returns the successful envelope.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * the server answered with a non-success business code
    /// * the session was terminated (see [`Error::is_session_terminated`])
    /// * the transport failed on every attempt
    /// * the response is not an envelope
    pub async fn execute_envelope(&self, mut request: OutgoingRequest) -> Result<Envelope> {
        let backoff = Backoff::new(
            self.config.retry_count.saturating_add(1),
            self.config.retry_min_delay,
            self.config.retry_max_delay,
        );

        let mut last_error = None;
        for delay in &backoff {
            loop {
                match self.attempt(&mut request).await {
                    Step::Done(envelope) => return Ok(envelope),
                    Step::Fail(e) => return Err(e),
                    Step::Reissue => continue,
                    Step::Retry(e) => match delay {
                        Some(delay) => {
                            warn!(
                                "{} {} failed, retrying in {}ms: {e}",
                                request.method,
                                request.path(),
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                            break;
                        }
                        None => {
                            last_error = Some(e);
                            break;
                        }
                    },
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::internal("request was never sent")))
    }

    /// Runs the pipeline once.
    async fn attempt(&self, request: &mut OutgoingRequest) -> Step {
        // Headers are rebuilt on every transmission for a fresh signature.
        let mut outgoing = request.clone();
        if let Err(e) = self.prepare(&mut outgoing).await {
            return Step::Fail(e);
        }

        match self.send(&outgoing).await {
            Ok(response) => self.handle_response(request, response).await,
            Err(e) => Step::Retry(e),
        }
    }

    /// Attaches authentication, device and signature headers.
    ///
    /// # Errors
    ///
    /// Returns error if a header value is invalid or signing fails.
    pub async fn prepare(&self, request: &mut OutgoingRequest) -> Result<()> {
        self.attach_auth(request)?;
        self.attach_device(request).await;
        self.attach_signature(request)?;
        Ok(())
    }

    /// Attaches `Authorization: Bearer` if a token is available.
    ///
    /// A token granted by a refresh for this request takes precedence over
    /// the stored one.
    ///
    /// # Errors
    ///
    /// Returns error if the token is not a valid header value.
    pub fn attach_auth(&self, request: &mut OutgoingRequest) -> Result<()> {
        let token = request.bearer.clone().or_else(|| self.credentials.token());
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            value.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, value);
        }

        Ok(())
    }

    /// Attaches the device identity headers.
    pub async fn attach_device(&self, request: &mut OutgoingRequest) {
        let headers = self.device.device_headers().await.to_header_map();
        request.headers.extend(headers);
    }

    /// Signs the request if a signing secret is stored and the path is not
    /// exempt.
    ///
    /// Returns whether the request was signed.
    ///
    /// # Errors
    ///
    /// Returns error if the signature headers cannot be attached.
    pub fn attach_signature(&self, request: &mut OutgoingRequest) -> Result<bool> {
        if self.config.signing_exclusions.is_excluded(request.path()) {
            trace!("{} is exempt from signing", request.path());
            return Ok(false);
        }

        let Some(secret) = self.credentials.signing_secret() else {
            trace!("no signing secret, sending {} unsigned", request.path());
            return Ok(false);
        };

        let canonical = signer::canonical_params(request);
        Signer::new(&secret)?
            .sign(&canonical)
            .apply(&mut request.headers)?;

        Ok(true)
    }

    /// Transmits the request once.
    ///
    /// # Errors
    ///
    /// Returns error if no response, or no complete body, was received.
    pub async fn send(&self, request: &OutgoingRequest) -> Result<RawResponse> {
        debug!("{} {}", request.method, request.path());

        let response = self.http.execute(request.to_reqwest()).await?;
        let status = response.status();
        let body = response.text().await?;
        trace!(
            "{} {} -> {status} ({} bytes)",
            request.method,
            request.path(),
            body.len()
        );

        Ok(RawResponse { status, body })
    }

    /// Decides what to do with a response to `request`.
    ///
    /// May refresh the token, in which case `request` is marked as
    /// refreshed and [`Step::Reissue`] is returned at most once per request.
    pub async fn handle_response(
        &self,
        request: &mut OutgoingRequest,
        response: RawResponse,
    ) -> Step {
        if !response.status.is_success() {
            // The error body may still terminate the session. Most are not
            // envelopes at all.
            if let Ok(envelope) = serde_json::from_str::<Envelope>(&response.body) {
                if let Some(e) = self.session.check(envelope.code, envelope.msg.as_deref()) {
                    return Step::Fail(e);
                }
            }

            let mut url = request.url.clone();
            url.set_query(None);
            return Step::Retry(Error::unavailable(HttpStatus {
                status: response.status.as_u16(),
                url: url.to_string(),
            }));
        }

        let envelope = match Envelope::parse(&response.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("{} returned a malformed response: {e}", request.path());
                return Step::Fail(e);
            }
        };

        let code = envelope.code;
        match envelope.status() {
            Status::Success => Step::Done(envelope),

            Status::TokenExpired => {
                if !request.refreshed {
                    request.refreshed = true;
                    match self.refresher.refresh_outcome().await {
                        RefreshOutcome::Refreshed(token) => {
                            debug!("reissuing {} with refreshed token", request.path());
                            request.bearer = Some(token);
                            return Step::Reissue;
                        }
                        RefreshOutcome::Terminated(info) => {
                            return Step::Fail(Error::session_terminated(info));
                        }
                        RefreshOutcome::Failed => {}
                    }
                }

                warn!("token for {} expired and could not be refreshed", request.path());
                Step::Fail(Error::unauthenticated(BusinessError {
                    code,
                    message: message_or(envelope.msg, "token expired"),
                }))
            }

            Status::InvalidCredentials | Status::SessionSuperseded => {
                match self.session.check(code, envelope.msg.as_deref()) {
                    Some(e) => Step::Fail(e),
                    None => Step::Fail(Error::business(code, message_or(envelope.msg, ""))),
                }
            }

            Status::Failure(_) => {
                let fallback = request
                    .fallback_message
                    .as_deref()
                    .unwrap_or(DEFAULT_FALLBACK_MESSAGE);
                let message = message_or(envelope.msg, fallback);

                self.notifier.push(&message, NotificationKind::Error);
                Step::Fail(Error::business(code, message))
            }
        }
    }
}

fn message_or(message: Option<String>, fallback: &str) -> String {
    message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| fallback.to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use reqwest::header::HeaderMap;

    use super::*;
    use crate::{
        device::{DeviceHeaders, StaticDevice},
        signer::{NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
        storage::MemoryStorage,
    };

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, NotificationKind)>>);

    impl Notifier for Recorder {
        fn push(&self, message: &str, kind: NotificationKind) {
            self.0.lock().unwrap().push((message.to_owned(), kind));
        }
    }

    fn device() -> Arc<StaticDevice> {
        Arc::new(StaticDevice(DeviceHeaders {
            device_id: "device-1".to_owned(),
            device_model: "Test Rig".to_owned(),
            app_version: "1.0.0".to_owned(),
            platform: "Linux".to_owned(),
            os_version: "Linux 6".to_owned(),
        }))
    }

    fn client(notifier: Arc<Recorder>) -> Client {
        let config = Config::new("http://localhost/prod").unwrap();
        let client = Client::builder(config)
            .storage(Arc::new(MemoryStorage::new()))
            .device(device())
            .notifier(notifier)
            .build()
            .unwrap();
        client.credentials().set_token(Some("T1"));
        client.credentials().set_signing_secret(Some("S1"));
        client
    }

    fn ok(body: &str) -> RawResponse {
        RawResponse {
            status: StatusCode::OK,
            body: body.to_owned(),
        }
    }

    fn has_signature(headers: &HeaderMap) -> bool {
        [NONCE_HEADER, TIMESTAMP_HEADER, SIGNATURE_HEADER]
            .iter()
            .all(|name| headers.contains_key(name))
    }

    #[tokio::test]
    async fn prepare_attaches_every_header() {
        let client = client(Arc::default());
        let mut request = client
            .request(Method::GET, "/api/v1/music/list")
            .unwrap()
            .param("page", 1_u32);
        client.prepare(&mut request).await.unwrap();

        assert_eq!(request.headers.get(AUTHORIZATION).unwrap(), "Bearer T1");
        assert_eq!(request.headers.get("X-Device-ID").unwrap(), "device-1");
        assert_eq!(request.headers.get("X-Os-Version").unwrap(), "Linux 6");
        assert!(has_signature(&request.headers));

        let timestamp: u64 = request.headers[TIMESTAMP_HEADER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let nonce = request.headers[NONCE_HEADER].to_str().unwrap();
        let expected = Signer::new("S1").unwrap().signature(timestamp, nonce, "page=1");
        assert_eq!(request.headers[SIGNATURE_HEADER], expected.as_str());
    }

    #[tokio::test]
    async fn exempt_paths_are_never_signed() {
        let client = client(Arc::default());
        for path in ["/api/v1/login", "/api/v1/getVerifyCode", "/api/v1/getNewToken"] {
            let mut request = client.request(Method::POST, path).unwrap();
            assert!(!client.attach_signature(&mut request).unwrap());
            assert!(!has_signature(&request.headers));
        }
    }

    #[tokio::test]
    async fn requests_without_secret_go_unsigned() {
        let client = client(Arc::default());
        client.credentials().set_signing_secret(None);

        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();
        client.prepare(&mut request).await.unwrap();
        assert!(!has_signature(&request.headers));
        assert!(request.headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn anonymous_requests_have_no_bearer() {
        let client = client(Arc::default());
        client.credentials().clear();

        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();
        client.attach_auth(&mut request).unwrap();
        assert!(!request.headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn error_pages_are_retried_without_touching_the_session() {
        let recorder = Arc::new(Recorder::default());
        let client = client(Arc::clone(&recorder));
        let mut request = client
            .request(Method::GET, "/api/v1/music/list")
            .unwrap()
            .param("page", 2_u32);

        let response = RawResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: "<html><body>503 Service Unavailable</body></html>".to_owned(),
        };
        let Step::Retry(e) = client.handle_response(&mut request, response).await else {
            panic!("error page was not retried");
        };

        let status = e.downcast::<HttpStatus>().unwrap();
        assert_eq!(status.status, 503);
        assert_eq!(status.url, "http://localhost/prod/api/v1/music/list");
        assert_eq!(client.credentials().token().as_deref(), Some("T1"));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn business_errors_notify_the_user() {
        let recorder = Arc::new(Recorder::default());
        let client = client(Arc::clone(&recorder));

        let mut request = client
            .request(Method::POST, "/api/v1/playlist/add")
            .unwrap()
            .fallback_message("could not add song");
        let step = client
            .handle_response(&mut request, ok(r#"{"code": 300, "msg": null}"#))
            .await;

        let Step::Fail(e) = step else {
            panic!("expected failure");
        };
        assert_eq!(e.business_code(), Some(300));
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            [("could not add song".to_owned(), NotificationKind::Error)]
        );
    }

    #[tokio::test]
    async fn server_messages_take_precedence() {
        let recorder = Arc::new(Recorder::default());
        let client = client(Arc::clone(&recorder));

        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();
        client
            .handle_response(&mut request, ok(r#"{"code": 1, "msg": "no such song"}"#))
            .await;
        assert_eq!(recorder.0.lock().unwrap()[0].0, "no such song");
    }

    #[tokio::test]
    async fn malformed_bodies_are_distinct_errors() {
        let recorder = Arc::new(Recorder::default());
        let client = client(Arc::clone(&recorder));

        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();
        for body in ["<html>", r#"{"msg": "no code"}"#, ""] {
            let Step::Fail(e) = client.handle_response(&mut request, ok(body)).await else {
                panic!("expected failure for {body:?}");
            };
            assert_eq!(e.kind, crate::error::ErrorKind::DataLoss);
        }
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_success_statuses_are_retried() {
        let client = client(Arc::default());
        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();

        let response = RawResponse {
            status: StatusCode::BAD_GATEWAY,
            body: "bad gateway".to_owned(),
        };
        let Step::Retry(e) = client.handle_response(&mut request, response).await else {
            panic!("expected retry");
        };
        assert!(e.is_transport());
        assert_eq!(e.downcast::<HttpStatus>().unwrap().status, 502);
    }

    #[tokio::test]
    async fn unrecoverable_codes_in_error_bodies_are_terminal() {
        let client = client(Arc::default());
        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();

        let response = RawResponse {
            status: StatusCode::UNAUTHORIZED,
            body: r#"{"code": -108}"#.to_owned(),
        };
        let Step::Fail(e) = client.handle_response(&mut request, response).await else {
            panic!("expected failure");
        };
        assert!(e.is_session_terminated());
        assert_eq!(client.credentials().token(), None);
    }

    #[tokio::test]
    async fn expired_token_after_refresh_fails_quietly() {
        let recorder = Arc::new(Recorder::default());
        let client = client(Arc::clone(&recorder));

        let mut request = client.request(Method::GET, "/api/v1/music/list").unwrap();
        request.refreshed = true;
        let Step::Fail(e) = client
            .handle_response(&mut request, ok(r#"{"code": -109}"#))
            .await
        else {
            panic!("expected failure");
        };

        assert_eq!(e.kind, crate::error::ErrorKind::Unauthenticated);
        assert_eq!(e.business_code(), Some(-109));
        assert!(!e.is_session_terminated());
        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(client.credentials().token().as_deref(), Some("T1"));
    }
}
