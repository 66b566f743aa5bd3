//! Authentication endpoints.
//!
//! Login, registration and password reset run before a signing secret is
//! issued, so their paths are exempt from signing by default. A successful
//! [`Client::login`] stores the granted token and signing secret; every
//! later request is then authenticated and signed.

use reqwest::Method;

use crate::{
    client::Client,
    error::{Error, Result},
    events::Event,
    protocol::auth::{ForgetPayload, LoginPayload, RegisterPayload, TokenGrant, VerifyCodePayload},
};

pub const LOGIN_PATH: &str = "/api/v1/login";
pub const VERIFY_CODE_PATH: &str = "/api/v1/getVerifyCode";
pub const REGISTER_PATH: &str = "/api/v1/register";
pub const FORGET_PATH: &str = "/api/v1/forget";
pub const LOGOUT_PATH: &str = "/logout";

impl Client {
    /// Signs in and stores the granted credentials.
    ///
    /// Clears the reason of a previous forced logout and emits
    /// [`Event::LoggedIn`].
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the login, or grants no token.
    pub async fn login(&self, payload: &LoginPayload) -> Result<()> {
        let request = self
            .request(Method::POST, LOGIN_PATH)?
            .json(payload)?
            .fallback_message("login failed");
        let envelope = self.execute_envelope(request).await?;

        let grant = TokenGrant::from_envelope(&envelope);
        let Some(token) = grant.token.as_deref() else {
            return Err(Error::unauthenticated("login granted no token"));
        };

        self.credentials().set_token(Some(token));
        self.credentials().set_signing_secret(grant.sign.as_deref());
        self.session().clear_logout_info();

        info!("logged in");
        self.session().emit(Event::LoggedIn);

        Ok(())
    }

    /// Requests a verification code for registration or password reset.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the request.
    pub async fn request_verify_code(&self, payload: &VerifyCodePayload) -> Result<()> {
        let request = self
            .request(Method::POST, VERIFY_CODE_PATH)?
            .json(payload)?
            .fallback_message("could not send verification code");
        self.execute_envelope(request).await.map(drop)
    }

    /// Registers a new account.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the registration.
    pub async fn register(&self, payload: &RegisterPayload) -> Result<()> {
        let request = self
            .request(Method::POST, REGISTER_PATH)?
            .json(payload)?
            .fallback_message("registration failed");
        self.execute_envelope(request).await.map(drop)
    }

    /// Resets the password with a verification code.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the reset.
    pub async fn reset_password(&self, payload: &ForgetPayload) -> Result<()> {
        let request = self
            .request(Method::POST, FORGET_PATH)?
            .json(payload)?
            .fallback_message("password reset failed");
        self.execute_envelope(request).await.map(drop)
    }

    /// Signs out.
    ///
    /// The server is told first, but a failure there does not keep the
    /// local credentials from being cleared. Emits [`Event::LoggedOut`].
    pub async fn logout(&self) {
        let request = match self.request(Method::POST, LOGOUT_PATH) {
            Ok(request) => Some(request.fallback_message("logout failed")),
            Err(e) => {
                warn!("cannot build logout request: {e}");
                None
            }
        };

        if let Some(request) = request {
            if let Err(e) = self.execute_envelope(request).await {
                warn!("logout request failed: {e}");
            }
        }

        self.credentials().clear();
        info!("logged out");
        self.session().emit(Event::LoggedOut);
    }
}
