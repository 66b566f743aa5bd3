//! Outgoing API requests.
//!
//! An [`OutgoingRequest`] is built by the caller and then mutated in place by
//! the client pipeline, which adds authentication, device and signature
//! headers before every transmission. Query parameters are kept apart from
//! the URL until the request is sent, so that the signer sees them exactly as
//! given and so that a reissued request does not accumulate them twice.

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use url::{form_urlencoded, Url};

use crate::error::Result;

/// A query parameter value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Param {
    /// A single value.
    Single(String),
    /// A list, sent as one `key=value` pair per element.
    List(Vec<String>),
}

impl Param {
    /// The parameter as a sequence of values.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::List(values) => values,
        };
        values.iter().map(String::as_str)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Single(value.to_owned())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<u32> for Param {
    fn from(value: u32) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<Vec<String>> for Param {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

impl From<Vec<&str>> for Param {
    fn from(values: Vec<&str>) -> Self {
        Self::List(values.into_iter().map(str::to_owned).collect())
    }
}

/// Request payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    /// Sent as-is.
    Text(String),
    /// Sent `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Sent `application/json`.
    Json(serde_json::Value),
}

impl Body {
    /// The `Content-Type` the body is transmitted with, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<HeaderValue> {
        match self {
            Self::Empty | Self::Text(_) => None,
            Self::Form(_) => Some(HeaderValue::from_static(
                "application/x-www-form-urlencoded",
            )),
            Self::Json(_) => Some(HeaderValue::from_static("application/json")),
        }
    }

    /// Serializes the body to its wire form.
    ///
    /// The wire form is also the canonical form used for signing.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(text) => text.clone(),
            Self::Form(pairs) => form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish(),
            Self::Json(value) => value.to_string(),
        }
    }
}

/// A request on its way through the client pipeline.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub query: Vec<(String, Param)>,
    pub body: Body,

    /// Message shown to the user when the server rejects the request
    /// without one of its own.
    pub fallback_message: Option<String>,

    /// Set once this request has been reissued with a refreshed token.
    pub(crate) refreshed: bool,

    /// Bearer token to use instead of the stored one.
    pub(crate) bearer: Option<String>,
}

impl OutgoingRequest {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: Body::Empty,
            fallback_message: None,
            refreshed: false,
            bearer: None,
        }
    }

    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Param>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets a JSON body.
    ///
    /// # Errors
    ///
    /// Returns error if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Body::Json(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Sets a form body.
    #[must_use]
    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Sets a plain text body.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    #[must_use]
    pub fn fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = Some(message.into());
        self
    }

    /// Whether this request has already been reissued after a token refresh.
    #[must_use]
    pub fn is_refreshed(&self) -> bool {
        self.refreshed
    }

    /// The URL path, which is what signing exclusions match against.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The URL that goes on the wire: the request URL with the explicit
    /// query parameters appended.
    #[must_use]
    pub fn wire_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, param) in &self.query {
                for value in param.values() {
                    pairs.append_pair(key, value);
                }
            }
        }
        url
    }

    /// Builds the `reqwest` request for one transmission.
    #[must_use]
    pub fn to_reqwest(&self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method.clone(), self.wire_url());

        let headers = request.headers_mut();
        headers.extend(self.headers.clone());
        if let Some(content_type) = self.body.content_type() {
            headers.entry(CONTENT_TYPE).or_insert(content_type);
        }

        if self.body != Body::Empty {
            *request.body_mut() = Some(self.body.encode().into());
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn wire_url_appends_params_after_embedded_query() {
        let request = OutgoingRequest::get(url("http://localhost/api/v1/music?c=3"))
            .param("b", "2")
            .param("ids", vec!["7", "8"]);

        assert_eq!(
            request.wire_url().as_str(),
            "http://localhost/api/v1/music?c=3&b=2&ids=7&ids=8"
        );
        // The request URL itself is left untouched for reissues.
        assert_eq!(request.url.query(), Some("c=3"));
    }

    #[test]
    fn bodies_carry_content_type() {
        let request = OutgoingRequest::post(url("http://localhost/api/v1/login"))
            .json(&serde_json::json!({"account": "a"}))
            .unwrap();
        let built = request.to_reqwest();
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let form = Body::Form(vec![
            ("name".to_owned(), "a b".to_owned()),
            ("x".to_owned(), "1".to_owned()),
        ]);
        assert_eq!(form.encode(), "name=a+b&x=1");
    }
}
