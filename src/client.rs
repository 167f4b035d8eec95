//! Core HTTP client for the OpenAPI REST control surface.
//!
//! The [`RestClient`] struct wraps [`reqwest::Client`] with bearer
//! authentication and provides typed `get`, `post`, `put`, and `delete`
//! methods. Endpoint methods are added via `impl` blocks in [`crate::api`].

use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::SIM_API_BASE_URL;
use crate::error::{ApiErrorBody, Result, StreamingError};

/// Bearer-authenticated HTTP client for the OpenAPI gateway.
///
/// The `Authorization` header value is built once per token and cached.
///
/// # Example
///
/// ```no_run
/// use saxo_streaming::client::RestClient;
///
/// # fn main() -> saxo_streaming::Result<()> {
/// let client = RestClient::new("your-access-token")?;
/// assert!(client.base_url().ends_with("/sim/openapi"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    /// Base URL for REST requests (defaults to [`SIM_API_BASE_URL`]).
    base_url: String,
    /// Cached `Bearer <token>` header value.
    auth_header: HeaderValue,
}

impl RestClient {
    /// Create a client for the simulation gateway.
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_base_url(access_token, SIM_API_BASE_URL)
    }

    /// Create a client pointing at a custom base URL.
    ///
    /// Useful for the live gateway or a mock server.
    pub fn with_base_url(access_token: &str, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .default_headers(Self::default_headers())
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            auth_header: Self::bearer(access_token)?,
        })
    }

    /// Returns a reference to the underlying `reqwest::Client`.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace the access token (e.g. after renewal).
    pub fn set_access_token(&mut self, token: &str) -> Result<()> {
        self.auth_header = Self::bearer(token)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Generic HTTP helpers
    // -----------------------------------------------------------------------

    /// Perform a GET request and deserialize the JSON response.
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");

        let resp = self
            .http
            .get(&url)
            .headers(self.auth_headers())
            .send()
            .await?;

        self.handle_response(resp).await
    }

    /// Perform a POST request with a JSON body and deserialize the response.
    pub async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "POST");

        let resp = self
            .http
            .post(&url)
            .headers(self.auth_headers())
            .json(body)
            .send()
            .await?;

        self.handle_response(resp).await
    }

    /// Perform a DELETE request that returns no body (expects 202 Accepted).
    pub async fn delete_no_content(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        tracing::debug!(%url, "DELETE (no content)");

        let resp = self
            .http
            .delete(&url)
            .headers(self.auth_headers())
            .send()
            .await?;

        self.expect_success(resp).await
    }

    /// Perform a PUT without a body against an absolute URL.
    ///
    /// The streaming authorize endpoint lives on the streaming host rather
    /// than the REST gateway, so it cannot go through [`Self::url`].
    pub async fn put_absolute_no_content(&self, url: &url::Url) -> Result<()> {
        tracing::debug!(%url, "PUT (no content)");

        let resp = self
            .http
            .put(url.as_str())
            .headers(self.auth_headers())
            .header(header::CONTENT_LENGTH, "0")
            .send()
            .await?;

        self.expect_success(resp).await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Build the full URL from a path segment.
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn bearer(token: &str) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            StreamingError::InvalidArgument("access token contains invalid header characters".into())
        })?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Default headers applied to every request.
    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(1);
        headers.insert(header::AUTHORIZATION, self.auth_header.clone());
        headers
    }

    /// Read a response, returning either the deserialized body or an error.
    async fn handle_response<R: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<R> {
        let status = resp.status();
        let bytes = resp.bytes().await.unwrap_or_default();

        if status.is_success() {
            serde_json::from_slice(&bytes).map_err(StreamingError::Json)
        } else {
            let body = String::from_utf8_lossy(&bytes);
            Err(Self::parse_error_body(status, &body))
        }
    }

    async fn expect_success(&self, resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(Self::parse_error_body(status, &body))
        }
    }

    /// Try to parse the API's JSON error structure; fall back to a raw HTTP
    /// status error.
    pub(crate) fn parse_error_body(status: reqwest::StatusCode, body: &str) -> StreamingError {
        if let Ok(api_err) = serde_json::from_str::<ApiErrorBody>(body) {
            if api_err.error_code.is_some() || api_err.message.is_some() {
                return StreamingError::Api {
                    status,
                    body: api_err,
                };
            }
        }
        StreamingError::HttpStatus {
            status,
            body: body.to_owned(),
        }
    }
}
