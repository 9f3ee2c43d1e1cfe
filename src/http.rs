//! HTTP settings shared by the synchronizers, and classification of HTTP errors.
use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT},
    Url,
};

use crate::{Error, Result};

/// Path of the streaming endpoint, relative to the streaming base URI.
pub const STREAMING_REQUEST_PATH: &str = "/sdk/stream";
/// Path of the polling endpoint, relative to the polling base URI.
pub const POLLING_REQUEST_PATH: &str = "/sdk/poll";

/// HTTP settings for all requests made by the data system.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl HttpConfig {
    /// Default value for [`HttpConfig::connect_timeout`].
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Create default settings.
    pub fn new() -> HttpConfig {
        HttpConfig::default()
    }

    /// Update connect timeout with `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> HttpConfig {
        self.connect_timeout = timeout;
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> HttpConfig {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Headers for a request authenticated with `sdk_key`. Invalid custom headers are skipped
    /// with a warning.
    pub fn default_headers(&self, sdk_key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(sdk_key) {
            headers.insert(AUTHORIZATION, value);
        } else {
            log::warn!(target: "flagsync", "SDK key contains characters that are not valid in a header");
        }
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => log::warn!(target: "flagsync", header = name.as_str(); "skipping invalid header"),
            }
        }
        headers
    }
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            connect_timeout: HttpConfig::DEFAULT_CONNECT_TIMEOUT,
            user_agent: format!("flagsync/{}", env!("CARGO_PKG_VERSION")),
            headers: Vec::new(),
        }
    }
}

/// Build an endpoint URL from a base URI, a path and optional query parameters. Trailing slashes
/// on the base URI are ignored.
pub fn endpoint_url(base_uri: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
    let base = base_uri.trim_end_matches('/');
    let url = if params.is_empty() {
        Url::parse(&format!("{base}{path}"))
    } else {
        Url::parse_with_params(&format!("{base}{path}"), params)
    };
    url.map_err(Error::InvalidBaseUri)
}

/// Returns `true` if a request that failed with `status` may succeed when retried.
///
/// Client errors are permanent (the SDK key or request is wrong) except for request timeouts and
/// rate limiting. Every other status is treated as a transient server-side problem.
pub fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        408 | 429 => true,
        400..=499 => false,
        _ => true,
    }
}

/// Human-readable description of an HTTP error status.
pub fn http_error_description(status: u16) -> String {
    match status {
        401 | 403 => format!("HTTP error {status} (invalid SDK key)"),
        _ => format!("HTTP error {status}"),
    }
}

/// Log a request failure and return whether it is recoverable.
///
/// `status` is `None` for failures without an HTTP status, which are always recoverable.
pub(crate) fn check_if_error_is_recoverable_and_log(
    description: &str,
    context: &str,
    status: Option<u16>,
    retry_message: &str,
) -> bool {
    match status {
        Some(status) if !is_http_error_recoverable(status) => {
            log::error!(target: "flagsync", "Error {context}: {description}; giving up permanently");
            false
        }
        _ => {
            log::warn!(target: "flagsync", "Error {context}: {description}; {retry_message}");
            true
        }
    }
}
