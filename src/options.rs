//! Transport configuration for the backend connection.

use std::collections::HashMap;
use std::time::Duration;

use crate::client::ClientError;

/// Environment variable holding the backend base URL.
pub const ENV_API_URL: &str = "LITXPLORE_API_URL";

/// Environment variable holding the bearer token.
pub const ENV_API_TOKEN: &str = "LITXPLORE_API_TOKEN";

/// A secret string type for sensitive data like session tokens.
/// Prevents accidental logging or display of secrets.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// Generic transport options containing truly generic transport fields
/// and transport-specific configuration.
///
/// # Example
/// ```rust
/// use litstream::options::{TransportOptions, HttpTransport};
/// use std::time::Duration;
///
/// let options = TransportOptions::new(
///     HttpTransport::new("session-token").with_base_url("http://localhost:8000".to_string()),
/// )
/// .with_timeout(Duration::from_secs(120));
/// assert_eq!(options.timeout, Some(Duration::from_secs(120)));
/// ```
#[derive(Debug, Clone)]
pub struct TransportOptions<T> {
    /// Whole-request timeout, including the time spent streaming the body
    pub timeout: Option<Duration>,

    /// Transport-specific options
    pub provider: T,
}

impl<T> TransportOptions<T> {
    /// Create new transport options with transport-specific configuration.
    pub fn new(provider: T) -> Self {
        Self {
            timeout: None,
            provider,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP-specific transport options.
/// Used as the provider field in `TransportOptions<HttpTransport>`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    /// Bearer token sent in the `Authorization` header
    pub api_key: Option<SecretString>,

    /// Base URL of the backend, e.g. `http://localhost:8000`
    pub base_url: Option<String>,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl HttpTransport {
    /// Create new HTTP transport options with a bearer token.
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: None,
            proxy: None,
            extra_headers: None,
        }
    }

    /// Read `LITXPLORE_API_URL` (required) and `LITXPLORE_API_TOKEN` (optional).
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let base_url = lookup(ENV_API_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ClientError::Config(format!("{} must be set", ENV_API_URL)))?;

        Ok(Self {
            api_key: lookup(ENV_API_TOKEN)
                .filter(|token| !token.is_empty())
                .map(SecretString::new),
            base_url: Some(base_url.trim().to_string()),
            proxy: None,
            extra_headers: None,
        })
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set extra headers.
    pub fn with_extra_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.extra_headers = Some(headers);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let transport = HttpTransport::new("very-secret");
        let debug = format!("{:?}", transport);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_lookup() {
        let transport = HttpTransport::from_lookup(|key| match key {
            ENV_API_URL => Some(" http://localhost:8000 ".to_string()),
            ENV_API_TOKEN => Some("tok".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(transport.base_url.as_deref(), Some("http://localhost:8000"));
        assert_eq!(transport.api_key.unwrap().expose_secret(), "tok");
    }

    #[test]
    fn test_from_lookup_without_token() {
        let transport = HttpTransport::from_lookup(|key| {
            (key == ENV_API_URL).then(|| "http://api".to_string())
        })
        .unwrap();
        assert!(transport.api_key.is_none());
    }

    #[test]
    fn test_from_lookup_requires_url() {
        let result = HttpTransport::from_lookup(|_| None);
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_with_header() {
        let transport = HttpTransport::default()
            .with_header("X-Client".to_string(), "cli".to_string())
            .with_header("X-Trace".to_string(), "1".to_string());
        assert_eq!(transport.extra_headers.unwrap().len(), 2);
    }
}
