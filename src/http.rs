//! HTTP client utilities for talking to the backend.
//!
//! Client construction and request decoration shared by every endpoint
//! wrapper.

use reqwest::{Client, RequestBuilder};
use std::collections::HashMap;
use tracing::warn;

use crate::options::{HttpTransport, TransportOptions};

/// Build a configured HTTP client from transport options.
///
/// This applies the timeout and proxy settings. An unparsable proxy URL is
/// logged and skipped.
pub fn build_http_client(
    transport_options: &TransportOptions<HttpTransport>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();

    if let Some(timeout) = transport_options.timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(proxy_url) = &transport_options.provider.proxy {
        match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(e) => warn!(proxy = %proxy_url, error = %e, "ignoring invalid proxy"),
        }
    }

    builder.build()
}

/// Add extra headers to a request if specified in transport options.
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}
