//! Chat client trait, the backend client and error types.

use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::http::{add_extra_headers, build_http_client};
use crate::model::{ChatTranscript, Paper, ReviewRequest, ReviewResponse, Task, TaskStatus};
use crate::options::{HttpTransport, TransportOptions};
use crate::sse::{ChatResponseExt, ChatStream};

/// Path segments of the versioned backend API.
const API_PREFIX: [&str; 2] = ["api", "v1"];

/// Boxed error raised by the byte source while reading a response body.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A success response whose body is not the expected JSON.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The response body failed while it was being read.
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    /// The backend reported a failure inside the stream.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream cancelled")]
    StreamCancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// True for an `error` frame sent by the backend.
    pub fn is_upstream(&self) -> bool {
        matches!(self, ClientError::Upstream(_))
    }

    /// True when the connection broke while the body was being read.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// A client able to stream answers about a single paper.
///
/// # Required Methods
/// - `chat_stream`: open the stream for one question
///
/// # Provided Methods
/// - `chat`: drain the stream into a [`ChatTranscript`]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Ask a question about a paper and get the answer as a stream.
    async fn chat_stream(&self, paper_id: &str, message: &str) -> Result<ChatStream, ClientError>;

    /// Ask a question and wait for the whole answer.
    async fn chat(&self, paper_id: &str, message: &str) -> Result<ChatTranscript, ClientError> {
        self.chat_stream(paper_id, message)
            .await?
            .into_transcript()
            .await
    }
}

/// Client for the backend: paper search and lookup, review generation,
/// background tasks and streamed paper chat.
pub struct BackendClient {
    transport_options: TransportOptions<HttpTransport>,
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client; fails if the HTTP client cannot be built.
    pub fn new(transport_options: TransportOptions<HttpTransport>) -> Result<Self, ClientError> {
        let http = build_http_client(&transport_options)?;
        Ok(Self {
            transport_options,
            http,
        })
    }

    /// Create a client configured from environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(TransportOptions::new(HttpTransport::from_env()?))
    }

    pub fn transport_options(&self) -> &TransportOptions<HttpTransport> {
        &self.transport_options
    }

    /// Search arXiv papers matching `query`.
    pub async fn search_papers(&self, query: &str) -> Result<Vec<Paper>, ClientError> {
        let query = require(query, "Search query")?;
        let url = self.endpoint(&["papers", "search"])?;
        let req = self.authorize(self.http.get(url).query(&[("query", query)]));
        Self::decode_json(req.send().await?).await
    }

    /// Fetch several papers at once by identifier.
    pub async fn papers_by_ids(&self, ids: &[&str]) -> Result<Vec<Paper>, ClientError> {
        let ids = ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()).join(",");
        let ids = require(&ids, "Paper IDs")?;
        let url = self.endpoint(&["papers", "search"])?;
        let req = self.authorize(self.http.get(url).query(&[("ids", ids)]));
        Self::decode_json(req.send().await?).await
    }

    /// Fetch a single paper.
    pub async fn get_paper(&self, paper_id: &str) -> Result<Paper, ClientError> {
        let paper_id = require(paper_id, "Paper ID")?;
        let url = self.endpoint(&["papers", paper_id])?;
        let req = self.authorize(self.http.get(url));
        Self::decode_json(req.send().await?).await
    }

    /// Generate a literature review over the selected papers.
    pub async fn generate_review(
        &self,
        request: &ReviewRequest,
    ) -> Result<ReviewResponse, ClientError> {
        if request.paper_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(ClientError::InvalidRequest("No paper IDs provided".to_string()));
        }
        let topic_len = request.topic.trim().chars().count();
        if !(3..=500).contains(&topic_len) {
            return Err(ClientError::InvalidRequest(
                "Topic must be between 3 and 500 characters".to_string(),
            ));
        }
        if !(1..=20).contains(&request.max_papers) {
            return Err(ClientError::InvalidRequest(
                "max_papers must be between 1 and 20".to_string(),
            ));
        }

        let url = self.endpoint(&["review", "generate-review"])?;
        debug!(papers = request.paper_ids.len(), "requesting review generation");
        let req = self.authorize(self.http.post(url).json(request));
        Self::decode_json(req.send().await?).await
    }

    /// Current state of a background task.
    pub async fn task(&self, task_id: &str) -> Result<Task, ClientError> {
        let task_id = require(task_id, "Task ID")?;
        let url = self.endpoint(&["tasks", task_id])?;
        let req = self.authorize(self.http.get(url));
        Self::decode_json(req.send().await?).await
    }

    /// Tasks of the current user, newest first, optionally filtered by status.
    pub async fn tasks(
        &self,
        status: Option<TaskStatus>,
        limit: u32,
    ) -> Result<Vec<Task>, ClientError> {
        let url = self.endpoint(&["tasks", ""])?;
        let mut req = self.http.get(url).query(&[("limit", limit)]);
        if let Some(status) = status {
            req = req.query(&[("status", status.as_str())]);
        }
        Self::decode_json(self.authorize(req).send().await?).await
    }

    /// Ask the backend to cancel a running task. Returns its confirmation message.
    pub async fn cancel_task(&self, task_id: &str) -> Result<String, ClientError> {
        let task_id = require(task_id, "Task ID")?;
        let url = self.endpoint(&["tasks", task_id, "cancel"])?;
        let req = self.authorize(self.http.post(url));
        let body: MessageBody = Self::decode_json(req.send().await?).await?;
        Ok(body.message)
    }

    /// Poll a task every `interval` until it is completed or failed.
    ///
    /// A failed task is returned as `Ok`; inspect `status` and
    /// `error_message`. Wrap the call in `tokio::time::timeout` to bound it.
    pub async fn wait_for_task(&self, task_id: &str, interval: Duration) -> Result<Task, ClientError> {
        loop {
            let task = self.task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            debug!(task_id = %task.id, status = task.status.as_str(), "task still in progress");
            tokio::time::sleep(interval).await;
        }
    }

    /// URL of an endpoint below the versioned API prefix.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let base = self
            .transport_options
            .provider
            .base_url
            .as_deref()
            .ok_or_else(|| ClientError::Config("Base URL is required".to_string()))?;

        let mut url = Url::parse(base)
            .map_err(|e| ClientError::Config(format!("Invalid base URL {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("Base URL cannot have a path: {}", base)))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    /// Add the bearer token and extra headers.
    fn authorize(&self, mut req: RequestBuilder) -> RequestBuilder {
        if let Some(api_key) = &self.transport_options.provider.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }
        add_extra_headers(req, &self.transport_options.provider.extra_headers)
    }

    /// Read a JSON response body, mapping error statuses first.
    async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Self::handle_error_response(status, &body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Handle backend error responses.
    fn handle_error_response(status: reqwest::StatusCode, body: &str) -> ClientError {
        let status_code = status.as_u16();
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody { detail: Value::String(message) }) => ClientError::Api {
                status: status_code,
                code: None,
                message,
            },
            Ok(ErrorBody { detail }) => match serde_json::from_value::<ErrorDetail>(detail.clone()) {
                Ok(ErrorDetail { error }) => ClientError::Api {
                    status: status_code,
                    code: error.code,
                    message: error.message,
                },
                Err(_) => ClientError::Api {
                    status: status_code,
                    code: None,
                    message: detail.to_string(),
                },
            },
            Err(_) => ClientError::Api {
                status: status_code,
                code: None,
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body.to_string()
                },
            },
        }
    }
}

#[async_trait]
impl ChatClient for BackendClient {
    async fn chat_stream(&self, paper_id: &str, message: &str) -> Result<ChatStream, ClientError> {
        let paper_id = require(paper_id, "Paper ID")?;
        let message = require(message, "Message")?;

        let url = self.endpoint(&["papers", paper_id, "chat"])?;
        debug!(%url, "opening paper chat stream");

        let req = self.authorize(
            self.http
                .post(url)
                .query(&[("message", message)])
                .header(ACCEPT, "text/event-stream"),
        );

        let response = req.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status, &body));
        }

        Ok(response.chat_stream())
    }
}

/// Trimmed `value`, or `InvalidRequest` naming `what` when it is blank.
fn require<'a>(value: &'a str, what: &str) -> Result<&'a str, ClientError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ClientError::InvalidRequest(format!("{} is required", what)));
    }
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

/// FastAPI error body: `detail` is either a string or a structured error.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    code: Option<String>,
    message: String,
}
