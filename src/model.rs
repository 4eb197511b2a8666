//! Wire and output data models for paper chat and the backend REST API.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

/// A page reference attached to a chat answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    /// Page number inside the paper (0-based, as reported by the backend)
    pub page: Number,

    /// Anything else the backend attaches to a source
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Source {
    /// Create a source pointing at a single page.
    pub fn page(page: i64) -> Self {
        Self {
            page: Number::from(page),
            extra: Map::new(),
        }
    }

    /// The page as an integer; `3.0` counts as page 3.
    pub fn page_number(&self) -> Option<i64> {
        self.page
            .as_i64()
            .or_else(|| self.page.as_f64().filter(|p| p.fract() == 0.0).map(|p| p as i64))
    }
}

/// The JSON payload carried by one `data:` event.
///
/// Every field is optional; the backend sends `content` and `sources` on
/// regular frames and a lone `error` when generation fails. Fields are
/// decoded independently: an unexpected `sources` entry is skipped without
/// losing the `content` of the same frame.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChatFrame {
    #[serde(
        default,
        deserialize_with = "lenient_content",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_sources",
        skip_serializing_if = "Option::is_none"
    )]
    pub sources: Option<Vec<Source>>,

    #[serde(
        default,
        deserialize_with = "lenient_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

fn lenient_content<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(content)) => Some(content),
        None | Some(Value::Null) => None,
        Some(other) => {
            debug!(content = %other, "ignoring non-string frame content");
            None
        }
    })
}

fn lenient_sources<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<Source>>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => Some(
            items
                .into_iter()
                .filter_map(|item| match serde_json::from_value::<Source>(item.clone()) {
                    Ok(source) => Some(source),
                    Err(e) => {
                        debug!(source = %item, error = %e, "skipping unreadable source");
                        None
                    }
                })
                .collect(),
        ),
        None | Some(Value::Null) => None,
        Some(other) => {
            debug!(sources = %other, "ignoring sources that are not an array");
            None
        }
    })
}

fn lenient_error<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(error)) => Some(error),
        None | Some(Value::Null) => None,
        Some(other) => Some(other.to_string()),
    })
}

/// An item produced by a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Text fragment to append to the rendered answer
    Token(String),

    /// Sources newly attached to the answer, in arrival order
    Citations(Vec<Source>),
}

/// A fully drained chat answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTranscript {
    /// Tokens in the order they were received
    pub tokens: Vec<String>,

    /// Every source seen during the stream
    pub citations: Vec<Source>,
}

impl ChatTranscript {
    /// The answer text: all tokens concatenated.
    pub fn text(&self) -> String {
        self.tokens.concat()
    }

    /// Record one stream event.
    pub fn record(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Token(token) => self.tokens.push(token),
            ChatEvent::Citations(sources) => self.citations.extend(sources),
        }
    }
}

/// A paper as returned by search and lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Paper {
    /// arXiv identifier, or `upload_<hash>` for uploaded PDFs
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub summary: String,

    /// Publication time as sent by the backend (ISO 8601)
    pub published: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Request body of review generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewRequest {
    pub paper_ids: Vec<String>,

    /// Research topic, 3 to 500 characters
    pub topic: String,

    /// Maximum number of papers to analyze, 1 to 20
    pub max_papers: u32,
}

impl ReviewRequest {
    pub const DEFAULT_MAX_PAPERS: u32 = 10;

    pub fn new(paper_ids: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            paper_ids,
            topic: topic.into(),
            max_papers: Self::DEFAULT_MAX_PAPERS,
        }
    }

    pub fn with_max_papers(mut self, max_papers: u32) -> Self {
        self.max_papers = max_papers;
        self
    }
}

/// A generated literature review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewResponse {
    pub review: String,
    pub citations: Vec<Paper>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Lifecycle state of a background task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the task will not change state anymore.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// A background task and, once completed, its result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub created_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_with_sources() {
        let frame: ChatFrame =
            serde_json::from_str(r#"{"content":" world","sources":[{"page":3}]}"#).unwrap();
        assert_eq!(frame.content.as_deref(), Some(" world"));
        assert_eq!(frame.sources, Some(vec![Source::page(3)]));
        assert!(frame.error.is_none());
    }

    #[test]
    fn test_frame_ignores_unknown_fields() {
        let frame: ChatFrame = serde_json::from_str(r#"{"content":"x","model":"gpt"}"#).unwrap();
        assert_eq!(frame.content.as_deref(), Some("x"));
    }

    #[test]
    fn test_source_keeps_extra_fields() {
        let source: Source = serde_json::from_str(r#"{"page":7,"paper_id":"2401.1"}"#).unwrap();
        assert_eq!(source.page_number(), Some(7));
        assert_eq!(source.extra.get("paper_id"), Some(&Value::from("2401.1")));
    }

    #[test]
    fn test_frame_keeps_content_with_odd_sources() {
        let frame: ChatFrame = serde_json::from_str(
            r#"{"content":"Hello","sources":[{"page":3.0},{"page":null},{"title":"x"},{"page":4}]}"#,
        )
        .unwrap();
        assert_eq!(frame.content.as_deref(), Some("Hello"));

        let pages: Vec<_> = frame
            .sources
            .unwrap()
            .iter()
            .map(Source::page_number)
            .collect();
        assert_eq!(pages, vec![Some(3), Some(4)]);
    }

    #[test]
    fn test_frame_with_unexpected_field_types() {
        let frame: ChatFrame =
            serde_json::from_str(r#"{"content":"ok","sources":"none","error":null}"#).unwrap();
        assert_eq!(frame.content.as_deref(), Some("ok"));
        assert!(frame.sources.is_none());
        assert!(frame.error.is_none());

        let frame: ChatFrame = serde_json::from_str(r#"{"content":12,"error":{"code":500}}"#).unwrap();
        assert!(frame.content.is_none());
        assert_eq!(frame.error.as_deref(), Some(r#"{"code":500}"#));
    }

    #[test]
    fn test_page_number() {
        assert_eq!(Source::page(2).page_number(), Some(2));
        let source: Source = serde_json::from_str(r#"{"page":2.5}"#).unwrap();
        assert_eq!(source.page_number(), None);
    }

    #[test]
    fn test_task_decoding() {
        let task: Task = serde_json::from_str(
            r#"{"id":"7f1c","status":"completed","error_message":null,"created_at":"2025-01-02T03:04:05","result_data":{"review":"..."}}"#,
        )
        .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.status.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert_eq!(task.result_data.unwrap()["review"], "...");
    }

    #[test]
    fn test_review_request_defaults() {
        let request = ReviewRequest::new(vec!["2401.00001".to_string()], "transformers");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_papers"], 10);
        assert_eq!(json["topic"], "transformers");
    }

    #[test]
    fn test_transcript_record() {
        let mut transcript = ChatTranscript::default();
        transcript.record(ChatEvent::Token("Hello".to_string()));
        transcript.record(ChatEvent::Citations(vec![Source::page(1)]));
        transcript.record(ChatEvent::Token(" world".to_string()));
        transcript.record(ChatEvent::Citations(vec![Source::page(2)]));

        assert_eq!(transcript.text(), "Hello world");
        assert_eq!(transcript.citations, vec![Source::page(1), Source::page(2)]);
    }
}
