//! Callback-driven consumption of chat streams.
//!
//! UIs that render incrementally implement [`TokenConsumer`] and hand it to
//! [`drive`], which pulls the stream to completion and reports every event.

use futures::StreamExt;
use tracing::debug;

use crate::client::ClientError;
use crate::model::{ChatEvent, ChatTranscript, Source};
use crate::sse::ChatStream;

/// Whether the consumer wants more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receiver of a streamed chat answer.
///
/// Only `on_token` is required. Callbacks are invoked in arrival order and
/// never after a terminal callback (`on_complete` or `on_error`).
pub trait TokenConsumer {
    /// A new fragment of the answer.
    fn on_token(&mut self, token: &str) -> Flow;

    /// Sources newly attached to the answer; `all` includes them.
    fn on_citations(&mut self, _new: &[Source], _all: &[Source]) -> Flow {
        Flow::Continue
    }

    /// The stream failed. Use [`ClientError::is_upstream`] to tell a backend
    /// error apart from a broken connection.
    fn on_error(&mut self, _error: &ClientError) {}

    /// The answer is complete.
    fn on_complete(&mut self, _citations: &[Source]) {}
}

/// Adapter turning a closure into a token-only consumer.
pub struct OnToken<F>(pub F);

impl<F: FnMut(&str)> TokenConsumer for OnToken<F> {
    fn on_token(&mut self, token: &str) -> Flow {
        (self.0)(token);
        Flow::Continue
    }
}

impl TokenConsumer for ChatTranscript {
    fn on_token(&mut self, token: &str) -> Flow {
        self.tokens.push(token.to_string());
        Flow::Continue
    }

    fn on_citations(&mut self, new: &[Source], _all: &[Source]) -> Flow {
        self.citations.extend_from_slice(new);
        Flow::Continue
    }
}

/// Pull `stream` to its end, forwarding every event to `consumer`.
///
/// Returns the accumulated citations. When the consumer answers
/// [`Flow::Stop`] the stream is cancelled and `StreamCancelled` is returned.
pub async fn drive<C>(mut stream: ChatStream, consumer: &mut C) -> Result<Vec<Source>, ClientError>
where
    C: TokenConsumer + ?Sized,
{
    while let Some(item) = stream.next().await {
        let flow = match item {
            Ok(ChatEvent::Token(token)) => consumer.on_token(&token),
            Ok(ChatEvent::Citations(new)) => consumer.on_citations(&new, stream.citations()),
            Err(e) => {
                consumer.on_error(&e);
                return Err(e);
            }
        };

        if flow == Flow::Stop {
            debug!("consumer stopped the chat stream");
            stream.cancel();
            return Err(ClientError::StreamCancelled);
        }
    }

    let citations = stream.citations().to_vec();
    consumer.on_complete(&citations);
    Ok(citations)
}
