//! # litstream - streaming paper chat client
//!
//! Client-side plumbing for the literature-review backend's paper chat:
//! the backend answers questions about a paper as a Server-Sent Events stream,
//! and this crate turns that stream into ordered text tokens plus the list of
//! page citations attached to the answer. It also wraps the plain JSON
//! endpoints around it: paper search and lookup, review generation and
//! background task polling.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Reassembly that is independent of how the network splits the body
//! - Tolerant frame decoding: malformed or doubly-encoded frames never abort a stream
//! - Distinct transport and backend errors
//! - Callback consumers for incremental rendering
//!
//! ### Core Types
//!
//! - **`ChatStream`**: `Stream` of [`ChatEvent`]s for one answer
//! - **`Reassembler`**: the synchronous decoder behind `ChatStream`
//! - **`TokenConsumer`**: callbacks driven by [`consumer::drive`]
//! - **`BackendClient`**: chat, paper search, review generation and task polling
//!
//! ## Example
//! ```no_run
//! use litstream::client::{BackendClient, ChatClient};
//! use litstream::consumer::{drive, OnToken};
//! use litstream::options::{HttpTransport, TransportOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = HttpTransport::new("session-token")
//!         .with_base_url("http://localhost:8000".to_string());
//!     let client = BackendClient::new(TransportOptions::new(transport))?;
//!
//!     let stream = client.chat_stream("2401.00001", "What is the main result?").await?;
//!     let citations = drive(stream, &mut OnToken(|token: &str| print!("{}", token))).await?;
//!
//!     println!("\npages: {:?}", citations.iter().map(|s| s.page_number()).collect::<Vec<_>>());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod consumer;
pub mod http;
pub mod model;
pub mod options;
pub mod sse;

// Re-exports for convenience
pub use client::{BackendClient, ChatClient, ClientError};
pub use consumer::{drive, Flow, TokenConsumer};
pub use model::{
    ChatEvent, ChatTranscript, Paper, ReviewRequest, ReviewResponse, Source, Task, TaskStatus,
};
pub use sse::{reassemble, ChatStream, Reassembler};
