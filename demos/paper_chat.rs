//! Stream an answer about a paper to stdout.
//!
//! Run with:
//! ```bash
//! export LITXPLORE_API_URL="http://localhost:8000"
//! export LITXPLORE_API_TOKEN="your-session-token"
//! cargo run --example paper_chat -- 2401.00001 "What dataset do the authors use?"
//! ```

use std::io::Write;

use litstream::client::{BackendClient, ChatClient};
use litstream::consumer::{drive, Flow, TokenConsumer};
use litstream::model::Source;
use litstream::ClientError;
use tracing_subscriber::EnvFilter;

/// Prints tokens as they arrive.
struct Terminal;

impl TokenConsumer for Terminal {
    fn on_token(&mut self, token: &str) -> Flow {
        print!("{}", token);
        let _ = std::io::stdout().flush();
        Flow::Continue
    }

    fn on_error(&mut self, error: &ClientError) {
        if error.is_upstream() {
            eprintln!("\n\nThe backend could not answer: {}", error);
        } else {
            eprintln!("\n\nConnection lost: {}", error);
        }
    }

    fn on_complete(&mut self, citations: &[Source]) {
        println!("\n\n=== Stream Complete ===");
        if !citations.is_empty() {
            let pages: Vec<String> = citations
                .iter()
                .map(|s| s.page_number().map_or_else(|| s.page.to_string(), |p| (p + 1).to_string()))
                .collect();
            println!("Cited pages: {}", pages.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(paper_id), Some(message)) = (args.next(), args.next()) else {
        eprintln!("usage: paper_chat <paper-id> <question>");
        std::process::exit(2);
    };

    let client = BackendClient::from_env()?;
    let stream = client.chat_stream(&paper_id, &message).await?;
    drive(stream, &mut Terminal).await?;

    Ok(())
}
