//! Embeds the scanner as a library: scans the URL given on the command line
//! with in-process parsing and prints findings as JSON lines.
//!
//!   cargo run --example library_scan -- http://127.0.0.1:8000/

use std::sync::Arc;

use scanline::output::{MemorySink, OutputSink};
use scanline::runner::{Options, ParserMode, Runner};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("scanline=info"))
        .init();

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8000/".to_string());
    let mut options = Options {
        targets: vec![target],
        parser_mode: ParserMode::Inline,
        ..Options::default()
    };
    options.coordinator.max_depth = 3;

    let sink = Arc::new(MemorySink::new());
    let runner = Runner::new(options)?.with_sink(sink.clone() as Arc<dyn OutputSink>);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = runner.run(cancel).await?;
    for finding in &result.findings {
        println!("{}", serde_json::to_string(finding)?);
    }
    eprintln!(
        "{} requests, {} findings, {} events, degraded: {:?}",
        result.summary.requests,
        result.summary.findings(),
        sink.events().len(),
        result.summary.degraded
    );
    Ok(())
}
