//! Runs the real binary as a parser worker.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use scanline::parser::{ParserConfig, ParserPool, WORKER_FLAG};

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_scanline"))
}

#[test]
fn worker_answers_one_line_per_job() {
    let mut child = Command::new(binary())
        .arg(WORKER_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    {
        let stdin = child.stdin.as_mut().unwrap();
        writeln!(
            stdin,
            r#"{{"id":7,"base_url":"http://t.test/dir/","document":"<title>Hi</title><a href=\"next\">n</a>"}}"#
        )
        .unwrap();
        writeln!(stdin, "not json").unwrap();
    }
    drop(child.stdin.take());
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());

    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], 7);
    assert_eq!(lines[0]["document"]["title"], "Hi");
    assert_eq!(lines[0]["document"]["links"][0], "http://t.test/dir/next");
    assert!(lines[1]["error"].is_string());
}

#[tokio::test]
async fn pool_parses_through_child_processes() {
    let pool = ParserPool::start(ParserConfig {
        workers: 2,
        program: binary(),
        ..ParserConfig::default()
    });
    let doc = pool
        .parse(
            "http://t.test/",
            r#"<form action="/login" method="post"><input name="user"><input name="pass"></form>"#,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(doc.forms.len(), 1);
    assert_eq!(doc.forms[0].inputs, vec!["user", "pass"]);
    assert_eq!(doc.forms[0].method.to_ascii_uppercase(), "POST");

    pool.shutdown().await;
    assert_eq!(pool.stats().parsed, 1);
    assert!(pool.stats().spawned >= 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn worker_over_its_address_limit_is_memory_or_timeout() {
    use scanline::parser::ParserError;

    let timeout = Duration::from_secs(10);
    let grace = Duration::from_millis(500);
    let pool = ParserPool::start(ParserConfig {
        workers: 1,
        memory_limit_mb: 16,
        timeout,
        grace,
        max_document_bytes: 32 * 1024 * 1024,
        program: binary(),
        ..ParserConfig::default()
    });
    // the job line alone is larger than half the limit, and every link is kept
    let document: String = (0..500_000)
        .map(|i| format!("<a href=\"/p/{i}\">x</a>"))
        .collect();
    assert!(document.len() > 8 * 1024 * 1024);

    let started = std::time::Instant::now();
    let err = pool
        .parse("http://t.test/", &document, timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(err, ParserError::Memory | ParserError::Timeout { .. }),
        "{err:?}"
    );
    assert!(elapsed < timeout + grace * 4, "took {elapsed:?}");
    let stats = pool.stats();
    assert_eq!(stats.memory + stats.timeouts, 1);
    assert_eq!(stats.crashes, 0);
    pool.shutdown().await;
}
