use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use colored::{ColoredString, Colorize};
use indicatif::ProgressBar;
use serde::Serialize;
use thiserror::Error;

use crate::coordinator::ScanSummary;
use crate::model::{Finding, OutputEvent, Severity};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode output event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for events leaving the output stage.
pub trait OutputSink: Send + Sync {
    fn emit(&self, event: &OutputEvent) -> Result<(), OutputError>;

    fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

fn severity_label(severity: Severity) -> ColoredString {
    let label = severity.as_str().to_uppercase();
    match severity {
        Severity::High => label.bold().red(),
        Severity::Medium => label.bold().yellow(),
        Severity::Low => label.bold().cyan(),
        Severity::Information => label.bold().blue(),
    }
}

/// Prints findings as they arrive, above the progress bar when there is one.
pub struct ConsoleSink {
    progress: Option<ProgressBar>,
    show_errors: bool,
}

impl ConsoleSink {
    pub fn new(progress: Option<ProgressBar>, show_errors: bool) -> Self {
        Self {
            progress,
            show_errors,
        }
    }

    fn println(&self, line: String) {
        match self.progress.as_ref() {
            Some(pb) => pb.println(line),
            None => println!("{line}"),
        }
    }
}

impl OutputSink for ConsoleSink {
    fn emit(&self, event: &OutputEvent) -> Result<(), OutputError> {
        match event {
            OutputEvent::Finding(f) => self.println(format!(
                "{}{}{} {} {} {}",
                "[".bold().white(),
                severity_label(f.severity),
                "]".bold().white(),
                f.name.bold().green(),
                "::".bold().white(),
                f.url.bold().blue(),
            )),
            OutputEvent::PluginError {
                plugin,
                url,
                message,
            } if self.show_errors => self.println(format!(
                "{}{}{} {} {} {}",
                "[".bold().white(),
                "ERR".bold().yellow(),
                "]".bold().white(),
                plugin.bold().white(),
                url,
                message.dimmed(),
            )),
            OutputEvent::PluginError { .. } => {}
            OutputEvent::StageDegraded { stage, reason } => self.println(format!(
                "{}{}{} {} {}",
                "[".bold().white(),
                "DEGRADED".bold().red(),
                "]".bold().white(),
                stage.to_string().bold().white(),
                reason,
            )),
        }
        Ok(())
    }
}

/// Appends one JSON object per event to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| OutputError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn io_error(&self, source: std::io::Error) -> OutputError {
        OutputError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl OutputSink for JsonLinesSink {
    fn emit(&self, event: &OutputEvent) -> Result<(), OutputError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(&line).map_err(|e| self.io_error(e))
    }

    fn flush(&self) -> Result<(), OutputError> {
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.flush().map_err(|e| self.io_error(e))
    }
}

/// Keeps every event in memory. Handy for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<OutputEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl OutputSink for MemorySink {
    fn emit(&self, event: &OutputEvent) -> Result<(), OutputError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Xml,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "text" | "txt" => Some(Self::Text),
            "json" => Some(Self::Json),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }
}

pub fn infer_format_from_path(path: &str) -> Option<OutputFormat> {
    let lower = path.trim().to_lowercase();
    if lower.ends_with(".json") {
        return Some(OutputFormat::Json);
    }
    if lower.ends_with(".xml") {
        return Some(OutputFormat::Xml);
    }
    if lower.ends_with(".txt") {
        return Some(OutputFormat::Text);
    }
    None
}

pub fn render(format: OutputFormat, summary: &ScanSummary, findings: &[Finding]) -> Vec<u8> {
    match format {
        OutputFormat::Text => render_text(summary, findings),
        OutputFormat::Json => render_json(summary, findings),
        OutputFormat::Xml => render_xml(summary, findings),
    }
}

pub fn render_text(summary: &ScanSummary, findings: &[Finding]) -> Vec<u8> {
    let mut out = String::new();
    for f in findings {
        out.push_str(&format!(
            "[{}] {} :: {} {}\n",
            f.severity.as_str(),
            f.name,
            f.method,
            f.url
        ));
        out.push_str(&format!("    {}\n", f.description));
    }
    if !findings.is_empty() {
        out.push('\n');
    }
    let c = &summary.counters;
    let a = &summary.admission;
    out.push_str(&format!(
        "scan {} in {}ms\n",
        if summary.cancelled { "cancelled" } else { "completed" },
        summary.elapsed_ms
    ));
    out.push_str(&format!(
        "requests: {} (probes {}), findings: {}\n",
        summary.requests, summary.probes, c.findings
    ));
    out.push_str(&format!(
        "grep admission: accepted {}, load-shed {}, seen-url {}, seen-body {}, out-of-scope {}\n",
        a.accepted, a.load_shed, a.seen_url, a.seen_body, a.out_of_scope
    ));
    out.push_str(&format!(
        "failed: fetch {}, parser {} (timeout {}, memory {}, crash {}, too-large {}), plugin {}\n",
        c.fetch_failures,
        c.parser_failures(),
        c.parser_timeouts,
        c.parser_memory,
        c.parser_crashes,
        c.parser_too_large,
        c.plugin_errors
    ));
    out.push_str(&format!(
        "skipped: not-found {}, dropped {}\n",
        c.not_found_skips, c.dropped
    ));
    for d in &summary.degraded {
        out.push_str(&format!("degraded: {} ({})\n", d.stage, d.reason));
    }
    out.into_bytes()
}

#[derive(Serialize)]
struct Report<'a> {
    summary: &'a ScanSummary,
    findings: &'a [Finding],
}

pub fn render_json(summary: &ScanSummary, findings: &[Finding]) -> Vec<u8> {
    serde_json::to_vec_pretty(&Report { summary, findings }).unwrap_or_else(|_| b"{}\n".to_vec())
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn render_xml(summary: &ScanSummary, findings: &[Finding]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    out.push('\n');
    out.push_str(&format!(
        "<scan elapsed_ms=\"{}\" cancelled=\"{}\" requests=\"{}\">\n",
        summary.elapsed_ms, summary.cancelled, summary.requests
    ));
    out.push_str("  <findings>\n");
    for f in findings {
        out.push_str(&format!(
            "    <finding plugin=\"{}\" severity=\"{}\">\n",
            escape_xml(&f.plugin),
            f.severity.as_str()
        ));
        out.push_str(&format!("      <name>{}</name>\n", escape_xml(&f.name)));
        out.push_str(&format!("      <method>{}</method>\n", escape_xml(&f.method)));
        out.push_str(&format!("      <url>{}</url>\n", escape_xml(&f.url)));
        out.push_str(&format!(
            "      <description>{}</description>\n",
            escape_xml(&f.description)
        ));
        if let Some(evidence) = f.evidence.as_deref() {
            out.push_str(&format!("      <evidence>{}</evidence>\n", escape_xml(evidence)));
        }
        out.push_str("    </finding>\n");
    }
    out.push_str("  </findings>\n");
    out.push_str("  <degraded>\n");
    for d in &summary.degraded {
        out.push_str(&format!(
            "    <stage name=\"{}\">{}</stage>\n",
            d.stage,
            escape_xml(&d.reason)
        ));
    }
    out.push_str("  </degraded>\n");
    out.push_str("</scan>\n");
    out.into_bytes()
}
