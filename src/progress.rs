//! Ingestion progress reporting.
//!
//! Progress goes to **stderr** so the per-document report on stdout stays
//! parseable for scripts.

use std::io::{IsTerminal, Write};

use docqa_core::models::IngestStatus;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Walking the document root. Total unknown.
    Scanning { root: String },
    /// `n` of `total` documents finished; `document_id` just did.
    Document {
        n: u64,
        total: u64,
        document_id: String,
        status: IngestStatus,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// `ingest  1,234 / 5,000  hr/leave.pdf  success`
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Scanning { root } => format!("scan {}  discovering...\n", root),
            IngestProgressEvent::Document {
                n,
                total,
                document_id,
                status,
            } => format!(
                "ingest  {} / {}  {}  {}\n",
                format_number(*n),
                format_number(*total),
                document_id,
                status
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Scanning { root } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root,
            }),
            IngestProgressEvent::Document {
                n,
                total,
                document_id,
                status,
            } => serde_json::json!({
                "event": "progress",
                "phase": "ingesting",
                "n": n,
                "total": total,
                "document_id": document_id,
                "status": status,
            }),
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", obj);
        let _ = err.flush();
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
