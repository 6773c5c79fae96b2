//! Pipeline progress reporting.
//!
//! Reports what `copilot save` / `copilot update` are doing: fetching from
//! the source, merging item n of total, embedding batch n of total.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Querying the source. Total unknown.
    Fetching { location: String },
    /// n items of total walked by the hierarchy merger.
    Merging { location: String, n: u64, total: u64 },
    /// n batches of total embedded.
    Embedding { db_id: String, n: u64, total: u64 },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Human-friendly progress on stderr: "merge TSS  1,234 / 5,000 items".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Fetching { location } => format!("fetch {}  querying...\n", location),
            PipelineEvent::Merging { location, n, total } => format!(
                "merge {}  {} / {} items\n",
                location,
                format_number(*n),
                format_number(*total)
            ),
            PipelineEvent::Embedding { db_id, n, total } => format!(
                "embed {}  {} / {} batches\n",
                db_id,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineEvent) {
        let obj = match &event {
            PipelineEvent::Fetching { location } => serde_json::json!({
                "event": "progress",
                "phase": "fetching",
                "location": location
            }),
            PipelineEvent::Merging { location, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "merging",
                "location": location,
                "n": n,
                "total": total
            }),
            PipelineEvent::Embedding { db_id, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "db_id": db_id,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
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
