//! Embed and associate progress reporting.
//!
//! Long-running batch loops report how far they are so users can see what is
//! left. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

use crate::models::EntityKind;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// `n` of `total` pending entities of `kind` embedded so far.
    Embedding { kind: EntityKind, n: u64, total: u64 },
    /// Building the nearest-neighbor index over `issues` vectors.
    Indexing { backend: String, issues: u64 },
    /// `n` of `total` signals scored against the issue set.
    Scoring { backend: String, n: u64, total: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "associate exhaustive  scoring  1,234 / 5,000 signals".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Embedding { kind, n, total } => format!(
                "embed {}s  {} / {}\n",
                kind,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Indexing { backend, issues } => format!(
                "associate {}  indexing {} issues...\n",
                backend,
                format_number(*issues)
            ),
            ProgressEvent::Scoring { backend, n, total } => format!(
                "associate {}  scoring  {} / {} signals\n",
                backend,
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
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Embedding { kind, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "kind": kind,
                "n": n,
                "total": total
            }),
            ProgressEvent::Indexing { backend, issues } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "backend": backend,
                "issues": issues
            }),
            ProgressEvent::Scoring { backend, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "scoring",
                "backend": backend,
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
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// How often the scoring loop reports, in signals.
pub const SCORING_REPORT_EVERY: u64 = 100;

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

impl std::str::FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("Unknown progress mode: {}. Use off, human, or json.", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert_eq!("off".parse::<ProgressMode>().unwrap(), ProgressMode::Off);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}
