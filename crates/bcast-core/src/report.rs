//! Per-run reports written after a broadcast finishes.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    domain::{FailureCategory, RunId, SendResult},
    engine::{BroadcastTally, RunState},
    Result,
};

const MESSAGE_PREVIEW_CHARS: usize = 80;

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    pub finished_at: String,
    pub target: String,
    pub destination: String,
    pub state: RunState,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub failures: BTreeMap<FailureCategory, Vec<String>>,
    pub results: Vec<SendResult>,
    #[serde(skip)]
    finished: DateTime<Utc>,
}

impl RunReport {
    pub fn from_tally(tally: &BroadcastTally, run_id: Option<RunId>, finished: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.map(|r| r.0),
            finished_at: finished.to_rfc3339(),
            target: tally.target.name.clone(),
            destination: tally.target.destination.clone(),
            state: tally.state(),
            total: tally.total(),
            sent: tally.sent,
            failed: tally.failed,
            elapsed_ms: tally.elapsed.as_millis() as u64,
            failures: tally.summary().failed,
            results: tally.results.clone(),
            finished,
        }
    }

    pub fn file_name(&self, json: bool) -> String {
        let ts = self.finished.format("%Y%m%d-%H%M%S");
        let ext = if json { "json" } else { "txt" };
        match self.run_id {
            Some(id) => format!("broadcast-{ts}-{id}.{ext}"),
            None => format!("broadcast-{ts}.{ext}"),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Broadcast to {} ({})\nFinished: {}\nState: {:?}\nSent: {}/{}\nFailed: {}\nElapsed: {}ms\n",
            self.target,
            self.destination,
            self.finished_at,
            self.state,
            self.sent,
            self.total,
            self.failed,
            self.elapsed_ms,
        ));

        if !self.failures.is_empty() {
            out.push_str("\nFailures:\n");
            for (cat, names) in &self.failures {
                out.push_str(&format!("  {cat} ({}): {}\n", names.len(), names.join(", ")));
            }
        }

        out.push('\n');
        out.push_str(&"=".repeat(60));
        out.push('\n');
        for r in &self.results {
            let status = match r.category() {
                None => "sent".to_string(),
                Some(cat) => cat.to_string(),
            };
            let preview: String = r.message.chars().take(MESSAGE_PREVIEW_CHARS).collect();
            out.push_str(&format!("{:>4}  {:<20} {:<13} {preview}\n", r.ordinal, r.identity, status));
            if let crate::domain::Delivery::Failed { message, .. } = &r.delivery {
                out.push_str(&format!("      {message}\n"));
            }
        }
        out
    }
}

/// Write `report` into `dir` (created if missing) and return the file path.
pub fn write_report(dir: &Path, report: &RunReport, json: bool) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(report.file_name(json));
    let body = if json {
        serde_json::to_string_pretty(report)?
    } else {
        report.to_text()
    };
    fs::write(&path, body)?;
    tracing::info!(path = %path.display(), "run report written");
    Ok(path)
}
