//! Failure classification and low-noise batched reporting.

use std::{collections::BTreeMap, sync::Mutex};

use crate::{
    domain::{FailureCategory, SendResult},
    sender::{Rejection, SendError},
};

pub const DEFAULT_BATCH_SIZE: usize = 20;

pub fn classify(err: &SendError) -> FailureCategory {
    match err {
        SendError::Cancelled => FailureCategory::Cancelled,
        SendError::Transport(_) => FailureCategory::Other,
        SendError::Rejected { kind, .. } => match kind {
            Rejection::Forbidden => FailureCategory::Forbidden,
            Rejection::RateLimited => FailureCategory::RateLimited,
            Rejection::ServerError => FailureCategory::ServerError,
            Rejection::Other => FailureCategory::Other,
        },
    }
}

pub fn category_for_status(status: u16) -> FailureCategory {
    match status {
        403 => FailureCategory::Forbidden,
        429 => FailureCategory::RateLimited,
        s if s >= 500 => FailureCategory::ServerError,
        _ => FailureCategory::Other,
    }
}

/// Classify an already-rendered error string (e.g. one read back from a report).
///
/// Pure function of its input.
pub fn classify_text(raw: &str) -> FailureCategory {
    let lower = raw.to_lowercase();

    if let Some(status) = find_http_status(&lower) {
        return category_for_status(status);
    }
    if lower.contains("cancelled") || lower.contains("canceled") || lower.contains("aborted") {
        return FailureCategory::Cancelled;
    }
    if lower.contains("forbidden") {
        return FailureCategory::Forbidden;
    }
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return FailureCategory::RateLimited;
    }
    if lower.contains("server error") {
        return FailureCategory::ServerError;
    }
    FailureCategory::Other
}

fn find_http_status(lower: &str) -> Option<u16> {
    let idx = lower.find("http ")?;
    let digits: String = lower[idx + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() != 3 {
        return None;
    }
    digits.parse().ok()
}

/// Results of a batch grouped by category, identities listed per bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategorySummary {
    pub sent: Vec<String>,
    pub failed: BTreeMap<FailureCategory, Vec<String>>,
}

impl CategorySummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a SendResult>) -> Self {
        let mut out = Self::default();
        for r in results {
            match r.category() {
                None => out.sent.push(r.identity.clone()),
                Some(cat) => out.failed.entry(cat).or_default().push(r.identity.clone()),
            }
        }
        out
    }

    pub fn failed_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    /// `sent=3 forbidden=1 [bob] rate_limited=2 [carol, dave]`
    pub fn render_line(&self) -> String {
        let mut parts = vec![format!("sent={}", self.sent.len())];
        for (cat, names) in &self.failed {
            parts.push(format!("{cat}={} [{}]", names.len(), names.join(", ")));
        }
        parts.join(" ")
    }
}

/// Accumulates processed results and logs them by category every `every` items.
///
/// Shared by all lanes of a run. Holding the lock only covers the push/take.
pub struct BatchReporter {
    label: String,
    every: usize,
    pending: Mutex<Vec<SendResult>>,
}

impl BatchReporter {
    pub fn new(label: impl Into<String>, every: usize) -> Self {
        Self {
            label: label.into(),
            every: every.max(1),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, result: &SendResult) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.push(result.clone());
            if pending.len() < self.every {
                return;
            }
            std::mem::take(&mut *pending)
        };
        self.emit(&batch);
    }

    /// Log whatever is left (called once at run completion).
    pub fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if !batch.is_empty() {
            self.emit(&batch);
        }
    }

    fn emit(&self, batch: &[SendResult]) {
        let summary = CategorySummary::from_results(batch);
        if summary.failed.is_empty() {
            tracing::info!(run = %self.label, batch = batch.len(), "{}", summary.render_line());
        } else {
            tracing::warn!(run = %self.label, batch = batch.len(), "{}", summary.render_line());
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}
