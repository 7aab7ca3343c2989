//! Progress events out of a running broadcast, and the coalescing view the
//! control surface renders from.
//!
//! The engine emits at most one event per processed identity into a bounded
//! `tokio::sync::broadcast` channel. Emitting never waits: when the channel is
//! full the oldest pending event is overwritten and the receiver observes a
//! lag. Throttling of UI updates happens on the receiving side in
//! [`ProgressView`].

use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::{domain::SendResult, messaging::escape_html};

pub const DEFAULT_PROGRESS_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub identity: String,
    pub ordinal: usize,
    pub total: usize,
    pub sent_so_far: usize,
    pub failed_so_far: usize,
    pub last: SendResult,
}

impl ProgressEvent {
    pub fn processed(&self) -> usize {
        self.sent_so_far + self.failed_so_far
    }
}

/// Fire-and-forget handle the engine writes progress into.
#[derive(Clone, Debug, Default)]
pub struct ProgressSink {
    tx: Option<broadcast::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<ProgressEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // No receiver is fine: progress is diagnostic only.
            let _ = tx.send(event);
        }
    }
}

/// Coalesces progress events and decides when a re-render is due.
#[derive(Clone, Debug)]
pub struct ProgressView {
    title: String,
    min_interval: Duration,
    latest: Option<ProgressEvent>,
    last_render: Option<Instant>,
    dirty: bool,
    dropped: u64,
}

impl ProgressView {
    pub fn new(title: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            title: title.into(),
            min_interval,
            latest: None,
            last_render: None,
            dirty: false,
            dropped: 0,
        }
    }

    /// Keep the most advanced event. Lanes report independently, so an older
    /// counter snapshot can arrive after a newer one.
    pub fn observe(&mut self, event: ProgressEvent) {
        let newer = self
            .latest
            .as_ref()
            .map(|cur| event.processed() >= cur.processed())
            .unwrap_or(true);
        if newer {
            self.latest = Some(event);
            self.dirty = true;
        }
    }

    pub fn note_lagged(&mut self, skipped: u64) {
        self.dropped += skipped;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn latest(&self) -> Option<&ProgressEvent> {
        self.latest.as_ref()
    }

    /// Rendered text if something changed and the throttle window has passed.
    pub fn take_render(&mut self, now: Instant) -> Option<String> {
        if !self.dirty {
            return None;
        }
        if let Some(prev) = self.last_render {
            if now.saturating_duration_since(prev) < self.min_interval {
                return None;
            }
        }
        self.dirty = false;
        self.last_render = Some(now);
        Some(self.render())
    }

    pub fn render(&self) -> String {
        let title = escape_html(&self.title);
        let Some(ev) = self.latest.as_ref() else {
            return format!("📤 <b>{title}</b>\n\nStarting…");
        };

        let processed = ev.processed();
        let pct = if ev.total == 0 {
            100
        } else {
            processed * 100 / ev.total
        };
        let last_status = if ev.last.is_sent() {
            "✅".to_string()
        } else {
            ev.last
                .category()
                .map(|c| format!("❌ {c}"))
                .unwrap_or_default()
        };

        format!(
            "📤 <b>{title}</b>\n\n{bar} {pct}%\nProgress: {processed}/{total}\n✅ Sent: {sent}\n❌ Failed: {failed}\n\nLast: <code>{who}</code> {last_status}",
            bar = progress_bar(processed, ev.total, 12),
            total = ev.total,
            sent = ev.sent_so_far,
            failed = ev.failed_so_far,
            who = escape_html(&ev.identity),
        )
    }
}

fn progress_bar(done: usize, total: usize, width: usize) -> String {
    let filled = if total == 0 {
        width
    } else {
        (done.min(total) * width) / total
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}
