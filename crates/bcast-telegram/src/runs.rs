//! At most one broadcast at a time: bookkeeping, the run task and the
//! progress renderer.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use bcast_core::{
    classify::CategorySummary,
    domain::RunId,
    engine::{BroadcastTally, MessageProducer, RunState},
    messaging::{escape_html, ChatId, MessageRef, MessagingPort},
    progress::{ProgressEvent, ProgressSink, ProgressView, DEFAULT_PROGRESS_CAPACITY},
    report::{write_report, RunReport},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::router::AppState;

const NAMES_PER_CATEGORY: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedRun {
    pub id: RunId,
    pub target: String,
    pub state: RunState,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Idle {
        last: Option<FinishedRun>,
    },
    Running {
        id: RunId,
        target: String,
        total: usize,
        processed: usize,
        elapsed: Duration,
        stopping: bool,
    },
}

struct ActiveRun {
    id: RunId,
    target: String,
    total: usize,
    processed: usize,
    started: Instant,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveRun>,
    last: Option<FinishedRun>,
}

/// Owns the single active run's id and cancel token.
#[derive(Default)]
pub struct RunControl {
    next_id: AtomicU64,
    slot: Mutex<Slot>,
}

impl RunControl {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the run slot. Fails with the active run's id when busy.
    pub fn begin(&self, target: &str, total: usize) -> Result<(RunId, CancellationToken), RunId> {
        let mut slot = self.lock();
        if let Some(active) = &slot.active {
            return Err(active.id);
        }
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = CancellationToken::new();
        slot.active = Some(ActiveRun {
            id,
            target: target.to_string(),
            total,
            processed: 0,
            started: Instant::now(),
            cancel: cancel.clone(),
        });
        Ok((id, cancel))
    }

    /// Cancel the active run, if any.
    pub fn stop(&self) -> Option<RunId> {
        let slot = self.lock();
        let active = slot.active.as_ref()?;
        active.cancel.cancel();
        Some(active.id)
    }

    pub fn note_progress(&self, id: RunId, processed: usize) {
        let mut slot = self.lock();
        if let Some(active) = slot.active.as_mut().filter(|a| a.id == id) {
            active.processed = active.processed.max(processed);
        }
    }

    /// Release the slot. A stale id (not the active run) is ignored.
    pub fn finish(&self, id: RunId, tally: &BroadcastTally) {
        let mut slot = self.lock();
        if slot.active.as_ref().map(|a| a.id) != Some(id) {
            return;
        }
        slot.active = None;
        slot.last = Some(FinishedRun {
            id,
            target: tally.target.name.clone(),
            state: tally.state(),
            total: tally.total(),
            sent: tally.sent,
            failed: tally.failed,
        });
    }

    fn abandon(&self, id: RunId) {
        let mut slot = self.lock();
        if slot.active.as_ref().map(|a| a.id) == Some(id) {
            slot.active = None;
        }
    }

    pub fn status(&self) -> RunStatus {
        let slot = self.lock();
        match &slot.active {
            None => RunStatus::Idle {
                last: slot.last.clone(),
            },
            Some(a) => RunStatus::Running {
                id: a.id,
                target: a.target.clone(),
                total: a.total,
                processed: a.processed,
                elapsed: a.started.elapsed(),
                stopping: a.cancel.is_cancelled(),
            },
        }
    }
}

pub struct RunHandle {
    pub id: RunId,
    pub total: usize,
    pub task: JoinHandle<()>,
}

/// Snapshot the registry, reserve the run slot and spawn the run.
pub async fn start_broadcast(
    state: Arc<AppState>,
    chat_id: ChatId,
    target_name: &str,
    producer: Arc<dyn MessageProducer>,
    title: String,
) -> anyhow::Result<RunHandle> {
    let snapshot = state.registry.snapshot();
    let target = snapshot.target(target_name)?;
    let identities = snapshot.dispatch_set();
    if identities.is_empty() {
        bail!("no identities loaded");
    }
    let total = identities.len();
    let options = state.options();

    let (id, cancel) = state
        .runs
        .begin(&target.name, total)
        .map_err(|busy| anyhow!("broadcast {busy} is already running, /stop it first"))?;

    tracing::info!(run = %id, chat = %target.name, identities = total, "starting broadcast");

    let view = ProgressView::new(
        format!("Broadcast {id} → {}", target.name),
        state.cfg.progress_throttle,
    );
    let status_msg = match state.messenger.send_html(chat_id, &view.render()).await {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = %e, "could not post status message");
            None
        }
    };

    let (sink, rx) = ProgressSink::channel(DEFAULT_PROGRESS_CAPACITY);
    let renderer = tokio::spawn(render_progress(
        state.clone(),
        id,
        status_msg,
        rx,
        view,
    ));

    let task = tokio::spawn(async move {
        let out = state
            .engine
            .run(identities, target, producer, options, cancel, sink)
            .await;
        if let Err(e) = renderer.await {
            tracing::warn!(error = %e, "progress renderer failed");
        }

        let tally = match out {
            Ok(t) => t,
            Err(e) => {
                state.runs.abandon(id);
                let _ = state
                    .messenger
                    .send_html(chat_id, &format!("❌ {}", escape_html(&e.to_string())))
                    .await;
                return;
            }
        };

        state.runs.finish(id, &tally);
        let mut html = format_tally(id, &title, &tally);
        if let Some(note) = save_report(&state, id, &tally) {
            html.push_str(&note);
        }
        deliver(&*state.messenger, chat_id, status_msg, &html).await;
    });

    Ok(RunHandle { id, total, task })
}

async fn render_progress(
    state: Arc<AppState>,
    id: RunId,
    status_msg: Option<MessageRef>,
    mut rx: broadcast::Receiver<ProgressEvent>,
    mut view: ProgressView,
) {
    loop {
        match rx.recv().await {
            Ok(ev) => {
                state.runs.note_progress(id, ev.processed());
                view.observe(ev);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => view.note_lagged(n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let (Some(msg), Some(html)) = (status_msg, view.take_render(Instant::now())) else {
            continue;
        };
        if let Err(e) = state.messenger.edit_html(msg, &html).await {
            tracing::debug!(error = %e, "progress edit failed");
        }
    }
    if view.dropped() > 0 {
        tracing::debug!(run = %id, dropped = view.dropped(), "progress events coalesced");
    }
}

async fn deliver(
    messenger: &dyn MessagingPort,
    chat_id: ChatId,
    status_msg: Option<MessageRef>,
    html: &str,
) {
    if let Some(msg) = status_msg {
        if messenger.edit_html(msg, html).await.is_ok() {
            return;
        }
    }
    if let Err(e) = messenger.send_html(chat_id, html).await {
        tracing::warn!(error = %e, "could not deliver run summary");
    }
}

fn save_report(state: &AppState, id: RunId, tally: &BroadcastTally) -> Option<String> {
    let dir = state.cfg.report_dir.as_ref()?;
    let report = RunReport::from_tally(tally, Some(id), chrono::Utc::now());
    match write_report(dir, &report, state.cfg.report_json) {
        Ok(path) => Some(format!(
            "\n\n📄 Report: <code>{}</code>",
            escape_html(&path.display().to_string())
        )),
        Err(e) => {
            tracing::warn!(error = %e, "could not write run report");
            Some(format!("\n\n⚠️ Report failed: {}", escape_html(&e.to_string())))
        }
    }
}

pub fn format_tally(id: RunId, title: &str, tally: &BroadcastTally) -> String {
    let head = match tally.state() {
        RunState::Cancelled => format!("⏹ <b>Broadcast {id} stopped</b>"),
        _ => format!("✅ <b>Broadcast {id} finished</b>"),
    };
    let mut lines = vec![
        head,
        String::new(),
        format!("Target: <code>{}</code>", escape_html(&tally.target.name)),
        format!("Message: {}", escape_html(title)),
        format!("✅ Sent: {}/{}", tally.sent, tally.total()),
        format!("❌ Failed: {}", tally.failed),
        format!("⏱ {:.1}s", tally.elapsed.as_secs_f64()),
    ];

    let summary = CategorySummary::from_results(&tally.results);
    if !summary.failed.is_empty() {
        lines.push(String::new());
        for (cat, names) in &summary.failed {
            let mut shown: Vec<String> = names
                .iter()
                .take(NAMES_PER_CATEGORY)
                .map(|n| escape_html(n))
                .collect();
            if names.len() > NAMES_PER_CATEGORY {
                shown.push(format!("+{} more", names.len() - NAMES_PER_CATEGORY));
            }
            lines.push(format!("• {cat} ({}): {}", names.len(), shown.join(", ")));
        }
    }
    lines.join("\n")
}
