//! Broadcast engine: one message from every identity in a fixed snapshot.
//!
//! Identities are split into `concurrency` lanes by `ordinal % concurrency`.
//! Each lane is its own tokio task and walks its ordinals in order, sending,
//! recording, reporting progress and pacing. Lanes share only the write-once
//! result slots (each lane owns a disjoint set of indices) and the atomic
//! counters; no lane ever waits on another.
//!
//! Cancellation is a [`CancellationToken`]: level-triggered, never reset.
//! Lanes check it before every item, it aborts in-flight sends through the
//! sender, and it cuts pacing sleeps short.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    classify::{BatchReporter, CategorySummary, DEFAULT_BATCH_SIZE},
    domain::{FailureCategory, SendResult, Target},
    errors::Error,
    progress::{ProgressEvent, ProgressSink},
    sender::MessageSender,
    Result,
};

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_millis(200);

// ============== Message Producers ==============

/// Builds the text each identity sends, as a pure function of position.
pub trait MessageProducer: Send + Sync {
    fn produce(&self, identity: &str, ordinal: usize) -> String;
}

impl<F> MessageProducer for F
where
    F: Fn(&str, usize) -> String + Send + Sync,
{
    fn produce(&self, identity: &str, ordinal: usize) -> String {
        self(identity, ordinal)
    }
}

/// Same text for everyone.
#[derive(Clone, Debug)]
pub struct FixedMessage(pub String);

impl MessageProducer for FixedMessage {
    fn produce(&self, _identity: &str, _ordinal: usize) -> String {
        self.0.clone()
    }
}

/// `base + " " + slots[ordinal % slots.len()]`.
#[derive(Clone, Debug)]
pub struct SlotRotation {
    base: String,
    slots: Vec<String>,
}

impl SlotRotation {
    pub fn new(base: impl Into<String>, slots: Vec<String>) -> Result<Self> {
        let slots: Vec<String> = slots
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if slots.is_empty() {
            return Err(Error::EmptyTemplateSet);
        }
        Ok(Self {
            base: base.into().trim().to_string(),
            slots,
        })
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }
}

impl MessageProducer for SlotRotation {
    fn produce(&self, _identity: &str, ordinal: usize) -> String {
        let slot = &self.slots[ordinal % self.slots.len()];
        if self.base.is_empty() {
            slot.clone()
        } else {
            format!("{} {slot}", self.base)
        }
    }
}

// ============== Options ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// Fixed pause between a lane's items.
    Fixed(Duration),
    /// Uniformly random pause in `[min, max]`.
    Random { min: Duration, max: Duration },
}

impl Pacing {
    fn next_delay(&self) -> Duration {
        match *self {
            Pacing::Fixed(d) => d,
            Pacing::Random { min, max } => {
                if max <= min {
                    return min;
                }
                let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
                Duration::from_millis(ms as u64)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastOptions {
    pub concurrency: usize,
    pub pacing: Pacing,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            pacing: Pacing::Fixed(DEFAULT_ITEM_DELAY),
        }
    }
}

impl BroadcastOptions {
    /// Build from loosely-typed inputs (config, chat commands). At most one of
    /// `delay` / `random_delay` may be set; with neither the default delay applies.
    pub fn from_parts(
        concurrency: usize,
        delay: Option<Duration>,
        random_delay: Option<(Duration, Duration)>,
    ) -> Result<Self> {
        let pacing = match (delay, random_delay) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidOptions(
                    "fixed delay and random delay are mutually exclusive".to_string(),
                ))
            }
            (Some(d), None) => Pacing::Fixed(d),
            (None, Some((min, max))) => Pacing::Random { min, max },
            (None, None) => Pacing::Fixed(DEFAULT_ITEM_DELAY),
        };
        let opts = Self {
            concurrency,
            pacing,
        };
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(Error::InvalidOptions(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if let Pacing::Random { min, max } = self.pacing {
            if min > max {
                return Err(Error::InvalidOptions(format!(
                    "random delay min ({}ms) exceeds max ({}ms)",
                    min.as_millis(),
                    max.as_millis()
                )));
            }
        }
        Ok(())
    }
}

// ============== Tally ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Final result of one run. Immutable once returned.
#[derive(Clone, Debug, Serialize)]
pub struct BroadcastTally {
    pub target: Target,
    pub sent: usize,
    pub failed: usize,
    pub results: Vec<SendResult>,
    pub stopped: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BroadcastTally {
    fn empty(target: Target) -> Self {
        Self {
            target,
            sent: 0,
            failed: 0,
            results: Vec::new(),
            stopped: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn state(&self) -> RunState {
        if self.stopped {
            RunState::Cancelled
        } else {
            RunState::Completed
        }
    }

    pub fn summary(&self) -> CategorySummary {
        CategorySummary::from_results(&self.results)
    }

    pub fn breakdown(&self) -> BTreeMap<FailureCategory, usize> {
        self.summary()
            .failed
            .into_iter()
            .map(|(cat, names)| (cat, names.len()))
            .collect()
    }
}

// ============== Engine ==============

#[derive(Clone, Debug)]
pub struct BroadcastEngine {
    report_every: usize,
}

impl Default for BroadcastEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

struct RunShared {
    target: Target,
    producer: Arc<dyn MessageProducer>,
    pacing: Pacing,
    cancel: CancellationToken,
    progress: ProgressSink,
    reporter: BatchReporter,
    total: usize,
    slots: Vec<OnceLock<SendResult>>,
    sent: AtomicUsize,
    failed: AtomicUsize,
    stopped: AtomicBool,
}

impl RunShared {
    fn record(&self, result: SendResult) {
        let (sent_so_far, failed_so_far) = if result.is_sent() {
            let s = self.sent.fetch_add(1, Ordering::AcqRel) + 1;
            (s, self.failed.load(Ordering::Acquire))
        } else {
            let f = self.failed.fetch_add(1, Ordering::AcqRel) + 1;
            (self.sent.load(Ordering::Acquire), f)
        };

        self.reporter.record(&result);

        let event = ProgressEvent {
            identity: result.identity.clone(),
            ordinal: result.ordinal,
            total: self.total,
            sent_so_far,
            failed_so_far,
            last: result.clone(),
        };
        self.store(result);
        self.progress.emit(event);
    }

    fn record_skipped(&self, identity: &str, ordinal: usize) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.store(SendResult::cancelled(identity, ordinal));
    }

    fn store(&self, result: SendResult) {
        let ordinal = result.ordinal;
        if self.slots[ordinal].set(result).is_err() {
            tracing::error!(ordinal, "result slot written twice");
            debug_assert!(false, "result slot {ordinal} written twice");
        }
    }
}

impl BroadcastEngine {
    /// `report_every`: how many processed items per batched category log line.
    pub fn new(report_every: usize) -> Self {
        Self {
            report_every: report_every.max(1),
        }
    }

    /// Fan `producer`'s message out from every identity to `target`.
    ///
    /// Fails only on invalid `options`; per-identity failures end up in the
    /// returned tally.
    pub async fn run(
        &self,
        identities: Vec<Arc<dyn MessageSender>>,
        target: Target,
        producer: Arc<dyn MessageProducer>,
        options: BroadcastOptions,
        cancel: CancellationToken,
        progress: ProgressSink,
    ) -> Result<BroadcastTally> {
        options.validate()?;

        let total = identities.len();
        if total == 0 {
            tracing::info!(chat = %target.name, "no identities, nothing to send");
            return Ok(BroadcastTally::empty(target));
        }

        let started = Instant::now();
        let lanes = options.concurrency.min(total);
        tracing::info!(
            chat = %target.name,
            identities = total,
            lanes,
            pacing = ?options.pacing,
            "broadcast started"
        );

        let shared = Arc::new(RunShared {
            reporter: BatchReporter::new(target.name.clone(), self.report_every),
            target,
            producer,
            pacing: options.pacing,
            cancel,
            progress,
            total,
            slots: (0..total).map(|_| OnceLock::new()).collect(),
            sent: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        let identities = Arc::new(identities);

        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let shared = shared.clone();
            let identities = identities.clone();
            handles.push(tokio::spawn(async move {
                run_lane(lane, lanes, &identities, &shared).await;
            }));
        }
        for (lane, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                tracing::error!(lane, error = %e, "lane task failed");
            }
        }

        shared.reporter.flush();

        let results: Vec<SendResult> = shared
            .slots
            .iter()
            .enumerate()
            .map(|(ordinal, slot)| {
                slot.get()
                    .cloned()
                    .unwrap_or_else(|| SendResult::cancelled(identities[ordinal].name(), ordinal))
            })
            .collect();
        let sent = results.iter().filter(|r| r.is_sent()).count();

        let tally = BroadcastTally {
            target: shared.target.clone(),
            sent,
            failed: total - sent,
            results,
            stopped: shared.stopped.load(Ordering::Acquire),
            elapsed: started.elapsed(),
        };

        tracing::info!(
            chat = %tally.target.name,
            sent = tally.sent,
            failed = tally.failed,
            stopped = tally.stopped,
            elapsed_ms = tally.elapsed.as_millis() as u64,
            "broadcast finished"
        );
        Ok(tally)
    }
}

async fn run_lane(
    lane: usize,
    lanes: usize,
    identities: &[Arc<dyn MessageSender>],
    shared: &RunShared,
) {
    let ordinals: Vec<usize> = (lane..identities.len()).step_by(lanes).collect();

    for (pos, &ordinal) in ordinals.iter().enumerate() {
        if shared.cancel.is_cancelled() {
            shared.stopped.store(true, Ordering::Release);
            for &rest in &ordinals[pos..] {
                shared.record_skipped(identities[rest].name(), rest);
            }
            tracing::info!(lane, skipped = ordinals.len() - pos, "lane stopped");
            return;
        }

        let sender = &identities[ordinal];
        let message = shared.producer.produce(sender.name(), ordinal);
        let delivery = sender
            .send(&shared.target.destination, &message, &shared.cancel)
            .await;

        // A cancel seen during the send (in flight or in backoff) stops the run
        // whatever the recorded category.
        if shared.cancel.is_cancelled() {
            shared.stopped.store(true, Ordering::Release);
        }

        shared.record(SendResult {
            identity: sender.name().to_string(),
            ordinal,
            message,
            delivery,
        });

        if pos + 1 < ordinals.len() {
            let delay = shared.pacing.next_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = shared.cancel.cancelled() => {}
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::Delivery;

    /// Mock sender: fixed latency, optional fixed failure, records messages.
    struct MockSender {
        name: String,
        latency: Duration,
        fail_status: Option<FailureCategory>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, String)>>,
        after_send: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl MockSender {
        fn ok(name: &str, latency: Duration) -> Self {
            Self {
                name: name.to_string(),
                latency,
                fail_status: None,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                after_send: None,
            }
        }

        fn failing(name: &str, category: FailureCategory) -> Self {
            Self {
                fail_status: Some(category),
                ..Self::ok(name, Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl MessageSender for MockSender {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(
            &self,
            destination: &str,
            message: &str,
            cancel: &CancellationToken,
        ) -> Delivery {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((destination.to_string(), message.to_string()));

            if !self.latency.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Delivery::failed(FailureCategory::Cancelled, format!("[{}] cancelled", self.name));
                    }
                    _ = sleep(self.latency) => {}
                }
            }

            if let Some(f) = &self.after_send {
                f();
            }

            match self.fail_status {
                None => Delivery::Sent {
                    payload: "{}".to_string(),
                },
                Some(cat) => Delivery::failed(cat, format!("[{}] HTTP 403 forbidden", self.name)),
            }
        }
    }

    fn as_dyn(senders: Vec<Arc<MockSender>>) -> Vec<Arc<dyn MessageSender>> {
        senders
            .into_iter()
            .map(|s| s as Arc<dyn MessageSender>)
            .collect()
    }

    fn opts(concurrency: usize, delay_ms: u64) -> BroadcastOptions {
        BroadcastOptions {
            concurrency,
            pacing: Pacing::Fixed(Duration::from_millis(delay_ms)),
        }
    }

    fn target() -> Target {
        Target::new("general", "chan-1")
    }

    async fn run(
        senders: Vec<Arc<dyn MessageSender>>,
        producer: Arc<dyn MessageProducer>,
        options: BroadcastOptions,
        cancel: CancellationToken,
    ) -> BroadcastTally {
        BroadcastEngine::default()
            .run(
                senders,
                target(),
                producer,
                options,
                cancel,
                ProgressSink::disabled(),
            )
            .await
            .unwrap()
    }

    fn fixed(msg: &str) -> Arc<dyn MessageProducer> {
        Arc::new(FixedMessage(msg.to_string()))
    }

    #[tokio::test]
    async fn empty_input_returns_zero_tally() {
        let t = run(vec![], fixed("hi"), opts(3, 0), CancellationToken::new()).await;
        assert_eq!((t.sent, t.failed, t.stopped), (0, 0, false));
        assert!(t.results.is_empty());
        assert_eq!(t.state(), RunState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_succeed_in_parallel_lanes() {
        let senders: Vec<Arc<MockSender>> = (0..10)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::from_millis(10))))
            .collect();
        let delay = Duration::from_millis(5);

        let start = Instant::now();
        let t = run(
            as_dyn(senders.clone()),
            fixed("hello"),
            opts(3, delay.as_millis() as u64),
            CancellationToken::new(),
        )
        .await;
        let wall = start.elapsed();

        assert_eq!((t.sent, t.failed, t.stopped), (10, 0, false));
        // (n / c + 1) item slots, plus timer slack; sequential would be 145ms.
        let bound = (Duration::from_millis(10) + delay).mul_f64(10.0 / 3.0 + 1.0)
            + Duration::from_millis(20);
        assert!(wall < bound, "wall {wall:?} >= bound {bound:?}");
        for s in &senders {
            assert_eq!(s.calls.load(Ordering::SeqCst), 1);
            assert_eq!(s.seen.lock().unwrap()[0].0, "chan-1");
        }
    }

    #[tokio::test]
    async fn single_forbidden_identity_is_counted() {
        let senders: Vec<Arc<MockSender>> = (0..5)
            .map(|i| {
                if i == 2 {
                    Arc::new(MockSender::failing("id2", FailureCategory::Forbidden))
                } else {
                    Arc::new(MockSender::ok(&format!("id{i}"), Duration::ZERO))
                }
            })
            .collect();
        let t = run(as_dyn(senders), fixed("m"), opts(5, 0), CancellationToken::new()).await;

        assert_eq!((t.sent, t.failed), (4, 1));
        assert_eq!(t.results[2].category(), Some(FailureCategory::Forbidden));
        assert_eq!(t.breakdown().get(&FailureCategory::Forbidden), Some(&1));
    }

    #[tokio::test]
    async fn cancel_after_two_marks_rest_cancelled() {
        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicUsize::new(0));

        let senders: Vec<Arc<MockSender>> = (0..6)
            .map(|i| {
                let mut s = MockSender::ok(&format!("id{i}"), Duration::ZERO);
                let cancel = cancel.clone();
                let done = done.clone();
                s.after_send = Some(Box::new(move || {
                    if done.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        cancel.cancel();
                    }
                }));
                Arc::new(s)
            })
            .collect();

        let t = run(as_dyn(senders.clone()), fixed("m"), opts(1, 1), cancel).await;

        assert!(t.stopped);
        assert_eq!(t.state(), RunState::Cancelled);
        assert_eq!(t.sent + t.failed, 6);
        assert_eq!(t.sent, 2);
        assert_eq!(t.results.len(), 6);
        for r in &t.results[2..] {
            assert_eq!(r.category(), Some(FailureCategory::Cancelled));
        }
        for s in &senders[2..] {
            assert_eq!(s.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_mid_flight_fills_every_slot_once() {
        let cancel = CancellationToken::new();
        let senders: Vec<Arc<MockSender>> = (0..40)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::from_millis(15))))
            .collect();

        let c2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(40)).await;
            c2.cancel();
        });

        let t = run(as_dyn(senders), fixed("m"), opts(4, 5), cancel).await;

        assert!(t.stopped);
        assert_eq!(t.results.len(), 40);
        assert_eq!(t.sent + t.failed, 40);
        let ordinals: HashSet<usize> = t.results.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals.len(), 40);
        for (i, r) in t.results.iter().enumerate() {
            assert_eq!(r.ordinal, i);
            assert_eq!(r.identity, format!("id{i}"));
        }
        assert!(t
            .results
            .iter()
            .any(|r| r.category() == Some(FailureCategory::Cancelled)));
    }

    #[tokio::test]
    async fn slot_rotation_is_independent_of_concurrency() {
        let rotation: Arc<dyn MessageProducer> = Arc::new(
            SlotRotation::new("hello", vec!["a".into(), "b".into(), "c".into()]).unwrap(),
        );

        let mut per_run = Vec::new();
        for concurrency in [1, 4] {
            let senders: Vec<Arc<MockSender>> = (0..7)
                .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::ZERO)))
                .collect();
            let t = run(
                as_dyn(senders),
                rotation.clone(),
                opts(concurrency, 0),
                CancellationToken::new(),
            )
            .await;
            let messages: Vec<String> = t.results.iter().map(|r| r.message.clone()).collect();
            per_run.push(messages);
        }

        assert_eq!(per_run[0], per_run[1]);
        assert_eq!(
            per_run[0],
            vec![
                "hello a", "hello b", "hello c", "hello a", "hello b", "hello c", "hello a"
            ]
        );
    }

    #[tokio::test]
    async fn lanes_follow_static_partition() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        let producer: Arc<dyn MessageProducer> = Arc::new(move |name: &str, ordinal: usize| {
            order2.lock().unwrap().push(ordinal);
            format!("{name}:{ordinal}")
        });
        let senders: Vec<Arc<MockSender>> = (0..9)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::ZERO)))
            .collect();

        let t = run(as_dyn(senders), producer, opts(3, 0), CancellationToken::new()).await;
        assert_eq!(t.sent, 9);

        let order = order.lock().unwrap().clone();
        for lane in 0..3 {
            let lane_items: Vec<usize> = order.iter().copied().filter(|o| o % 3 == lane).collect();
            let mut sorted = lane_items.clone();
            sorted.sort_unstable();
            assert_eq!(lane_items, sorted, "lane {lane} out of order");
        }
        assert_eq!(t.results[4].message, "id4:4");
    }

    #[tokio::test]
    async fn progress_events_report_counters() {
        let (sink, mut rx) = ProgressSink::channel(64);
        let senders: Vec<Arc<MockSender>> = (0..3)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::ZERO)))
            .collect();

        let t = BroadcastEngine::new(2)
            .run(
                as_dyn(senders),
                target(),
                fixed("m"),
                opts(1, 0),
                CancellationToken::new(),
                sink,
            )
            .await
            .unwrap();
        assert_eq!(t.sent, 3);

        let mut events = Vec::new();
        while let Ok(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].sent_so_far, 3);
        assert_eq!(events[2].total, 3);
        assert_eq!(events[0].identity, "id0");
    }

    #[tokio::test]
    async fn invalid_options_fail_before_dispatch() {
        let s = Arc::new(MockSender::ok("a", Duration::ZERO));
        let err = BroadcastEngine::default()
            .run(
                as_dyn(vec![s.clone()]),
                target(),
                fixed("m"),
                opts(0, 0),
                CancellationToken::new(),
                ProgressSink::disabled(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
        assert_eq!(s.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_marks_run_stopped() {
        use crate::{
            domain::Identity,
            retry::RetryPolicy,
            sender::{
                tests::{status, ScriptedTransport},
                Sender,
            },
        };

        let transport = Arc::new(ScriptedTransport::new(vec![
            status(500, "oops"),
            status(500, "oops"),
            status(500, "oops"),
        ]));
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(8),
        };
        let sender: Arc<dyn MessageSender> = Arc::new(Sender::new(
            Identity::new("solo", "tok"),
            transport.clone(),
            retry,
        ));

        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            c2.cancel();
        });

        let t = run(vec![sender], fixed("m"), opts(1, 0), cancel).await;

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(t.results[0].category(), Some(FailureCategory::ServerError));
        assert!(t.stopped);
        assert_eq!(t.state(), RunState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn no_pause_after_a_lane_finishes() {
        let long = Duration::from_secs(10);
        let options = BroadcastOptions {
            concurrency: 3,
            pacing: Pacing::Fixed(long),
        };

        let senders: Vec<Arc<MockSender>> = (0..3)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::from_millis(10))))
            .collect();
        let start = tokio::time::Instant::now();
        let t = run(as_dyn(senders), fixed("m"), options, CancellationToken::new()).await;
        assert_eq!(t.sent, 3);
        assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());

        // Two items per lane: exactly one pause each.
        let senders: Vec<Arc<MockSender>> = (0..4)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::from_millis(10))))
            .collect();
        let start = tokio::time::Instant::now();
        let t = run(
            as_dyn(senders),
            fixed("m"),
            BroadcastOptions {
                concurrency: 2,
                ..options
            },
            CancellationToken::new(),
        )
        .await;
        assert_eq!(t.sent, 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= long && elapsed < long * 2, "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn random_pacing_gaps_stay_in_range() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(300);
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let stamps2 = stamps.clone();
        let producer: Arc<dyn MessageProducer> = Arc::new(move |_: &str, ordinal: usize| {
            stamps2
                .lock()
                .unwrap()
                .push((ordinal, tokio::time::Instant::now()));
            "m".to_string()
        });
        let senders: Vec<Arc<MockSender>> = (0..6)
            .map(|i| Arc::new(MockSender::ok(&format!("id{i}"), Duration::ZERO)))
            .collect();

        let t = run(
            as_dyn(senders),
            producer,
            BroadcastOptions {
                concurrency: 1,
                pacing: Pacing::Random { min, max },
            },
            CancellationToken::new(),
        )
        .await;
        assert_eq!(t.sent, 6);

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 6);
        for pair in stamps.windows(2) {
            assert_eq!(pair[0].0 + 1, pair[1].0);
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= min && gap <= max, "gap {gap:?}");
        }
    }

    #[test]
    fn options_from_parts() {
        let both = BroadcastOptions::from_parts(
            2,
            Some(Duration::from_millis(10)),
            Some((Duration::from_millis(1), Duration::from_millis(2))),
        );
        assert!(matches!(both, Err(Error::InvalidOptions(_))));

        let inverted = BroadcastOptions::from_parts(
            2,
            None,
            Some((Duration::from_millis(50), Duration::from_millis(10))),
        );
        assert!(matches!(inverted, Err(Error::InvalidOptions(_))));

        let default = BroadcastOptions::from_parts(5, None, None).unwrap();
        assert_eq!(default, BroadcastOptions::default());
    }

    #[test]
    fn slot_rotation_rejects_empty_list() {
        assert!(matches!(
            SlotRotation::new("base", vec![" ".into(), String::new()]),
            Err(Error::EmptyTemplateSet)
        ));
    }

    #[test]
    fn random_pacing_stays_in_range() {
        let p = Pacing::Random {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..100 {
            let d = p.next_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }
}
