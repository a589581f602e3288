//! Paced dispatch — delays notification jobs and fans them out to the sink.
//!
//! ```text
//! schedule(jobs, base, delay)
//!   └── job i gets not_before = base + i * delay   (empty jobs take no slot)
//!         └── timer loop (min-heap on not_before, FIFO on ties)
//!               └── worker per due job
//!                     └── chunks of `chunk_size` recipients, sent back to back
//!                           └── each send: semaphore permit + timeout
//! ```
//!
//! Pacing applies between jobs only. Sends inside a job are bounded by the
//! global concurrency limit, never delayed on purpose.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use procharity_core::config::DispatchConfig;
use procharity_core::traits::{DeliveryLog, DeliverySink};
use procharity_core::types::{DeliveryReport, RecipientId};

use crate::notify::{DeliveryHistory, NotificationJob};

/// Lifecycle of the dispatcher's timer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    /// Fire everything already queued, then stop.
    Draining,
    /// Admit nothing new; in-flight sends finish.
    Stopped,
}

/// Heap entry ordered by (not_before, seq).
struct QueuedJob {
    not_before: Instant,
    seq: u64,
    job: NotificationJob,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.not_before
            .cmp(&other.not_before)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub cancelled: usize,
}

struct Inner {
    sink: Arc<dyn DeliverySink>,
    log: Option<Arc<dyn DeliveryLog>>,
    chunk_size: usize,
    send_timeout: Duration,
    queue: Mutex<BinaryHeap<Reverse<QueuedJob>>>,
    wake: Notify,
    permits: Arc<Semaphore>,
    seq: AtomicU64,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    cancelled: AtomicUsize,
    history: DeliveryHistory,
}

/// Delayed work queue plus worker pool in front of a [`DeliverySink`].
pub struct PacedDispatcher {
    inner: Arc<Inner>,
    state: watch::Sender<RunState>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PacedDispatcher {
    pub fn new(sink: Arc<dyn DeliverySink>, config: &DispatchConfig) -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            inner: Arc::new(Inner {
                sink,
                log: None,
                chunk_size: config.chunk_size.max(1),
                send_timeout: config.send_timeout(),
                queue: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_sends.max(1))),
                seq: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                cancelled: AtomicUsize::new(0),
                history: DeliveryHistory::new(),
            }),
            state,
            timer: std::sync::Mutex::new(None),
        }
    }

    /// Persist a "sent" mark for every finished job. Must be called before `start`.
    pub fn with_log(mut self, log: Arc<dyn DeliveryLog>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.log = Some(log),
            None => tracing::warn!("⚠️ Delivery log ignored: dispatcher already started"),
        }
        self
    }

    /// Spawn the timer loop. Calling twice is a no-op.
    pub fn start(&self) {
        let Ok(mut timer) = self.timer.lock() else {
            return;
        };
        if timer.is_some() {
            return;
        }
        self.state.send_replace(RunState::Running);
        let inner = self.inner.clone();
        let rx = self.state.subscribe();
        *timer = Some(tokio::spawn(run_timer(inner, rx)));
        tracing::info!(
            "📮 Dispatcher started (chunk {}, {} concurrent sends via {})",
            self.inner.chunk_size,
            self.inner.permits.available_permits(),
            self.inner.sink.name()
        );
    }

    /// Queue jobs paced `inter_task_delay` apart starting at `base`.
    /// Returns the scheduled jobs with their not-before times.
    pub async fn schedule(
        &self,
        jobs: Vec<NotificationJob>,
        base: Instant,
        inter_task_delay: Duration,
    ) -> Vec<NotificationJob> {
        let planned = plan_schedule(jobs, base, inter_task_delay);
        if *self.state.borrow() == RunState::Stopped {
            tracing::warn!("⚠️ Dispatcher stopped, dropping {} jobs", planned.len());
            return Vec::new();
        }
        {
            let mut queue = self.inner.queue.lock().await;
            for job in &planned {
                let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                queue.push(Reverse(QueuedJob {
                    not_before: job.not_before.unwrap_or(base),
                    seq,
                    job: job.clone(),
                }));
                tracing::debug!("📥 Job {} queued ({} recipients)", job.id, job.recipients.len());
            }
        }
        self.inner.wake.notify_one();
        planned
    }

    /// Cancel jobs that are not yet due and wait for in-flight sends.
    pub async fn stop(&self) {
        self.state.send_replace(RunState::Stopped);
        self.join_timer().await;
        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            self.inner.cancelled.fetch_add(dropped, Ordering::Relaxed);
            tracing::info!("🛑 Dispatcher stopped, {dropped} pending jobs cancelled");
        } else {
            tracing::info!("🛑 Dispatcher stopped");
        }
    }

    /// Let every queued job fire and finish, then stop.
    pub async fn drain(&self) {
        self.state.send_replace(RunState::Draining);
        self.inner.wake.notify_one();
        self.join_timer().await;
        self.state.send_replace(RunState::Stopped);
        tracing::info!("📭 Dispatcher drained");
    }

    async fn join_timer(&self) {
        let handle = self.timer.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("Dispatcher timer loop panicked: {e}");
        }
    }

    pub async fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self.inner.queue.lock().await.len(),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Most recent delivery reports, oldest first.
    pub fn history(&self) -> Vec<DeliveryReport> {
        self.inner.history.recent()
    }
}

/// Assign not-before times. Jobs without recipients are dropped and take no slot.
/// Offsets past the clock's range reuse the last representable time.
pub fn plan_schedule(
    jobs: Vec<NotificationJob>,
    base: Instant,
    inter_task_delay: Duration,
) -> Vec<NotificationJob> {
    let mut last = base;
    jobs.into_iter()
        .filter(|j| !j.recipients.is_empty())
        .enumerate()
        .map(|(i, mut job)| {
            let slot = u32::try_from(i).unwrap_or(u32::MAX);
            last = base.checked_add(inter_task_delay.saturating_mul(slot)).unwrap_or(last);
            job.not_before = Some(last);
            job
        })
        .collect()
}

/// Split a recipient list into provider-safe bursts.
pub fn chunk_recipients(recipients: &[RecipientId], chunk_size: usize) -> Vec<&[RecipientId]> {
    recipients.chunks(chunk_size.max(1)).collect()
}

async fn run_timer(inner: Arc<Inner>, mut state: watch::Receiver<RunState>) {
    let mut workers: JoinSet<DeliveryReport> = JoinSet::new();

    loop {
        let current = *state.borrow_and_update();
        if current == RunState::Stopped {
            break;
        }

        while let Some(done) = workers.try_join_next() {
            finish(&inner, done);
        }

        let next_due = inner.queue.lock().await.peek().map(|Reverse(q)| q.not_before);

        match next_due {
            Some(at) if at <= Instant::now() => {
                let queued = inner.queue.lock().await.pop();
                if let Some(Reverse(queued)) = queued {
                    tracing::debug!("⏰ Job {} due", queued.job.id);
                    inner.in_flight.fetch_add(1, Ordering::Relaxed);
                    workers.spawn(deliver(inner.clone(), queued.job, state.clone()));
                }
            }
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = inner.wake.notified() => {}
                    changed = state.changed() => if changed.is_err() { break },
                    Some(done) = workers.join_next(), if !workers.is_empty() => finish(&inner, done),
                }
            }
            None => {
                if current == RunState::Draining && workers.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    changed = state.changed() => if changed.is_err() { break },
                    Some(done) = workers.join_next(), if !workers.is_empty() => finish(&inner, done),
                }
            }
        }
    }

    // In-flight jobs run to completion; they start no new sends once stopped.
    while let Some(done) = workers.join_next().await {
        finish(&inner, done);
    }
}

fn finish(inner: &Inner, done: Result<DeliveryReport, tokio::task::JoinError>) {
    inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    match done {
        Ok(report) => {
            inner.completed.fetch_add(1, Ordering::Relaxed);
            // Sent means every recipient was attempted.
            if !report.skipped_after_shutdown.is_empty() {
                tracing::warn!(
                    "⚠️ Job {} cut short by shutdown, {} recipients never attempted; not marked sent",
                    report.job_id,
                    report.skipped_after_shutdown.len()
                );
            } else if let Some(log) = &inner.log
                && let Err(e) = log.record(&report)
            {
                tracing::warn!("⚠️ Failed to record delivery of job {}: {e}", report.job_id);
            }
            inner.history.push(&report);
        }
        Err(e) => tracing::error!("Delivery worker failed: {e}"),
    }
}

/// Attempt every recipient of one job. Failures are collected, never propagated.
async fn deliver(
    inner: Arc<Inner>,
    job: NotificationJob,
    state: watch::Receiver<RunState>,
) -> DeliveryReport {
    let mut report = DeliveryReport {
        job_id: job.id.clone(),
        source: job.source.clone(),
        message: job.text.to_string(),
        attempted: 0,
        delivered: 0,
        failed: Vec::new(),
        skipped_after_shutdown: Vec::new(),
        chunk_sizes: Vec::new(),
        sent_at: chrono::Utc::now(),
    };

    for chunk in chunk_recipients(&job.recipients, inner.chunk_size) {
        report.chunk_sizes.push(chunk.len());
        let mut sends: JoinSet<(RecipientId, Result<(), String>)> = JoinSet::new();

        for &recipient in chunk {
            if *state.borrow() == RunState::Stopped {
                report.skipped_after_shutdown.push(recipient);
                continue;
            }
            let Ok(permit) = inner.permits.clone().acquire_owned().await else {
                report.skipped_after_shutdown.push(recipient);
                continue;
            };
            // Shutdown may have arrived while waiting for a permit.
            if *state.borrow() == RunState::Stopped {
                report.skipped_after_shutdown.push(recipient);
                continue;
            }
            report.attempted += 1;
            let sink = inner.sink.clone();
            let text = job.text.clone();
            let timeout = inner.send_timeout;
            sends.spawn(async move {
                let _permit = permit;
                let outcome = match tokio::time::timeout(timeout, sink.send(recipient, &text)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("send timed out after {}s", timeout.as_secs_f32())),
                };
                (recipient, outcome)
            });
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((recipient, Err(reason))) => {
                    tracing::warn!("⚠️ Delivery to {recipient} failed: {reason}");
                    report.failed.push((recipient, reason));
                }
                Err(e) => tracing::error!("Send task failed: {e}"),
            }
        }
    }

    report.sent_at = chrono::Utc::now();
    tracing::info!(
        "✅ Job {} sent: {}/{} delivered, {} failed, {} skipped",
        report.job_id,
        report.delivered,
        report.attempted,
        report.failed.len(),
        report.skipped_after_shutdown.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use procharity_core::error::{ProCharityError, Result};
    use procharity_core::types::JobSource;
    use crate::store::MemoryStore;

    /// Records (recipient, send time); fails for ids in `fail`, hangs for ids in `hang`.
    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<(RecipientId, Instant)>>,
        fail: Vec<RecipientId>,
        hang: Vec<RecipientId>,
        latency: Duration,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(RecipientId, Instant)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, recipient: RecipientId, _text: &str) -> Result<()> {
            if self.hang.contains(&recipient) {
                std::future::pending::<()>().await;
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.sent.lock().unwrap().push((recipient, Instant::now()));
            if self.fail.contains(&recipient) {
                return Err(ProCharityError::Delivery(format!("chat {recipient} blocked the bot")));
            }
            Ok(())
        }
    }

    fn config(chunk_size: usize) -> DispatchConfig {
        DispatchConfig {
            inter_task_delay_secs: 10,
            chunk_size,
            max_concurrent_sends: 4,
            send_timeout_secs: 5,
        }
    }

    fn job(task_id: i64, recipients: std::ops::Range<i64>) -> NotificationJob {
        NotificationJob::new(JobSource::Task(task_id), recipients.collect(), format!("task {task_id}"))
    }

    #[test]
    fn test_chunking_seventy_by_thirty() {
        let recipients: Vec<RecipientId> = (0..70).collect();
        let sizes: Vec<usize> = chunk_recipients(&recipients, 30).iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![30, 30, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_job_takes_no_slot() {
        let base = Instant::now();
        let delay = Duration::from_secs(10);
        let planned = plan_schedule(vec![job(1, 0..2), job(2, 0..0), job(3, 5..6)], base, delay);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].not_before, Some(base));
        assert_eq!(planned[1].source, JobSource::Task(3));
        assert_eq!(planned[1].not_before, Some(base + delay));
    }

    #[test]
    fn test_equal_times_pop_in_schedule_order() {
        let at = Instant::now();
        let mut heap = BinaryHeap::new();
        for seq in [3u64, 0, 4, 1, 2] {
            heap.push(Reverse(QueuedJob {
                not_before: at,
                seq,
                job: job(seq as i64, 0..1),
            }));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(q)| q.seq)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_time_jobs_fire_fifo() {
        let sink = Arc::new(RecordingSink::default());
        let mut cfg = config(30);
        cfg.max_concurrent_sends = 1;
        let dispatcher = PacedDispatcher::new(sink.clone(), &cfg);
        dispatcher.start();

        let jobs: Vec<_> = (1..=5).map(|t| job(t, t * 10..t * 10 + 1)).collect();
        dispatcher.schedule(jobs, Instant::now(), Duration::ZERO).await;
        dispatcher.drain().await;

        let order: Vec<_> = sink.sent().iter().map(|(r, _)| *r).collect();
        assert_eq!(order, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_does_not_overflow() {
        let base = Instant::now();
        let planned = plan_schedule(vec![job(1, 0..1), job(2, 0..1), job(3, 0..1)], base, Duration::MAX);
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0].not_before, Some(base));
        assert!(planned.windows(2).all(|w| w[0].not_before <= w[1].not_before));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_fire_paced_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = PacedDispatcher::new(sink.clone(), &config(30));
        dispatcher.start();

        let base = Instant::now();
        let delay = Duration::from_secs(10);
        dispatcher
            .schedule(vec![job(1, 100..101), job(2, 200..201), job(3, 300..301)], base, delay)
            .await;
        dispatcher.drain().await;

        let sent = sink.sent();
        assert_eq!(sent.iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![100, 200, 300]);
        for (i, (_, at)) in sent.iter().enumerate() {
            assert!(*at >= base + delay * i as u32);
        }
        assert_eq!(dispatcher.stats().await.completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_job_is_chunked_without_delay() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = PacedDispatcher::new(sink.clone(), &config(30));
        dispatcher.start();

        let base = Instant::now();
        dispatcher.schedule(vec![job(1, 0..70)], base, Duration::from_secs(10)).await;
        dispatcher.drain().await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 70);
        assert!(sent.iter().all(|(_, at)| *at < base + Duration::from_secs(1)));
        let report = &dispatcher.history()[0];
        assert_eq!(report.chunk_sizes, vec![30, 30, 10]);
        assert_eq!(report.delivered, 70);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort_the_job() {
        let sink = Arc::new(RecordingSink {
            fail: vec![2],
            hang: vec![3],
            ..Default::default()
        });
        let dispatcher = PacedDispatcher::new(sink.clone(), &config(30));
        dispatcher.start();
        dispatcher
            .schedule(vec![job(1, 1..5), job(2, 9..10)], Instant::now(), Duration::from_secs(10))
            .await;
        dispatcher.drain().await;

        let history = dispatcher.history();
        assert_eq!(history.len(), 2);
        let first = &history[0];
        assert_eq!(first.attempted, 4);
        assert_eq!(first.delivered, 2);
        let failed: Vec<_> = first.failed.iter().map(|(r, _)| *r).collect();
        assert!(failed.contains(&2));
        assert!(failed.contains(&3));
        assert!(first.failed.iter().any(|(_, reason)| reason.contains("timed out")));
        assert_eq!(history[1].delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_jobs_not_yet_due() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = PacedDispatcher::new(sink.clone(), &config(30));
        dispatcher.start();
        dispatcher
            .schedule(vec![job(1, 1..2), job(2, 2..3)], Instant::now(), Duration::from_secs(60))
            .await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(sink.sent().iter().map(|(r, _)| *r).collect::<Vec<_>>(), vec![1]);
        let stats = dispatcher.stats().await;
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.queued, 0);
        assert!(dispatcher.schedule(vec![job(3, 3..4)], Instant::now(), Duration::ZERO).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_job_finishes_but_starts_no_new_sends() {
        let sink = Arc::new(RecordingSink {
            latency: Duration::from_secs(2),
            ..Default::default()
        });
        let mut cfg = config(2);
        cfg.max_concurrent_sends = 1;
        let store = Arc::new(MemoryStore::new());
        let dispatcher = PacedDispatcher::new(sink.clone(), &cfg).with_log(store.clone());
        dispatcher.start();
        dispatcher.schedule(vec![job(1, 0..4)], Instant::now(), Duration::ZERO).await;

        // First send is in flight at t=1s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.stop().await;

        let report = &dispatcher.history()[0];
        assert_eq!(report.delivered, 1);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.skipped_after_shutdown, vec![1, 2, 3]);
        assert!(store.task_sent_at(1).is_none());
        assert_eq!(store.notification_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_is_marked_sent() {
        let sink = Arc::new(RecordingSink {
            fail: vec![2],
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        let dispatcher = PacedDispatcher::new(sink, &config(30)).with_log(store.clone());
        dispatcher.start();
        dispatcher.schedule(vec![job(4, 1..3)], Instant::now(), Duration::ZERO).await;
        dispatcher.drain().await;

        assert!(store.task_sent_at(4).is_some());
    }
}
