//! Task engine — reconciles inbound batches, then hands notices to the dispatcher.
//!
//! The store transaction is committed (or rolled back) before any recipient
//! lookup happens, so notification never sees a half-written batch and can
//! never undo a committed one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use procharity_core::config::ProCharityConfig;
use procharity_core::error::{ProCharityError, Result};
use procharity_core::traits::{DeliveryLog, DeliverySink, RecipientResolver, TaskRepository};
use procharity_core::types::{IncomingTask, JobSource, MailingType, RejectedTask, Task, TaskId};

use crate::dispatch::{DispatchStats, PacedDispatcher};
use crate::notify::{MAX_MESSAGE_CHARS, NotificationBatcher, NotificationJob, SkippedNotification};
use crate::reconcile::{ReconcileReport, Reconciler, Reconciliation};

/// Result of one ingested batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    #[serde(flatten)]
    pub report: ReconcileReport,
    pub rejected: Vec<RejectedTask>,
    pub skipped_notifications: Vec<SkippedNotification>,
    pub scheduled_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub notification_id: i64,
    pub mailing: MailingType,
    pub recipients: usize,
    pub scheduled: bool,
}

pub struct TaskEngine {
    repo: Arc<dyn TaskRepository>,
    resolver: Arc<dyn RecipientResolver>,
    log: Arc<dyn DeliveryLog>,
    dispatcher: Arc<PacedDispatcher>,
    reconciler: Reconciler,
    batcher: NotificationBatcher,
    inter_task_delay: Duration,
}

impl TaskEngine {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        resolver: Arc<dyn RecipientResolver>,
        log: Arc<dyn DeliveryLog>,
        dispatcher: Arc<PacedDispatcher>,
        config: &ProCharityConfig,
    ) -> Self {
        Self {
            repo,
            batcher: NotificationBatcher::new(resolver.clone()),
            resolver,
            log,
            dispatcher,
            reconciler: Reconciler::new(config.reconcile.archive_policy),
            inter_task_delay: config.dispatch.inter_task_delay(),
        }
    }

    /// Wire every seam to one store and build a dispatcher that logs to it.
    pub fn from_store<S>(store: Arc<S>, sink: Arc<dyn DeliverySink>, config: &ProCharityConfig) -> Self
    where
        S: TaskRepository + RecipientResolver + DeliveryLog + 'static,
    {
        let dispatcher = PacedDispatcher::new(sink, &config.dispatch).with_log(store.clone());
        Self::new(store.clone(), store.clone(), store, Arc::new(dispatcher), config)
    }

    pub fn dispatcher(&self) -> &Arc<PacedDispatcher> {
        &self.dispatcher
    }

    pub fn start(&self) {
        self.dispatcher.start();
    }

    /// Cancel jobs that are not yet due.
    pub async fn shutdown(&self) {
        self.dispatcher.stop().await;
    }

    /// Wait until every scheduled job has been sent.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
    }

    pub async fn stats(&self) -> DispatchStats {
        self.dispatcher.stats().await
    }

    /// Parse a raw JSON batch and ingest it. Only a non-array body is fatal;
    /// a record that fails to deserialize is rejected on its own.
    pub async fn ingest_json(&self, raw: &str, notify: bool) -> Result<IngestReport> {
        let (records, mut rejected) = parse_batch(raw)?;
        let mut report = self.ingest(records, notify).await?;
        rejected.append(&mut report.rejected);
        report.rejected = rejected;
        Ok(report)
    }

    /// Validate, reconcile and commit one batch, then schedule outreach for
    /// added and unarchived tasks when `notify` is set.
    pub async fn ingest(&self, records: Vec<IncomingTask>, notify: bool) -> Result<IngestReport> {
        let mut tasks = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            match record.validate() {
                Ok(task) => tasks.push(task),
                Err(r) => {
                    tracing::warn!("⚠️ Rejected task {:?}: {}", r.id, r.reason);
                    rejected.push(r);
                }
            }
        }
        let protected: BTreeSet<TaskId> = rejected.iter().filter_map(|r| r.id).collect();

        let Reconciliation { report, needs_notice } = self.commit_batch(tasks, &protected)?;
        let mut out = IngestReport {
            report,
            rejected,
            ..Default::default()
        };

        if !notify || needs_notice.is_empty() {
            return Ok(out);
        }

        let batched = self.batcher.build_jobs(&needs_notice).await;
        out.skipped_notifications = batched.skipped;
        let scheduled = self
            .dispatcher
            .schedule(batched.jobs, Instant::now(), self.inter_task_delay)
            .await;
        out.scheduled_jobs = scheduled.len();
        tracing::info!(
            "📨 {} notification jobs scheduled, {} skipped",
            out.scheduled_jobs,
            out.skipped_notifications.len()
        );
        Ok(out)
    }

    /// Classify and write inside one transaction. Sync on purpose: the
    /// transaction must never be held across an await.
    fn commit_batch(&self, tasks: Vec<Task>, protected: &BTreeSet<TaskId>) -> Result<Reconciliation> {
        let mut tx = self.repo.begin()?;
        let active_before = tx.active_ids()?;

        let reconciliation = match self.reconciler.reconcile(&mut *tx, tasks, &active_before, protected) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("❌ Reconciliation failed, rolling back: {e}");
                if let Err(rb) = tx.rollback() {
                    tracing::error!("❌ Rollback failed: {rb}");
                }
                return Err(e);
            }
        };

        if let Err(e) = tx.commit() {
            tracing::error!("❌ Batch commit failed, nothing will be sent: {e}");
            return Err(e);
        }
        Ok(reconciliation)
    }

    /// Send an operator message to every recipient matching `mailing`.
    pub async fn broadcast(&self, message: &str, mailing: MailingType, sent_by: &str) -> Result<BroadcastReport> {
        if message.trim().is_empty() {
            return Err(ProCharityError::Validation("broadcast message is empty".into()));
        }
        let chars = message.chars().count();
        if chars > MAX_MESSAGE_CHARS {
            return Err(ProCharityError::Validation(format!(
                "broadcast message is {chars} characters, limit is {MAX_MESSAGE_CHARS}"
            )));
        }

        // Resolve first: a failed lookup must not leave an unsent row behind.
        let recipients = self.resolver.recipients_by_mailing(mailing).await?;
        let notification_id = self.log.open(message, sent_by)?;
        tracing::info!(
            "📢 Broadcast {notification_id} by {sent_by} to {} recipients ({mailing})",
            recipients.len()
        );

        let job = NotificationJob::new(
            JobSource::Broadcast { notification_id },
            recipients.iter().map(|r| r.id).collect(),
            message,
        );
        let scheduled = self
            .dispatcher
            .schedule(vec![job], Instant::now(), self.inter_task_delay)
            .await;
        if recipients.is_empty() {
            tracing::warn!("⚠️ Broadcast {notification_id} has no recipients, nothing sent");
        } else if scheduled.is_empty() {
            tracing::warn!("⚠️ Broadcast {notification_id} not scheduled: dispatcher is stopped");
        }

        Ok(BroadcastReport {
            notification_id,
            mailing,
            recipients: recipients.len(),
            scheduled: !scheduled.is_empty(),
        })
    }
}

/// Split a JSON array into deserialized records and per-record rejections.
pub fn parse_batch(raw: &str) -> Result<(Vec<IncomingTask>, Vec<RejectedTask>)> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw)?;
    let mut records = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    for value in values {
        let id = value.get("id").and_then(|v| v.as_i64());
        match serde_json::from_value::<IncomingTask>(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("⚠️ Malformed task record {id:?}: {e}");
                rejected.push(RejectedTask {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok((records, rejected))
}
