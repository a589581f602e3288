//! In-memory store — tasks, subscriptions and delivery marks behind one lock.
//! Transactions work on a private copy and publish it on commit, so a failed
//! commit leaves nothing behind. Used for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use procharity_core::error::{ProCharityError, Result};
use procharity_core::traits::{DeliveryLog, RecipientResolver, TaskRepository, TaskStore};
use procharity_core::types::{
    CategoryId, DeliveryReport, JobSource, MailingType, Recipient, RecipientId, Task, TaskFields, TaskId,
};

/// One stored notification; its index is the notification id.
struct NotificationRow {
    task_id: Option<TaskId>,
    sent_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<TaskId, Task>,
    recipients: BTreeMap<RecipientId, Recipient>,
    subscriptions: BTreeMap<CategoryId, BTreeSet<RecipientId>>,
    notifications: Vec<NotificationRow>,
}

/// Thread-safe in-memory implementation of every store seam.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_next_commit: AtomicBool,
    failing_categories: Mutex<BTreeSet<CategoryId>>,
    fail_mailing_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| ProCharityError::Store(format!("memory store poisoned: {e}")))
    }

    /// Insert or replace a task directly, bypassing transactions.
    pub fn put(&self, task: Task) {
        if let Ok(mut state) = self.lock() {
            state.tasks.insert(task.id, task);
        }
    }

    /// Current committed copy of a task.
    pub fn snapshot(&self, id: TaskId) -> Option<Task> {
        self.lock().ok()?.tasks.get(&id).cloned()
    }

    pub fn add_recipient(&self, id: RecipientId, has_mailing: bool, categories: &[CategoryId]) {
        if let Ok(mut state) = self.lock() {
            state.recipients.insert(
                id,
                Recipient {
                    id,
                    username: None,
                    has_mailing,
                },
            );
            for category in categories {
                state.subscriptions.entry(*category).or_default().insert(id);
            }
        }
    }

    /// Make the next `commit` fail, as a rejected database commit would.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make lookups for `category_id` fail.
    pub fn fail_category(&self, category_id: CategoryId) {
        if let Ok(mut failing) = self.failing_categories.lock() {
            failing.insert(category_id);
        }
    }

    /// Make every `recipients_by_mailing` lookup fail.
    pub fn fail_mailing_lookups(&self) {
        self.fail_mailing_lookups.store(true, Ordering::SeqCst);
    }

    /// Send timestamp of a stored broadcast, once it has been marked sent.
    pub fn notification_sent_at(&self, id: i64) -> Option<DateTime<Utc>> {
        let state = self.lock().ok()?;
        state.notifications.get(usize::try_from(id).ok()?)?.sent_at
    }

    /// Send timestamp of the latest announcement of `task_id`.
    pub fn task_sent_at(&self, task_id: TaskId) -> Option<DateTime<Utc>> {
        let state = self.lock().ok()?;
        state
            .notifications
            .iter()
            .rev()
            .find(|n| n.task_id == Some(task_id))?
            .sent_at
    }

    pub fn notification_count(&self) -> usize {
        self.lock().map(|s| s.notifications.len()).unwrap_or(0)
    }
}

impl TaskRepository for MemoryStore {
    fn begin(&self) -> Result<Box<dyn TaskStore + '_>> {
        let guard = self.lock()?;
        let working = guard.tasks.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_commit: &self.fail_next_commit,
            open: true,
        }))
    }
}

/// Open transaction on a [`MemoryStore`]. Holds the store lock until dropped.
pub struct MemoryTx<'a> {
    guard: MutexGuard<'a, MemoryState>,
    working: BTreeMap<TaskId, Task>,
    fail_commit: &'a AtomicBool,
    open: bool,
}

impl MemoryTx<'_> {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(ProCharityError::Store("transaction already finished".into()))
        }
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.working
            .get_mut(&id)
            .ok_or_else(|| ProCharityError::Store(format!("task {id} not found")))
    }
}

impl TaskStore for MemoryTx<'_> {
    fn existing_ids(&mut self, ids: &[TaskId]) -> Result<BTreeSet<TaskId>> {
        self.ensure_open()?;
        Ok(ids.iter().copied().filter(|id| self.working.contains_key(id)).collect())
    }

    fn get(&mut self, id: TaskId) -> Result<Option<Task>> {
        self.ensure_open()?;
        Ok(self.working.get(&id).cloned())
    }

    fn active_ids(&mut self) -> Result<BTreeSet<TaskId>> {
        self.ensure_open()?;
        Ok(self
            .working
            .values()
            .filter(|t| !t.archived)
            .map(|t| t.id)
            .collect())
    }

    fn insert(&mut self, task: &Task) -> Result<()> {
        self.ensure_open()?;
        if self.working.contains_key(&task.id) {
            return Err(ProCharityError::Store(format!("task {} already exists", task.id)));
        }
        self.working.insert(task.id, task.clone());
        Ok(())
    }

    fn update(&mut self, id: TaskId, fields: &TaskFields) -> Result<()> {
        self.ensure_open()?;
        self.task_mut(id)?.fields = fields.clone();
        Ok(())
    }

    fn set_archived(&mut self, id: TaskId, archived: bool) -> Result<()> {
        self.ensure_open()?;
        self.task_mut(id)?.archived = archived;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            self.working.clear();
            return Err(ProCharityError::Store("commit rejected".into()));
        }
        self.guard.tasks = std::mem::take(&mut self.working);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.open = false;
        self.working.clear();
        Ok(())
    }
}

#[async_trait]
impl RecipientResolver for MemoryStore {
    async fn subscribers_of(&self, category_id: CategoryId) -> Result<Vec<Recipient>> {
        let failing = self
            .failing_categories
            .lock()
            .map(|f| f.contains(&category_id))
            .unwrap_or(false);
        if failing {
            return Err(ProCharityError::Resolver(format!(
                "category {category_id} lookup failed"
            )));
        }
        let state = self.lock()?;
        let Some(ids) = state.subscriptions.get(&category_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.recipients.get(id))
            .filter(|r| r.has_mailing)
            .cloned()
            .collect())
    }

    async fn recipients_by_mailing(&self, mailing: MailingType) -> Result<Vec<Recipient>> {
        if self.fail_mailing_lookups.load(Ordering::SeqCst) {
            return Err(ProCharityError::Resolver(format!("{mailing} lookup failed")));
        }
        let state = self.lock()?;
        Ok(state
            .recipients
            .values()
            .filter(|r| mailing.includes(r))
            .cloned()
            .collect())
    }
}

impl DeliveryLog for MemoryStore {
    fn open(&self, _message: &str, _sent_by: &str) -> Result<i64> {
        let mut state = self.lock()?;
        state.notifications.push(NotificationRow {
            task_id: None,
            sent_at: None,
        });
        Ok(state.notifications.len() as i64 - 1)
    }

    /// Task announcements get a new row, broadcasts mark their open row.
    fn record(&self, report: &DeliveryReport) -> Result<()> {
        let mut state = self.lock()?;
        match report.source {
            JobSource::Task(task_id) => state.notifications.push(NotificationRow {
                task_id: Some(task_id),
                sent_at: Some(report.sent_at),
            }),
            JobSource::Broadcast { notification_id } => {
                let slot = usize::try_from(notification_id)
                    .ok()
                    .and_then(|i| state.notifications.get_mut(i))
                    .ok_or_else(|| ProCharityError::Store(format!("notification {notification_id} not found")))?;
                slot.sent_at = Some(report.sent_at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: TaskId) -> Task {
        Task::new(
            id,
            TaskFields {
                title: format!("task {id}"),
                name_organization: String::new(),
                deadline: None,
                category_id: 1,
                bonus: 0,
                location: String::new(),
                link: String::new(),
                description: String::new(),
            },
        )
    }

    #[test]
    fn test_uncommitted_changes_are_discarded() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.insert(&task(1)).unwrap();
        }
        assert!(store.snapshot(1).is_none());

        let mut tx = store.begin().unwrap();
        tx.insert(&task(1)).unwrap();
        tx.commit().unwrap();
        drop(tx);
        assert!(store.snapshot(1).is_some());
    }

    #[test]
    fn test_failed_commit_keeps_previous_state() {
        let store = MemoryStore::new();
        store.put(task(1));
        store.fail_next_commit();

        let mut tx = store.begin().unwrap();
        tx.set_archived(1, true).unwrap();
        assert!(tx.commit().is_err());
        drop(tx);
        assert!(!store.snapshot(1).unwrap().archived);
    }

    fn report(source: JobSource) -> DeliveryReport {
        DeliveryReport {
            job_id: "j".into(),
            source,
            message: "text".into(),
            attempted: 1,
            delivered: 1,
            failed: vec![],
            skipped_after_shutdown: vec![],
            chunk_sizes: vec![1],
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn test_task_and_broadcast_sends_are_recorded() {
        let store = MemoryStore::new();
        let id = store.open("hello", "admin").unwrap();
        assert!(store.notification_sent_at(id).is_none());

        store.record(&report(JobSource::Task(7))).unwrap();
        store.record(&report(JobSource::Broadcast { notification_id: id })).unwrap();

        assert!(store.task_sent_at(7).is_some());
        assert!(store.task_sent_at(8).is_none());
        assert!(store.notification_sent_at(id).is_some());
        assert_eq!(store.notification_count(), 2);
        assert!(store.record(&report(JobSource::Broadcast { notification_id: 99 })).is_err());
    }

    #[tokio::test]
    async fn test_subscribers_only_enabled() {
        let store = MemoryStore::new();
        store.add_recipient(10, true, &[1, 2]);
        store.add_recipient(11, false, &[1]);
        store.add_recipient(12, true, &[2]);

        let ids: Vec<_> = store.subscribers_of(1).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10]);
        let all = store.recipients_by_mailing(MailingType::All).await.unwrap();
        assert_eq!(all.len(), 3);
        let off = store.recipients_by_mailing(MailingType::Unsubscribed).await.unwrap();
        assert_eq!(off.len(), 1);
    }
}
