//! Collaborator seams: the task store, recipient lookup and message delivery.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CategoryId, DeliveryReport, MailingType, Recipient, RecipientId, Task, TaskFields, TaskId};

/// One open unit of work against the task store.
///
/// Every mutation is staged until `commit`. Dropping an uncommitted store
/// must behave like `rollback`.
pub trait TaskStore {
    /// Bulk existence check: which of `ids` are already persisted.
    fn existing_ids(&mut self, ids: &[TaskId]) -> Result<BTreeSet<TaskId>>;
    fn get(&mut self, id: TaskId) -> Result<Option<Task>>;
    /// Ids of every task with `archived = false`.
    fn active_ids(&mut self) -> Result<BTreeSet<TaskId>>;
    fn insert(&mut self, task: &Task) -> Result<()>;
    /// Overwrite every mutable field of `id`.
    fn update(&mut self, id: TaskId, fields: &TaskFields) -> Result<()>;
    fn set_archived(&mut self, id: TaskId, archived: bool) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

/// Opens task store transactions. Holding one serializes batches.
pub trait TaskRepository: Send + Sync {
    fn begin(&self) -> Result<Box<dyn TaskStore + '_>>;
}

/// Maps categories and mailing types to recipients.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Recipients subscribed to `category_id` with notifications enabled.
    async fn subscribers_of(&self, category_id: CategoryId) -> Result<Vec<Recipient>>;

    /// Every known recipient matching a broadcast mailing type.
    async fn recipients_by_mailing(&self, mailing: MailingType) -> Result<Vec<Recipient>>;
}

/// Sends one message to one recipient.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, recipient: RecipientId, text: &str) -> Result<()>;
}

/// Records that a job's message went out.
pub trait DeliveryLog: Send + Sync {
    /// Store an unsent broadcast and return its notification id.
    fn open(&self, message: &str, sent_by: &str) -> Result<i64>;

    /// Mark a finished job as sent, with its timestamp and outcome counts.
    fn record(&self, report: &DeliveryReport) -> Result<()>;
}
