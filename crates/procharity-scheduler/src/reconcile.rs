//! Task Reconciler — classifies an inbound batch against persisted state.
//!
//! Every incoming id lands in exactly one of {added, updated, unchanged};
//! known ids that were archived before the batch are additionally reported as
//! unarchived. Previously active ids that the batch does not match are
//! archived. All writes go through the caller's open [`TaskStore`]; nothing is
//! committed here.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use procharity_core::config::ArchivePolicy;
use procharity_core::error::Result;
use procharity_core::traits::TaskStore;
use procharity_core::types::{Task, TaskId};

use crate::fingerprint::Fingerprint;

/// Ids per classification, in batch order. Serialized with the webhook's keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    #[serde(rename = "added_tasks")]
    pub added: Vec<TaskId>,
    #[serde(rename = "updated_tasks")]
    pub updated: Vec<TaskId>,
    #[serde(rename = "archived_tasks")]
    pub archived: Vec<TaskId>,
    #[serde(rename = "unarchived_tasks")]
    pub unarchived: Vec<TaskId>,
}

impl ReconcileReport {
    fn changed_anything(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.unarchived.is_empty()
    }
}

/// Report plus the tasks that qualify for outreach: every added task, then
/// every unarchived one. Content-only updates are never notified.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub report: ReconcileReport,
    pub needs_notice: Vec<Task>,
}

pub struct Reconciler {
    policy: ArchivePolicy,
}

impl Reconciler {
    pub fn new(policy: ArchivePolicy) -> Self {
        Self { policy }
    }

    /// Classify `incoming` and stage the resulting writes on `store`.
    ///
    /// `active_before` must be the active id set captured before any write of
    /// this batch. An id is "unarchived" when the store knows it but it was
    /// not in that snapshot.
    ///
    /// `protected` ids (records rejected by validation) are never archived.
    pub fn reconcile(
        &self,
        store: &mut (impl TaskStore + ?Sized),
        incoming: Vec<Task>,
        active_before: &BTreeSet<TaskId>,
        protected: &BTreeSet<TaskId>,
    ) -> Result<Reconciliation> {
        let incoming = dedupe(incoming);
        let ids: Vec<TaskId> = incoming.iter().map(|t| t.id).collect();
        let known = store.existing_ids(&ids)?;

        let mut out = Reconciliation::default();
        let mut matched = BTreeSet::new();

        for task in incoming {
            matched.insert(task.id);

            if !known.contains(&task.id) {
                let mut new_task = task;
                new_task.archived = false;
                store.insert(&new_task)?;
                out.report.added.push(new_task.id);
                out.needs_notice.push(new_task);
                continue;
            }

            let Some(persisted) = store.get(task.id)? else {
                // existing_ids said yes; a vanished row means the store is inconsistent.
                return Err(procharity_core::ProCharityError::Store(format!(
                    "task {} reported as existing but could not be loaded",
                    task.id
                )));
            };

            if Fingerprint::of(&persisted.fields) != Fingerprint::of(&task.fields) {
                store.update(task.id, &task.fields)?;
                store.set_archived(task.id, false)?;
                out.report.updated.push(task.id);
            }

            if !active_before.contains(&task.id) {
                if persisted.archived {
                    store.set_archived(task.id, false)?;
                }
                out.report.unarchived.push(task.id);
            }
        }

        // Unarchived tasks are announced with their current content.
        for id in &out.report.unarchived {
            if let Some(task) = store.get(*id)? {
                out.needs_notice.push(task);
            }
        }

        if self.policy == ArchivePolicy::OnChange && !out.report.changed_anything() {
            tracing::info!("🗃️ Batch changed nothing, skipping archival (policy: on_change)");
            return Ok(out);
        }

        let mut candidates: BTreeSet<TaskId> = active_before.clone();
        candidates.extend(store.active_ids()?);
        for id in candidates {
            if matched.contains(&id) || protected.contains(&id) {
                continue;
            }
            store.set_archived(id, true)?;
            out.report.archived.push(id);
        }

        tracing::info!(
            "🧮 Reconciled batch: {} added, {} updated, {} unarchived, {} archived",
            out.report.added.len(),
            out.report.updated.len(),
            out.report.unarchived.len(),
            out.report.archived.len()
        );
        tracing::debug!("Reconcile report: {:?}", out.report);

        Ok(out)
    }
}

/// Last record wins for content; the first occurrence keeps its position.
fn dedupe(incoming: Vec<Task>) -> Vec<Task> {
    let mut slot: HashMap<TaskId, usize> = HashMap::with_capacity(incoming.len());
    let mut out: Vec<Task> = Vec::with_capacity(incoming.len());
    for task in incoming {
        match slot.get(&task.id) {
            Some(&i) => {
                tracing::warn!("⚠️ Duplicate task id {} in batch, keeping last record", task.id);
                out[i] = task;
            }
            None => {
                slot.insert(task.id, out.len());
                out.push(task);
            }
        }
    }
    out
}
