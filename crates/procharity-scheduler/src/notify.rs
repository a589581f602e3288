//! Notification batching — one job per task, holding that task's full
//! recipient list. Fan-out into individual sends happens at dispatch time.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::Instant;

use procharity_core::traits::RecipientResolver;
use procharity_core::types::{DeliveryReport, JobSource, Recipient, RecipientId, Task, TaskId};

/// Ephemeral unit of outbound work. Consumed once by the dispatcher.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub id: String,
    pub source: JobSource,
    /// Ordered, de-duplicated.
    pub recipients: Vec<RecipientId>,
    pub text: Arc<str>,
    /// Assigned by the dispatcher when the job is scheduled.
    pub not_before: Option<Instant>,
}

impl NotificationJob {
    pub fn new(source: JobSource, recipients: Vec<RecipientId>, text: impl Into<Arc<str>>) -> Self {
        let mut seen = HashSet::with_capacity(recipients.len());
        let recipients = recipients.into_iter().filter(|r| seen.insert(*r)).collect();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            recipients,
            text: text.into(),
            not_before: None,
        }
    }

    pub fn for_task(task_id: TaskId, recipients: &[Recipient], text: String) -> Self {
        Self::new(
            JobSource::Task(task_id),
            recipients.iter().map(|r| r.id).collect(),
            text,
        )
    }
}

/// A task that qualified for outreach but produced no job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedNotification {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct BatchedJobs {
    pub jobs: Vec<NotificationJob>,
    pub skipped: Vec<SkippedNotification>,
}

/// Builds per-task jobs from the resolver's enabled subscribers.
pub struct NotificationBatcher {
    resolver: Arc<dyn RecipientResolver>,
}

impl NotificationBatcher {
    pub fn new(resolver: Arc<dyn RecipientResolver>) -> Self {
        Self { resolver }
    }

    /// Job order follows task order. A resolver failure skips only that task.
    pub async fn build_jobs(&self, tasks: &[Task]) -> BatchedJobs {
        let mut out = BatchedJobs::default();
        for task in tasks {
            let recipients = match self.resolver.subscribers_of(task.fields.category_id).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping notification for task {}: {e}", task.id);
                    out.skipped.push(SkippedNotification {
                        task_id: task.id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            // Resolver contract says enabled only; filter again in case a backend is lax.
            let recipients: Vec<Recipient> = recipients.into_iter().filter(|r| r.has_mailing).collect();
            tracing::debug!(
                "Task {} (category {}) mailing list: {:?}",
                task.id,
                task.fields.category_id,
                recipients.iter().map(|r| r.id).collect::<Vec<_>>()
            );

            if recipients.is_empty() {
                out.skipped.push(SkippedNotification {
                    task_id: task.id,
                    reason: "no eligible recipients".into(),
                });
                continue;
            }

            out.jobs.push(NotificationJob::for_task(task.id, &recipients, render_task_message(task)));
        }
        out
    }
}

/// Telegram's hard limit on message length.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram Markdown body announcing a task. The description is cut short
/// so the whole body, link included, fits in [`MAX_MESSAGE_CHARS`].
pub fn render_task_message(task: &Task) -> String {
    let f = &task.fields;
    let deadline = f
        .deadline
        .map(|d| d.format("%d.%m.%Y").to_string())
        .unwrap_or_else(|| "no deadline".into());

    let mut text = format!("*{}*\n\n", escape_markdown(&f.title));
    if !f.name_organization.is_empty() {
        text.push_str(&format!("Organization: {}\n", escape_markdown(&f.name_organization)));
    }
    text.push_str(&format!("Category: {}\n", f.category_id));
    text.push_str(&format!("Deadline: {deadline}\n"));
    text.push_str(&format!("Bonus: {}\n", f.bonus));
    if !f.location.is_empty() {
        text.push_str(&format!("Location: {}\n", escape_markdown(&f.location)));
    }

    let link = if f.link.is_empty() {
        String::new()
    } else {
        format!("\n[Open task]({})", f.link)
    };

    if !f.description.is_empty() {
        // Two newlines wrap the description.
        let room = MAX_MESSAGE_CHARS.saturating_sub(text.chars().count() + link.chars().count() + 2);
        let description = truncate_chars(&escape_markdown(&f.description), room);
        if !description.is_empty() {
            text.push_str(&format!("\n{description}\n"));
        }
    }
    text.push_str(&link);
    text
}

/// Keep at most `max` chars, ending with `…` when anything was dropped.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(max - 1).collect();
    // A lone trailing backslash would escape the ellipsis.
    if out.ends_with('\\') {
        out.pop();
    }
    out.push('…');
    out
}

/// Escape Telegram MarkdownV1 special characters.
pub fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Recent delivery reports (in-memory ring buffer, max 100).
pub struct DeliveryHistory {
    reports: Mutex<VecDeque<DeliveryReport>>,
    capacity: usize,
}

impl DeliveryHistory {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            reports: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn recent(&self) -> Vec<DeliveryReport> {
        self.reports
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn push(&self, report: &DeliveryReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push_back(report.clone());
            while reports.len() > self.capacity {
                reports.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeliveryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use procharity_core::types::TaskFields;

    fn task(id: TaskId, category_id: i64) -> Task {
        Task::new(
            id,
            TaskFields {
                title: "Write_a *press* release".into(),
                name_organization: "Good Fund".into(),
                deadline: Some(chrono::Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()),
                category_id,
                bonus: 3,
                location: String::new(),
                link: "https://procharity.ru/tasks/1".into(),
                description: "Two pages".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_one_job_per_task_with_all_recipients() {
        let store = Arc::new(MemoryStore::new());
        store.add_recipient(1, true, &[5]);
        store.add_recipient(2, true, &[5]);
        store.add_recipient(3, false, &[5]);
        store.add_recipient(4, true, &[6]);

        let batcher = NotificationBatcher::new(store);
        let out = batcher.build_jobs(&[task(100, 5), task(101, 6)]).await;
        assert_eq!(out.jobs.len(), 2);
        assert_eq!(out.jobs[0].source, JobSource::Task(100));
        assert_eq!(out.jobs[0].recipients, vec![1, 2]);
        assert_eq!(out.jobs[1].recipients, vec![4]);
        assert!(out.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_no_recipients_means_no_job() {
        let store = Arc::new(MemoryStore::new());
        store.add_recipient(1, true, &[5]);
        let out = NotificationBatcher::new(store).build_jobs(&[task(1, 9), task(2, 5)]).await;
        assert_eq!(out.jobs.len(), 1);
        assert_eq!(out.jobs[0].source, JobSource::Task(2));
        assert_eq!(out.skipped[0].task_id, 1);
    }

    #[tokio::test]
    async fn test_resolver_failure_skips_only_that_task() {
        let store = Arc::new(MemoryStore::new());
        store.add_recipient(1, true, &[5, 6]);
        store.fail_category(6);
        let out = NotificationBatcher::new(store).build_jobs(&[task(1, 6), task(2, 5)]).await;
        assert_eq!(out.jobs.len(), 1);
        assert_eq!(out.skipped.len(), 1);
        assert!(out.skipped[0].reason.contains("lookup failed"));
    }

    #[test]
    fn test_render_escapes_and_formats() {
        let text = render_task_message(&task(1, 1));
        assert!(text.starts_with("*Write\\_a \\*press\\* release*"));
        assert!(text.contains("Deadline: 31.12.2024"));
        assert!(text.contains("Organization: Good Fund"));
        assert!(text.contains("Category: 1\n"));
        assert!(!text.contains("Location:"));
        assert!(text.ends_with("[Open task](https://procharity.ru/tasks/1)"));
    }

    #[test]
    fn test_long_description_is_truncated_to_fit() {
        let mut long = task(1, 1);
        long.fields.description = "word_ ".repeat(1000);
        let text = render_task_message(&long);
        assert!(text.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(text.contains("…\n"));
        assert!(!text.contains("\\…"));
        assert!(text.ends_with("[Open task](https://procharity.ru/tasks/1)"));
        assert!(text.starts_with("*Write\\_a"));
    }

    #[test]
    fn test_short_description_is_kept_whole() {
        let text = render_task_message(&task(1, 1));
        assert!(text.contains("\nTwo pages\n"));
        assert!(!text.contains('…'));
    }

    #[test]
    fn test_job_dedupes_recipients() {
        let job = NotificationJob::new(JobSource::Task(1), vec![3, 1, 3, 2, 1], "hi");
        assert_eq!(job.recipients, vec![3, 1, 2]);
    }

    #[test]
    fn test_history_ring_buffer() {
        let history = DeliveryHistory::with_capacity(2);
        for i in 0..3 {
            history.push(&DeliveryReport {
                job_id: i.to_string(),
                source: JobSource::Task(i),
                message: String::new(),
                attempted: 0,
                delivered: 0,
                failed: vec![],
                skipped_after_shutdown: vec![],
                chunk_sizes: vec![],
                sent_at: chrono::Utc::now(),
            });
        }
        let ids: Vec<_> = history.recent().into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
