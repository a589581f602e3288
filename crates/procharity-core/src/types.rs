//! Domain types — tasks, recipients, inbound records and delivery reports.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Externally assigned task id. Stable across batches.
pub type TaskId = i64;
pub type CategoryId = i64;
/// Messaging endpoint id (Telegram chat id).
pub type RecipientId = i64;

/// Mutable content of a task. Replaced wholesale on update, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,
    pub name_organization: String,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: CategoryId,
    pub bonus: i64,
    pub location: String,
    pub link: String,
    pub description: String,
}

/// A charity assignment as persisted by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(flatten)]
    pub fields: TaskFields,
    pub archived: bool,
}

impl Task {
    pub fn new(id: TaskId, fields: TaskFields) -> Self {
        Self {
            id,
            fields,
            archived: false,
        }
    }
}

/// One record of an inbound batch, before validation.
///
/// Required: `id`, `title`, `description`, `deadline` (may be `null`) and
/// `category_id`. Everything else defaults to empty.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IncomingTask {
    pub id: Option<TaskId>,
    pub title: Option<String>,
    #[serde(default)]
    pub name_organization: Option<String>,
    #[serde(default, deserialize_with = "present_deadline")]
    pub deadline: Option<Option<DateTime<Utc>>>,
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub bonus: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    pub description: Option<String>,
}

/// A record excluded from classification because it was malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedTask {
    pub id: Option<TaskId>,
    pub reason: String,
}

impl IncomingTask {
    /// Check required fields and produce a store-ready task.
    pub fn validate(self) -> std::result::Result<Task, RejectedTask> {
        let id = self.id;
        let reject = |field: &str| RejectedTask {
            id,
            reason: format!("missing required field '{field}'"),
        };

        let Some(task_id) = id else {
            return Err(reject("id"));
        };
        let title = self.title.ok_or_else(|| reject("title"))?;
        let description = self.description.ok_or_else(|| reject("description"))?;
        let deadline = self.deadline.ok_or_else(|| reject("deadline"))?;
        let category_id = self.category_id.ok_or_else(|| reject("category_id"))?;

        Ok(Task::new(
            task_id,
            TaskFields {
                title,
                name_organization: self.name_organization.unwrap_or_default(),
                deadline,
                category_id,
                bonus: self.bonus.unwrap_or_default(),
                location: self.location.unwrap_or_default(),
                link: self.link.unwrap_or_default(),
                description,
            },
        ))
    }
}

/// Distinguishes a missing `deadline` key (outer `None`) from an explicit
/// `null` (`Some(None)`). Accepts RFC 3339 timestamps or bare `YYYY-MM-DD`.
fn present_deadline<'de, D>(deserializer: D) -> std::result::Result<Option<Option<DateTime<Utc>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(Some(None));
    };
    parse_deadline(&raw)
        .map(|d| Some(Some(d)))
        .ok_or_else(|| serde::de::Error::custom(format!("invalid deadline '{raw}'")))
}

pub fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Subscriber of one or more categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub username: Option<String>,
    /// Subscription enabled flag.
    pub has_mailing: bool,
}

/// Which users a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailingType {
    Subscribed,
    Unsubscribed,
    All,
}

impl MailingType {
    pub fn includes(&self, recipient: &Recipient) -> bool {
        match self {
            MailingType::Subscribed => recipient.has_mailing,
            MailingType::Unsubscribed => !recipient.has_mailing,
            MailingType::All => true,
        }
    }
}

impl std::str::FromStr for MailingType {
    type Err = crate::error::ProCharityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subscribed" => Ok(Self::Subscribed),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "all" => Ok(Self::All),
            other => Err(crate::error::ProCharityError::Validation(format!(
                "unknown mailing type '{other}' (expected subscribed, unsubscribed or all)"
            ))),
        }
    }
}

impl std::fmt::Display for MailingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailingType::Subscribed => write!(f, "subscribed"),
            MailingType::Unsubscribed => write!(f, "unsubscribed"),
            MailingType::All => write!(f, "all"),
        }
    }
}

/// What a notification job was created for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Outreach for a newly added or re-activated task.
    Task(TaskId),
    /// Operator broadcast, backed by a stored notification row.
    Broadcast { notification_id: i64 },
}

/// Outcome of one job after every recipient send was attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub job_id: String,
    pub source: JobSource,
    pub message: String,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<(RecipientId, String)>,
    /// Recipients never attempted because shutdown was signalled first.
    pub skipped_after_shutdown: Vec<RecipientId>,
    pub chunk_sizes: Vec<usize>,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fills_optional_fields() {
        let raw = r#"[{"id": 7, "title": "Logo", "description": "Need a logo",
                      "deadline": "2024-05-01", "category_id": 3}]"#;
        let batch: Vec<IncomingTask> = serde_json::from_str(raw).unwrap();
        let task = batch.into_iter().next().unwrap().validate().unwrap();
        assert_eq!(task.id, 7);
        assert_eq!(task.fields.bonus, 0);
        assert_eq!(task.fields.link, "");
        assert!(!task.archived);
        assert_eq!(
            task.fields.deadline,
            Some(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc())
        );
    }

    #[test]
    fn test_null_deadline_is_not_missing() {
        let raw = r#"{"id": 1, "title": "t", "description": "d", "deadline": null, "category_id": 1}"#;
        let incoming: IncomingTask = serde_json::from_str(raw).unwrap();
        assert_eq!(incoming.deadline, Some(None));
        assert!(incoming.validate().unwrap().fields.deadline.is_none());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let raw = r#"{"id": 4, "title": "t", "deadline": null, "category_id": 1}"#;
        let incoming: IncomingTask = serde_json::from_str(raw).unwrap();
        let rejected = incoming.validate().unwrap_err();
        assert_eq!(rejected.id, Some(4));
        assert!(rejected.reason.contains("description"));
    }

    #[test]
    fn test_mailing_type_parse() {
        assert_eq!("All".parse::<MailingType>().unwrap(), MailingType::All);
        assert!("nobody".parse::<MailingType>().is_err());
        let off = Recipient { id: 1, username: None, has_mailing: false };
        assert!(MailingType::Unsubscribed.includes(&off));
        assert!(!MailingType::Subscribed.includes(&off));
    }
}
