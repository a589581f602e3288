//! SQLite-backed persistence for tasks, subscriptions and sent notifications.
//! One connection behind a mutex: an open transaction holds the lock, so
//! reconciliation batches are serialized.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use procharity_core::error::{ProCharityError, Result};
use procharity_core::traits::{DeliveryLog, RecipientResolver, TaskRepository, TaskStore};
use procharity_core::types::{
    CategoryId, DeliveryReport, JobSource, MailingType, Recipient, RecipientId, Task, TaskFields,
    TaskId,
};

/// Max bound parameters per `IN (...)` lookup.
const ID_BATCH: usize = 500;

/// SQLite-backed task store and subscription directory.
pub struct TaskDb {
    conn: Mutex<Connection>,
}

impl TaskDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| ProCharityError::Store(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| ProCharityError::Store(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run migrations to create tables.
    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                archived INTEGER NOT NULL DEFAULT 0
            );

            -- Tasks keep the id assigned by the upstream site
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                name_organization TEXT NOT NULL DEFAULT '',
                deadline TEXT,                    -- RFC 3339, NULL = no deadline
                category_id INTEGER NOT NULL,
                bonus INTEGER NOT NULL DEFAULT 0,
                location TEXT NOT NULL DEFAULT '',
                link TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_archived ON tasks(archived);

            CREATE TABLE IF NOT EXISTS recipients (
                telegram_id INTEGER PRIMARY KEY,
                username TEXT,
                has_mailing INTEGER NOT NULL DEFAULT 1,
                banned INTEGER NOT NULL DEFAULT 0,
                date_registration TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipient_categories (
                telegram_id INTEGER NOT NULL,
                category_id INTEGER NOT NULL,
                PRIMARY KEY (telegram_id, category_id),
                FOREIGN KEY (telegram_id) REFERENCES recipients(telegram_id) ON DELETE CASCADE,
                FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
            );

            -- Sent task announcements and operator broadcasts
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message TEXT NOT NULL,
                task_id INTEGER,
                sent_by TEXT,
                was_sent INTEGER NOT NULL DEFAULT 0,
                delivered INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                sent_date TEXT
            );
            ",
        )
        .map_err(|e| ProCharityError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ProCharityError::Store(format!("DB lock poisoned: {e}")))
    }

    // ─── Recipients ──────────────────────────────────────

    /// Register a recipient or refresh its username/mailing flag.
    pub fn upsert_recipient(&self, id: RecipientId, username: Option<&str>, has_mailing: bool) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO recipients (telegram_id, username, has_mailing, date_registration)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(telegram_id) DO UPDATE SET
                    username = COALESCE(excluded.username, recipients.username),
                    has_mailing = excluded.has_mailing",
                params![id, username, has_mailing as i32, Utc::now().to_rfc3339()],
            )
            .map_err(|e| ProCharityError::Store(format!("Upsert recipient: {e}")))?;
        Ok(())
    }

    /// Toggle a recipient's subscription. Returns false if the recipient is unknown.
    pub fn set_mailing(&self, id: RecipientId, enabled: bool) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE recipients SET has_mailing = ?1 WHERE telegram_id = ?2",
                params![enabled as i32, id],
            )
            .map_err(|e| ProCharityError::Store(format!("Set mailing: {e}")))?;
        Ok(changed > 0)
    }

    /// Subscribe a recipient to a category, creating the category row if needed.
    pub fn subscribe(&self, id: RecipientId, category_id: CategoryId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("INSERT OR IGNORE INTO categories (id) VALUES (?1)", [category_id])
            .map_err(|e| ProCharityError::Store(format!("Subscribe: {e}")))?;
        conn.execute(
            "INSERT OR IGNORE INTO recipient_categories (telegram_id, category_id) VALUES (?1, ?2)",
            params![id, category_id],
        )
        .map_err(|e| ProCharityError::Store(format!("Subscribe: {e}")))?;
        Ok(())
    }

    fn query_recipients(&self, sql: &str, param: Option<i64>) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| ProCharityError::Resolver(format!("Prepare: {e}")))?;
        let map = |row: &rusqlite::Row<'_>| {
            Ok(Recipient {
                id: row.get(0)?,
                username: row.get(1)?,
                has_mailing: row.get::<_, i32>(2)? != 0,
            })
        };
        let rows = match param {
            Some(p) => stmt.query_map([p], map),
            None => stmt.query_map([], map),
        }
        .map_err(|e| ProCharityError::Resolver(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ProCharityError::Resolver(e.to_string()))
    }

    // ─── Notifications ──────────────────────────────────────

    /// Recent notifications, newest first.
    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, message, task_id, sent_by, was_sent, delivered, failed, created_at, sent_date
                 FROM notifications ORDER BY id DESC LIMIT ?1",
            )
            .map_err(ProCharityError::store)?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, i64>(0)?,
                    "message": row.get::<_, String>(1)?,
                    "task_id": row.get::<_, Option<i64>>(2)?,
                    "sent_by": row.get::<_, Option<String>>(3)?,
                    "was_sent": row.get::<_, i32>(4)? != 0,
                    "delivered": row.get::<_, i64>(5)?,
                    "failed": row.get::<_, i64>(6)?,
                    "created_at": row.get::<_, String>(7)?,
                    "sent_date": row.get::<_, Option<String>>(8)?,
                }))
            })
            .map_err(ProCharityError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ProCharityError::store)
    }
}

impl TaskRepository for TaskDb {
    fn begin(&self) -> Result<Box<dyn TaskStore + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| ProCharityError::Store(format!("Begin: {e}")))?;
        Ok(Box::new(SqliteTx { conn, open: true }))
    }
}

/// Open `BEGIN IMMEDIATE` transaction. Rolled back on drop unless committed.
pub struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    open: bool,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let deadline: Option<String> = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        fields: TaskFields {
            title: row.get(1)?,
            name_organization: row.get(2)?,
            deadline: deadline
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            category_id: row.get(4)?,
            bonus: row.get(5)?,
            location: row.get(6)?,
            link: row.get(7)?,
            description: row.get(8)?,
        },
        archived: row.get::<_, i32>(9)? != 0,
    })
}

impl SqliteTx<'_> {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(ProCharityError::Store("transaction already finished".into()))
        }
    }
}

impl TaskStore for SqliteTx<'_> {
    fn existing_ids(&mut self, ids: &[TaskId]) -> Result<BTreeSet<TaskId>> {
        self.ensure_open()?;
        let mut found = BTreeSet::new();
        for batch in ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!("SELECT id FROM tasks WHERE id IN ({placeholders})");
            let mut stmt = self.conn.prepare(&sql).map_err(ProCharityError::store)?;
            let rows = stmt
                .query_map(params_from_iter(batch.iter()), |row| row.get::<_, TaskId>(0))
                .map_err(ProCharityError::store)?;
            for id in rows {
                found.insert(id.map_err(ProCharityError::store)?);
            }
        }
        Ok(found)
    }

    fn get(&mut self, id: TaskId) -> Result<Option<Task>> {
        self.ensure_open()?;
        self.conn
            .query_row(
                "SELECT id, title, name_organization, deadline, category_id, bonus, location, link,
                        description, archived
                 FROM tasks WHERE id = ?1",
                [id],
                row_to_task,
            )
            .optional()
            .map_err(|e| ProCharityError::Store(format!("Get task {id}: {e}")))
    }

    fn active_ids(&mut self) -> Result<BTreeSet<TaskId>> {
        self.ensure_open()?;
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM tasks WHERE archived = 0")
            .map_err(ProCharityError::store)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, TaskId>(0))
            .map_err(ProCharityError::store)?;
        rows.collect::<rusqlite::Result<BTreeSet<_>>>()
            .map_err(ProCharityError::store)
    }

    fn insert(&mut self, task: &Task) -> Result<()> {
        self.ensure_open()?;
        let f = &task.fields;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO tasks (id, title, name_organization, deadline, category_id, bonus,
                                    location, link, description, archived, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    task.id,
                    f.title,
                    f.name_organization,
                    f.deadline.map(|d| d.to_rfc3339()),
                    f.category_id,
                    f.bonus,
                    f.location,
                    f.link,
                    f.description,
                    task.archived as i32,
                    now,
                ],
            )
            .map_err(|e| ProCharityError::Store(format!("Insert task {}: {e}", task.id)))?;
        Ok(())
    }

    fn update(&mut self, id: TaskId, f: &TaskFields) -> Result<()> {
        self.ensure_open()?;
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET title = ?2, name_organization = ?3, deadline = ?4, category_id = ?5,
                                  bonus = ?6, location = ?7, link = ?8, description = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    id,
                    f.title,
                    f.name_organization,
                    f.deadline.map(|d| d.to_rfc3339()),
                    f.category_id,
                    f.bonus,
                    f.location,
                    f.link,
                    f.description,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| ProCharityError::Store(format!("Update task {id}: {e}")))?;
        if changed == 0 {
            return Err(ProCharityError::Store(format!("task {id} not found")));
        }
        Ok(())
    }

    fn set_archived(&mut self, id: TaskId, archived: bool) -> Result<()> {
        self.ensure_open()?;
        self.conn
            .execute(
                "UPDATE tasks SET archived = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, archived as i32, Utc::now().to_rfc3339()],
            )
            .map_err(|e| ProCharityError::Store(format!("Archive task {id}: {e}")))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(ProCharityError::Store(format!("Commit: {e}")));
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| ProCharityError::Store(format!("Rollback: {e}")))
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!("⚠️ Uncommitted task transaction dropped, rolling back");
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

#[async_trait]
impl RecipientResolver for TaskDb {
    async fn subscribers_of(&self, category_id: CategoryId) -> Result<Vec<Recipient>> {
        self.query_recipients(
            "SELECT r.telegram_id, r.username, r.has_mailing
             FROM recipients r
             JOIN recipient_categories rc ON rc.telegram_id = r.telegram_id
             WHERE rc.category_id = ?1 AND r.has_mailing = 1 AND r.banned = 0
             ORDER BY r.telegram_id",
            Some(category_id),
        )
    }

    async fn recipients_by_mailing(&self, mailing: MailingType) -> Result<Vec<Recipient>> {
        let all = self.query_recipients(
            "SELECT telegram_id, username, has_mailing FROM recipients
             WHERE banned = 0 ORDER BY telegram_id",
            None,
        )?;
        Ok(all.into_iter().filter(|r| mailing.includes(r)).collect())
    }
}

impl DeliveryLog for TaskDb {
    fn open(&self, message: &str, sent_by: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications (message, sent_by, created_at) VALUES (?1, ?2, ?3)",
            params![message, sent_by, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ProCharityError::Store(format!("Save notification: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn record(&self, report: &DeliveryReport) -> Result<()> {
        let conn = self.lock()?;
        let sent = report.sent_at.to_rfc3339();
        let failed = report.failed.len() as i64;
        let delivered = report.delivered as i64;
        match &report.source {
            JobSource::Task(task_id) => conn.execute(
                "INSERT INTO notifications (message, task_id, was_sent, delivered, failed, created_at, sent_date)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)",
                params![report.message, task_id, delivered, failed, sent],
            ),
            JobSource::Broadcast { notification_id } => conn.execute(
                "UPDATE notifications SET was_sent = 1, delivered = ?2, failed = ?3, sent_date = ?4
                 WHERE id = ?1",
                params![notification_id, delivered, failed, sent],
            ),
        }
        .map_err(|e| ProCharityError::Store(format!("Mark sent: {e}")))?;
        Ok(())
    }
}
