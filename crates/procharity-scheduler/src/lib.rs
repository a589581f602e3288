//! # ProCharity Scheduler
//!
//! Reconciles inbound task batches against the store and paces the
//! resulting Telegram outreach.
//!
//! ## Architecture
//! ```text
//! TaskEngine::ingest(batch)
//!   ├── validate records            (rejected ids keep their stored state)
//!   ├── Reconciler (one transaction) → added / updated / archived / unarchived
//!   │     └── Fingerprint over title + description + deadline
//!   ├── commit (or roll back, nothing sent)
//!   └── NotificationBatcher (added + unarchived only)
//!         └── PacedDispatcher: one job per task, 10s apart
//!               └── chunks of 30 recipients → DeliverySink
//! ```

pub mod dispatch;
pub mod engine;
pub mod fingerprint;
pub mod notify;
pub mod persistence;
pub mod reconcile;
pub mod store;

pub use dispatch::{DispatchStats, PacedDispatcher};
pub use engine::{BroadcastReport, IngestReport, TaskEngine};
pub use fingerprint::{Fingerprint, fingerprint};
pub use notify::{DeliveryHistory, NotificationBatcher, NotificationJob, render_task_message};
pub use persistence::TaskDb;
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::MemoryStore;
