//! Persistence layer for agentmill.
//!
//! The [`Store`] capability set is the only authority on durable state;
//! every worker expresses intent as store calls and holds nothing but
//! transient snapshots. Two backends implement it: [`PgStore`] (PostgreSQL
//! via sqlx, with LISTEN/NOTIFY) and [`MemoryStore`] (in-process, same
//! claim/seq/notification semantics, used by tests and embedders).

pub mod memory;
pub mod notify;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
pub use notify::{Notification, NotifyKind};
pub use postgres::PgStore;
pub use traits::{
    CompactionApply, CoordinationOps, IterationRecord, RegistryOps, RunFilter, RunOps,
    SessionOps, Store, ToolDisposition, ToolOps,
};
