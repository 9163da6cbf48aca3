//! Cached link-database model and reconciliation.
//!
//! INSTEON devices and the hub IM each hold a table of link records. This
//! crate owns the logical (cached) form of those tables and the three-way
//! merge that folds a freshly read physical table back into the cache:
//! - **LinkRecord / LinkDatabase**: the cached model, with tri-state sync
//!   tracking per record (`Synced` / `Changed` / `Unknown`).
//! - **merge**: record-by-record reconciliation for devices (addressable
//!   tables) and content-similarity matching for the hub (which reports no
//!   record addresses).
//!
//! Writing divergent records back out is transport work and lives in the
//! engine crate; everything here is pure.

pub mod database;
pub mod merge;
pub mod record;

pub use database::LinkDatabase;
pub use record::{LinkRecord, RecordFlags, SyncStatus, RECORD_SIZE, TABLE_TOP};
