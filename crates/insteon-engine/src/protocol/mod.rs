//! Multi-step "macro" protocols composed from primitive commands.
//!
//! Each entry point here acquires the session's execution gate once and runs
//! its sub-commands inside it, so the whole composition behaves as one
//! logical unit on the wire. Pure bookkeeping (merging, formatting) happens
//! after the gate is released.

pub mod device_db;
pub mod hub_db;
pub mod im_records;
pub mod linking;
pub mod writeback;

pub use device_db::{read_database_delta, read_device_database, DeviceDbReadOptions, DeviceDbReadReport};
pub use hub_db::{read_hub_database, sync_hub_database};
pub use im_records::{delete_first, find_first, find_next, modify_or_add, ControlCode, RecordReply};
pub use linking::{start_linking, LinkingMode, LinkingReport};
pub use writeback::{write_back_device, write_back_hub, WriteBackReport};
