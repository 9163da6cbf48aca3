//! Wire-level primitives for the INSTEON hub protocol.
//!
//! This crate covers everything below the command layer:
//! - **HexString / ResponseStream**: the hub's shared response buffer is a
//!   hex-pair encoded byte stream; `ResponseStream` is a cursor over it with
//!   bounded look-ahead, used by the response dispatcher.
//! - **Message views**: fixed-layout views over standard/extended INSTEON
//!   messages, all-link records and the asynchronous broadcasts the IM emits.
//! - **DeviceAddress**: the 24-bit device identifier.
//! - **Checksum**: the Data14 checksum carried by extended messages.
//!
//! Nothing in this crate talks to the network; it is pure byte plumbing.

pub mod address;
pub mod checksum;
pub mod hexstream;
pub mod message;

pub use address::DeviceAddress;
pub use checksum::{compute_checksum, verify_checksum};
pub use hexstream::{HexString, HexStreamError, ResponseStream};
pub use message::{
    AllLinkRecordMessage, AllLinkingCompleted, CleanupFailure, ExtendedMessage, MessageDirection,
    StandardMessage, ACK, EXTENDED_DATA_LEN, NAK, STX,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
