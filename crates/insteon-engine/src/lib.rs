//! Command execution engine for an INSTEON hub.
//!
//! The hub's HTTP gateway is a narrow pipe: requests go out as GET lines and
//! every response comes back through one shared, wrapping byte buffer. This
//! crate turns that into a usable command layer:
//! - **Command / runner**: commands are plain values; a retry state machine
//!   runs them with linear backoff under a session-wide execution gate, so
//!   exactly one exchange is on the wire at a time.
//! - **Dispatcher**: demultiplexes the shared buffer into typed events and
//!   recovers from ring-buffer wraparound instead of failing on it.
//! - **Protocols**: multi-step acquisitions built on top: device and hub
//!   link-database reads, IM record management, all-linking sessions, and
//!   write-back of locally edited records.
//!
//! Transport is injected behind [`transport::HubTransport`]; production code
//! uses the HTTP implementation, tests use [`testkit::FakeHub`].

pub mod command;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod protocol;
mod runner;
pub mod session;
pub mod testkit;
pub mod transport;

pub use command::{Command, CommandClass, CommandKind, CommandReply, DeviceFrame, ResponseSlot};
pub use error::{CommandOutcome, ErrorKind, TransportError};
pub use events::StreamEvent;
pub use session::{CancelToken, HubSession};
pub use transport::{HttpHubTransport, HubTransport, SessionConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
