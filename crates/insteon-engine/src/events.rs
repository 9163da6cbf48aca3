//! Typed events the response dispatcher emits.

use insteon_wire::{
    AllLinkRecordMessage, AllLinkingCompleted, CleanupFailure, ExtendedMessage, StandardMessage,
};
use serde::{Deserialize, Serialize};

/// One demultiplexed message from the hub's response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The IM echoed the in-flight command and terminated it with ACK.
    ImAck { code: u8 },
    /// The IM echoed the in-flight command and terminated it with NAK.
    ImNak { code: u8 },
    /// A bare ACK token (bare/hub command classes answer with these).
    HubAck,
    /// A bare NAK token.
    HubNak,
    Standard(StandardMessage),
    Extended(ExtendedMessage),
    AllLinkRecord(AllLinkRecordMessage),
    AllLinkingCompleted(AllLinkingCompleted),
    CleanupFailure(CleanupFailure),
    ButtonEvent { button: u8 },
    UserReset,
    CleanupStatus { status: u8 },
    X10 { raw: u8, flag: u8 },
}

/// What the command wants the dispatcher to do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep consuming the stream.
    Continue,
    /// The command is complete.
    Complete,
    /// Terminal failure with the given kind.
    Fail(crate::error::ErrorKind),
    /// Discard the hub buffer and refetch before the next header read.
    ClearBuffer,
}
