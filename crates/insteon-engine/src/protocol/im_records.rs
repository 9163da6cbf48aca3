//! IM (hub) all-link record management over command 0x6F.
//!
//! Find operations wait for the follow-on 0x57 record; modify and delete
//! complete on the IM's ACK/NAK. A NAK on a find or delete means "no such
//! record", which callers interpret (end of search, idempotent delete), so
//! these commands run with a single attempt and never retry the NAK.

use crate::command::{Command, CommandKind};
use crate::error::CommandOutcome;
use crate::session::{CancelToken, HubSession};
use insteon_wire::message::IM_CMD_MANAGE_ALL_LINK_RECORD;
use insteon_wire::AllLinkRecordMessage;

/// Control codes of the manage-all-link-record command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    FindFirst = 0x00,
    FindNext = 0x01,
    ModifyOrAdd = 0x20,
    ModifyControllerOrAdd = 0x40,
    ModifyResponderOrAdd = 0x41,
    DeleteFirst = 0x80,
}

impl ControlCode {
    fn is_find(&self) -> bool {
        matches!(self, ControlCode::FindFirst | ControlCode::FindNext)
    }
}

/// Result of a record-management operation.
#[derive(Debug)]
pub struct RecordReply {
    pub outcome: CommandOutcome,
    /// The record a find operation turned up.
    pub record: Option<AllLinkRecordMessage>,
}

pub(crate) fn manage_record_command(
    name: &'static str,
    control: ControlCode,
    record: &AllLinkRecordMessage,
) -> Command {
    let mut params = format!("{:02X}", control as u8);
    for b in record.encode() {
        params.push_str(&format!("{:02X}", b));
    }
    let kind = if control.is_find() {
        CommandKind::AllLinkRecord
    } else {
        CommandKind::ImAck
    };
    Command::raw_im(name, IM_CMD_MANAGE_ALL_LINK_RECORD, params, kind).with_max_attempts(1)
}

pub(crate) async fn manage_record(
    session: &HubSession,
    name: &'static str,
    control: ControlCode,
    record: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> RecordReply {
    let reply = session
        .run_sub(manage_record_command(name, control, record), cancel)
        .await;
    RecordReply {
        outcome: reply.outcome,
        record: reply.response.record,
    }
}

/// Find the first hub record matching `key`'s destination and group.
pub async fn find_first(
    session: &HubSession,
    key: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> RecordReply {
    let _guard = session.gate.acquire("im_find_first").await;
    manage_record(session, "im_find_first", ControlCode::FindFirst, key, cancel).await
}

/// Continue a find started by [`find_first`].
pub async fn find_next(
    session: &HubSession,
    key: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> RecordReply {
    let _guard = session.gate.acquire("im_find_next").await;
    manage_record(session, "im_find_next", ControlCode::FindNext, key, cancel).await
}

/// Modify the first matching hub record, or add one.
pub async fn modify_or_add(
    session: &HubSession,
    record: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> RecordReply {
    let _guard = session.gate.acquire("im_modify_or_add").await;
    manage_record(
        session,
        "im_modify_or_add",
        ControlCode::ModifyOrAdd,
        record,
        cancel,
    )
    .await
}

/// Delete the first matching hub record. A NAK outcome means "not found".
pub async fn delete_first(
    session: &HubSession,
    record: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> RecordReply {
    let _guard = session.gate.acquire("im_delete_first").await;
    manage_record(
        session,
        "im_delete_first",
        ControlCode::DeleteFirst,
        record,
        cancel,
    )
    .await
}
