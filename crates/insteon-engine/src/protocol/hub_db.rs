//! Hub (IM) link-database acquisition.
//!
//! The IM iterates its table through get-first (0x69) / get-next (0x6A);
//! each ACK is followed by an 0x57 record, and a NAK means the end of the
//! table was reached. The records come back with no addresses, so the merge
//! is the content-matching one.

use crate::command::{Command, CommandKind};
use crate::error::{CommandOutcome, ErrorKind};
use crate::session::{CancelToken, HubSession};
use insteon_linkdb::merge::merge_hub_records;
use insteon_linkdb::LinkDatabase;
use insteon_wire::message::{IM_CMD_GET_FIRST_ALL_LINK_RECORD, IM_CMD_GET_NEXT_ALL_LINK_RECORD};
use insteon_wire::AllLinkRecordMessage;
use tracing::{debug, info};

fn get_record_command(first: bool) -> Command {
    let (name, code) = if first {
        ("im_get_first_record", IM_CMD_GET_FIRST_ALL_LINK_RECORD)
    } else {
        ("im_get_next_record", IM_CMD_GET_NEXT_ALL_LINK_RECORD)
    };
    // NAK is the normal end-of-table signal here; never retry it
    Command::raw_im(name, code, String::new(), CommandKind::AllLinkRecord).with_max_attempts(1)
}

/// Read the hub's complete link table, in order.
pub async fn read_hub_database(
    session: &HubSession,
    cancel: &CancelToken,
) -> Result<Vec<AllLinkRecordMessage>, CommandOutcome> {
    let _guard = session.gate.acquire("read_hub_database").await;
    let mut records = Vec::new();
    let mut first = true;
    loop {
        let reply = session.run_sub(get_record_command(first), cancel).await;
        first = false;
        if reply.outcome.success {
            match reply.response.record {
                Some(record) => {
                    debug!(
                        seq = records.len(),
                        destination = %record.destination,
                        "hub record received"
                    );
                    records.push(record);
                }
                // completed without a record: treat as a hard protocol error
                None => return Err(CommandOutcome::failure(ErrorKind::NoRecordResponse, 1)),
            }
        } else if reply.outcome.error == ErrorKind::Nak {
            // end of table
            info!(count = records.len(), "hub database read complete");
            return Ok(records);
        } else {
            return Err(reply.outcome);
        }
    }
}

/// Read the hub table and fold it into the cached database.
pub async fn sync_hub_database(
    session: &HubSession,
    db: &mut LinkDatabase,
    cancel: &CancelToken,
) -> CommandOutcome {
    match read_hub_database(session, cancel).await {
        Ok(records) => {
            // merge runs outside the gate
            merge_hub_records(db, &records);
            CommandOutcome::success(1)
        }
        Err(outcome) if outcome.is_cancelled() => outcome,
        Err(outcome) => {
            // fold, keeping the macro's contract; the sub-command kind was
            // already logged where it failed
            CommandOutcome::failure(ErrorKind::SubCommandFailed, outcome.attempts)
        }
    }
}
