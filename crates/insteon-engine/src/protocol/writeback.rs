//! Pushing `Changed` cached records back out to the physical tables.
//!
//! Device write-back rewrites records in place at their table addresses over
//! the 0x2F write command. Hub write-back has no addresses to aim at, so it
//! goes through the IM's record management: modify-or-add for live records,
//! delete-first for tombstones, with a duplicate purge when the hub table
//! has accumulated several copies of the same link.

use crate::command::{Command, CommandKind, DeviceFrame};
use crate::error::{CommandOutcome, ErrorKind};
use crate::protocol::device_db::{CMD2_DATABASE_DELTA, CMD_GET_DATABASE_DELTA, CMD_READ_WRITE_ALDB};
use crate::protocol::im_records::{manage_record, ControlCode};
use crate::session::{CancelToken, HubSession};
use insteon_linkdb::record::RecordFlags;
use insteon_linkdb::{LinkDatabase, SyncStatus};
use insteon_wire::{AllLinkRecordMessage, DeviceAddress};
use tracing::{debug, info, warn};

/// What a write-back pass accomplished.
#[derive(Debug)]
pub struct WriteBackReport {
    pub outcome: CommandOutcome,
    /// Records created or updated on the physical side.
    pub written: usize,
    /// Tombstones resolved (physical record deleted or already gone).
    pub deleted: usize,
}

impl WriteBackReport {
    fn ok(written: usize, deleted: usize) -> Self {
        WriteBackReport {
            outcome: CommandOutcome::success(1),
            written,
            deleted,
        }
    }

    fn failed(outcome: CommandOutcome, written: usize, deleted: usize) -> Self {
        WriteBackReport {
            outcome,
            written,
            deleted,
        }
    }
}

fn record_write_command(target: DeviceAddress, address: u16, payload: &AllLinkRecordMessage) -> Command {
    let mut data13 = [0u8; 13];
    data13[1] = 0x02; // write
    data13[2] = (address >> 8) as u8;
    data13[3] = (address & 0xFF) as u8;
    data13[4] = 8; // record length
    data13[5..13].copy_from_slice(&payload.encode());
    // the write is acknowledged with a plain standard ACK
    Command::device(
        "write_link_record",
        target,
        DeviceFrame::extended(CMD_READ_WRITE_ALDB, 0x00, data13),
    )
    .with_kind(CommandKind::DeviceStandard)
}

/// Write every `Changed` record of a device cache out to the device.
///
/// Tombstones are written with the in-use bit cleared and kept in place, so
/// later slots keep their table addresses; live records are marked `Synced`
/// once the device acknowledges. The device's change counter is re-read
/// afterwards into `db.revision`.
pub async fn write_back_device(
    session: &HubSession,
    target: DeviceAddress,
    db: &mut LinkDatabase,
    cancel: &CancelToken,
) -> WriteBackReport {
    let changed: Vec<uuid::Uuid> = db.changed_records().map(|r| r.uid).collect();
    if changed.is_empty() {
        return WriteBackReport::ok(0, 0);
    }
    let guard = session.gate.acquire("write_back_device").await;

    let mut written = 0;
    let mut deleted = 0;
    for uid in changed {
        let Some(rec) = db.find_by_uid(uid) else {
            continue;
        };
        let (address, payload, is_tombstone) = (rec.address, rec.to_wire(), !rec.is_in_use());
        let reply = session
            .run_sub(record_write_command(target, address, &payload), cancel)
            .await;
        if !reply.outcome.success {
            warn!(
                device = %target,
                address,
                error = %reply.outcome.error,
                "record write failed, aborting pass"
            );
            drop(guard);
            let outcome = if reply.outcome.is_cancelled() {
                reply.outcome
            } else {
                CommandOutcome::failure(ErrorKind::SubCommandFailed, reply.outcome.attempts)
            };
            return WriteBackReport::failed(outcome, written, deleted);
        }
        // either way the physical table now matches the cached record; a
        // device tombstone stays in place because dropping the slot would
        // shift every later record away from its table address
        if let Some(i) = db.records().iter().position(|r| r.uid == uid) {
            db.get_mut(i).expect("position within bounds").sync_status = SyncStatus::Synced;
        }
        if is_tombstone {
            deleted += 1;
        } else {
            written += 1;
        }
    }

    // refresh the change counter so the next read can detect outside edits
    let delta_cmd = Command::device(
        "read_database_delta",
        target,
        DeviceFrame::standard(CMD_GET_DATABASE_DELTA, CMD2_DATABASE_DELTA),
    );
    let delta = session.run_sub(delta_cmd, cancel).await;
    drop(guard);
    if let Some(ack) = &delta.response.standard {
        db.revision = Some(ack.cmd1);
    } else {
        warn!(device = %target, "could not refresh database delta after write-back");
    }

    info!(device = %target, written, deleted, "device write-back complete");
    WriteBackReport::ok(written, deleted)
}

/// Search key for the IM's record management: it matches on destination and
/// group, with the in-use bit set the way live hub records carry it.
fn search_key(payload: &AllLinkRecordMessage) -> AllLinkRecordMessage {
    AllLinkRecordMessage {
        flags: payload.flags | RecordFlags::IN_USE,
        ..*payload
    }
}

/// Count the hub records matching `key`'s destination and group.
async fn count_matches(
    session: &HubSession,
    key: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> Result<usize, CommandOutcome> {
    let mut count = 0;
    let mut control = ControlCode::FindFirst;
    loop {
        let reply = manage_record(session, "im_count_links", control, key, cancel).await;
        if reply.outcome.success {
            count += 1;
            control = ControlCode::FindNext;
        } else if reply.outcome.error == ErrorKind::Nak {
            return Ok(count);
        } else {
            return Err(reply.outcome);
        }
    }
}

/// Delete every hub record matching `key`. NAK means none left.
async fn delete_all_matches(
    session: &HubSession,
    key: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> Result<usize, CommandOutcome> {
    let mut removed = 0;
    loop {
        let reply = manage_record(session, "im_delete_link", ControlCode::DeleteFirst, key, cancel).await;
        if reply.outcome.success {
            removed += 1;
        } else if reply.outcome.error == ErrorKind::Nak {
            return Ok(removed);
        } else {
            return Err(reply.outcome);
        }
    }
}

/// Write one live record to the hub: the direction-specific modify control
/// first, falling back to plain modify-or-add for IMs that reject it.
async fn write_hub_record(
    session: &HubSession,
    payload: &AllLinkRecordMessage,
    cancel: &CancelToken,
) -> CommandOutcome {
    let specific = if payload.flags & RecordFlags::CONTROLLER != 0 {
        ControlCode::ModifyControllerOrAdd
    } else {
        ControlCode::ModifyResponderOrAdd
    };
    let reply = manage_record(session, "im_modify_link", specific, payload, cancel).await;
    if reply.outcome.success || reply.outcome.error != ErrorKind::Nak {
        return reply.outcome;
    }
    debug!("direction-specific modify refused, retrying with plain modify-or-add");
    manage_record(session, "im_modify_link", ControlCode::ModifyOrAdd, payload, cancel)
        .await
        .outcome
}

/// Write every `Changed` record of the hub cache out through the IM.
pub async fn write_back_hub(
    session: &HubSession,
    db: &mut LinkDatabase,
    cancel: &CancelToken,
) -> WriteBackReport {
    let changed: Vec<uuid::Uuid> = db.changed_records().map(|r| r.uid).collect();
    if changed.is_empty() {
        return WriteBackReport::ok(0, 0);
    }
    let guard = session.gate.acquire("write_back_hub").await;

    let mut written = 0;
    let mut deleted = 0;
    for uid in changed {
        let Some(rec) = db.find_by_uid(uid) else {
            continue;
        };
        let (payload, is_tombstone) = (rec.to_wire(), !rec.is_in_use());
        let key = search_key(&payload);

        let result = if is_tombstone {
            match manage_record(session, "im_delete_link", ControlCode::DeleteFirst, &key, cancel)
                .await
                .outcome
            {
                // NAK means the hub never had it; the tombstone is resolved
                outcome if outcome.success || outcome.error == ErrorKind::Nak => {
                    db.remove_by_uid(uid);
                    deleted += 1;
                    CommandOutcome::success(1)
                }
                outcome => outcome,
            }
        } else {
            let outcome = match count_matches(session, &key, cancel).await {
                Ok(n) if n > 1 => {
                    // several stale copies; purge them all, then recreate
                    warn!(destination = %payload.destination, group = payload.group, copies = n, "purging duplicate hub records");
                    match delete_all_matches(session, &key, cancel).await {
                        Ok(_) => write_hub_record(session, &payload, cancel).await,
                        Err(bad) => bad,
                    }
                }
                Ok(_) => write_hub_record(session, &payload, cancel).await,
                Err(bad) => bad,
            };
            if outcome.success {
                if let Some(i) = db.records().iter().position(|r| r.uid == uid) {
                    db.get_mut(i).expect("position within bounds").sync_status = SyncStatus::Synced;
                }
                written += 1;
            }
            outcome
        };

        if !result.success {
            warn!(
                destination = %payload.destination,
                group = payload.group,
                error = %result.error,
                "hub record write failed, aborting pass"
            );
            drop(guard);
            let outcome = if result.is_cancelled() {
                result
            } else {
                CommandOutcome::failure(ErrorKind::SubCommandFailed, result.attempts)
            };
            return WriteBackReport::failed(outcome, written, deleted);
        }
    }
    drop(guard);

    info!(written, deleted, "hub write-back complete");
    WriteBackReport::ok(written, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_write_framing() {
        let payload = AllLinkRecordMessage {
            flags: 0xE2,
            group: 0x01,
            destination: DeviceAddress::new(0x0A, 0x0B, 0x0C),
            data: [0x01, 0x02, 0x03],
        };
        let cmd = record_write_command(DeviceAddress::new(0x1A, 0x2B, 0x3C), 0x0FF7, &payload);
        assert_eq!(cmd.kind, CommandKind::DeviceStandard);
        let line = cmd.request_line();
        // write marker, address, length 8, then the record payload
        assert!(line.starts_with("/3?02621A2B3C1F2F0000020FF708E2010A0B0C010203"));
    }

    #[test]
    fn test_search_key_restores_in_use() {
        let mut payload = AllLinkRecordMessage {
            flags: RecordFlags::USED | RecordFlags::CONTROLLER,
            group: 0x01,
            destination: DeviceAddress::new(1, 2, 3),
            data: [0; 3],
        };
        payload.flags &= !RecordFlags::IN_USE;
        let key = search_key(&payload);
        assert_ne!(key.flags & RecordFlags::IN_USE, 0);
        assert_eq!(key.group, payload.group);
    }
}
