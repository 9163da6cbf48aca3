//! Device link-database acquisition over the 0x2F read/write command.
//!
//! Records live at known byte addresses descending from the table top, so
//! the walk is slot by slot: read, validate the echoed address, merge, stop
//! at the high-water mark. Devices drop record responses routinely, which is
//! why record reads get a much larger attempt budget than ordinary commands
//! and an exhausted slot is logged as missed rather than aborting the whole
//! acquisition.

use crate::command::{Command, CommandReply, DeviceFrame};
use crate::error::{CommandOutcome, ErrorKind};
use crate::session::{CancelToken, HubSession};
use insteon_linkdb::merge::merge_device_record;
use insteon_linkdb::record::{address_for_seq, seq_for_address, RecordFlags};
use insteon_linkdb::{LinkDatabase, LinkRecord, SyncStatus};
use insteon_wire::{AllLinkRecordMessage, DeviceAddress};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Read/write-ALDB extended command.
pub(crate) const CMD_READ_WRITE_ALDB: u8 = 0x2F;
/// Get-database-delta standard command.
pub(crate) const CMD_GET_DATABASE_DELTA: u8 = 0x19;
pub(crate) const CMD2_DATABASE_DELTA: u8 = 0x02;

/// Marker at Data2 of a record response.
const RESPONSE_RECORD: u8 = 0x01;
/// Data2 values of the request direction.
const REQUEST_READ: u8 = 0x00;
const REQUEST_WRITE: u8 = 0x02;

/// Attempt budget for a single record read; devices shed these responses
/// under traffic far more often than ordinary direct commands.
const RECORD_READ_ATTEMPTS: u32 = 15;

/// Tuning for [`read_device_database`].
#[derive(Debug, Clone)]
pub struct DeviceDbReadOptions {
    /// Ask the device to stream its whole table in one request first, then
    /// fill the gaps record by record. Cuts reads drastically when it works,
    /// but many devices truncate the stream, so it is off by default.
    pub try_bulk_read: bool,
    /// Attempts per individual record read.
    pub record_attempts: u32,
    /// Hard cap on table length, as a guard against a device that never
    /// produces a high-water mark.
    pub max_records: usize,
}

impl Default for DeviceDbReadOptions {
    fn default() -> Self {
        DeviceDbReadOptions {
            try_bulk_read: false,
            record_attempts: RECORD_READ_ATTEMPTS,
            max_records: 512,
        }
    }
}

/// What a database acquisition accomplished.
#[derive(Debug)]
pub struct DeviceDbReadReport {
    pub outcome: CommandOutcome,
    /// Records actually obtained from the device this run.
    pub records_read: usize,
    /// Slots that exhausted their attempt budget and were skipped.
    pub missed: Vec<usize>,
}

fn record_read_command(target: DeviceAddress, seq: usize, attempts: u32) -> Command {
    let address = address_for_seq(seq);
    let mut data13 = [0u8; 13];
    data13[1] = REQUEST_READ;
    data13[2] = (address >> 8) as u8;
    data13[3] = (address & 0xFF) as u8;
    data13[4] = 0x01; // one record
    Command::device(
        "read_link_record",
        target,
        DeviceFrame::extended(CMD_READ_WRITE_ALDB, 0x00, data13),
    )
    .with_max_attempts(attempts)
}

fn bulk_read_command(target: DeviceAddress) -> Command {
    // address and count zero: dump the whole table
    Command::device(
        "read_link_table",
        target,
        DeviceFrame::extended(CMD_READ_WRITE_ALDB, 0x00, [0u8; 13]),
    )
    .with_kind(crate::command::CommandKind::ExtendedStream)
    .with_max_attempts(1)
}

/// Pull the record and its echoed table address out of a 0x2F response.
fn parse_record_response(data: &[u8]) -> Option<(u16, AllLinkRecordMessage)> {
    if data.len() < 13 || data[1] != RESPONSE_RECORD {
        return None;
    }
    let address = u16::from_be_bytes([data[2], data[3]]);
    let record = AllLinkRecordMessage::decode(&data[5..13])?;
    Some((address, record))
}

/// Pad the cache with unknown placeholders up to (not including) `seq`, so
/// a record merged past a missed slot still lands at its real address.
fn ensure_slot(db: &mut LinkDatabase, seq: usize) {
    while db.len() < seq {
        let blank = AllLinkRecordMessage {
            flags: RecordFlags::IN_USE | RecordFlags::USED,
            group: 0,
            destination: DeviceAddress::NONE,
            data: [0; 3],
        };
        db.push(LinkRecord::from_physical(db.len(), &blank, SyncStatus::Unknown));
    }
}

/// Read the device's link table into the cache, resuming from
/// `db.next_unread_seq`.
///
/// `known_destination` answers whether a destination address belongs to a
/// device the caller still models; the merge consults it before adopting a
/// diverging physical record.
pub async fn read_device_database(
    session: &HubSession,
    target: DeviceAddress,
    db: &mut LinkDatabase,
    known_destination: &dyn Fn(DeviceAddress) -> bool,
    options: &DeviceDbReadOptions,
    cancel: &CancelToken,
) -> DeviceDbReadReport {
    let guard = session.gate.acquire("read_device_database").await;

    let mut collected: BTreeMap<usize, AllLinkRecordMessage> = BTreeMap::new();
    let mut missed = Vec::new();
    let mut outcome = CommandOutcome::success(1);
    let mut resume_seq = db.next_unread_seq;

    if options.try_bulk_read {
        let reply = session.run_sub(bulk_read_command(target), cancel).await;
        for msg in &reply.response.extended_stream {
            if let Some((address, record)) = parse_record_response(&msg.data) {
                if let Some(seq) = seq_for_address(address) {
                    collected.insert(seq, record);
                }
            }
        }
        debug!(
            device = %target,
            records = collected.len(),
            "bulk table read yielded partial table"
        );
        if reply.outcome.is_cancelled() {
            drop(guard);
            return DeviceDbReadReport {
                outcome: reply.outcome,
                records_read: collected.len(),
                missed,
            };
        }
    }

    let mut seq = db.next_unread_seq;
    'walk: while seq < options.max_records {
        let record = match collected.get(&seq) {
            Some(record) => *record,
            None => {
                let reply = session
                    .run_sub(record_read_command(target, seq, options.record_attempts), cancel)
                    .await;
                match extract_record(&reply, seq) {
                    RecordRead::Got(record) => {
                        collected.insert(seq, record);
                        record
                    }
                    RecordRead::Missed(kind) => {
                        warn!(device = %target, seq, error = %kind, "record read exhausted, skipping slot");
                        missed.push(seq);
                        seq += 1;
                        continue 'walk;
                    }
                    RecordRead::Abort(bad) => {
                        outcome = bad;
                        resume_seq = seq;
                        break 'walk;
                    }
                }
            }
        };
        if record.flags & RecordFlags::USED == 0 {
            // high-water mark: table ends here
            resume_seq = 0;
            break 'walk;
        }
        resume_seq = seq + 1;
        seq += 1;
    }
    if seq >= options.max_records {
        warn!(device = %target, cap = options.max_records, "table never produced a high-water mark");
        outcome = CommandOutcome::failure(ErrorKind::SubCommandFailed, 1);
        resume_seq = seq;
    }
    drop(guard);

    // merge after the gate is released; pure bookkeeping from here on
    let records_read = collected.len();
    for (seq, record) in &collected {
        ensure_slot(db, *seq);
        merge_device_record(db, *seq, record, known_destination);
        if record.flags & RecordFlags::USED == 0 {
            break;
        }
    }
    db.next_unread_seq = resume_seq;

    if outcome.success {
        info!(
            device = %target,
            records = records_read,
            missed = missed.len(),
            "device database read complete"
        );
    }
    DeviceDbReadReport {
        outcome,
        records_read,
        missed,
    }
}

enum RecordRead {
    Got(AllLinkRecordMessage),
    /// Exhausted its budget on a response failure; the walk continues.
    Missed(ErrorKind),
    /// Hard failure; the walk stops and the cursor stays at this slot.
    Abort(CommandOutcome),
}

fn extract_record(reply: &CommandReply, seq: usize) -> RecordRead {
    if !reply.outcome.success {
        if reply.outcome.is_cancelled() || !reply.outcome.error.is_recoverable() {
            return RecordRead::Abort(reply.outcome);
        }
        return RecordRead::Missed(reply.outcome.error);
    }
    let Some(msg) = &reply.response.extended else {
        return RecordRead::Missed(ErrorKind::NoDeviceExtendedResponse);
    };
    let Some((address, record)) = parse_record_response(&msg.data) else {
        return RecordRead::Missed(ErrorKind::NoDeviceExtendedResponse);
    };
    // a response for the wrong slot means request/response aliasing; the
    // stream cannot be trusted from here
    if seq_for_address(address) != Some(seq) {
        warn!(
            expected = address_for_seq(seq),
            got = address,
            "record response for unexpected table address"
        );
        return RecordRead::Abort(CommandOutcome::failure(ErrorKind::SubCommandFailed, 1));
    }
    RecordRead::Got(record)
}

/// Read the device's database-change counter (0x19/0x02); the device reports
/// it in Command1 of the direct ACK.
pub async fn read_database_delta(
    session: &HubSession,
    target: DeviceAddress,
    cancel: &CancelToken,
) -> Result<u8, CommandOutcome> {
    let command = Command::device(
        "read_database_delta",
        target,
        DeviceFrame::standard(CMD_GET_DATABASE_DELTA, CMD2_DATABASE_DELTA),
    );
    let reply = session.run_cancellable(command, cancel).await;
    if !reply.outcome.success {
        return Err(reply.outcome);
    }
    match reply.response.standard {
        Some(ack) => Ok(ack.cmd1),
        None => Err(CommandOutcome::failure(ErrorKind::NoDeviceStandardResponse, reply.outcome.attempts)),
    }
}
