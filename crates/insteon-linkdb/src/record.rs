//! Link records and their sync state.

use insteon_wire::{AllLinkRecordMessage, DeviceAddress};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top of the link table; record addresses descend from here.
pub const TABLE_TOP: u16 = 0x0FFF;
/// On-device size of one record in bytes.
pub const RECORD_SIZE: u16 = 8;

/// Address of the record at a given 0-based sequence slot.
pub fn address_for_seq(seq: usize) -> u16 {
    TABLE_TOP - RECORD_SIZE * seq as u16
}

/// Sequence slot for a record address, `None` when the address does not sit
/// on a record boundary.
pub fn seq_for_address(address: u16) -> Option<usize> {
    if address > TABLE_TOP {
        return None;
    }
    let delta = TABLE_TOP - address;
    if delta % RECORD_SIZE != 0 {
        return None;
    }
    Some((delta / RECORD_SIZE) as usize)
}

/// Bit masks of the record flags byte.
pub struct RecordFlags;

impl RecordFlags {
    /// Record is in use (cleared means tombstoned).
    pub const IN_USE: u8 = 0x80;
    /// Controller link (cleared means responder).
    pub const CONTROLLER: u8 = 0x40;
    /// Set on every record that has ever been written; the one record with
    /// this bit clear is the high-water mark terminating the table.
    pub const USED: u8 = 0x02;
}

/// Sync state of a cached record relative to the physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    /// Cached and physical copies agree.
    Synced,
    /// The cached copy diverges and must be written out.
    Changed,
    /// Never compared against the physical table.
    #[default]
    Unknown,
}

/// One cached link record.
///
/// `uid` is an opaque identity token higher layers use to track a record
/// across merges; it never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Byte address in the device's table (descending from [`TABLE_TOP`]).
    pub address: u16,
    pub flags: u8,
    pub group: u8,
    pub destination: DeviceAddress,
    pub data: [u8; 3],
    pub sync_status: SyncStatus,
    pub uid: Uuid,
}

impl LinkRecord {
    /// A new in-use record, marked `Changed` so it gets written out.
    pub fn new(controller: bool, group: u8, destination: DeviceAddress, data: [u8; 3]) -> Self {
        let mut flags = RecordFlags::IN_USE | RecordFlags::USED;
        if controller {
            flags |= RecordFlags::CONTROLLER;
        }
        LinkRecord {
            address: TABLE_TOP,
            flags,
            group,
            destination,
            data,
            sync_status: SyncStatus::Changed,
            uid: Uuid::new_v4(),
        }
    }

    /// A high-water-mark sentinel at the given slot.
    pub fn high_water(seq: usize) -> Self {
        LinkRecord {
            address: address_for_seq(seq),
            flags: 0,
            group: 0,
            destination: DeviceAddress::NONE,
            data: [0; 3],
            sync_status: SyncStatus::Synced,
            uid: Uuid::new_v4(),
        }
    }

    /// Build a cached record from a physical one, at a slot, with a status.
    pub fn from_physical(seq: usize, phys: &AllLinkRecordMessage, status: SyncStatus) -> Self {
        LinkRecord {
            address: address_for_seq(seq),
            flags: phys.flags,
            group: phys.group,
            destination: phys.destination,
            data: phys.data,
            sync_status: status,
            uid: Uuid::new_v4(),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & RecordFlags::IN_USE != 0
    }

    pub fn is_controller(&self) -> bool {
        self.flags & RecordFlags::CONTROLLER != 0
    }

    /// High-water mark: the USED bit has never been set.
    pub fn is_high_water(&self) -> bool {
        self.flags & RecordFlags::USED == 0
    }

    /// The wire form of this record's payload.
    pub fn to_wire(&self) -> AllLinkRecordMessage {
        AllLinkRecordMessage {
            flags: self.flags,
            group: self.group,
            destination: self.destination,
            data: self.data,
        }
    }

    /// Whether this record's payload equals a physical record exactly.
    pub fn payload_eq(&self, phys: &AllLinkRecordMessage) -> bool {
        self.flags == phys.flags
            && self.group == phys.group
            && self.destination == phys.destination
            && self.data == phys.data
    }

    /// Payload comparison ignoring the in-use bit, used when reconciling
    /// tombstones whose physical twin may or may not have been deleted yet.
    pub fn payload_eq_ignoring_in_use(&self, phys: &AllLinkRecordMessage) -> bool {
        (self.flags | RecordFlags::IN_USE) == (phys.flags | RecordFlags::IN_USE)
            && self.group == phys.group
            && self.destination == phys.destination
            && self.data == phys.data
    }

    /// Whether this record and a physical one describe the same link:
    /// same destination, group and controller/responder direction. Used by
    /// the hub merge, which has no record addresses to key on.
    pub fn same_link(&self, phys: &AllLinkRecordMessage) -> bool {
        self.destination == phys.destination
            && self.group == phys.group
            && self.is_controller() == (phys.flags & RecordFlags::CONTROLLER != 0)
    }

    /// Adopt a physical record's payload, keeping identity and address.
    pub fn adopt_payload(&mut self, phys: &AllLinkRecordMessage) {
        self.flags = phys.flags;
        self.group = phys.group;
        self.destination = phys.destination;
        self.data = phys.data;
    }
}
