//! The ordered cached link table.

use crate::record::{address_for_seq, LinkRecord, SyncStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordered, cached copy of a device's (or the hub's) link table.
///
/// Records are keyed by 0-based sequence slot; slot addresses descend from
/// the table top. A fully read table ends with exactly one high-water-mark
/// record; everything past it on the physical side is garbage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkDatabase {
    records: Vec<LinkRecord>,
    /// Device-reported change counter, `None` until first read.
    pub revision: Option<u8>,
    /// Whether the high-water mark has been observed.
    pub fully_read: bool,
    /// Resume cursor for interrupted acquisitions.
    pub next_unread_seq: usize,
}

impl LinkDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LinkRecord] {
        &self.records
    }

    pub fn get(&self, seq: usize) -> Option<&LinkRecord> {
        self.records.get(seq)
    }

    pub fn get_mut(&mut self, seq: usize) -> Option<&mut LinkRecord> {
        self.records.get_mut(seq)
    }

    pub fn find_by_uid(&self, uid: Uuid) -> Option<&LinkRecord> {
        self.records.iter().find(|r| r.uid == uid)
    }

    /// Append a record, fixing its address to the slot it lands in.
    pub fn push(&mut self, mut record: LinkRecord) {
        record.address = address_for_seq(self.records.len());
        self.records.push(record);
    }

    /// Insert a new logical link just before the high-water mark (or at the
    /// tail when none has been read yet), marked `Changed`.
    pub fn insert_link(&mut self, record: LinkRecord) {
        let at = self
            .records
            .iter()
            .position(|r| r.is_high_water())
            .unwrap_or(self.records.len());
        self.records.insert(at, record);
        self.reindex();
    }

    /// Remove the record with the given uid, if present.
    pub fn remove_by_uid(&mut self, uid: Uuid) -> Option<LinkRecord> {
        let at = self.records.iter().position(|r| r.uid == uid)?;
        let rec = self.records.remove(at);
        self.reindex();
        Some(rec)
    }

    /// Tombstone the record with the given uid: clear in-use, mark `Changed`
    /// so the next write pass deletes the physical copy.
    pub fn tombstone_by_uid(&mut self, uid: Uuid) -> bool {
        if let Some(rec) = self.records.iter_mut().find(|r| r.uid == uid) {
            rec.flags &= !crate::record::RecordFlags::IN_USE;
            rec.sync_status = SyncStatus::Changed;
            true
        } else {
            false
        }
    }

    /// Records awaiting write-back.
    pub fn changed_records(&self) -> impl Iterator<Item = &LinkRecord> {
        self.records
            .iter()
            .filter(|r| r.sync_status == SyncStatus::Changed)
    }

    /// Recompute every record's address from its slot. Called after any
    /// structural edit.
    pub fn reindex(&mut self) {
        for (seq, rec) in self.records.iter_mut().enumerate() {
            rec.address = address_for_seq(seq);
        }
    }

    /// Truncate at slot `seq`, keeping later `Changed` in-use records (they
    /// carry pending user edits), then terminate with exactly one high-water
    /// mark. An existing sentinel is moved rather than recreated, so its uid
    /// stays stable across repeated merges.
    pub(crate) fn trim_at_high_water(&mut self, seq: usize) {
        let tail: Vec<LinkRecord> = self.records.split_off(seq.min(self.records.len()));
        let mut sentinel = None;
        for rec in tail {
            if rec.is_high_water() {
                sentinel.get_or_insert(rec);
            } else if rec.sync_status == SyncStatus::Changed && rec.is_in_use() {
                self.records.push(rec);
            }
        }
        if let Some(at) = self.records.iter().position(|r| r.is_high_water()) {
            let rec = self.records.remove(at);
            sentinel.get_or_insert(rec);
        }
        self.records.retain(|r| !r.is_high_water());
        let hwm = sentinel.unwrap_or_else(|| LinkRecord::high_water(self.records.len()));
        self.records.push(hwm);
        self.reindex();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insteon_wire::DeviceAddress;

    fn link(group: u8) -> LinkRecord {
        LinkRecord::new(true, group, DeviceAddress::new(0xA, 0xB, group), [0; 3])
    }

    #[test]
    fn test_push_assigns_addresses() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        db.push(link(2));
        assert_eq!(db.get(0).unwrap().address, 0x0FFF);
        assert_eq!(db.get(1).unwrap().address, 0x0FF7);
    }

    #[test]
    fn test_insert_link_before_high_water() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        db.push(LinkRecord::high_water(1));
        db.insert_link(link(2));
        assert_eq!(db.len(), 3);
        assert_eq!(db.get(1).unwrap().group, 2);
        assert!(db.get(2).unwrap().is_high_water());
        assert_eq!(db.get(2).unwrap().address, 0x0FEF);
    }

    #[test]
    fn test_tombstone_marks_changed() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        let uid = db.get(0).unwrap().uid;
        // freshly created links are already Changed; settle it first
        db.get_mut(0).unwrap().sync_status = SyncStatus::Synced;
        assert!(db.tombstone_by_uid(uid));
        let rec = db.get(0).unwrap();
        assert!(!rec.is_in_use());
        assert_eq!(rec.sync_status, SyncStatus::Changed);
    }

    #[test]
    fn test_trim_keeps_pending_edits() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        db.get_mut(0).unwrap().sync_status = SyncStatus::Synced;
        let mut stale = link(2);
        stale.sync_status = SyncStatus::Synced;
        db.push(stale);
        let pending = link(3); // Changed, in use
        db.push(pending);
        db.trim_at_high_water(1);
        // stale synced record dropped, pending edit kept, one HWM appended
        assert_eq!(db.len(), 3);
        assert_eq!(db.get(1).unwrap().group, 3);
        assert!(db.get(2).unwrap().is_high_water());
        assert_eq!(
            db.records().iter().filter(|r| r.is_high_water()).count(),
            1
        );
    }

    #[test]
    fn test_trim_reuses_existing_sentinel() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        db.push(LinkRecord::high_water(1));
        let uid = db.get(1).unwrap().uid;
        db.trim_at_high_water(1);
        assert_eq!(db.len(), 2);
        assert!(db.get(1).unwrap().is_high_water());
        assert_eq!(db.get(1).unwrap().uid, uid);
        // a second pass is a true no-op, identity included
        let before = db.records().to_vec();
        db.trim_at_high_water(1);
        assert_eq!(db.records(), &before[..]);
    }

    #[test]
    fn test_trim_keeps_sentinel_from_discarded_tail() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        let mut stale = link(2);
        stale.sync_status = SyncStatus::Synced;
        db.push(stale);
        db.push(LinkRecord::high_water(2));
        let uid = db.get(2).unwrap().uid;
        db.trim_at_high_water(1);
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(1).unwrap().uid, uid);
    }

    #[test]
    fn test_changed_records_filter() {
        let mut db = LinkDatabase::new();
        db.push(link(1));
        let mut synced = link(2);
        synced.sync_status = SyncStatus::Synced;
        db.push(synced);
        assert_eq!(db.changed_records().count(), 1);
        assert_eq!(db.changed_records().next().unwrap().group, 1);
    }
}
