//! Reconciliation of a freshly read physical table into the cached one.
//!
//! Devices report records at known addresses, so the device merge walks both
//! tables slot by slot. The hub reports its table as an unordered stream with
//! no addresses, so the hub merge matches by link identity (destination,
//! group, direction) instead. In both cases the outcome is a cache where
//! every record carries an honest [`SyncStatus`]: `Synced` records agree with
//! the physical side, `Changed` records are queued for write-back.

use crate::database::LinkDatabase;
use crate::record::{LinkRecord, SyncStatus};
use insteon_wire::{AllLinkRecordMessage, DeviceAddress};
use tracing::debug;

/// Fold one physical device record at sequence slot `seq` into the cache.
///
/// `known_destination` answers whether a destination address still exists in
/// the caller's device model; a diverging physical record pointing at a
/// removed device is not adopted but re-marked `Changed` so the next write
/// pass restores the cached copy.
pub fn merge_device_record(
    db: &mut LinkDatabase,
    seq: usize,
    phys: &AllLinkRecordMessage,
    known_destination: &dyn Fn(DeviceAddress) -> bool,
) {
    let phys_high_water = phys.flags & crate::record::RecordFlags::USED == 0;
    if phys_high_water {
        debug!(seq, "physical high-water mark, trimming cached tail");
        db.trim_at_high_water(seq);
        db.fully_read = true;
        return;
    }

    if seq >= db.len() {
        // physical table longer than the cache
        db.push(LinkRecord::from_physical(seq, phys, SyncStatus::Synced));
        return;
    }
    let cached = db.get_mut(seq).expect("slot checked above");

    match cached.sync_status {
        SyncStatus::Changed => {
            if cached.is_in_use() {
                // pending user edit wins unless the device already has it
                if cached.payload_eq(phys) {
                    cached.sync_status = SyncStatus::Synced;
                }
            } else {
                // tombstone: track what the device actually holds so the
                // delete targets the right payload
                if !cached.payload_eq_ignoring_in_use(phys) {
                    cached.adopt_payload(phys);
                }
                if phys.flags & crate::record::RecordFlags::IN_USE == 0 {
                    // already deleted on the device
                    cached.sync_status = SyncStatus::Synced;
                }
            }
        }
        SyncStatus::Synced | SyncStatus::Unknown => {
            if cached.payload_eq(phys) {
                cached.sync_status = SyncStatus::Synced;
            } else if known_destination(phys.destination) {
                cached.adopt_payload(phys);
                cached.sync_status = SyncStatus::Synced;
            } else {
                debug!(
                    seq,
                    destination = %phys.destination,
                    "physical record points at unknown destination, keeping cached copy"
                );
                cached.sync_status = SyncStatus::Changed;
            }
        }
    }
}

/// Fold a complete hub table into the cache by content similarity.
///
/// The hub gives no record addresses, so records are matched greedily:
/// exact payload match first, then same link identity with differing data,
/// then appended as new. Cached records left unmatched were deleted on the
/// hub behind our back; they are re-marked `Changed` so the next write pass
/// recreates them and a human gets to decide.
pub fn merge_hub_records(db: &mut LinkDatabase, physical: &[AllLinkRecordMessage]) {
    let mut matched = vec![false; db.len()];
    let mut consumed = vec![false; physical.len()];

    // exact matches first, so a near-duplicate cannot steal an exact twin
    for (pi, phys) in physical.iter().enumerate() {
        if let Some(i) = find_unmatched(db, &matched, |r| r.payload_eq(phys)) {
            matched[i] = true;
            consumed[pi] = true;
            db.get_mut(i).expect("index from find_unmatched").sync_status = SyncStatus::Synced;
        }
    }

    let mut appended: Vec<LinkRecord> = Vec::new();
    for (pi, phys) in physical.iter().enumerate() {
        if consumed[pi] {
            continue;
        }
        if let Some(i) = find_unmatched(db, &matched, |r| r.same_link(phys)) {
            matched[i] = true;
            let cached = db.get_mut(i).expect("index from find_unmatched");
            match cached.sync_status {
                SyncStatus::Synced => {
                    cached.adopt_payload(phys);
                }
                SyncStatus::Unknown => {
                    cached.adopt_payload(phys);
                    cached.sync_status = SyncStatus::Changed;
                }
                // pending user edit wins; write-back will reconcile
                SyncStatus::Changed => {}
            }
        } else {
            debug!(destination = %phys.destination, group = phys.group, "hub record not in cache, adopting");
            appended.push(LinkRecord::from_physical(0, phys, SyncStatus::Synced));
        }
    }

    for (i, was_matched) in matched.iter().enumerate() {
        let rec = db.get_mut(i).expect("index within original length");
        if !was_matched && !rec.is_high_water() && rec.sync_status != SyncStatus::Changed {
            debug!(
                destination = %rec.destination,
                group = rec.group,
                "cached record missing from hub, marking changed"
            );
            rec.sync_status = SyncStatus::Changed;
        }
    }

    for rec in appended {
        db.push(rec);
    }
    db.reindex();
    db.fully_read = true;
}

fn find_unmatched(
    db: &LinkDatabase,
    matched: &[bool],
    pred: impl Fn(&LinkRecord) -> bool,
) -> Option<usize> {
    db.records()
        .iter()
        .enumerate()
        .find(|(i, r)| !matched[*i] && !r.is_high_water() && pred(r))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordFlags;

    fn phys(controller: bool, group: u8, dest: DeviceAddress, data: [u8; 3]) -> AllLinkRecordMessage {
        let mut flags = RecordFlags::IN_USE | RecordFlags::USED;
        if controller {
            flags |= RecordFlags::CONTROLLER;
        }
        AllLinkRecordMessage {
            flags,
            group,
            destination: dest,
            data,
        }
    }

    fn hwm_phys() -> AllLinkRecordMessage {
        AllLinkRecordMessage {
            flags: 0,
            group: 0,
            destination: DeviceAddress::NONE,
            data: [0; 3],
        }
    }

    #[test]
    fn test_device_merge_appends_unknown_tail() {
        let mut db = LinkDatabase::new();
        let p = phys(true, 1, DeviceAddress::new(1, 2, 3), [0; 3]);
        merge_device_record(&mut db, 0, &p, &|_| true);
        assert_eq!(db.len(), 1);
        assert_eq!(db.get(0).unwrap().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_device_merge_high_water_sets_fully_read() {
        let mut db = LinkDatabase::new();
        merge_device_record(&mut db, 0, &phys(true, 1, DeviceAddress::new(1, 2, 3), [0; 3]), &|_| true);
        merge_device_record(&mut db, 1, &hwm_phys(), &|_| true);
        assert!(db.fully_read);
        assert_eq!(db.len(), 2);
        assert!(db.get(1).unwrap().is_high_water());
    }

    #[test]
    fn test_device_merge_pending_edit_wins() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        db.push(LinkRecord::new(true, 1, dest, [0x11, 0, 0])); // Changed
        let on_device = phys(true, 1, dest, [0x22, 0, 0]);
        merge_device_record(&mut db, 0, &on_device, &|_| true);
        let rec = db.get(0).unwrap();
        assert_eq!(rec.data, [0x11, 0, 0]);
        assert_eq!(rec.sync_status, SyncStatus::Changed);
    }

    #[test]
    fn test_device_merge_pending_edit_already_applied() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        db.push(LinkRecord::new(true, 1, dest, [0x11, 0, 0]));
        let on_device = db.get(0).unwrap().to_wire();
        merge_device_record(&mut db, 0, &on_device, &|_| true);
        assert_eq!(db.get(0).unwrap().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_device_merge_tombstone_synced_when_device_deleted() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        db.push(LinkRecord::new(true, 1, dest, [0; 3]));
        let uid = db.get(0).unwrap().uid;
        db.get_mut(0).unwrap().sync_status = SyncStatus::Synced;
        db.tombstone_by_uid(uid);
        let mut deleted = phys(true, 1, dest, [0; 3]);
        deleted.flags &= !RecordFlags::IN_USE;
        merge_device_record(&mut db, 0, &deleted, &|_| true);
        assert_eq!(db.get(0).unwrap().sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_device_merge_unknown_destination_marks_changed() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        let mut rec = LinkRecord::new(true, 1, dest, [0x11, 0, 0]);
        rec.sync_status = SyncStatus::Synced;
        db.push(rec);
        let diverged = phys(true, 1, DeviceAddress::new(9, 9, 9), [0x11, 0, 0]);
        merge_device_record(&mut db, 0, &diverged, &|_| false);
        let rec = db.get(0).unwrap();
        // not adopted: the cached copy will be pushed back out
        assert_eq!(rec.destination, dest);
        assert_eq!(rec.sync_status, SyncStatus::Changed);
    }

    #[test]
    fn test_hub_merge_unmatched_cached_marked_changed() {
        let mut db = LinkDatabase::new();
        let mut rec = LinkRecord::new(true, 1, DeviceAddress::new(1, 2, 3), [0; 3]);
        rec.sync_status = SyncStatus::Synced;
        db.push(rec);
        merge_hub_records(&mut db, &[]);
        assert_eq!(db.get(0).unwrap().sync_status, SyncStatus::Changed);
    }

    #[test]
    fn test_hub_merge_same_link_different_data() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        let mut rec = LinkRecord::new(true, 1, dest, [0x01, 0, 0]);
        rec.sync_status = SyncStatus::Synced;
        db.push(rec);
        merge_hub_records(&mut db, &[phys(true, 1, dest, [0x02, 0, 0])]);
        let rec = db.get(0).unwrap();
        assert_eq!(rec.data, [0x02, 0, 0]);
        assert_eq!(rec.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_hub_merge_exact_match_not_stolen_by_near_duplicate() {
        let mut db = LinkDatabase::new();
        let dest = DeviceAddress::new(1, 2, 3);
        let mut exact = LinkRecord::new(true, 1, dest, [0x01, 0, 0]);
        exact.sync_status = SyncStatus::Unknown;
        db.push(exact);
        // physical stream holds the exact twin plus a near-duplicate
        let stream = [phys(true, 1, dest, [0x02, 0, 0]), phys(true, 1, dest, [0x01, 0, 0])];
        merge_hub_records(&mut db, &stream);
        // cached record keeps its exact payload; near-duplicate appended
        assert_eq!(db.get(0).unwrap().data, [0x01, 0, 0]);
        assert_eq!(db.get(0).unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(db.len(), 2);
    }
}
