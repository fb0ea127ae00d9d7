//! On-page byte layouts shared by volatile and snapshot pages.
//!
//! Leaf page: `[storage_id u32][leaf_index u32][dirty_epoch u32]
//! [record_size u16][record_count u16]` followed by `record_count` fixed
//! size payloads. Root page: `[storage_id u32][leaf_count u32][reserved u64]`
//! followed by one little-endian `SnapshotPagePointer` per leaf. All fields
//! little-endian.

use kiln_error::{KilnError, Result};
use kiln_types::{Epoch, PAGE_SIZE, PageData, SnapshotPagePointer, StorageId};
use std::ops::Range;

pub const LEAF_HEADER_SIZE: usize = 16;
pub const ROOT_HEADER_SIZE: usize = 16;

/// Leaf pointers one root page can hold.
pub const MAX_ROOT_FANOUT: usize = (PAGE_SIZE - ROOT_HEADER_SIZE) / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafHeader {
    pub storage_id: StorageId,
    pub leaf_index: u32,
    /// Highest epoch applied to this page. On a volatile page this decides
    /// whether a snapshot fully covers the leaf.
    pub dirty_epoch: Epoch,
    pub record_size: u16,
    pub record_count: u16,
}

fn read_u32(body: &PageData, at: usize) -> u32 {
    u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]])
}

fn read_u16(body: &PageData, at: usize) -> u16 {
    u16::from_le_bytes([body[at], body[at + 1]])
}

fn read_u64(body: &PageData, at: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&body[at..at + 8]);
    u64::from_le_bytes(bytes)
}

pub fn encode_leaf_header(body: &mut PageData, header: &LeafHeader) {
    body[0..4].copy_from_slice(&header.storage_id.0.to_le_bytes());
    body[4..8].copy_from_slice(&header.leaf_index.to_le_bytes());
    body[8..12].copy_from_slice(&header.dirty_epoch.0.to_le_bytes());
    body[12..14].copy_from_slice(&header.record_size.to_le_bytes());
    body[14..16].copy_from_slice(&header.record_count.to_le_bytes());
}

pub fn decode_leaf_header(body: &PageData) -> Result<LeafHeader> {
    let header = LeafHeader {
        storage_id: StorageId(read_u32(body, 0)),
        leaf_index: read_u32(body, 4),
        dirty_epoch: Epoch(read_u32(body, 8)),
        record_size: read_u16(body, 12),
        record_count: read_u16(body, 14),
    };
    if header.record_size == 0 {
        return Err(KilnError::Inconsistent(
            "leaf page with zero record size".to_owned(),
        ));
    }
    let body_bytes = header.record_size as usize * header.record_count as usize;
    if LEAF_HEADER_SIZE + body_bytes > PAGE_SIZE {
        return Err(KilnError::Inconsistent(format!(
            "leaf page of storage {} overflows: {} records of {} bytes",
            header.storage_id, header.record_count, header.record_size
        )));
    }
    Ok(header)
}

/// Byte range of record `slot` in a leaf body.
#[must_use]
pub fn record_range(record_size: u16, slot: u64) -> Range<usize> {
    let start = LEAF_HEADER_SIZE + record_size as usize * slot as usize;
    start..start + record_size as usize
}

pub fn encode_root(
    body: &mut PageData,
    storage_id: StorageId,
    leaves: &[SnapshotPagePointer],
) -> Result<()> {
    if leaves.len() > MAX_ROOT_FANOUT {
        return Err(KilnError::Inconsistent(format!(
            "storage {} has {} leaves, root page holds {}",
            storage_id,
            leaves.len(),
            MAX_ROOT_FANOUT
        )));
    }
    body[0..4].copy_from_slice(&storage_id.0.to_le_bytes());
    body[4..8].copy_from_slice(&(leaves.len() as u32).to_le_bytes());
    body[8..16].fill(0);
    for (i, pointer) in leaves.iter().enumerate() {
        let at = ROOT_HEADER_SIZE + i * 8;
        body[at..at + 8].copy_from_slice(&pointer.0.to_le_bytes());
    }
    Ok(())
}

pub fn decode_root(body: &PageData, expected: StorageId) -> Result<Vec<SnapshotPagePointer>> {
    let storage_id = StorageId(read_u32(body, 0));
    if storage_id != expected {
        return Err(KilnError::Inconsistent(format!(
            "root page belongs to storage {storage_id}, expected {expected}"
        )));
    }
    let leaf_count = read_u32(body, 4) as usize;
    if leaf_count > MAX_ROOT_FANOUT {
        return Err(KilnError::Inconsistent(format!(
            "root page of storage {storage_id} claims {leaf_count} leaves"
        )));
    }
    Ok((0..leaf_count)
        .map(|i| SnapshotPagePointer(read_u64(body, ROOT_HEADER_SIZE + i * 8)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{NodeId, SnapshotId};

    #[test]
    fn leaf_header_round_trips() {
        let mut body = [0_u8; PAGE_SIZE];
        let header = LeafHeader {
            storage_id: StorageId(9),
            leaf_index: 3,
            dirty_epoch: Epoch(77),
            record_size: 32,
            record_count: 127,
        };
        encode_leaf_header(&mut body, &header);
        assert_eq!(decode_leaf_header(&body).unwrap(), header);
    }

    #[test]
    fn leaf_decode_rejects_corruption() {
        let body = [0_u8; PAGE_SIZE];
        // zero record_size
        assert!(decode_leaf_header(&body).is_err());

        let mut body = [0_u8; PAGE_SIZE];
        encode_leaf_header(
            &mut body,
            &LeafHeader {
                storage_id: StorageId(1),
                leaf_index: 0,
                dirty_epoch: Epoch(0),
                record_size: 4080,
                record_count: 2,
            },
        );
        assert!(decode_leaf_header(&body).is_err());
    }

    #[test]
    fn root_round_trips_pointers() {
        let mut body = [0_u8; PAGE_SIZE];
        let leaves = vec![
            SnapshotPagePointer::NULL,
            SnapshotPagePointer::new(SnapshotId(2), NodeId(1), 44).unwrap(),
            SnapshotPagePointer::new(SnapshotId(2), NodeId(1), 45).unwrap(),
        ];
        encode_root(&mut body, StorageId(5), &leaves).unwrap();
        assert_eq!(decode_root(&body, StorageId(5)).unwrap(), leaves);
        assert!(decode_root(&body, StorageId(6)).is_err());
    }
}
