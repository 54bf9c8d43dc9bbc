//! Snapshot metadata (spec §4.11, §3 "Snapshot-metadata").
//!
//! Grounded on `libfsapfs_snapshot_metadata.c`: the per-volume
//! snapshot-metadata tree is keyed by xid and walked in ascending order to
//! enumerate snapshots.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree;
use crate::catalog::J_TYPE_SNAP_METADATA;
use crate::error::{ApfsError, Result};

/// One parsed snapshot-metadata record.
#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    pub xid: u64,
    pub extentref_tree_oid: u64,
    pub sblock_oid: u64,
    pub create_time: i64,
    pub change_time: i64,
    pub name: String,
}

const FIXED_SIZE: usize = 40;

impl SnapshotMetadata {
    fn parse(xid: u64, data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_SIZE + 2 {
            return Err(ApfsError::CorruptedData("snapshot metadata value too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let sblock_oid = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let _inum = cursor.read_u64::<LittleEndian>()?;
        let _extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let _flags = cursor.read_u32::<LittleEndian>()?;

        let name_len = cursor.read_u16::<LittleEndian>()? as usize;
        let name_start = FIXED_SIZE + 2;
        let name_end = name_start + name_len;
        let name = if name_end <= data.len() {
            let bytes = &data[name_start..name_end];
            let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..nul]).to_string()
        } else {
            String::new()
        };

        Ok(SnapshotMetadata {
            xid,
            extentref_tree_oid,
            sblock_oid,
            create_time,
            change_time,
            name,
        })
    }
}

/// Decode a snapshot-metadata key's `obj_id_and_type`: type in the top 4
/// bits, xid in the bottom 60 (same `j_key_t` convention as
/// `catalog::decode_catalog_key`).
fn decode_snap_key(key: &[u8]) -> Result<(u64, u8)> {
    if key.len() < 8 {
        return Err(ApfsError::InvalidBTree("snapshot metadata key too short".into()));
    }
    let obj_id_and_type = u64::from_le_bytes(key[0..8].try_into().unwrap());
    let xid = obj_id_and_type & 0x0FFFFFFFFFFFFFFF;
    let kind = ((obj_id_and_type >> 60) & 0xF) as u8;
    Ok((xid, kind))
}

/// Enumerate all snapshots in ascending xid order (spec §4.11).
pub fn enumerate_snapshots<R: Read + Seek>(
    reader: &mut R,
    snap_meta_root: u64,
    block_size: u32,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<Vec<SnapshotMetadata>> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_snap_key(key) {
            Ok((_xid, kind)) if kind == J_TYPE_SNAP_METADATA => Some(true),
            Ok(_) => Some(false),
            Err(_) => Some(false),
        }
    };

    // The snapshot-metadata tree is physical (not resolved via an object
    // map), same as the container/volume object maps themselves.
    let entries = btree::btree_scan_cached(reader, snap_meta_root, block_size, 0, 0, &range_fn, None, cache)?;

    let mut snapshots = Vec::with_capacity(entries.len());
    for (key, val) in &entries {
        let (xid, _kind) = decode_snap_key(key)?;
        snapshots.push(SnapshotMetadata::parse(xid, val)?);
    }

    snapshots.sort_by_key(|s| s.xid);
    Ok(snapshots)
}
