//! Checkpoint map: resolves ephemeral object ids to physical blocks within
//! the current checkpoint window (spec §4.2, §3 "Checkpoint map").
//!
//! The space manager and other ephemeral objects are not block-addressed by
//! oid the way virtual objects are; they are only reachable through the
//! checkpoint-map blocks co-located with the container superblock in the
//! checkpoint descriptor area.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::Result;
use crate::fletcher;
use crate::object::{ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP};

/// checkpoint_mapping_t is 40 bytes:
///   cpm_type: u32, cpm_subtype: u32, cpm_size: u32, cpm_pad: u32,
///   cpm_fs_oid: u64, cpm_oid: u64, cpm_paddr: u64
const MAPPING_SIZE: usize = 40;

/// Ephemeral oid -> physical block, built by scanning every
/// checkpoint-map object in the checkpoint descriptor window.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMap {
    entries: HashMap<u64, u64>,
}

impl CheckpointMap {
    pub fn resolve(&self, ephemeral_oid: u64) -> Option<u64> {
        self.entries.get(&ephemeral_oid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scan the checkpoint descriptor area `[xp_desc_base, xp_desc_base +
/// xp_desc_blocks)` for `OBJECT_TYPE_CHECKPOINT_MAP` blocks and merge their
/// mapping entries. Blocks that fail checksum verification are skipped —
/// the checkpoint area is a ring buffer and may contain stale entries from
/// prior sweeps.
pub fn scan_checkpoint_maps<R: Read + Seek>(
    reader: &mut R,
    xp_desc_base: u64,
    xp_desc_blocks: u32,
    block_size: u32,
) -> Result<CheckpointMap> {
    let mut map = CheckpointMap::default();

    for i in 0..xp_desc_blocks as u64 {
        let block_num = xp_desc_base + i;
        let offset = block_num * block_size as u64;

        reader.seek(SeekFrom::Start(offset))?;
        let mut block = vec![0u8; block_size as usize];
        if reader.read_exact(&mut block).is_err() {
            continue;
        }

        if !fletcher::verify_object(&block) {
            continue;
        }

        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };

        if header.object_type() != OBJECT_TYPE_CHECKPOINT_MAP {
            continue;
        }

        if let Ok(entries) = parse_checkpoint_map_block(&block) {
            for (oid, paddr) in entries {
                map.entries.insert(oid, paddr);
            }
        }
    }

    log::trace!("checkpoint map scan resolved {} ephemeral oids", map.len());
    Ok(map)
}

/// checkpoint_map_phys_t after the object header:
///   cpm_flags: u32, cpm_count: u32, cpm_map[cpm_count]: checkpoint_mapping_t
fn parse_checkpoint_map_block(block: &[u8]) -> Result<Vec<(u64, u64)>> {
    let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
    let _flags = cursor.read_u32::<LittleEndian>()?;
    let count = cursor.read_u32::<LittleEndian>()?;

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut entry = [0u8; MAPPING_SIZE];
        cursor.read_exact(&mut entry)?;
        let oid = u64::from_le_bytes(entry[16..24].try_into().unwrap());
        let paddr = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        out.push((oid, paddr));
    }

    Ok(out)
}
