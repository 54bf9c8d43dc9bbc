use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree;
use crate::error::{ApfsError, Result};
use crate::object;

/// OMAP key: (oid: u64, xid: u64) — 16 bytes, fixed-size.
/// OMAP value: (flags: u32, size: u32, paddr: u64) — 16 bytes, fixed-size.
const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;

/// Read the OMAP structure at a given physical block and return the
/// physical block number of the OMAP B-tree root.
pub fn read_omap_tree_root<R: Read + Seek>(
    reader: &mut R,
    omap_block: u64,
    block_size: u32,
) -> Result<u64> {
    let block_data = object::read_block(reader, omap_block, block_size)?;

    // omap_phys_t layout after obj_phys_t (32 bytes):
    //   om_flags: u32 (4)
    //   om_snap_count: u32 (4)
    //   om_tree_type: u32 (4)
    //   om_snapshot_tree_type: u32 (4)
    //   om_tree_oid: u64 (8)  <- B-tree root physical block
    let mut cursor = Cursor::new(&block_data[object::ObjectHeader::SIZE..]);
    let _om_flags = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
    let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _om_snap_tree_type = cursor.read_u32::<LittleEndian>()?;
    let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

    Ok(om_tree_oid)
}

fn decode_omap_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() < 16 {
        return None;
    }
    let oid = u64::from_le_bytes(key[0..8].try_into().unwrap());
    let xid = u64::from_le_bytes(key[8..16].try_into().unwrap());
    Some((oid, xid))
}

/// Look up a virtual OID in an OMAP B-tree and return the physical block
/// address of the mapping with the highest xid not exceeding `xid_max`
/// (spec §6: "latest xid ≤ query"). `xid_max = None` means "latest
/// available", the common case for reading the live container/volume.
///
/// OMAP keys are sorted by `(oid, xid)` ascending, so every entry for
/// `target_oid` is contiguous; we scan that run and keep the best
/// candidate rather than assuming the first hit is the newest.
pub fn omap_lookup<R: Read + Seek>(
    reader: &mut R,
    omap_tree_root: u64,
    block_size: u32,
    target_oid: u64,
    xid_max: Option<u64>,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<u64> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_omap_key(key) {
            Some((oid, _)) if oid < target_oid => Some(false),
            Some((oid, _)) if oid == target_oid => Some(true),
            Some(_) => None,
            None => Some(false),
        }
    };

    let entries = btree::btree_scan_cached(
        reader,
        omap_tree_root,
        block_size,
        OMAP_KEY_SIZE,
        OMAP_VAL_SIZE,
        &range_fn,
        None,
        cache,
    )?;

    let mut best: Option<(u64, u64)> = None; // (xid, paddr)
    for (key, val) in &entries {
        let (_oid, xid) = match decode_omap_key(key) {
            Some(pair) => pair,
            None => continue,
        };
        if let Some(limit) = xid_max {
            if xid > limit {
                continue;
            }
        }
        let paddr = parse_omap_val(val)?;
        match best {
            Some((best_xid, _)) if xid <= best_xid => {}
            _ => best = Some((xid, paddr)),
        }
    }

    match best {
        Some((_, paddr)) if paddr != 0 => Ok(paddr),
        _ => {
            log::trace!("omap miss for oid {} at xid_max {:?}", target_oid, xid_max);
            Err(ApfsError::VirtualObjectMissing {
                oid: target_oid,
                xid_max: xid_max.unwrap_or(u64::MAX),
            })
        }
    }
}

/// Parse an OMAP value: (flags: u32, size: u32, paddr: u64)
fn parse_omap_val(val: &[u8]) -> Result<u64> {
    if val.len() < 16 {
        return Err(ApfsError::InvalidBTree("omap value too short".into()));
    }
    let paddr = u64::from_le_bytes([val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15]]);
    Ok(paddr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock;
    use std::io::BufReader;

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_omap_lookup() {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let mut reader = BufReader::new(file);

        let nxsb = superblock::read_nxsb(&mut reader).unwrap();
        let latest = superblock::find_latest_nxsb(&mut reader, &nxsb).unwrap();

        let omap_root = read_omap_tree_root(&mut reader, latest.omap_oid, latest.block_size).unwrap();

        let vol_oid = latest.fs_oids.iter().find(|&&o| o != 0).copied().unwrap();

        let vol_block = omap_lookup(&mut reader, omap_root, latest.block_size, vol_oid, None, None).unwrap();
        assert!(vol_block > 0 && vol_block < latest.block_count,
            "Physical block {} should be within container", vol_block);

        let vol_data = object::read_block(&mut reader, vol_block, latest.block_size).unwrap();
        let vol_sb = superblock::ApfsSuperblock::parse(&vol_data).unwrap();
        assert_eq!(vol_sb.magic, superblock::APSB_MAGIC);
    }

    #[test]
    fn decode_omap_key_rejects_short_input() {
        assert!(decode_omap_key(&[0u8; 4]).is_none());
    }
}
