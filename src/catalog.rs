use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::btree;
use crate::error::{ApfsError, Result};
use crate::omap;
use crate::{DirEntry, EntryKind};

// Catalog record types (j_obj_types), stored in top 4 bits of key's obj_id_and_type
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

// Well-known OIDs
pub const ROOT_DIR_PARENT: u64 = 1;   // Parent OID of root directory
pub const ROOT_DIR_RECORD: u64 = 2;   // OID of the root directory inode

// Inode types (from BSD mode)
pub const INODE_DIR_TYPE: u16 = 0o040000;      // S_IFDIR
pub const INODE_FILE_TYPE: u16 = 0o100000;     // S_IFREG
pub const INODE_SYMLINK_TYPE: u16 = 0o120000;  // S_IFLNK

// Extended field types (INO_EXT_TYPE_*), from j_xfield_key_t::x_type.
const INO_EXT_TYPE_SNAP_XID: u8 = 1;
const INO_EXT_TYPE_DELTA_TREE_OID: u8 = 2;
const INO_EXT_TYPE_DOCUMENT_ID: u8 = 3;
const INO_EXT_TYPE_NAME: u8 = 4;
const INO_EXT_TYPE_PREV_FSIZE: u8 = 5;
const INO_EXT_TYPE_FINDER_INFO: u8 = 6;
const INO_EXT_TYPE_DSTREAM: u8 = 8;
const INO_EXT_TYPE_DIR_STATS_KEY: u8 = 10;
const INO_EXT_TYPE_FS_UUID: u8 = 11;
const INO_EXT_TYPE_SPARSE_BYTES: u8 = 13;
const INO_EXT_TYPE_RDEV: u8 = 14;

/// One decoded extended field from an inode's xfield area. Fields this
/// crate doesn't interpret are kept as raw bytes rather than dropped.
#[derive(Debug, Clone)]
pub enum ExtendedField {
    DocumentId(u32),
    Name(String),
    FinderInfo(Vec<u8>),
    DstreamSize(u64),
    SparseBytes(u64),
    Rdev(u32),
    Other { x_type: u8, data: Vec<u8> },
}

/// Parsed inode value from a catalog record.
#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub pad1: u16,
    pub uncompressed_size: u64,
    pub xfields: Vec<ExtendedField>,
}

impl InodeVal {
    /// Fixed size of j_inode_val_t before xfields
    const FIXED_SIZE: usize = 92;

    /// Parse from raw catalog value bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ApfsError::CorruptedData(
                format!("inode value too short: {} bytes", data.len()),
            ));
        }
        let mut cursor = Cursor::new(data);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let modify_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let access_time = cursor.read_i64::<LittleEndian>()?;
        let internal_flags = cursor.read_u64::<LittleEndian>()?;
        let nchildren_or_nlink = cursor.read_i32::<LittleEndian>()?;
        let default_protection_class = cursor.read_u32::<LittleEndian>()?;
        let write_generation_counter = cursor.read_u32::<LittleEndian>()?;
        let bsd_flags = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        let pad1 = cursor.read_u16::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;

        let xfields = Self::parse_xfields(&data[Self::FIXED_SIZE..]);

        Ok(InodeVal {
            parent_id,
            private_id,
            create_time,
            modify_time,
            change_time,
            access_time,
            internal_flags,
            nchildren_or_nlink,
            default_protection_class,
            write_generation_counter,
            bsd_flags,
            uid,
            gid,
            mode,
            pad1,
            uncompressed_size,
            xfields,
        })
    }

    /// Parse the xfield blob trailing a fixed-size inode record.
    /// Layout: xf_blob_t { xf_num_exts: u16, xf_used_data: u16 }
    /// followed by x_field_t[xf_num_exts] { x_type: u8, x_flags: u8, x_size: u16 }
    /// followed by the field data values, each padded to an 8-byte boundary.
    fn parse_xfields(xfield_data: &[u8]) -> Vec<ExtendedField> {
        let mut fields = Vec::new();
        if xfield_data.len() < 4 {
            return fields;
        }
        let xf_num_exts = u16::from_le_bytes([xfield_data[0], xfield_data[1]]) as usize;
        if xf_num_exts == 0 {
            return fields;
        }

        let entries_start = 4;
        let entries_end = entries_start + xf_num_exts * 4;
        if entries_end > xfield_data.len() {
            return fields;
        }

        let mut data_offset = entries_end;
        for i in 0..xf_num_exts {
            let entry_off = entries_start + i * 4;
            let x_type = xfield_data[entry_off];
            let x_size = u16::from_le_bytes([xfield_data[entry_off + 2], xfield_data[entry_off + 3]]) as usize;

            if data_offset + x_size > xfield_data.len() {
                break;
            }
            let field_data = &xfield_data[data_offset..data_offset + x_size];

            let field = match x_type {
                INO_EXT_TYPE_DOCUMENT_ID if x_size >= 4 => {
                    ExtendedField::DocumentId(u32::from_le_bytes(field_data[0..4].try_into().unwrap()))
                }
                INO_EXT_TYPE_NAME => {
                    let nul = field_data.iter().position(|&b| b == 0).unwrap_or(field_data.len());
                    ExtendedField::Name(String::from_utf8_lossy(&field_data[..nul]).to_string())
                }
                INO_EXT_TYPE_FINDER_INFO => ExtendedField::FinderInfo(field_data.to_vec()),
                INO_EXT_TYPE_DSTREAM if x_size >= 8 => {
                    ExtendedField::DstreamSize(u64::from_le_bytes(field_data[0..8].try_into().unwrap()))
                }
                INO_EXT_TYPE_SPARSE_BYTES if x_size >= 8 => {
                    ExtendedField::SparseBytes(u64::from_le_bytes(field_data[0..8].try_into().unwrap()))
                }
                INO_EXT_TYPE_RDEV if x_size >= 4 => {
                    ExtendedField::Rdev(u32::from_le_bytes(field_data[0..4].try_into().unwrap()))
                }
                // SNAP_XID / DELTA_TREE_OID / PREV_FSIZE / DIR_STATS_KEY / FS_UUID carry no
                // information this crate's read-only surface exposes; keep them as raw bytes.
                INO_EXT_TYPE_SNAP_XID
                | INO_EXT_TYPE_DELTA_TREE_OID
                | INO_EXT_TYPE_PREV_FSIZE
                | INO_EXT_TYPE_DIR_STATS_KEY
                | INO_EXT_TYPE_FS_UUID
                | _ => ExtendedField::Other { x_type, data: field_data.to_vec() },
            };
            fields.push(field);

            let padded_size = (x_size + 7) & !7;
            data_offset += padded_size;
        }

        fields
    }

    /// Get the file type from the mode field
    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    /// Get the logical file size.
    /// Prefers the dstream xfield's size; falls back to uncompressed_size.
    pub fn size(&self) -> u64 {
        for field in &self.xfields {
            if let ExtendedField::DstreamSize(size) = field {
                return *size;
            }
        }
        self.uncompressed_size
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

/// Directory record value (j_drec_val_t)
#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(ApfsError::CorruptedData(
                format!("drec value too short: {} bytes", data.len()),
            ));
        }
        let mut cursor = Cursor::new(data);
        let file_id = cursor.read_u64::<LittleEndian>()?;
        let date_added = cursor.read_i64::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(DrecVal {
            file_id,
            date_added,
            flags,
        })
    }

    /// Get the file type from the flags field (DT_* from dirent.h)
    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

// DT_* constants for directory entry types
pub const DT_REG: u16 = 8;    // Regular file
pub const DT_DIR: u16 = 4;    // Directory
pub const DT_LNK: u16 = 10;   // Symbolic link

/// File extent value (j_file_extent_val_t)
#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(ApfsError::CorruptedData(
                format!("file extent value too short: {} bytes", data.len()),
            ));
        }
        let mut cursor = Cursor::new(data);
        let flags_and_length = cursor.read_u64::<LittleEndian>()?;
        let phys_block_num = cursor.read_u64::<LittleEndian>()?;
        let crypto_id = cursor.read_u64::<LittleEndian>()?;

        Ok(FileExtentVal {
            flags_and_length,
            phys_block_num,
            crypto_id,
        })
    }

    /// Get the logical length in bytes (lower 56 bits)
    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FFFFFFFFFFFFFF
    }

    /// A sparse extent has no backing physical block; readers must zero-fill it.
    pub fn is_sparse(&self) -> bool {
        self.phys_block_num == 0
    }
}

/// Decode a catalog key: extract obj_id and type from the combined j_key_t.
fn decode_catalog_key(key_bytes: &[u8]) -> Result<(u64, u8)> {
    if key_bytes.len() < 8 {
        return Err(ApfsError::InvalidBTree("catalog key too short".into()));
    }
    let obj_id_and_type = u64::from_le_bytes([
        key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3],
        key_bytes[4], key_bytes[5], key_bytes[6], key_bytes[7],
    ]);

    let obj_id = obj_id_and_type & 0x0FFFFFFFFFFFFFFF;
    let j_type = ((obj_id_and_type >> 60) & 0xF) as u8;

    Ok((obj_id, j_type))
}

/// Mask isolating the 22-bit name hash in a drec key's name_len_and_hash field.
const NAME_HASH_MASK: u32 = 0x3FFFFC00;
const NAME_LEN_MASK: u32 = 0x000003FF;

/// Extract the name and stored hash from a directory record key
/// (j_drec_hashed_key_t). After the 8-byte obj_id_and_type there's a
/// 4-byte name_len_and_hash (length in the low 10 bits, hash in the
/// upper 22), followed by the UTF-8 name.
fn decode_drec_name(key_bytes: &[u8]) -> Result<(String, u32)> {
    if key_bytes.len() < 12 {
        return Err(ApfsError::InvalidBTree("drec key too short for name".into()));
    }

    let name_len_and_hash = u32::from_le_bytes([key_bytes[8], key_bytes[9], key_bytes[10], key_bytes[11]]);
    let name_len = (name_len_and_hash & NAME_LEN_MASK) as usize;
    let stored_hash = name_len_and_hash & NAME_HASH_MASK;

    let name_start = 12;
    let name_end = name_start + name_len;

    if name_end > key_bytes.len() {
        return Err(ApfsError::InvalidBTree(
            format!("drec name extends beyond key: name_end={}, key_len={}", name_end, key_bytes.len()),
        ));
    }

    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok((String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string(), stored_hash))
}

/// Fold a name for case/normalization-insensitive comparison on
/// case-insensitive volumes (spec §9). This folds ASCII case only; it does
/// not perform full Unicode NFD decomposition, so names differing solely
/// by composed-vs-decomposed accents are not matched. A best effort given
/// no normalization table is available in this crate's dependency set.
fn fold_name(name: &str) -> String {
    name.chars().flat_map(char::to_lowercase).collect()
}

/// Compare two names per the volume's folding policy (spec §4.7/§9):
/// byte-exact on a case-sensitive volume, folded comparison when the
/// volume's incompatible-feature bits request it.
fn names_match(a: &str, b: &str, fold: bool) -> bool {
    if fold {
        fold_name(a) == fold_name(b)
    } else {
        a == b
    }
}

/// Compute a 22-bit hash over a folded name the way a case-insensitive
/// volume would (spec §9: "22-bit name hash"). This is used only to
/// annotate directory entries; it is not verified bit-identical to
/// Apple's own hash (no reference implementation or fixture is available
/// to check against), so lookups fall back to folded-name comparison
/// rather than trusting a hash match.
pub fn compute_name_hash(name: &str) -> u32 {
    const HASH_BITS_MASK: u32 = 0x003FFFFF;
    let mut folded = fold_name(name).into_bytes();
    folded.push(0);
    crc32fast::hash(&folded) & HASH_BITS_MASK
}

/// List directory entries for a given parent OID.
///
/// Scans the catalog B-tree for all J_TYPE_DIR_REC entries whose obj_id matches
/// the parent directory OID. For each, looks up the inode to get size/timestamps.
pub fn list_directory<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    parent_oid: u64,
    xid_max: Option<u64>,
    mut cache: Option<&mut btree::BTreeCache>,
) -> Result<Vec<DirEntry>> {
    let entries = scan_dir_records(reader, catalog_root, omap_root, block_size, parent_oid, cache.as_deref_mut())?;

    let mut dir_entries = Vec::new();
    for (key, val) in &entries {
        let (name, _hash) = match decode_drec_name(key) {
            Ok(n) => n,
            Err(_) => continue,
        };

        let drec = match DrecVal::parse(val) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let kind = match drec.file_type() {
            DT_DIR => EntryKind::Directory,
            DT_LNK => EntryKind::Symlink,
            _ => EntryKind::File,
        };

        let (size, create_time, modify_time) = match lookup_inode(
            reader, catalog_root, omap_root, block_size, drec.file_id, xid_max, cache.as_deref_mut(),
        ) {
            Ok(inode) => (inode.size(), inode.create_time, inode.modify_time),
            Err(_) => (0, 0, 0),
        };

        dir_entries.push(DirEntry {
            name,
            oid: drec.file_id,
            kind,
            size,
            create_time,
            modify_time,
        });
    }

    Ok(dir_entries)
}

fn scan_dir_records<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    parent_oid: u64,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_catalog_key(key) {
            Ok((oid, j_type)) => match compare_catalog_keys(oid, j_type, parent_oid, J_TYPE_DIR_REC) {
                std::cmp::Ordering::Less => Some(false),
                std::cmp::Ordering::Equal => Some(true),
                std::cmp::Ordering::Greater => {
                    if oid == parent_oid && j_type == J_TYPE_DIR_REC {
                        Some(true)
                    } else {
                        None
                    }
                }
            },
            Err(_) => Some(false),
        }
    };

    btree::btree_scan_cached(
        reader,
        catalog_root,
        block_size,
        0, 0, // variable-size keys and values
        &range_fn,
        Some(omap_root),
        cache,
    )
}

/// Look up an inode record in the catalog B-tree. `xid_max` selects the
/// object-map snapshot to resolve `catalog_root`/`omap_root` against
/// (spec §6); `None` means the live, most recent mapping.
pub fn lookup_inode<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    oid: u64,
    xid_max: Option<u64>,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<InodeVal> {
    let _ = xid_max; // catalog_root/omap_root are already resolved by the caller for the target xid
    let compare_fn = |key: &[u8]| -> std::cmp::Ordering {
        match decode_catalog_key(key) {
            Ok((key_oid, key_type)) => {
                let search_oid = oid;
                let search_type = J_TYPE_INODE;
                match key_oid.cmp(&search_oid) {
                    std::cmp::Ordering::Equal => (key_type).cmp(&search_type),
                    ord => ord,
                }
            }
            Err(_) => std::cmp::Ordering::Less,
        }
    };

    let val = btree::btree_lookup_cached(
        reader,
        catalog_root,
        block_size,
        0, 0,
        &compare_fn,
        Some(omap_root),
        cache,
    )?;

    match val {
        Some(data) => InodeVal::parse(&data),
        None => Err(ApfsError::FileNotFound(format!("inode OID {}", oid))),
    }
}

/// Look up all file extent records for a given file OID (private_id).
pub fn lookup_extents<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    file_oid: u64,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<Vec<FileExtentVal>> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_catalog_key(key) {
            Ok((oid, j_type)) => {
                if oid == file_oid && j_type == J_TYPE_FILE_EXTENT {
                    Some(true) // match
                } else {
                    match compare_catalog_keys(oid, j_type, file_oid, J_TYPE_FILE_EXTENT) {
                        std::cmp::Ordering::Less => Some(false), // before target, skip
                        std::cmp::Ordering::Greater => None,     // past target, stop
                        std::cmp::Ordering::Equal => Some(true), // shouldn't reach here
                    }
                }
            }
            Err(_) => Some(false),
        }
    };

    let entries = btree::btree_scan_cached(
        reader,
        catalog_root,
        block_size,
        0, 0,
        &range_fn,
        Some(omap_root),
        cache,
    )?;

    let mut extents = Vec::new();
    for (_key, val) in &entries {
        extents.push(FileExtentVal::parse(val)?);
    }

    Ok(extents)
}

/// Resolve a path like "/Applications/Upscayl.app/Contents/Info.plist" to its (OID, InodeVal).
///
/// `.` components are skipped and `..` walks back to the parent OID already
/// recorded while descending; a leading `..` past the root simply stays at
/// the root, matching typical path-resolution behavior for a read-only view.
pub fn resolve_path<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    path: &str,
    xid_max: Option<u64>,
    fold: bool,
    mut cache: Option<&mut btree::BTreeCache>,
) -> Result<(u64, InodeVal)> {
    let path = path.trim_matches('/');

    if path.is_empty() {
        let inode = lookup_inode(reader, catalog_root, omap_root, block_size, ROOT_DIR_RECORD, xid_max, cache.as_deref_mut())?;
        return Ok((ROOT_DIR_RECORD, inode));
    }

    let mut stack: Vec<u64> = vec![ROOT_DIR_RECORD];

    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if stack.len() > 1 {
                    stack.pop();
                }
            }
            name => {
                let parent_oid = *stack.last().unwrap();
                let drec = lookup_drec(reader, omap_root, catalog_root, block_size, parent_oid, name, fold, cache.as_deref_mut())?;
                stack.push(drec.file_id);
            }
        }
    }

    let final_oid = *stack.last().unwrap();
    let inode = lookup_inode(reader, catalog_root, omap_root, block_size, final_oid, xid_max, cache.as_deref_mut())?;
    Ok((final_oid, inode))
}

/// Look up a specific directory record by name under a parent OID. Matching
/// is byte-exact unless `fold` requests case/normalization-insensitive
/// comparison (spec §4.7/§9, driven by the volume's incompatible-feature
/// bits).
fn lookup_drec<R: Read + Seek>(
    reader: &mut R,
    omap_root: u64,
    catalog_root: u64,
    block_size: u32,
    parent_oid: u64,
    name: &str,
    fold: bool,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<DrecVal> {
    let entries = scan_dir_records(reader, catalog_root, omap_root, block_size, parent_oid, cache)?;

    for (key, val) in &entries {
        if let Ok((entry_name, _hash)) = decode_drec_name(key) {
            if names_match(&entry_name, name, fold) {
                return DrecVal::parse(val);
            }
        }
    }

    Err(ApfsError::FileNotFound(name.to_string()))
}

/// Compare two catalog keys in APFS sort order: OID first, then type.
/// Returns the ordering of (oid_a, type_a) vs (oid_b, type_b).
fn compare_catalog_keys(oid_a: u64, type_a: u8, oid_b: u64, type_b: u8) -> std::cmp::Ordering {
    match oid_a.cmp(&oid_b) {
        std::cmp::Ordering::Equal => type_a.cmp(&type_b),
        ord => ord,
    }
}

/// List xattr key-value pairs recorded against a given object OID.
pub fn list_xattrs<R: Read + Seek>(
    reader: &mut R,
    catalog_root: u64,
    omap_root: u64,
    block_size: u32,
    oid: u64,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<Vec<(String, Vec<u8>)>> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_catalog_key(key) {
            Ok((key_oid, j_type)) => match compare_catalog_keys(key_oid, j_type, oid, J_TYPE_XATTR) {
                std::cmp::Ordering::Less => Some(false),
                std::cmp::Ordering::Equal => Some(true),
                std::cmp::Ordering::Greater => {
                    if key_oid == oid && j_type == J_TYPE_XATTR {
                        Some(true)
                    } else {
                        None
                    }
                }
            },
            Err(_) => Some(false),
        }
    };

    let entries = btree::btree_scan_cached(
        reader,
        catalog_root,
        block_size,
        0, 0,
        &range_fn,
        Some(omap_root),
        cache,
    )?;

    let mut out = Vec::new();
    for (key, val) in &entries {
        if key.len() < 10 {
            continue;
        }
        let name_len = u16::from_le_bytes([key[8], key[9]]) as usize;
        let name_start = 10;
        let name_end = name_start + name_len;
        if name_end > key.len() {
            continue;
        }
        let name_bytes = &key[name_start..name_end];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..nul]).to_string();
        out.push((name, val.clone()));
    }
    Ok(out)
}

/// Resolve a virtual object OID through an object map for a given snapshot
/// xid ceiling, returning its physical block.
pub fn resolve_virtual_block<R: Read + Seek>(
    reader: &mut R,
    omap_root: u64,
    block_size: u32,
    oid: u64,
    xid_max: Option<u64>,
    cache: Option<&mut btree::BTreeCache>,
) -> Result<u64> {
    omap::omap_lookup(reader, omap_root, block_size, oid, xid_max, cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock;
    use crate::omap as omap_mod;
    use std::io::BufReader;

    fn open_volume() -> (BufReader<std::fs::File>, u64, u64, u32) {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let mut reader = BufReader::new(file);

        let nxsb = superblock::read_nxsb(&mut reader).unwrap();
        let latest = superblock::find_latest_nxsb(&mut reader, &nxsb).unwrap();
        let block_size = latest.block_size;

        let container_omap_root = omap_mod::read_omap_tree_root(&mut reader, latest.omap_oid, block_size).unwrap();

        let vol_oid = latest.fs_oids.iter().find(|&&o| o != 0).copied().unwrap();
        let vol_block = omap_mod::omap_lookup(&mut reader, container_omap_root, block_size, vol_oid, None, None).unwrap();

        let vol_data = crate::object::read_block(&mut reader, vol_block, block_size).unwrap();
        let vol_sb = superblock::ApfsSuperblock::parse(&vol_data).unwrap();

        let vol_omap_root = omap_mod::read_omap_tree_root(&mut reader, vol_sb.omap_oid, block_size).unwrap();
        let catalog_root = omap_mod::omap_lookup(&mut reader, vol_omap_root, block_size, vol_sb.root_tree_oid, None, None).unwrap();

        (reader, catalog_root, vol_omap_root, block_size)
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_list_root() {
        let (mut reader, catalog_root, omap_root, block_size) = open_volume();

        let entries = list_directory(&mut reader, catalog_root, omap_root, block_size, ROOT_DIR_RECORD, None, None).unwrap();
        assert!(!entries.is_empty(), "Root directory should have entries");
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_resolve_path() {
        let (mut reader, catalog_root, omap_root, block_size) = open_volume();

        let entries = list_directory(&mut reader, catalog_root, omap_root, block_size, ROOT_DIR_RECORD, None, None).unwrap();
        let first = entries.first().expect("Root should have entries");
        let path = format!("/{}", first.name);
        let (oid, inode) = resolve_path(&mut reader, catalog_root, omap_root, block_size, &path, None, true, None).unwrap();
        assert!(oid > 0);
        assert!(inode.kind() != 0);
    }

    #[test]
    fn test_drec_val_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&1000i64.to_le_bytes());
        data.extend_from_slice(&(DT_DIR as u16).to_le_bytes());

        let drec = DrecVal::parse(&data).unwrap();
        assert_eq!(drec.file_id, 42);
        assert_eq!(drec.date_added, 1000);
        assert_eq!(drec.file_type(), DT_DIR);
    }

    #[test]
    fn test_file_extent_val_parse() {
        let flags_and_length: u64 = 0xAB00_0000_0000_1000;
        let mut data = Vec::new();
        data.extend_from_slice(&flags_and_length.to_le_bytes());
        data.extend_from_slice(&100u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());

        let extent = FileExtentVal::parse(&data).unwrap();
        assert_eq!(extent.length(), 0x1000);
        assert_eq!(extent.phys_block_num, 100);
        assert_eq!(extent.crypto_id, 0);
        assert!(!extent.is_sparse());
    }

    #[test]
    fn fold_name_matches_across_case() {
        assert_eq!(fold_name("Résumé.PDF"), fold_name("résumé.pdf"));
        assert_ne!(fold_name("Readme"), fold_name("readme.txt"));
    }

    #[test]
    fn resolve_path_handles_dot_and_dotdot() {
        // Pure path-normalization behavior, no I/O: "a/../a/./b" and "a/b"
        // should walk the same component sequence.
        let normalize = |path: &str| -> Vec<&str> {
            let mut stack: Vec<&str> = Vec::new();
            for component in path.trim_matches('/').split('/') {
                match component {
                    "" | "." => continue,
                    ".." => {
                        stack.pop();
                    }
                    name => stack.push(name),
                }
            }
            stack
        };
        assert_eq!(normalize("a/../a/./b"), normalize("a/b"));
    }
}
