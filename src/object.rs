use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x05;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0C;
pub const OBJECT_TYPE_FS: u32 = 0x0D;

// Object flag masks (upper 16 bits of type_and_flags)
pub const OBJ_PHYSICAL: u32 = 0x00000000;
pub const OBJ_VIRTUAL: u32 = 0x80000000;
pub const OBJ_EPHEMERAL: u32 = 0x40000000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC0000000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000FFFF;

// Additional flag bits (upper 16 bits, outside the storage-type mask)
pub const OBJ_NOHEADER: u32 = 0x20000000;
pub const OBJ_ENCRYPTED: u32 = 0x10000000;
pub const OBJ_NONPERSISTENT: u32 = 0x08000000;

/// 32-byte header present on every block-addressed APFS on-disk object.
/// All fields are little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    /// Size of the on-disk header in bytes
    pub const SIZE: usize = 32;

    /// Parse an object header from the first 32 bytes of a block
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::CorruptedData(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Get the object type (lower 16 bits, no flags)
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    /// Get the storage type flags (upper 2 bits)
    pub fn storage_type(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }

    /// Whether this is a physical object (address = block number)
    pub fn is_physical(&self) -> bool {
        self.storage_type() == OBJ_PHYSICAL
    }

    /// Whether this is a virtual object (address resolved through an object map)
    pub fn is_virtual(&self) -> bool {
        self.storage_type() == OBJ_VIRTUAL
    }

    /// Whether this is an ephemeral object (address resolved through a checkpoint map)
    pub fn is_ephemeral(&self) -> bool {
        self.storage_type() == OBJ_EPHEMERAL
    }

    pub fn is_encrypted(&self) -> bool {
        self.type_and_flags & OBJ_ENCRYPTED != 0
    }

    pub fn is_no_header(&self) -> bool {
        self.type_and_flags & OBJ_NOHEADER != 0
    }
}

/// Read a full block at the given block number, verify its checksum, and parse the header.
pub fn read_object<R: Read + Seek>(
    reader: &mut R,
    block_number: u64,
    block_size: u32,
) -> Result<(ObjectHeader, Vec<u8>)> {
    let block = read_block(reader, block_number, block_size)?;

    if !fletcher::verify_object(&block) {
        return Err(ApfsError::InvalidChecksum);
    }

    let header = ObjectHeader::parse(&block)?;
    Ok((header, block))
}

/// Read a block at the given block number without checksum verification.
///
/// Used for `no-header` payloads (certain key-bag blocks, spec §4.1) that
/// are not themselves block-addressed APFS objects.
pub fn read_block<R: Read + Seek>(
    reader: &mut R,
    block_number: u64,
    block_size: u32,
) -> Result<Vec<u8>> {
    let offset = block_number
        .checked_mul(block_size as u64)
        .ok_or_else(|| ApfsError::OutOfBounds("block offset overflow".into()))?;
    reader.seek(SeekFrom::Start(offset))?;

    let mut block = vec![0u8; block_size as usize];
    reader.read_exact(&mut block)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_header_classifies_storage_type() {
        let mut data = vec![0u8; ObjectHeader::SIZE];
        data[24..28].copy_from_slice(&(OBJECT_TYPE_OMAP | OBJ_VIRTUAL).to_le_bytes());
        let header = ObjectHeader::parse(&data).unwrap();
        assert!(header.is_virtual());
        assert!(!header.is_physical());
        assert_eq!(header.object_type(), OBJECT_TYPE_OMAP);
    }

    #[test]
    fn object_header_too_short_errors() {
        let data = vec![0u8; 10];
        assert!(ObjectHeader::parse(&data).is_err());
    }
}
