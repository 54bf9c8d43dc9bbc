//! Extended attribute records (spec §4.10, §3 "Extended-attribute value").
//!
//! Grounded on `libfsapfs_attributes.c` / `libfsapfs_attribute_values.h`:
//! a record's value is either inline bytes or a 40-byte data-stream
//! descriptor, selected by flag bit 0.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{ApfsError, Result};

pub const XATTR_FLAG_DATA_STREAM: u16 = 0x0001;
pub const XATTR_FLAG_EMBEDDED: u16 = 0x0002;

/// Well-known extended attribute names surfaced to the file-entry layer.
pub const NAME_DECMPFS: &str = "com.apple.decmpfs";
pub const NAME_RESOURCE_FORK: &str = "com.apple.ResourceFork";
pub const NAME_SYMLINK: &str = "com.apple.fs.symlink";

/// A data-stream descriptor embedded in an xattr record when
/// `XATTR_FLAG_DATA_STREAM` is set.
#[derive(Debug, Clone, Copy)]
pub struct XattrDataStream {
    pub stream_oid: u64,
    pub used_size: u64,
    pub allocated_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

impl XattrDataStream {
    const SIZE: usize = 40;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::CorruptedData("xattr data stream descriptor too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(XattrDataStream {
            stream_oid: cursor.read_u64::<LittleEndian>()?,
            used_size: cursor.read_u64::<LittleEndian>()?,
            allocated_size: cursor.read_u64::<LittleEndian>()?,
            default_crypto_id: cursor.read_u64::<LittleEndian>()?,
            total_bytes_written: cursor.read_u64::<LittleEndian>()?,
            total_bytes_read: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Either inline attribute bytes or a reference to a separate data stream.
#[derive(Debug, Clone)]
pub enum XattrPayload {
    Inline(Vec<u8>),
    Stream(XattrDataStream),
}

/// Parsed extended attribute value (j_xattr_val_t).
#[derive(Debug, Clone)]
pub struct XattrVal {
    pub flags: u16,
    pub payload: XattrPayload,
}

impl XattrVal {
    /// Parse from raw catalog value bytes: `flags: u16, xdata_len: u16,
    /// then xdata_len bytes (either inline data or the 40-byte stream
    /// descriptor, selected by the data-stream flag)`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ApfsError::CorruptedData("xattr value too short".into()));
        }
        let flags = u16::from_le_bytes([data[0], data[1]]);
        let xdata_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        let body_start = 4;
        let body_end = body_start + xdata_len;
        if body_end > data.len() {
            return Err(ApfsError::CorruptedData("xattr value body truncated".into()));
        }
        let body = &data[body_start..body_end];

        let payload = if flags & XATTR_FLAG_DATA_STREAM != 0 {
            XattrPayload::Stream(XattrDataStream::parse(body)?)
        } else {
            XattrPayload::Inline(body.to_vec())
        };

        Ok(XattrVal { flags, payload })
    }

    pub fn is_data_stream(&self) -> bool {
        self.flags & XATTR_FLAG_DATA_STREAM != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inline_value() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_le_bytes()); // flags: no data stream
        data.extend_from_slice(&5u16.to_le_bytes()); // xdata_len
        data.extend_from_slice(b"hello");

        let val = XattrVal::parse(&data).unwrap();
        assert!(!val.is_data_stream());
        match val.payload {
            XattrPayload::Inline(bytes) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected inline payload"),
        }
    }

    #[test]
    fn parses_stream_descriptor() {
        let mut data = Vec::new();
        data.extend_from_slice(&XATTR_FLAG_DATA_STREAM.to_le_bytes());
        data.extend_from_slice(&40u16.to_le_bytes());
        for v in [1u64, 2, 3, 4, 5, 6] {
            data.extend_from_slice(&v.to_le_bytes());
        }

        let val = XattrVal::parse(&data).unwrap();
        assert!(val.is_data_stream());
        match val.payload {
            XattrPayload::Stream(s) => {
                assert_eq!(s.stream_oid, 1);
                assert_eq!(s.total_bytes_read, 6);
            }
            _ => panic!("expected stream payload"),
        }
    }
}
