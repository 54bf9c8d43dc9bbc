//! Key bag parsing and the KEK unlock algorithm (spec §4.5, §3 "Key bag").
//!
//! Grounded on `libfsapfs_key_bag_entry.c`, `libfsapfs_key_encrypted_key.c`,
//! `libfsapfs_container_key_bag.c`, `libfsapfs_volume_key_bag.c`. A
//! container and a volume each own one key bag; both share the same
//! on-disk entry format, only the AES-XTS key used to decrypt the raw
//! bytes differs (container UUID vs. volume UUID, spec §4.5 first
//! paragraph).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use uuid::Uuid;

use crate::crypto::{AesXtsContext, VolumeEncryptionKey};
use crate::error::{ApfsError, Result};
use crate::object::ObjectHeader;

/// Marker that precedes an unwrapped key when the unwrap key was correct.
const UNWRAP_MARKER: [u8; 8] = [0xA6; 8];

/// Recovery-password slot identifier (spec §4.5).
pub fn recovery_password_uuid() -> Uuid {
    Uuid::parse_str("EBC6C064-0000-11AA-AA11-00306543ECAC").expect("valid constant uuid")
}

/// Key bag entry types (spec §3 "Key bag").
pub const KB_ENTRY_TYPE_VOLUME_KEY: u16 = 2;
pub const KB_ENTRY_TYPE_VOLUME_POINTER: u16 = 3;

/// One key bag entry: `{identifier: uuid, entry_type, data}`.
#[derive(Debug, Clone)]
pub struct KeyBagEntry {
    pub identifier: Uuid,
    pub entry_type: u16,
    pub data: Vec<u8>,
}

/// A decrypted, parsed key bag.
#[derive(Debug, Clone, Default)]
pub struct KeyBag {
    pub entries: Vec<KeyBagEntry>,
}

impl KeyBag {
    /// Parse a decrypted key bag blob: 32-byte object header, 16-byte bag
    /// header, then 16-byte-aligned entries.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ObjectHeader::SIZE + 16 {
            return Err(ApfsError::CorruptedData("key bag too short".into()));
        }

        let mut cursor = Cursor::new(&data[ObjectHeader::SIZE..]);
        let version = cursor.read_u16::<LittleEndian>()?;
        let num_entries = cursor.read_u16::<LittleEndian>()?;
        let _data_size = cursor.read_u32::<LittleEndian>()?;
        let mut _reserved = [0u8; 8];
        cursor.read_exact(&mut _reserved)?;

        if version != 2 {
            return Err(ApfsError::UnsupportedVersion(format!(
                "key bag format version {}",
                version
            )));
        }

        let mut offset = ObjectHeader::SIZE + 16;
        let mut entries = Vec::with_capacity(num_entries as usize);

        for _ in 0..num_entries {
            if offset + 24 > data.len() {
                return Err(ApfsError::CorruptedData("key bag entry header truncated".into()));
            }
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&data[offset..offset + 16]);
            let identifier = Uuid::from_bytes(id_bytes);

            let entry_type = u16::from_le_bytes([data[offset + 16], data[offset + 17]]);
            let entry_size = u16::from_le_bytes([data[offset + 18], data[offset + 19]]) as usize;
            // 4 reserved bytes at offset+20..offset+24

            let payload_start = offset + 24;
            let payload_end = payload_start + entry_size;
            if payload_end > data.len() {
                return Err(ApfsError::CorruptedData("key bag entry payload truncated".into()));
            }

            entries.push(KeyBagEntry {
                identifier,
                entry_type,
                data: data[payload_start..payload_end].to_vec(),
            });

            let padded = (entry_size + 15) & !15;
            offset = payload_start + padded;
        }

        Ok(KeyBag { entries })
    }

    pub fn find_by_type_and_identifier(&self, entry_type: u16, identifier: Uuid) -> Option<&KeyBagEntry> {
        self.entries
            .iter()
            .find(|e| e.entry_type == entry_type && e.identifier == identifier)
    }

    pub fn entries_of_type(&self, entry_type: u16) -> impl Iterator<Item = &KeyBagEntry> {
        self.entries.iter().filter(move |e| e.entry_type == entry_type)
    }
}

/// A `(block, count)` extent locator, used both for the container
/// superblock's key bag pointer and for a volume-pointer entry's payload.
#[derive(Debug, Clone, Copy)]
pub struct KeyBagExtent {
    pub block: u64,
    pub count: u64,
}

impl KeyBagExtent {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(ApfsError::CorruptedData("key bag extent pointer too short".into()));
        }
        Ok(KeyBagExtent {
            block: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            count: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

/// Encryption methods referenced by a KEK metadata tag (spec §4.5 step 1).
pub const ENCRYPTION_METHOD_AES_XTS_256: u32 = 0;
pub const ENCRYPTION_METHOD_AES_XTS_256_ALT: u32 = 16;
pub const ENCRYPTION_METHOD_AES_XTS_128: u32 = 2;

/// A parsed key-encrypted-key tag/length/value blob (spec §3, §4.5).
#[derive(Debug, Clone)]
pub struct KekSlot {
    pub identifier: Uuid,
    pub encryption_method: u32,
    pub wrapped_kek: Vec<u8>,
    pub iterations: u64,
    pub salt: [u8; 16],
}

const TAG_IDENTIFIER: u8 = 0x81;
const TAG_METADATA: u8 = 0x82;
const TAG_WRAPPED_KEK: u8 = 0x83;
const TAG_ITERATIONS: u8 = 0x84;
const TAG_SALT: u8 = 0x85;

/// Parse the packed tag/length/value object carried by a type-2 or type-3
/// key bag entry's payload.
pub fn parse_kek_tlv(data: &[u8]) -> Result<KekSlot> {
    let mut identifier: Option<Uuid> = None;
    let mut encryption_method: Option<u32> = None;
    let mut wrapped_kek: Option<Vec<u8>> = None;
    let mut iterations: Option<u64> = None;
    let mut salt: Option<[u8; 16]> = None;

    let mut pos = 0usize;
    while pos + 2 <= data.len() {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        let value_start = pos + 2;
        let value_end = value_start + len;
        if value_end > data.len() {
            break;
        }
        let value = &data[value_start..value_end];

        match tag {
            TAG_IDENTIFIER if value.len() >= 16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&value[..16]);
                identifier = Some(Uuid::from_bytes(b));
            }
            TAG_METADATA if value.len() >= 4 => {
                encryption_method = Some(u32::from_le_bytes(value[0..4].try_into().unwrap()));
            }
            TAG_WRAPPED_KEK => {
                wrapped_kek = Some(value.to_vec());
            }
            TAG_ITERATIONS if !value.is_empty() && value.len() <= 8 => {
                let mut cursor = Cursor::new(value);
                let mut acc: u64 = 0;
                for _ in 0..value.len() {
                    acc = (acc << 8) | cursor.read_u8()? as u64;
                }
                iterations = Some(acc);
            }
            TAG_SALT if value.len() >= 16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&value[..16]);
                salt = Some(b);
            }
            _ => {}
        }

        pos = value_end;
    }

    Ok(KekSlot {
        identifier: identifier.ok_or_else(|| ApfsError::CorruptedData("KEK blob missing identifier tag".into()))?,
        encryption_method: encryption_method
            .ok_or_else(|| ApfsError::CorruptedData("KEK blob missing metadata tag".into()))?,
        wrapped_kek: wrapped_kek
            .ok_or_else(|| ApfsError::CorruptedData("KEK blob missing wrapped-kek tag".into()))?,
        iterations: iterations.ok_or_else(|| ApfsError::CorruptedData("KEK blob missing iterations tag".into()))?,
        salt: salt.ok_or_else(|| ApfsError::CorruptedData("KEK blob missing salt tag".into()))?,
    })
}

/// Derive the unwrap key from a password via PBKDF2-HMAC-SHA256 (spec §4.5
/// step 1). Key length is 32 bytes for methods 0/16, 16 bytes for method 2.
pub fn derive_key(password: &[u8], slot: &KekSlot) -> Result<Vec<u8>> {
    let key_len = match slot.encryption_method {
        ENCRYPTION_METHOD_AES_XTS_256 | ENCRYPTION_METHOD_AES_XTS_256_ALT => 32,
        ENCRYPTION_METHOD_AES_XTS_128 => 16,
        other => return Err(ApfsError::EncryptionMethodUnsupported(other)),
    };

    let mut derived = vec![0u8; key_len];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password, &slot.salt, slot.iterations as u32, &mut derived);
    Ok(derived)
}

/// AES key-unwrap (RFC 3394) dispatch over the two key sizes this format
/// uses.
fn aes_key_unwrap(derived: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    use aes_kw::{KekAes128, KekAes256};

    match derived.len() {
        32 => {
            let kek = KekAes256::try_from(derived).map_err(|_| ApfsError::UnlockFailed)?;
            kek.unwrap_vec(wrapped).map_err(|_| ApfsError::UnlockFailed)
        }
        16 => {
            let kek = KekAes128::try_from(derived).map_err(|_| ApfsError::UnlockFailed)?;
            kek.unwrap_vec(wrapped).map_err(|_| ApfsError::UnlockFailed)
        }
        other => Err(ApfsError::CorruptedData(format!(
            "unexpected derived key length {}",
            other
        ))),
    }
}

/// Unwrap a KEK slot using an already-derived key rather than a password
/// (spec §4.5: the container-bag second unwrap stage when the container key
/// bag only holds a type-3 pointer entry — the volume bag's own type-3 entry
/// is password-unwrapped first to produce this intermediate key). Same
/// marker check as `unlock_slot`.
pub fn unwrap_with_key(slot: &KekSlot, key: &[u8]) -> Result<Vec<u8>> {
    let unwrapped = aes_key_unwrap(key, &slot.wrapped_kek)?;

    if unwrapped.len() < 8 || unwrapped[..8] != UNWRAP_MARKER {
        log::debug!("key bag slot {} failed marker check (keyed unwrap)", slot.identifier);
        return Err(ApfsError::UnlockFailed);
    }

    Ok(unwrapped[8..].to_vec())
}

/// Unwrap a KEK slot with a password, returning the bytes following the
/// `A6A6…` marker on success (spec §4.5 step 3). Returns `UnlockFailed`
/// when the marker doesn't match — i.e. the password was wrong.
pub fn unlock_slot(slot: &KekSlot, password: &[u8]) -> Result<Vec<u8>> {
    let derived = derive_key(password, slot)?;
    unwrap_with_key(slot, &derived)
}

/// Synthesize the AES-XTS tweak half for method-2 slots:
/// `SHA-256(VEK16 || identifier)[0..16]` (spec §4.5 step 3).
pub fn synthesize_method2_tweak(vek16: &[u8], identifier: Uuid) -> [u8; 16] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(vek16);
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[0..16]);
    out
}

/// Decrypt raw key bag bytes read from disk. Both the AES-XTS data key and
/// tweak key are the owning container/volume UUID (spec §4.5, §3); the
/// per-sector tweak is the absolute byte offset divided by sector size.
pub fn decrypt_keybag_bytes(mut raw: Vec<u8>, owner_uuid: Uuid, sector_size: u64) -> Vec<u8> {
    let uuid_bytes = *owner_uuid.as_bytes();
    let vek = VolumeEncryptionKey {
        data_key: uuid_bytes,
        tweak_key: uuid_bytes,
    };
    let ctx = AesXtsContext::new(&vek);
    let first_tweak = crate::crypto::keybag_tweak_unit(0, sector_size);
    ctx.decrypt(&mut raw, first_tweak, sector_size as usize);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_uuid_parses() {
        let u = recovery_password_uuid();
        assert_eq!(u.to_string().to_uppercase(), "EBC6C064-0000-11AA-AA11-00306543ECAC");
    }

    #[test]
    fn kek_tlv_roundtrip() {
        let mut blob = Vec::new();
        let id = Uuid::from_bytes([0x11; 16]);
        blob.push(TAG_IDENTIFIER);
        blob.push(16);
        blob.extend_from_slice(id.as_bytes());

        blob.push(TAG_METADATA);
        blob.push(4);
        blob.extend_from_slice(&0u32.to_le_bytes());

        blob.push(TAG_WRAPPED_KEK);
        blob.push(40);
        blob.extend_from_slice(&[0xAAu8; 40]);

        blob.push(TAG_ITERATIONS);
        blob.push(2);
        blob.extend_from_slice(&10000u16.to_be_bytes());

        blob.push(TAG_SALT);
        blob.push(16);
        blob.extend_from_slice(&[0u8; 16]);

        let slot = parse_kek_tlv(&blob).unwrap();
        assert_eq!(slot.identifier, id);
        assert_eq!(slot.encryption_method, 0);
        assert_eq!(slot.iterations, 10000);
        assert_eq!(slot.wrapped_kek.len(), 40);
    }
}
