//! Read-only APFS (Apple File System) container/volume parser.
//!
//! `Container::open` parses the container superblock and checkpoint area,
//! then exposes each APFS volume inside it through `Container::volume_by_index`.
//! A `Volume` resolves paths, lists directories, reads file and
//! extended-attribute data (transparently decrypting and decompressing as
//! needed), and enumerates snapshots.
//!
//! Concurrency (spec §5): the underlying reader is behind a `Mutex` since
//! seeking is inherently exclusive; per-volume state (superblock, resolved
//! catalog/omap roots, unlock state) is materialized lazily behind a
//! `RwLock`-guarded slot so concurrent callers share one `Volume` without
//! re-walking the object maps on every access.

pub mod btree;
pub mod cache;
pub mod catalog;
pub mod checkpoint;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod error;
pub mod extents;
pub mod fletcher;
pub mod keybag;
pub mod object;
pub mod omap;
pub mod snapshot;
pub mod superblock;
pub mod xattr;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use catalog::{FileExtentVal, InodeVal};
use checkpoint::CheckpointMap;
use crypto::{AesXtsContext, VolumeEncryptionKey};
use error::{ApfsError, Result};
use extents::ApfsForkReader;
use keybag::{KeyBag, KeyBagExtent};
use snapshot::SnapshotMetadata;
use superblock::{ApfsSuperblock, NxSuperblock};
use xattr::{XattrPayload, XattrVal};

pub use config::{CacheConfig, OpenOptions};
pub use error::ApfsError as Error;

/// Coarse file-system object kind, derived from the BSD mode in an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

fn entry_kind_from_mode(mode_type: u16) -> EntryKind {
    match mode_type {
        catalog::INODE_DIR_TYPE => EntryKind::Directory,
        catalog::INODE_SYMLINK_TYPE => EntryKind::Symlink,
        _ => EntryKind::File,
    }
}

/// One entry returned by `Volume::list_directory`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

/// Metadata for a single file-system object, as returned by `Volume::stat`
/// and carried inside a `FileEntry`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub nlink: u32,
}

fn inode_to_stat(oid: u64, inode: &InodeVal) -> FileStat {
    FileStat {
        oid,
        kind: entry_kind_from_mode(inode.kind()),
        size: inode.size(),
        create_time: inode.create_time,
        modify_time: inode.modify_time,
        uid: inode.uid,
        gid: inode.gid,
        mode: inode.mode,
        nlink: inode.nlink(),
    }
}

/// An object resolved by path or identifier. The path is only known when
/// resolution started from one — `file_entry_by_identifier` leaves it unset
/// rather than reconstructing a parent chain nobody asked for.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub oid: u64,
    pub path: Option<String>,
    pub stat: FileStat,
}

/// One entry produced by `Volume::walk`, carrying the full path alongside
/// the directory-listing entry that produced it.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub entry: DirEntry,
}

/// Logical position, length and sparseness of one file extent, as exposed
/// through `Volume::file_entry_extent_by_index` (spec §4.8).
#[derive(Debug, Clone, Copy)]
pub struct FileExtentInfo {
    pub logical_offset: u64,
    pub length: u64,
    pub sparse: bool,
}

/// A named extended attribute's identity and size, without its value
/// (fetch that with `Volume::extended_attribute_read_at`).
#[derive(Debug, Clone)]
pub struct ExtendedAttribute {
    pub name: String,
    pub size: u64,
}

fn xattr_size(xval: &XattrVal) -> u64 {
    match &xval.payload {
        XattrPayload::Inline(bytes) => bytes.len() as u64,
        XattrPayload::Stream(stream) => stream.used_size,
    }
}

/// One volume snapshot (spec §4.11), as returned by `Volume::snapshot_by_index`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub xid: u64,
    pub create_time: i64,
    pub change_time: i64,
}

/// Summary information about an open volume.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub uuid: Uuid,
    pub block_size: u32,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub is_encrypted: bool,
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn copy_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    if offset >= data.len() as u64 {
        return 0;
    }
    let start = offset as usize;
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

fn read_extent_bytes<R: Read + Seek>(reader: &mut R, extent: KeyBagExtent, block_size: u32) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity((extent.count * block_size as u64) as usize);
    for i in 0..extent.count {
        let block = object::read_block(reader, extent.block + i, block_size)?;
        raw.extend_from_slice(&block);
    }
    Ok(raw)
}

/// Per-volume resolved state, shared across `Volume` handles once
/// materialized (spec §5: lazy materialization behind the container's
/// `RwLock`-guarded volume slots).
struct VolumeState {
    index: usize,
    sblock: ApfsSuperblock,
    vol_omap_root: u64,
    catalog_root: u64,
    xid_max: Option<u64>,
    requires_unlock: bool,
    vek: RwLock<Option<VolumeEncryptionKey>>,
    btree_cache: Mutex<btree::BTreeCache>,
}

/// An open APFS container: the parsed superblock, checkpoint map, container
/// object map, and a lazily-populated table of its volumes.
///
/// `Container::open` reads only the container-level structures; no volume
/// superblock is read until `volume_by_index` is called for it the first
/// time (spec §4: opening a container resolves it; volumes resolve on
/// demand).
pub struct Container<R> {
    reader: Mutex<R>,
    nxsb: NxSuperblock,
    #[allow(dead_code)] // resolves ephemeral oids (e.g. the space manager); not reachable from this crate's read-only surface yet
    checkpoint_map: CheckpointMap,
    container_omap_root: u64,
    container_keybag: Option<KeyBag>,
    container_uuid: Uuid,
    volume_oids: Vec<u64>,
    volumes: RwLock<Vec<Option<Arc<VolumeState>>>>,
    options: OpenOptions,
    container_btree_cache: Mutex<btree::BTreeCache>,
}

impl<R: Read + Seek> Container<R> {
    /// Open a container with default cache sizing and no pinned snapshot.
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_options(reader, OpenOptions::default())
    }

    /// Open a container with explicit cache/descent options (spec §5).
    pub fn open_with_options(mut reader: R, options: OpenOptions) -> Result<Self> {
        let nxsb0 = superblock::read_nxsb(&mut reader)?;
        let nxsb = superblock::find_latest_nxsb(&mut reader, &nxsb0)?;
        let checkpoint_map = superblock::read_checkpoint_map(&mut reader, &nxsb)?;
        let container_omap_root = omap::read_omap_tree_root(&mut reader, nxsb.omap_oid, nxsb.block_size)?;
        let container_uuid = Uuid::from_bytes(nxsb.uuid);

        let container_keybag = match nxsb.keybag_location {
            Some(extent) => {
                let raw = read_extent_bytes(&mut reader, extent, nxsb.block_size)?;
                let decrypted = keybag::decrypt_keybag_bytes(raw, container_uuid, options.sector_size);
                KeyBag::parse(&decrypted).ok()
            }
            None => None,
        };

        let volume_oids: Vec<u64> = nxsb.fs_oids.iter().copied().filter(|&oid| oid != 0).collect();
        let volume_count = volume_oids.len();
        let node_cache_capacity = options.cache.node_cache_capacity;

        Ok(Container {
            reader: Mutex::new(reader),
            nxsb,
            checkpoint_map,
            container_omap_root,
            container_keybag,
            container_uuid,
            volume_oids,
            volumes: RwLock::new(vec![None; volume_count]),
            options,
            container_btree_cache: Mutex::new(btree::BTreeCache::new(node_cache_capacity, node_cache_capacity)),
        })
    }

    pub fn volume_count(&self) -> usize {
        self.volume_oids.len()
    }

    pub fn block_size(&self) -> u32 {
        self.nxsb.block_size
    }

    pub fn uuid(&self) -> Uuid {
        self.container_uuid
    }

    pub fn volume_by_index(&self, index: usize) -> Result<Volume<'_, R>> {
        let state = self.open_volume_state(index, None)?;
        Ok(Volume { container: self, state })
    }

    fn read_keybag_extent(&self, extent: KeyBagExtent) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap();
        read_extent_bytes(&mut *reader, extent, self.nxsb.block_size)
    }

    fn open_volume_state(&self, index: usize, xid_max: Option<u64>) -> Result<Arc<VolumeState>> {
        if xid_max.is_none() {
            let cached = self.volumes.read().unwrap().get(index).and_then(|s| s.clone());
            if let Some(state) = cached {
                return Ok(state);
            }
        }

        let fs_oid = *self
            .volume_oids
            .get(index)
            .ok_or_else(|| ApfsError::NotFound(format!("volume index {}", index)))?;

        let (sblock, vol_omap_root, catalog_root) = {
            let mut reader = self.reader.lock().unwrap();
            let mut container_cache = self.container_btree_cache.lock().unwrap();
            let vol_block = omap::omap_lookup(
                &mut *reader, self.container_omap_root, self.nxsb.block_size, fs_oid, xid_max, Some(&mut container_cache),
            )?;
            let vol_data = object::read_block(&mut *reader, vol_block, self.nxsb.block_size)?;
            let sblock = ApfsSuperblock::parse(&vol_data)?;
            let vol_omap_root = omap::read_omap_tree_root(&mut *reader, sblock.omap_oid, self.nxsb.block_size)?;
            let catalog_root = omap::omap_lookup(
                &mut *reader, vol_omap_root, self.nxsb.block_size, sblock.root_tree_oid, xid_max, Some(&mut container_cache),
            )?;
            (sblock, vol_omap_root, catalog_root)
        };

        let vol_uuid = Uuid::from_bytes(sblock.uuid);
        let requires_unlock = self.container_keybag.as_ref().is_some_and(|kb| {
            kb.find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_KEY, vol_uuid).is_some()
                || kb.find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_POINTER, vol_uuid).is_some()
        });

        let node_cache_capacity = self.options.cache.node_cache_capacity;
        let state = Arc::new(VolumeState {
            index,
            sblock,
            vol_omap_root,
            catalog_root,
            xid_max,
            requires_unlock,
            vek: RwLock::new(None),
            btree_cache: Mutex::new(btree::BTreeCache::new(node_cache_capacity, node_cache_capacity)),
        });

        if xid_max.is_none() {
            self.volumes.write().unwrap()[index] = Some(state.clone());
        }

        Ok(state)
    }
}

/// A handle to one volume within an open container. Cheap to clone the
/// underlying state (`Arc`), but takes the container's reader mutex for the
/// duration of any single read rather than holding it across calls.
pub struct Volume<'a, R> {
    container: &'a Container<R>,
    state: Arc<VolumeState>,
}

impl<'a, R: Read + Seek> Volume<'a, R> {
    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.state.sblock.volume_name.clone(),
            uuid: Uuid::from_bytes(self.state.sblock.uuid),
            block_size: self.container.nxsb.block_size,
            num_files: self.state.sblock.num_files,
            num_directories: self.state.sblock.num_directories,
            num_symlinks: self.state.sblock.num_symlinks,
            is_encrypted: self.state.requires_unlock,
        }
    }

    /// Whether reads that touch encrypted extents will currently fail
    /// (spec §4.5/§4.6): true until a matching key-bag entry has been
    /// unlocked with `unlock`.
    pub fn is_locked(&self) -> bool {
        self.state.requires_unlock && self.state.vek.read().unwrap().is_none()
    }

    /// Unlock the volume encryption key with a password (spec §4.5). If the
    /// container key bag holds the volume's type-2 entry directly, a single
    /// password-unwrap of that entry yields the VEK source. If the container
    /// bag only holds a type-3 pointer entry for this volume, the real
    /// algorithm needs a second stage: the pointed-to per-volume key bag's
    /// own type-3 entry is password-unwrapped to an intermediate key, and
    /// that intermediate key — not the password — is then used to AES-key-
    /// unwrap the container bag's type-2 entry for the same volume UUID;
    /// that second unwrap is what actually yields the VEK source.
    pub fn unlock(&self, password: &[u8]) -> Result<()> {
        let container_keybag = self.container.container_keybag.as_ref().ok_or(ApfsError::UnlockFailed)?;
        let vol_uuid = Uuid::from_bytes(self.state.sblock.uuid);

        let (slot, unwrapped) = match container_keybag.find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_KEY, vol_uuid) {
            Some(entry) => {
                let slot = keybag::parse_kek_tlv(&entry.data)?;
                let unwrapped = keybag::unlock_slot(&slot, password)?;
                (slot, unwrapped)
            }
            None => {
                let pointer = container_keybag
                    .find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_POINTER, vol_uuid)
                    .ok_or(ApfsError::UnlockFailed)?;
                let extent = KeyBagExtent::parse(&pointer.data)?;
                let raw = self.container.read_keybag_extent(extent)?;
                let decrypted = keybag::decrypt_keybag_bytes(raw, vol_uuid, self.container.options.sector_size);
                let volume_keybag = KeyBag::parse(&decrypted)?;

                let volume_slot_entry = volume_keybag
                    .find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_POINTER, vol_uuid)
                    .ok_or(ApfsError::UnlockFailed)?;
                let volume_slot = keybag::parse_kek_tlv(&volume_slot_entry.data)?;
                let volume_key = keybag::unlock_slot(&volume_slot, password)?;

                let container_slot_entry = container_keybag
                    .find_by_type_and_identifier(keybag::KB_ENTRY_TYPE_VOLUME_KEY, vol_uuid)
                    .ok_or(ApfsError::UnlockFailed)?;
                let slot = keybag::parse_kek_tlv(&container_slot_entry.data)?;
                let unwrapped = keybag::unwrap_with_key(&slot, &volume_key)?;
                (slot, unwrapped)
            }
        };

        let vek_bytes = if slot.encryption_method == keybag::ENCRYPTION_METHOD_AES_XTS_128 {
            let tweak_half = keybag::synthesize_method2_tweak(&unwrapped, slot.identifier);
            let mut combined = unwrapped;
            combined.extend_from_slice(&tweak_half);
            combined
        } else {
            unwrapped
        };

        let vek = VolumeEncryptionKey::from_bytes(&vek_bytes)?;
        *self.state.vek.write().unwrap() = Some(vek);
        log::debug!("volume {} unlocked", vol_uuid);
        Ok(())
    }

    fn build_fork_reader<'b>(
        &self,
        reader: &'b mut R,
        extents: Vec<FileExtentVal>,
        logical_size: u64,
    ) -> Result<ApfsForkReader<'b, R>> {
        let block_size = self.container.nxsb.block_size;
        let mut fork = ApfsForkReader::with_cache_capacity(
            reader,
            block_size,
            extents,
            logical_size,
            self.container.options.cache.data_block_cache_capacity,
        );
        if let Some(vek) = self.state.vek.read().unwrap().clone() {
            let ctx = AesXtsContext::new(&vek);
            fork = fork.with_encryption(ctx, self.container.options.sector_size);
        }
        Ok(fork)
    }

    fn resolve_xattr_bytes(&self, reader: &mut R, xval: &XattrVal, cache: &mut btree::BTreeCache) -> Result<Vec<u8>> {
        match &xval.payload {
            XattrPayload::Inline(bytes) => Ok(bytes.clone()),
            XattrPayload::Stream(stream) => {
                let block_size = self.container.nxsb.block_size;
                let extents = catalog::lookup_extents(
                    reader,
                    self.state.catalog_root,
                    self.state.vol_omap_root,
                    block_size,
                    stream.stream_oid,
                    Some(cache),
                )?;
                let mut fork = self.build_fork_reader(reader, extents, stream.used_size)?;
                let mut out = Vec::with_capacity(stream.used_size as usize);
                fork.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Decode a file's transparently-compressed content from its
    /// `com.apple.decmpfs` (and, for resource-fork-sourced methods,
    /// `com.apple.ResourceFork`) extended attributes (spec §4.9).
    fn read_compressed(&self, reader: &mut R, xattrs: &[(String, Vec<u8>)], cache: &mut btree::BTreeCache) -> Result<Vec<u8>> {
        let (_, raw) = xattrs
            .iter()
            .find(|(name, _)| name == xattr::NAME_DECMPFS)
            .ok_or_else(|| ApfsError::NotFound("decmpfs attribute".into()))?;
        let xval = XattrVal::parse(raw)?;
        let decmpfs_bytes = self.resolve_xattr_bytes(reader, &xval, cache)?;
        let header = compression::CompressionHeader::parse(&decmpfs_bytes)?;

        if header.is_resource_fork_sourced() {
            let (_, rsrc_raw) = xattrs
                .iter()
                .find(|(name, _)| name == xattr::NAME_RESOURCE_FORK)
                .ok_or_else(|| ApfsError::NotFound("resource fork attribute".into()))?;
            let rsrc_xval = XattrVal::parse(rsrc_raw)?;
            let rsrc_bytes = self.resolve_xattr_bytes(reader, &rsrc_xval, cache)?;
            let mut chunked = compression::ChunkedCompressedReader::new(header.method, rsrc_bytes, header.uncompressed_size)?;
            let mut out = vec![0u8; header.uncompressed_size as usize];
            chunked.read_at(0, &mut out)?;
            Ok(out)
        } else {
            let payload = &decmpfs_bytes[compression::CompressionHeader::SIZE.min(decmpfs_bytes.len())..];
            compression::decompress_inline(&header, payload)
        }
    }

    /// List the directory at `path` ("/" for the volume root).
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();

        if path == "/" || path.is_empty() {
            return catalog::list_directory(
                &mut *reader,
                self.state.catalog_root,
                self.state.vol_omap_root,
                block_size,
                catalog::ROOT_DIR_RECORD,
                self.state.xid_max,
                Some(&mut cache),
            );
        }

        let fold = self.state.sblock.folds_names();
        let (parent_oid, inode) = catalog::resolve_path(
            &mut *reader,
            self.state.catalog_root,
            self.state.vol_omap_root,
            block_size,
            path,
            self.state.xid_max,
            fold,
            Some(&mut cache),
        )?;
        if inode.kind() != catalog::INODE_DIR_TYPE {
            return Err(ApfsError::NotADirectory(path.to_string()));
        }
        catalog::list_directory(
            &mut *reader,
            self.state.catalog_root,
            self.state.vol_omap_root,
            block_size,
            parent_oid,
            self.state.xid_max,
            Some(&mut cache),
        )
    }

    /// Recursively enumerate every entry under the volume root.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut out = Vec::new();
        self.walk_into("/", &mut out)?;
        Ok(out)
    }

    fn walk_into(&self, path: &str, out: &mut Vec<WalkEntry>) -> Result<()> {
        for entry in self.list_directory(path)? {
            let child_path = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", path, entry.name)
            };
            let is_dir = entry.kind == EntryKind::Directory;
            out.push(WalkEntry { path: child_path.clone(), entry });
            if is_dir {
                self.walk_into(&child_path, out)?;
            }
        }
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.file_entry_by_path(path).is_ok()
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        Ok(self.file_entry_by_path(path)?.stat)
    }

    pub fn file_entry_by_path(&self, path: &str) -> Result<FileEntry> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        let fold = self.state.sblock.folds_names();
        let (oid, inode) = catalog::resolve_path(
            &mut *reader,
            self.state.catalog_root,
            self.state.vol_omap_root,
            block_size,
            path,
            self.state.xid_max,
            fold,
            Some(&mut cache),
        )?;
        Ok(FileEntry {
            oid,
            path: Some(normalize_path(path)),
            stat: inode_to_stat(oid, &inode),
        })
    }

    pub fn file_entry_by_identifier(&self, oid: u64) -> Result<FileEntry> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        let inode = catalog::lookup_inode(
            &mut *reader,
            self.state.catalog_root,
            self.state.vol_omap_root,
            block_size,
            oid,
            self.state.xid_max,
            Some(&mut cache),
        )?;
        Ok(FileEntry { oid, path: None, stat: inode_to_stat(oid, &inode) })
    }

    /// Read up to `buf.len()` bytes of `entry`'s content starting at
    /// `offset`, transparently decompressing and decrypting as needed.
    /// Returns the number of bytes copied (0 at or past end of file).
    pub fn file_entry_read_at(&self, entry: &FileEntry, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();

        let xattrs = catalog::list_xattrs(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        if xattrs.iter().any(|(name, _)| name == xattr::NAME_DECMPFS) {
            let data = self.read_compressed(&mut reader, &xattrs, &mut cache)?;
            return Ok(copy_slice(&data, offset, buf));
        }

        let extents = catalog::lookup_extents(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        let mut fork = self.build_fork_reader(&mut reader, extents, entry.stat.size)?;
        fork.seek(SeekFrom::Start(offset))?;
        Ok(fork.read(buf)?)
    }

    /// Read an entire file's content (spec §4.9/§4.6: decompresses and
    /// decrypts as needed). Convenience wrapper for callers that just want
    /// the bytes.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_file_to(path, &mut out)?;
        Ok(out)
    }

    pub fn read_file_to<W: Write>(&self, path: &str, writer: &mut W) -> Result<u64> {
        let entry = self.file_entry_by_path(path)?;
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();

        let xattrs = catalog::list_xattrs(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        if xattrs.iter().any(|(name, _)| name == xattr::NAME_DECMPFS) {
            let data = self.read_compressed(&mut reader, &xattrs, &mut cache)?;
            writer.write_all(&data)?;
            return Ok(data.len() as u64);
        }

        let extents = catalog::lookup_extents(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        let mut fork = self.build_fork_reader(&mut reader, extents, entry.stat.size)?;
        Ok(std::io::copy(&mut fork, writer)?)
    }

    fn fetch_extents(&self, oid: u64) -> Result<Vec<FileExtentVal>> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        catalog::lookup_extents(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, oid, Some(&mut cache))
    }

    pub fn file_entry_extent_count(&self, entry: &FileEntry) -> Result<usize> {
        Ok(self.fetch_extents(entry.oid)?.len())
    }

    pub fn file_entry_extent_by_index(&self, entry: &FileEntry, index: usize) -> Result<FileExtentInfo> {
        let extents = self.fetch_extents(entry.oid)?;
        let mut logical_offset = 0u64;
        for (i, extent) in extents.iter().enumerate() {
            let length = extent.length();
            if i == index {
                return Ok(FileExtentInfo { logical_offset, length, sparse: extent.is_sparse() });
            }
            logical_offset += length;
        }
        Err(ApfsError::OutOfBounds(format!("extent index {} out of range", index)))
    }

    pub fn file_entry_symlink_target(&self, entry: &FileEntry) -> Result<String> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        let xattrs = catalog::list_xattrs(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        let (_, raw) = xattrs
            .iter()
            .find(|(name, _)| name == xattr::NAME_SYMLINK)
            .ok_or_else(|| ApfsError::NotFound("symlink target attribute".into()))?;
        let xval = XattrVal::parse(raw)?;
        let bytes = self.resolve_xattr_bytes(&mut reader, &xval, &mut cache)?;
        let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..nul]).to_string())
    }

    fn fetch_xattrs(&self, oid: u64) -> Result<Vec<(String, Vec<u8>)>> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        catalog::list_xattrs(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, oid, Some(&mut cache))
    }

    pub fn file_entry_extended_attribute_count(&self, entry: &FileEntry) -> Result<usize> {
        Ok(self.fetch_xattrs(entry.oid)?.len())
    }

    pub fn file_entry_extended_attribute_by_index(&self, entry: &FileEntry, index: usize) -> Result<ExtendedAttribute> {
        let xattrs = self.fetch_xattrs(entry.oid)?;
        let (name, raw) = xattrs
            .get(index)
            .ok_or_else(|| ApfsError::OutOfBounds(format!("extended attribute index {}", index)))?;
        let xval = XattrVal::parse(raw)?;
        Ok(ExtendedAttribute { name: name.clone(), size: xattr_size(&xval) })
    }

    pub fn file_entry_extended_attribute_by_name(&self, entry: &FileEntry, name: &str) -> Result<ExtendedAttribute> {
        let xattrs = self.fetch_xattrs(entry.oid)?;
        let (found_name, raw) = xattrs
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| ApfsError::NotFound(name.to_string()))?;
        let xval = XattrVal::parse(raw)?;
        Ok(ExtendedAttribute { name: found_name.clone(), size: xattr_size(&xval) })
    }

    pub fn extended_attribute_read_at(
        &self,
        entry: &FileEntry,
        attr: &ExtendedAttribute,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        let xattrs = catalog::list_xattrs(&mut *reader, self.state.catalog_root, self.state.vol_omap_root, block_size, entry.oid, Some(&mut cache))?;
        let (_, raw) = xattrs
            .iter()
            .find(|(name, _)| name == &attr.name)
            .ok_or_else(|| ApfsError::NotFound(attr.name.clone()))?;
        let xval = XattrVal::parse(raw)?;
        let data = self.resolve_xattr_bytes(&mut reader, &xval, &mut cache)?;
        Ok(copy_slice(&data, offset, buf))
    }

    fn fetch_snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        let block_size = self.container.nxsb.block_size;
        let mut reader = self.container.reader.lock().unwrap();
        let mut cache = self.state.btree_cache.lock().unwrap();
        let snap_meta_root = catalog::resolve_virtual_block(
            &mut *reader,
            self.state.vol_omap_root,
            block_size,
            self.state.sblock.snap_meta_tree_oid,
            self.state.xid_max,
            Some(&mut cache),
        )?;
        snapshot::enumerate_snapshots(&mut *reader, snap_meta_root, block_size, Some(&mut cache))
    }

    pub fn volume_snapshot_count(&self) -> Result<usize> {
        Ok(self.fetch_snapshots()?.len())
    }

    pub fn snapshot_by_index(&self, index: usize) -> Result<Snapshot> {
        let snapshots = self.fetch_snapshots()?;
        let s = snapshots
            .get(index)
            .ok_or_else(|| ApfsError::OutOfBounds(format!("snapshot index {}", index)))?;
        Ok(Snapshot { name: s.name.clone(), xid: s.xid, create_time: s.create_time, change_time: s.change_time })
    }

    /// Open this volume pinned to a snapshot's transaction id (spec §4.11):
    /// every subsequent object-map lookup on the returned handle resolves
    /// against `xid` instead of the live transaction.
    pub fn open_snapshot(&self, xid: u64) -> Result<Volume<'a, R>> {
        let state = self.container.open_volume_state(self.state.index, Some(xid))?;
        Ok(Volume { container: self.container, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_adds_leading_slash() {
        assert_eq!(normalize_path("foo/bar"), "/foo/bar");
        assert_eq!(normalize_path("/foo/bar/"), "/foo/bar");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn copy_slice_clips_to_available_length() {
        let data = b"hello world".to_vec();
        let mut buf = [0u8; 5];
        let n = copy_slice(&data, 6, &mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        let mut buf2 = [0u8; 5];
        assert_eq!(copy_slice(&data, 100, &mut buf2), 0);
    }

    #[test]
    fn entry_kind_maps_inode_mode_bits() {
        assert_eq!(entry_kind_from_mode(catalog::INODE_DIR_TYPE), EntryKind::Directory);
        assert_eq!(entry_kind_from_mode(catalog::INODE_SYMLINK_TYPE), EntryKind::Symlink);
        assert_eq!(entry_kind_from_mode(catalog::INODE_FILE_TYPE), EntryKind::File);
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_volume_open() {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let reader = std::io::BufReader::new(file);
        let container = Container::open(reader).unwrap();
        assert!(container.volume_count() > 0);

        let volume = container.volume_by_index(0).unwrap();
        let info = volume.info();
        assert!(info.block_size > 0);
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_read_file_data() {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let reader = std::io::BufReader::new(file);
        let container = Container::open(reader).unwrap();
        let volume = container.volume_by_index(0).unwrap();

        let walk = volume.walk().unwrap();
        let entry = walk
            .iter()
            .find(|e| e.entry.kind == EntryKind::File && e.entry.size > 0)
            .expect("should find at least one non-empty file");

        let data = volume.read_file(&entry.path).unwrap();
        assert_eq!(data.len() as u64, entry.entry.size);
    }
}
