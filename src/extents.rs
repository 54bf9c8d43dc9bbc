use std::io::{Read, Seek, SeekFrom, Write};

use crate::cache::LruCache;
use crate::catalog::FileExtentVal;
use crate::crypto::AesXtsContext;
use crate::error::Result;

/// Read file data from extents, streaming to a writer. Returns the number
/// of bytes written. A thin convenience wrapper over [`ApfsForkReader`].
pub fn read_file_data<R: Read + Seek, W: Write>(
    reader: &mut R,
    block_size: u32,
    extents: &[FileExtentVal],
    logical_size: u64,
    writer: &mut W,
) -> Result<u64> {
    let mut fork = ApfsForkReader::new(reader, block_size, extents.to_vec(), logical_size);
    let written = std::io::copy(&mut fork, writer)?;
    Ok(written)
}

/// One extent's position in the logical file, its physical backing (or
/// sparse), and the crypto identifier used to derive its tweak (spec §4.8,
/// §4.10).
#[derive(Debug, Clone, Copy)]
struct ExtentSpan {
    logical_start: u64,
    phys_start: u64,
    length: u64,
    sparse: bool,
    crypto_id: u64,
}

/// A reader that presents a file's extents as a contiguous Read + Seek
/// stream, zero-filling sparse regions and decrypting through a data-block
/// LRU cache when the volume is encrypted.
pub struct ApfsForkReader<'a, R: Read + Seek> {
    reader: &'a mut R,
    logical_size: u64,
    block_size: u64,
    extent_map: Vec<ExtentSpan>,
    position: u64,
    block_cache: LruCache<Vec<u8>>,
    encryption: Option<(AesXtsContext, u64)>, // (context, sector_size)
}

impl<'a, R: Read + Seek> ApfsForkReader<'a, R> {
    pub fn new(
        reader: &'a mut R,
        block_size: u32,
        extents: Vec<FileExtentVal>,
        logical_size: u64,
    ) -> Self {
        Self::with_cache_capacity(reader, block_size, extents, logical_size, crate::config::DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        reader: &'a mut R,
        block_size: u32,
        extents: Vec<FileExtentVal>,
        logical_size: u64,
        cache_capacity: usize,
    ) -> Self {
        let block_size_u64 = block_size as u64;
        let mut extent_map = Vec::new();
        let mut logical_offset = 0u64;

        for extent in &extents {
            let length = extent.length();
            if length == 0 {
                continue;
            }
            let sparse = extent.is_sparse();
            let physical_start = extent.phys_block_num * block_size_u64;
            extent_map.push(ExtentSpan {
                logical_start: logical_offset,
                phys_start: physical_start,
                length,
                sparse,
                crypto_id: extent.crypto_id,
            });
            logical_offset += length;
        }

        ApfsForkReader {
            reader,
            logical_size,
            block_size: block_size_u64,
            extent_map,
            position: 0,
            block_cache: LruCache::new(cache_capacity),
            encryption: None,
        }
    }

    /// Attach an encryption context so physical blocks are decrypted after
    /// being read (spec §4.8: tweak unit derived per-extent from `crypto_id`
    /// plus the sector offset within the extent).
    pub fn with_encryption(mut self, context: AesXtsContext, sector_size: u64) -> Self {
        self.encryption = Some((context, sector_size));
        self
    }

    fn find_span(&self, logical_offset: u64) -> Option<ExtentSpan> {
        self.extent_map
            .iter()
            .find(|s| logical_offset >= s.logical_start && logical_offset < s.logical_start + s.length)
            .copied()
    }

    /// Read and, if configured, decrypt the physical block containing
    /// `phys_offset`, returning it from cache on repeat access.
    fn read_physical_block(&mut self, phys_offset: u64, crypto_id: u64, offset_within_extent: u64) -> std::io::Result<Vec<u8>> {
        let block_number = phys_offset / self.block_size;
        if let Some(cached) = self.block_cache.get(block_number) {
            return Ok(cached);
        }

        self.reader.seek(SeekFrom::Start(block_number * self.block_size))?;
        let mut block = vec![0u8; self.block_size as usize];
        self.reader.read_exact(&mut block)?;

        if let Some((context, sector_size)) = &self.encryption {
            let tweak_unit = crate::crypto::extent_tweak_unit(crypto_id, offset_within_extent, *sector_size);
            context.decrypt(&mut block, tweak_unit, *sector_size as usize);
        }

        self.block_cache.put(block_number, block.clone());
        Ok(block)
    }
}

impl<R: Read + Seek> Read for ApfsForkReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.logical_size {
            return Ok(0);
        }

        let remaining = (self.logical_size - self.position) as usize;
        let to_read = buf.len().min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let mut total_read = 0;
        while total_read < to_read {
            let logical_pos = self.position + total_read as u64;

            let span = match self.find_span(logical_pos) {
                Some(s) => s,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "logical offset beyond extent map",
                    ))
                }
            };

            let offset_in_extent = logical_pos - span.logical_start;
            let extent_remaining = span.length - offset_in_extent;
            let want = ((to_read - total_read) as u64).min(extent_remaining) as usize;

            if span.sparse {
                for b in &mut buf[total_read..total_read + want] {
                    *b = 0;
                }
                total_read += want;
                continue;
            }

            let phys_offset = span.phys_start + offset_in_extent;
            let block_number = phys_offset / self.block_size;
            let block_start = block_number * self.block_size;
            let block = self.read_physical_block(phys_offset, span.crypto_id, offset_in_extent)?;

            let within_block = (phys_offset - block_start) as usize;
            let available_in_block = block.len() - within_block;
            let chunk = want.min(available_in_block);

            buf[total_read..total_read + chunk].copy_from_slice(&block[within_block..within_block + chunk]);
            total_read += chunk;
        }

        self.position += total_read as u64;
        Ok(total_read)
    }
}

impl<R: Read + Seek> Seek for ApfsForkReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.logical_size as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn extent(phys_block: u64, length: u64) -> FileExtentVal {
        FileExtentVal {
            flags_and_length: length,
            phys_block_num: phys_block,
            crypto_id: 0,
        }
    }

    #[test]
    fn sparse_extent_zero_fills() {
        let backing = vec![0xAAu8; 4096 * 2];
        let mut cursor = Cursor::new(backing);
        let extents = vec![extent(0, 4096)];
        let mut fork = ApfsForkReader::new(&mut cursor, 4096, extents, 4096);

        let mut buf = vec![0u8; 4096];
        fork.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "sparse extent should read as zeros");
    }

    #[test]
    fn non_sparse_extent_reads_backing_bytes() {
        let mut backing = vec![0u8; 4096 * 3];
        backing[4096..4096 + 5].copy_from_slice(b"hello");
        let mut cursor = Cursor::new(backing);
        let extents = vec![extent(1, 4096)];
        let mut fork = ApfsForkReader::new(&mut cursor, 4096, extents, 4096);

        let mut buf = vec![0u8; 5];
        fork.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_read_file() {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let reader = std::io::BufReader::new(file);
        let container = crate::Container::open(reader).unwrap();
        let volume = container.volume_by_index(0).unwrap();

        let walk = volume.walk().unwrap();
        let small_file = walk.iter()
            .find(|e| e.entry.kind == crate::EntryKind::File && e.entry.size > 0 && e.entry.size < 100_000);

        let entry = small_file.expect("Should find a small file in the test image");
        let data = volume.read_file(&entry.path).unwrap();
        assert!(!data.is_empty(), "File data should not be empty");
        assert_eq!(data.len() as u64, entry.entry.size);
    }
}
