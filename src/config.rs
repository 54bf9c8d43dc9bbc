//! Open-time configuration.
//!
//! The library is embedded rather than run as a standalone program, so
//! there is no config *file* — the ambient equivalent is a small options
//! struct threaded through `Container::open`, the way
//! `Dil4rd-dpp/udif`'s `DmgReaderOptions` carries open-time toggles.

/// Hard cap on B-tree descent depth (spec §4.3, §8 property 3).
pub const DEFAULT_MAX_DESCENT_DEPTH: u32 = 16;

/// Default LRU capacity for B-tree node and data-block caches (spec §4.3/§4.8).
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Default APFS sector size used for AES-XTS tweak unit derivation.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Options controlling cache sizing and descent behavior at open time.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub node_cache_capacity: usize,
    pub data_block_cache_capacity: usize,
    pub max_descent_depth: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            node_cache_capacity: DEFAULT_CACHE_CAPACITY,
            data_block_cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_descent_depth: DEFAULT_MAX_DESCENT_DEPTH,
        }
    }
}

/// Options passed to `Container::open`.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub cache: CacheConfig,
    /// Pin the container/volume object-map queries to a specific
    /// transaction id instead of the latest one found at open time.
    /// Used internally when opening a snapshot (spec §4.11).
    pub xid_max: Option<u64>,
    pub sector_size: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            cache: CacheConfig::default(),
            xid_max: None,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_xid_max(mut self, xid_max: u64) -> Self {
        self.xid_max = Some(xid_max);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}
