//! Storage layer configuration constants and runtime knobs.

/// Sector size of every block device the storage layer talks to.
pub const SECTOR_SIZE: usize = 512;
/// Maximum number of entries in the VFS mount table.
pub const MAX_MOUNTS: usize = 16;
/// Maximum number of simultaneously mounted FAT32 drive letters.
pub const MAX_FAT_VOLUMES: usize = 8;
/// Drive letter used by `Fat32::init_from_memory`.
pub const DEFAULT_FAT_LETTER: u8 = b'C';
/// First sector of the persisted HanaFS image.
pub const HANAFS_PERSIST_LBA: u64 = 2048;
/// On-disk HanaFS format version.
pub const HANAFS_VERSION: u32 = 1;
/// Deepest path walked by the directory resolvers.
pub const MAX_PATH_DEPTH: usize = 64;
/// Backends tried, in order, when no mount entry matches a path.
pub const DEFAULT_FALLBACK_ORDER: &[&str] = &["hanafs", "procfs", "devfs", "fat32"];

/// HanaFS runtime settings.
#[derive(Clone, Copy, Debug)]
pub struct HanaFsConfig {
    /// Sector where the serialized table starts.
    pub persist_lba: u64,
    /// Persist after every successful mutation.
    pub auto_persist: bool,
    /// Directories created when `init` starts from an empty table.
    pub skeleton: &'static [&'static str],
}

impl Default for HanaFsConfig {
    fn default() -> Self {
        Self {
            persist_lba: HANAFS_PERSIST_LBA,
            auto_persist: false,
            skeleton: &[],
        }
    }
}

/// VFS router settings.
#[derive(Clone, Copy, Debug)]
pub struct VfsConfig {
    pub fallback_order: &'static [&'static str],
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            fallback_order: DEFAULT_FALLBACK_ORDER,
        }
    }
}
