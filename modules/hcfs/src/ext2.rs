//! Read-only ext2 lookup over a boot image.
//!
//! Only the twelve direct block pointers of an inode are followed.

use alloc::vec;
use alloc::vec::Vec;
use hvfs::{components, FileSystem, FsError, FsResult, Metadata, MAX_NAME_LEN};
use log::info;

use crate::block::BlockCache;
use crate::config::MAX_PATH_DEPTH;
use crate::image::{BootModules, ImageSource};

const EXT2_ROOT_INODE: u32 = 2;
const EXT2_MAGIC: u16 = 0xef53;
const EXT2_DIRECT_BLOCKS: usize = 12;
const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const SUPERBLOCK_INODES_COUNT_OFFSET: usize = 0;
const SUPERBLOCK_FIRST_DATA_BLOCK_OFFSET: usize = 20;
const SUPERBLOCK_LOG_BLOCK_SIZE_OFFSET: usize = 24;
const SUPERBLOCK_INODES_PER_GROUP_OFFSET: usize = 40;
const SUPERBLOCK_MAGIC_OFFSET: usize = 56;
const SUPERBLOCK_REV_LEVEL_OFFSET: usize = 76;
const SUPERBLOCK_INODE_SIZE_OFFSET: usize = 88;
const GROUP_DESC_SIZE: u64 = 32;
const GROUP_DESC_INODE_TABLE_OFFSET: u64 = 8;
const INODE_MODE_OFFSET: usize = 0;
const INODE_SIZE_OFFSET: usize = 4;
const INODE_BLOCK_OFFSET: usize = 40;
const INODE_TYPE_MASK: u16 = 0xf000;
const INODE_TYPE_DIR: u16 = 0x4000;
const DIRENT_HEADER_SIZE: usize = 8;

#[derive(Clone, Copy, Debug)]
pub struct SuperBlock {
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
}

impl SuperBlock {
    pub fn parse(buf: &[u8]) -> FsResult<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(FsError::CorruptImage);
        }
        if read_u16(buf, SUPERBLOCK_MAGIC_OFFSET) != EXT2_MAGIC {
            return Err(FsError::CorruptImage);
        }
        let log_block_size = read_u32(buf, SUPERBLOCK_LOG_BLOCK_SIZE_OFFSET);
        let inodes_per_group = read_u32(buf, SUPERBLOCK_INODES_PER_GROUP_OFFSET);
        let inode_size = match read_u32(buf, SUPERBLOCK_REV_LEVEL_OFFSET) {
            0 => EXT2_GOOD_OLD_INODE_SIZE,
            _ => match read_u16(buf, SUPERBLOCK_INODE_SIZE_OFFSET) {
                0 => EXT2_GOOD_OLD_INODE_SIZE,
                size => size,
            },
        };
        if log_block_size > 6 || inodes_per_group == 0 || inode_size < EXT2_GOOD_OLD_INODE_SIZE {
            return Err(FsError::CorruptImage);
        }
        Ok(Self {
            inodes_count: read_u32(buf, SUPERBLOCK_INODES_COUNT_OFFSET),
            first_data_block: read_u32(buf, SUPERBLOCK_FIRST_DATA_BLOCK_OFFSET),
            log_block_size,
            inodes_per_group,
            inode_size,
        })
    }

    pub fn block_size(&self) -> u32 {
        1024u32 << self.log_block_size
    }
}

#[derive(Clone, Copy, Debug)]
struct Inode {
    mode: u16,
    size: u32,
    blocks: [u32; EXT2_DIRECT_BLOCKS],
}

impl Inode {
    fn is_dir(&self) -> bool {
        self.mode & INODE_TYPE_MASK == INODE_TYPE_DIR
    }
}

pub struct Ext2Fs<'a> {
    source: ImageSource<'a>,
    superblock: SuperBlock,
}

impl<'a> Ext2Fs<'a> {
    pub fn new(source: impl Into<ImageSource<'a>>) -> FsResult<Self> {
        let source = source.into();
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        BlockCache::new(&source)
            .read_bytes(SUPERBLOCK_OFFSET, &mut buf)
            .map_err(|_| FsError::CorruptImage)?;
        let superblock = SuperBlock::parse(&buf)?;
        Ok(Self { source, superblock })
    }

    /// Opens the boot module whose name matches `name`.
    pub fn init_from_module(modules: &BootModules<'a>, name: &str) -> FsResult<Self> {
        let bytes = modules.find(name)?;
        let fs = Self::new(bytes)?;
        info!("ext2: {} mounted, block size {}", name, fs.fs_block_size());
        Ok(fs)
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn fs_block_size(&self) -> u32 {
        self.superblock.block_size()
    }

    fn cache(&self) -> BlockCache<'_> {
        BlockCache::new(&self.source)
    }

    fn read_at(&self, cache: &BlockCache, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        cache.read_bytes(offset, buf).map_err(|err| match err {
            FsError::OutOfRange => FsError::CorruptImage,
            other => other,
        })
    }

    fn read_inode(&self, cache: &BlockCache, ino: u32) -> FsResult<Inode> {
        if ino == 0 || ino > self.superblock.inodes_count {
            return Err(FsError::CorruptImage);
        }
        let block_size = self.fs_block_size() as u64;
        let group = ((ino - 1) / self.superblock.inodes_per_group) as u64;
        let index = ((ino - 1) % self.superblock.inodes_per_group) as u64;
        let gdt = (self.superblock.first_data_block as u64 + 1) * block_size;
        let mut table = [0u8; 4];
        self.read_at(
            cache,
            gdt + group * GROUP_DESC_SIZE + GROUP_DESC_INODE_TABLE_OFFSET,
            &mut table,
        )?;
        let table = u32::from_le_bytes(table) as u64;
        let offset = table * block_size + index * self.superblock.inode_size as u64;
        let mut raw = [0u8; EXT2_GOOD_OLD_INODE_SIZE as usize];
        self.read_at(cache, offset, &mut raw)?;
        let mut blocks = [0u32; EXT2_DIRECT_BLOCKS];
        for (idx, block) in blocks.iter_mut().enumerate() {
            *block = read_u32(&raw, INODE_BLOCK_OFFSET + idx * 4);
        }
        Ok(Inode {
            mode: read_u16(&raw, INODE_MODE_OFFSET),
            size: read_u32(&raw, INODE_SIZE_OFFSET),
            blocks,
        })
    }

    /// Reads one filesystem block; block 0 is a hole and reads as zeros.
    fn read_block(&self, cache: &BlockCache, block: u32, buf: &mut [u8]) -> FsResult<()> {
        if block == 0 {
            buf.fill(0);
            return Ok(());
        }
        self.read_at(cache, block as u64 * self.fs_block_size() as u64, buf)
    }

    /// Calls `visit(inode, name)` for every live entry until it returns `true`.
    fn scan_dir(
        &self,
        cache: &BlockCache,
        dir: &Inode,
        mut visit: impl FnMut(u32, &[u8]) -> bool,
    ) -> FsResult<()> {
        let block_size = self.fs_block_size() as usize;
        let mut buf = vec![0u8; block_size];
        let used = (dir.size as usize).div_ceil(block_size).min(EXT2_DIRECT_BLOCKS);
        for block in dir.blocks.iter().take(used) {
            if *block == 0 {
                continue;
            }
            self.read_block(cache, *block, &mut buf)?;
            let mut offset = 0usize;
            while offset + DIRENT_HEADER_SIZE <= block_size {
                let ino = read_u32(&buf, offset);
                let rec_len = read_u16(&buf, offset + 4) as usize;
                let name_len = buf[offset + 6] as usize;
                if rec_len == 0 {
                    break;
                }
                let name_end = offset + DIRENT_HEADER_SIZE + name_len;
                if name_end > block_size || name_len > MAX_NAME_LEN {
                    return Err(FsError::CorruptImage);
                }
                if ino != 0 && visit(ino, &buf[offset + DIRENT_HEADER_SIZE..name_end]) {
                    return Ok(());
                }
                offset += rec_len;
            }
        }
        Ok(())
    }

    fn lookup_in_dir(&self, cache: &BlockCache, dir: &Inode, name: &str) -> FsResult<Option<u32>> {
        let mut found = None;
        self.scan_dir(cache, dir, |ino, entry| {
            if entry == name.as_bytes() {
                found = Some(ino);
                return true;
            }
            false
        })?;
        Ok(found)
    }

    fn resolve(&self, cache: &BlockCache, path: &str) -> FsResult<Inode> {
        let mut inode = self.read_inode(cache, EXT2_ROOT_INODE)?;
        for (depth, part) in components(path).enumerate() {
            if depth >= MAX_PATH_DEPTH {
                return Err(FsError::InvalidPath);
            }
            if !inode.is_dir() {
                return Err(FsError::NotADirectory);
            }
            let ino = self
                .lookup_in_dir(cache, &inode, part)?
                .ok_or(FsError::NotFound)?;
            inode = self.read_inode(cache, ino)?;
        }
        Ok(inode)
    }

    pub fn get_file_alloc(&self, path: &str) -> FsResult<Vec<u8>> {
        let cache = self.cache();
        let inode = self.resolve(&cache, path)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let block_size = self.fs_block_size() as usize;
        let size = inode.size as usize;
        if size > EXT2_DIRECT_BLOCKS * block_size {
            return Err(FsError::Unsupported);
        }
        let mut data = vec![0u8; size];
        for (chunk, block) in data.chunks_mut(block_size).zip(inode.blocks.iter()) {
            self.read_block(&cache, *block, chunk)?;
        }
        Ok(data)
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        let cache = self.cache();
        let inode = self.resolve(&cache, path)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut count = 0usize;
        self.scan_dir(&cache, &inode, |_, name| {
            if name == b"." || name == b".." {
                return false;
            }
            if let Ok(name) = core::str::from_utf8(name) {
                visit(name);
                count += 1;
            }
            false
        })?;
        Ok(count)
    }
}

impl FileSystem for Ext2Fs<'_> {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        Ext2Fs::list_dir(self, path, visit)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.get_file_alloc(path)
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        let inode = self.resolve(&self.cache(), path)?;
        if inode.is_dir() {
            Ok(Metadata::dir())
        } else {
            Ok(Metadata::file(inode.size as u64))
        }
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
