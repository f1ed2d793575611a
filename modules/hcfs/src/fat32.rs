//! FAT32 volumes addressed by drive letter.
//!
//! Paths may start with `"<LETTER>:/"` to pick a volume; otherwise the
//! default volume (the first one mounted) is used. Lookup matches 8.3 short
//! names case-insensitively; long-name entries are skipped.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use hvfs::{components, split_parent, FileSystem, FsError, FsResult, Metadata};
use log::{debug, info, warn};
use spin::Mutex;

use crate::block::BlockCache;
use crate::config::{DEFAULT_FAT_LETTER, MAX_FAT_VOLUMES, MAX_PATH_DEPTH, SECTOR_SIZE};
use crate::image::{BootModules, ImageSource};

const BPB_SIZE: usize = 512;
const BPB_SIGNATURE_OFFSET: usize = 510;
const BPB_SIGNATURE: u16 = 0xaa55;
const BPB_BYTES_PER_SECTOR_OFFSET: usize = 11;
const BPB_SECTORS_PER_CLUSTER_OFFSET: usize = 13;
const BPB_RESERVED_SECTORS_OFFSET: usize = 14;
const BPB_NUM_FATS_OFFSET: usize = 16;
const BPB_ROOT_ENTRIES_OFFSET: usize = 17;
const BPB_TOTAL_SECTORS_16_OFFSET: usize = 19;
const BPB_FAT_SIZE_16_OFFSET: usize = 22;
const BPB_TOTAL_SECTORS_32_OFFSET: usize = 32;
const BPB_FAT_SIZE_32_OFFSET: usize = 36;
const BPB_ROOT_CLUSTER_OFFSET: usize = 44;
const DIR_ENTRY_SIZE: usize = 32;
const FAT_ENTRY_SIZE: usize = 4;
const FAT32_ENTRY_MASK: u32 = 0x0fff_ffff;
const FAT32_BAD_CLUSTER: u32 = 0x0fff_fff7;
const FAT32_EOC_MIN: u32 = 0x0fff_fff8;
const FAT32_EOC: u32 = 0x0fff_ffff;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ENTRY_FREE: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xe5;

#[derive(Clone, Copy, Debug)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub total_sectors: u32,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
}

impl Bpb {
    pub fn parse(buf: &[u8]) -> FsResult<Self> {
        if buf.len() < BPB_SIZE {
            return Err(FsError::InvalidImage);
        }
        if read_u16(buf, BPB_SIGNATURE_OFFSET) != BPB_SIGNATURE {
            return Err(FsError::InvalidImage);
        }
        let bytes_per_sector = read_u16(buf, BPB_BYTES_PER_SECTOR_OFFSET);
        let sectors_per_cluster = buf[BPB_SECTORS_PER_CLUSTER_OFFSET];
        let reserved_sectors = read_u16(buf, BPB_RESERVED_SECTORS_OFFSET);
        let num_fats = buf[BPB_NUM_FATS_OFFSET];
        let root_entries = read_u16(buf, BPB_ROOT_ENTRIES_OFFSET);
        let total_sectors_16 = read_u16(buf, BPB_TOTAL_SECTORS_16_OFFSET);
        let fat_size_16 = read_u16(buf, BPB_FAT_SIZE_16_OFFSET);
        let total_sectors_32 = read_u32(buf, BPB_TOTAL_SECTORS_32_OFFSET);
        let fat_size_32 = read_u32(buf, BPB_FAT_SIZE_32_OFFSET);
        let root_cluster = read_u32(buf, BPB_ROOT_CLUSTER_OFFSET);
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            total_sectors_32
        };
        let sectors_per_fat = if fat_size_16 != 0 {
            fat_size_16 as u32
        } else {
            fat_size_32
        };
        if bytes_per_sector == 0
            || bytes_per_sector as usize % DIR_ENTRY_SIZE != 0
            || sectors_per_cluster == 0
            || reserved_sectors == 0
            || num_fats == 0
            || total_sectors == 0
            || sectors_per_fat == 0
            || root_entries != 0
            || root_cluster < 2
        {
            return Err(FsError::InvalidImage);
        }
        let bpb = Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            total_sectors,
            sectors_per_fat,
            root_cluster,
        };
        if bpb.data_start_sector() as u64 >= total_sectors as u64 || root_cluster > bpb.max_cluster() {
            return Err(FsError::InvalidImage);
        }
        Ok(bpb)
    }

    pub fn fat_start_sector(&self) -> u64 {
        self.reserved_sectors as u64
    }

    pub fn data_start_sector(&self) -> u64 {
        self.fat_start_sector() + self.sectors_per_fat as u64 * self.num_fats as u64
    }

    pub fn cluster_size(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    /// Number of data clusters on the volume.
    pub fn cluster_count(&self) -> u32 {
        let data_sectors = (self.total_sectors as u64).saturating_sub(self.data_start_sector());
        (data_sectors / self.sectors_per_cluster as u64) as u32
    }

    /// Highest valid cluster index.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count().saturating_add(1)
    }

    fn sector_offset(&self, sector: u64) -> u64 {
        sector * self.bytes_per_sector as u64
    }

    fn fat_entry_offset(&self, fat_index: u8, cluster: u32) -> u64 {
        let fat_start = self.fat_start_sector() + fat_index as u64 * self.sectors_per_fat as u64;
        self.sector_offset(fat_start) + cluster as u64 * FAT_ENTRY_SIZE as u64
    }
}

/// A live short directory entry together with where it sits on disk.
#[derive(Clone, Copy, Debug)]
struct RawEntry {
    name: [u8; 11],
    attr: u8,
    cluster: u32,
    size: u32,
    slot: u64,
}

impl RawEntry {
    fn parse(entry: &[u8], slot: u64) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&entry[..11]);
        let cluster_high = read_u16(entry, 20) as u32;
        let cluster_low = read_u16(entry, 26) as u32;
        Self {
            name,
            attr: entry[11],
            cluster: (cluster_high << 16) | cluster_low,
            size: read_u32(entry, 28),
            slot,
        }
    }

    fn is_dir(&self) -> bool {
        (self.attr & ATTR_DIRECTORY) != 0
    }

    fn is_dot(&self) -> bool {
        self.name[0] == b'.' && (self.name[1] == b' ' || self.name[1] == b'.')
    }

    fn display_name(&self) -> String {
        short_name(&self.name)
    }
}

/// Resolved path target.
#[derive(Clone, Copy, Debug)]
enum Node {
    Root,
    Entry(RawEntry),
}

/// One mounted FAT32 image.
pub struct Fat32Volume<'a> {
    letter: u8,
    source: ImageSource<'a>,
    bpb: Bpb,
}

impl<'a> Fat32Volume<'a> {
    pub fn open(source: ImageSource<'a>, letter: u8) -> FsResult<Self> {
        let mut sector = [0u8; BPB_SIZE];
        BlockCache::new(&source)
            .read_bytes(0, &mut sector)
            .map_err(|_| FsError::InvalidImage)?;
        let bpb = Bpb::parse(&sector)?;
        Ok(Self { letter, source, bpb })
    }

    pub fn letter(&self) -> char {
        self.letter as char
    }

    pub fn bpb(&self) -> &Bpb {
        &self.bpb
    }

    fn cache(&self) -> BlockCache<'_> {
        BlockCache::new(&self.source)
    }

    fn describe(&self) -> String {
        match &self.source {
            ImageSource::Memory(image) => format!(
                "FAT32 mount: [{}: memory image, {} bytes]",
                self.letter(),
                image.bytes().len()
            ),
            ImageSource::Device(_) => format!("FAT32 mount: [{}: block device]", self.letter()),
        }
    }

    fn cluster_offset(&self, cluster: u32) -> FsResult<u64> {
        if cluster < 2 || cluster > self.bpb.max_cluster() {
            return Err(FsError::CorruptImage);
        }
        let sector =
            self.bpb.data_start_sector() + (cluster - 2) as u64 * self.bpb.sectors_per_cluster as u64;
        Ok(self.bpb.sector_offset(sector))
    }

    fn dir_cluster(&self, entry_cluster: u32) -> u32 {
        // ".." entries of first-level directories point at cluster 0.
        if entry_cluster == 0 {
            self.bpb.root_cluster
        } else {
            entry_cluster
        }
    }

    fn read_fat_entry(&self, cache: &BlockCache, cluster: u32) -> FsResult<u32> {
        let mut raw = [0u8; FAT_ENTRY_SIZE];
        cache.read_bytes(self.bpb.fat_entry_offset(0, cluster), &mut raw)?;
        Ok(u32::from_le_bytes(raw) & FAT32_ENTRY_MASK)
    }

    // Every FAT copy is kept in sync.
    fn write_fat_entry(&self, cache: &BlockCache, cluster: u32, value: u32) -> FsResult<()> {
        let value = (value & FAT32_ENTRY_MASK).to_le_bytes();
        for fat_index in 0..self.bpb.num_fats {
            cache.write_bytes(self.bpb.fat_entry_offset(fat_index, cluster), &value)?;
        }
        Ok(())
    }

    fn next_cluster(&self, cache: &BlockCache, cluster: u32) -> FsResult<Option<u32>> {
        let entry = self.read_fat_entry(cache, cluster)?;
        if entry < 2 || entry == FAT32_BAD_CLUSTER || entry >= FAT32_EOC_MIN {
            return Ok(None);
        }
        if entry == cluster {
            return Err(FsError::CorruptImage);
        }
        Ok(Some(entry))
    }

    /// Collects a whole chain, refusing chains longer than the volume.
    fn chain(&self, cache: &BlockCache, start: u32) -> FsResult<Vec<u32>> {
        let mut clusters = Vec::new();
        if start < 2 {
            return Ok(clusters);
        }
        let limit = self.bpb.cluster_count() as usize;
        let mut current = start;
        loop {
            if clusters.len() >= limit {
                return Err(FsError::CorruptImage);
            }
            clusters.push(current);
            match self.next_cluster(cache, current)? {
                Some(next) => current = next,
                None => return Ok(clusters),
            }
        }
    }

    fn read_cluster(&self, cache: &BlockCache, cluster: u32, buf: &mut [u8]) -> FsResult<()> {
        let offset = self.cluster_offset(cluster)?;
        cache.read_bytes(offset, buf)
    }

    fn zero_cluster(&self, cache: &BlockCache, cluster: u32) -> FsResult<()> {
        let zeros = vec![0u8; self.bpb.cluster_size()];
        cache.write_bytes(self.cluster_offset(cluster)?, &zeros)
    }

    /// Copies exactly `size` bytes of the chain starting at `start`.
    fn read_chain(&self, cache: &BlockCache, start: u32, size: usize) -> FsResult<Vec<u8>> {
        if size as u64 > cache.capacity()? {
            return Err(FsError::TruncatedChain);
        }
        let cluster_size = self.bpb.cluster_size();
        let mut data = vec![0u8; size];
        let mut cluster = start;
        let mut copied = 0usize;
        while copied < size {
            if cluster < 2 || cluster > self.bpb.max_cluster() {
                return Err(FsError::TruncatedChain);
            }
            let take = core::cmp::min(size - copied, cluster_size);
            self.read_cluster(cache, cluster, &mut data[copied..copied + take])
                .map_err(|err| match err {
                    FsError::OutOfRange => FsError::TruncatedChain,
                    other => other,
                })?;
            copied += take;
            if copied == size {
                break;
            }
            cluster = self
                .next_cluster(cache, cluster)?
                .ok_or(FsError::TruncatedChain)?;
        }
        Ok(data)
    }

    /// Visits every live short entry of a directory. `visit` returns `true`
    /// to stop early.
    fn scan_dir(
        &self,
        cache: &BlockCache,
        cluster: u32,
        mut visit: impl FnMut(&RawEntry) -> FsResult<bool>,
    ) -> FsResult<()> {
        let mut buf = vec![0u8; self.bpb.cluster_size()];
        for current in self.chain(cache, cluster)? {
            let base = self.cluster_offset(current)?;
            self.read_cluster(cache, current, &mut buf)
                .map_err(|_| FsError::CorruptImage)?;
            for (index, entry) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                match entry[0] {
                    ENTRY_FREE => return Ok(()),
                    ENTRY_DELETED => continue,
                    _ => {}
                }
                // Long-name entries carry the volume-id bit as well.
                if (entry[11] & ATTR_VOLUME_ID) != 0 {
                    continue;
                }
                let raw = RawEntry::parse(entry, base + (index * DIR_ENTRY_SIZE) as u64);
                if visit(&raw)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn lookup_in_dir(&self, cache: &BlockCache, cluster: u32, name: &str) -> FsResult<Option<RawEntry>> {
        let mut found = None;
        self.scan_dir(cache, cluster, |entry| {
            if entry.display_name().eq_ignore_ascii_case(name) {
                found = Some(*entry);
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found)
    }

    fn resolve(&self, cache: &BlockCache, path: &str) -> FsResult<Node> {
        let mut node = Node::Root;
        for (depth, part) in components(path).enumerate() {
            if depth >= MAX_PATH_DEPTH {
                return Err(FsError::InvalidPath);
            }
            let dir = match node {
                Node::Root => self.bpb.root_cluster,
                Node::Entry(entry) if entry.is_dir() => self.dir_cluster(entry.cluster),
                Node::Entry(_) => return Err(FsError::NotADirectory),
            };
            let entry = self
                .lookup_in_dir(cache, dir, part)?
                .ok_or(FsError::NotFound)?;
            node = if entry.is_dir() && self.dir_cluster(entry.cluster) == self.bpb.root_cluster {
                Node::Root
            } else {
                Node::Entry(entry)
            };
        }
        Ok(node)
    }

    fn resolve_dir(&self, cache: &BlockCache, path: &str) -> FsResult<u32> {
        match self.resolve(cache, path)? {
            Node::Root => Ok(self.bpb.root_cluster),
            Node::Entry(entry) if entry.is_dir() => Ok(self.dir_cluster(entry.cluster)),
            Node::Entry(_) => Err(FsError::NotADirectory),
        }
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        let cache = self.cache();
        let cluster = self.resolve_dir(&cache, path)?;
        let mut count = 0usize;
        self.scan_dir(&cache, cluster, |entry| {
            visit(entry.display_name().as_str());
            count += 1;
            Ok(false)
        })?;
        Ok(count)
    }

    pub fn read_file_alloc(&self, path: &str) -> FsResult<Vec<u8>> {
        let cache = self.cache();
        match self.resolve(&cache, path)? {
            Node::Root => Err(FsError::IsADirectory),
            Node::Entry(entry) if entry.is_dir() => Err(FsError::IsADirectory),
            Node::Entry(entry) => self.read_chain(&cache, entry.cluster, entry.size as usize),
        }
    }

    pub fn metadata(&self, path: &str) -> FsResult<Metadata> {
        let cache = self.cache();
        match self.resolve(&cache, path)? {
            Node::Root => Ok(Metadata::dir()),
            Node::Entry(entry) if entry.is_dir() => Ok(Metadata::dir()),
            Node::Entry(entry) => Ok(Metadata::file(entry.size as u64)),
        }
    }

    fn writable_cache(&self) -> FsResult<BlockCache<'_>> {
        let cache = self.cache();
        if cache.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        Ok(cache)
    }

    fn find_free_cluster(&self, cache: &BlockCache, from: u32) -> FsResult<Option<u32>> {
        for cluster in from.max(2)..=self.bpb.max_cluster() {
            if self.read_fat_entry(cache, cluster)? == 0 {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Allocates `count` clusters first-fit and links them. Returns cluster 0
    /// for an empty chain.
    fn alloc_chain(&self, cache: &BlockCache, count: usize) -> FsResult<u32> {
        let mut first = 0u32;
        let mut prev = 0u32;
        for _ in 0..count {
            let cluster = match self.find_free_cluster(cache, prev + 1)? {
                Some(cluster) => cluster,
                None => {
                    self.free_chain(cache, first)?;
                    return Err(FsError::NoSpace);
                }
            };
            self.write_fat_entry(cache, cluster, FAT32_EOC)?;
            if prev == 0 {
                first = cluster;
            } else {
                self.write_fat_entry(cache, prev, cluster)?;
            }
            prev = cluster;
        }
        Ok(first)
    }

    /// Allocates `count` clusters and hands them to `fill`. When `fill`
    /// fails the chain goes back to the free pool before the error returns.
    fn with_new_chain(
        &self,
        cache: &BlockCache,
        count: usize,
        fill: impl FnOnce(u32) -> FsResult<()>,
    ) -> FsResult<u32> {
        let first = self.alloc_chain(cache, count)?;
        if let Err(err) = fill(first) {
            if let Err(release) = self.free_chain(cache, first) {
                warn!("fat32: cluster {} not released: {}", first, release);
            }
            return Err(err);
        }
        Ok(first)
    }

    fn free_chain(&self, cache: &BlockCache, start: u32) -> FsResult<()> {
        for cluster in self.chain(cache, start)? {
            self.write_fat_entry(cache, cluster, 0)?;
        }
        Ok(())
    }

    fn write_chain(&self, cache: &BlockCache, start: u32, data: &[u8]) -> FsResult<()> {
        let clusters = self.chain(cache, start)?;
        for (cluster, chunk) in clusters.iter().zip(data.chunks(self.bpb.cluster_size())) {
            cache.write_bytes(self.cluster_offset(*cluster)?, chunk)?;
        }
        Ok(())
    }

    /// Returns the byte offset of a reusable slot, growing the directory by a
    /// cluster when every slot is taken.
    fn find_free_slot(&self, cache: &BlockCache, dir: u32) -> FsResult<u64> {
        let clusters = self.chain(cache, dir)?;
        let mut first = [0u8; 1];
        for cluster in clusters.iter() {
            let base = self.cluster_offset(*cluster)?;
            for index in 0..self.bpb.cluster_size() / DIR_ENTRY_SIZE {
                let slot = base + (index * DIR_ENTRY_SIZE) as u64;
                cache.read_bytes(slot, &mut first)?;
                if first[0] == ENTRY_FREE || first[0] == ENTRY_DELETED {
                    return Ok(slot);
                }
            }
        }
        let last = *clusters.last().ok_or(FsError::CorruptImage)?;
        let grown = self.with_new_chain(cache, 1, |grown| {
            self.zero_cluster(cache, grown)?;
            self.write_fat_entry(cache, last, grown)
        })?;
        self.cluster_offset(grown)
    }

    fn write_entry(
        &self,
        cache: &BlockCache,
        slot: u64,
        name: &[u8; 11],
        attr: u8,
        cluster: u32,
        size: u32,
    ) -> FsResult<()> {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        encode_dir_entry(&mut entry, name, attr, cluster, size);
        cache.write_bytes(slot, &entry)
    }

    fn update_entry(&self, cache: &BlockCache, slot: u64, cluster: u32, size: u32) -> FsResult<()> {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        cache.read_bytes(slot, &mut entry)?;
        write_u16(&mut entry, 20, (cluster >> 16) as u16);
        write_u16(&mut entry, 26, (cluster & 0xffff) as u16);
        write_u32(&mut entry, 28, size);
        cache.write_bytes(slot, &entry)
    }

    fn mark_deleted(&self, cache: &BlockCache, slot: u64) -> FsResult<()> {
        cache.write_bytes(slot, &[ENTRY_DELETED])
    }

    fn clusters_for(&self, len: usize) -> usize {
        len.div_ceil(self.bpb.cluster_size())
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let (parent, name) = split_parent(path)?;
        let short = encode_short_name(name)?;
        let size = u32::try_from(data.len()).map_err(|_| FsError::NoSpace)?;
        let cache = self.writable_cache()?;
        let dir = self.resolve_dir(&cache, parent)?;
        let existing = self.lookup_in_dir(&cache, dir, name)?;
        if existing.is_some_and(|entry| entry.is_dir()) {
            return Err(FsError::IsADirectory);
        }
        // The new chain is complete before the entry points at it.
        self.with_new_chain(&cache, self.clusters_for(data.len()), |first| {
            self.write_chain(&cache, first, data)?;
            match existing {
                Some(entry) => self.update_entry(&cache, entry.slot, first, size),
                None => {
                    let slot = self.find_free_slot(&cache, dir)?;
                    self.write_entry(&cache, slot, &short, ATTR_ARCHIVE, first, size)
                }
            }
        })?;
        if let Some(entry) = existing {
            self.free_chain(&cache, entry.cluster)?;
        }
        cache.flush()?;
        debug!("fat32: {}:{} written, {} bytes", self.letter(), path, data.len());
        Ok(())
    }

    pub fn create_file(&self, path: &str) -> FsResult<()> {
        let (parent, name) = split_parent(path)?;
        let short = encode_short_name(name)?;
        let cache = self.writable_cache()?;
        let dir = self.resolve_dir(&cache, parent)?;
        if self.lookup_in_dir(&cache, dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = self.find_free_slot(&cache, dir)?;
        self.write_entry(&cache, slot, &short, ATTR_ARCHIVE, 0, 0)?;
        cache.flush()
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let cache = self.writable_cache()?;
        let entry = match self.resolve(&cache, path)? {
            Node::Root => return Err(FsError::InvalidPath),
            Node::Entry(entry) if entry.is_dir() => return Err(FsError::IsADirectory),
            Node::Entry(entry) => entry,
        };
        self.mark_deleted(&cache, entry.slot)?;
        self.free_chain(&cache, entry.cluster)?;
        cache.flush()
    }

    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        let (parent, name) = split_parent(path)?;
        let short = encode_short_name(name)?;
        let cache = self.writable_cache()?;
        let dir = self.resolve_dir(&cache, parent)?;
        if self.lookup_in_dir(&cache, dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let parent_ref = if dir == self.bpb.root_cluster { 0 } else { dir };
        self.with_new_chain(&cache, 1, |cluster| {
            self.zero_cluster(&cache, cluster)?;
            let base = self.cluster_offset(cluster)?;
            self.write_entry(&cache, base, &dot_name(1), ATTR_DIRECTORY, cluster, 0)?;
            self.write_entry(&cache, base + DIR_ENTRY_SIZE as u64, &dot_name(2), ATTR_DIRECTORY, parent_ref, 0)?;
            let slot = self.find_free_slot(&cache, dir)?;
            self.write_entry(&cache, slot, &short, ATTR_DIRECTORY, cluster, 0)
        })?;
        cache.flush()
    }

    pub fn remove_dir(&self, path: &str) -> FsResult<()> {
        let cache = self.writable_cache()?;
        let entry = match self.resolve(&cache, path)? {
            Node::Root => return Err(FsError::InvalidPath),
            Node::Entry(entry) if !entry.is_dir() => return Err(FsError::NotADirectory),
            Node::Entry(entry) => entry,
        };
        if entry.is_dot() {
            return Err(FsError::InvalidPath);
        }
        let mut empty = true;
        self.scan_dir(&cache, self.dir_cluster(entry.cluster), |child| {
            if child.is_dot() {
                return Ok(false);
            }
            empty = false;
            Ok(true)
        })?;
        if !empty {
            return Err(FsError::DirectoryNotEmpty);
        }
        self.mark_deleted(&cache, entry.slot)?;
        self.free_chain(&cache, entry.cluster)?;
        cache.flush()
    }
}

struct VolumeTable<'a> {
    volumes: Vec<Fat32Volume<'a>>,
    default: Option<u8>,
}

/// Drive-letter table of mounted FAT32 volumes.
pub struct Fat32<'a> {
    table: Mutex<VolumeTable<'a>>,
}

impl<'a> Default for Fat32<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Fat32<'a> {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(VolumeTable {
                volumes: Vec::new(),
                default: None,
            }),
        }
    }

    /// Mounts an in-memory image as the default volume, replacing whatever
    /// was mounted under the default letter before.
    pub fn init_from_memory(&self, bytes: &'a [u8]) -> FsResult<()> {
        let volume = Fat32Volume::open(ImageSource::from(bytes), DEFAULT_FAT_LETTER)?;
        let mut table = self.table.lock();
        if let Some(slot) = table
            .volumes
            .iter_mut()
            .find(|volume| volume.letter == DEFAULT_FAT_LETTER)
        {
            *slot = volume;
        } else {
            if table.volumes.len() >= MAX_FAT_VOLUMES {
                return Err(FsError::NoFreeSlot);
            }
            table.volumes.push(volume);
        }
        table.default = Some(DEFAULT_FAT_LETTER);
        info!("fat32: memory image mounted as {}:, {} bytes", DEFAULT_FAT_LETTER as char, bytes.len());
        Ok(())
    }

    pub fn init_from_module(&self, modules: &BootModules<'a>, name: &str) -> FsResult<()> {
        let bytes = modules.find(name)?;
        self.init_from_memory(bytes)
    }

    pub fn mount(&self, source: impl Into<ImageSource<'a>>, letter: char) -> FsResult<()> {
        let letter = drive_letter(letter)?;
        let mut table = self.table.lock();
        if table.volumes.len() >= MAX_FAT_VOLUMES {
            return Err(FsError::NoFreeSlot);
        }
        if table.volumes.iter().any(|volume| volume.letter == letter) {
            return Err(FsError::DuplicateLetter);
        }
        let volume = Fat32Volume::open(source.into(), letter)?;
        info!("{}", volume.describe());
        table.volumes.push(volume);
        if table.default.is_none() {
            table.default = Some(letter);
        }
        Ok(())
    }

    pub fn set_default(&self, letter: char) -> FsResult<()> {
        let letter = drive_letter(letter)?;
        let mut table = self.table.lock();
        if !table.volumes.iter().any(|volume| volume.letter == letter) {
            return Err(FsError::NotFound);
        }
        table.default = Some(letter);
        Ok(())
    }

    pub fn volume_count(&self) -> usize {
        self.table.lock().volumes.len()
    }

    fn with_volume<T>(&self, path: &str, f: impl FnOnce(&Fat32Volume<'a>, &str) -> FsResult<T>) -> FsResult<T> {
        let (letter, rest) = split_drive(path)?;
        let table = self.table.lock();
        let letter = letter.or(table.default).ok_or(FsError::NotFound)?;
        let volume = table
            .volumes
            .iter()
            .find(|volume| volume.letter == letter)
            .ok_or(FsError::NotFound)?;
        f(volume, rest)
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        self.with_volume(path, |volume, rest| volume.list_dir(rest, visit))
    }

    pub fn read_file_alloc(&self, path: &str) -> FsResult<Vec<u8>> {
        self.with_volume(path, |volume, rest| volume.read_file_alloc(rest))
    }
}

impl FileSystem for Fat32<'_> {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        Fat32::list_dir(self, path, visit)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.read_file_alloc(path)
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        self.with_volume(path, |volume, rest| volume.metadata(rest))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.with_volume(path, |volume, rest| volume.write_file(rest, data))
    }

    fn create_file(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, |volume, rest| volume.create_file(rest))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, |volume, rest| volume.unlink(rest))
    }

    fn make_dir(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, |volume, rest| volume.make_dir(rest))
    }

    fn remove_dir(&self, path: &str) -> FsResult<()> {
        self.with_volume(path, |volume, rest| volume.remove_dir(rest))
    }

    fn list_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        let table = self.table.lock();
        for volume in table.volumes.iter() {
            visit(&volume.describe());
        }
        table.volumes.len()
    }
}

fn drive_letter(letter: char) -> FsResult<u8> {
    if letter.is_ascii_alphabetic() {
        Ok(letter.to_ascii_uppercase() as u8)
    } else {
        Err(FsError::InvalidPath)
    }
}

/// Splits an optional `"X:"` prefix off `path`.
fn split_drive(path: &str) -> FsResult<(Option<u8>, &str)> {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let rest = &path[2..];
        let rest = if rest.is_empty() { "/" } else { rest };
        if !rest.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        return Ok((Some(bytes[0].to_ascii_uppercase()), rest));
    }
    Ok((None, path))
}

fn short_name(raw: &[u8; 11]) -> String {
    let mut name = String::with_capacity(12);
    let base_len = raw[..8].iter().rposition(|ch| *ch != b' ').map(|idx| idx + 1).unwrap_or(0);
    let ext_len = raw[8..].iter().rposition(|ch| *ch != b' ').map(|idx| idx + 1).unwrap_or(0);
    let push = |name: &mut String, ch: u8| {
        name.push(if ch.is_ascii() { ch.to_ascii_lowercase() as char } else { '?' });
    };
    for ch in &raw[..base_len] {
        push(&mut name, *ch);
    }
    if ext_len > 0 {
        name.push('.');
        for ch in &raw[8..8 + ext_len] {
            push(&mut name, *ch);
        }
    }
    name
}

fn dot_name(dots: usize) -> [u8; 11] {
    let mut name = [b' '; 11];
    name[..dots].fill(b'.');
    name
}

fn is_short_name_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&ch)
}

/// Encodes `name` as an upper-case 8.3 name.
pub fn encode_short_name(name: &str) -> FsResult<[u8; 11]> {
    let mut buf = [b' '; 11];
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(FsError::InvalidName);
    }
    for (idx, ch) in base.bytes().enumerate() {
        if !is_short_name_char(ch) {
            return Err(FsError::InvalidName);
        }
        buf[idx] = ch.to_ascii_uppercase();
    }
    for (idx, ch) in ext.bytes().enumerate() {
        if !is_short_name_char(ch) {
            return Err(FsError::InvalidName);
        }
        buf[8 + idx] = ch.to_ascii_uppercase();
    }
    Ok(buf)
}

fn encode_dir_entry(entry: &mut [u8], name: &[u8; 11], attr: u8, cluster: u32, size: u32) {
    entry.fill(0);
    entry[..11].copy_from_slice(name);
    entry[11] = attr;
    write_u16(entry, 20, (cluster >> 16) as u16);
    write_u16(entry, 26, (cluster & 0xffff) as u16);
    write_u32(entry, 28, size);
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_fat_slot(fat: &mut [u8], index: usize, value: u32) {
    let offset = index * FAT_ENTRY_SIZE;
    if offset + FAT_ENTRY_SIZE <= fat.len() {
        fat[offset..offset + FAT_ENTRY_SIZE].copy_from_slice(&value.to_le_bytes());
    }
}

/// Lays out an empty FAT32 volume over `buf`: one reserved sector, one FAT,
/// one sector per cluster, root directory at cluster 2.
pub fn format_image(buf: &mut [u8]) -> FsResult<usize> {
    let bytes_per_sector = SECTOR_SIZE;
    let reserved_sectors = 1usize;
    let total_sectors = buf.len() / bytes_per_sector;
    let mut sectors_per_fat = 1usize;
    let data_clusters = loop {
        let data = total_sectors
            .checked_sub(reserved_sectors + sectors_per_fat)
            .filter(|data| *data > 0)
            .ok_or(FsError::NoSpace)?;
        let needed = ((data + 2) * FAT_ENTRY_SIZE).div_ceil(bytes_per_sector);
        if needed <= sectors_per_fat {
            break data;
        }
        sectors_per_fat = needed;
    };
    let total_bytes = total_sectors * bytes_per_sector;
    buf[..total_bytes].fill(0);
    let bpb = &mut buf[..bytes_per_sector];
    bpb[..3].copy_from_slice(&[0xeb, 0x58, 0x90]);
    bpb[3..11].copy_from_slice(b"HANACORE");
    write_u16(bpb, BPB_BYTES_PER_SECTOR_OFFSET, bytes_per_sector as u16);
    bpb[BPB_SECTORS_PER_CLUSTER_OFFSET] = 1;
    write_u16(bpb, BPB_RESERVED_SECTORS_OFFSET, reserved_sectors as u16);
    bpb[BPB_NUM_FATS_OFFSET] = 1;
    write_u32(bpb, BPB_TOTAL_SECTORS_32_OFFSET, total_sectors as u32);
    write_u32(bpb, BPB_FAT_SIZE_32_OFFSET, sectors_per_fat as u32);
    write_u32(bpb, BPB_ROOT_CLUSTER_OFFSET, 2);
    write_u16(bpb, BPB_SIGNATURE_OFFSET, BPB_SIGNATURE);

    let fat_offset = reserved_sectors * bytes_per_sector;
    let fat = &mut buf[fat_offset..fat_offset + sectors_per_fat * bytes_per_sector];
    write_fat_slot(fat, 0, 0x0fff_fff8);
    write_fat_slot(fat, 1, FAT32_EOC);
    write_fat_slot(fat, 2, FAT32_EOC);
    debug!("fat32: formatted {} sectors, {} clusters", total_sectors, data_clusters);
    Ok(total_bytes)
}

/// Formats `buf` and stores `files` contiguously in the root directory.
pub fn build_image(buf: &mut [u8], files: &[(&str, &[u8])]) -> FsResult<usize> {
    let total_bytes = format_image(buf)?;
    let bpb = Bpb::parse(&buf[..BPB_SIZE])?;
    let cluster_size = bpb.cluster_size();
    if files.len() > cluster_size / DIR_ENTRY_SIZE {
        return Err(FsError::NoSpace);
    }
    let fat_offset = bpb.sector_offset(bpb.fat_start_sector()) as usize;
    let fat_len = bpb.sectors_per_fat as usize * bpb.bytes_per_sector as usize;
    let data_start = bpb.sector_offset(bpb.data_start_sector()) as usize;
    let mut next_cluster = bpb.root_cluster + 1;
    for (index, (name, data)) in files.iter().enumerate() {
        let short = encode_short_name(name)?;
        let clusters = data.len().div_ceil(cluster_size) as u32;
        if clusters > 0 && next_cluster + clusters - 1 > bpb.max_cluster() {
            return Err(FsError::NoSpace);
        }
        let first = if clusters == 0 { 0 } else { next_cluster };
        let fat = &mut buf[fat_offset..fat_offset + fat_len];
        for idx in 0..clusters {
            let cluster = first + idx;
            let next = if idx + 1 == clusters { FAT32_EOC } else { cluster + 1 };
            write_fat_slot(fat, cluster as usize, next);
        }
        for (idx, chunk) in data.chunks(cluster_size).enumerate() {
            let offset = data_start + (first - 2 + idx as u32) as usize * cluster_size;
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
        let slot = data_start + index * DIR_ENTRY_SIZE;
        encode_dir_entry(
            &mut buf[slot..slot + DIR_ENTRY_SIZE],
            &short,
            ATTR_ARCHIVE,
            first,
            data.len() as u32,
        );
        next_cluster += clusters;
    }
    Ok(total_bytes)
}
