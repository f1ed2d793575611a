//! HanaFS: the kernel's writable in-memory tree, optionally persisted to a
//! block device.
//!
//! Entries live in an ordered map keyed by normalized absolute path, so a
//! directory's children are one contiguous range of keys. Parents are not
//! required to exist; an entry whose parent is missing is still readable by
//! path but never shows up in a listing.
//!
//! On-disk layout, little-endian, starting at [`HanaFsConfig::persist_lba`]:
//!
//! ```text
//! "HANA" | version u32 | entry_count u32 | payload_len u32
//! entry_count x { path_len u16 | is_dir u8 | data_len u32 | path | data }
//! ```
//!
//! Directory records carry no data. The image is zero padded to whole
//! sectors.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Bound;
use core::sync::atomic::{AtomicBool, Ordering};
use hvfs::{FileSystem, FsError, FsResult, Metadata, MAX_NAME_LEN};
use log::{debug, info, warn};
use spin::Mutex;

use crate::block::{read_sector, write_sector, BlockCache, BlockDevice};
use crate::config::{HanaFsConfig, HANAFS_VERSION, MAX_PATH_DEPTH, SECTOR_SIZE};
use crate::iso9660::IsoFs;

const HANAFS_MAGIC: &[u8; 4] = b"HANA";
const HEADER_SIZE: usize = 16;
const RECORD_HEADER_SIZE: usize = 7;
const ROOT_PATH: &str = "/";

#[derive(Clone, Debug, PartialEq, Eq)]
struct Entry {
    is_dir: bool,
    data: Vec<u8>,
}

impl Entry {
    fn dir() -> Self {
        Self {
            is_dir: true,
            data: Vec::new(),
        }
    }

    fn file(data: &[u8]) -> Self {
        Self {
            is_dir: false,
            data: data.to_vec(),
        }
    }
}

struct Table {
    entries: BTreeMap<String, Entry>,
    /// Whether the table was loaded from or last persisted to the device.
    backed: bool,
    imports: Vec<String>,
}

impl Table {
    fn root_only() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::from(ROOT_PATH), Entry::dir());
        Self {
            entries,
            backed: false,
            imports: Vec::new(),
        }
    }

    fn get(&self, path: &str) -> FsResult<&Entry> {
        self.entries.get(path).ok_or(FsError::NotFound)
    }

    /// Direct children of the directory at `path`, as `(name, entry)`.
    fn children<'t>(&'t self, path: &str) -> impl Iterator<Item = (&'t str, &'t Entry)> + 't {
        let start = if path.ends_with('/') { path.len() } else { path.len() + 1 };
        self.children_of(path).filter_map(move |(key, entry)| {
            let name = &key[start..];
            (!name.contains('/')).then_some((name, entry))
        })
    }

    fn has_children(&self, path: &str) -> bool {
        self.children_of(path).next().is_some()
    }

    /// Every descendant of `path`, at any depth.
    fn children_of<'t>(&'t self, path: &str) -> impl Iterator<Item = (&'t String, &'t Entry)> + 't {
        let mut prefix = String::from(path);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.entries
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix.as_str()))
    }

    fn serialize(&self) -> FsResult<Vec<u8>> {
        let mut records = Vec::new();
        for (path, entry) in &self.entries {
            let path_len = u16::try_from(path.len()).map_err(|_| FsError::InvalidPath)?;
            let data: &[u8] = if entry.is_dir { &[] } else { &entry.data };
            let data_len = u32::try_from(data.len()).map_err(|_| FsError::NoSpace)?;
            records.extend_from_slice(&path_len.to_le_bytes());
            records.push(entry.is_dir as u8);
            records.extend_from_slice(&data_len.to_le_bytes());
            records.extend_from_slice(path.as_bytes());
            records.extend_from_slice(data);
        }
        let entry_count = u32::try_from(self.entries.len()).map_err(|_| FsError::NoSpace)?;
        let payload_len = u32::try_from(records.len()).map_err(|_| FsError::NoSpace)?;
        let mut image = Vec::with_capacity(HEADER_SIZE + records.len());
        image.extend_from_slice(HANAFS_MAGIC);
        image.extend_from_slice(&HANAFS_VERSION.to_le_bytes());
        image.extend_from_slice(&entry_count.to_le_bytes());
        image.extend_from_slice(&payload_len.to_le_bytes());
        image.extend_from_slice(&records);
        Ok(image)
    }

    fn deserialize(image: &[u8], entry_count: u32) -> FsResult<Self> {
        let mut table = Self::root_only();
        let mut pos = HEADER_SIZE;
        for _ in 0..entry_count {
            let header = image
                .get(pos..pos + RECORD_HEADER_SIZE)
                .ok_or(FsError::CorruptImage)?;
            let path_len = u16::from_le_bytes([header[0], header[1]]) as usize;
            let is_dir = header[2] != 0;
            let data_len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
            pos += RECORD_HEADER_SIZE;
            let path = image.get(pos..pos + path_len).ok_or(FsError::CorruptImage)?;
            let path = core::str::from_utf8(path).map_err(|_| FsError::CorruptImage)?;
            // Stored keys are already normalized; anything else is unreachable.
            let path = normalize(path)
                .ok()
                .filter(|norm| norm.as_str() == path)
                .ok_or(FsError::CorruptImage)?;
            pos += path_len;
            let entry = if is_dir {
                Entry::dir()
            } else {
                let data = image.get(pos..pos + data_len).ok_or(FsError::CorruptImage)?;
                pos += data_len;
                Entry::file(data)
            };
            table.entries.insert(path, entry);
        }
        if pos != image.len() {
            return Err(FsError::CorruptImage);
        }
        table.entries.insert(String::from(ROOT_PATH), Entry::dir());
        Ok(table)
    }
}

/// The HanaFS instance. The table stays unloaded until the first call to
/// [`HanaFs::init`] or to any operation, which loads it from the device or
/// starts fresh.
pub struct HanaFs<'a> {
    device: Option<&'a dyn BlockDevice>,
    config: HanaFsConfig,
    auto_persist: AtomicBool,
    table: Mutex<Option<Table>>,
}

impl<'a> HanaFs<'a> {
    /// Purely in-memory instance; persistence calls return `Unsupported`.
    pub fn new(config: HanaFsConfig) -> Self {
        Self {
            device: None,
            auto_persist: AtomicBool::new(config.auto_persist),
            config,
            table: Mutex::new(None),
        }
    }

    pub fn with_device(device: &'a dyn BlockDevice, config: HanaFsConfig) -> Self {
        Self {
            device: Some(device),
            ..Self::new(config)
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Loads the persisted image if there is one, else starts from a fresh
    /// root plus the configured skeleton. Does nothing once loaded, and
    /// never returns an error.
    pub fn init(&self) -> FsResult<()> {
        let mut table = self.table.lock();
        if table.is_none() {
            *table = Some(self.boot_table());
        }
        Ok(())
    }

    fn boot_table(&self) -> Table {
        if self.device.is_some() {
            match self.read_image() {
                Ok(table) => {
                    info!(
                        "hanafs: loaded {} entries from LBA {}",
                        table.entries.len(),
                        self.config.persist_lba
                    );
                    return table;
                }
                Err(err) => warn!("hanafs: {}, starting with an empty tree", err),
            }
        }
        let mut table = Table::root_only();
        for dir in self.config.skeleton {
            if let Ok(path) = normalize(dir) {
                table.entries.insert(path, Entry::dir());
            }
        }
        debug!("hanafs: fresh tree with {} entries", table.entries.len());
        table
    }

    fn with_table<R>(&self, op: impl FnOnce(&mut Table) -> FsResult<R>) -> FsResult<R> {
        let mut guard = self.table.lock();
        let table = guard.get_or_insert_with(|| self.boot_table());
        op(table)
    }

    /// Runs a mutation and, when auto-persist is on, writes the table back.
    /// A failed persist is logged; the mutation still counts.
    fn mutate<R>(&self, op: impl FnOnce(&mut Table) -> FsResult<R>) -> FsResult<R> {
        let mut guard = self.table.lock();
        let table = guard.get_or_insert_with(|| self.boot_table());
        let out = op(table)?;
        if self.auto_persist.load(Ordering::Relaxed) {
            if let Err(err) = self.write_image(table) {
                warn!("hanafs: auto-persist failed: {}", err);
            }
        }
        Ok(out)
    }

    pub fn set_persist_enabled(&self, enabled: bool) {
        self.auto_persist.store(enabled, Ordering::Relaxed);
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = normalize(path)?;
        self.mutate(|table| {
            if table.entries.get(&path).is_some_and(|entry| entry.is_dir) {
                return Err(FsError::IsADirectory);
            }
            debug!("hanafs: write {} ({} bytes)", path, data.len());
            table.entries.insert(path, Entry::file(data));
            Ok(())
        })
    }

    pub fn get_file_alloc(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = normalize(path)?;
        self.with_table(|table| match table.get(&path)? {
            entry if entry.is_dir => Err(FsError::NotFound),
            entry => Ok(entry.data.clone()),
        })
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        let path = normalize(path)?;
        self.with_table(|table| {
            if !table.get(&path)?.is_dir {
                return Err(FsError::NotADirectory);
            }
            let mut count = 0;
            for (name, _) in table.children(&path) {
                visit(name);
                count += 1;
            }
            Ok(count)
        })
    }

    /// Creates an empty file, truncating one that already exists.
    pub fn create_file(&self, path: &str) -> FsResult<()> {
        self.write_file(path, &[])
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let path = normalize(path)?;
        self.mutate(|table| {
            if table.get(&path)?.is_dir {
                return Err(FsError::IsADirectory);
            }
            table.entries.remove(&path);
            Ok(())
        })
    }

    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        let path = normalize(path)?;
        self.mutate(|table| {
            if table.entries.contains_key(&path) {
                return Err(FsError::AlreadyExists);
            }
            table.entries.insert(path, Entry::dir());
            Ok(())
        })
    }

    pub fn remove_dir(&self, path: &str) -> FsResult<()> {
        let path = normalize(path)?;
        if path == ROOT_PATH {
            return Err(FsError::InvalidPath);
        }
        self.mutate(|table| {
            if !table.get(&path)?.is_dir {
                return Err(FsError::NotADirectory);
            }
            if table.has_children(&path) {
                return Err(FsError::DirectoryNotEmpty);
            }
            table.entries.remove(&path);
            Ok(())
        })
    }

    pub fn stat(&self, path: &str) -> FsResult<Metadata> {
        let path = normalize(path)?;
        self.with_table(|table| {
            let entry = table.get(&path)?;
            Ok(if entry.is_dir {
                Metadata::dir()
            } else {
                Metadata::file(entry.data.len() as u64)
            })
        })
    }

    /// Drops every entry, leaving only the root, and persists the result.
    pub fn format(&self) -> FsResult<()> {
        let mut guard = self.table.lock();
        let table = guard.insert(Table::root_only());
        self.write_image(table)?;
        info!("hanafs: formatted at LBA {}", self.config.persist_lba);
        Ok(())
    }

    pub fn persist_to_block_device(&self) -> FsResult<()> {
        let mut guard = self.table.lock();
        let table = guard.get_or_insert_with(|| self.boot_table());
        self.write_image(table)
    }

    /// Replaces the table with the persisted image. The current table is
    /// kept when the image is missing or unreadable.
    pub fn load_from_block_device(&self) -> FsResult<usize> {
        let table = self.read_image()?;
        let count = table.entries.len();
        *self.table.lock() = Some(table);
        info!("hanafs: loaded {} entries from LBA {}", count, self.config.persist_lba);
        Ok(count)
    }

    fn write_image(&self, table: &mut Table) -> FsResult<()> {
        let device = self.device.ok_or(FsError::Unsupported)?;
        let image = table.serialize()?;
        let sectors = image.len().div_ceil(SECTOR_SIZE) as u64;
        let capacity = BlockCache::new(device).capacity().map_err(|_| FsError::Io)?;
        let end = self
            .config
            .persist_lba
            .checked_add(sectors)
            .and_then(|end| end.checked_mul(SECTOR_SIZE as u64))
            .ok_or(FsError::NoSpace)?;
        if end > capacity {
            return Err(FsError::NoSpace);
        }
        // Header sector last, so an interrupted write never looks complete.
        for (idx, chunk) in image.chunks(SECTOR_SIZE).enumerate().skip(1) {
            self.write_chunk(device, idx as u64, chunk)?;
        }
        self.write_chunk(device, 0, &image[..image.len().min(SECTOR_SIZE)])?;
        device.flush().map_err(|_| FsError::Io)?;
        table.backed = true;
        debug!("hanafs: persisted {} entries ({} bytes)", table.entries.len(), image.len());
        Ok(())
    }

    fn write_chunk(&self, device: &dyn BlockDevice, index: u64, chunk: &[u8]) -> FsResult<()> {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..chunk.len()].copy_from_slice(chunk);
        write_sector(device, self.config.persist_lba + index, &sector).map_err(|_| FsError::Io)
    }

    fn read_image(&self) -> FsResult<Table> {
        let device = self.device.ok_or(FsError::Unsupported)?;
        let lba = self.config.persist_lba;
        let first = read_sector(device, lba).map_err(|_| FsError::Io)?;
        if &first[..4] != HANAFS_MAGIC {
            return Err(FsError::NoPersistedImage);
        }
        let field = |offset: usize| {
            u32::from_le_bytes([first[offset], first[offset + 1], first[offset + 2], first[offset + 3]])
        };
        if field(4) != HANAFS_VERSION {
            return Err(FsError::CorruptImage);
        }
        let entry_count = field(8);
        let total = HEADER_SIZE + field(12) as usize;
        let capacity = BlockCache::new(device).capacity().map_err(|_| FsError::Io)?;
        if lba.saturating_mul(SECTOR_SIZE as u64).saturating_add(total as u64) > capacity {
            return Err(FsError::CorruptImage);
        }
        let mut image = vec![0u8; total];
        for (idx, chunk) in image.chunks_mut(SECTOR_SIZE).enumerate() {
            let sector = if idx == 0 {
                first
            } else {
                read_sector(device, lba + idx as u64).map_err(|_| FsError::Io)?
            };
            chunk.copy_from_slice(&sector[..chunk.len()]);
        }
        let mut table = Table::deserialize(&image, entry_count)?;
        table.backed = true;
        Ok(table)
    }

    /// Copies the whole ISO tree under `mount_point`, creating it if needed,
    /// and returns the number of entries imported.
    pub fn import_iso(&self, iso: &IsoFs, mount_point: &str) -> FsResult<usize> {
        let base = normalize(mount_point)?;
        let mut found = Vec::new();
        iso.walk(&mut |path, is_dir| found.push((String::from(path), is_dir)))?;
        let mut staged = Vec::with_capacity(found.len());
        for (path, is_dir) in found {
            let entry = if is_dir {
                Entry::dir()
            } else {
                Entry::file(&iso.get_file_alloc(&path)?)
            };
            staged.push((join(&base, &path), entry));
        }
        let count = staged.len();
        self.mutate(move |table| {
            match table.entries.get(&base) {
                Some(entry) if !entry.is_dir => return Err(FsError::NotADirectory),
                Some(_) => {}
                None => {
                    table.entries.insert(base.clone(), Entry::dir());
                }
            }
            for (path, entry) in staged {
                table.entries.insert(path, entry);
            }
            info!("hanafs: imported {} ISO entries under {}", count, base);
            if !table.imports.contains(&base) {
                table.imports.push(base);
            }
            Ok(count)
        })
    }

    pub fn list_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        let guard = self.table.lock();
        let Some(table) = guard.as_ref() else {
            visit("HanaFS mount: [unloaded]");
            return 1;
        };
        if table.backed {
            visit(&format!(
                "HanaFS mount: [block device -> LBA={}]",
                self.config.persist_lba
            ));
        } else {
            visit("HanaFS mount: [in-memory]");
        }
        for import in &table.imports {
            visit(&format!("HanaFS mount: [{}]", import));
        }
        1 + table.imports.len()
    }
}

impl FileSystem for HanaFs<'_> {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        HanaFs::list_dir(self, path, visit)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.get_file_alloc(path)
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        self.stat(path)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        HanaFs::write_file(self, path, data)
    }

    fn create_file(&self, path: &str) -> FsResult<()> {
        HanaFs::create_file(self, path)
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        HanaFs::unlink(self, path)
    }

    fn make_dir(&self, path: &str) -> FsResult<()> {
        HanaFs::make_dir(self, path)
    }

    fn remove_dir(&self, path: &str) -> FsResult<()> {
        HanaFs::remove_dir(self, path)
    }

    fn list_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        HanaFs::list_mounts(self, visit)
    }
}

/// Canonical form of `path`: leading `/`, no empty or `.` components, no
/// trailing `/`. A relative path is taken from the root.
pub fn normalize(path: &str) -> FsResult<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for (depth, part) in hvfs::components(path).enumerate() {
        if part == ".." || depth >= MAX_PATH_DEPTH || part.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidPath);
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn join(base: &str, rel: &str) -> String {
    let mut out = String::from(base.trim_end_matches('/'));
    out.push_str(rel);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use alloc::string::ToString;

    fn names(fs: &HanaFs, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        fs.list_dir(path, &mut |name| out.push(name.to_string())).unwrap();
        out
    }

    fn blank_disk() -> RamDisk {
        RamDisk::new(HanaFsConfig::default().persist_lba as usize + 64)
    }

    struct FailingDisk;

    impl BlockDevice for FailingDisk {
        fn block_size(&self) -> usize {
            SECTOR_SIZE
        }

        fn num_blocks(&self) -> FsResult<u64> {
            Ok(4096)
        }

        fn read_block(&self, _block_id: u64, _buf: &mut [u8]) -> FsResult<()> {
            Err(FsError::Io)
        }

        fn write_block(&self, _block_id: u64, _buf: &[u8]) -> FsResult<()> {
            Err(FsError::Io)
        }

        fn flush(&self) -> FsResult<()> {
            Ok(())
        }
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("//a/./b/").unwrap(), "/a/b");
        assert_eq!(normalize("bin/sh").unwrap(), "/bin/sh");
        assert_eq!(normalize("/a/../b"), Err(FsError::InvalidPath));
    }

    #[test]
    fn write_then_read_back() {
        let fs = HanaFs::new(HanaFsConfig::default());
        let big: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        for data in [&b""[..], &b"x"[..], &big[..]] {
            fs.write_file("/data.bin", data).unwrap();
            assert_eq!(fs.get_file_alloc("/data.bin").unwrap(), data);
        }
        fs.write_file("/data.bin", b"last").unwrap();
        fs.write_file("/data.bin", b"last").unwrap();
        assert_eq!(fs.get_file_alloc("data.bin/").unwrap(), b"last");
        assert_eq!(names(&fs, "/"), ["data.bin"]);
    }

    #[test]
    fn listing_excludes_grandchildren() {
        let fs = HanaFs::new(HanaFsConfig::default());
        fs.make_dir("/a").unwrap();
        fs.make_dir("/a/b").unwrap();
        fs.write_file("/a/b/c", b"deep").unwrap();
        fs.write_file("/a/x", b"near").unwrap();
        fs.write_file("/a-b", b"sibling").unwrap();
        assert_eq!(names(&fs, "/"), ["a", "a-b"]);
        assert_eq!(names(&fs, "/a"), ["b", "x"]);
        assert_eq!(names(&fs, "/a/b"), ["c"]);
        assert_eq!(fs.list_dir("/a/x", &mut |_| {}), Err(FsError::NotADirectory));
        assert_eq!(fs.list_dir("/nope", &mut |_| {}), Err(FsError::NotFound));
    }

    #[test]
    fn mutation_errors() {
        let fs = HanaFs::new(HanaFsConfig::default());
        fs.make_dir("/d").unwrap();
        fs.write_file("/d/f", b"1").unwrap();
        assert_eq!(fs.make_dir("/d"), Err(FsError::AlreadyExists));
        assert_eq!(fs.write_file("/d", b"x"), Err(FsError::IsADirectory));
        assert_eq!(fs.get_file_alloc("/d"), Err(FsError::NotFound));
        assert_eq!(fs.unlink("/d"), Err(FsError::IsADirectory));
        assert_eq!(fs.remove_dir("/d"), Err(FsError::DirectoryNotEmpty));
        assert_eq!(fs.remove_dir("/d/f"), Err(FsError::NotADirectory));
        assert_eq!(fs.remove_dir("/"), Err(FsError::InvalidPath));
        assert_eq!(fs.unlink("/missing"), Err(FsError::NotFound));
        fs.unlink("/d/f").unwrap();
        fs.remove_dir("/d").unwrap();
        assert_eq!(fs.stat("/d"), Err(FsError::NotFound));
    }

    #[test]
    fn create_file_truncates() {
        let fs = HanaFs::new(HanaFsConfig::default());
        fs.write_file("/f", b"content").unwrap();
        fs.create_file("/f").unwrap();
        assert_eq!(fs.stat("/f").unwrap(), Metadata::file(0));
        assert_eq!(fs.stat("/").unwrap(), Metadata::dir());
    }

    #[test]
    fn init_uses_skeleton_without_image() {
        let disk = blank_disk();
        let config = HanaFsConfig {
            skeleton: &["/bin", "/dev", "/home"],
            ..HanaFsConfig::default()
        };
        let fs = HanaFs::with_device(&disk, config);
        assert!(!fs.is_loaded());
        fs.init().unwrap();
        assert!(fs.is_loaded());
        assert_eq!(names(&fs, "/"), ["bin", "dev", "home"]);
        assert_eq!(fs.load_from_block_device(), Err(FsError::NoPersistedImage));
    }

    #[test]
    fn persistence_round_trip() {
        let disk = blank_disk();
        let first = HanaFs::with_device(&disk, HanaFsConfig::default());
        first.write_file("/z.txt", b"zzz").unwrap();
        first.make_dir("/etc").unwrap();
        first.write_file("/etc/motd", &[0x42; 700]).unwrap();
        first.persist_to_block_device().unwrap();

        let second_disk = blank_disk();
        let second = HanaFs::with_device(&second_disk, HanaFsConfig::default());
        second.write_file("/etc/motd", &[0x42; 700]).unwrap();
        second.make_dir("/etc").unwrap();
        second.write_file("/z.txt", b"zzz").unwrap();
        second.persist_to_block_device().unwrap();
        assert_eq!(disk.to_vec(), second_disk.to_vec());

        let reloaded = HanaFs::with_device(&disk, HanaFsConfig::default());
        reloaded.init().unwrap();
        assert_eq!(names(&reloaded, "/"), ["etc", "z.txt"]);
        assert_eq!(reloaded.get_file_alloc("/etc/motd").unwrap(), [0x42; 700]);
        assert_eq!(reloaded.stat("/etc").unwrap(), Metadata::dir());
        let mut lines = Vec::new();
        reloaded.list_mounts(&mut |line| lines.push(line.to_string()));
        assert_eq!(lines, ["HanaFS mount: [block device -> LBA=2048]"]);
    }

    #[test]
    fn header_layout() {
        let disk = blank_disk();
        let fs = HanaFs::with_device(&disk, HanaFsConfig::default());
        fs.format().unwrap();
        let image = disk.to_vec();
        let header = &image[2048 * SECTOR_SIZE..];
        assert_eq!(&header[..4], b"HANA");
        assert_eq!(&header[4..8], &1u32.to_le_bytes());
        assert_eq!(&header[8..12], &1u32.to_le_bytes());
        assert_eq!(&header[12..16], &8u32.to_le_bytes());
        assert_eq!(&header[16..24], &[1, 0, 1, 0, 0, 0, 0, b'/']);
        assert!(header[24..SECTOR_SIZE].iter().all(|b| *b == 0));
    }

    #[test]
    fn corrupt_images_are_rejected() {
        let disk = blank_disk();
        let fs = HanaFs::with_device(&disk, HanaFsConfig::default());
        fs.write_file("/f", b"data").unwrap();
        fs.persist_to_block_device().unwrap();
        let base = 2048 * SECTOR_SIZE;

        let mut image = disk.to_vec();
        image[base + 4] = 2;
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));

        let mut image = disk.to_vec();
        image[base + 12..base + 16].copy_from_slice(&u32::MAX.to_le_bytes());
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));

        let mut image = disk.to_vec();
        image[base + 8] = 9;
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));
        fs.init().unwrap();
        assert_eq!(names(&fs, "/"), Vec::<String>::new());
    }

    #[test]
    fn payload_and_paths_must_be_exact() {
        let disk = blank_disk();
        let fs = HanaFs::with_device(&disk, HanaFsConfig::default());
        fs.write_file("/ab", b"data").unwrap();
        fs.persist_to_block_device().unwrap();
        let base = 2048 * SECTOR_SIZE;
        // Records: "/" takes 8 bytes, "/ab" with its data takes 14.
        assert_eq!(&disk.to_vec()[base + 12..base + 16], &22u32.to_le_bytes());

        let mut image = disk.to_vec();
        image[base + 12..base + 16].copy_from_slice(&23u32.to_le_bytes());
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));

        let mut image = disk.to_vec();
        image[base + 32] = b'/';
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));

        let mut image = disk.to_vec();
        image[base + 31..base + 34].copy_from_slice(b"/..");
        let bad = RamDisk::from_vec(image);
        let fs = HanaFs::with_device(&bad, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Err(FsError::CorruptImage));

        let fs = HanaFs::with_device(&disk, HanaFsConfig::default());
        assert_eq!(fs.load_from_block_device(), Ok(2));
        assert_eq!(fs.get_file_alloc("/ab").unwrap(), b"data");
    }

    #[test]
    fn device_failures_surface_as_io() {
        let fs = HanaFs::with_device(&FailingDisk, HanaFsConfig::default());
        fs.init().unwrap();
        fs.write_file("/f", b"kept").unwrap();
        assert_eq!(fs.persist_to_block_device(), Err(FsError::Io));
        assert_eq!(fs.load_from_block_device(), Err(FsError::Io));
        assert_eq!(fs.get_file_alloc("/f").unwrap(), b"kept");
        let memory = HanaFs::new(HanaFsConfig::default());
        assert_eq!(memory.persist_to_block_device(), Err(FsError::Unsupported));
    }

    #[test]
    fn auto_persist_after_mutation() {
        let disk = blank_disk();
        let fs = HanaFs::with_device(&disk, HanaFsConfig::default());
        fs.set_persist_enabled(true);
        fs.write_file("/log", b"entry").unwrap();
        let reloaded = HanaFs::with_device(&disk, HanaFsConfig::default());
        assert_eq!(reloaded.get_file_alloc("/log").unwrap(), b"entry");

        let failing = HanaFs::with_device(&FailingDisk, HanaFsConfig::default());
        failing.set_persist_enabled(true);
        assert_eq!(failing.write_file("/log", b"entry"), Ok(()));
    }
}
