//! Read-only ISO 9660 reader.
//!
//! Rock Ridge and Joliet extensions are ignored; names come from the primary
//! volume descriptor tree with the `;N` version suffix dropped and lowered.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use hvfs::{components, FileSystem, FsError, FsResult, Metadata};
use log::info;

use crate::block::BlockCache;
use crate::config::MAX_PATH_DEPTH;
use crate::image::{BootModules, ImageSource};

const ISO_MIN_IMAGE_SIZE: u64 = 0x8000;
const PVD_OFFSET: u64 = 0x8000;
const PVD_LEN: usize = 2048;
const PVD_TYPE_PRIMARY: u8 = 1;
const PVD_ID: &[u8; 5] = b"CD001";
const PVD_BLOCK_SIZE_OFFSET: usize = 128;
const PVD_ROOT_RECORD_OFFSET: usize = 156;
const RECORD_MIN_LEN: usize = 34;
const RECORD_EXTENT_OFFSET: usize = 2;
const RECORD_DATA_LEN_OFFSET: usize = 10;
const RECORD_FLAGS_OFFSET: usize = 25;
const RECORD_NAME_LEN_OFFSET: usize = 32;
const RECORD_NAME_OFFSET: usize = 33;
const FLAG_DIRECTORY: u8 = 0x02;

#[derive(Clone, Debug)]
struct Record {
    name: String,
    extent: u32,
    size: u32,
    is_dir: bool,
}

impl Record {
    /// Parses the record at the start of `buf`. Returns `None` for the
    /// `.`/`..` self and parent records.
    fn parse(buf: &[u8]) -> FsResult<Option<Self>> {
        let len = *buf.first().ok_or(FsError::CorruptImage)? as usize;
        if len < RECORD_MIN_LEN || len > buf.len() {
            return Err(FsError::CorruptImage);
        }
        let name_len = buf[RECORD_NAME_LEN_OFFSET] as usize;
        if RECORD_NAME_OFFSET + name_len > len {
            return Err(FsError::CorruptImage);
        }
        let raw = &buf[RECORD_NAME_OFFSET..RECORD_NAME_OFFSET + name_len];
        if name_len == 1 && (raw[0] == 0 || raw[0] == 1) {
            return Ok(None);
        }
        Ok(Some(Self {
            name: display_name(raw),
            extent: read_u32(buf, RECORD_EXTENT_OFFSET),
            size: read_u32(buf, RECORD_DATA_LEN_OFFSET),
            is_dir: buf[RECORD_FLAGS_OFFSET] & FLAG_DIRECTORY != 0,
        }))
    }
}

pub struct IsoFs<'a> {
    source: ImageSource<'a>,
    block_size: u32,
    root: Record,
}

impl<'a> IsoFs<'a> {
    pub fn init_from_memory(bytes: &'a [u8]) -> FsResult<Self> {
        Self::new(bytes)
    }

    pub fn init_from_module(modules: &BootModules<'a>, name: &str) -> FsResult<Self> {
        Self::new(modules.find(name)?)
    }

    pub fn new(source: impl Into<ImageSource<'a>>) -> FsResult<Self> {
        let source = source.into();
        let cache = BlockCache::new(&source);
        if cache.capacity()? < ISO_MIN_IMAGE_SIZE {
            return Err(FsError::InvalidImage);
        }
        let pvd = cache
            .read_vec(PVD_OFFSET, PVD_LEN)
            .map_err(|_| FsError::InvalidImage)?;
        if pvd[0] != PVD_TYPE_PRIMARY || &pvd[1..6] != PVD_ID {
            return Err(FsError::InvalidImage);
        }
        let block_size = read_u32(&pvd, PVD_BLOCK_SIZE_OFFSET);
        if block_size != 512 && block_size != 2048 {
            return Err(FsError::InvalidImage);
        }
        let record = &pvd[PVD_ROOT_RECORD_OFFSET..PVD_ROOT_RECORD_OFFSET + RECORD_MIN_LEN];
        let root = Record {
            name: String::new(),
            extent: read_u32(record, RECORD_EXTENT_OFFSET),
            size: read_u32(record, RECORD_DATA_LEN_OFFSET),
            is_dir: true,
        };
        if root.extent == 0 {
            return Err(FsError::InvalidImage);
        }
        info!("isofs: mounted, block size {}, root extent {}", block_size, root.extent);
        Ok(Self {
            source,
            block_size,
            root,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_extent(&self, record: &Record) -> FsResult<Vec<u8>> {
        let offset = record.extent as u64 * self.block_size as u64;
        BlockCache::new(&self.source)
            .read_vec(offset, record.size as usize)
            .map_err(|err| match err {
                FsError::OutOfRange => FsError::CorruptImage,
                other => other,
            })
    }

    fn read_dir(&self, dir: &Record) -> FsResult<Vec<Record>> {
        let data = self.read_extent(dir)?;
        let block_size = self.block_size as usize;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if data[offset] == 0 {
                // Records never straddle a block; zeros pad to the next one.
                offset = (offset / block_size + 1) * block_size;
                continue;
            }
            let len = data[offset] as usize;
            if let Some(record) = Record::parse(&data[offset..])? {
                records.push(record);
            }
            offset += len;
        }
        Ok(records)
    }

    fn resolve(&self, path: &str) -> FsResult<Record> {
        let mut current = self.root.clone();
        for (depth, part) in components(path).enumerate() {
            if depth >= MAX_PATH_DEPTH {
                return Err(FsError::InvalidPath);
            }
            if !current.is_dir {
                return Err(FsError::NotADirectory);
            }
            current = self
                .read_dir(&current)?
                .into_iter()
                .find(|record| record.name.eq_ignore_ascii_case(part))
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        let dir = self.resolve(path)?;
        if !dir.is_dir {
            return Err(FsError::NotADirectory);
        }
        let records = self.read_dir(&dir)?;
        for record in &records {
            visit(&record.name);
        }
        Ok(records.len())
    }

    pub fn get_file_alloc(&self, path: &str) -> FsResult<Vec<u8>> {
        let record = self.resolve(path)?;
        if record.is_dir {
            return Err(FsError::IsADirectory);
        }
        self.read_extent(&record)
    }

    /// Visits every entry below the root depth-first as `(path, is_dir)`,
    /// parents before their children.
    pub fn walk(&self, visit: &mut dyn FnMut(&str, bool)) -> FsResult<usize> {
        self.walk_dir(&self.root, "", 0, visit)
    }

    fn walk_dir(
        &self,
        dir: &Record,
        prefix: &str,
        depth: usize,
        visit: &mut dyn FnMut(&str, bool),
    ) -> FsResult<usize> {
        if depth >= MAX_PATH_DEPTH {
            return Err(FsError::CorruptImage);
        }
        let mut count = 0;
        for record in self.read_dir(dir)? {
            let path = format!("{}/{}", prefix, record.name);
            visit(&path, record.is_dir);
            count += 1;
            if record.is_dir {
                count += self.walk_dir(&record, &path, depth + 1, visit)?;
            }
        }
        Ok(count)
    }
}

impl FileSystem for IsoFs<'_> {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        IsoFs::list_dir(self, path, visit)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.get_file_alloc(path)
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        let record = self.resolve(path)?;
        if record.is_dir {
            Ok(Metadata::dir())
        } else {
            Ok(Metadata::file(record.size as u64))
        }
    }

    fn list_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        visit("ISOFS mount: ISO 9660 image");
        1
    }
}

fn display_name(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|b| *b == b';').unwrap_or(raw.len());
    let mut name = &raw[..end];
    if let Some((b'.', rest)) = name.split_last() {
        name = rest;
    }
    name.iter()
        .map(|b| b.to_ascii_lowercase() as char)
        .collect()
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
