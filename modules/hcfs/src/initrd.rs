//! USTAR initrd unpacked into HanaFS at boot.

use alloc::string::String;
use hvfs::{FsError, FsResult};
use log::{debug, info};

use crate::hanafs::HanaFs;
use crate::image::BootModules;

const TAR_BLOCK_SIZE: usize = 512;
const TAR_NAME_OFFSET: usize = 0;
const TAR_NAME_LEN: usize = 100;
const TAR_SIZE_OFFSET: usize = 124;
const TAR_SIZE_LEN: usize = 12;
const TAR_TYPEFLAG_OFFSET: usize = 156;
const TAR_PREFIX_OFFSET: usize = 345;
const TAR_PREFIX_LEN: usize = 155;
const TAR_TYPE_DIR: u8 = b'5';

struct Header {
    path: String,
    size: usize,
    typeflag: u8,
}

impl Header {
    /// Returns `None` at the end-of-archive marker.
    fn parse(raw: &[u8]) -> Option<Self> {
        let name = field(raw, TAR_NAME_OFFSET, TAR_NAME_LEN);
        if name.is_empty() {
            return None;
        }
        let prefix = field(raw, TAR_PREFIX_OFFSET, TAR_PREFIX_LEN);
        let mut path = String::new();
        if !prefix.is_empty() {
            path.push_str(&String::from_utf8_lossy(prefix));
            path.push('/');
        }
        path.push_str(&String::from_utf8_lossy(name));
        Some(Self {
            path,
            size: parse_octal(&raw[TAR_SIZE_OFFSET..TAR_SIZE_OFFSET + TAR_SIZE_LEN]),
            typeflag: raw[TAR_TYPEFLAG_OFFSET],
        })
    }

    fn is_dir(&self) -> bool {
        self.typeflag == TAR_TYPE_DIR || self.path.ends_with('/')
    }

    /// Absolute path inside HanaFS, or `None` for the archive root.
    fn target(&self) -> Option<String> {
        let rel = self.path.strip_prefix("./").unwrap_or(&self.path);
        let rel = rel.trim_start_matches('/').trim_end_matches('/');
        if rel.is_empty() || rel == "." {
            return None;
        }
        let mut out = String::with_capacity(rel.len() + 1);
        out.push('/');
        out.push_str(rel);
        Some(out)
    }
}

/// Unpacks every entry of `archive` into `fs` and returns how many were
/// stored.
pub fn unpack_into(archive: &[u8], fs: &HanaFs) -> FsResult<usize> {
    let mut offset = 0usize;
    let mut count = 0usize;
    while offset + TAR_BLOCK_SIZE <= archive.len() {
        let Some(header) = Header::parse(&archive[offset..offset + TAR_BLOCK_SIZE]) else {
            break;
        };
        offset += TAR_BLOCK_SIZE;
        let data_end = offset.checked_add(header.size).ok_or(FsError::TruncatedArchive)?;
        if !header.is_dir() && data_end > archive.len() {
            return Err(FsError::TruncatedArchive);
        }
        if let Some(path) = header.target() {
            debug!("initrd: {} size={} type={}", path, header.size, header.typeflag as char);
            if header.is_dir() {
                make_dir_all(fs, &path)?;
            } else {
                if let Some(split) = path.rfind('/').filter(|split| *split > 0) {
                    make_dir_all(fs, &path[..split])?;
                }
                fs.write_file(&path, &archive[offset..data_end])?;
            }
            count += 1;
        }
        offset = offset.saturating_add(header.size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE);
    }
    Ok(count)
}

/// Locates the boot module `name` and unpacks it into `fs`.
pub fn init_from_module(modules: &BootModules, name: &str, fs: &HanaFs) -> FsResult<usize> {
    let archive = modules.find(name)?;
    let count = unpack_into(archive, fs)?;
    info!("initrd: {} entries from {} ({} bytes)", count, name, archive.len());
    Ok(count)
}

/// Creates `path` and every missing ancestor.
fn make_dir_all(fs: &HanaFs, path: &str) -> FsResult<()> {
    let mut end = 0;
    while let Some(next) = path[end + 1..].find('/').map(|idx| idx + end + 1) {
        make_dir_if_missing(fs, &path[..next])?;
        end = next;
    }
    make_dir_if_missing(fs, path)
}

fn make_dir_if_missing(fs: &HanaFs, path: &str) -> FsResult<()> {
    match fs.make_dir(path) {
        Err(FsError::AlreadyExists) if !fs.stat(path)?.is_dir() => Err(FsError::NotADirectory),
        Err(FsError::AlreadyExists) => Ok(()),
        other => other,
    }
}

/// A NUL-terminated field; the full width when no NUL is present.
fn field(raw: &[u8], offset: usize, len: usize) -> &[u8] {
    let bytes = &raw[offset..offset + len];
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(len);
    &bytes[..end]
}

/// Leading octal digits, stopping at the first non-digit.
fn parse_octal(bytes: &[u8]) -> usize {
    let start = bytes.iter().position(|b| *b != b' ').unwrap_or(bytes.len());
    bytes[start..]
        .iter()
        .take_while(|b| (b'0'..=b'7').contains(*b))
        .fold(0usize, |acc, b| acc.saturating_mul(8).saturating_add((b - b'0') as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HanaFsConfig;
    use crate::image::BootModule;
    use alloc::format;
    use alloc::string::ToString;
    use alloc::vec;
    use alloc::vec::Vec;

    fn header(name: &str, size: usize, typeflag: u8) -> Vec<u8> {
        let mut raw = vec![0u8; TAR_BLOCK_SIZE];
        raw[..name.len()].copy_from_slice(name.as_bytes());
        let size = format!("{:011o}", size);
        raw[TAR_SIZE_OFFSET..TAR_SIZE_OFFSET + 11].copy_from_slice(size.as_bytes());
        raw[TAR_TYPEFLAG_OFFSET] = typeflag;
        raw[257..262].copy_from_slice(b"ustar");
        raw
    }

    fn push_file(archive: &mut Vec<u8>, name: &str, data: &[u8]) {
        archive.extend(header(name, data.len(), b'0'));
        archive.extend_from_slice(data);
        let pad = data.len().div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE - data.len();
        archive.resize(archive.len() + pad, 0);
    }

    fn names(fs: &HanaFs, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        fs.list_dir(path, &mut |name| out.push(name.to_string())).unwrap();
        out
    }

    #[test]
    fn parse_octal_sizes() {
        assert_eq!(parse_octal(b"00000000005\0"), 5);
        assert_eq!(parse_octal(b"   1750\0"), 1000);
        assert_eq!(parse_octal(b"\0\0\0"), 0);
    }

    #[test]
    fn unpack_dir_and_file() {
        let mut archive = header("dir/", 0, TAR_TYPE_DIR);
        push_file(&mut archive, "dir/file.txt", b"hello");
        archive.extend(vec![0u8; 2 * TAR_BLOCK_SIZE]);
        let fs = HanaFs::new(HanaFsConfig::default());
        assert_eq!(unpack_into(&archive, &fs).unwrap(), 2);
        assert_eq!(names(&fs, "/"), ["dir"]);
        assert_eq!(names(&fs, "/dir"), ["file.txt"]);
        assert_eq!(fs.get_file_alloc("/dir/file.txt").unwrap(), b"hello");
    }

    #[test]
    fn missing_parents_are_created() {
        let mut archive = header("./", 0, TAR_TYPE_DIR);
        push_file(&mut archive, "./usr/share/doc/readme", &[b'r'; 600]);
        push_file(&mut archive, "./empty", b"");
        let fs = HanaFs::new(HanaFsConfig::default());
        assert_eq!(unpack_into(&archive, &fs).unwrap(), 2);
        assert_eq!(names(&fs, "/"), ["empty", "usr"]);
        assert_eq!(names(&fs, "/usr/share"), ["doc"]);
        assert_eq!(fs.get_file_alloc("/usr/share/doc/readme").unwrap(), [b'r'; 600]);
        assert_eq!(fs.get_file_alloc("/empty").unwrap(), b"");
    }

    #[test]
    fn prefix_field_is_joined() {
        let mut archive = header("deep.txt", 2, b'0');
        archive[TAR_PREFIX_OFFSET..TAR_PREFIX_OFFSET + 4].copy_from_slice(b"a/b\0");
        archive.extend_from_slice(b"ok");
        archive.resize(2 * TAR_BLOCK_SIZE, 0);
        let fs = HanaFs::new(HanaFsConfig::default());
        unpack_into(&archive, &fs).unwrap();
        assert_eq!(fs.get_file_alloc("/a/b/deep.txt").unwrap(), b"ok");
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut archive = header("big.bin", 4096, b'0');
        archive.extend(vec![1u8; 100]);
        let fs = HanaFs::new(HanaFsConfig::default());
        assert_eq!(unpack_into(&archive, &fs), Err(FsError::TruncatedArchive));
    }

    #[test]
    fn short_archive_is_empty() {
        let fs = HanaFs::new(HanaFsConfig::default());
        assert_eq!(unpack_into(&[0u8; 100], &fs), Ok(0));
        assert_eq!(unpack_into(&[0u8; 1024], &fs), Ok(0));
    }

    #[test]
    fn init_from_boot_module() {
        let mut archive = Vec::new();
        push_file(&mut archive, "init", b"#!/bin/sh\n");
        let modules = BootModules::new(vec![BootModule {
            name: "/boot/initrd.tar",
            bytes: &archive,
        }]);
        let fs = HanaFs::new(HanaFsConfig::default());
        assert_eq!(init_from_module(&modules, "initrd.tar", &fs), Ok(1));
        assert_eq!(fs.get_file_alloc("/init").unwrap(), b"#!/bin/sh\n");
        assert_eq!(init_from_module(&modules, "other.tar", &fs), Err(FsError::NotFound));
    }
}
