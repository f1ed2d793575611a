#![no_std]

// Path-based VFS vocabulary shared by every HanaCore filesystem backend.

extern crate alloc;

use alloc::vec::Vec;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid filesystem image")]
    InvalidImage,
    #[error("corrupt filesystem image")]
    CorruptImage,
    #[error("cluster chain ends before the declared file size")]
    TruncatedChain,
    #[error("archive entry runs past the end of the archive")]
    TruncatedArchive,
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("mount table is full")]
    TableFull,
    #[error("no free volume slot")]
    NoFreeSlot,
    #[error("drive letter already mounted")]
    DuplicateLetter,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("no persisted image on device")]
    NoPersistedImage,
    #[error("invalid path")]
    InvalidPath,
    #[error("invalid file name")]
    InvalidName,
    #[error("no space left on volume")]
    NoSpace,
    #[error("read-only backing store")]
    ReadOnly,
    #[error("access beyond the end of the device")]
    OutOfRange,
    #[error("block device I/O error")]
    Io,
}

pub type FsResult<T> = core::result::Result<T, FsError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Char,
}

pub const MAX_NAME_LEN: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u16,
}

impl Metadata {
    pub const fn new(file_type: FileType, size: u64, mode: u16) -> Self {
        Self { file_type, size, mode }
    }

    pub const fn file(size: u64) -> Self {
        Self::new(FileType::File, size, 0o644)
    }

    pub const fn dir() -> Self {
        Self::new(FileType::Dir, 0, 0o755)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// Operations every backend exposes to the VFS router.
///
/// Paths are absolute and relative to the backend's own root. Mutating
/// operations default to [`FsError::Unsupported`] so read-only backends only
/// implement the lookup side.
pub trait FileSystem {
    /// Calls `visit` once per direct child of `path` and returns the count.
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize>;

    /// Returns the whole file; the caller owns the buffer.
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;

    fn metadata(&self, path: &str) -> FsResult<Metadata>;

    fn write_file(&self, _path: &str, _data: &[u8]) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn create_file(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn unlink(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn make_dir(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    fn remove_dir(&self, _path: &str) -> FsResult<()> {
        Err(FsError::Unsupported)
    }

    /// Reports one human-readable line per backing volume.
    fn list_mounts(&self, _visit: &mut dyn FnMut(&str)) -> usize {
        0
    }
}

/// Splits `path` into its non-empty components, skipping `.`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty() && *part != ".")
}

/// Splits an absolute path into parent path and final name.
pub fn split_parent(path: &str) -> FsResult<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath);
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidPath);
    }
    let split = trimmed.rfind('/').ok_or(FsError::InvalidPath)?;
    let (parent, name) = trimmed.split_at(split);
    let name = &name[1..];
    if name.is_empty() || name == "." || name == ".." || name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidPath);
    }
    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_paths() {
        assert_eq!(split_parent("/a/b"), Ok(("/a", "b")));
        assert_eq!(split_parent("/a/"), Ok(("/", "a")));
        assert_eq!(split_parent("/"), Err(FsError::InvalidPath));
        assert_eq!(split_parent("a"), Err(FsError::InvalidPath));
        assert_eq!(split_parent("/a/.."), Err(FsError::InvalidPath));
    }

    #[test]
    fn components_skip_empty_and_dot() {
        let mut parts = components("//a/./b/");
        assert_eq!(parts.next(), Some("a"));
        assert_eq!(parts.next(), Some("b"));
        assert_eq!(parts.next(), None);
    }
}
