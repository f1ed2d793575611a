//! HanaCore storage layer: block devices, image filesystems, HanaFS and the
//! VFS router that ties them together.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod block;
pub mod config;
pub mod devfs;
pub mod ext2;
pub mod fat32;
pub mod hanafs;
pub mod image;
pub mod initrd;
pub mod iso9660;
pub mod mount;
pub mod procfs;

pub use hvfs::{FileSystem, FileType, FsError, FsResult, Metadata};
