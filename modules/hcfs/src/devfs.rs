//! Device filesystem with a fixed set of character nodes.

use alloc::vec::Vec;
use hvfs::{FileSystem, FileType, FsError, FsResult, Metadata};

const DEV_PREFIX: &str = "/dev";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Device {
    Console,
    Null,
    Tty,
    Disk,
    Zero,
}

#[derive(Clone, Copy)]
struct Node {
    name: &'static str,
    device: Device,
    mode: u16,
}

const NODES: [Node; 6] = [
    Node {
        name: "console",
        device: Device::Console,
        mode: 0o620,
    },
    Node {
        name: "null",
        device: Device::Null,
        mode: 0o666,
    },
    Node {
        name: "tty0",
        device: Device::Tty,
        mode: 0o620,
    },
    Node {
        name: "hda",
        device: Device::Disk,
        mode: 0o660,
    },
    Node {
        name: "sda",
        device: Device::Disk,
        mode: 0o660,
    },
    Node {
        name: "zero",
        device: Device::Zero,
        mode: 0o666,
    },
];

/// `/dev`. Paths are taken relative to the mount point, with or without a
/// leading `/dev`.
#[derive(Default)]
pub struct DevFs;

impl DevFs {
    pub const fn new() -> Self {
        Self
    }

    fn node(&self, path: &str) -> FsResult<Option<&'static Node>> {
        let path = strip_dev(path);
        let name = path.trim_matches('/');
        if name.is_empty() {
            return Ok(None);
        }
        NODES
            .iter()
            .find(|node| node.name == name)
            .map(Some)
            .ok_or(FsError::NotFound)
    }
}

impl FileSystem for DevFs {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        if self.node(path)?.is_some() {
            return Err(FsError::NotADirectory);
        }
        for node in NODES.iter() {
            visit(node.name);
        }
        Ok(NODES.len())
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let node = self.node(path)?.ok_or(FsError::IsADirectory)?;
        match node.device {
            Device::Console => Ok(b"console\n".to_vec()),
            Device::Null | Device::Zero => Ok(Vec::new()),
            Device::Tty | Device::Disk => Err(FsError::Unsupported),
        }
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        match self.node(path)? {
            Some(node) => Ok(Metadata::new(FileType::Char, 0, node.mode)),
            None => Ok(Metadata::dir()),
        }
    }

    fn write_file(&self, path: &str, _data: &[u8]) -> FsResult<()> {
        let node = self.node(path)?.ok_or(FsError::IsADirectory)?;
        match node.device {
            Device::Null | Device::Zero => Ok(()),
            _ => Err(FsError::Unsupported),
        }
    }
}

fn strip_dev(path: &str) -> &str {
    match path.strip_prefix(DEV_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::{String, ToString};

    #[test]
    fn list_fixed_nodes() {
        let mut names: Vec<String> = Vec::new();
        let count = DevFs::new()
            .list_dir("/", &mut |name| names.push(name.to_string()))
            .unwrap();
        assert_eq!(count, 6);
        assert_eq!(names, ["console", "null", "tty0", "hda", "sda", "zero"]);
        assert_eq!(DevFs.list_dir("/null", &mut |_| {}), Err(FsError::NotADirectory));
    }

    #[test]
    fn read_and_write_nodes() {
        let dev = DevFs::new();
        assert_eq!(dev.read_file("/console").unwrap(), b"console\n");
        assert_eq!(dev.read_file("/dev/console").unwrap(), b"console\n");
        assert!(dev.read_file("/null").unwrap().is_empty());
        assert!(dev.read_file("/zero").unwrap().is_empty());
        assert_eq!(dev.read_file("/nope"), Err(FsError::NotFound));
        assert_eq!(dev.write_file("/null", b"discard"), Ok(()));
        assert_eq!(dev.write_file("/console", b"x"), Err(FsError::Unsupported));
        assert_eq!(dev.create_file("/new"), Err(FsError::Unsupported));
    }

    #[test]
    fn node_metadata() {
        let dev = DevFs::new();
        assert!(dev.metadata("/").unwrap().is_dir());
        let null = dev.metadata("/null").unwrap();
        assert_eq!(null.file_type, FileType::Char);
        assert_eq!(null.mode, 0o666);
        assert_eq!(dev.metadata("/devices"), Err(FsError::NotFound));
    }
}
