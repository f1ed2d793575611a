//! Minimal procfs with a handful of diagnostic files.

use alloc::string::String;
use alloc::vec::Vec;
use hvfs::{FileSystem, FileType, FsError, FsResult, Metadata};
use spin::Mutex;

const PROC_PREFIX: &str = "/proc";
const CPUINFO: &str = "HanaCore CPU: 1 core\n";
const MEMINFO: &str = "MemTotal: minimal\nMemFree: unknown\n";
const SELF: &str = "1\n";

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProcFile {
    CpuInfo,
    MemInfo,
    SelfPid,
    Mounts,
}

const ENTRIES: [(&str, ProcFile); 4] = [
    ("cpuinfo", ProcFile::CpuInfo),
    ("meminfo", ProcFile::MemInfo),
    ("self", ProcFile::SelfPid),
    ("mounts", ProcFile::Mounts),
];

/// `/proc`. The `mounts` file shows whatever snapshot was last handed to
/// [`ProcFs::set_mounts`].
pub struct ProcFs {
    mounts: Mutex<String>,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub const fn new() -> Self {
        Self {
            mounts: Mutex::new(String::new()),
        }
    }

    pub fn set_mounts(&self, snapshot: &str) {
        let mut mounts = self.mounts.lock();
        mounts.clear();
        mounts.push_str(snapshot);
    }

    fn file(&self, path: &str) -> FsResult<Option<ProcFile>> {
        let path = match path.strip_prefix(PROC_PREFIX) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        };
        let name = path.trim_matches('/');
        if name.is_empty() {
            return Ok(None);
        }
        ENTRIES
            .iter()
            .find(|(entry, _)| *entry == name)
            .map(|(_, file)| Some(*file))
            .ok_or(FsError::NotFound)
    }

    fn contents(&self, file: ProcFile) -> Vec<u8> {
        match file {
            ProcFile::CpuInfo => CPUINFO.as_bytes().to_vec(),
            ProcFile::MemInfo => MEMINFO.as_bytes().to_vec(),
            ProcFile::SelfPid => SELF.as_bytes().to_vec(),
            ProcFile::Mounts => self.mounts.lock().as_bytes().to_vec(),
        }
    }
}

impl FileSystem for ProcFs {
    fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        if self.file(path)?.is_some() {
            return Err(FsError::NotADirectory);
        }
        for (name, _) in ENTRIES.iter() {
            visit(name);
        }
        Ok(ENTRIES.len())
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let file = self.file(path)?.ok_or(FsError::IsADirectory)?;
        Ok(self.contents(file))
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        match self.file(path)? {
            Some(file) => Ok(Metadata::new(FileType::File, self.contents(file).len() as u64, 0o444)),
            None => Ok(Metadata::dir()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn list_and_read() {
        let proc = ProcFs::new();
        let mut names = Vec::new();
        assert_eq!(proc.list_dir("/", &mut |name| names.push(name.to_string())), Ok(4));
        assert_eq!(names, ["cpuinfo", "meminfo", "self", "mounts"]);
        assert_eq!(proc.read_file("/cpuinfo").unwrap(), b"HanaCore CPU: 1 core\n");
        assert_eq!(proc.read_file("/proc/meminfo").unwrap(), MEMINFO.as_bytes());
        assert_eq!(proc.read_file("self").unwrap(), b"1\n");
        assert_eq!(proc.read_file("/"), Err(FsError::IsADirectory));
        assert_eq!(proc.read_file("/version"), Err(FsError::NotFound));
    }

    #[test]
    fn mounts_snapshot() {
        let proc = ProcFs::new();
        assert!(proc.read_file("/mounts").unwrap().is_empty());
        proc.set_mounts("VFS mount: [procfs -> /proc]\n");
        assert_eq!(proc.read_file("/mounts").unwrap(), b"VFS mount: [procfs -> /proc]\n");
        assert_eq!(proc.metadata("/mounts").unwrap().size, 29);
        assert_eq!(proc.write_file("/mounts", b"x"), Err(FsError::Unsupported));
    }
}
