//! VFS router: mount table plus name-based backend dispatch.
//!
//! A path goes to the first mount, in registration order, whose mountpoint
//! equals the path or is followed by `/` in it. The root mount therefore
//! only claims `/` itself; everything else that no mount claims is tried
//! against the fallback backends in [`VfsConfig::fallback_order`].

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use hvfs::{FileSystem, FsError, FsResult, Metadata};
use log::{debug, info};
use spin::Mutex;

use crate::config::{VfsConfig, MAX_MOUNTS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub fsname: String,
    pub mountpoint: String,
}

struct Backend<'a> {
    name: String,
    fs: &'a dyn FileSystem,
}

#[derive(Default)]
struct MountTable<'a> {
    mounts: Vec<MountEntry>,
    backends: Vec<Backend<'a>>,
}

impl<'a> MountTable<'a> {
    fn backend(&self, name: &str) -> Option<&'a dyn FileSystem> {
        self.backends
            .iter()
            .find(|backend| backend.name == name)
            .map(|backend| backend.fs)
    }

    fn find_mount<'p>(&self, path: &'p str) -> Option<(&MountEntry, &'p str)> {
        self.mounts.iter().find_map(|mount| {
            match_mount_path(&mount.mountpoint, path).map(|rel| (mount, rel))
        })
    }
}

enum Route<'a, 'p> {
    Mounted(Option<&'a dyn FileSystem>, &'p str),
    Fallback(Vec<&'a dyn FileSystem>),
}

pub struct Vfs<'a> {
    config: VfsConfig,
    table: Mutex<MountTable<'a>>,
}

impl Default for Vfs<'_> {
    fn default() -> Self {
        Self::new(VfsConfig::default())
    }
}

impl<'a> Vfs<'a> {
    pub fn new(config: VfsConfig) -> Self {
        Self {
            config,
            table: Mutex::new(MountTable::default()),
        }
    }

    /// Binds `fsname` to a backend instance, replacing an earlier binding.
    pub fn attach(&self, fsname: &str, fs: &'a dyn FileSystem) {
        let mut table = self.table.lock();
        match table.backends.iter_mut().find(|backend| backend.name == fsname) {
            Some(backend) => backend.fs = fs,
            None => table.backends.push(Backend {
                name: String::from(fsname),
                fs,
            }),
        }
    }

    pub fn register_mount(&self, fsname: &str, mountpoint: &str) -> FsResult<()> {
        if fsname.is_empty() || !mountpoint.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let trimmed = mountpoint.trim_end_matches('/');
        let mountpoint = if trimmed.is_empty() { "/" } else { trimmed };
        let mut table = self.table.lock();
        if table.mounts.len() >= MAX_MOUNTS {
            return Err(FsError::TableFull);
        }
        table.mounts.push(MountEntry {
            fsname: String::from(fsname),
            mountpoint: String::from(mountpoint),
        });
        info!("vfs: mounted {} at {}", fsname, mountpoint);
        Ok(())
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.table.lock().mounts.clone()
    }

    pub fn list_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        let lines: Vec<String> = self
            .table
            .lock()
            .mounts
            .iter()
            .map(|mount| format!("VFS mount: [{} -> {}]", mount.fsname, mount.mountpoint))
            .collect();
        for line in &lines {
            visit(line);
        }
        lines.len()
    }

    /// Mount lines, newline terminated, as shown by `/proc/mounts`.
    pub fn render_mounts(&self) -> String {
        let mut out = String::new();
        self.list_mounts(&mut |line| {
            out.push_str(line);
            out.push('\n');
        });
        out
    }

    /// Collects the per-volume lines every attached backend reports.
    pub fn list_backend_mounts(&self, visit: &mut dyn FnMut(&str)) -> usize {
        let backends: Vec<&'a dyn FileSystem> =
            self.table.lock().backends.iter().map(|backend| backend.fs).collect();
        backends.iter().map(|fs| fs.list_mounts(visit)).sum()
    }

    fn route<'p>(&self, path: &'p str) -> FsResult<Route<'a, 'p>> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let table = self.table.lock();
        if let Some((mount, rel)) = table.find_mount(path) {
            debug!("vfs: {} -> {} ({})", path, mount.fsname, rel);
            return Ok(Route::Mounted(table.backend(&mount.fsname), rel));
        }
        let fallbacks = self
            .config
            .fallback_order
            .iter()
            .filter_map(|name| table.backend(name))
            .collect();
        Ok(Route::Fallback(fallbacks))
    }

    /// Runs a lookup on the owning backend, or on each fallback until one
    /// succeeds.
    fn lookup<R>(
        &self,
        path: &str,
        mut op: impl FnMut(&dyn FileSystem, &str) -> FsResult<R>,
    ) -> FsResult<R> {
        match self.route(path)? {
            Route::Mounted(Some(fs), rel) => op(fs, rel),
            Route::Mounted(None, _) => Err(FsError::NotFound),
            Route::Fallback(fallbacks) => fallbacks
                .into_iter()
                .find_map(|fs| op(fs, path).ok())
                .ok_or(FsError::NotFound),
        }
    }

    /// Runs a mutation on the owning backend, or on the first fallback.
    fn mutate(&self, path: &str, op: impl FnOnce(&dyn FileSystem, &str) -> FsResult<()>) -> FsResult<()> {
        match self.route(path)? {
            Route::Mounted(Some(fs), rel) => op(fs, rel),
            Route::Mounted(None, _) => Err(FsError::NotFound),
            Route::Fallback(fallbacks) => {
                let fs = fallbacks.first().ok_or(FsError::NotFound)?;
                op(*fs, path)
            }
        }
    }

    pub fn list_dir(&self, path: &str, visit: &mut dyn FnMut(&str)) -> FsResult<usize> {
        self.lookup(path, |fs, rel| fs.list_dir(rel, &mut *visit))
    }

    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.lookup(path, |fs, rel| fs.read_file(rel))
    }

    pub fn metadata(&self, path: &str) -> FsResult<Metadata> {
        self.lookup(path, |fs, rel| fs.metadata(rel))
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.mutate(path, |fs, rel| fs.write_file(rel, data))
    }

    pub fn create_file(&self, path: &str) -> FsResult<()> {
        self.mutate(path, |fs, rel| fs.create_file(rel))
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.mutate(path, |fs, rel| fs.unlink(rel))
    }

    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        self.mutate(path, |fs, rel| fs.make_dir(rel))
    }

    pub fn remove_dir(&self, path: &str) -> FsResult<()> {
        self.mutate(path, |fs, rel| fs.remove_dir(rel))
    }
}

/// Path relative to `mount_path` when the mount owns `path`.
fn match_mount_path<'p>(mount_path: &str, path: &'p str) -> Option<&'p str> {
    if path == mount_path {
        return Some("/");
    }
    let rest = path.strip_prefix(mount_path)?;
    if !rest.starts_with('/') {
        return None;
    }
    // The root mount hands the path over untouched.
    if mount_path == "/" {
        Some(path)
    } else {
        Some(rest)
    }
}
