//! Boot module lookup and backing-store selection for image filesystems.

use alloc::vec::Vec;
use hvfs::{FsError, FsResult};
use log::debug;

use crate::block::{BlockDevice, BlockId, ImageDevice};

/// Higher-half direct map translation handed over by the bootloader.
///
/// This is the only place that turns a physical address into a kernel
/// pointer; backends never add the offset themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hhdm {
    offset: u64,
}

impl Hhdm {
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    pub const fn identity() -> Self {
        Self { offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Maps `addr` into the direct map. Addresses already at or above the
    /// offset are treated as virtual and returned unchanged.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        if addr >= self.offset {
            Some(addr)
        } else {
            addr.checked_add(self.offset)
        }
    }
}

/// Module entry as reported by the bootloader.
#[derive(Clone, Copy, Debug)]
pub struct RawModule<'a> {
    pub name: &'a str,
    pub addr: u64,
    pub size: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct BootModule<'a> {
    pub name: &'a str,
    pub bytes: &'a [u8],
}

/// Named blobs supplied once at boot.
#[derive(Default)]
pub struct BootModules<'a> {
    modules: Vec<BootModule<'a>>,
}

impl<'a> BootModules<'a> {
    pub fn new(modules: Vec<BootModule<'a>>) -> Self {
        Self { modules }
    }

    /// Builds the list from bootloader records.
    ///
    /// # Safety
    ///
    /// Every record must describe `size` readable bytes at `addr` that stay
    /// mapped and unmodified for `'a`.
    pub unsafe fn from_raw(raw: &[RawModule<'a>], hhdm: &Hhdm) -> FsResult<Self> {
        let mut modules = Vec::with_capacity(raw.len());
        for module in raw {
            let virt = hhdm.translate(module.addr).ok_or(FsError::InvalidImage)?;
            if virt == 0 {
                return Err(FsError::InvalidImage);
            }
            // SAFETY: the caller guarantees the region is mapped for 'a.
            let bytes = unsafe { core::slice::from_raw_parts(virt as usize as *const u8, module.size) };
            modules.push(BootModule {
                name: module.name,
                bytes,
            });
        }
        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BootModule<'a>> {
        self.modules.iter()
    }

    /// Finds a module by exact name, falling back to the first module whose
    /// name ends with `name` (bootloaders often report full paths).
    pub fn find(&self, name: &str) -> FsResult<&'a [u8]> {
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        let found = self
            .modules
            .iter()
            .find(|module| module.name == name)
            .or_else(|| self.modules.iter().find(|module| module.name.ends_with(name)))
            .ok_or(FsError::NotFound)?;
        debug!("image: module {} -> {} ({} bytes)", name, found.name, found.bytes.len());
        Ok(found.bytes)
    }
}

/// Backing store of an image-based filesystem.
pub enum ImageSource<'a> {
    Memory(ImageDevice<'a>),
    Device(&'a dyn BlockDevice),
}

impl<'a> ImageSource<'a> {
    pub fn as_block_device(&self) -> &dyn BlockDevice {
        match self {
            Self::Memory(dev) => dev,
            Self::Device(dev) => *dev,
        }
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Memory(ImageDevice::new(bytes))
    }
}

impl<'a> From<&'a dyn BlockDevice> for ImageSource<'a> {
    fn from(device: &'a dyn BlockDevice) -> Self {
        Self::Device(device)
    }
}

impl BlockDevice for ImageSource<'_> {
    fn block_size(&self) -> usize {
        self.as_block_device().block_size()
    }

    fn num_blocks(&self) -> FsResult<u64> {
        self.as_block_device().num_blocks()
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        self.as_block_device().read_block(block_id, buf)
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
        self.as_block_device().write_block(block_id, buf)
    }

    fn flush(&self) -> FsResult<()> {
        self.as_block_device().flush()
    }

    fn is_read_only(&self) -> bool {
        self.as_block_device().is_read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn hhdm_translation() {
        let hhdm = Hhdm::new(0xffff_8000_0000_0000);
        assert_eq!(hhdm.translate(0x1000), Some(0xffff_8000_0000_1000));
        assert_eq!(hhdm.translate(0xffff_8000_0000_2000), Some(0xffff_8000_0000_2000));
        assert_eq!(Hhdm::identity().translate(0x1234), Some(0x1234));
    }

    #[test]
    fn find_module_exact_then_suffix() {
        let fat = [1u8; 4];
        let initrd = [2u8; 4];
        let exact = [3u8; 4];
        let modules = BootModules::new(vec![
            BootModule {
                name: "/boot/fat32.img",
                bytes: &fat,
            },
            BootModule {
                name: "/boot/initrd.tar",
                bytes: &initrd,
            },
            BootModule {
                name: "initrd.tar",
                bytes: &exact,
            },
        ]);
        assert_eq!(modules.find("fat32.img").unwrap(), &fat);
        assert_eq!(modules.find("initrd.tar").unwrap(), &exact);
        assert_eq!(modules.find("ext2.img"), Err(FsError::NotFound));
        assert_eq!(modules.find(""), Err(FsError::NotFound));
    }

    #[test]
    fn raw_modules_are_translated() {
        let blob = [9u8; 16];
        let raw = [RawModule {
            name: "blob",
            addr: blob.as_ptr() as u64,
            size: blob.len(),
        }];
        let modules = unsafe { BootModules::from_raw(&raw, &Hhdm::identity()) }.unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules.find("blob").unwrap(), &blob);
    }

    #[test]
    fn memory_source_is_read_only() {
        let image = [0u8; 1024];
        let source = ImageSource::from(&image[..]);
        assert!(source.is_read_only());
        assert_eq!(source.num_blocks(), Ok(2));
    }
}
