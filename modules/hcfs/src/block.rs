use alloc::vec;
use alloc::vec::Vec;
use hvfs::{FsError, FsResult};
use log::{info, warn};
use spin::{Mutex, Once};

use crate::config::SECTOR_SIZE;

pub type BlockId = u64;

pub trait BlockDevice {
    fn block_size(&self) -> usize;
    fn num_blocks(&self) -> FsResult<u64>;
    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()>;
    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()>;
    fn flush(&self) -> FsResult<()>;

    fn is_read_only(&self) -> bool {
        false
    }
}

/// Reads the 512-byte sector at `lba`, whatever the device block size.
pub fn read_sector(device: &dyn BlockDevice, lba: u64) -> FsResult<[u8; SECTOR_SIZE]> {
    let mut sector = [0u8; SECTOR_SIZE];
    let offset = lba.checked_mul(SECTOR_SIZE as u64).ok_or(FsError::OutOfRange)?;
    BlockCache::new(device).read_bytes(offset, &mut sector)?;
    Ok(sector)
}

pub fn write_sector(device: &dyn BlockDevice, lba: u64, sector: &[u8; SECTOR_SIZE]) -> FsResult<()> {
    let offset = lba.checked_mul(SECTOR_SIZE as u64).ok_or(FsError::OutOfRange)?;
    BlockCache::new(device).write_bytes(offset, sector)
}

/// Byte-addressed view over a block device.
///
/// Every access is checked against the device capacity before any block is
/// touched, so callers can hand it offsets taken straight from untrusted
/// on-disk structures.
pub struct BlockCache<'a> {
    device: &'a dyn BlockDevice,
    block_size: usize,
}

impl<'a> BlockCache<'a> {
    pub fn new(device: &'a dyn BlockDevice) -> Self {
        let block_size = device.block_size();
        Self { device, block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> FsResult<u64> {
        self.device.num_blocks()
    }

    /// Device size in bytes.
    pub fn capacity(&self) -> FsResult<u64> {
        Ok(self.num_blocks()?.saturating_mul(self.block_size as u64))
    }

    pub fn is_read_only(&self) -> bool {
        self.device.is_read_only()
    }

    pub fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        if buf.len() < self.block_size {
            return Err(FsError::OutOfRange);
        }
        if block_id >= self.num_blocks()? {
            return Err(FsError::OutOfRange);
        }
        self.device.read_block(block_id, &mut buf[..self.block_size])
    }

    pub fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
        if buf.len() < self.block_size {
            return Err(FsError::OutOfRange);
        }
        if block_id >= self.num_blocks()? {
            return Err(FsError::OutOfRange);
        }
        self.device.write_block(block_id, &buf[..self.block_size])
    }

    pub fn flush(&self) -> FsResult<()> {
        self.device.flush()
    }

    fn check_range(&self, offset: u64, len: usize) -> FsResult<()> {
        let end = offset.checked_add(len as u64).ok_or(FsError::OutOfRange)?;
        if end > self.capacity()? {
            return Err(FsError::OutOfRange);
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        self.check_range(offset, buf.len())?;
        let block_size = self.block_size as u64;
        let mut scratch = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let in_block = (pos % block_size) as usize;
            let chunk = core::cmp::min(buf.len() - done, self.block_size - in_block);
            if in_block == 0 && chunk == self.block_size {
                self.read_block(block, &mut buf[done..done + chunk])?;
            } else {
                self.read_block(block, &mut scratch)?;
                buf[done..done + chunk].copy_from_slice(&scratch[in_block..in_block + chunk]);
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_bytes(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> FsResult<()> {
        self.check_range(offset, buf.len())?;
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let block_size = self.block_size as u64;
        let mut scratch = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_size;
            let in_block = (pos % block_size) as usize;
            let chunk = core::cmp::min(buf.len() - done, self.block_size - in_block);
            if in_block == 0 && chunk == self.block_size {
                self.write_block(block, &buf[done..done + chunk])?;
            } else {
                self.read_block(block, &mut scratch)?;
                scratch[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.write_block(block, &scratch)?;
            }
            done += chunk;
        }
        Ok(())
    }
}

/// Read-only device over an image already resident in memory.
///
/// A trailing partial sector is not addressable.
#[derive(Clone, Copy)]
pub struct ImageDevice<'a> {
    image: &'a [u8],
}

impl<'a> ImageDevice<'a> {
    pub const fn new(image: &'a [u8]) -> Self {
        Self { image }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.image
    }
}

impl BlockDevice for ImageDevice<'_> {
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_blocks(&self) -> FsResult<u64> {
        Ok((self.image.len() / SECTOR_SIZE) as u64)
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        let offset = usize::try_from(block_id)
            .ok()
            .and_then(|id| id.checked_mul(SECTOR_SIZE))
            .ok_or(FsError::OutOfRange)?;
        let sector = self
            .image
            .get(offset..offset.saturating_add(SECTOR_SIZE))
            .ok_or(FsError::OutOfRange)?;
        buf.get_mut(..SECTOR_SIZE)
            .ok_or(FsError::OutOfRange)?
            .copy_from_slice(sector);
        Ok(())
    }

    fn write_block(&self, _block_id: BlockId, _buf: &[u8]) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// Writable in-memory disk.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors * SECTOR_SIZE]),
        }
    }

    /// Wraps an existing image, zero-extending it to a whole number of sectors.
    pub fn from_vec(mut data: Vec<u8>) -> Self {
        let rem = data.len() % SECTOR_SIZE;
        if rem != 0 {
            data.resize(data.len() + SECTOR_SIZE - rem, 0);
        }
        Self {
            data: Mutex::new(data),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn range(&self, block_id: BlockId, len: usize) -> FsResult<core::ops::Range<usize>> {
        let start = usize::try_from(block_id)
            .ok()
            .and_then(|id| id.checked_mul(SECTOR_SIZE))
            .ok_or(FsError::OutOfRange)?;
        if start.saturating_add(SECTOR_SIZE) > len {
            return Err(FsError::OutOfRange);
        }
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_blocks(&self) -> FsResult<u64> {
        Ok((self.data.lock().len() / SECTOR_SIZE) as u64)
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        let data = self.data.lock();
        let range = self.range(block_id, data.len())?;
        buf.get_mut(..SECTOR_SIZE)
            .ok_or(FsError::OutOfRange)?
            .copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
        let mut data = self.data.lock();
        let range = self.range(block_id, data.len())?;
        data[range].copy_from_slice(buf.get(..SECTOR_SIZE).ok_or(FsError::OutOfRange)?);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }
}

/// Raw sector driver, e.g. an ATA PIO channel.
pub trait SectorDriver {
    /// Detects the drive and returns its size in sectors.
    fn probe(&self) -> FsResult<u64>;
    fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> FsResult<()>;
    fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> FsResult<()>;
}

/// Block device that probes its driver on first use.
///
/// The probe outcome is remembered, including failure, so a missing drive
/// costs one probe rather than one per access.
pub struct ProbedDevice<D> {
    driver: D,
    probe: Once<FsResult<u64>>,
}

impl<D: SectorDriver> ProbedDevice<D> {
    pub const fn new(driver: D) -> Self {
        Self {
            driver,
            probe: Once::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn sectors(&self) -> FsResult<u64> {
        *self.probe.call_once(|| match self.driver.probe() {
            Ok(sectors) => {
                info!("block: drive ready, {} sectors", sectors);
                Ok(sectors)
            }
            Err(err) => {
                warn!("block: drive probe failed: {}", err);
                Err(FsError::Io)
            }
        })
    }

    fn lba(&self, block_id: BlockId) -> FsResult<u32> {
        if block_id >= self.sectors()? {
            return Err(FsError::OutOfRange);
        }
        u32::try_from(block_id).map_err(|_| FsError::OutOfRange)
    }
}

impl<D: SectorDriver> BlockDevice for ProbedDevice<D> {
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_blocks(&self) -> FsResult<u64> {
        self.sectors()
    }

    fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
        let lba = self.lba(block_id)?;
        let sector: &mut [u8; SECTOR_SIZE] = buf
            .get_mut(..SECTOR_SIZE)
            .and_then(|buf| buf.try_into().ok())
            .ok_or(FsError::OutOfRange)?;
        self.driver.read_sector(lba, sector)
    }

    fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
        let lba = self.lba(block_id)?;
        let sector: &[u8; SECTOR_SIZE] = buf
            .get(..SECTOR_SIZE)
            .and_then(|buf| buf.try_into().ok())
            .ok_or(FsError::OutOfRange)?;
        self.driver.write_sector(lba, sector)
    }

    fn flush(&self) -> FsResult<()> {
        self.sectors().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct TestBlockDevice {
        block_size: usize,
        data: RefCell<[u8; 8]>,
    }

    impl BlockDevice for TestBlockDevice {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn num_blocks(&self) -> FsResult<u64> {
            Ok((self.data.borrow().len() / self.block_size) as u64)
        }

        fn read_block(&self, block_id: BlockId, buf: &mut [u8]) -> FsResult<()> {
            let offset = block_id as usize * self.block_size;
            let data = self.data.borrow();
            buf[..self.block_size].copy_from_slice(&data[offset..offset + self.block_size]);
            Ok(())
        }

        fn write_block(&self, block_id: BlockId, buf: &[u8]) -> FsResult<()> {
            let offset = block_id as usize * self.block_size;
            let mut data = self.data.borrow_mut();
            data[offset..offset + self.block_size].copy_from_slice(&buf[..self.block_size]);
            Ok(())
        }

        fn flush(&self) -> FsResult<()> {
            Ok(())
        }
    }

    #[test]
    fn block_cache_passthrough() {
        let dev = TestBlockDevice {
            block_size: 4,
            data: RefCell::new([0u8; 8]),
        };
        let cache = BlockCache::new(&dev);
        let buf = [1u8, 2, 3, 4];
        cache.write_block(1, &buf).unwrap();
        let mut read = [0u8; 4];
        cache.read_block(1, &mut read).unwrap();
        assert_eq!(read, buf);
        assert_eq!(cache.read_block(2, &mut read), Err(FsError::OutOfRange));
    }

    #[test]
    fn byte_access_spans_blocks() {
        let dev = TestBlockDevice {
            block_size: 4,
            data: RefCell::new([0u8; 8]),
        };
        let cache = BlockCache::new(&dev);
        cache.write_bytes(2, &[9, 8, 7, 6]).unwrap();
        assert_eq!(*dev.data.borrow(), [0, 0, 9, 8, 7, 6, 0, 0]);
        let mut buf = [0u8; 3];
        cache.read_bytes(3, &mut buf).unwrap();
        assert_eq!(buf, [8, 7, 6]);
        assert_eq!(cache.read_bytes(6, &mut buf), Err(FsError::OutOfRange));
        assert_eq!(cache.read_bytes(u64::MAX, &mut buf), Err(FsError::OutOfRange));
    }

    #[test]
    fn image_device_is_read_only() {
        let image = [0x5au8; 1024 + 100];
        let dev = ImageDevice::new(&image);
        assert_eq!(dev.num_blocks(), Ok(2));
        let cache = BlockCache::new(&dev);
        let mut buf = [0u8; 4];
        cache.read_bytes(1020, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 4]);
        assert_eq!(cache.read_bytes(1100, &mut buf), Err(FsError::OutOfRange));
        assert_eq!(cache.write_bytes(0, &buf), Err(FsError::ReadOnly));
    }

    #[test]
    fn ram_disk_pads_to_sector() {
        let disk = RamDisk::from_vec(vec![1u8; 700]);
        assert_eq!(disk.num_blocks(), Ok(2));
        let cache = BlockCache::new(&disk);
        cache.write_bytes(510, &[7, 7, 7, 7]).unwrap();
        let image = disk.to_vec();
        assert_eq!(&image[508..514], &[1, 1, 7, 7, 7, 7]);
        assert_eq!(image[1023], 0);
    }

    #[test]
    fn sector_helpers() {
        let disk = RamDisk::new(4);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xaa;
        sector[511] = 0x55;
        write_sector(&disk, 3, &sector).unwrap();
        assert_eq!(read_sector(&disk, 3).unwrap(), sector);
        assert_eq!(read_sector(&disk, 4), Err(FsError::OutOfRange));
    }

    struct FakeDrive {
        present: bool,
        probes: AtomicUsize,
        sectors: RefCell<[[u8; SECTOR_SIZE]; 4]>,
    }

    impl FakeDrive {
        fn new(present: bool) -> Self {
            Self {
                present,
                probes: AtomicUsize::new(0),
                sectors: RefCell::new([[0u8; SECTOR_SIZE]; 4]),
            }
        }
    }

    impl SectorDriver for FakeDrive {
        fn probe(&self) -> FsResult<u64> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            if self.present {
                Ok(4)
            } else {
                Err(FsError::Io)
            }
        }

        fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> FsResult<()> {
            *buf = self.sectors.borrow()[lba as usize];
            Ok(())
        }

        fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> FsResult<()> {
            self.sectors.borrow_mut()[lba as usize] = *buf;
            Ok(())
        }
    }

    #[test]
    fn probe_runs_lazily_once() {
        let dev = ProbedDevice::new(FakeDrive::new(true));
        assert_eq!(dev.driver().probes.load(Ordering::Relaxed), 0);
        let sector = [3u8; SECTOR_SIZE];
        dev.write_block(2, &sector).unwrap();
        let mut read = [0u8; SECTOR_SIZE];
        dev.read_block(2, &mut read).unwrap();
        assert_eq!(read, sector);
        assert_eq!(dev.read_block(4, &mut read), Err(FsError::OutOfRange));
        assert_eq!(dev.driver().probes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_probe_is_sticky() {
        let dev = ProbedDevice::new(FakeDrive::new(false));
        let mut read = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read_block(0, &mut read), Err(FsError::Io));
        assert_eq!(dev.read_block(0, &mut read), Err(FsError::Io));
        assert_eq!(dev.num_blocks(), Err(FsError::Io));
        assert_eq!(dev.driver().probes.load(Ordering::Relaxed), 1);
    }
}
