use alloc::vec;
use alloc::vec::Vec;

use crate::device::{Error, FlashDevice, FlashDeviceInfo, Result};

/// RAM-backed flash emulation.
///
/// Writes land immediately (`flush` is a no-op) and `erase` fills the
/// block with the device's erase value. When `program_unit` is greater
/// than one, unaligned writes are rejected the way real NOR controllers
/// reject them; devices needing byte-granular writes on top of that go
/// through `BufferedFlash`.
pub struct RamFlash {
    info: FlashDeviceInfo,
    data: Vec<u8>,
}

impl RamFlash {
    pub fn new(info: FlashDeviceInfo) -> Self {
        let data = vec![info.erase_val; info.block_size * info.num_blocks as usize];
        Self { info, data }
    }

    /// Restores a device from a previously captured [`image`](Self::image).
    /// Fails if the image length does not match the geometry.
    pub fn from_image(info: FlashDeviceInfo, image: &[u8]) -> Result<Self> {
        if image.len() != info.block_size * info.num_blocks as usize {
            return Err(Error);
        }
        Ok(Self {
            info,
            data: image.to_vec(),
        })
    }

    /// Raw contents of the whole device, block 0 first.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    fn span(&self, block: u32, offset: usize, len: usize) -> Result<core::ops::Range<usize>> {
        if block >= self.info.num_blocks {
            return Err(Error);
        }
        let end = offset.checked_add(len).ok_or(Error)?;
        if end > self.info.block_size {
            return Err(Error);
        }
        let base = block as usize * self.info.block_size;
        Ok(base + offset..base + end)
    }
}

impl FlashDevice for RamFlash {
    fn info(&self) -> &FlashDeviceInfo {
        &self.info
    }

    fn init(&mut self) -> Result {
        Ok(())
    }

    fn read(&mut self, block: u32, offset: usize, buf: &mut [u8]) -> Result {
        let span = self.span(block, offset, buf.len())?;
        buf.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write(&mut self, block: u32, offset: usize, data: &[u8]) -> Result {
        let unit = self.info.program_unit;
        if unit > 1 && (offset % unit != 0 || data.len() % unit != 0) {
            warn!("unaligned write: block {} offset {}", block, offset);
            return Err(Error);
        }
        let span = self.span(block, offset, data.len())?;
        self.data[span].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result {
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result {
        let span = self.span(block, 0, self.info.block_size)?;
        self.data[span].fill(self.info.erase_val);
        Ok(())
    }
}
