/// Chunk size of the bounce buffer used by [`block_to_block_move`].
pub const MOVE_BUF_SIZE: usize = 256;

/// A device operation failed. The layers above treat every driver error
/// the same way, so no further detail is carried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Geometry and limits of one physical flash device.
///
/// `block_size` is the logical erase-block size and must be a multiple of
/// `sector_size`. `program_unit` is the minimum aligned write granularity;
/// offsets and sizes handed to [`FlashDevice::write`] must respect it
/// unless the device buffers internally (see `BufferedFlash`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashDeviceInfo {
    /// Physical address the device is mapped at, for drivers that need it.
    pub base_addr: usize,
    pub sector_size: usize,
    pub block_size: usize,
    pub num_blocks: u32,
    pub program_unit: usize,
    /// Largest file the filesystem on this device may hold.
    pub max_file_size: usize,
    /// Number of slots in the filesystem's file table.
    pub max_num_files: u32,
    /// Byte value of erased flash, e.g. 0xff.
    pub erase_val: u8,
}

/// One raw flash device, addressed in logical erase blocks.
///
/// Callers guarantee that `block` is in range and that `offset` plus the
/// buffer length stays within one block; implementations may still check
/// and fail. Writes may be buffered per block, in which case they must be
/// committed by `flush` (a no-op if writes land immediately).
pub trait FlashDevice {
    fn info(&self) -> &FlashDeviceInfo;

    fn init(&mut self) -> Result;

    fn read(&mut self, block: u32, offset: usize, buf: &mut [u8]) -> Result;

    fn write(&mut self, block: u32, offset: usize, data: &[u8]) -> Result;

    fn flush(&mut self) -> Result;

    fn erase(&mut self, block: u32) -> Result;
}

/// Copies `len` bytes from `src_block`/`src_offset` to
/// `dst_block`/`dst_offset` through one on-stack bounce buffer.
///
/// Each chunk is read from the source and immediately written to the
/// destination before advancing, so at most [`MOVE_BUF_SIZE`] bytes are
/// in flight. This is the only data-movement primitive; compaction and
/// the metadata swap are both expressed in terms of it.
pub fn block_to_block_move<D: FlashDevice + ?Sized>(
    dev: &mut D,
    dst_block: u32,
    dst_offset: usize,
    src_block: u32,
    src_offset: usize,
    len: usize,
) -> Result {
    let mut buf = [0u8; MOVE_BUF_SIZE];
    let mut pos = 0;
    while pos < len {
        let chunk = (len - pos).min(MOVE_BUF_SIZE);
        dev.read(src_block, src_offset + pos, &mut buf[..chunk])?;
        dev.write(dst_block, dst_offset + pos, &buf[..chunk])?;
        pos += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RamFlash;

    fn info() -> FlashDeviceInfo {
        FlashDeviceInfo {
            base_addr: 0,
            sector_size: 512,
            block_size: 1024,
            num_blocks: 4,
            program_unit: 1,
            max_file_size: 256,
            max_num_files: 4,
            erase_val: 0xff,
        }
    }

    #[test]
    fn move_crosses_chunk_boundaries() {
        let mut dev = RamFlash::new(info());
        let data: std::vec::Vec<u8> = (0..600u16).map(|i| (i % 251) as u8).collect();
        dev.write(0, 100, &data).unwrap();

        block_to_block_move(&mut dev, 2, 40, 0, 100, data.len()).unwrap();

        let mut back = std::vec![0u8; data.len()];
        dev.read(2, 40, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn zero_length_move_is_a_noop() {
        let mut dev = RamFlash::new(info());
        block_to_block_move(&mut dev, 1, 0, 0, 0, 0).unwrap();
        let mut b = [0u8; 4];
        dev.read(1, 0, &mut b).unwrap();
        assert_eq!(b, [0xff; 4]);
    }
}
