use bitflags::bitflags;
use its_flash::FlashDeviceInfo;

use crate::error::{Error, Result};

/// Size of a file identifier in bytes.
pub const FILE_ID_SIZE: usize = 12;

/// On-flash format version understood by this implementation.
pub(crate) const SUPPORTED_FS_VERSION: u8 = 0x01;

/// Upper bound on the program unit, which also bounds the padding of the
/// on-flash metadata records. Devices with larger program pages must be
/// wrapped in a write-accumulation layer.
pub(crate) const MAX_ALIGN: usize = 256;

/// Physical ids of the two mirrored metadata blocks.
pub(crate) const METADATA_BLOCK0: u32 = 0;
pub(crate) const METADATA_BLOCK1: u32 = 1;

/// Initial physical id of the dedicated data scratch block (devices with
/// four or more blocks).
pub(crate) const INITIAL_DATA_SCRATCH: u32 = 2;

/// Logical block 0 lives inside the active metadata block.
pub(crate) const LOGICAL_BLOCK0: u32 = 0;

pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Fixed 12-byte object identifier. The all-zero id is reserved: it marks
/// a free slot in the on-flash file table and is rejected by the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId(pub [u8; FILE_ID_SIZE]);

impl FileId {
    pub(crate) const EMPTY: Self = Self([0; FILE_ID_SIZE]);

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<[u8; FILE_ID_SIZE]> for FileId {
    fn from(bytes: [u8; FILE_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

bitflags! {
    /// Creation flags stored in the file metadata.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// The file can never be rewritten or deleted.
        const WRITE_ONCE = 1 << 0;
    }
}

/// Header at offset 0 of each metadata block.
///
/// Packed little-endian as: scratch data-block physical id (u32), format
/// version (u8), active swap count (u8). The swap count is deliberately
/// the final byte: flash programs the buffer in ascending byte order, so
/// a torn header write leaves the swap count at the erase value and the
/// block is rejected on recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MetadataBlockHeader {
    pub scratch_dblock: u32,
    pub fs_version: u8,
    pub active_swap_count: u8,
}

impl MetadataBlockHeader {
    pub const PACKED_SIZE: usize = 6;

    pub fn pack(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.scratch_dblock.to_le_bytes());
        out[4] = self.fs_version;
        out[5] = self.active_swap_count;
    }

    pub fn unpack(raw: &[u8]) -> Self {
        Self {
            scratch_dblock: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            fs_version: raw[4],
            active_swap_count: raw[5],
        }
    }
}

/// Per-logical-block record: physical block id (u32), first byte of the
/// file data region (u32), free bytes at the tail (u32), little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockMeta {
    pub phy_id: u32,
    pub data_start: usize,
    pub free_size: usize,
}

impl BlockMeta {
    pub const PACKED_SIZE: usize = 12;

    pub fn pack(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.phy_id.to_le_bytes());
        out[4..8].copy_from_slice(&(self.data_start as u32).to_le_bytes());
        out[8..12].copy_from_slice(&(self.free_size as u32).to_le_bytes());
    }

    pub fn unpack(raw: &[u8]) -> Self {
        Self {
            phy_id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data_start: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize,
            free_size: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize,
        }
    }
}

/// Per-file record: id (12 bytes), logical block (u32), byte offset of
/// the data within the block (u32), current size (u32), reserved size
/// (u32), creation flags (u32), little-endian. A slot whose id is all
/// zeros is free; a freshly wiped table is explicitly written as zeros.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileMeta {
    pub id: FileId,
    pub lblock: u32,
    pub data_idx: usize,
    pub cur_size: usize,
    pub max_size: usize,
    pub flags: FileFlags,
}

impl FileMeta {
    pub const PACKED_SIZE: usize = 32;

    pub const EMPTY: Self = Self {
        id: FileId::EMPTY,
        lblock: 0,
        data_idx: 0,
        cur_size: 0,
        max_size: 0,
        flags: FileFlags::empty(),
    };

    pub fn pack(&self, out: &mut [u8]) {
        out[0..12].copy_from_slice(&self.id.0);
        out[12..16].copy_from_slice(&self.lblock.to_le_bytes());
        out[16..20].copy_from_slice(&(self.data_idx as u32).to_le_bytes());
        out[20..24].copy_from_slice(&(self.cur_size as u32).to_le_bytes());
        out[24..28].copy_from_slice(&(self.max_size as u32).to_le_bytes());
        out[28..32].copy_from_slice(&self.flags.bits().to_le_bytes());
    }

    pub fn unpack(raw: &[u8]) -> Self {
        let mut id = [0u8; FILE_ID_SIZE];
        id.copy_from_slice(&raw[0..12]);
        Self {
            id: FileId(id),
            lblock: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            data_idx: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]) as usize,
            cur_size: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]) as usize,
            max_size: u32::from_le_bytes([raw[24], raw[25], raw[26], raw[27]]) as usize,
            flags: FileFlags::from_bits_retain(u32::from_le_bytes([
                raw[28], raw[29], raw[30], raw[31],
            ])),
        }
    }
}

/// Offsets of the metadata area within a metadata block.
///
/// Metadata block layout, all records padded to the program unit:
/// header, BlockMeta x num_lblocks, FileMeta x max_files, then logical
/// block 0's file data up to the end of the block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    pub align: usize,
    pub block_size: usize,
    pub num_lblocks: u32,
    pub max_files: u32,
}

impl Layout {
    /// Validates the device geometry and computes the layout. Geometry
    /// is runtime data, so the integration checks run here instead of at
    /// build time.
    pub fn new(info: &FlashDeviceInfo) -> Result<Self> {
        let align = info.program_unit.max(1);
        if !align.is_power_of_two() || align > MAX_ALIGN {
            error!("unsupported program unit {}", info.program_unit);
            return Err(Error::InvalidArgument);
        }
        if info.sector_size == 0
            || info.block_size == 0
            || info.block_size % info.sector_size != 0
            || info.block_size % align != 0
            || info.block_size > u32::MAX as usize
        {
            error!("bad block geometry: {} / {}", info.block_size, info.sector_size);
            return Err(Error::InvalidArgument);
        }
        // minimum device is the mirrored metadata pair; three blocks would
        // leave a data block without a scratch partner
        if info.num_blocks < 2 || info.num_blocks == 3 {
            error!("unsupported block count {}", info.num_blocks);
            return Err(Error::InvalidArgument);
        }
        if info.max_num_files == 0 || info.max_file_size == 0 {
            return Err(Error::InvalidArgument);
        }

        let num_lblocks = if info.num_blocks == 2 {
            1
        } else {
            info.num_blocks - 2
        };
        let layout = Self {
            align,
            block_size: info.block_size,
            num_lblocks,
            max_files: info.max_num_files,
        };

        if layout.metadata_size() >= info.block_size {
            error!("metadata does not fit one block");
            return Err(Error::InvalidArgument);
        }
        let max_file = align_up(info.max_file_size, align);
        let lblock0_capacity = info.block_size - layout.metadata_size();
        let fits = if info.num_blocks == 2 {
            max_file <= lblock0_capacity
        } else {
            max_file <= info.block_size
        };
        if !fits {
            error!("max file size {} does not fit a block", info.max_file_size);
            return Err(Error::InvalidArgument);
        }

        Ok(layout)
    }

    pub fn header_size(&self) -> usize {
        align_up(MetadataBlockHeader::PACKED_SIZE, self.align)
    }

    pub fn block_meta_size(&self) -> usize {
        align_up(BlockMeta::PACKED_SIZE, self.align)
    }

    pub fn file_meta_size(&self) -> usize {
        align_up(FileMeta::PACKED_SIZE, self.align)
    }

    pub fn block_meta_offset(&self, lblock: u32) -> usize {
        self.header_size() + lblock as usize * self.block_meta_size()
    }

    pub fn file_meta_offset(&self, idx: u32) -> usize {
        self.header_size()
            + self.num_lblocks as usize * self.block_meta_size()
            + idx as usize * self.file_meta_size()
    }

    /// End of the metadata area; logical block 0's data starts here.
    pub fn metadata_size(&self) -> usize {
        self.file_meta_offset(self.max_files)
    }

    /// Number of data blocks with their own physical block.
    pub fn num_dedicated_dblocks(&self) -> u32 {
        self.num_lblocks - 1
    }

    /// Initial physical id of a dedicated logical block (after a wipe).
    pub fn initial_dblock_phy(&self, lblock: u32) -> u32 {
        INITIAL_DATA_SCRATCH + lblock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> FlashDeviceInfo {
        FlashDeviceInfo {
            base_addr: 0,
            sector_size: 512,
            block_size: 2048,
            num_blocks: 4,
            program_unit: 1,
            max_file_size: 256,
            max_num_files: 4,
            erase_val: 0xff,
        }
    }

    #[test]
    fn wire_format_is_stable() {
        let header = MetadataBlockHeader {
            scratch_dblock: 2,
            fs_version: SUPPORTED_FS_VERSION,
            active_swap_count: 7,
        };
        let mut raw = [0u8; MetadataBlockHeader::PACKED_SIZE];
        header.pack(&mut raw);
        assert_eq!(raw, [2, 0, 0, 0, 0x01, 7]);

        let fm = FileMeta {
            id: FileId(*b"file-0000001"),
            lblock: 1,
            data_idx: 0x120,
            cur_size: 10,
            max_size: 64,
            flags: FileFlags::WRITE_ONCE,
        };
        let mut raw = [0u8; FileMeta::PACKED_SIZE];
        fm.pack(&mut raw);
        assert_eq!(&raw[0..12], b"file-0000001");
        assert_eq!(&raw[12..16], &[1, 0, 0, 0]);
        assert_eq!(&raw[16..20], &[0x20, 0x01, 0, 0]);
        assert_eq!(&raw[28..32], &[1, 0, 0, 0]);
        assert_eq!(FileMeta::unpack(&raw), fm);
    }

    #[test]
    fn layout_offsets_for_the_reference_geometry() {
        let layout = Layout::new(&info()).unwrap();
        assert_eq!(layout.num_lblocks, 2);
        assert_eq!(layout.header_size(), 6);
        assert_eq!(layout.block_meta_offset(0), 6);
        assert_eq!(layout.file_meta_offset(0), 6 + 2 * 12);
        assert_eq!(layout.metadata_size(), 6 + 2 * 12 + 4 * 32);
    }

    #[test]
    fn padding_follows_the_program_unit() {
        let mut info = info();
        info.program_unit = 8;
        let layout = Layout::new(&info).unwrap();
        assert_eq!(layout.header_size(), 8);
        assert_eq!(layout.block_meta_size(), 16);
        assert_eq!(layout.file_meta_size(), 32);
        assert_eq!(layout.metadata_size(), 8 + 2 * 16 + 4 * 32);
    }

    #[test]
    fn three_block_devices_are_rejected() {
        let mut info = info();
        info.num_blocks = 3;
        assert_eq!(Layout::new(&info).unwrap_err(), Error::InvalidArgument);
        info.num_blocks = 1;
        assert_eq!(Layout::new(&info).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn oversized_max_file_is_rejected() {
        let mut info = info();
        info.num_blocks = 2;
        // metadata leaves less than a full block for logical block 0
        info.max_file_size = 2048;
        assert_eq!(Layout::new(&info).unwrap_err(), Error::InvalidArgument);
    }
}
