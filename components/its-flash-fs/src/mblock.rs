//! Metadata block manager: the mirrored active/scratch pair, startup
//! recovery and the atomic "build scratch, then swap" commit protocol.

use its_flash::{block_to_block_move, FlashDevice};

use crate::error::{Error, Result};
use crate::fs::FsContext;
use crate::layout::{
    BlockMeta, FileId, FileMeta, MetadataBlockHeader, INITIAL_DATA_SCRATCH, LOGICAL_BLOCK0,
    MAX_ALIGN, METADATA_BLOCK0, METADATA_BLOCK1, SUPPORTED_FS_VERSION,
};

impl<D: FlashDevice> FsContext<D> {
    /// Startup recovery: pick the newest valid metadata block as active.
    ///
    /// A header is valid iff its version matches and its swap count is
    /// not the erase value (a torn commit never finishes the swap-count
    /// byte). With two valid headers the higher swap count wins, except
    /// that a count of 0 has just wrapped and beats any neighbour other
    /// than 1.
    pub fn mblock_init(&mut self) -> Result {
        let h0 = self.read_meta_header(METADATA_BLOCK0)?;
        let h1 = self.read_meta_header(METADATA_BLOCK1)?;

        let active = match (self.header_is_valid(&h0), self.header_is_valid(&h1)) {
            (false, false) => {
                error!("no valid metadata block; the area must be wiped");
                return Err(Error::StorageFailure);
            }
            (true, false) => METADATA_BLOCK0,
            (false, true) => METADATA_BLOCK1,
            (true, true) => {
                let (s0, s1) = (h0.active_swap_count, h1.active_swap_count);
                if s0 == s1 {
                    warn!("both metadata blocks carry swap count {}", s0);
                    METADATA_BLOCK0
                } else if s0 == 0 && s1 != 1 {
                    // 255 -> 0 rollover: 0 is the newer state
                    METADATA_BLOCK0
                } else if s1 == 0 && s0 != 1 {
                    METADATA_BLOCK1
                } else if s0 > s1 {
                    METADATA_BLOCK0
                } else {
                    METADATA_BLOCK1
                }
            }
        };

        self.header = if active == METADATA_BLOCK0 { h0 } else { h1 };
        self.active_metablock = active;
        self.scratch_metablock = if active == METADATA_BLOCK0 {
            METADATA_BLOCK1
        } else {
            METADATA_BLOCK0
        };
        info!(
            "recovered metadata block {} (swap count {})",
            active, self.header.active_swap_count
        );

        // a torn commit may have left partial writes behind; the next
        // commit expects erased scratch blocks
        self.flash.erase(self.scratch_metablock)?;
        if self.layout.num_dedicated_dblocks() > 0 {
            self.flash.erase(self.header.scratch_dblock)?;
        }
        self.scratch_clean = true;
        Ok(())
    }

    /// Erases the whole device and writes an empty metadata layout into
    /// block 0: block-meta table, explicitly zeroed file table, header
    /// with swap count 0 written last.
    pub fn mblock_reset(&mut self) -> Result {
        let info = *self.flash.info();
        self.scratch_clean = false;
        for block in 0..info.num_blocks {
            self.flash.erase(block)?;
        }

        // build in block 0 through the scratch-write helpers
        self.active_metablock = METADATA_BLOCK1;
        self.scratch_metablock = METADATA_BLOCK0;
        self.header = MetadataBlockHeader {
            scratch_dblock: if self.layout.num_dedicated_dblocks() > 0 {
                INITIAL_DATA_SCRATCH
            } else {
                METADATA_BLOCK1
            },
            fs_version: SUPPORTED_FS_VERSION,
            active_swap_count: 0,
        };

        let metadata_size = self.layout.metadata_size();
        let lb0 = BlockMeta {
            phy_id: METADATA_BLOCK0,
            data_start: metadata_size,
            free_size: self.layout.block_size - metadata_size,
        };
        self.block_meta_write_scratch(LOGICAL_BLOCK0, &lb0)?;
        for lblock in 1..self.layout.num_lblocks {
            let meta = BlockMeta {
                phy_id: self.layout.initial_dblock_phy(lblock),
                data_start: 0,
                free_size: self.layout.block_size,
            };
            self.block_meta_write_scratch(lblock, &meta)?;
        }
        for idx in 0..self.layout.max_files {
            self.file_meta_write_scratch(idx, &FileMeta::EMPTY)?;
        }

        let mut packed = [0u8; MetadataBlockHeader::PACKED_SIZE];
        self.header.pack(&mut packed);
        self.write_record(METADATA_BLOCK0, 0, &packed, self.layout.header_size())?;
        self.flash.flush()?;

        self.active_metablock = METADATA_BLOCK0;
        self.scratch_metablock = METADATA_BLOCK1;
        self.scratch_clean = true;
        info!("filesystem wiped: {} logical blocks", self.layout.num_lblocks);
        Ok(())
    }

    /// Prepares the scratch blocks for the next update. A previously
    /// failed commit leaves partial writes behind; they are erased here
    /// so the caller never builds on dirty flash. Must run before the
    /// first scratch write of every mutating operation.
    pub fn meta_update_begin(&mut self) -> Result {
        if !self.scratch_clean {
            debug!("re-erasing scratch blocks after an aborted update");
            self.flash.erase(self.scratch_metablock)?;
            if self.layout.num_dedicated_dblocks() > 0 {
                self.flash.erase(self.header.scratch_dblock)?;
            }
        }
        self.scratch_clean = false;
        Ok(())
    }

    /// Seals a commit: writes the scratch header with the next swap count,
    /// flushes, swaps the active/scratch designations and erases the
    /// blocks that just became scratch. `new_data_scratch` names the
    /// physical block a data-block rotation freed up, if any.
    ///
    /// The in-memory header and block designations change only once the
    /// new header is durable, so a failed step leaves the context
    /// describing the committed state and the whole operation can be
    /// retried.
    pub fn meta_update_finalize(&mut self, new_data_scratch: Option<u32>) -> Result {
        let erase_val = self.flash.info().erase_val;
        let mut header = self.header;
        let mut next = header.active_swap_count.wrapping_add(1);
        if next == erase_val {
            // the erase value marks a torn header; never use it
            next = 0;
        }
        header.active_swap_count = next;
        header.fs_version = SUPPORTED_FS_VERSION;
        if self.layout.num_dedicated_dblocks() == 0 {
            // on 2-block devices the metadata scratch doubles as the data
            // scratch; the block that is active now becomes scratch once
            // the swap below runs
            header.scratch_dblock = self.active_metablock;
        } else if let Some(block) = new_data_scratch {
            header.scratch_dblock = block;
        }

        let mut packed = [0u8; MetadataBlockHeader::PACKED_SIZE];
        header.pack(&mut packed);
        self.write_record(self.scratch_metablock, 0, &packed, self.layout.header_size())?;
        self.flash.flush()?;

        // the new state is durable on flash; adopt it in memory
        self.header = header;
        core::mem::swap(&mut self.active_metablock, &mut self.scratch_metablock);
        debug!(
            "committed metadata block {} (swap count {})",
            self.active_metablock, next
        );

        self.flash.erase(self.scratch_metablock)?;
        if new_data_scratch.is_some() {
            self.flash.erase(self.header.scratch_dblock)?;
        }
        self.scratch_clean = true;
        Ok(())
    }

    /// First-fit reservation: the first logical block with enough tail
    /// space wins; the allocation sits right after the existing data.
    /// There is no best-fit and no cross-block splitting, so this can
    /// fail although the aggregate free space would suffice.
    pub fn reserve_file(&mut self, size: usize) -> Result<(u32, BlockMeta)> {
        for lblock in 0..self.layout.num_lblocks {
            let meta = self.block_meta_read(lblock)?;
            if meta.free_size >= size {
                return Ok((lblock, meta));
            }
        }
        info!("no data block with {} free bytes", size);
        Err(Error::InsufficientStorage)
    }

    /// Scans the whole file table for `id`. The table has no terminator;
    /// all max-file-count entries are candidates.
    pub fn get_file_idx(&mut self, id: &FileId) -> Result<Option<u32>> {
        for idx in 0..self.layout.max_files {
            if self.file_meta_read(idx)?.id == *id {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    /// Finds a free slot (all-zero id) in the file table.
    pub fn get_free_file_idx(&mut self) -> Result<Option<u32>> {
        for idx in 0..self.layout.max_files {
            if self.file_meta_read(idx)?.id.is_empty() {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub fn block_meta_read(&mut self, lblock: u32) -> Result<BlockMeta> {
        if lblock >= self.layout.num_lblocks {
            error!("logical block {} out of range", lblock);
            return Err(Error::Internal);
        }
        let mut raw = [0u8; BlockMeta::PACKED_SIZE];
        self.flash
            .read(self.active_metablock, self.layout.block_meta_offset(lblock), &mut raw)?;
        let meta = BlockMeta::unpack(&raw);
        if self.validate {
            self.validate_block_meta(lblock, &meta)?;
        }
        Ok(meta)
    }

    pub fn block_meta_write_scratch(&mut self, lblock: u32, meta: &BlockMeta) -> Result {
        let mut packed = [0u8; BlockMeta::PACKED_SIZE];
        meta.pack(&mut packed);
        let offset = self.layout.block_meta_offset(lblock);
        self.write_record(self.scratch_metablock, offset, &packed, self.layout.block_meta_size())
    }

    pub fn file_meta_read(&mut self, idx: u32) -> Result<FileMeta> {
        if idx >= self.layout.max_files {
            error!("file index {} out of range", idx);
            return Err(Error::Internal);
        }
        let mut raw = [0u8; FileMeta::PACKED_SIZE];
        self.flash
            .read(self.active_metablock, self.layout.file_meta_offset(idx), &mut raw)?;
        let meta = FileMeta::unpack(&raw);
        if self.validate {
            self.validate_file_meta(&meta)?;
        }
        Ok(meta)
    }

    pub fn file_meta_write_scratch(&mut self, idx: u32, meta: &FileMeta) -> Result {
        let mut packed = [0u8; FileMeta::PACKED_SIZE];
        meta.pack(&mut packed);
        let offset = self.layout.file_meta_offset(idx);
        self.write_record(self.scratch_metablock, offset, &packed, self.layout.file_meta_size())
    }

    /// Carries every block-meta entry except the edited one forward from
    /// the active to the scratch metadata block. Logical block 0 is never
    /// copied verbatim: its data travels with the metadata, so its entry
    /// is rewritten to point at the block about to become active.
    pub fn copy_remaining_block_meta(&mut self, edited: u32) -> Result {
        if edited != LOGICAL_BLOCK0 {
            let mut lb0 = self.block_meta_read(LOGICAL_BLOCK0)?;
            lb0.phy_id = self.scratch_metablock;
            self.block_meta_write_scratch(LOGICAL_BLOCK0, &lb0)?;
            self.copy_block_meta_span(1, edited)?;
            self.copy_block_meta_span(edited + 1, self.layout.num_lblocks)?;
        } else {
            self.copy_block_meta_span(1, self.layout.num_lblocks)?;
        }
        Ok(())
    }

    fn copy_block_meta_span(&mut self, from: u32, to: u32) -> Result {
        if to <= from {
            return Ok(());
        }
        let offset = self.layout.block_meta_offset(from);
        let len = (to - from) as usize * self.layout.block_meta_size();
        block_to_block_move(
            &mut self.flash,
            self.scratch_metablock,
            offset,
            self.active_metablock,
            offset,
            len,
        )?;
        Ok(())
    }

    /// Carries every file-meta entry except the edited one forward.
    pub fn copy_remaining_file_meta(&mut self, edited: u32) -> Result {
        self.copy_file_meta_span(0, edited)?;
        self.copy_file_meta_span(edited + 1, self.layout.max_files)
    }

    fn copy_file_meta_span(&mut self, from: u32, to: u32) -> Result {
        if to <= from {
            return Ok(());
        }
        let offset = self.layout.file_meta_offset(from);
        let len = (to - from) as usize * self.layout.file_meta_size();
        block_to_block_move(
            &mut self.flash,
            self.scratch_metablock,
            offset,
            self.active_metablock,
            offset,
            len,
        )?;
        Ok(())
    }

    /// Copies logical block 0's used data region into the scratch
    /// metadata block, for commits whose edit did not already move it.
    pub fn migrate_lblock0_data(&mut self) -> Result {
        let lb0 = self.block_meta_read(LOGICAL_BLOCK0)?;
        let used_end = lb0
            .data_start
            .checked_add(lb0.free_size)
            .and_then(|tail| self.layout.block_size.checked_sub(tail))
            .ok_or(Error::DataCorrupt)?;
        block_to_block_move(
            &mut self.flash,
            self.scratch_metablock,
            lb0.data_start,
            self.active_metablock,
            lb0.data_start,
            used_end,
        )?;
        Ok(())
    }

    /// Physical block that receives copy-on-write data for `lblock`.
    pub fn cur_data_scratch(&self, lblock: u32) -> u32 {
        if lblock == LOGICAL_BLOCK0 {
            self.scratch_metablock
        } else {
            self.header.scratch_dblock
        }
    }

    fn read_meta_header(&mut self, block: u32) -> Result<MetadataBlockHeader> {
        let mut raw = [0u8; MetadataBlockHeader::PACKED_SIZE];
        self.flash.read(block, 0, &mut raw)?;
        Ok(MetadataBlockHeader::unpack(&raw))
    }

    fn header_is_valid(&self, header: &MetadataBlockHeader) -> bool {
        let info = self.flash.info();
        if header.fs_version != SUPPORTED_FS_VERSION {
            return false;
        }
        if header.active_swap_count == info.erase_val {
            return false;
        }
        if header.scratch_dblock >= info.num_blocks {
            return false;
        }
        // with dedicated data blocks the data scratch may never alias a
        // metadata block
        self.layout.num_dedicated_dblocks() == 0 || header.scratch_dblock >= INITIAL_DATA_SCRATCH
    }

    /// Writes one packed record padded with the erase value up to the
    /// record's aligned on-flash size.
    fn write_record(&mut self, block: u32, offset: usize, packed: &[u8], padded: usize) -> Result {
        let mut buf = [0u8; MAX_ALIGN];
        buf[..padded].fill(self.flash.info().erase_val);
        buf[..packed.len()].copy_from_slice(packed);
        self.flash.write(block, offset, &buf[..padded])?;
        Ok(())
    }

    fn validate_block_meta(&self, lblock: u32, meta: &BlockMeta) -> Result {
        let info = self.flash.info();
        let contained = meta
            .data_start
            .checked_add(meta.free_size)
            .map(|end| end <= self.layout.block_size)
            .unwrap_or(false);
        let phy_ok = if lblock == LOGICAL_BLOCK0 {
            meta.phy_id == self.active_metablock && meta.data_start == self.layout.metadata_size()
        } else {
            meta.phy_id >= INITIAL_DATA_SCRATCH && meta.phy_id < info.num_blocks
        };
        if !contained || !phy_ok {
            warn!("corrupt block meta for logical block {}", lblock);
            return Err(Error::DataCorrupt);
        }
        Ok(())
    }

    fn validate_file_meta(&self, meta: &FileMeta) -> Result {
        if meta.id.is_empty() {
            return Ok(());
        }
        let in_table = meta.lblock < self.layout.num_lblocks;
        let contained = meta
            .data_idx
            .checked_add(meta.max_size)
            .map(|end| end <= self.layout.block_size)
            .unwrap_or(false);
        let sized = meta.cur_size <= meta.max_size;
        let known_flags = crate::layout::FileFlags::from_bits(meta.flags.bits()).is_some();
        if !in_table || !contained || !sized || !known_flags {
            warn!("corrupt file meta in logical block {}", meta.lblock);
            return Err(Error::DataCorrupt);
        }
        Ok(())
    }
}
