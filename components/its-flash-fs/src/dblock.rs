//! Data block manager: copy-on-write payload writes and delete-time
//! compaction, both built on the chunked block-to-block move.

use its_flash::{block_to_block_move, FlashDevice};

use crate::error::{Error, Result};
use crate::fs::FsContext;
use crate::layout::{align_up, BlockMeta, FileMeta, MAX_ALIGN};

impl<D: FlashDevice> FsContext<D> {
    /// One bounded read at the file's current physical location.
    pub fn dblock_read_file(&mut self, meta: &FileMeta, offset: usize, buf: &mut [u8]) -> Result {
        let block_meta = self.block_meta_read(meta.lblock)?;
        self.flash
            .read(block_meta.phy_id, meta.data_idx + offset, buf)?;
        Ok(())
    }

    /// Rewrites one logical block into its scratch block with `data`
    /// spliced in at `offset` within the file. The old physical block is
    /// left untouched; nothing becomes visible before the metadata swap.
    ///
    /// `block_meta` must already account for the file's reservation, so
    /// the used area covers the file's full reserved span.
    pub fn dblock_write_file(
        &mut self,
        block_meta: &BlockMeta,
        meta: &FileMeta,
        offset: usize,
        data: &[u8],
    ) -> Result {
        let scratch = self.cur_data_scratch(meta.lblock);
        let align = self.layout.align;
        let pos = meta.data_idx + offset;

        // data below the write position
        block_to_block_move(
            &mut self.flash,
            scratch,
            block_meta.data_start,
            block_meta.phy_id,
            block_meta.data_start,
            pos - block_meta.data_start,
        )?;

        // the new bytes; the final partial program unit is seeded from
        // the old block so the rounded-up write cannot clobber the bytes
        // behind the written range
        let head_len = data.len() / align * align;
        if head_len > 0 {
            self.flash.write(scratch, pos, &data[..head_len])?;
        }
        let rem = data.len() - head_len;
        if rem > 0 {
            let mut tail = [0u8; MAX_ALIGN];
            self.flash
                .read(block_meta.phy_id, pos + head_len, &mut tail[..align])?;
            tail[..rem].copy_from_slice(&data[head_len..]);
            self.flash.write(scratch, pos + head_len, &tail[..align])?;
        }

        // everything above the written range: the unwritten tail of this
        // file's reservation and all trailing files
        let end = align_up(pos + data.len(), align);
        let used_end = self
            .layout
            .block_size
            .checked_sub(block_meta.free_size)
            .ok_or(Error::DataCorrupt)?;
        if used_end > end {
            block_to_block_move(&mut self.flash, scratch, end, block_meta.phy_id, end, used_end - end)?;
        }
        Ok(())
    }

    /// Closes the gap left by a deleted file: the `len` bytes that
    /// followed it move from `src_offset` down to `dst_offset` in the
    /// scratch block, and the data below the gap is carried over
    /// unchanged. Runs even when `len` is zero, so the deleted bytes
    /// always stay behind in the block about to be erased.
    pub fn dblock_compact_block(
        &mut self,
        lblock: u32,
        block_meta: &BlockMeta,
        dst_offset: usize,
        src_offset: usize,
        len: usize,
    ) -> Result {
        let scratch = self.cur_data_scratch(lblock);
        if len > 0 {
            block_to_block_move(
                &mut self.flash,
                scratch,
                dst_offset,
                block_meta.phy_id,
                src_offset,
                len,
            )?;
        }
        block_to_block_move(
            &mut self.flash,
            scratch,
            block_meta.data_start,
            block_meta.phy_id,
            block_meta.data_start,
            dst_offset
                .checked_sub(block_meta.data_start)
                .ok_or(Error::DataCorrupt)?,
        )?;
        Ok(())
    }
}
