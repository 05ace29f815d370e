//! Object-level filesystem API, composing the metadata and data block
//! managers into transactional operations that each end in one commit.

use its_flash::FlashDevice;

use crate::error::{Error, Result};
use crate::layout::{
    align_up, BlockMeta, FileFlags, FileId, FileMeta, Layout, MetadataBlockHeader, LOGICAL_BLOCK0,
    METADATA_BLOCK0, METADATA_BLOCK1, SUPPORTED_FS_VERSION,
};

/// Behaviour toggles for one filesystem instance.
#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    /// Range- and containment-check every metadata record read from
    /// flash instead of trusting raw contents. The corruption defence
    /// layer; leave on unless the cycles genuinely matter.
    pub validate_on_read: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            validate_on_read: true,
        }
    }
}

/// What `file_get_info` reports about one stored file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub size_current: usize,
    /// Reserved size, rounded up to the device's program unit.
    pub size_max: usize,
    pub flags: FileFlags,
}

/// Per-instance state shared by the managers. Lives for the lifetime of
/// the owning service; no hidden statics.
pub(crate) struct FsContext<D: FlashDevice> {
    pub flash: D,
    pub layout: Layout,
    pub header: MetadataBlockHeader,
    pub active_metablock: u32,
    pub scratch_metablock: u32,
    pub validate: bool,
    /// Cleared while an update builds in the scratch blocks, set again
    /// once the commit's trailing erases succeed. A failed update leaves
    /// it cleared so the next one re-erases before building.
    pub scratch_clean: bool,
}

/// The flat key/value file store.
///
/// Single caller at a time: the owning service serializes access. Every
/// mutating operation either commits completely or leaves the previous
/// committed state intact.
pub struct ItsFs<D: FlashDevice> {
    ctx: FsContext<D>,
    prepared: bool,
}

impl<D: FlashDevice> ItsFs<D> {
    /// Binds a device: validates its geometry and initializes the driver.
    /// The filesystem is not usable until [`prepare`](Self::prepare) or
    /// [`wipe_all`](Self::wipe_all) has run.
    pub fn new(mut flash: D, config: FsConfig) -> Result<Self> {
        let layout = Layout::new(flash.info())?;
        flash.init()?;
        Ok(Self {
            ctx: FsContext {
                flash,
                layout,
                header: MetadataBlockHeader {
                    scratch_dblock: METADATA_BLOCK1,
                    fs_version: SUPPORTED_FS_VERSION,
                    active_swap_count: 0,
                },
                active_metablock: METADATA_BLOCK0,
                scratch_metablock: METADATA_BLOCK1,
                validate: config.validate_on_read,
                scratch_clean: false,
            },
            prepared: false,
        })
    }

    /// Runs startup recovery. Fails with `StorageFailure` when neither
    /// metadata block is valid; the caller may then provision the area
    /// with [`wipe_all`](Self::wipe_all).
    pub fn prepare(&mut self) -> Result {
        self.ctx.mblock_init()?;
        self.prepared = true;
        Ok(())
    }

    /// Erases everything and rebuilds an empty filesystem. First-time
    /// provisioning and factory reset; idempotent.
    pub fn wipe_all(&mut self) -> Result {
        self.ctx.mblock_reset()?;
        self.prepared = true;
        Ok(())
    }

    pub fn file_exists(&mut self, id: &FileId) -> Result {
        self.require_prepared()?;
        self.lookup(id).map(|_| ())
    }

    pub fn file_get_info(&mut self, id: &FileId) -> Result<FileInfo> {
        self.require_prepared()?;
        let (_, meta) = self.lookup(id)?;
        Ok(FileInfo {
            size_current: meta.cur_size,
            size_max: meta.max_size,
            flags: meta.flags,
        })
    }

    /// Calls `f` once per stored file, in file-table order. The callback
    /// must not reenter the filesystem.
    pub fn for_each_file(&mut self, mut f: impl FnMut(&FileId, &FileInfo)) -> Result {
        self.require_prepared()?;
        for idx in 0..self.ctx.layout.max_files {
            let meta = self.ctx.file_meta_read(idx)?;
            if meta.id.is_empty() {
                continue;
            }
            f(
                &meta.id,
                &FileInfo {
                    size_current: meta.cur_size,
                    size_max: meta.max_size,
                    flags: meta.flags,
                },
            );
        }
        Ok(())
    }

    /// Creates `id` with `max_size` reserved bytes and an optional
    /// initial payload at offset 0. An existing id is rejected; delete
    /// first, create never overwrites.
    ///
    /// Reservation is first-fit over the logical blocks, so this can
    /// fail with `InsufficientStorage` even when the free space summed
    /// across blocks would suffice.
    pub fn file_create(
        &mut self,
        id: &FileId,
        max_size: usize,
        flags: FileFlags,
        data: &[u8],
    ) -> Result {
        self.require_prepared()?;
        if id.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if max_size > self.ctx.flash.info().max_file_size || data.len() > max_size {
            return Err(Error::InvalidArgument);
        }
        if FileFlags::from_bits(flags.bits()).is_none() {
            return Err(Error::InvalidArgument);
        }
        if self.ctx.get_file_idx(id)?.is_some() {
            debug!("create: id exists");
            return Err(Error::InvalidArgument);
        }
        let idx = self
            .ctx
            .get_free_file_idx()?
            .ok_or(Error::InsufficientStorage)?;

        let reserve = align_up(max_size, self.ctx.layout.align);
        let (lblock, mut block_meta) = self.ctx.reserve_file(reserve)?;
        let data_idx = self.ctx.layout.block_size - block_meta.free_size;
        block_meta.free_size -= reserve;

        let meta = FileMeta {
            id: *id,
            lblock,
            data_idx,
            cur_size: data.len(),
            max_size: reserve,
            flags,
        };
        let wrote_data = !data.is_empty();
        self.ctx.meta_update_begin()?;
        if wrote_data {
            self.ctx.dblock_write_file(&block_meta, &meta, 0, data)?;
        }
        self.commit(lblock, block_meta, wrote_data, idx, &meta)
    }

    /// Writes `data` at `offset` within `id`, growing the file up to its
    /// reserved size. Gap-creating writes (`offset > current size`) are
    /// rejected. Always copy-on-write plus a commit, even for writes
    /// entirely inside existing data.
    pub fn file_write(&mut self, id: &FileId, offset: usize, data: &[u8]) -> Result {
        self.require_prepared()?;
        let (idx, meta) = self.lookup(id)?;
        if meta.flags.contains(FileFlags::WRITE_ONCE) {
            return Err(Error::NotPermitted);
        }
        if offset > meta.cur_size {
            debug!("write would leave a gap at {}", meta.cur_size);
            return Err(Error::InvalidArgument);
        }
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgument)?;
        if end > meta.max_size {
            return Err(Error::InvalidArgument);
        }
        if self.ctx.layout.align > 1 && offset % self.ctx.layout.align != 0 {
            return Err(Error::InvalidArgument);
        }

        let block_meta = self.ctx.block_meta_read(meta.lblock)?;
        let mut meta = meta;
        meta.cur_size = meta.cur_size.max(end);
        self.ctx.meta_update_begin()?;
        self.ctx.dblock_write_file(&block_meta, &meta, offset, data)?;
        self.commit(meta.lblock, block_meta, true, idx, &meta)
    }

    /// Fills `buf` from `offset` within `id`. The range must lie inside
    /// the current size; reads are not re-aligned.
    pub fn file_read(&mut self, id: &FileId, offset: usize, buf: &mut [u8]) -> Result {
        self.require_prepared()?;
        let (_, meta) = self.lookup(id)?;
        let end = offset.checked_add(buf.len()).ok_or(Error::InvalidArgument)?;
        if end > meta.cur_size {
            return Err(Error::InvalidArgument);
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.ctx.dblock_read_file(&meta, offset, buf)
    }

    /// Deletes `id`: frees its slot, shifts the metadata of every file
    /// that lived behind it in the same block, compacts the block and
    /// commits.
    pub fn file_delete(&mut self, id: &FileId) -> Result {
        self.require_prepared()?;
        let (idx, meta) = self.lookup(id)?;
        if meta.flags.contains(FileFlags::WRITE_ONCE) {
            return Err(Error::NotPermitted);
        }
        let block_meta = self.ctx.block_meta_read(meta.lblock)?;
        let freed = meta.max_size;
        self.ctx.meta_update_begin()?;

        // rewrite the whole table into the scratch block, closing the
        // metadata gap in the same pass
        for i in 0..self.ctx.layout.max_files {
            if i == idx {
                self.ctx.file_meta_write_scratch(i, &FileMeta::EMPTY)?;
                continue;
            }
            let mut other = self.ctx.file_meta_read(i)?;
            if !other.id.is_empty() && other.lblock == meta.lblock && other.data_idx > meta.data_idx
            {
                other.data_idx -= freed;
            }
            self.ctx.file_meta_write_scratch(i, &other)?;
        }

        let used_end = self
            .ctx
            .layout
            .block_size
            .checked_sub(block_meta.free_size)
            .ok_or(Error::DataCorrupt)?;
        let src_offset = meta.data_idx + freed;
        let len = used_end.checked_sub(src_offset).ok_or(Error::DataCorrupt)?;
        self.ctx
            .dblock_compact_block(meta.lblock, &block_meta, meta.data_idx, src_offset, len)?;

        let mut new_meta = block_meta;
        new_meta.free_size += freed;
        let mut new_scratch = None;
        if meta.lblock == LOGICAL_BLOCK0 {
            new_meta.phy_id = self.ctx.scratch_metablock;
        } else {
            // the block always rotates on delete, even for an empty move,
            // so the stale bytes die with the old physical block
            new_scratch = Some(new_meta.phy_id);
            new_meta.phy_id = self.ctx.header.scratch_dblock;
        }
        self.ctx.block_meta_write_scratch(meta.lblock, &new_meta)?;
        self.ctx.copy_remaining_block_meta(meta.lblock)?;
        if meta.lblock != LOGICAL_BLOCK0 {
            self.ctx.migrate_lblock0_data()?;
        }
        self.ctx.meta_update_finalize(new_scratch)
    }

    /// Consumes the filesystem and hands the device back, e.g. to
    /// snapshot an emulated image.
    pub fn into_flash(self) -> D {
        self.ctx.flash
    }

    pub fn flash(&self) -> &D {
        &self.ctx.flash
    }

    /// Shared commit tail of create and write: final block meta in, the
    /// unchanged remainder carried forward, block 0 data migrated unless
    /// the edit already moved it, header last.
    fn commit(
        &mut self,
        lblock: u32,
        mut block_meta: BlockMeta,
        data_moved: bool,
        idx: u32,
        meta: &FileMeta,
    ) -> Result {
        let mut new_scratch = None;
        if lblock == LOGICAL_BLOCK0 {
            block_meta.phy_id = self.ctx.scratch_metablock;
        } else if data_moved {
            new_scratch = Some(block_meta.phy_id);
            block_meta.phy_id = self.ctx.header.scratch_dblock;
        }
        self.ctx.block_meta_write_scratch(lblock, &block_meta)?;
        self.ctx.copy_remaining_block_meta(lblock)?;
        self.ctx.file_meta_write_scratch(idx, meta)?;
        self.ctx.copy_remaining_file_meta(idx)?;
        if !(lblock == LOGICAL_BLOCK0 && data_moved) {
            self.ctx.migrate_lblock0_data()?;
        }
        self.ctx.meta_update_finalize(new_scratch)
    }

    fn lookup(&mut self, id: &FileId) -> Result<(u32, FileMeta)> {
        if id.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let idx = self.ctx.get_file_idx(id)?.ok_or(Error::DoesNotExist)?;
        let meta = self.ctx.file_meta_read(idx)?;
        // the slot could have been reused between the scan and this read
        if meta.id != *id {
            return Err(Error::DoesNotExist);
        }
        Ok((idx, meta))
    }

    fn require_prepared(&self) -> Result {
        if self.prepared {
            Ok(())
        } else {
            error!("operation before prepare/wipe_all");
            Err(Error::Internal)
        }
    }
}
