use alloc::vec;
use alloc::vec::Vec;

use crate::device::{FlashDevice, FlashDeviceInfo, Result};

struct Slot {
    block: u32,
    buf: Vec<u8>,
    dirty_start: usize,
    dirty_end: usize,
    stamp: u64,
}

impl Slot {
    fn dirty(&self) -> bool {
        self.dirty_start < self.dirty_end
    }
}

/// Write-accumulation wrapper for devices with a program unit larger than
/// the writes the filesystem issues (NAND-style page programming).
///
/// Writes are collected in per-block RAM buffers and programmed as one
/// aligned span on `flush` (or when a buffer has to be recycled), so the
/// wrapper advertises a program unit of one. Two buffers are kept, which
/// covers the commit protocol's working set: the scratch metadata block
/// and the scratch data block. Accumulation assumes the target block was
/// erased beforehand, which holds for every scratch block between commits.
pub struct BufferedFlash<D: FlashDevice> {
    dev: D,
    info: FlashDeviceInfo,
    slots: [Option<Slot>; 2],
    tick: u64,
}

impl<D: FlashDevice> BufferedFlash<D> {
    pub fn new(dev: D) -> Self {
        let mut info = *dev.info();
        info.program_unit = 1;
        Self {
            dev,
            info,
            slots: [None, None],
            tick: 0,
        }
    }

    /// Writes back everything and returns the inner device.
    pub fn into_inner(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.dev)
    }

    /// Returns the inner device dropping any pending writes, the state a
    /// power loss before `flush` would leave behind.
    pub fn into_inner_discarding(self) -> D {
        self.dev
    }

    fn write_back(dev: &mut D, slot: &mut Slot) -> Result {
        if !slot.dirty() {
            return Ok(());
        }
        let unit = dev.info().program_unit;
        let start = slot.dirty_start / unit * unit;
        let end = (slot.dirty_end + unit - 1) / unit * unit;
        // the first page of a metadata block carries the commit header,
        // which must reach flash after everything else: program it last
        if start < unit && end > unit {
            dev.write(slot.block, unit, &slot.buf[unit..end])?;
            dev.write(slot.block, start, &slot.buf[start..unit])?;
        } else {
            dev.write(slot.block, start, &slot.buf[start..end])?;
        }
        slot.dirty_start = 0;
        slot.dirty_end = 0;
        Ok(())
    }

    fn slot_idx(&mut self, block: u32) -> Result<usize> {
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| s.as_ref().map(|s| s.block) == Some(block))
        {
            return Ok(i);
        }
        // free slot, or recycle the least recently used one
        let i = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                let i = if self.slots[0].as_ref().map(|s| s.stamp)
                    <= self.slots[1].as_ref().map(|s| s.stamp)
                {
                    0
                } else {
                    1
                };
                let slot = self.slots[i].as_mut().ok_or(crate::Error)?;
                debug!("recycling write buffer of block {}", slot.block);
                Self::write_back(&mut self.dev, slot)?;
                self.slots[i] = None;
                i
            }
        };
        let mut buf = vec![0u8; self.info.block_size];
        self.dev.read(block, 0, &mut buf)?;
        self.slots[i] = Some(Slot {
            block,
            buf,
            dirty_start: 0,
            dirty_end: 0,
            stamp: self.tick,
        });
        Ok(i)
    }
}

impl<D: FlashDevice> FlashDevice for BufferedFlash<D> {
    fn info(&self) -> &FlashDeviceInfo {
        &self.info
    }

    fn init(&mut self) -> Result {
        self.dev.init()
    }

    fn read(&mut self, block: u32, offset: usize, buf: &mut [u8]) -> Result {
        let end = offset.checked_add(buf.len()).ok_or(crate::Error)?;
        if end > self.info.block_size {
            return Err(crate::Error);
        }
        for slot in self.slots.iter().flatten() {
            if slot.block == block {
                buf.copy_from_slice(&slot.buf[offset..end]);
                return Ok(());
            }
        }
        self.dev.read(block, offset, buf)
    }

    fn write(&mut self, block: u32, offset: usize, data: &[u8]) -> Result {
        let end = offset.checked_add(data.len()).ok_or(crate::Error)?;
        if end > self.info.block_size {
            return Err(crate::Error);
        }
        self.tick += 1;
        let tick = self.tick;
        let i = self.slot_idx(block)?;
        let slot = self.slots[i].as_mut().ok_or(crate::Error)?;
        slot.buf[offset..end].copy_from_slice(data);
        if !slot.dirty() {
            slot.dirty_start = offset;
            slot.dirty_end = end;
        } else {
            slot.dirty_start = slot.dirty_start.min(offset);
            slot.dirty_end = slot.dirty_end.max(end);
        }
        slot.stamp = tick;
        Ok(())
    }

    fn flush(&mut self) -> Result {
        // program in write order: a commit ends with the metadata header,
        // so the most recently touched slot must reach flash last
        let mut order = [0, 1];
        let stamp = |i: usize| self.slots[i].as_ref().map(|s| s.stamp);
        if stamp(0) > stamp(1) {
            order = [1, 0];
        }
        for i in order {
            if let Some(slot) = self.slots[i].as_mut() {
                Self::write_back(&mut self.dev, slot)?;
            }
        }
        self.dev.flush()
    }

    fn erase(&mut self, block: u32) -> Result {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|s| s.block) == Some(block) {
                *slot = None;
            }
        }
        self.dev.erase(block)
    }
}
