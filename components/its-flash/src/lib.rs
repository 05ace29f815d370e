#![no_std]

//! Block-device abstraction for raw erase-block flash.
//!
//! The filesystem above this crate never touches hardware directly: it
//! drives a [`FlashDevice`] in units of logical erase blocks and relocates
//! data exclusively through [`block_to_block_move`]. Devices that cannot
//! program the same region twice between erases (NAND-style program
//! pages) are wrapped in [`BufferedFlash`], which accumulates writes per
//! block and programs them on `flush`.

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(test)]
extern crate std;

mod device;

pub use device::{block_to_block_move, Error, FlashDevice, FlashDeviceInfo, Result, MOVE_BUF_SIZE};

#[cfg(feature = "alloc")]
mod ram;
#[cfg(feature = "alloc")]
pub use ram::RamFlash;

#[cfg(feature = "alloc")]
mod buffered;
#[cfg(feature = "alloc")]
pub use buffered::BufferedFlash;
