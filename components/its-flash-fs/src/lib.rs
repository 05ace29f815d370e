#![no_std]

//! Log-structured, power-fail-safe file store on raw erase-block flash.
//!
//! Two physical blocks mirror the filesystem metadata: one is active, the
//! other is scratch. Every mutation builds the next metadata state in the
//! scratch block and commits it by writing the header (with an incremented
//! swap count) last, so power loss at any point leaves either the old or
//! the new state fully intact. File payload follows the same discipline:
//! writes are copy-on-write into a scratch data block that only becomes
//! visible through the metadata commit.
//!
//! The flat namespace is keyed by fixed 12-byte [`FileId`]s. There is no
//! wear levelling beyond the natural block rotation, no encryption (a
//! layer above owns that) and no internal locking; the owning service
//! serializes access.

#[macro_use]
extern crate delog;
generate_macros!();

#[cfg(test)]
#[macro_use]
extern crate std;

mod dblock;
mod error;
mod fs;
mod layout;
mod mblock;

pub use error::{Error, Result};
pub use fs::{FileInfo, FsConfig, ItsFs};
pub use layout::{FileFlags, FileId, FILE_ID_SIZE};
