/// Error kinds surfaced by the filesystem API.
///
/// The categories are deliberately coarse; the failing step is named in
/// the log at the failure site instead of multiplying variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Bad id, size, offset, flag set, gap-creating write, or an attempt
    /// to create an id that already exists.
    InvalidArgument,
    /// Unknown file id, or the slot was reused since the last lookup.
    DoesNotExist,
    /// No data block or file-table slot can hold the request.
    InsufficientStorage,
    /// A metadata record read back from flash failed validation.
    DataCorrupt,
    /// The underlying flash device reported a failure.
    StorageFailure,
    /// The file was created write-once and cannot be modified or deleted.
    NotPermitted,
    /// An internal invariant broke after partial progress.
    Internal,
}

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

impl From<its_flash::Error> for Error {
    fn from(_: its_flash::Error) -> Self {
        Self::StorageFailure
    }
}
