//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store holding the local store's log.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `flush` makes appended data durable
/// - `replace` swaps the whole content in one step: a reader sees either the
///   old bytes or the new ones, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends beyond
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset where it was written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes appended data to durable storage.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes (the offset of the next append).
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata. Stronger than [`StorageBackend::flush`].
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops everything after `new_size`.
    ///
    /// Used to cut a torn tail record after a crash and to undo a commit
    /// whose flush failed.
    ///
    /// # Errors
    ///
    /// Fails if `new_size` is greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole content with `data`.
    ///
    /// Used by compaction to swap the log for a single snapshot.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole content.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
