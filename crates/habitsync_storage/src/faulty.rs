//! Fault-injecting backend wrapper.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const HEALTHY: u8 = 0;
const FAIL_WRITES: u8 = 1;
const TORN_WRITES: u8 = 2;

/// Shared control handle for a [`FaultyBackend`].
///
/// The store owns the backend, so tests keep a clone of the switch to arm it
/// later.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    mode: Arc<AtomicU8>,
}

impl FaultSwitch {
    /// Creates a disarmed switch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail without touching the data.
    pub fn fail_writes(&self) {
        self.mode.store(FAIL_WRITES, Ordering::SeqCst);
    }

    /// Makes every subsequent append write half its bytes and then fail,
    /// like a process killed mid-write.
    pub fn tear_writes(&self) {
        self.mode.store(TORN_WRITES, Ordering::SeqCst);
    }

    /// Restores normal behavior.
    pub fn heal(&self) {
        self.mode.store(HEALTHY, Ordering::SeqCst);
    }

    fn mode(&self) -> u8 {
        self.mode.load(Ordering::SeqCst)
    }
}

/// Wraps a backend and fails writes while its [`FaultSwitch`] is armed.
///
/// Reads always pass through.
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    switch: FaultSwitch,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`, returning the backend and its switch.
    pub fn new(inner: B) -> (Self, FaultSwitch) {
        let switch = FaultSwitch::new();
        (
            Self {
                inner,
                switch: switch.clone(),
            },
            switch,
        )
    }

    fn check(&self, op: &str) -> StorageResult<()> {
        if self.switch.mode() == HEALTHY {
            Ok(())
        } else {
            Err(StorageError::injected(format!("{op} refused")))
        }
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        match self.switch.mode() {
            HEALTHY => self.inner.append(data),
            TORN_WRITES => {
                self.inner.append(&data[..data.len() / 2])?;
                Err(StorageError::injected("append torn"))
            }
            _ => Err(StorageError::injected("append refused")),
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check("flush")?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check("sync")?;
        self.inner.sync()
    }

    // Truncation is how the store undoes a failed commit; keep it working.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.check("replace")?;
        self.inner.replace(data)
    }
}
