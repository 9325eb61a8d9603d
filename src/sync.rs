//! Multi-task sharing of one mounted volume.
//!
//! The volume API takes `&mut self`, which already serialises access
//! within one task. Embeddings that share a volume between tasks wrap it
//! here: every entry acquires the volume lock with a bounded number of
//! tries, and exhaustion surfaces as `Timeout` instead of blocking
//! forever.

use alloc::sync::Arc;
use spin::Mutex;

use crate::fs::Volume;
use crate::{FsError, FsResult};

/// Default acquisition budget: how many try-lock spins before `Timeout`.
pub const DEFAULT_TIMEOUT_SPINS: u32 = 1_000_000;

/// A mounted volume behind a try-lock mutex. Clones share the volume.
pub struct SharedVolume {
    inner: Arc<Mutex<Volume>>,
    spins: u32,
}

impl Clone for SharedVolume {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            spins: self.spins,
        }
    }
}

impl SharedVolume {
    pub fn new(vol: Volume) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vol)),
            spins: DEFAULT_TIMEOUT_SPINS,
        }
    }

    /// Adjust the acquisition budget.
    pub fn with_timeout_spins(mut self, spins: u32) -> Self {
        self.spins = spins;
        self
    }

    /// Run `f` with exclusive use of the volume window, FAT state and
    /// counters. Nested calls from the same task deadlock by construction
    /// and must not be made.
    pub fn with<T>(&self, f: impl FnOnce(&mut Volume) -> FsResult<T>) -> FsResult<T> {
        for _ in 0..self.spins {
            if let Some(mut vol) = self.inner.try_lock() {
                return f(&mut vol);
            }
            core::hint::spin_loop();
        }
        Err(FsError::Timeout)
    }

    /// Tear the wrapper down and give the volume back, failing when other
    /// clones still hold it.
    pub fn into_inner(self) -> Result<Volume, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(m) => Ok(m.into_inner()),
            Err(inner) => Err(Self {
                inner,
                spins: self.spins,
            }),
        }
    }
}
