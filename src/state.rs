//! ==============================================================================
//! state.rs - the latest published reading, shared across tasks
//! ==============================================================================
//!
//! single writer (the sample scheduler), many readers (http handlers).
//!
//! the snapshot lives behind an `Arc<Reading>`; publishing builds the new
//! reading off-lock and only swaps the pointer under the write lock, so:
//! - readers never see a reading half old and half new
//! - a reader holds the read lock for one `Arc::clone`, never for sensor i/o
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::Reading;

#[derive(Clone, Default)]
pub struct SharedReadingState {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshot: RwLock<Option<Arc<Reading>>>,
    published: AtomicU64,
}

impl SharedReadingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, reading: Reading) {
        let next = Arc::new(reading);
        {
            let mut slot = self
                .inner
                .snapshot
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(next);
        }
        self.inner.published.fetch_add(1, Ordering::Release);
    }

    /// The latest published reading, or [`Reading::no_data`] before the first
    /// publish.
    pub fn current(&self) -> Reading {
        self.snapshot().map_or_else(Reading::no_data, |reading| *reading)
    }

    /// Shared handle to the latest snapshot without copying it.
    pub fn snapshot(&self) -> Option<Arc<Reading>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish_count(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }
}
