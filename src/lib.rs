//! A persistent, on-disk keyed object cache bounded by a total byte
//! budget and, optionally, a per-entry age limit.
//!
//! Values are written to individual files under a cache directory and
//! tracked by an in-memory metadata index (size + last-access date) so
//! that trimming decisions never require a directory scan. Every
//! mutating operation has a synchronous form that does its work inline
//! on the calling thread, and an asynchronous form that runs the same
//! work through an internal priority queue; see [`cache::DiskCache`].

pub mod cache;
pub mod codec;
pub mod error;
pub mod metadata;
pub mod queue;
pub mod trash;

pub use cache::{CacheBuilder, DiskCache};
pub use error::{CacheError, Result};
pub use metadata::Entry;
pub use queue::Priority;

use std::sync::{Arc, OnceLock};

static SHARED: OnceLock<Arc<DiskCache<Vec<u8>>>> = OnceLock::new();

/// The process-wide default cache instance, created on first access
/// under the system cache directory with the crate's built-in defaults.
/// Fixed to `Vec<u8>` payloads, since a shared singleton can't carry a
/// caller-specific value type.
///
/// # Panics
///
/// Panics if the platform has no usable cache/temp directory, or if
/// called outside a tokio runtime (bootstrap and TTL sweeping need one).
pub fn shared() -> Arc<DiskCache<Vec<u8>>> {
    SHARED
        .get_or_init(|| {
            let root = std::env::temp_dir();
            Arc::new(
                DiskCache::new("default", root).expect("failed to construct shared default cache"),
            )
        })
        .clone()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shared_returns_the_same_instance() {
        let a = shared();
        let b = shared();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
