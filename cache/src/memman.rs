use std::{
    fmt,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::debug;

/// Tracks enrolled caches so their memory can be inspected and released in one place.
///
/// Caches are held weakly; dropping the last handle to a cache drops it from here
/// on the next pass.
pub struct MemoryManager {
    data: DashMap<usize, Weak<dyn Data + Send + Sync>>,
}

lazy_static! {
    pub static ref MEMORY_MANAGER: MemoryManager = MemoryManager::new();
}

pub trait Data {
    /// Footprint of the held value, zero when there is none.
    fn get_size(&self) -> usize;
    fn has_value(&self) -> bool;
    /// Drops the held value. Returns whether there was one.
    fn free(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub live: usize,
    pub holding_value: usize,
    pub bytes: usize,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} live caches, {} holding values, {} bytes",
            self.live, self.holding_value, self.bytes
        )
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    pub fn enroll(&self, data: Weak<dyn Data + Send + Sync>) {
        let addr = data.as_ptr() as *const () as usize;
        self.data.insert(addr, data);
    }

    /// Clears every live cache. Returns how many held a value.
    pub fn flush_all(&self) -> usize {
        let flushed = self.live().iter().filter(|data| data.free()).count();
        debug!(flushed, "Flushed enrolled caches");
        flushed
    }

    pub fn stats(&self) -> MemoryStats {
        self.live()
            .iter()
            .fold(MemoryStats::default(), |mut stats, data| {
                stats.live += 1;
                if data.has_value() {
                    stats.holding_value += 1;
                    stats.bytes += data.get_size();
                }
                stats
            })
    }

    /// Upgrades every enrolled cache, forgetting the ones that are gone.
    fn live(&self) -> Vec<Arc<dyn Data + Send + Sync>> {
        self.data.retain(|_, data| data.strong_count() > 0);
        self.data
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use crate::cached::LatestValueCache;

    fn cache(value: &'static str) -> LatestValueCache<String, Infallible> {
        LatestValueCache::new(move || async move { Ok(value.to_owned()) })
    }

    #[tokio::test]
    async fn flush_all_clears_enrolled_caches() {
        let manager = MemoryManager::new();
        let a = cache("a");
        let b = cache("bb");
        a.enroll(&manager);
        b.enroll(&manager);

        a.get().await.expect("producer is infallible");
        assert_eq!(manager.stats().live, 2);
        assert_eq!(manager.stats().holding_value, 1);
        assert!(manager.stats().bytes > 0);

        assert_eq!(manager.flush_all(), 1);
        assert!(!a.has_value());
        assert_eq!(manager.stats().holding_value, 0);
        assert_eq!(manager.stats().bytes, 0);
    }

    #[tokio::test]
    async fn dropped_caches_are_forgotten() {
        let manager = MemoryManager::new();
        let a = cache("a");
        a.enroll(&manager);
        {
            let b = cache("b");
            b.enroll(&manager);
            assert_eq!(manager.stats().live, 2);
        }
        assert_eq!(manager.stats().live, 1);
        drop(a);
        assert_eq!(manager.stats(), MemoryStats::default());
    }

    #[tokio::test]
    async fn clones_share_one_entry() {
        let manager = MemoryManager::new();
        let a = cache("a");
        a.enroll(&manager);
        a.clone().enroll(&manager);
        assert_eq!(manager.stats().live, 1);
    }
}
