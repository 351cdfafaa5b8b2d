use std::{future::Future, hash::Hash, sync::Arc};

use dashmap::DashMap;

use crate::{
    cached::LatestValueCache,
    outcome::{CacheError, Outcome},
    BoxFut,
};

type KeyedProducer<K, T, E> = dyn Fn(K) -> BoxFut<'static, Result<T, E>> + Send + Sync;

/// One [`LatestValueCache`] per key, created on first request.
///
/// Keys are independent: each has its own single in-flight invocation and its own stored value.
pub struct MapCache<K, T, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    inner: DashMap<K, LatestValueCache<T, E>>,
    f: Arc<KeyedProducer<K, T, E>>,
}

impl<K, T, E> MapCache<K, T, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn from_future_source<F, Fut>(source: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: DashMap::new(),
            f: Arc::new(move |key| -> BoxFut<'static, Result<T, E>> { Box::pin(source(key)) }),
        }
    }

    pub fn get(&self, key: K) -> BoxFut<'static, Result<T, CacheError<E>>> {
        self.cache_for(key).get()
    }

    pub fn has_value(&self, key: &K) -> bool {
        self.inner
            .get(key)
            .map(|cached| cached.has_value())
            .unwrap_or(false)
    }

    pub fn clear(&self, key: &K) -> Option<T> {
        self.inner.get(key).and_then(|cached| cached.clear())
    }

    pub fn clear_all(&self) {
        for cached in self.inner.iter() {
            cached.clear();
        }
    }

    /// Number of keys that have been requested so far.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn cache_for(&self, key: K) -> LatestValueCache<T, E> {
        // cloned out so the shard lock is released before `get()`
        self.inner
            .entry(key.clone())
            .or_insert_with(|| {
                let f = self.f.clone();
                LatestValueCache::from_boxed(
                    Box::new(move || f(key.clone())),
                    Box::new(Outcome::<T, E>::is_value),
                )
            })
            .value()
            .clone()
    }
}
