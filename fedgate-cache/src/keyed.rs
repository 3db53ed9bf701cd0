// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of fedgate.
//
// fedgate is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// fedgate is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with fedgate.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Keyed record cache
//!
//! A bounded LRU map from identifier to record, fronting a storage table that is read by id. Loads
//! & stores run with the cache lock held, so an [invalidate](KeyedCache::invalidate) can never be
//! overtaken by a concurrent load that read the row before it was deleted. That serializes all
//! loads through one lock, which is fine for the moderation records this fronts.

use std::{future::Future, hash::Hash, num::NonZeroUsize};

use lru::LruCache;
use tokio::sync::Mutex;

pub struct KeyedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> KeyedCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> KeyedCache<K, V> {
        KeyedCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
    /// Look `key` up, invoking `loader` on a miss
    ///
    /// Values the loader finds are cached; a `None` result is not, so a record created after a
    /// miss will be found next time.
    pub async fn load_one<F, Fut, E>(&self, key: &K, loader: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(value) = entries.get(key) {
            return Ok(Some(value.clone()));
        }
        let value = loader().await?;
        if let Some(value) = &value {
            entries.put(key.clone(), value.clone());
        }
        Ok(value)
    }
    /// Persist `value` via `writer`; on success, cache it under `key`
    pub async fn store<F, Fut, E>(&self, key: K, value: V, writer: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut entries = self.entries.lock().await;
        writer().await?;
        entries.put(key, value);
        Ok(())
    }
    /// Remove `key`, returning the evicted value (if any)
    pub async fn invalidate(&self, key: &K) -> Option<V> {
        self.entries.lock().await.pop(key)
    }
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use snafu::{prelude::*, Backtrace};

    #[derive(Debug, Snafu)]
    #[snafu(display("write failed"))]
    struct WriteFailed {
        backtrace: Backtrace,
    }

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_load_one() {
        let cache: KeyedCache<String, u32> = KeyedCache::new(cap(4));
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let loader = move || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, WriteFailed>(Some(11))
        };

        let key = "a".to_owned();
        assert_eq!(cache.load_one(&key, loader).await.unwrap(), Some(11));
        assert_eq!(cache.load_one(&key, loader).await.unwrap(), Some(11));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        assert_eq!(cache.invalidate(&key).await, Some(11));
        assert_eq!(cache.load_one(&key, loader).await.unwrap(), Some(11));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_misses_not_cached() {
        let cache: KeyedCache<u8, u8> = KeyedCache::new(cap(4));
        let missing = || async { Ok::<Option<u8>, WriteFailed>(None) };
        assert_eq!(cache.load_one(&1, missing).await.unwrap(), None);
        assert!(cache.is_empty().await);
        let present = || async { Ok::<_, WriteFailed>(Some(2)) };
        assert_eq!(cache.load_one(&1, present).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_store() {
        let cache: KeyedCache<u8, u8> = KeyedCache::new(cap(2));
        cache
            .store(1, 1, || async { Ok::<(), WriteFailed>(()) })
            .await
            .unwrap();
        assert!(cache
            .store(2, 2, || async { WriteFailedSnafu.fail() })
            .await
            .is_err());
        assert_eq!(cache.len().await, 1);

        cache
            .store(2, 2, || async { Ok::<(), WriteFailed>(()) })
            .await
            .unwrap();
        cache
            .store(3, 3, || async { Ok::<(), WriteFailed>(()) })
            .await
            .unwrap();
        // capacity two; `1` is least-recently used
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.invalidate(&1).await, None);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
