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

//! # Domain set cache
//!
//! [DomainCache] holds either nothing (it has never been loaded, or it has been cleared since) or
//! the complete membership of one domain set. All state lives behind a single [RwLock], so a reader
//! sees either the entire set as it stood before a [clear](DomainCache::clear) or no set at all;
//! there is no state in which half a set is visible.
//!
//! On a miss, the caller's loader runs while the write lock is held. Concurrent callers that miss
//! at the same time queue up on the write lock, & on acquiring it find the set already installed,
//! so a burst of misses costs one storage read rather than one per caller.

use std::{collections::HashSet, future::Future};

use tokio::sync::RwLock;
use tracing::debug;

use fedgate_shared::domain::Domain;

/// Lazily-loaded, all-or-nothing cache of a set of domains
#[derive(Debug, Default)]
pub struct DomainCache {
    domains: RwLock<Option<HashSet<String>>>,
}

// A domain matches the set if it, or any parent domain, is a member.
fn contains(set: &HashSet<String>, domain: &Domain) -> bool {
    domain.suffixes().any(|s| set.contains(s))
}

impl DomainCache {
    pub fn new() -> DomainCache {
        DomainCache::default()
    }
    /// Test `domain` for membership, invoking `loader` to hydrate the cache if need be
    ///
    /// `loader` must produce the *complete* membership of the set. Should it fail, the cache is
    /// left empty & the error returned.
    pub async fn matches<F, Fut, E>(&self, domain: &Domain, loader: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Domain>, E>>,
    {
        {
            let guard = self.domains.read().await;
            if let Some(set) = guard.as_ref() {
                return Ok(contains(set, domain));
            }
        }

        let mut guard = self.domains.write().await;
        // Another caller may have loaded the set while we waited on the write lock
        if guard.is_none() {
            let loaded = loader()
                .await?
                .into_iter()
                .map(|d| d.to_string())
                .collect::<HashSet<String>>();
            debug!("Loaded {} domains", loaded.len());
            *guard = Some(loaded);
        }
        Ok(guard
            .as_ref()
            .map(|set| contains(set, domain))
            .unwrap_or(false))
    }
    /// Drop the cached set; the next call to [matches](DomainCache::matches) will reload it
    pub async fn clear(&self) {
        *self.domains.write().await = None;
    }
    pub async fn is_loaded(&self) -> bool {
        self.domains.read().await.is_some()
    }
    /// The number of cached domains (zero if not loaded)
    pub async fn len(&self) -> usize {
        self.domains.read().await.as_ref().map_or(0, |s| s.len())
    }
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
