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

//! # Domain permission drafts & subscriptions
//!
//! Moderators don't only create blocks & allows by hand: they may subscribe to lists maintained
//! elsewhere ([DomainPermissionSubscription]s), and entries from those lists (or from manual
//! submissions) may arrive as [DomainPermissionDraft]s awaiting approval. Promoting a draft to a
//! proper block or allow is done through the [DomainGate](crate::domain_gate::DomainGate).
//!
//! Both record types are read by id far more often than they're written, so each is fronted by a
//! [KeyedCache]. Every write goes through the cache (on success) & every delete invalidates it.

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::sync::Mutex;
use tracing::debug;

use fedgate_cache::KeyedCache;
use fedgate_shared::domain::{self, Domain};

use crate::{
    entities::{
        Account, AccountId, DomainPermissionDraft, DomainPermissionDraftId,
        DomainPermissionSubscription, DomainPermissionSubscriptionId, DomainPermissionType,
    },
    storage::{Backend as StorageBackend, DraftFilter, Page, SubscriptionFilter},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid domain: {source}"))]
    BadDomain {
        source: domain::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("That draft (or one for the same domain) already exists"))]
    DuplicateDraft { backtrace: Backtrace },
    #[snafu(display("A subscription to that URI already exists"))]
    DuplicateSubscription { backtrace: Backtrace },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub draft_cache_capacity: NonZeroUsize,
    pub subscription_cache_capacity: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            draft_cache_capacity: NonZeroUsize::new(256).unwrap(/* known good */),
            subscription_cache_capacity: NonZeroUsize::new(64).unwrap(/* known good */),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       DomainPermissions                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct DomainPermissions {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    drafts: KeyedCache<DomainPermissionDraftId, DomainPermissionDraft>,
    subscriptions: KeyedCache<DomainPermissionSubscriptionId, DomainPermissionSubscription>,
}

impl DomainPermissions {
    pub fn new(config: &Config, storage: Arc<dyn StorageBackend + Send + Sync>) -> DomainPermissions {
        DomainPermissions {
            storage,
            drafts: KeyedCache::new(config.draft_cache_capacity),
            subscriptions: KeyedCache::new(config.subscription_cache_capacity),
        }
    }

    /// Store a new draft
    ///
    /// Fails with [Error::DuplicateDraft] if a draft for the same (type, domain, subscription)
    /// already exists.
    pub async fn put_draft(&self, draft: DomainPermissionDraft) -> Result<DomainPermissionDraft> {
        let storage = &self.storage;
        let record = &draft;
        self.drafts
            .store(draft.id, draft.clone(), move || async move {
                storage.put_domain_permission_draft(record).await
            })
            .await
            .map_err(|err| {
                if err.is_already_exists() {
                    DuplicateDraftSnafu.build()
                } else {
                    StorageSnafu.into_error(err)
                }
            })?;
        debug!("Stored draft {} for {}", draft.id, draft.domain);
        Ok(draft)
    }
    pub async fn draft_by_id(
        &self,
        id: &DomainPermissionDraftId,
    ) -> Result<Option<DomainPermissionDraft>> {
        let storage = &self.storage;
        self.drafts
            .load_one(id, move || async move {
                storage.domain_permission_draft_by_id(id).await
            })
            .await
            .context(StorageSnafu)
    }
    /// List drafts matching `filter`, newest first
    ///
    /// `domain`, if given, may be in any spelling; it's normalized before the lookup.
    pub async fn drafts(
        &self,
        permission_type: Option<DomainPermissionType>,
        subscription_id: Option<DomainPermissionSubscriptionId>,
        domain: Option<&str>,
        created_by: Option<AccountId>,
        page: &Page<DomainPermissionDraftId>,
    ) -> Result<Vec<DomainPermissionDraft>> {
        let filter = DraftFilter {
            permission_type,
            subscription_id,
            domain: domain
                .map(Domain::parse)
                .transpose()
                .context(BadDomainSnafu)?,
            created_by,
        };
        self.storage
            .domain_permission_drafts(&filter, page)
            .await
            .context(StorageSnafu)
    }
    /// Remove a draft (rejecting it, or once it has been promoted); removing a draft that doesn't
    /// exist is not an error
    pub async fn delete_draft(&self, id: &DomainPermissionDraftId) -> Result<()> {
        let rows = self
            .storage
            .delete_domain_permission_draft(id)
            .await
            .context(StorageSnafu)?;
        if rows == 0 {
            debug!("No draft {} to delete", id);
        }
        self.drafts.invalidate(id).await;
        Ok(())
    }

    pub async fn put_subscription(
        &self,
        sub: DomainPermissionSubscription,
    ) -> Result<DomainPermissionSubscription> {
        let storage = &self.storage;
        let record = &sub;
        self.subscriptions
            .store(sub.id, sub.clone(), move || async move {
                storage.put_domain_permission_subscription(record).await
            })
            .await
            .map_err(|err| {
                if err.is_already_exists() {
                    DuplicateSubscriptionSnafu.build()
                } else {
                    StorageSnafu.into_error(err)
                }
            })?;
        debug!("Stored subscription {} to {}", sub.id, sub.uri);
        Ok(sub)
    }
    pub async fn subscription_by_id(
        &self,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<Option<DomainPermissionSubscription>> {
        let storage = &self.storage;
        self.subscriptions
            .load_one(id, move || async move {
                storage.domain_permission_subscription_by_id(id).await
            })
            .await
            .context(StorageSnafu)
    }
    pub async fn subscriptions(
        &self,
        permission_type: Option<DomainPermissionType>,
        page: &Page<DomainPermissionSubscriptionId>,
    ) -> Result<Vec<DomainPermissionSubscription>> {
        self.storage
            .domain_permission_subscriptions(&SubscriptionFilter { permission_type }, page)
            .await
            .context(StorageSnafu)
    }
    pub async fn delete_subscription(&self, id: &DomainPermissionSubscriptionId) -> Result<()> {
        let rows = self
            .storage
            .delete_domain_permission_subscription(id)
            .await
            .context(StorageSnafu)?;
        if rows == 0 {
            debug!("No subscription {} to delete", id);
        }
        self.subscriptions.invalidate(id).await;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         AccountLoader                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Resolve `created_by_account_id` references for the duration of one request
///
/// Permission records store only the id of the account that created them. Build one of these per
/// request & ask it for accounts; each distinct id is looked up at most once. Ids that resolve to
/// nothing are remembered, too.
pub struct AccountLoader {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    accounts: Mutex<HashMap<AccountId, Option<Account>>>,
}

impl AccountLoader {
    pub fn new(storage: Arc<dyn StorageBackend + Send + Sync>) -> AccountLoader {
        AccountLoader {
            storage,
            accounts: Mutex::new(HashMap::new()),
        }
    }
    pub async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(id) {
            return Ok(account.clone());
        }
        let account = self.storage.account_by_id(id).await.context(StorageSnafu)?;
        accounts.insert(*id, account.clone());
        Ok(account)
    }
    pub async fn created_by_draft(&self, draft: &DomainPermissionDraft) -> Result<Option<Account>> {
        self.account(&draft.created_by_account_id).await
    }
    pub async fn created_by_subscription(
        &self,
        sub: &DomainPermissionSubscription,
    ) -> Result<Option<Account>> {
        self.account(&sub.created_by_account_id).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{Duration, Utc};
    use url::Url;

    use crate::{entities::SubscriptionContentType, memory::InMemory};

    fn component() -> (DomainPermissions, Arc<InMemory>) {
        let storage = Arc::new(InMemory::new());
        (
            DomainPermissions::new(&Config::default(), storage.clone()),
            storage,
        )
    }

    fn draft(domain: &str, days_ago: i64, creator: AccountId) -> DomainPermissionDraft {
        let mut draft = DomainPermissionDraft::new(
            DomainPermissionType::Block,
            Domain::parse(domain).unwrap(),
            creator,
        );
        let when = Utc::now() - Duration::days(days_ago);
        draft.id = DomainPermissionDraftId::from_datetime(&when);
        draft.created_at = when;
        draft
    }

    #[tokio::test]
    async fn test_drafts() {
        let (permissions, storage) = component();
        let creator = AccountId::new();

        let first = permissions
            .put_draft(draft("one.example", 3, creator))
            .await
            .unwrap();
        let second = permissions
            .put_draft(draft("two.example", 2, creator))
            .await
            .unwrap();
        let third = permissions
            .put_draft(draft("bücher.example", 1, creator))
            .await
            .unwrap();
        assert!(matches!(
            permissions.put_draft(draft("one.example", 0, creator)).await,
            Err(Error::DuplicateDraft { .. })
        ));

        // Served from the cache, even with storage down
        storage.set_unavailable(true);
        assert_eq!(
            permissions.draft_by_id(&first.id).await.unwrap(),
            Some(first.clone())
        );
        storage.set_unavailable(false);

        let all = permissions
            .drafts(None, None, None, None, &Page::default())
            .await
            .unwrap();
        assert_eq!(
            all.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![third.id, second.id, first.id]
        );
        // The domain filter accepts any spelling
        let found = permissions
            .drafts(None, None, Some("BÜCHER.example"), None, &Page::default())
            .await
            .unwrap();
        assert_eq!(found, vec![third.clone()]);
        assert!(permissions
            .drafts(None, None, Some("no such!"), None, &Page::default())
            .await
            .is_err());
        // Paging down from the newest
        let older = permissions
            .drafts(None, None, None, None, &Page::older_than(third.id, 1))
            .await
            .unwrap();
        assert_eq!(older, vec![second.clone()]);

        permissions.delete_draft(&second.id).await.unwrap();
        assert!(permissions.draft_by_id(&second.id).await.unwrap().is_none());
        // Again: not an error
        permissions.delete_draft(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let (permissions, _) = component();
        let creator = AccountId::new();
        let uri = Url::parse("https://lists.example/blocks.csv").unwrap();
        let sub = permissions
            .put_subscription(DomainPermissionSubscription::new(
                DomainPermissionType::Block,
                SubscriptionContentType::Csv,
                uri.clone(),
                creator,
            ))
            .await
            .unwrap();
        assert!(matches!(
            permissions
                .put_subscription(DomainPermissionSubscription::new(
                    DomainPermissionType::Allow,
                    SubscriptionContentType::Plain,
                    uri.clone(),
                    creator,
                ))
                .await,
            Err(Error::DuplicateSubscription { .. })
        ));
        assert_eq!(
            permissions
                .subscription_by_id(&sub.id)
                .await
                .unwrap()
                .unwrap()
                .uri,
            uri
        );
        assert_eq!(
            permissions
                .subscriptions(Some(DomainPermissionType::Block), &Page::default())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(permissions
            .subscriptions(Some(DomainPermissionType::Allow), &Page::default())
            .await
            .unwrap()
            .is_empty());
        permissions.delete_subscription(&sub.id).await.unwrap();
        assert!(permissions.subscription_by_id(&sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_account_loader() {
        let storage = Arc::new(InMemory::new());
        let moderator = Account {
            id: AccountId::new(),
            username: "moderator".to_owned(),
            domain: None,
            uri: Url::parse("https://local.example/users/moderator").unwrap(),
        };
        storage.add_account(moderator.clone()).await;
        let loader = AccountLoader::new(storage.clone());
        let draft = draft("one.example", 0, moderator.id);
        assert_eq!(
            loader.created_by_draft(&draft).await.unwrap(),
            Some(moderator.clone())
        );
        // Memoized: no second trip to storage
        storage.set_unavailable(true);
        assert_eq!(
            loader.created_by_draft(&draft).await.unwrap(),
            Some(moderator)
        );
        assert!(loader.account(&AccountId::new()).await.is_err());
    }
}
