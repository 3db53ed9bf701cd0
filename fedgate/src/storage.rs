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

//! # storage
//!
//! Abstractions for the fedgate storage layer.
//!
//! fedgate doesn't own a database; it requires one. [Backend] is the read/write contract the
//! dispatcher & the permission gate depend upon. The one property of any implementation that
//! really matters is that each `put_*` for a record derived from a remote object fails with a
//! *distinguishable* [Error::AlreadyExists] when a record with the same URI is already present:
//! that's how redelivery of an activity is detected & made harmless.

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace, IntoError};
use url::Url;

use fedgate_shared::domain::Domain;

use crate::entities::{
    Account, AccountId, Block, DomainPermission, DomainPermissionDraft, DomainPermissionDraftId,
    DomainPermissionId, DomainPermissionSubscription, DomainPermissionSubscriptionId,
    DomainPermissionType, FollowRequest, Report, Status, StatusFave,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{entity} {key} already exists"))]
    AlreadyExists {
        entity: &'static str,
        key: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wrap an implementation-specific error
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        let source: Box<dyn std::error::Error + Send + Sync + 'static> = Box::new(err);
        BackendSnafu.into_error(source)
    }
    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Error {
        AlreadyExistsSnafu {
            entity,
            key: key.into(),
        }
        .build()
    }
    /// True if this error represents a uniqueness violation on a record's identity
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       Paging & filtering                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Order {
    /// Paging down: newest first, starting just below `max_id`
    #[default]
    Descending,
    /// Paging up: the items immediately above `min_id`
    Ascending,
}

/// A window onto a list of records ordered by their (time-ordered) identifiers
///
/// Results are *always* returned newest-first. When paging up (`order` is [Order::Ascending]) the
/// implementation selects the `limit` records closest to `min_id` & then reverses them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Page<T> {
    /// Exclusive upper bound
    pub max_id: Option<T>,
    /// Exclusive lower bound
    pub min_id: Option<T>,
    pub limit: Option<usize>,
    pub order: Order,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Page {
            max_id: None,
            min_id: None,
            limit: None,
            order: Order::Descending,
        }
    }
}

impl<T: Copy + Ord> Page<T> {
    /// The `limit` records older than `max_id`
    pub fn older_than(max_id: T, limit: usize) -> Page<T> {
        Page {
            max_id: Some(max_id),
            min_id: None,
            limit: Some(limit),
            order: Order::Descending,
        }
    }
    /// The `limit` records immediately newer than `min_id`
    pub fn newer_than(min_id: T, limit: usize) -> Page<T> {
        Page {
            max_id: None,
            min_id: Some(min_id),
            limit: Some(limit),
            order: Order::Ascending,
        }
    }
    pub fn contains(&self, id: &T) -> bool {
        self.max_id.is_none_or(|max| *id < max) && self.min_id.is_none_or(|min| *id > min)
    }
    /// Select this page from `items`, given a way to extract each one's identifier
    pub fn select<I, F>(&self, items: I, id: F) -> Vec<I::Item>
    where
        I: IntoIterator,
        F: Fn(&I::Item) -> T,
    {
        let mut selected: Vec<I::Item> = items
            .into_iter()
            .filter(|item| self.contains(&id(item)))
            .collect();
        match self.order {
            Order::Descending => selected.sort_by_key(|item| std::cmp::Reverse(id(item))),
            Order::Ascending => selected.sort_by_key(|item| id(item)),
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        if self.order == Order::Ascending {
            selected.reverse();
        }
        selected
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DraftFilter {
    pub permission_type: Option<DomainPermissionType>,
    pub subscription_id: Option<DomainPermissionSubscriptionId>,
    /// Must already be normalized
    pub domain: Option<Domain>,
    pub created_by: Option<AccountId>,
}

impl DraftFilter {
    pub fn matches(&self, draft: &DomainPermissionDraft) -> bool {
        self.permission_type
            .is_none_or(|t| t == draft.permission_type)
            && self
                .subscription_id
                .is_none_or(|s| Some(s) == draft.subscription_id)
            && self.domain.as_ref().is_none_or(|d| *d == draft.domain)
            && self
                .created_by
                .is_none_or(|a| a == draft.created_by_account_id)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscriptionFilter {
    pub permission_type: Option<DomainPermissionType>,
}

impl SubscriptionFilter {
    pub fn matches(&self, sub: &DomainPermissionSubscription) -> bool {
        self.permission_type
            .is_none_or(|t| t == sub.permission_type)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Backend                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Backend {
    /// Retrieve an [Account] by id; `None` means there is no such account
    async fn account_by_id(&self, id: &AccountId) -> Result<Option<Account>>;
    /// Retrieve an [Account] by its ActivityPub actor ID
    async fn account_by_uri(&self, uri: &Url) -> Result<Option<Account>>;
    /// Retrieve a *local* [Account] given its username
    async fn local_account_by_username(&self, username: &str) -> Result<Option<Account>>;

    /// Persist a [Status]; fails with [Error::AlreadyExists] if a status with the same URI exists
    async fn put_status(&self, status: &Status) -> Result<()>;
    async fn status_by_uri(&self, uri: &Url) -> Result<Option<Status>>;
    /// Persist a [FollowRequest], unique on URI
    async fn put_follow_request(&self, follow_request: &FollowRequest) -> Result<()>;
    /// Persist a [StatusFave], unique on URI
    async fn put_status_fave(&self, fave: &StatusFave) -> Result<()>;
    /// Persist a [Report], unique on URI
    async fn put_report(&self, report: &Report) -> Result<()>;
    /// Persist a [Block], unique on URI
    async fn put_block(&self, block: &Block) -> Result<()>;

    /// Persist a [DomainPermission]; at most one of each type may exist per domain
    async fn put_domain_permission(&self, permission: &DomainPermission) -> Result<()>;
    async fn domain_permission(
        &self,
        permission_type: DomainPermissionType,
        domain: &Domain,
    ) -> Result<Option<DomainPermission>>;
    async fn domain_permission_by_id(
        &self,
        permission_type: DomainPermissionType,
        id: &DomainPermissionId,
    ) -> Result<Option<DomainPermission>>;
    /// All permissions of the given type, newest first
    async fn domain_permissions(
        &self,
        permission_type: DomainPermissionType,
    ) -> Result<Vec<DomainPermission>>;
    /// Remove the permission of the given type for `domain`; return the number of rows removed
    async fn delete_domain_permission(
        &self,
        permission_type: DomainPermissionType,
        domain: &Domain,
    ) -> Result<usize>;
    /// The complete set of domains for which a permission of the given type exists
    async fn domain_permission_domains(
        &self,
        permission_type: DomainPermissionType,
    ) -> Result<Vec<Domain>>;

    /// Persist a [DomainPermissionDraft]; unique on (type, domain, subscription)
    async fn put_domain_permission_draft(&self, draft: &DomainPermissionDraft) -> Result<()>;
    async fn domain_permission_draft_by_id(
        &self,
        id: &DomainPermissionDraftId,
    ) -> Result<Option<DomainPermissionDraft>>;
    async fn domain_permission_drafts(
        &self,
        filter: &DraftFilter,
        page: &Page<DomainPermissionDraftId>,
    ) -> Result<Vec<DomainPermissionDraft>>;
    /// Return the number of rows removed
    async fn delete_domain_permission_draft(&self, id: &DomainPermissionDraftId) -> Result<usize>;

    /// Persist a [DomainPermissionSubscription]; unique on URI
    async fn put_domain_permission_subscription(
        &self,
        sub: &DomainPermissionSubscription,
    ) -> Result<()>;
    async fn domain_permission_subscription_by_id(
        &self,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<Option<DomainPermissionSubscription>>;
    async fn domain_permission_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        page: &Page<DomainPermissionSubscriptionId>,
    ) -> Result<Vec<DomainPermissionSubscription>>;
    /// Return the number of rows removed
    async fn delete_domain_permission_subscription(
        &self,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<usize>;
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::entities::StatusId;

    use chrono::{TimeZone, Utc};

    fn ids() -> Vec<StatusId> {
        (1..=5)
            .map(|day| StatusId::from_datetime(&Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()))
            .collect()
    }

    #[test]
    fn test_paging() {
        let ids = ids();

        // Everything, newest first
        assert_eq!(
            Page::default().select(ids.clone(), |id| *id),
            ids.iter().rev().copied().collect::<Vec<StatusId>>()
        );
        // Paging down
        assert_eq!(
            Page::older_than(ids[3], 2).select(ids.clone(), |id| *id),
            vec![ids[2], ids[1]]
        );
        // Paging up: the two immediately above ids[0], still newest first
        assert_eq!(
            Page::newer_than(ids[0], 2).select(ids.clone(), |id| *id),
            vec![ids[2], ids[1]]
        );
        // Nothing there is not an error
        assert!(Page::older_than(ids[0], 10)
            .select(ids.clone(), |id| *id)
            .is_empty());
    }

    #[test]
    fn test_errors() {
        let err = Error::already_exists("status", "https://remote.example/notes/1");
        assert!(err.is_already_exists());
        assert_eq!(
            format!("{}", err),
            "status https://remote.example/notes/1 already exists"
        );

        let err = Error::new(std::io::Error::other("disk full"));
        assert!(!err.is_already_exists());
        assert_eq!(format!("{}", err), "disk full");
    }
}
