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

//! # In-memory storage
//!
//! A [Backend] implementation that keeps everything in process memory. The daemon uses it when no
//! external database is configured, and the test suites drive the dispatcher & gate against it.
//!
//! Uniqueness constraints are enforced just as a relational store would enforce them: every
//! interaction record is keyed on its URI, so a second `put_*` of the same remote object fails
//! with [storage::Error::AlreadyExists].

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use itertools::Itertools;
use snafu::{prelude::*, Backtrace};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use fedgate_shared::domain::Domain;

use crate::{
    entities::{
        Account, AccountId, Block, DomainPermission, DomainPermissionDraft,
        DomainPermissionDraftId, DomainPermissionId, DomainPermissionSubscription,
        DomainPermissionSubscriptionId, DomainPermissionType, FollowRequest, Report, Status,
        StatusFave,
    },
    storage::{self, Backend, DraftFilter, Page, SubscriptionFilter},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The in-memory store has been marked unavailable"))]
    Unavailable { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, storage::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            InMemory                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    statuses: HashMap<Url, Status>,
    follow_requests: HashMap<Url, FollowRequest>,
    faves: HashMap<Url, StatusFave>,
    reports: HashMap<Url, Report>,
    blocks: HashMap<Url, Block>,
    permissions: HashMap<(DomainPermissionType, Domain), DomainPermission>,
    drafts: HashMap<DomainPermissionDraftId, DomainPermissionDraft>,
    subscriptions: HashMap<DomainPermissionSubscriptionId, DomainPermissionSubscription>,
}

// Insert `value` under `key`, refusing to overwrite
fn insert_unique<K, V>(
    table: &mut HashMap<K, V>,
    entity: &'static str,
    key: K,
    value: V,
) -> Result<()>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    match table.entry(key) {
        Entry::Occupied(entry) => Err(storage::Error::already_exists(
            entity,
            entry.key().to_string(),
        )),
        Entry::Vacant(entry) => {
            entry.insert(value);
            Ok(())
        }
    }
}

/// A [Backend] backed by process memory
#[derive(Default)]
pub struct InMemory {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    domain_loads: AtomicUsize,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
    /// Add an account; accounts are otherwise read-only as far as [Backend] is concerned
    pub async fn add_account(&self, account: Account) {
        self.tables
            .write()
            .await
            .accounts
            .insert(account.id, account);
    }
    /// While `unavailable` is set, every [Backend] operation fails
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
    /// The number of times a complete domain set has been loaded
    pub fn domain_loads(&self) -> usize {
        self.domain_loads.load(Ordering::SeqCst)
    }
    pub async fn statuses(&self) -> Vec<Status> {
        self.tables
            .read()
            .await
            .statuses
            .values()
            .cloned()
            .sorted_by_key(|s| s.id)
            .collect()
    }
    pub async fn follow_requests(&self) -> Vec<FollowRequest> {
        self.tables
            .read()
            .await
            .follow_requests
            .values()
            .cloned()
            .sorted_by_key(|f| f.id)
            .collect()
    }
    pub async fn faves(&self) -> Vec<StatusFave> {
        self.tables
            .read()
            .await
            .faves
            .values()
            .cloned()
            .sorted_by_key(|f| f.id)
            .collect()
    }
    pub async fn reports(&self) -> Vec<Report> {
        self.tables
            .read()
            .await
            .reports
            .values()
            .cloned()
            .sorted_by_key(|r| r.id)
            .collect()
    }
    pub async fn blocks(&self) -> Vec<Block> {
        self.tables
            .read()
            .await
            .blocks
            .values()
            .cloned()
            .sorted_by_key(|b| b.id)
            .collect()
    }
    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(storage::Error::new(UnavailableSnafu.build()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for InMemory {
    async fn account_by_id(&self, id: &AccountId) -> Result<Option<Account>> {
        self.check()?;
        Ok(self.tables.read().await.accounts.get(id).cloned())
    }
    async fn account_by_uri(&self, uri: &Url) -> Result<Option<Account>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.uri == *uri)
            .cloned())
    }
    async fn local_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.is_local() && a.username == username)
            .cloned())
    }

    async fn put_status(&self, status: &Status) -> Result<()> {
        self.check()?;
        insert_unique(
            &mut self.tables.write().await.statuses,
            "status",
            status.uri.clone(),
            status.clone(),
        )
    }
    async fn status_by_uri(&self, uri: &Url) -> Result<Option<Status>> {
        self.check()?;
        Ok(self.tables.read().await.statuses.get(uri).cloned())
    }
    async fn put_follow_request(&self, follow_request: &FollowRequest) -> Result<()> {
        self.check()?;
        insert_unique(
            &mut self.tables.write().await.follow_requests,
            "follow request",
            follow_request.uri.clone(),
            follow_request.clone(),
        )
    }
    async fn put_status_fave(&self, fave: &StatusFave) -> Result<()> {
        self.check()?;
        insert_unique(
            &mut self.tables.write().await.faves,
            "status fave",
            fave.uri.clone(),
            fave.clone(),
        )
    }
    async fn put_report(&self, report: &Report) -> Result<()> {
        self.check()?;
        insert_unique(
            &mut self.tables.write().await.reports,
            "report",
            report.uri.clone(),
            report.clone(),
        )
    }
    async fn put_block(&self, block: &Block) -> Result<()> {
        self.check()?;
        insert_unique(
            &mut self.tables.write().await.blocks,
            "block",
            block.uri.clone(),
            block.clone(),
        )
    }

    async fn put_domain_permission(&self, permission: &DomainPermission) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        match tables
            .permissions
            .entry((permission.permission_type, permission.domain.clone()))
        {
            Entry::Occupied(_) => Err(storage::Error::already_exists(
                "domain permission",
                format!("{}:{}", permission.permission_type, permission.domain),
            )),
            Entry::Vacant(entry) => {
                entry.insert(permission.clone());
                Ok(())
            }
        }
    }
    async fn domain_permission(
        &self,
        permission_type: DomainPermissionType,
        domain: &Domain,
    ) -> Result<Option<DomainPermission>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .permissions
            .get(&(permission_type, domain.clone()))
            .cloned())
    }
    async fn domain_permission_by_id(
        &self,
        permission_type: DomainPermissionType,
        id: &DomainPermissionId,
    ) -> Result<Option<DomainPermission>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .permissions
            .values()
            .find(|p| p.permission_type == permission_type && p.id == *id)
            .cloned())
    }
    async fn domain_permissions(
        &self,
        permission_type: DomainPermissionType,
    ) -> Result<Vec<DomainPermission>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .permissions
            .values()
            .filter(|p| p.permission_type == permission_type)
            .cloned()
            .sorted_by_key(|p| std::cmp::Reverse(p.id))
            .collect())
    }
    async fn delete_domain_permission(
        &self,
        permission_type: DomainPermissionType,
        domain: &Domain,
    ) -> Result<usize> {
        self.check()?;
        Ok(self
            .tables
            .write()
            .await
            .permissions
            .remove(&(permission_type, domain.clone()))
            .map_or(0, |_| 1))
    }
    async fn domain_permission_domains(
        &self,
        permission_type: DomainPermissionType,
    ) -> Result<Vec<Domain>> {
        self.check()?;
        self.domain_loads.fetch_add(1, Ordering::SeqCst);
        let domains = self
            .tables
            .read()
            .await
            .permissions
            .keys()
            .filter(|(t, _)| *t == permission_type)
            .map(|(_, d)| d.clone())
            .collect::<Vec<Domain>>();
        debug!("Loaded {} {} domains", domains.len(), permission_type);
        Ok(domains)
    }

    async fn put_domain_permission_draft(&self, draft: &DomainPermissionDraft) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.drafts.values().any(|d| {
            d.permission_type == draft.permission_type
                && d.domain == draft.domain
                && d.subscription_id == draft.subscription_id
                && d.id != draft.id
        }) {
            return Err(storage::Error::already_exists(
                "domain permission draft",
                format!("{}:{}", draft.permission_type, draft.domain),
            ));
        }
        insert_unique(
            &mut tables.drafts,
            "domain permission draft",
            draft.id,
            draft.clone(),
        )
    }
    async fn domain_permission_draft_by_id(
        &self,
        id: &DomainPermissionDraftId,
    ) -> Result<Option<DomainPermissionDraft>> {
        self.check()?;
        Ok(self.tables.read().await.drafts.get(id).cloned())
    }
    async fn domain_permission_drafts(
        &self,
        filter: &DraftFilter,
        page: &Page<DomainPermissionDraftId>,
    ) -> Result<Vec<DomainPermissionDraft>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(page.select(
            tables.drafts.values().filter(|d| filter.matches(d)).cloned(),
            |d| d.id,
        ))
    }
    async fn delete_domain_permission_draft(&self, id: &DomainPermissionDraftId) -> Result<usize> {
        self.check()?;
        Ok(self
            .tables
            .write()
            .await
            .drafts
            .remove(id)
            .map_or(0, |_| 1))
    }

    async fn put_domain_permission_subscription(
        &self,
        sub: &DomainPermissionSubscription,
    ) -> Result<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables
            .subscriptions
            .values()
            .any(|s| s.uri == sub.uri && s.id != sub.id)
        {
            return Err(storage::Error::already_exists(
                "domain permission subscription",
                sub.uri.to_string(),
            ));
        }
        insert_unique(
            &mut tables.subscriptions,
            "domain permission subscription",
            sub.id,
            sub.clone(),
        )
    }
    async fn domain_permission_subscription_by_id(
        &self,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<Option<DomainPermissionSubscription>> {
        self.check()?;
        Ok(self.tables.read().await.subscriptions.get(id).cloned())
    }
    async fn domain_permission_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        page: &Page<DomainPermissionSubscriptionId>,
    ) -> Result<Vec<DomainPermissionSubscription>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(page.select(
            tables
                .subscriptions
                .values()
                .filter(|s| filter.matches(s))
                .cloned(),
            |s| s.id,
        ))
    }
    async fn delete_domain_permission_subscription(
        &self,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<usize> {
        self.check()?;
        Ok(self
            .tables
            .write()
            .await
            .subscriptions
            .remove(id)
            .map_or(0, |_| 1))
    }
}
