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

//! # Domain permission gate
//!
//! ## Introduction
//!
//! The [DomainGate] answers one question: may this remote domain interact with us right now? The
//! answer depends upon two sets of explicit, moderator-maintained [DomainPermission]s (blocks &
//! allows) and the instance-wide [FederationMode]:
//!
//! | allowed? | blocked? | blocklist mode | allowlist mode |
//! |----------|----------|----------------|----------------|
//! | no       | no       | permitted      | **blocked**    |
//! | no       | yes      | **blocked**    | **blocked**    |
//! | yes      | no       | permitted      | permitted      |
//! | yes      | yes      | permitted      | **blocked**    |
//!
//! Note the asymmetry in the last row: an explicit allow wins in blocklist mode, an explicit
//! block wins in allowlist mode.
//!
//! ## Caching
//!
//! Every inbound delivery is checked, so both sets are fronted by a [DomainCache] that is loaded in
//! full on first use & cleared whenever a block or allow is created or deleted through this type.
//! The clear happens before the write is acknowledged, so a check made after a write returns
//! always observes it.
//!
//! ## Normalization
//!
//! Domains are compared in their punycode form. Text that won't normalize is an error, never "not
//! blocked". Our own host & account domain can't be blocked at all.

use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, warn};
use url::Url;

use fedgate_cache::DomainCache;
use fedgate_shared::domain::{self, Domain};

use crate::{
    counter_add,
    entities::{DomainPermission, DomainPermissionId, DomainPermissionType},
    metrics::{self, Instruments, Sort},
    storage::Backend as StorageBackend,
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
    #[snafu(display("Failed to load the {permission_type} domains: {source}"))]
    Load {
        permission_type: DomainPermissionType,
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("A domain {permission_type} already exists for {domain}"))]
    Duplicate {
        permission_type: DomainPermissionType,
        domain: Domain,
        backtrace: Backtrace,
    },
    #[snafu(display("Unrecognized federation mode {mode}; no decision is possible"))]
    UnrecognizedFederationMode { mode: String, backtrace: Backtrace },
}

impl Error {
    pub fn is_bad_domain(&self) -> bool {
        matches!(self, Error::BadDomain { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The instance-wide stance toward domains with no explicit permission
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum FederationMode {
    /// Default-allow: federate with everyone not explicitly blocked
    #[default]
    Blocklist,
    /// Default-deny: federate only with those explicitly allowed
    Allowlist,
    /// Anything else; retained so that it can be reported when a decision is requested
    Unrecognized(String),
}

impl Display for FederationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FederationMode::Blocklist => write!(f, "blocklist-mode"),
            FederationMode::Allowlist => write!(f, "allowlist-mode"),
            FederationMode::Unrecognized(mode) => write!(f, "{}", mode),
        }
    }
}

impl From<&str> for FederationMode {
    fn from(value: &str) -> Self {
        match value {
            "blocklist-mode" | "blocklist" => FederationMode::Blocklist,
            "allowlist-mode" | "allowlist" => FederationMode::Allowlist,
            _ => FederationMode::Unrecognized(value.to_owned()),
        }
    }
}

// Misconfiguration is surfaced at decision time, not at startup, so deserialization never fails on
// an unexpected string.
impl<'de> Deserialize<'de> for FederationMode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        Ok(FederationMode::from(s.as_str()))
    }
}

impl Serialize for FederationMode {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// The host at which this instance is served
    pub host: Domain,
    /// The domain used in account addresses, if it differs from `host`
    pub account_domain: Option<Domain>,
    pub federation_mode: FederationMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: Domain::parse("localhost").unwrap(/* known good */),
            account_domain: None,
            federation_mode: FederationMode::default(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           DomainGate                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("gate.blocked", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("gate.allowed", Sort::IntegralCounter) }

/// Decide whether remote domains may interact with this instance
pub struct DomainGate {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    host: Domain,
    account_domain: Option<Domain>,
    mode: FederationMode,
    blocks: DomainCache,
    allows: DomainCache,
    instruments: Arc<Instruments>,
}

impl DomainGate {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> DomainGate {
        DomainGate {
            storage,
            host: config.host.clone(),
            account_domain: config.account_domain.clone(),
            mode: config.federation_mode.clone(),
            blocks: DomainCache::new(),
            allows: DomainCache::new(),
            instruments,
        }
    }
    pub fn federation_mode(&self) -> &FederationMode {
        &self.mode
    }
    pub fn host(&self) -> &Domain {
        &self.host
    }
    fn cache(&self, permission_type: DomainPermissionType) -> &DomainCache {
        match permission_type {
            DomainPermissionType::Block => &self.blocks,
            DomainPermissionType::Allow => &self.allows,
        }
    }
    fn is_self(&self, domain: &Domain) -> bool {
        *domain == self.host || self.account_domain.as_ref() == Some(domain)
    }
    // Normalize `text`; `None` means "this is us (or nobody)"
    fn normalize(&self, text: &str) -> Result<Option<Domain>> {
        if text.is_empty() {
            return Ok(None);
        }
        let domain = Domain::parse(text).context(BadDomainSnafu)?;
        Ok((!self.is_self(&domain)).then_some(domain))
    }
    async fn matches(&self, permission_type: DomainPermissionType, domain: &Domain) -> Result<bool> {
        self.cache(permission_type)
            .matches(domain, move || async move {
                self.storage
                    .domain_permission_domains(permission_type)
                    .await
                    .context(LoadSnafu { permission_type })
            })
            .await
    }
    async fn is_blocked(&self, domain: &Domain) -> Result<bool> {
        let allowed = self.matches(DomainPermissionType::Allow, domain).await?;
        let blocked = self.matches(DomainPermissionType::Block, domain).await?;
        let decision = match &self.mode {
            FederationMode::Blocklist => blocked && !allowed,
            FederationMode::Allowlist => blocked || !allowed,
            FederationMode::Unrecognized(mode) => {
                warn!("Refusing to decide on {}: federation mode {} is not recognized", domain, mode);
                return UnrecognizedFederationModeSnafu { mode: mode.clone() }.fail();
            }
        };
        if decision {
            debug!("{} is blocked (allowed: {}, blocked: {})", domain, allowed, blocked);
            counter_add!(self.instruments, "gate.blocked", 1, &[]);
        } else {
            counter_add!(self.instruments, "gate.allowed", 1, &[]);
        }
        Ok(decision)
    }
    /// Return true if `domain` may not currently interact with this instance
    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool> {
        match self.normalize(domain)? {
            Some(domain) => self.is_blocked(&domain).await,
            None => Ok(false),
        }
    }
    /// Apply [is_domain_blocked](DomainGate::is_domain_blocked) to `uri`'s host
    pub async fn is_uri_blocked(&self, uri: &Url) -> Result<bool> {
        self.is_domain_blocked(uri.host_str().unwrap_or_default())
            .await
    }
    /// Return true if *any* of `domains` is blocked; stops at the first that is
    pub async fn are_domains_blocked<'a, I>(&self, domains: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for domain in domains {
            if self.is_domain_blocked(domain).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
    /// Return true if any of `uris` has a blocked host; stops at the first that does
    pub async fn are_uris_blocked<'a, I>(&self, uris: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a Url>,
    {
        for uri in uris {
            if self.is_uri_blocked(uri).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn permission(
        &self,
        permission_type: DomainPermissionType,
        domain: &str,
    ) -> Result<Option<DomainPermission>> {
        match self.normalize(domain)? {
            Some(domain) => self
                .storage
                .domain_permission(permission_type, &domain)
                .await
                .context(StorageSnafu),
            None => Ok(None),
        }
    }
    async fn create(
        &self,
        permission_type: DomainPermissionType,
        mut permission: DomainPermission,
    ) -> Result<DomainPermission> {
        permission.permission_type = permission_type;
        match self.storage.put_domain_permission(&permission).await {
            Ok(()) => (),
            Err(err) if err.is_already_exists() => {
                return DuplicateSnafu {
                    permission_type,
                    domain: permission.domain,
                }
                .fail()
            }
            Err(err) => return Err(err).context(StorageSnafu),
        }
        self.cache(permission_type).clear().await;
        debug!("Created domain {} for {}", permission_type, permission.domain);
        Ok(permission)
    }
    async fn delete(&self, permission_type: DomainPermissionType, domain: &str) -> Result<usize> {
        let domain = Domain::parse(domain).context(BadDomainSnafu)?;
        let rows = self
            .storage
            .delete_domain_permission(permission_type, &domain)
            .await
            .context(StorageSnafu)?;
        // Even if nothing was deleted: someone else may have written behind our back
        self.cache(permission_type).clear().await;
        debug!("Deleted {} domain {} for {}", rows, permission_type, domain);
        Ok(rows)
    }

    /// Look up the block for `domain`; our own domains never have one
    pub async fn domain_block(&self, domain: &str) -> Result<Option<DomainPermission>> {
        self.permission(DomainPermissionType::Block, domain).await
    }
    pub async fn domain_block_by_id(&self, id: &DomainPermissionId) -> Result<Option<DomainPermission>> {
        self.storage
            .domain_permission_by_id(DomainPermissionType::Block, id)
            .await
            .context(StorageSnafu)
    }
    pub async fn domain_blocks(&self) -> Result<Vec<DomainPermission>> {
        self.storage
            .domain_permissions(DomainPermissionType::Block)
            .await
            .context(StorageSnafu)
    }
    /// Record a new domain block; `permission`'s type is forced to [DomainPermissionType::Block]
    pub async fn create_domain_block(&self, permission: DomainPermission) -> Result<DomainPermission> {
        self.create(DomainPermissionType::Block, permission).await
    }
    /// Remove the block on `domain`, returning the number of blocks removed
    pub async fn delete_domain_block(&self, domain: &str) -> Result<usize> {
        self.delete(DomainPermissionType::Block, domain).await
    }

    pub async fn domain_allow(&self, domain: &str) -> Result<Option<DomainPermission>> {
        self.permission(DomainPermissionType::Allow, domain).await
    }
    pub async fn domain_allow_by_id(&self, id: &DomainPermissionId) -> Result<Option<DomainPermission>> {
        self.storage
            .domain_permission_by_id(DomainPermissionType::Allow, id)
            .await
            .context(StorageSnafu)
    }
    pub async fn domain_allows(&self) -> Result<Vec<DomainPermission>> {
        self.storage
            .domain_permissions(DomainPermissionType::Allow)
            .await
            .context(StorageSnafu)
    }
    pub async fn create_domain_allow(&self, permission: DomainPermission) -> Result<DomainPermission> {
        self.create(DomainPermissionType::Allow, permission).await
    }
    pub async fn delete_domain_allow(&self, domain: &str) -> Result<usize> {
        self.delete(DomainPermissionType::Allow, domain).await
    }
}
