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

//! # fedgate entities
//!
//! Internal, durable representations of the things fedgate deals in. Wire-format ActivityPub
//! objects live in [ap_entities](crate::ap_entities); conversion from those to the records here is
//! the job of [convert](crate::convert).
//!
//! Every record derived from a remote object carries that object's URI; storage enforces
//! uniqueness on it, which is how redelivery of the same activity is detected.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use url::Url;

use fedgate_shared::{define_id, domain::Domain};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a domain permission type"))]
    PermissionType { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a supported subscription content type"))]
    ContentType { text: String, backtrace: Backtrace },
}

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_id!(AccountId);
define_id!(StatusId);
define_id!(FollowRequestId);
define_id!(StatusFaveId);
define_id!(ReportId);
define_id!(BlockId);
define_id!(DomainPermissionId);
define_id!(DomainPermissionDraftId);
define_id!(DomainPermissionSubscriptionId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Accounts                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A local or remote actor
///
/// Accounts are created & maintained by actor resolution, upstream of anything in this crate; we
/// only ever read them.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    /// `None` for local accounts
    pub domain: Option<Domain>,
    /// The ActivityPub actor ID
    pub uri: Url,
}

impl Account {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  Records derived from activities                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Unlisted,
    FollowersOnly,
    Direct,
}

/// A post, local or remote
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    /// Derived from `created_at`, so that backdated statuses sort where they claim to belong
    pub id: StatusId,
    pub uri: Url,
    pub url: Option<Url>,
    pub account_id: AccountId,
    pub account_uri: Url,
    pub in_reply_to_uri: Option<Url>,
    pub content: String,
    pub content_warning: Option<String>,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub local: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FollowRequest {
    pub id: FollowRequestId,
    pub uri: Url,
    pub account_id: AccountId,
    pub target_account_id: AccountId,
    pub created_at: DateTime<Utc>,
}

/// A "like"
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusFave {
    pub id: StatusFaveId,
    pub uri: Url,
    pub account_id: AccountId,
    pub target_account_id: AccountId,
    pub status_id: StatusId,
    pub created_at: DateTime<Utc>,
}

/// A report ("flag") filed by a remote account against one of ours
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Report {
    pub id: ReportId,
    pub uri: Url,
    pub account_id: AccountId,
    pub target_account_id: AccountId,
    pub status_ids: Vec<StatusId>,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// One account blocking another
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub uri: Url,
    pub account_id: AccountId,
    pub target_account_id: AccountId,
    pub created_at: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       Domain permissions                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainPermissionType {
    Block,
    Allow,
}

impl Display for DomainPermissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DomainPermissionType::Block => "block",
                DomainPermissionType::Allow => "allow",
            }
        )
    }
}

impl FromStr for DomainPermissionType {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(DomainPermissionType::Block),
            "allow" => Ok(DomainPermissionType::Allow),
            _ => PermissionTypeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// An explicit, instance-wide decision about one domain: a `DomainBlock` or a `DomainAllow`
/// depending on `permission_type`
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DomainPermission {
    pub id: DomainPermissionId,
    pub permission_type: DomainPermissionType,
    pub domain: Domain,
    pub created_at: DateTime<Utc>,
    pub created_by_account_id: AccountId,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
    /// Show only a partially-starred version of `domain` to the public
    pub obfuscate: bool,
    /// Set when this permission was created from a subscription
    pub subscription_id: Option<DomainPermissionSubscriptionId>,
}

impl DomainPermission {
    pub fn new(
        permission_type: DomainPermissionType,
        domain: Domain,
        created_by_account_id: AccountId,
    ) -> DomainPermission {
        DomainPermission {
            id: DomainPermissionId::new(),
            permission_type,
            domain,
            created_at: Utc::now(),
            created_by_account_id,
            private_comment: None,
            public_comment: None,
            obfuscate: false,
            subscription_id: None,
        }
    }
}

/// A proposed block or allow awaiting a moderator's decision
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DomainPermissionDraft {
    pub id: DomainPermissionDraftId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub permission_type: DomainPermissionType,
    pub domain: Domain,
    pub created_by_account_id: AccountId,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
    pub obfuscate: bool,
    /// `None` for drafts submitted by hand
    pub subscription_id: Option<DomainPermissionSubscriptionId>,
}

impl DomainPermissionDraft {
    pub fn new(
        permission_type: DomainPermissionType,
        domain: Domain,
        created_by_account_id: AccountId,
    ) -> DomainPermissionDraft {
        let now = Utc::now();
        DomainPermissionDraft {
            id: DomainPermissionDraftId::from_datetime(&now),
            created_at: now,
            updated_at: now,
            permission_type,
            domain,
            created_by_account_id,
            private_comment: None,
            public_comment: None,
            obfuscate: false,
            subscription_id: None,
        }
    }
}

/// The format of a remote permission list
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SubscriptionContentType {
    #[serde(rename = "text/csv")]
    Csv,
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "text/plain")]
    Plain,
}

impl Display for SubscriptionContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SubscriptionContentType::Csv => "text/csv",
                SubscriptionContentType::Json => "application/json",
                SubscriptionContentType::Plain => "text/plain",
            }
        )
    }
}

impl FromStr for SubscriptionContentType {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        match s {
            "text/csv" => Ok(SubscriptionContentType::Csv),
            "application/json" => Ok(SubscriptionContentType::Json),
            "text/plain" => Ok(SubscriptionContentType::Plain),
            _ => ContentTypeSnafu { text: s.to_owned() }.fail(),
        }
    }
}

/// A remote list of domain permissions to be imported periodically
///
/// Created by an admin; updated by the fetch job on each run (`fetched_at`, `error` & `count`).
// No `PartialEq`: `SecretString` doesn't offer one.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DomainPermissionSubscription {
    pub id: DomainPermissionSubscriptionId,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub permission_type: DomainPermissionType,
    /// Import entries as drafts rather than as permissions proper
    pub as_draft: bool,
    pub created_by_account_id: AccountId,
    pub content_type: SubscriptionContentType,
    pub uri: Url,
    pub fetch_username: Option<String>,
    #[serde(skip_serializing)]
    pub fetch_password: Option<SecretString>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// The error from the most recent fetch, if it failed
    pub error: Option<String>,
    /// The number of entries discovered on the most recent successful fetch
    pub count: u64,
}

impl DomainPermissionSubscription {
    pub fn new(
        permission_type: DomainPermissionType,
        content_type: SubscriptionContentType,
        uri: Url,
        created_by_account_id: AccountId,
    ) -> DomainPermissionSubscription {
        let now = Utc::now();
        DomainPermissionSubscription {
            id: DomainPermissionSubscriptionId::from_datetime(&now),
            created_at: now,
            title: None,
            permission_type,
            as_draft: true,
            created_by_account_id,
            content_type,
            uri,
            fetch_username: None,
            fetch_password: None,
            fetched_at: None,
            error: None,
            count: 0,
        }
    }
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_permission_types() {
        assert_eq!(
            "Block".parse::<DomainPermissionType>().unwrap(),
            DomainPermissionType::Block
        );
        assert_eq!(format!("{}", DomainPermissionType::Allow), "allow");
        assert!("mute".parse::<DomainPermissionType>().is_err());
        assert_eq!(
            serde_json::to_string(&DomainPermissionType::Allow).unwrap(),
            "\"allow\""
        );
    }

    #[test]
    fn test_subscription_secrets() {
        let mut sub = DomainPermissionSubscription::new(
            DomainPermissionType::Block,
            SubscriptionContentType::Csv,
            Url::parse("https://lists.example/blocks.csv").unwrap(),
            AccountId::new(),
        );
        sub.fetch_username = Some("moderator".to_owned());
        sub.fetch_password = Some(SecretString::from("hunter2"));
        let text = serde_json::to_string(&sub).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!format!("{:?}", sub).contains("hunter2"));
        assert!(text.contains("text/csv"));
    }
}
