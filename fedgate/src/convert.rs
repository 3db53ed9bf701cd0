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

//! # Conversion from wire-format activities to internal records
//!
//! The dispatcher decides *what* gets converted & *when*; a [Converter] decides how. The field
//! mapping is deliberately kept behind a trait so the dispatcher can be exercised against a
//! simpler (or deliberately failing) implementation.
//!
//! Identifiers are minted by the dispatcher & passed in: the converter never decides whether a
//! record is new.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{prelude::*, Backtrace};
use tracing::debug;
use url::Url;

use crate::{
    ap_entities::{self, Flag, Follow, Like, Note, PUBLIC},
    entities::{
        Account, Block, BlockId, FollowRequest, FollowRequestId, Report, ReportId, Status,
        StatusFave, StatusFaveId, StatusId, Visibility,
    },
    storage::Backend as StorageBackend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{kind} had no usable {role}"))]
    MissingReference {
        kind: &'static str,
        role: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Note has no id, or its id is not an IRI"))]
    NoteIri { backtrace: Backtrace },
    #[snafu(display("{uri} is not among the Note's authors"))]
    NotAnAuthor { uri: Url, backtrace: Backtrace },
    #[snafu(display("No account is known for {uri}"))]
    UnknownAccount { uri: Url, backtrace: Backtrace },
    #[snafu(display("No status is known for {uri}"))]
    UnknownStatus { uri: Url, backtrace: Backtrace },
    #[snafu(display("Flag named no account to report"))]
    NoReportTarget { backtrace: Backtrace },
    #[snafu(display("Storage error while converting: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Converter                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Converter {
    async fn block(&self, block: &ap_entities::Block, id: BlockId) -> Result<Block>;
    /// Convert `note`, attributing it to `author` (which must be among its `attributedTo`)
    async fn status(&self, note: &Note, author: &Url, id: StatusId) -> Result<Status>;
    async fn follow_request(&self, follow: &Follow, id: FollowRequestId) -> Result<FollowRequest>;
    async fn fave(&self, like: &Like, id: StatusFaveId) -> Result<StatusFave>;
    async fn report(&self, flag: &Flag, id: ReportId) -> Result<Report>;
}

/// Work out a status' [Visibility] from its addressing
///
/// Public if addressed to the public collection, unlisted if merely cc'd to it, followers-only if
/// addressed to a followers collection & direct otherwise.
pub fn derive_visibility<'a, S, T>(to: S, cc: T) -> Visibility
where
    S: Iterator<Item = &'a Url>,
    T: Iterator<Item = &'a Url>,
{
    fn is_followers(url: &Url) -> bool {
        url.path().ends_with("/followers")
    }

    let mut followers = false;
    let mut public_in_cc = false;
    for url in to {
        if *url == *PUBLIC {
            return Visibility::Public;
        }
        followers |= is_followers(url);
    }
    for url in cc {
        public_in_cc |= *url == *PUBLIC;
        followers |= is_followers(url);
    }

    if public_in_cc {
        Visibility::Unlisted
    } else if followers {
        Visibility::FollowersOnly
    } else {
        Visibility::Direct
    }
}

/// A [Converter] that resolves the actors & objects an activity references through storage
pub struct StorageConverter {
    storage: Arc<dyn StorageBackend + Send + Sync>,
}

impl StorageConverter {
    pub fn new(storage: Arc<dyn StorageBackend + Send + Sync>) -> StorageConverter {
        StorageConverter { storage }
    }
    async fn account(
        &self,
        uri: Option<&Url>,
        kind: &'static str,
        role: &'static str,
    ) -> Result<Account> {
        let uri = uri.context(MissingReferenceSnafu { kind, role })?;
        self.storage
            .account_by_uri(uri)
            .await
            .context(StorageSnafu)?
            .context(UnknownAccountSnafu { uri: uri.clone() })
    }
}

#[async_trait]
impl Converter for StorageConverter {
    async fn block(&self, block: &ap_entities::Block, id: BlockId) -> Result<Block> {
        let account = self.account(block.actor(), "Block", "actor").await?;
        let target = self.account(block.object(), "Block", "object").await?;
        Ok(Block {
            id,
            uri: block.id().clone(),
            account_id: account.id,
            target_account_id: target.id,
            created_at: id.datetime(),
        })
    }

    async fn status(&self, note: &Note, author: &Url, id: StatusId) -> Result<Status> {
        let uri = note.iri().context(NoteIriSnafu)?;
        ensure!(
            note.authors().any(|a| a == author),
            NotAnAuthorSnafu {
                uri: author.clone()
            }
        );
        let account = self.account(Some(author), "Note", "author").await?;
        Ok(Status {
            id,
            uri,
            url: note.url(),
            account_id: account.id,
            account_uri: account.uri,
            in_reply_to_uri: note.in_reply_to().cloned(),
            content: note.content().unwrap_or_default().to_owned(),
            content_warning: note
                .summary()
                .filter(|s| !s.is_empty())
                .map(str::to_owned),
            visibility: derive_visibility(note.to(), note.cc()),
            created_at: note.published().unwrap_or_else(|| id.datetime()),
            local: false,
        })
    }

    async fn follow_request(&self, follow: &Follow, id: FollowRequestId) -> Result<FollowRequest> {
        let account = self.account(follow.actor(), "Follow", "actor").await?;
        let target = self.account(follow.object(), "Follow", "object").await?;
        Ok(FollowRequest {
            id,
            uri: follow.id().clone(),
            account_id: account.id,
            target_account_id: target.id,
            created_at: id.datetime(),
        })
    }

    async fn fave(&self, like: &Like, id: StatusFaveId) -> Result<StatusFave> {
        let account = self.account(like.actor(), "Like", "actor").await?;
        let uri = like.object().context(MissingReferenceSnafu {
            kind: "Like",
            role: "object",
        })?;
        let status = self
            .storage
            .status_by_uri(uri)
            .await
            .context(StorageSnafu)?
            .context(UnknownStatusSnafu { uri: uri.clone() })?;
        Ok(StatusFave {
            id,
            uri: like.id().clone(),
            account_id: account.id,
            target_account_id: status.account_id,
            status_id: status.id,
            created_at: like.published().unwrap_or_else(|| id.datetime()),
        })
    }

    async fn report(&self, flag: &Flag, id: ReportId) -> Result<Report> {
        let account = self.account(flag.actor(), "Flag", "actor").await?;

        // `object` mixes the reported account with the reported statuses; sort them out.
        let mut target = None;
        let mut statuses = Vec::new();
        for uri in flag.objects() {
            if let Some(reported) = self.storage.account_by_uri(uri).await.context(StorageSnafu)? {
                target.get_or_insert(reported);
            } else if let Some(status) =
                self.storage.status_by_uri(uri).await.context(StorageSnafu)?
            {
                statuses.push(status);
            } else {
                debug!("Ignoring unknown object {} in Flag {}", uri, flag.id());
            }
        }
        let target = target.context(NoReportTargetSnafu)?;

        Ok(Report {
            id,
            uri: flag.id().clone(),
            account_id: account.id,
            target_account_id: target.id,
            // Only statuses belonging to the reported account are of interest
            status_ids: statuses
                .into_iter()
                .filter(|s| s.account_id == target.id)
                .map(|s| s.id)
                .collect(),
            comment: flag.content().unwrap_or_default().to_owned(),
            created_at: id.datetime(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::AccountId, memory::InMemory};

    use fedgate_shared::domain::Domain;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn remote(username: &str) -> Account {
        Account {
            id: AccountId::new(),
            username: username.to_owned(),
            domain: Some(Domain::parse("remote.example").unwrap()),
            uri: url(&format!("https://remote.example/users/{}", username)),
        }
    }

    #[test]
    fn test_visibility() {
        let followers = url("https://remote.example/users/alice/followers");
        let bob = url("https://local.example/users/bob");
        assert_eq!(
            derive_visibility([&*PUBLIC].into_iter(), [&followers].into_iter()),
            Visibility::Public
        );
        assert_eq!(
            derive_visibility([&followers].into_iter(), [&*PUBLIC].into_iter()),
            Visibility::Unlisted
        );
        assert_eq!(
            derive_visibility([&followers].into_iter(), [&bob].into_iter()),
            Visibility::FollowersOnly
        );
        assert_eq!(
            derive_visibility([&bob].into_iter(), std::iter::empty()),
            Visibility::Direct
        );
    }

    #[tokio::test]
    async fn test_status() {
        let storage = Arc::new(InMemory::new());
        let alice = remote("alice");
        storage.add_account(alice.clone()).await;
        let converter = StorageConverter::new(storage.clone());

        let note = serde_json::from_str::<Note>(
            r#"{
  "type": "Note",
  "id": "https://remote.example/users/alice/statuses/1",
  "attributedTo": "https://remote.example/users/alice",
  "published": "2024-03-01T12:00:00Z",
  "summary": "",
  "content": "<p>hi</p>",
  "to": "https://www.w3.org/ns/activitystreams#Public"
}"#,
        )
        .unwrap();
        let id = StatusId::new();
        let status = converter.status(&note, &alice.uri, id).await.unwrap();
        assert_eq!(status.id, id);
        assert_eq!(status.account_id, alice.id);
        assert_eq!(status.visibility, Visibility::Public);
        assert_eq!(status.content_warning, None);
        assert_eq!(status.created_at, note.published().unwrap());

        // An author we've never heard of
        let note = serde_json::from_str::<Note>(
            r#"{"type": "Note", "id": "https://elsewhere.example/notes/1", "attributedTo": "https://elsewhere.example/users/carol"}"#,
        )
        .unwrap();
        let carol = url("https://elsewhere.example/users/carol");
        assert!(matches!(
            converter.status(&note, &carol, StatusId::new()).await,
            Err(Error::UnknownAccount { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_co_authored() {
        let storage = Arc::new(InMemory::new());
        let alice = remote("alice");
        let dave = remote("dave");
        storage.add_account(alice.clone()).await;
        storage.add_account(dave.clone()).await;
        let converter = StorageConverter::new(storage.clone());

        let note = serde_json::from_str::<Note>(
            r#"{
  "type": "Note",
  "id": "https://remote.example/users/alice/statuses/5",
  "attributedTo": ["https://remote.example/users/alice", "https://remote.example/users/dave"],
  "content": "<p>a joint effort</p>"
}"#,
        )
        .unwrap();
        // Attributed to whichever author we were told, not simply the first listed
        let status = converter
            .status(&note, &dave.uri, StatusId::new())
            .await
            .unwrap();
        assert_eq!(status.account_id, dave.id);
        assert_eq!(status.account_uri, dave.uri);

        assert!(matches!(
            converter
                .status(&note, &url("https://remote.example/users/mallory"), StatusId::new())
                .await,
            Err(Error::NotAnAuthor { .. })
        ));
    }

    #[tokio::test]
    async fn test_report() {
        let storage = Arc::new(InMemory::new());
        let alice = remote("alice");
        let bob = Account {
            id: AccountId::new(),
            username: "bob".to_owned(),
            domain: None,
            uri: url("https://local.example/users/bob"),
        };
        storage.add_account(alice.clone()).await;
        storage.add_account(bob.clone()).await;
        let converter = StorageConverter::new(storage.clone());

        let flag = match serde_json::from_str::<ap_entities::Activity>(
            r#"{
  "type": "Flag",
  "id": "https://remote.example/flags/1",
  "actor": "https://remote.example/users/alice",
  "object": ["https://local.example/users/bob", "https://local.example/users/bob/statuses/404"],
  "content": "rude"
}"#,
        )
        .unwrap()
        {
            ap_entities::Activity::Flag(flag) => flag,
            _ => panic!("Expected a Flag"),
        };
        let report = converter.report(&flag, ReportId::new()).await.unwrap();
        assert_eq!(report.account_id, alice.id);
        assert_eq!(report.target_account_id, bob.id);
        assert!(report.status_ids.is_empty());
        assert_eq!(report.comment, "rude");
    }
}
