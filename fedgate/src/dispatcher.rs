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

//! # Activity dispatch
//!
//! ## Introduction
//!
//! The [Dispatcher] takes an inbound [Activity] (already authenticated, already past the domain
//! gate) & does three things with it: converts it to an internal record, persists that record
//! *exactly once*, and describes the follow-up work as a side-effect message.
//!
//! ## Idempotency
//!
//! Remote servers redeliver. We don't lock anything to guard against that; instead we lean on
//! storage uniqueness (by the remote object's URI). Where the protocol makes redelivery routine
//! (Notes & Likes), "already exists" is success & no second side effect is enqueued. For the
//! others, a duplicate is reported as a failure of the activity, like any other storage error.
//!
//! ## Forwarded notes
//!
//! A Note delivered by someone other than its author is a *forward*. We don't trust its content:
//! rather than persisting it we enqueue a request to dereference it from its origin.

use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;
use opentelemetry::KeyValue;
use serde_json::Value;
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tracing::{debug, error, info, trace};

use crate::{
    ap_entities::{self, type_of, Activity, Create, Flag, Follow, Like, Note, Type},
    convert::{self, Converter},
    counter_add,
    entities::{Account, BlockId, FollowRequestId, ReportId, StatusFaveId, StatusId},
    metrics::{self, Instruments, Sort},
    side_effects::{self, Enqueue, FromFederator, Model},
    storage::{self, Backend as StorageBackend},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Create had no object"))]
    NoObject { backtrace: Backtrace },
    #[snafu(display("Object of Create was not a typed object"))]
    UntypedObject { backtrace: Backtrace },
    #[snafu(display("Object of Create was a {kind}, which can't be handled"))]
    UnhandledObject { kind: String, backtrace: Backtrace },
    #[snafu(display("Failed to interpret Note: {source}"))]
    Note {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Note had no attributedTo"))]
    NoAttribution { backtrace: Backtrace },
    #[snafu(display("Failed to convert {kind}: {source}"))]
    Convert {
        kind: Type,
        source: convert::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to persist {kind}: {source}"))]
    Persist {
        kind: Type,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to enqueue side effect: {source}"))]
    Enqueue {
        source: side_effects::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("One or more errors while processing Create: {source}"))]
    Create {
        source: MultiError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The failures from a multi-object Create, each tagged with the index of the offending object
#[derive(Debug)]
pub struct MultiError {
    errors: Vec<(usize, Error)>,
}

impl MultiError {
    pub fn errors(&self) -> &[(usize, Error)] {
        &self.errors
    }
    pub fn len(&self) -> usize {
        self.errors.len()
    }
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
    /// The indices of the objects that failed
    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.errors.iter().map(|(index, _)| *index)
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            self.errors
                .iter()
                .map(|(index, err)| format!("object {}: {}", index, err))
                .join("; ")
        )
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    /// If this is an aggregate failure from a multi-object Create, the individual failures
    pub fn multi(&self) -> Option<&MultiError> {
        match self {
            Error::Create { source, .. } => Some(source),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Dispatcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("dispatch.blocks", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.notes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.follows", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.likes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.flags", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.unrecognized", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.notes.forwarded", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.replays", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatch.failures", Sort::IntegralCounter) }

pub struct Dispatcher {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    converter: Arc<dyn Converter + Send + Sync>,
    queue: Arc<dyn Enqueue + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        converter: Arc<dyn Converter + Send + Sync>,
        queue: Arc<dyn Enqueue + Send + Sync>,
        instruments: Arc<Instruments>,
    ) -> Dispatcher {
        Dispatcher {
            storage,
            converter,
            queue,
            instruments,
        }
    }

    /// Process `activity`, delivered to `receiving` by `requesting`
    ///
    /// `receiving` is `None` for activities generated on this instance; those have already been
    /// processed by whatever generated them, so this is a no-op.
    pub async fn handle(
        &self,
        activity: &Activity,
        receiving: Option<&Account>,
        requesting: &Account,
    ) -> Result<()> {
        let Some(receiving) = receiving else {
            trace!("Ignoring internally-generated {}", activity.kind());
            return Ok(());
        };

        let result = match activity {
            Activity::Block(block) => self.block(block, receiving).await,
            Activity::Create(create) => self.create(create, receiving, requesting).await,
            Activity::Flag(flag) => self.flag(flag, receiving).await,
            Activity::Follow(follow) => self.follow(follow, receiving).await,
            Activity::Like(like) => self.like(like, receiving).await,
            Activity::Unrecognized(kind) => {
                debug!(
                    "Ignoring activity of type {} from {} to {}",
                    kind, requesting.uri, receiving.uri
                );
                counter_add!(self.instruments, "dispatch.unrecognized", 1, &[]);
                Ok(())
            }
        };

        if let Err(err) = &result {
            error!(
                "Failed to handle {} from {} to {}: {}",
                activity.kind(),
                requesting.uri,
                receiving.uri,
                err
            );
            counter_add!(
                self.instruments,
                "dispatch.failures",
                1,
                &[KeyValue::new("activity", activity.kind().to_owned())]
            );
        }
        result
    }

    fn enqueue(&self, msg: FromFederator) -> Result<()> {
        self.queue.enqueue(msg).context(EnqueueSnafu)
    }

    async fn block(&self, block: &ap_entities::Block, receiving: &Account) -> Result<()> {
        let block = self
            .converter
            .block(block, BlockId::new())
            .await
            .context(ConvertSnafu { kind: Type::Block })?;
        self.storage
            .put_block(&block)
            .await
            .context(PersistSnafu { kind: Type::Block })?;
        counter_add!(self.instruments, "dispatch.blocks", 1, &[]);
        info!("{} blocked by {}", block.target_account_id, block.account_id);
        self.enqueue(FromFederator::create(
            Type::Block,
            receiving,
            Model::Block(block),
        ))
    }

    async fn create(&self, create: &Create, receiving: &Account, requesting: &Account) -> Result<()> {
        let objects = create.objects().context(NoObjectSnafu)?;

        // Attempt every object; one bad object mustn't keep us from processing the rest.
        let mut errors = Vec::new();
        for (index, object) in objects.iter().enumerate() {
            match type_of(object) {
                None => errors.push((index, UntypedObjectSnafu.build())),
                Some("Note") => {
                    if let Err(err) = self.create_note(object, receiving, requesting).await {
                        errors.push((index, err));
                    }
                }
                Some(kind) => {
                    debug!(
                        "Object {} of Create from {} was a {}, which we can't handle",
                        index, requesting.uri, kind
                    );
                    errors.push((index, UnhandledObjectSnafu { kind }.build()));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError { errors }).context(CreateSnafu)
        }
    }

    async fn create_note(
        &self,
        object: &Value,
        receiving: &Account,
        requesting: &Account,
    ) -> Result<()> {
        let note = serde_json::from_value::<Note>(object.clone()).context(NoteSnafu)?;
        ensure!(note.attributed_to().is_some(), NoAttributionSnafu);

        // Delivered by (one of) its authors, or forwarded by someone else?
        let Some(author) = note
            .authors()
            .find(|author| author.as_str() == requesting.uri.as_str())
        else {
            let Some(iri) = note.iri() else {
                debug!("Ignoring forwarded Note with no usable id from {}", requesting.uri);
                return Ok(());
            };
            debug!("{} forwarded {}; will dereference", requesting.uri, iri);
            counter_add!(self.instruments, "dispatch.notes.forwarded", 1, &[]);
            return self.enqueue(FromFederator::dereference(Type::Note, receiving, iri));
        };

        // Derive the id from the claimed creation time so that backdated statuses sort properly
        let id = StatusId::from_datetime(&note.published().unwrap_or_else(Utc::now));
        let status = self
            .converter
            .status(&note, author, id)
            .await
            .context(ConvertSnafu { kind: Type::Note })?;

        match self.storage.put_status(&status).await {
            Ok(()) => (),
            Err(err) if err.is_already_exists() => {
                debug!("Status {} already exists; nothing to do", status.uri);
                counter_add!(self.instruments, "dispatch.replays", 1, &[]);
                return Ok(());
            }
            Err(err) => return Err(err).context(PersistSnafu { kind: Type::Note }),
        }

        counter_add!(self.instruments, "dispatch.notes", 1, &[]);
        FromFederator::create(Type::Note, receiving, Model::Status(status))
            .pipe(|msg| self.enqueue(msg))
    }

    async fn follow(&self, follow: &Follow, receiving: &Account) -> Result<()> {
        let follow_request = self
            .converter
            .follow_request(follow, FollowRequestId::new())
            .await
            .context(ConvertSnafu { kind: Type::Follow })?;
        self.storage
            .put_follow_request(&follow_request)
            .await
            .context(PersistSnafu { kind: Type::Follow })?;
        counter_add!(self.instruments, "dispatch.follows", 1, &[]);
        self.enqueue(FromFederator::create(
            Type::Follow,
            receiving,
            Model::FollowRequest(follow_request),
        ))
    }

    async fn like(&self, like: &Like, receiving: &Account) -> Result<()> {
        let fave = self
            .converter
            .fave(like, StatusFaveId::new())
            .await
            .context(ConvertSnafu { kind: Type::Like })?;
        match self.storage.put_status_fave(&fave).await {
            Ok(()) => (),
            Err(err) if err.is_already_exists() => {
                debug!("Fave {} already exists; nothing to do", fave.uri);
                counter_add!(self.instruments, "dispatch.replays", 1, &[]);
                return Ok(());
            }
            Err(err) => return Err(err).context(PersistSnafu { kind: Type::Like }),
        }
        counter_add!(self.instruments, "dispatch.likes", 1, &[]);
        self.enqueue(FromFederator::create(
            Type::Like,
            receiving,
            Model::StatusFave(fave),
        ))
    }

    async fn flag(&self, flag: &Flag, receiving: &Account) -> Result<()> {
        let report = self
            .converter
            .report(flag, ReportId::new())
            .await
            .context(ConvertSnafu { kind: Type::Flag })?;
        self.storage
            .put_report(&report)
            .await
            .context(PersistSnafu { kind: Type::Flag })?;
        counter_add!(self.instruments, "dispatch.flags", 1, &[]);
        self.enqueue(FromFederator::create(
            Type::Flag,
            receiving,
            Model::Report(report),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Mutex;

    use url::Url;

    use fedgate_shared::domain::Domain;

    use crate::{
        convert::StorageConverter,
        entities::{AccountId, Status, Visibility},
        memory::InMemory,
        side_effects::Payload,
    };

    /// Collects enqueued messages; optionally refuses them
    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<FromFederator>>,
        full: bool,
    }

    impl Enqueue for Recorder {
        fn enqueue(&self, msg: FromFederator) -> side_effects::Result<()> {
            if self.full {
                return side_effects::QueueFullSnafu { capacity: 0_usize }.fail();
            }
            self.messages.lock().unwrap().push(msg);
            Ok(())
        }
    }

    impl Recorder {
        fn taken(&self) -> Vec<FromFederator> {
            self.messages.lock().unwrap().clone()
        }
    }

    struct Fixture {
        storage: Arc<InMemory>,
        queue: Arc<Recorder>,
        dispatcher: Dispatcher,
        alice: Account,
        bob: Account,
    }

    async fn fixture(full: bool) -> Fixture {
        let storage = Arc::new(InMemory::new());
        let alice = Account {
            id: AccountId::new(),
            username: "alice".to_owned(),
            domain: Some(Domain::parse("remote.example").unwrap()),
            uri: Url::parse("https://remote.example/users/alice").unwrap(),
        };
        let bob = Account {
            id: AccountId::new(),
            username: "bob".to_owned(),
            domain: None,
            uri: Url::parse("https://local.example/users/bob").unwrap(),
        };
        storage.add_account(alice.clone()).await;
        storage.add_account(bob.clone()).await;
        let queue = Arc::new(Recorder {
            messages: Mutex::new(Vec::new()),
            full,
        });
        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(StorageConverter::new(storage.clone())),
            queue.clone(),
            Arc::new(Instruments::default()),
        );
        Fixture {
            storage,
            queue,
            dispatcher,
            alice,
            bob,
        }
    }

    fn activity(json: &str) -> Activity {
        serde_json::from_str(json).unwrap()
    }

    const CREATE_NOTE: &str = r#"{
  "type": "Create",
  "id": "https://remote.example/users/alice/statuses/1/activity",
  "actor": "https://remote.example/users/alice",
  "object": {
    "type": "Note",
    "id": "https://remote.example/users/alice/statuses/1",
    "attributedTo": "https://remote.example/users/alice",
    "published": "2023-11-14T09:30:00Z",
    "content": "<p>first!</p>",
    "to": ["https://www.w3.org/ns/activitystreams#Public"]
  }
}"#;

    #[tokio::test]
    async fn test_internal_activities_ignored() {
        let f = fixture(false).await;
        f.dispatcher
            .handle(&activity(CREATE_NOTE), None, &f.alice)
            .await
            .unwrap();
        assert!(f.storage.statuses().await.is_empty());
        assert!(f.queue.taken().is_empty());
    }

    #[tokio::test]
    async fn test_note_replay() {
        let f = fixture(false).await;
        let create = activity(CREATE_NOTE);
        f.dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        f.dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap();

        let statuses = f.storage.statuses().await;
        assert_eq!(statuses.len(), 1);
        let status: &Status = &statuses[0];
        assert_eq!(status.visibility, Visibility::Public);
        // Backdated to the claimed publication time
        assert_eq!(
            status.id.datetime(),
            "2023-11-14T09:30:00Z".parse::<chrono::DateTime<Utc>>().unwrap()
        );

        let messages = f.queue.taken();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].object_type, Type::Note);
        assert_eq!(messages[0].activity_type, Type::Create);
        assert_eq!(messages[0].receiving_account, f.bob);
        assert!(matches!(
            &messages[0].payload,
            Payload::Model(Model::Status(s)) if s.uri == status.uri
        ));
    }

    #[tokio::test]
    async fn test_forwarded_note() {
        let f = fixture(false).await;
        // Carol's note, delivered by Alice
        let create = activity(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "object": {
    "type": "Note",
    "id": "https://elsewhere.example/users/carol/statuses/9",
    "attributedTo": "https://elsewhere.example/users/carol",
    "content": "<p>trust me</p>"
  }
}"#,
        );
        f.dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        assert!(f.storage.statuses().await.is_empty());
        let messages = f.queue.taken();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].payload,
            Payload::Iri(Url::parse("https://elsewhere.example/users/carol/statuses/9").unwrap())
        );

        // A forwarded note we can't even identify is dropped quietly
        let create = activity(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "object": {"type": "Note", "attributedTo": "https://elsewhere.example/users/carol"}
}"#,
        );
        f.dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        assert_eq!(f.queue.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_batch() {
        let f = fixture(false).await;
        let create = activity(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "object": [
    "https://remote.example/users/alice/statuses/0",
    {
      "type": "Note",
      "id": "https://remote.example/users/alice/statuses/2",
      "attributedTo": "https://remote.example/users/alice",
      "content": "<p>one of two</p>"
    },
    {"type": "Question", "id": "https://remote.example/users/alice/statuses/3"},
    {"type": "Note", "id": "https://remote.example/users/alice/statuses/4"}
  ]
}"#,
        );
        let err = f
            .dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap_err();
        let multi = err.multi().unwrap();
        // The typeless object, the Question & the unattributed Note
        assert_eq!(multi.indices().collect::<Vec<usize>>(), vec![0, 2, 3]);
        assert!(matches!(multi.errors()[0].1, Error::UntypedObject { .. }));
        assert!(matches!(
            &multi.errors()[1].1,
            Error::UnhandledObject { kind, .. } if kind == "Question"
        ));
        assert!(matches!(multi.errors()[2].1, Error::NoAttribution { .. }));

        assert_eq!(f.storage.statuses().await.len(), 1);
        assert_eq!(f.queue.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_unhandled_object_type() {
        let f = fixture(false).await;
        let create = activity(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "object": [
    {
      "type": "Note",
      "id": "https://remote.example/users/alice/statuses/5",
      "attributedTo": "https://remote.example/users/alice",
      "content": "<p>the good one</p>"
    },
    {"type": "Banana", "id": "https://remote.example/users/alice/bananas/1"}
  ]
}"#,
        );
        let err = f
            .dispatcher
            .handle(&create, Some(&f.bob), &f.alice)
            .await
            .unwrap_err();
        let multi = err.multi().unwrap();
        assert_eq!(multi.indices().collect::<Vec<usize>>(), vec![1]);
        assert!(err.to_string().contains("Banana"));
        // The Note still went through
        assert_eq!(f.storage.statuses().await.len(), 1);
        assert_eq!(f.queue.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_co_authored_note() {
        let f = fixture(false).await;
        let dave = Account {
            id: AccountId::new(),
            username: "dave".to_owned(),
            domain: Some(Domain::parse("remote.example").unwrap()),
            uri: Url::parse("https://remote.example/users/dave").unwrap(),
        };
        f.storage.add_account(dave.clone()).await;
        // Delivered by the second of two authors: not a forward, & attributed to the deliverer
        let create = activity(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/dave",
  "object": {
    "type": "Note",
    "id": "https://remote.example/users/alice/statuses/6",
    "attributedTo": ["https://remote.example/users/alice", "https://remote.example/users/dave"],
    "content": "<p>co-written</p>"
  }
}"#,
        );
        f.dispatcher
            .handle(&create, Some(&f.bob), &dave)
            .await
            .unwrap();
        let statuses = f.storage.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].account_id, dave.id);
        assert!(f.queue.taken()[0].model().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_redelivery() {
        let f = fixture(false).await;
        let create = activity(CREATE_NOTE);
        let like = activity(
            r#"{
  "type": "Like",
  "id": "https://remote.example/users/alice#likes/8",
  "actor": "https://remote.example/users/alice",
  "object": "https://remote.example/users/alice/statuses/1"
}"#,
        );

        let results = futures::future::join_all(
            (0..16).map(|_| f.dispatcher.handle(&create, Some(&f.bob), &f.alice)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(f.storage.statuses().await.len(), 1);
        assert_eq!(f.queue.taken().len(), 1);

        let results = futures::future::join_all(
            (0..16).map(|_| f.dispatcher.handle(&like, Some(&f.bob), &f.alice)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(f.storage.faves().await.len(), 1);
        // One for the Note, one for the Like
        assert_eq!(f.queue.taken().len(), 2);
    }

    #[tokio::test]
    async fn test_create_without_object() {
        let f = fixture(false).await;
        let create = activity(r#"{"type": "Create", "actor": "https://remote.example/users/alice"}"#);
        assert!(matches!(
            f.dispatcher.handle(&create, Some(&f.bob), &f.alice).await,
            Err(Error::NoObject { .. })
        ));
    }

    #[tokio::test]
    async fn test_follow() {
        let f = fixture(false).await;
        let follow = activity(
            r#"{
  "type": "Follow",
  "id": "https://remote.example/users/alice#follows/1",
  "actor": "https://remote.example/users/alice",
  "object": "https://local.example/users/bob"
}"#,
        );
        f.dispatcher
            .handle(&follow, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        let requests = f.storage.follow_requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].account_id, f.alice.id);
        assert_eq!(requests[0].target_account_id, f.bob.id);
        let messages = f.queue.taken();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].object_type, Type::Follow);
        assert_eq!(messages[0].activity_type, Type::Create);

        // A duplicate Follow is an error
        assert!(matches!(
            f.dispatcher.handle(&follow, Some(&f.bob), &f.alice).await,
            Err(Error::Persist { kind: Type::Follow, .. })
        ));
        assert_eq!(f.queue.taken().len(), 1);
    }

    #[tokio::test]
    async fn test_like_replay() {
        let f = fixture(false).await;
        f.dispatcher
            .handle(&activity(CREATE_NOTE), Some(&f.bob), &f.alice)
            .await
            .unwrap();
        let like = activity(
            r#"{
  "type": "Like",
  "id": "https://remote.example/users/alice#likes/7",
  "actor": "https://remote.example/users/alice",
  "object": "https://remote.example/users/alice/statuses/1"
}"#,
        );
        f.dispatcher
            .handle(&like, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        f.dispatcher
            .handle(&like, Some(&f.bob), &f.alice)
            .await
            .unwrap();
        assert_eq!(f.storage.faves().await.len(), 1);
        // One for the Note, one for the Like
        assert_eq!(f.queue.taken().len(), 2);
    }

    #[tokio::test]
    async fn test_block_and_flag() {
        let f = fixture(false).await;
        f.dispatcher
            .handle(
                &activity(
                    r#"{
  "type": "Block",
  "id": "https://remote.example/blocks/1",
  "actor": "https://remote.example/users/alice",
  "object": "https://local.example/users/bob"
}"#,
                ),
                Some(&f.bob),
                &f.alice,
            )
            .await
            .unwrap();
        f.dispatcher
            .handle(
                &activity(
                    r#"{
  "type": "Flag",
  "id": "https://remote.example/flags/1",
  "actor": "https://remote.example/users/alice",
  "object": "https://local.example/users/bob",
  "content": "spam"
}"#,
                ),
                Some(&f.bob),
                &f.alice,
            )
            .await
            .unwrap();
        assert_eq!(f.storage.blocks().await.len(), 1);
        assert_eq!(f.storage.reports().await.len(), 1);
        let kinds = f
            .queue
            .taken()
            .iter()
            .map(|m| m.object_type)
            .collect::<Vec<Type>>();
        assert_eq!(kinds, vec![Type::Block, Type::Flag]);
    }

    #[tokio::test]
    async fn test_failures_are_fatal() {
        // Storage down
        let f = fixture(false).await;
        let follow = activity(
            r#"{
  "type": "Follow",
  "id": "https://remote.example/users/alice#follows/2",
  "actor": "https://remote.example/users/alice",
  "object": "https://local.example/users/bob"
}"#,
        );
        f.storage.set_unavailable(true);
        assert!(f.dispatcher.handle(&follow, Some(&f.bob), &f.alice).await.is_err());
        assert!(f.queue.taken().is_empty());

        // Queue full: the record is written, but the activity still fails (& will be retried)
        let f = fixture(true).await;
        assert!(matches!(
            f.dispatcher.handle(&follow, Some(&f.bob), &f.alice).await,
            Err(Error::Enqueue { .. })
        ));
    }

    #[tokio::test]
    async fn test_unrecognized() {
        let f = fixture(false).await;
        f.dispatcher
            .handle(&Activity::Unrecognized("Announce".to_owned()), Some(&f.bob), &f.alice)
            .await
            .unwrap();
        assert!(f.queue.taken().is_empty());
    }
}
