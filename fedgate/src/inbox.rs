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


//! # The inbox
//!
//! `POST /users/{username}/inbox` & the shared `POST /inbox`. By the time a delivery gets here, the
//! sender has been authenticated & resolved to an [Account] (placed in the request extensions as a
//! [RequestingAccount]). What's left is to:
//!
//! 1. refuse the delivery if the sender's domain is blocked
//! 2. parse the body into an [Activity]
//! 3. refuse it again if the activity claims an actor from a blocked domain
//! 4. look up the receiving local account
//! 5. hand it all to the [Dispatcher](crate::dispatcher::Dispatcher)
//!
//! Dispatch failures are logged in full, but the remote only ever sees a generic `400`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Extension, Router,
};
use opentelemetry::KeyValue;
use snafu::{prelude::*, Backtrace};
use tracing::{debug, error, info};

use fedgate_shared::Username;

use crate::{
    ap_entities::Activity,
    counter_add, dispatcher, domain_gate,
    entities::Account,
    fedgate::Fedgate,
    http::{ErrorResponseBody, RequestingAccount},
    metrics::{self, Instruments, Sort},
    storage,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Deliveries from {uri} are blocked"))]
    Blocked { uri: String, backtrace: Backtrace },
    #[snafu(display("Failed to dispatch activity: {source}"))]
    Dispatch { source: dispatcher::Error },
    #[snafu(display("Domain permission check failed: {source}"))]
    Gate { source: domain_gate::Error },
    #[snafu(display("Failed to parse activity: {source}"))]
    Malformed {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("No instance actor {username}"))]
    NoInstanceActor {
        username: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown user {username}"))]
    NoUser {
        username: Username,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The request was not authenticated"))]
    Unauthenticated { backtrace: Backtrace },
    #[snafu(display("Unsupported activity type {kind}"))]
    Unrecognized { kind: String, backtrace: Backtrace },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::Blocked { .. } => (StatusCode::FORBIDDEN, "Forbidden".to_owned()),
            // Don't leak the details; they've been logged
            Error::Dispatch { .. } => (
                StatusCode::BAD_REQUEST,
                "Unable to process activity".to_owned(),
            ),
            Error::Gate { source } if source.is_bad_domain() => {
                (StatusCode::BAD_REQUEST, format!("{}", self))
            }
            Error::Gate { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_owned(),
            ),
            Error::Malformed { .. } => (StatusCode::BAD_REQUEST, "Malformed activity".to_owned()),
            Error::NoInstanceActor { .. } => (StatusCode::NOT_FOUND, format!("{}", self)),
            Error::NoUser { username, .. } => {
                (StatusCode::NOT_FOUND, format!("Unknown user {}", username))
            }
            Error::Storage { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_owned(),
            ),
            Error::Unauthenticated { .. } => (StatusCode::UNAUTHORIZED, format!("{}", self)),
            Error::Unrecognized { .. } => (StatusCode::BAD_REQUEST, "Malformed activity".to_owned()),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, ErrorResponseBody { error: msg }).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        inbox handlers                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("inbox.accepted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("inbox.blocked", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("inbox.errors", Sort::IntegralCounter) }

/// Whose inbox is this?
enum Recipient<'a> {
    User(&'a Username),
    /// The shared inbox; deliveries there are received by the instance actor
    Instance,
}

async fn receiving_account(state: &Fedgate, recipient: &Recipient<'_>) -> Result<Account> {
    match recipient {
        Recipient::User(username) => state
            .storage
            .local_account_by_username(username)
            .await
            .context(StorageSnafu)?
            .context(NoUserSnafu {
                username: (*username).clone(),
            }),
        Recipient::Instance => state
            .storage
            .local_account_by_username(state.instance_username())
            .await
            .context(StorageSnafu)?
            .context(NoInstanceActorSnafu {
                username: state.instance_username().to_owned(),
            }),
    }
}

async fn inbox1(
    state: &Fedgate,
    recipient: Recipient<'_>,
    requesting: Option<&Account>,
    body: &[u8],
) -> Result<()> {
    let requesting = requesting.context(UnauthenticatedSnafu)?;

    if state
        .gate
        .is_uri_blocked(&requesting.uri)
        .await
        .context(GateSnafu)?
    {
        return BlockedSnafu {
            uri: requesting.uri.to_string(),
        }
        .fail();
    }

    let activity = serde_json::from_slice::<Activity>(body).context(MalformedSnafu)?;
    if let Activity::Unrecognized(kind) = &activity {
        return UnrecognizedSnafu { kind: kind.clone() }.fail();
    }
    // The sender may be relaying on behalf of some other actor
    if state
        .gate
        .are_uris_blocked(activity.actor())
        .await
        .context(GateSnafu)?
    {
        return BlockedSnafu {
            uri: activity
                .actor()
                .map(|uri| uri.to_string())
                .unwrap_or_default(),
        }
        .fail();
    }

    let receiving = receiving_account(state, &recipient).await?;
    debug!(
        "{} delivered a {} to {}",
        requesting.uri,
        activity.kind(),
        receiving.uri
    );

    state
        .dispatcher
        .handle(&activity, Some(&receiving), requesting)
        .await
        .context(DispatchSnafu)
}

fn handle_err(err: Error, instruments: &Instruments) -> axum::response::Response {
    if matches!(err, Error::Blocked { .. }) {
        info!("{}", err);
        counter_add!(instruments, "inbox.blocked", 1, &[]);
    } else {
        error!("{:#?}", err);
        let (code, _) = err.as_status_and_msg();
        counter_add!(
            instruments,
            "inbox.errors",
            1,
            &[KeyValue::new("status", code.as_u16() as i64)]
        );
    }
    err.into_response()
}

fn accepted(instruments: &Instruments) -> axum::response::Response {
    counter_add!(instruments, "inbox.accepted", 1, &[]);
    (StatusCode::ACCEPTED, ()).into_response()
}

/// `POST /users/{username}/inbox`
async fn user_inbox(
    State(state): State<Arc<Fedgate>>,
    Path(username): Path<Username>,
    requesting: Option<Extension<RequestingAccount>>,
    body: Bytes,
) -> axum::response::Response {
    match inbox1(
        &state,
        Recipient::User(&username),
        requesting.as_ref().map(|Extension(acct)| &acct.0),
        &body,
    )
    .await
    {
        Ok(_) => accepted(&state.instruments),
        Err(err) => handle_err(err, &state.instruments),
    }
}

/// `POST /inbox`
async fn shared_inbox(
    State(state): State<Arc<Fedgate>>,
    requesting: Option<Extension<RequestingAccount>>,
    body: Bytes,
) -> axum::response::Response {
    match inbox1(
        &state,
        Recipient::Instance,
        requesting.as_ref().map(|Extension(acct)| &acct.0),
        &body,
    )
    .await
    {
        Ok(_) => accepted(&state.instruments),
        Err(err) => handle_err(err, &state.instruments),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn make_router() -> Router<Arc<Fedgate>> {
    Router::new()
        .route("/users/{username}/inbox", post(user_inbox))
        .route("/inbox", post(shared_inbox))
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use url::Url;

    use fedgate_shared::domain::Domain;

    use crate::{
        ap_entities::Type,
        domain_permissions,
        entities::{AccountId, DomainPermission, DomainPermissionType},
        memory::InMemory,
        side_effects::{self, BoundedQueue, FromFederator},
    };

    struct Fixture {
        storage: Arc<InMemory>,
        state: Arc<Fedgate>,
        receiver: mpsc::Receiver<FromFederator>,
        alice: Account,
    }

    fn account(username: &str, domain: Option<&str>, uri: &str) -> Account {
        Account {
            id: AccountId::new(),
            username: username.to_owned(),
            domain: domain.map(|d| Domain::parse(d).unwrap()),
            uri: Url::parse(uri).unwrap(),
        }
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemory::new());
        let alice = account(
            "alice",
            Some("remote.example"),
            "https://remote.example/users/alice",
        );
        storage.add_account(alice.clone()).await;
        storage
            .add_account(account("bob", None, "https://local.example/users/bob"))
            .await;
        storage
            .add_account(account(
                "local.example",
                None,
                "https://local.example/users/local.example",
            ))
            .await;
        let instruments = Arc::new(Instruments::default());
        let (queue, receiver) = BoundedQueue::new(&side_effects::Config::default(), instruments.clone());
        let state = Arc::new(Fedgate::new(
            &domain_gate::Config {
                host: Domain::parse("local.example").unwrap(),
                ..Default::default()
            },
            &domain_permissions::Config::default(),
            storage.clone(),
            Arc::new(queue),
            instruments,
        ));
        Fixture {
            storage,
            state,
            receiver,
            alice,
        }
    }

    const FOLLOW: &str = r#"{
  "@context": "https://www.w3.org/ns/activitystreams",
  "type": "Follow",
  "id": "https://remote.example/users/alice#follows/7",
  "actor": "https://remote.example/users/alice",
  "object": "https://local.example/users/bob"
}"#;

    async fn deliver(
        f: &Fixture,
        path: &str,
        from: Option<&Account>,
        body: &str,
    ) -> (StatusCode, String) {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/activity+json")
            .body(Body::from(body.to_owned()))
            .unwrap();
        if let Some(acct) = from {
            request
                .extensions_mut()
                .insert(RequestingAccount(acct.clone()));
        }
        let rsp = make_router()
            .with_state(f.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = rsp.status();
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_follow_accepted() {
        let mut f = fixture().await;
        let (status, _) = deliver(&f, "/users/bob/inbox", Some(&f.alice), FOLLOW).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(f.storage.follow_requests().await.len(), 1);
        let msg = f.receiver.try_recv().unwrap();
        assert_eq!(msg.object_type, Type::Follow);
        assert_eq!(msg.receiving_account.username, "bob");
    }

    #[tokio::test]
    async fn test_blocked_sender() {
        let mut f = fixture().await;
        f.state
            .gate
            .create_domain_block(DomainPermission::new(
                DomainPermissionType::Block,
                Domain::parse("remote.example").unwrap(),
                AccountId::new(),
            ))
            .await
            .unwrap();
        let (status, _) = deliver(&f, "/users/bob/inbox", Some(&f.alice), FOLLOW).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(f.storage.follow_requests().await.is_empty());
        assert!(f.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocked_actor() {
        let f = fixture().await;
        f.state
            .gate
            .create_domain_block(DomainPermission::new(
                DomainPermissionType::Block,
                Domain::parse("evil.example").unwrap(),
                AccountId::new(),
            ))
            .await
            .unwrap();
        let relayed = FOLLOW.replace(
            "\"actor\": \"https://remote.example/users/alice\"",
            "\"actor\": \"https://evil.example/users/mallory\"",
        );
        let (status, _) = deliver(&f, "/users/bob/inbox", Some(&f.alice), &relayed).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rejections() {
        let f = fixture().await;
        let (status, _) = deliver(&f, "/users/bob/inbox", None, FOLLOW).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = deliver(&f, "/users/carol/inbox", Some(&f.alice), FOLLOW).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = deliver(&f, "/users/bob/inbox", Some(&f.alice), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = deliver(
            &f,
            "/users/bob/inbox",
            Some(&f.alice),
            r#"{"type": "Announce", "actor": "https://remote.example/users/alice"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Malformed"));
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_opaque() {
        let f = fixture().await;
        let (status, body) = deliver(
            &f,
            "/users/bob/inbox",
            Some(&f.alice),
            r#"{"type": "Create", "actor": "https://remote.example/users/alice"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body = serde_json::from_str::<ErrorResponseBody>(&body).unwrap();
        assert_eq!(body.error, "Unable to process activity");
    }

    #[tokio::test]
    async fn test_shared_inbox() {
        let mut f = fixture().await;
        let (status, _) = deliver(&f, "/inbox", Some(&f.alice), FOLLOW).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let msg = f.receiver.try_recv().unwrap();
        assert_eq!(msg.receiving_account.username, "local.example");
    }
}
