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


//! # Administering domain permissions
//!
//! Routes served on the private listener:
//!
//! | Route | Methods |
//! |---|---|
//! | `/admin/domain_blocks`, `/admin/domain_allows` | `GET` (list), `POST` (create) |
//! | `/admin/domain_blocks/{id}`, `/admin/domain_allows/{id}` | `GET`, `DELETE` |
//! | `/admin/domain_permission_drafts` | `GET` (filter & page), `POST` |
//! | `/admin/domain_permission_drafts/{id}` | `GET`, `DELETE` |
//! | `/admin/domain_permission_subscriptions` | `GET` (filter & page), `POST` |
//! | `/admin/domain_permission_subscriptions/{id}` | `GET`, `DELETE` |
//!
//! plus the public `GET /api/v1/instance/domain_blocks`, which shows obfuscated domains with some
//! of their characters starred-out.
//!
//! Records only carry the id of the account that created them; each request resolves those through
//! its own [AccountLoader].

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;
use tracing::{error, info, warn};
use url::Url;

use fedgate_shared::domain::{self, Domain};

use crate::{
    counter_add, domain_gate,
    domain_permissions::{self, AccountLoader},
    entities::{
        AccountId, DomainPermission, DomainPermissionDraft, DomainPermissionDraftId,
        DomainPermissionId, DomainPermissionSubscription, DomainPermissionSubscriptionId,
        DomainPermissionType, SubscriptionContentType,
    },
    fedgate::Fedgate,
    http::{ErrorResponseBody, RequestingAccount},
    metrics::{self, Instruments, Sort},
    storage::{Order, Page},
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
    #[snafu(display("{source}"))]
    Gate { source: domain_gate::Error },
    #[snafu(display("No {what} {id}"))]
    NotFound {
        what: &'static str,
        id: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Permissions { source: domain_permissions::Error },
    #[snafu(display("The request was not authenticated"))]
    Unauthenticated { backtrace: Backtrace },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        use domain_gate::Error as GateError;
        use domain_permissions::Error as PermissionsError;
        match self {
            Error::BadDomain { .. } => (StatusCode::BAD_REQUEST, format!("{}", self)),
            Error::Gate { source } => match source {
                GateError::BadDomain { .. } => (StatusCode::BAD_REQUEST, format!("{}", self)),
                GateError::Duplicate { .. } => (StatusCode::CONFLICT, format!("{}", self)),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_owned(),
                ),
            },
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, format!("{}", self)),
            Error::Permissions { source } => match source {
                PermissionsError::BadDomain { .. } => {
                    (StatusCode::BAD_REQUEST, format!("{}", self))
                }
                PermissionsError::DuplicateDraft { .. }
                | PermissionsError::DuplicateSubscription { .. } => {
                    (StatusCode::CONFLICT, format!("{}", self))
                }
                PermissionsError::Storage { .. } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_owned(),
                ),
            },
            Error::Unauthenticated { .. } => (StatusCode::UNAUTHORIZED, format!("{}", self)),
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

inventory::submit! { metrics::Registration::new("admin.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("admin.errors", Sort::IntegralCounter) }

fn respond<T: Serialize>(result: Result<T>, instruments: &Instruments) -> axum::response::Response {
    counter_add!(instruments, "admin.requests", 1, &[]);
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            let (code, _) = err.as_status_and_msg();
            if code.is_server_error() {
                error!("{:#?}", err);
            } else {
                warn!("{}", err);
            }
            counter_add!(instruments, "admin.errors", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           API models                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Star-out some of the characters in `domain`, leaving the dots
///
/// `example.org` becomes `e**mp**.o**`: recognizable to someone who already knows the domain, not
/// much help to someone looking for it.
pub fn obfuscate(domain: &str) -> String {
    domain
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if c != '.' && matches!(i % 4, 1 | 2) {
                '*'
            } else {
                c
            }
        })
        .collect()
}

/// A domain block, allow or draft as presented to administrators
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiDomainPermission {
    pub id: String,
    pub domain: String,
    /// Only present on drafts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_type: Option<DomainPermissionType>,
    #[serde(default)]
    pub obfuscate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<DomainPermissionSubscriptionId>,
    /// Omitted if the creating account no longer exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<AccountId>,
    pub created_at: DateTime<Utc>,
}

impl ApiDomainPermission {
    async fn from_permission(
        permission: &DomainPermission,
        loader: &AccountLoader,
    ) -> Result<ApiDomainPermission> {
        ApiDomainPermission {
            id: permission.id.to_string(),
            domain: permission.domain.to_string(),
            permission_type: None,
            obfuscate: permission.obfuscate,
            public_comment: permission.public_comment.clone(),
            private_comment: permission.private_comment.clone(),
            subscription_id: permission.subscription_id,
            created_by: loader
                .account(&permission.created_by_account_id)
                .await
                .context(PermissionsSnafu)?
                .map(|acct| acct.id),
            created_at: permission.created_at,
        }
        .pipe(Ok)
    }
    async fn from_draft(
        draft: &DomainPermissionDraft,
        loader: &AccountLoader,
    ) -> Result<ApiDomainPermission> {
        ApiDomainPermission {
            id: draft.id.to_string(),
            domain: draft.domain.to_string(),
            permission_type: Some(draft.permission_type),
            obfuscate: draft.obfuscate,
            public_comment: draft.public_comment.clone(),
            private_comment: draft.private_comment.clone(),
            subscription_id: draft.subscription_id,
            created_by: loader
                .created_by_draft(draft)
                .await
                .context(PermissionsSnafu)?
                .map(|acct| acct.id),
            created_at: draft.created_at,
        }
        .pipe(Ok)
    }
}

/// A domain permission subscription as presented to administrators; the fetch password is never
/// shown
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ApiDomainPermissionSubscription {
    pub id: DomainPermissionSubscriptionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub permission_type: DomainPermissionType,
    pub as_draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_account_id: Option<AccountId>,
    pub content_type: SubscriptionContentType,
    pub uri: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub count: u64,
}

impl ApiDomainPermissionSubscription {
    async fn new(
        sub: &DomainPermissionSubscription,
        loader: &AccountLoader,
    ) -> Result<ApiDomainPermissionSubscription> {
        ApiDomainPermissionSubscription {
            id: sub.id,
            title: sub.title.clone(),
            permission_type: sub.permission_type,
            as_draft: sub.as_draft,
            created_by_account_id: loader
                .created_by_subscription(sub)
                .await
                .context(PermissionsSnafu)?
                .map(|acct| acct.id),
            content_type: sub.content_type,
            uri: sub.uri.clone(),
            fetch_username: sub.fetch_username.clone(),
            fetched_at: sub.fetched_at,
            error: sub.error.clone(),
            count: sub.count,
        }
        .pipe(Ok)
    }
}

/// A domain block as presented to the public
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublicDomainBlock {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl From<&DomainPermission> for PublicDomainBlock {
    fn from(value: &DomainPermission) -> Self {
        PublicDomainBlock {
            domain: if value.obfuscate {
                obfuscate(&value.domain)
            } else {
                value.domain.to_string()
            },
            comment: value.public_comment.clone(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      domain blocks & allows                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Which flavor of domain permission a route is operating on
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    DomainBlocks,
    DomainAllows,
}

impl PermissionKind {
    fn permission_type(self) -> DomainPermissionType {
        match self {
            PermissionKind::DomainBlocks => DomainPermissionType::Block,
            PermissionKind::DomainAllows => DomainPermissionType::Allow,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DomainPermissionRequest {
    pub domain: String,
    #[serde(default)]
    pub obfuscate: bool,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
}

async fn list_permissions(
    State(state): State<Arc<Fedgate>>,
    Path(kind): Path<PermissionKind>,
) -> axum::response::Response {
    async fn list_permissions1(
        state: &Fedgate,
        kind: PermissionKind,
    ) -> Result<Vec<ApiDomainPermission>> {
        let permissions = match kind {
            PermissionKind::DomainBlocks => state.gate.domain_blocks().await,
            PermissionKind::DomainAllows => state.gate.domain_allows().await,
        }
        .context(GateSnafu)?;
        let loader = AccountLoader::new(state.storage.clone());
        try_join_all(
            permissions
                .iter()
                .map(|p| ApiDomainPermission::from_permission(p, &loader)),
        )
        .await
    }
    respond(list_permissions1(&state, kind).await, &state.instruments)
}

async fn create_permission(
    State(state): State<Arc<Fedgate>>,
    Path(kind): Path<PermissionKind>,
    requesting: Option<Extension<RequestingAccount>>,
    Json(request): Json<DomainPermissionRequest>,
) -> axum::response::Response {
    async fn create_permission1(
        state: &Fedgate,
        kind: PermissionKind,
        requesting: Option<&RequestingAccount>,
        request: DomainPermissionRequest,
    ) -> Result<ApiDomainPermission> {
        let requesting = requesting.context(UnauthenticatedSnafu)?;
        let mut permission = DomainPermission::new(
            kind.permission_type(),
            Domain::parse(&request.domain).context(BadDomainSnafu)?,
            requesting.id,
        );
        permission.obfuscate = request.obfuscate;
        permission.private_comment = request.private_comment;
        permission.public_comment = request.public_comment;
        let permission = match kind {
            PermissionKind::DomainBlocks => state.gate.create_domain_block(permission).await,
            PermissionKind::DomainAllows => state.gate.create_domain_allow(permission).await,
        }
        .context(GateSnafu)?;
        info!(
            "{} created a domain {} for {}",
            requesting.uri, permission.permission_type, permission.domain
        );
        ApiDomainPermission::from_permission(
            &permission,
            &AccountLoader::new(state.storage.clone()),
        )
        .await
    }
    respond(
        create_permission1(
            &state,
            kind,
            requesting.as_ref().map(|Extension(acct)| acct),
            request,
        )
        .await,
        &state.instruments,
    )
}

async fn permission_by_id(
    state: &Fedgate,
    kind: PermissionKind,
    id: &DomainPermissionId,
) -> Result<DomainPermission> {
    match kind {
        PermissionKind::DomainBlocks => state.gate.domain_block_by_id(id).await,
        PermissionKind::DomainAllows => state.gate.domain_allow_by_id(id).await,
    }
    .context(GateSnafu)?
    .context(NotFoundSnafu {
        what: match kind {
            PermissionKind::DomainBlocks => "domain block",
            PermissionKind::DomainAllows => "domain allow",
        },
        id: id.to_string(),
    })
}

async fn get_permission(
    State(state): State<Arc<Fedgate>>,
    Path((kind, id)): Path<(PermissionKind, DomainPermissionId)>,
) -> axum::response::Response {
    async fn get_permission1(
        state: &Fedgate,
        kind: PermissionKind,
        id: &DomainPermissionId,
    ) -> Result<ApiDomainPermission> {
        let permission = permission_by_id(state, kind, id).await?;
        ApiDomainPermission::from_permission(
            &permission,
            &AccountLoader::new(state.storage.clone()),
        )
        .await
    }
    respond(get_permission1(&state, kind, &id).await, &state.instruments)
}

/// Delete a block or allow, answering with the record as it was
async fn delete_permission(
    State(state): State<Arc<Fedgate>>,
    Path((kind, id)): Path<(PermissionKind, DomainPermissionId)>,
) -> axum::response::Response {
    async fn delete_permission1(
        state: &Fedgate,
        kind: PermissionKind,
        id: &DomainPermissionId,
    ) -> Result<ApiDomainPermission> {
        let permission = permission_by_id(state, kind, id).await?;
        match kind {
            PermissionKind::DomainBlocks => state.gate.delete_domain_block(&permission.domain).await,
            PermissionKind::DomainAllows => state.gate.delete_domain_allow(&permission.domain).await,
        }
        .context(GateSnafu)?;
        info!(
            "Removed the domain {} for {}",
            permission.permission_type, permission.domain
        );
        ApiDomainPermission::from_permission(
            &permission,
            &AccountLoader::new(state.storage.clone()),
        )
        .await
    }
    respond(delete_permission1(&state, kind, &id).await, &state.instruments)
}

/// `GET /api/v1/instance/domain_blocks`
async fn public_domain_blocks(State(state): State<Arc<Fedgate>>) -> axum::response::Response {
    match state.gate.domain_blocks().await.context(GateSnafu) {
        Ok(blocks) => blocks
            .iter()
            .map(PublicDomainBlock::from)
            .collect::<Vec<_>>()
            .pipe(Json)
            .into_response(),
        Err(err) => {
            error!("{:#?}", err);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  drafts & subscriptions                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

// Asking for `min_id` means paging *up*
fn page<T: Copy + Ord>(max_id: Option<T>, min_id: Option<T>, limit: Option<usize>) -> Page<T> {
    Page {
        max_id,
        min_id,
        limit: Some(limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)),
        order: if min_id.is_some() {
            Order::Ascending
        } else {
            Order::Descending
        },
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DraftQuery {
    pub permission_type: Option<DomainPermissionType>,
    pub subscription_id: Option<DomainPermissionSubscriptionId>,
    pub domain: Option<String>,
    pub max_id: Option<DomainPermissionDraftId>,
    pub min_id: Option<DomainPermissionDraftId>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DraftRequest {
    pub permission_type: DomainPermissionType,
    pub domain: String,
    #[serde(default)]
    pub obfuscate: bool,
    pub private_comment: Option<String>,
    pub public_comment: Option<String>,
}

async fn list_drafts(
    State(state): State<Arc<Fedgate>>,
    Query(query): Query<DraftQuery>,
) -> axum::response::Response {
    async fn list_drafts1(state: &Fedgate, query: DraftQuery) -> Result<Vec<ApiDomainPermission>> {
        let drafts = state
            .permissions
            .drafts(
                query.permission_type,
                query.subscription_id,
                query.domain.as_deref(),
                None,
                &page(query.max_id, query.min_id, query.limit),
            )
            .await
            .context(PermissionsSnafu)?;
        let loader = AccountLoader::new(state.storage.clone());
        try_join_all(drafts.iter().map(|d| ApiDomainPermission::from_draft(d, &loader))).await
    }
    respond(list_drafts1(&state, query).await, &state.instruments)
}

async fn create_draft(
    State(state): State<Arc<Fedgate>>,
    requesting: Option<Extension<RequestingAccount>>,
    Json(request): Json<DraftRequest>,
) -> axum::response::Response {
    async fn create_draft1(
        state: &Fedgate,
        requesting: Option<&RequestingAccount>,
        request: DraftRequest,
    ) -> Result<ApiDomainPermission> {
        let requesting = requesting.context(UnauthenticatedSnafu)?;
        let mut draft = DomainPermissionDraft::new(
            request.permission_type,
            Domain::parse(&request.domain).context(BadDomainSnafu)?,
            requesting.id,
        );
        draft.obfuscate = request.obfuscate;
        draft.private_comment = request.private_comment;
        draft.public_comment = request.public_comment;
        let draft = state
            .permissions
            .put_draft(draft)
            .await
            .context(PermissionsSnafu)?;
        ApiDomainPermission::from_draft(&draft, &AccountLoader::new(state.storage.clone())).await
    }
    respond(
        create_draft1(
            &state,
            requesting.as_ref().map(|Extension(acct)| acct),
            request,
        )
        .await,
        &state.instruments,
    )
}

async fn draft_by_id(
    state: &Fedgate,
    id: &DomainPermissionDraftId,
) -> Result<DomainPermissionDraft> {
    state
        .permissions
        .draft_by_id(id)
        .await
        .context(PermissionsSnafu)?
        .context(NotFoundSnafu {
            what: "domain permission draft",
            id: id.to_string(),
        })
}

async fn get_draft(
    State(state): State<Arc<Fedgate>>,
    Path(id): Path<DomainPermissionDraftId>,
) -> axum::response::Response {
    async fn get_draft1(
        state: &Fedgate,
        id: &DomainPermissionDraftId,
    ) -> Result<ApiDomainPermission> {
        let draft = draft_by_id(state, id).await?;
        ApiDomainPermission::from_draft(&draft, &AccountLoader::new(state.storage.clone())).await
    }
    respond(get_draft1(&state, &id).await, &state.instruments)
}

async fn delete_draft(
    State(state): State<Arc<Fedgate>>,
    Path(id): Path<DomainPermissionDraftId>,
) -> axum::response::Response {
    async fn delete_draft1(
        state: &Fedgate,
        id: &DomainPermissionDraftId,
    ) -> Result<ApiDomainPermission> {
        let draft = draft_by_id(state, id).await?;
        state
            .permissions
            .delete_draft(id)
            .await
            .context(PermissionsSnafu)?;
        ApiDomainPermission::from_draft(&draft, &AccountLoader::new(state.storage.clone())).await
    }
    respond(delete_draft1(&state, &id).await, &state.instruments)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscriptionQuery {
    pub permission_type: Option<DomainPermissionType>,
    pub max_id: Option<DomainPermissionSubscriptionId>,
    pub min_id: Option<DomainPermissionSubscriptionId>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub permission_type: DomainPermissionType,
    pub content_type: SubscriptionContentType,
    pub uri: Url,
    pub title: Option<String>,
    pub as_draft: Option<bool>,
    pub fetch_username: Option<String>,
    pub fetch_password: Option<SecretString>,
}

async fn list_subscriptions(
    State(state): State<Arc<Fedgate>>,
    Query(query): Query<SubscriptionQuery>,
) -> axum::response::Response {
    async fn list_subscriptions1(
        state: &Fedgate,
        query: SubscriptionQuery,
    ) -> Result<Vec<ApiDomainPermissionSubscription>> {
        let subs = state
            .permissions
            .subscriptions(
                query.permission_type,
                &page(query.max_id, query.min_id, query.limit),
            )
            .await
            .context(PermissionsSnafu)?;
        let loader = AccountLoader::new(state.storage.clone());
        try_join_all(
            subs.iter()
                .map(|s| ApiDomainPermissionSubscription::new(s, &loader)),
        )
        .await
    }
    respond(list_subscriptions1(&state, query).await, &state.instruments)
}

async fn create_subscription(
    State(state): State<Arc<Fedgate>>,
    requesting: Option<Extension<RequestingAccount>>,
    Json(request): Json<SubscriptionRequest>,
) -> axum::response::Response {
    async fn create_subscription1(
        state: &Fedgate,
        requesting: Option<&RequestingAccount>,
        request: SubscriptionRequest,
    ) -> Result<ApiDomainPermissionSubscription> {
        let requesting = requesting.context(UnauthenticatedSnafu)?;
        let mut sub = DomainPermissionSubscription::new(
            request.permission_type,
            request.content_type,
            request.uri,
            requesting.id,
        );
        sub.title = request.title;
        sub.as_draft = request.as_draft.unwrap_or(true);
        sub.fetch_username = request.fetch_username;
        sub.fetch_password = request.fetch_password;
        let sub = state
            .permissions
            .put_subscription(sub)
            .await
            .context(PermissionsSnafu)?;
        ApiDomainPermissionSubscription::new(&sub, &AccountLoader::new(state.storage.clone())).await
    }
    respond(
        create_subscription1(
            &state,
            requesting.as_ref().map(|Extension(acct)| acct),
            request,
        )
        .await,
        &state.instruments,
    )
}

async fn subscription_by_id(
    state: &Fedgate,
    id: &DomainPermissionSubscriptionId,
) -> Result<DomainPermissionSubscription> {
    state
        .permissions
        .subscription_by_id(id)
        .await
        .context(PermissionsSnafu)?
        .context(NotFoundSnafu {
            what: "domain permission subscription",
            id: id.to_string(),
        })
}

async fn get_subscription(
    State(state): State<Arc<Fedgate>>,
    Path(id): Path<DomainPermissionSubscriptionId>,
) -> axum::response::Response {
    async fn get_subscription1(
        state: &Fedgate,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<ApiDomainPermissionSubscription> {
        let sub = subscription_by_id(state, id).await?;
        ApiDomainPermissionSubscription::new(&sub, &AccountLoader::new(state.storage.clone())).await
    }
    respond(get_subscription1(&state, &id).await, &state.instruments)
}

async fn delete_subscription(
    State(state): State<Arc<Fedgate>>,
    Path(id): Path<DomainPermissionSubscriptionId>,
) -> axum::response::Response {
    async fn delete_subscription1(
        state: &Fedgate,
        id: &DomainPermissionSubscriptionId,
    ) -> Result<ApiDomainPermissionSubscription> {
        let sub = subscription_by_id(state, id).await?;
        state
            .permissions
            .delete_subscription(id)
            .await
            .context(PermissionsSnafu)?;
        ApiDomainPermissionSubscription::new(&sub, &AccountLoader::new(state.storage.clone())).await
    }
    respond(delete_subscription1(&state, &id).await, &state.instruments)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Act as the instance actor unless someone else has already been authenticated
///
/// Intended for the private listener only: anyone who can reach it is an operator.
pub async fn as_instance_actor(
    State(state): State<Arc<Fedgate>>,
    mut request: Request,
    next: Next,
) -> axum::response::Response {
    if request.extensions().get::<RequestingAccount>().is_none() {
        match state
            .storage
            .local_account_by_username(state.instance_username())
            .await
        {
            Ok(Some(acct)) => {
                request.extensions_mut().insert(RequestingAccount(acct));
            }
            Ok(None) => warn!("No instance actor {}", state.instance_username()),
            Err(err) => error!("While looking up the instance actor: {:?}", err),
        }
    }
    next.run(request).await
}

/// Routes for administrators; serve these on the private listener
pub fn make_router() -> Router<Arc<Fedgate>> {
    Router::new()
        .route(
            "/admin/domain_permission_drafts",
            get(list_drafts).post(create_draft),
        )
        .route(
            "/admin/domain_permission_drafts/{id}",
            get(get_draft).delete(delete_draft),
        )
        .route(
            "/admin/domain_permission_subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route(
            "/admin/domain_permission_subscriptions/{id}",
            get(get_subscription).delete(delete_subscription),
        )
        .route(
            "/admin/{kind}",
            get(list_permissions).post(create_permission),
        )
        .route(
            "/admin/{kind}/{id}",
            get(get_permission).delete(delete_permission),
        )
}

/// Routes for anyone
pub fn make_public_router() -> Router<Arc<Fedgate>> {
    Router::new().route("/api/v1/instance/domain_blocks", get(public_domain_blocks))
}
