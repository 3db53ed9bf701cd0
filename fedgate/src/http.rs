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


//! HTTP odds & ends shared by the inbox & admin routers

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::{entities::Account, fedgate::Fedgate};

/// A serializable struct for use in HTTP error responses
///
/// Every handler error in this crate is rendered as one of these, so callers always get a JSON
/// body of the form `{"error": "..."}`.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// The authenticated account on whose behalf a request is being made
///
/// Placed into the request extensions by whatever middleware authenticated the request (HTTP
/// signature verification for the inbox, operator auth for the admin API). Handlers that require
/// it answer `401` when it's missing.
#[derive(Clone, Debug)]
pub struct RequestingAccount(pub Account);

impl std::ops::Deref for RequestingAccount {
    type Target = Account;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The header in which an authenticating front-end names the actor whose signature it verified
pub const AUTHENTICATED_ACTOR: &str = "x-authenticated-actor";

/// Resolve the actor named in the [AUTHENTICATED_ACTOR] header to a [RequestingAccount]
///
/// HTTP signature verification happens in front of us; this just trusts its verdict. Unknown actors
/// are passed through unauthenticated.
pub async fn trusted_actor(
    State(state): State<Arc<Fedgate>>,
    mut request: Request,
    next: Next,
) -> axum::response::Response {
    let actor = request
        .headers()
        .get(AUTHENTICATED_ACTOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| Url::parse(text).ok());
    if let Some(uri) = actor {
        match state.storage.account_by_uri(&uri).await {
            Ok(Some(acct)) => {
                request.extensions_mut().insert(RequestingAccount(acct));
            }
            Ok(None) => debug!("Unknown actor {}", uri),
            Err(err) => error!("While resolving {}: {:?}", uri, err),
        }
    }
    next.run(request).await
}
