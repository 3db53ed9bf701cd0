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


//! # fedgate
//!
//! Inbound ActivityPub ingestion for a federated social server: decide whether a remote domain may
//! talk to us at all ([domain_gate]), then turn each accepted activity into durable records &
//! side-effect messages ([dispatcher]).
//!
//! The library crate has the same name as the daemon, `fedgated`, which composes these pieces
//! behind a pair of axum listeners.
pub mod admin;
pub mod ap_entities;
pub mod convert;
pub mod dispatcher;
pub mod domain_gate;
pub mod domain_permissions;
pub mod entities;
pub mod fedgate;
pub mod http;
pub mod inbox;
pub mod memory;
pub mod metrics;
pub mod side_effects;
pub mod storage;
