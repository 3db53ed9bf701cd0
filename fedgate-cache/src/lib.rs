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

//! # fedgate-cache
//!
//! In-process caches sitting in front of the fedgate storage layer.
//!
//! Two shapes of cache are needed:
//!
//! 1. [DomainCache]: answers "is this domain a member of the block-set (or the allow-set)?" Every
//!    inbound delivery asks this question (twice), so it has to be cheap; on the other hand, the
//!    sets change only when a moderator acts. The cache therefore loads the *entire* set on first
//!    use & throws it all away on any change.
//!
//! 2. [KeyedCache]: an LRU map from identifier to record, for the lower-volume moderation records
//!    (permission drafts & subscriptions) which are read by id & invalidated by id.
//!
//! Neither cache knows anything about storage; callers supply a loader (or writer) closure at the
//! point of use.

pub mod domains;
pub mod keyed;

pub use domains::DomainCache;
pub use keyed::KeyedCache;
