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

//! # fedgate-shared
//!
//! Types shared by the fedgate crates: refined newtypes for values that arrive from untrusted
//! peers (usernames, domains) and a macro for declaring opaque, time-ordered identifiers.

pub mod domain;

use std::{fmt::Display, ops::Deref, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{name} is not a valid username"))]
    BadUsername { name: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// # Introduction
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity.
///
/// # Background
///
/// Records derived from remote objects are identified locally by [ULID]s: 128 bits, the high 48 of
/// which are a millisecond timestamp. That makes identifiers sort by creation time, which in turn
/// makes paging by "give me everything older than this id" a simple comparison. It also means an
/// identifier can be *backdated*: a status received today but claiming to have been published
/// last week can be given an identifier that sorts among last week's statuses.
///
/// [ULID]: https://github.com/ulid/spec
///
/// The expansion refers to `::ulid`, `::serde` & `::chrono`, so the invoking crate needs all three
/// as dependencies.
#[macro_export]
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            ::serde::Deserialize,
            ::serde::Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(::ulid::Ulid);
        impl $type_name {
            /// Mint a new identifier for the current instant
            pub fn new() -> $type_name {
                $type_name(::ulid::Ulid::new())
            }
            /// Mint a new identifier for the instant `dt` (which may well be in the past)
            pub fn from_datetime(dt: &::chrono::DateTime<::chrono::Utc>) -> $type_name {
                $type_name(::ulid::Ulid::from_datetime(::std::time::SystemTime::from(*dt)))
            }
            /// The instant encoded in this identifier (to millisecond resolution)
            pub fn datetime(&self) -> ::chrono::DateTime<::chrono::Utc> {
                ::chrono::DateTime::<::chrono::Utc>::from(self.0.datetime())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl ::std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl ::std::str::FromStr for $type_name {
            type Err = ::ulid::DecodeError;
            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                Ok($type_name(::ulid::Ulid::from_string(s)?))
            }
        }
    };
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    static ref USERNAME: Regex = Regex::new("^[a-zA-Z0-9_]+$").unwrap(/* known good */);
}

const MAX_USERNAME_LENGTH: usize = 64;

fn check_username(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_USERNAME_LENGTH && USERNAME.is_match(s)
}

/// A refined type representing the local part of an account address
///
/// Usernames appear in inbox paths (`/users/{username}/inbox`) so they are checked before ever
/// being handed to storage: ASCII letters, digits & underscores, one to sixty-four characters.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(name: &str) -> Result<Username> {
        check_username(name)
            .then_some(Username(name.to_owned()))
            .ok_or(
                BadUsernameSnafu {
                    name: name.to_owned(),
                }
                .build(),
            )
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `Username`
impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Username::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Username::new(s)
    }
}

impl TryFrom<String> for Username {
    type Error = Error;

    fn try_from(value: String) -> StdResult<Self, Self::Error> {
        if check_username(&value) {
            Ok(Username(value))
        } else {
            BadUsernameSnafu { name: value }.fail()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::{TimeZone, Utc};

    define_id!(TestId);

    #[test]
    fn test_usernames() {
        assert!(Username::new("alice").is_ok());
        assert!(Username::new("bob_2").is_ok());
        assert!(Username::new("").is_err());
        assert!(Username::new("not a name").is_err());
        assert!(Username::new("../etc/passwd").is_err());
        assert!(Username::new(&"x".repeat(65)).is_err());
        assert!(serde_json::from_str::<Username>("\"alice\"").is_ok());
        assert!(serde_json::from_str::<Username>("\"al/ice\"").is_err());
    }

    #[test]
    fn test_backdated_ids() {
        let last_week = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let old = TestId::from_datetime(&last_week);
        let now = TestId::new();
        assert!(old < now);
        assert_eq!(old.datetime(), last_week);

        let text = format!("{}", old);
        assert_eq!(text.len(), 26);
        assert_eq!(text.parse::<TestId>().unwrap(), old);
    }
}
