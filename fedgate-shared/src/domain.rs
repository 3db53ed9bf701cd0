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

//! # Domains
//!
//! A refined type for the domain portion of a remote actor's address.
//!
//! Domains reach us spelled in any number of ways: `Example.COM`, `example.com`, `bücher.example`,
//! `xn--bcher-kva.example`. Permission decisions are keyed on domain, so two spellings of the same
//! domain must compare equal, or a moderator's block on one spelling would be trivially evaded by
//! the other. [Domain] holds the one canonical spelling: lower case, with internationalized labels
//! IDNA-encoded to their ASCII ("punycode") form. The [url] crate already implements the host
//! parsing rules of the [URL Standard], IDNA processing included, so we lean on [url::Host] for
//! the actual work.
//!
//! [URL Standard]: https://url.spec.whatwg.org/#host-parsing

use std::{fmt::Display, net::Ipv4Addr, ops::Deref, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use url::{Host, Url};

use crate::mk_serde_de_err;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The empty string is not a domain"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("Failed to parse {text} as a domain: {source}"))]
    DomainParse {
        text: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} has an empty label"))]
    EmptyLabel { text: String, backtrace: Backtrace },
    #[snafu(display("{url} has no host component"))]
    NoHost { url: Url, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Domain                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A normalized domain name (or IP literal)
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Normalize `text` to its canonical (lower-case, punycode) form
    pub fn parse(text: &str) -> Result<Domain> {
        ensure!(!text.is_empty(), EmptySnafu);
        match Host::parse(text).context(DomainParseSnafu {
            text: text.to_owned(),
        })? {
            // `evil.example.` & `evil.example` name the same host; keep one key for both
            Host::Domain(domain) => {
                let domain = domain.strip_suffix('.').unwrap_or(domain.as_str());
                ensure!(!domain.is_empty(), EmptySnafu);
                ensure!(
                    !domain.ends_with('.'),
                    EmptyLabelSnafu {
                        text: text.to_owned()
                    }
                );
                Ok(Domain(domain.to_owned()))
            }
            Host::Ipv4(addr) => Ok(Domain(addr.to_string())),
            Host::Ipv6(addr) => Ok(Domain(format!("[{}]", addr))),
        }
    }
    /// Extract the (normalized) host of `url`
    pub fn from_url(url: &Url) -> Result<Domain> {
        Domain::parse(url.host_str().context(NoHostSnafu { url: url.clone() })?)
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    fn is_ip_literal(&self) -> bool {
        self.0.starts_with('[') || self.0.parse::<Ipv4Addr>().is_ok()
    }
    /// Iterate over this domain & each of its parents, most specific first
    ///
    /// `social.example.org` yields `social.example.org`, `example.org` & `org`. IP literals have no
    /// parents & yield only themselves.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        let s = self.0.as_str();
        let ip = self.is_ip_literal();
        std::iter::once(s).chain(
            s.match_indices('.')
                .filter(move |_| !ip)
                .map(move |(i, _)| &s[i + 1..])
                .filter(|t| !t.is_empty()),
        )
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Domain::parse(s)
    }
}

// Implement `Deserialize` by hand so that a `Domain` read from config or storage is always
// normalized
impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Domain::parse(&s).map_err(mk_serde_de_err::<'de, D>)
    }
}
