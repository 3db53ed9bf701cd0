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

//! # ActivityPub Entities
//!
//! ## Introduction
//!
//! These are the wire-format activities & objects that remote servers deliver to our inboxes. We
//! treat the [JSON-LD] documents as plain JSON & deserialize them directly; ActivityPub
//! implementations in the wild are tolerant of one another's JSON-LD in much the same way.
//!
//! [JSON-LD]: https://www.w3.org/TR/json-ld/
//!
//! ## Leniency
//!
//! Payloads are adversarial. The types here are deliberately loose in places where peers disagree
//! (a property may be a single value or an array; a reference may be an IRI or an inline object)
//! and keep the raw JSON where we need to detect, rather than reject, malformed values (a [Note]
//! whose `id` is not an IRI, say). Interpretation happens in the dispatcher.
//!
//! ## Dispatch
//!
//! Inbound documents are deserialized to [Activity], a closed union keyed on the `type` property.
//! Types we don't handle deserialize to [Activity::Unrecognized] rather than failing, so that the
//! caller can decide what to do with them.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use either::Either;
use lazy_static::lazy_static;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

lazy_static! {
    /// The ActivityStreams "public" collection
    pub static ref PUBLIC: Url = Url::parse("https://www.w3.org/ns/activitystreams#Public").unwrap(/* known good */);
}

/// ActivityStreams types of interest to fedgate
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Serialize)]
pub enum Type {
    Block,
    Create,
    Flag,
    Follow,
    Like,
    Note,
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Type::Block => "Block",
                Type::Create => "Create",
                Type::Flag => "Flag",
                Type::Follow => "Follow",
                Type::Like => "Like",
                Type::Note => "Note",
            }
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Property shapes                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A property that may be given as a single value or as an array
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    // Nb. `Many` must be tried first; when `T` is `Value`, `One` would happily swallow an array.
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            OneOrMany::Many(v) => Either::Left(v.iter()),
            OneOrMany::One(t) => Either::Right(std::iter::once(t)),
        }
    }
    pub fn len(&self) -> usize {
        match self {
            OneOrMany::Many(v) => v.len(),
            OneOrMany::One(_) => 1,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InlineId {
    id: Url,
}

/// A reference to another object: an IRI, an inline object with an `id`, or something else
/// entirely (which we keep, but can't use as a reference)
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Iri(Url),
    InlineId(InlineId),
    Other(Value),
}

impl ObjectRef {
    pub fn id(&self) -> Option<&Url> {
        match self {
            ObjectRef::Iri(url) => Some(url),
            ObjectRef::InlineId(inline) => Some(&inline.id),
            ObjectRef::Other(_) => None,
        }
    }
}

impl From<Url> for ObjectRef {
    fn from(url: Url) -> Self {
        ObjectRef::Iri(url)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Note                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    // Kept raw: an `id` that isn't an IRI is something to be detected, not a parse failure
    id: Option<Value>,
    attributed_to: Option<OneOrMany<ObjectRef>>,
    published: Option<DateTime<Utc>>,
    summary: Option<String>,
    content: Option<String>,
    in_reply_to: Option<Url>,
    url: Option<Value>,
    to: Option<OneOrMany<Url>>,
    cc: Option<OneOrMany<Url>>,
}

impl Note {
    /// This Note's `id`, if it is present & an IRI
    pub fn iri(&self) -> Option<Url> {
        self.id
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok())
    }
    pub fn attributed_to(&self) -> Option<&OneOrMany<ObjectRef>> {
        self.attributed_to.as_ref()
    }
    /// The identifiers of this Note's declared authors, skipping any entry that doesn't name one
    pub fn authors(&self) -> impl Iterator<Item = &Url> {
        self.attributed_to
            .iter()
            .flat_map(|a| a.iter())
            .filter_map(ObjectRef::id)
    }
    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.published
    }
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }
    pub fn in_reply_to(&self) -> Option<&Url> {
        self.in_reply_to.as_ref()
    }
    /// The human-facing URL, when given as a plain string
    pub fn url(&self) -> Option<Url> {
        self.url
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok())
    }
    pub fn to(&self) -> impl Iterator<Item = &Url> {
        self.to.iter().flat_map(|t| t.iter())
    }
    pub fn cc(&self) -> impl Iterator<Item = &Url> {
        self.cc.iter().flat_map(|c| c.iter())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Activities                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Create {
    id: Option<Url>,
    actor: ObjectRef,
    published: Option<DateTime<Utc>>,
    object: Option<OneOrMany<Value>>,
}

impl Create {
    pub fn id(&self) -> Option<&Url> {
        self.id.as_ref()
    }
    pub fn actor(&self) -> Option<&Url> {
        self.actor.id()
    }
    /// The object(s) being created, as raw JSON; `None` if the activity had no `object` at all
    pub fn objects(&self) -> Option<&OneOrMany<Value>> {
        self.object.as_ref()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Follow {
    id: Url,
    actor: ObjectRef,
    object: ObjectRef,
}

impl Follow {
    pub fn new(id: Url, actor: Url, object: Url) -> Follow {
        Follow {
            id,
            actor: actor.into(),
            object: object.into(),
        }
    }
    pub fn id(&self) -> &Url {
        &self.id
    }
    pub fn actor(&self) -> Option<&Url> {
        self.actor.id()
    }
    /// The actor to be followed
    pub fn object(&self) -> Option<&Url> {
        self.object.id()
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Like {
    id: Url,
    actor: ObjectRef,
    object: ObjectRef,
    published: Option<DateTime<Utc>>,
}

impl Like {
    pub fn id(&self) -> &Url {
        &self.id
    }
    pub fn actor(&self) -> Option<&Url> {
        self.actor.id()
    }
    /// The status being liked
    pub fn object(&self) -> Option<&Url> {
        self.object.id()
    }
    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.published
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Block {
    id: Url,
    actor: ObjectRef,
    object: ObjectRef,
}

impl Block {
    pub fn id(&self) -> &Url {
        &self.id
    }
    pub fn actor(&self) -> Option<&Url> {
        self.actor.id()
    }
    /// The actor being blocked
    pub fn object(&self) -> Option<&Url> {
        self.object.id()
    }
}

/// A report
///
/// Mastodon sends the reported account & any reported statuses together in `object`, with the
/// reporter's comment in `content`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Flag {
    id: Url,
    actor: ObjectRef,
    object: OneOrMany<ObjectRef>,
    content: Option<String>,
}

impl Flag {
    pub fn id(&self) -> &Url {
        &self.id
    }
    pub fn actor(&self) -> Option<&Url> {
        self.actor.id()
    }
    pub fn objects(&self) -> impl Iterator<Item = &Url> {
        self.object.iter().filter_map(ObjectRef::id)
    }
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

/// An inbound activity
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Activity {
    Block(Block),
    Create(Create),
    Flag(Flag),
    Follow(Follow),
    Like(Like),
    /// An activity whose `type` we don't handle; carries that type
    Unrecognized(String),
}

impl Activity {
    /// The activity's `type`
    pub fn kind(&self) -> &str {
        match self {
            Activity::Block(_) => "Block",
            Activity::Create(_) => "Create",
            Activity::Flag(_) => "Flag",
            Activity::Follow(_) => "Follow",
            Activity::Like(_) => "Like",
            Activity::Unrecognized(kind) => kind,
        }
    }
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Activity::Unrecognized(_))
    }
    /// The actor claiming to have performed this activity
    pub fn actor(&self) -> Option<&Url> {
        match self {
            Activity::Block(block) => block.actor(),
            Activity::Create(create) => create.actor(),
            Activity::Flag(flag) => flag.actor(),
            Activity::Follow(follow) => follow.actor(),
            Activity::Like(like) => like.actor(),
            Activity::Unrecognized(_) => None,
        }
    }
}

/// Read the `type` property of a JSON object, if it's there & a string
pub fn type_of(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

// Implement `Deserialize` by hand: an internally tagged derive would reject types we don't handle,
// & we'd like to keep those around (as `Unrecognized`) so they can be logged.
impl<'de> Deserialize<'de> for Activity {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let kind = type_of(&value)
            .ok_or_else(|| D::Error::missing_field("type"))?
            .to_owned();
        let activity = match kind.as_str() {
            "Block" => serde_json::from_value(value).map(Activity::Block),
            "Create" => serde_json::from_value(value).map(Activity::Create),
            "Flag" => serde_json::from_value(value).map(Activity::Flag),
            "Follow" => serde_json::from_value(value).map(Activity::Follow),
            "Like" => serde_json::from_value(value).map(Activity::Like),
            _ => Ok(Activity::Unrecognized(kind)),
        };
        activity.map_err(D::Error::custom)
    }
}

/// A wire-format object, as carried on a side-effect message
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum WireObject {
    Block(Block),
    Flag(Flag),
    Follow(Follow),
    Like(Like),
    Note(Note),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_create_note_mastodon() {
        let activity = serde_json::from_str::<Activity>(
            r##"{
  "@context": [
    "https://www.w3.org/ns/activitystreams",
    {
      "ostatus": "http://ostatus.org#",
      "sensitive": "as:sensitive",
      "toot": "http://joinmastodon.org/ns#"
    }
  ],
  "id": "https://remote.example/users/alice/statuses/111/activity",
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "published": "2024-05-01T10:00:00Z",
  "to": ["https://www.w3.org/ns/activitystreams#Public"],
  "cc": ["https://remote.example/users/alice/followers"],
  "object": {
    "id": "https://remote.example/users/alice/statuses/111",
    "type": "Note",
    "summary": null,
    "inReplyTo": null,
    "published": "2024-05-01T10:00:00Z",
    "url": "https://remote.example/@alice/111",
    "attributedTo": "https://remote.example/users/alice",
    "to": ["https://www.w3.org/ns/activitystreams#Public"],
    "cc": ["https://remote.example/users/alice/followers"],
    "sensitive": false,
    "content": "<p>Hello, world</p>",
    "contentMap": {"en": "<p>Hello, world</p>"},
    "attachment": [],
    "tag": []
  }
}"##,
        )
        .unwrap();

        let create = match activity {
            Activity::Create(create) => create,
            _ => panic!("Expected a Create"),
        };
        assert_eq!(
            create.actor().unwrap().as_str(),
            "https://remote.example/users/alice"
        );
        let objects = create.objects().unwrap();
        assert_eq!(objects.len(), 1);
        let note: Note = serde_json::from_value(objects.iter().next().unwrap().clone()).unwrap();
        assert_eq!(
            note.iri().unwrap().as_str(),
            "https://remote.example/users/alice/statuses/111"
        );
        assert_eq!(
            note.authors().map(Url::as_str).collect::<Vec<&str>>(),
            vec!["https://remote.example/users/alice"]
        );
        assert_eq!(note.content(), Some("<p>Hello, world</p>"));
        assert_eq!(note.to().next(), Some(&*PUBLIC));
        assert_eq!(
            note.url().unwrap().as_str(),
            "https://remote.example/@alice/111"
        );
    }

    #[test]
    fn test_create_many_objects() {
        let activity = serde_json::from_str::<Activity>(
            r#"{
  "type": "Create",
  "actor": "https://remote.example/users/alice",
  "object": [
    {"type": "Note", "id": "https://remote.example/notes/1", "attributedTo": ["https://remote.example/users/alice"]},
    {"id": "https://remote.example/things/2"},
    "https://remote.example/things/3"
  ]
}"#,
        )
        .unwrap();
        match activity {
            Activity::Create(create) => {
                let objects = create.objects().unwrap();
                assert_eq!(objects.len(), 3);
                assert_eq!(
                    objects.iter().map(type_of).collect::<Vec<Option<&str>>>(),
                    vec![Some("Note"), None, None]
                );
            }
            _ => panic!("Expected a Create"),
        }
    }

    #[test]
    fn test_odd_notes() {
        // A Note with an inline author, a non-IRI id & no attribution at all
        let note = serde_json::from_str::<Note>(
            r#"{
  "type": "Note",
  "id": {"not": "an iri"},
  "attributedTo": [{"type": "Person", "id": "https://remote.example/users/bob"}, {"name": "??"}]
}"#,
        )
        .unwrap();
        assert!(note.iri().is_none());
        assert_eq!(
            note.authors().map(Url::as_str).collect::<Vec<&str>>(),
            vec!["https://remote.example/users/bob"]
        );

        let note = serde_json::from_str::<Note>(r#"{"type": "Note", "id": "https://a.example/1"}"#)
            .unwrap();
        assert!(note.attributed_to().is_none());
        assert_eq!(note.authors().count(), 0);
    }

    #[test]
    fn test_follow_pleroma() {
        let activity = serde_json::from_str::<Activity>(
            r#"{
  "@context": [
    "https://www.w3.org/ns/activitystreams",
    "https://pleroma.example/schemas/litepub-0.1.jsonld",
    {"@language": "und"}
  ],
  "actor": "https://pleroma.example/users/alice",
  "cc": [],
  "id": "https://pleroma.example/activities/6fd36de4-a6ab-4ba5-ab2d-e8f6b3f5b1c2",
  "object": "https://local.example/users/bob",
  "state": "pending",
  "to": ["https://local.example/users/bob"],
  "type": "Follow"
}"#,
        )
        .unwrap();
        match activity {
            Activity::Follow(follow) => {
                assert_eq!(
                    follow.actor().unwrap().as_str(),
                    "https://pleroma.example/users/alice"
                );
                assert_eq!(
                    follow.object().unwrap().as_str(),
                    "https://local.example/users/bob"
                );
            }
            _ => panic!("Expected a Follow"),
        }
    }

    #[test]
    fn test_flag_mastodon() {
        let activity = serde_json::from_str::<Activity>(
            r#"{
  "@context": "https://www.w3.org/ns/activitystreams",
  "id": "https://remote.example/0f5b4a4e-8b7e-4f0e-9d6e-1d9c9d0a6d1b",
  "type": "Flag",
  "actor": "https://remote.example/actor",
  "content": "Spam",
  "object": [
    "https://local.example/users/bob",
    "https://local.example/users/bob/statuses/1"
  ]
}"#,
        )
        .unwrap();
        match activity {
            Activity::Flag(flag) => {
                assert_eq!(flag.objects().count(), 2);
                assert_eq!(flag.content(), Some("Spam"));
            }
            _ => panic!("Expected a Flag"),
        }
    }

    #[test]
    fn test_unrecognized() {
        let activity = serde_json::from_str::<Activity>(
            r#"{"type": "Announce", "id": "https://remote.example/a/1", "actor": "https://remote.example/users/alice", "object": "https://elsewhere.example/notes/1"}"#,
        )
        .unwrap();
        assert_eq!(activity, Activity::Unrecognized("Announce".to_owned()));
        assert!(!activity.is_recognized());
        assert_eq!(activity.kind(), "Announce");

        assert!(serde_json::from_str::<Activity>(r#"{"id": "https://remote.example/a/1"}"#).is_err());
        // Recognized, but missing a required property
        assert!(serde_json::from_str::<Activity>(
            r#"{"type": "Like", "actor": "https://remote.example/users/alice"}"#
        )
        .is_err());
    }
}
