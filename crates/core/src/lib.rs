//! Reflex core types: type identities, watch events, field paths, queries and errors.

#![forbid(unsafe_code)]

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod gvk;
pub mod object;
pub mod path;
pub mod query;

pub use gvk::{GroupVersion, ResourceDescriptor, TypeKey, CORE_GROUP};
pub use object::{ResourceObject, Uid};
pub use path::{canonical_value, FieldPath, PathStep, ABSENT};
pub use query::{intersect_sets, selector_matches, FieldMatches, LabelQuery, ObjectQuery, QueryParams, Selector};

/// Errors surfaced by the reflector crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource type not found: {0}")]
    TypeNotFound(String),
    #[error("group version not found: {0}")]
    GroupVersionNotFound(String),
    #[error("invalid type key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidTypeKey(String),
    #[error("invalid field path `{path}`: {reason}")]
    InvalidFieldPath { path: String, reason: &'static str },
    #[error("unexpected status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("watcher stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Change kinds carried by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Added, EventType::Modified, EventType::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(EventType::Added),
            "MODIFIED" => Ok(EventType::Modified),
            "DELETED" => Ok(EventType::Deleted),
            other => Err(other.to_string()),
        }
    }
}

/// One line of a watch stream. `kind` stays a raw string so unknown types
/// (`ERROR`, `BOOKMARK`, ...) can be reported instead of failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub object: ResourceObject,
}

impl WatchEvent {
    pub fn event_type(&self) -> Option<EventType> {
        self.kind.parse().ok()
    }
}

pub mod prelude {
    pub use super::{
        Error, EventType, FieldPath, GroupVersion, LabelQuery, ObjectQuery, QueryParams, ResourceDescriptor,
        ResourceObject, Result, TypeKey, Uid, WatchEvent,
    };
}
