//! Reflex reflector: keep in-memory caches of cluster resources current by listing each type
//! once and then following its watch stream.
//!
//! Build order is Transport, then [`SchemaResolver`](reflex_schema::SchemaResolver), then
//! [`WatcherRegistry`]; each watcher owns one `ResourceCache` and one background task.

#![forbid(unsafe_code)]

pub mod lines;
pub mod notifier;
pub mod registry;
pub mod watcher;

pub use lines::LineBuffer;
pub use notifier::{ChannelNotifier, Notification, Notifier};
pub use registry::WatcherRegistry;
pub use watcher::{ResourceWatcher, WatcherOptions, WatcherState};
