//! Configuration editor service: a schema/configuration registry, its
//! preprocessing pipeline (subconf enums, device definitions, merge
//! patches), and save/reload coordination over an RPC channel supplied by
//! the caller.
//!
//! The RPC transport, the directory-watcher's OS backend, and the
//! JSON-Schema validator engine are real dependencies, but this crate talks
//! to them only at the seams named in [`watch::WatcherClient`] and
//! [`editor::Editor`] — it never assumes a particular broker or transport.

pub mod command;
pub mod editor;
pub mod enum_loader;
pub mod error;
pub mod loader;
pub mod patch_loader;
pub mod path_utils;
pub mod schema;
pub mod watch;
pub mod worker;

pub use editor::Editor;
pub use error::EditorError;
pub use schema::JSONSchema;
