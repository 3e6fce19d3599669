/// ChatSync - conversation synchronization for a marketplace messenger
///
/// Keeps a conversation list and an open thread in step with a REST
/// messaging backend by polling, aggregates per-counterpart unread counts
/// and drives an unread badge.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod message_store;
pub mod conversation;
pub mod unread;
pub mod scheduler;
pub mod api;
pub mod display;
pub mod validation;
pub mod sync;

pub use error::{Result, SyncError};
pub use config::Config;
pub use sync::{SyncHandle, SyncSnapshot, Synchronizer};
