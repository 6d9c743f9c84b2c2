//! Realtime synchronization and unread tracking for chat rooms.
//!
//! The [`engine`] owns every piece of in-memory state and processes one
//! event at a time. Everything else in this crate is either a pure state
//! container it drives ([`feed`], [`presence`], [`unread`]), the durable
//! read watermarks ([`watermark`]), or the boundary to the data service
//! ([`service`], [`local`]).

pub mod clock;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod feed;
pub mod local;
pub mod presence;
pub mod service;
pub mod session;
pub mod unread;
pub mod watermark;

pub use engine::{Engine, EngineHandle, Identity};
pub use error::{Result, SyncError};
