//! Core types shared across the klite workspace.
//!
//! This crate holds the payload codec and the `Message` record type that
//! producers write and consumers read. It has no knowledge of the store or
//! of the dispatcher; those live in their own crates.

pub mod codec;
mod message;

pub use codec::{CodecError, Result};
pub use message::Message;
