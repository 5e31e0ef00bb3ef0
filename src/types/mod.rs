//! Shared types
//!
//! Conversation turns and roles used across the session and storage layers.

pub mod message;

pub use message::{Role, Turn, UnknownRole};
