//! Chat session state machine
//!
//! Turn history, chat-template delta computation and the streaming
//! decode/sample/detokenize loop that sits on top of an [`EngineAdapter`].
//!
//! [`EngineAdapter`]: crate::inference::adapter::EngineAdapter

use thiserror::Error;

pub mod chat;
pub mod history;
pub mod metrics;
pub mod prompt;
pub mod utf8;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{ChatSession, ResponseSummary, SessionOptions, SessionState};
pub use history::TurnHistory;
pub use metrics::GenerationMetrics;
pub use prompt::{PromptFormatter, RenderBuffer};
pub use utf8::Utf8Assembler;

/// Errors raised by session operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    /// Missing chat template or unusable model. Not retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The renderer failed even after one buffer growth.
    #[error("Chat template error: {0}")]
    Template(String),

    /// Resident plus pending tokens would exceed the context window.
    #[error("Context window exceeded: {used} resident + {pending} pending > {window}")]
    ContextOverflow {
        used: u32,
        pending: usize,
        window: u32,
    },

    /// The forward pass failed. Engine context state is undefined afterwards.
    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("Session is closed")]
    Closed,

    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}
