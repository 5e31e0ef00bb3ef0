//! Engine adapter
//!
//! The narrow interface a chat session needs from an inference engine.
//! Production sessions use [`crate::inference::llama::LlamaAdapter`]; tests
//! drive the state machine with a scripted engine.

use thiserror::Error;

use crate::types::Turn;

/// Vocabulary token id as reported by the engine
pub type TokenId = i32;

/// Errors reported by an engine adapter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Chat template could not be applied: {0}")]
    Template(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Token {0} could not be converted to text: {1}")]
    Detokenize(TokenId, String),
}

/// Operations a session performs against the underlying engine.
///
/// An adapter owns exactly one engine context. It is never shared between
/// sessions, so every method runs on the session's thread.
pub trait EngineAdapter {
    /// Tokenizes `text`, optionally prepending the beginning-of-sequence
    /// token and parsing special tokens embedded in the text.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, AdapterError>;

    /// Renders `turns` through `template` into `buf`.
    ///
    /// Returns the number of bytes the full rendering needs. When that is
    /// larger than `buf.len()` the contents of `buf` are unspecified and the
    /// caller is expected to grow the buffer and call again.
    fn render_template(
        &self,
        template: &str,
        turns: &[Turn],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, AdapterError>;

    /// Runs one forward pass over `batch`, appending it to the resident context.
    fn decode(&mut self, batch: &[TokenId]) -> Result<(), AdapterError>;

    /// Samples the next token from the logits of the last decode.
    fn sample(&mut self) -> TokenId;

    /// Raw bytes of a token's text piece. May end mid-character.
    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, AdapterError>;

    /// Whether `token` ends generation
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Number of context cells currently holding decoded tokens
    fn context_cells_used(&self) -> u32;

    /// Maximum number of cells the context can hold
    fn context_window_size(&self) -> u32;

    /// Drops all resident context
    fn clear_context(&mut self);
}
