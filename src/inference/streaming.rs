//! Streaming inference support
//!
//! Output of a single generation step, and the events delivered to a
//! consumer of a streamed response.

use crate::session::ResponseSummary;

/// Result of one generation step.
///
/// End of generation is its own variant, so no text a model produces can be
/// mistaken for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// Newly completed text
    Text(String),
    /// A token was generated but its character is not complete yet
    Empty,
    /// The model finished its response
    EndOfGeneration,
}

impl StepOutput {
    /// Returns true if this step produced text
    pub fn is_text(&self) -> bool {
        matches!(self, StepOutput::Text(_))
    }

    /// Returns true if generation is complete
    pub fn is_end(&self) -> bool {
        matches!(self, StepOutput::EndOfGeneration)
    }

    /// Extracts the text if this is a Text variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StepOutput::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Represents an event emitted while a response is streamed.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A chunk of generated text
    Token(String),
    /// Generation completed or was cancelled
    Done(ResponseSummary),
    /// An error occurred during generation
    Error(String),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamToken::Error(s) => Some(s),
            _ => None,
        }
    }
}
