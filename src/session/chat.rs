//! Generation loop
//!
//! [`ChatSession`] drives one conversation through
//! `Idle -> Prompting -> Streaming -> Idle`, feeding only the newly rendered
//! part of the prompt to the engine on each turn and streaming the response
//! back one step at a time.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use crate::inference::adapter::{EngineAdapter, TokenId};
use crate::inference::streaming::StepOutput;
use crate::session::history::TurnHistory;
use crate::session::metrics::GenerationMetrics;
use crate::session::prompt::PromptFormatter;
use crate::session::utf8::Utf8Assembler;
use crate::session::SessionError;
use crate::truncate_str;
use crate::types::{Role, Turn};

/// Lifecycle state of a [`ChatSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Ready for `start` or `add_turn`
    Idle,
    /// Prompt delta tokenized, nothing emitted yet
    Prompting,
    /// At least one text chunk emitted
    Streaming,
    /// Engine released; every operation fails
    Closed,
}

/// Construction options for a [`ChatSession`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Chat template used to render turns. Must not be empty.
    pub chat_template: String,
    /// Keep user and assistant turns between responses
    pub store_history: bool,
}

/// Outcome of [`ChatSession::respond`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSummary {
    /// Full response text
    pub response: String,
    /// False when the caller stopped generation early
    pub completed: bool,
    /// Generation speed in tokens per second
    pub tokens_per_second: f32,
    /// Wall-clock time from `start` to `stop`
    pub elapsed: Duration,
    /// Context cells in use after the response
    pub context_used: u32,
}

/// Per-response generation state
#[derive(Debug, Default)]
struct GenerationCursor {
    pending_tokens: Vec<TokenId>,
    scratch: Utf8Assembler,
    response: String,
}

impl GenerationCursor {
    fn clear(&mut self) {
        self.pending_tokens.clear();
        self.scratch.clear();
        self.response.clear();
    }
}

/// A conversation bound to one engine context.
///
/// Not reentrant: callers serialize `start`, `step`, `stop` and `close`.
pub struct ChatSession<E: EngineAdapter> {
    engine: Option<E>,
    history: TurnHistory,
    formatter: PromptFormatter,
    store_history: bool,
    state: SessionState,
    cursor: GenerationCursor,
    metrics: GenerationMetrics,
    /// A response ended without `stop`; the watermark still predates it
    unsettled: bool,
}

impl<E: EngineAdapter> ChatSession<E> {
    /// Creates an idle session over `engine`.
    ///
    /// Fails with [`SessionError::Configuration`] when the chat template is empty.
    pub fn new(engine: E, options: SessionOptions) -> Result<Self, SessionError> {
        let window = engine.context_window_size() as usize;
        let formatter = PromptFormatter::new(options.chat_template, window)?;

        tracing::info!(
            "Chat session created (context window {}, store history: {})",
            window,
            options.store_history
        );

        Ok(Self {
            engine: Some(engine),
            history: TurnHistory::new(),
            formatter,
            store_history: options.store_history,
            state: SessionState::Idle,
            cursor: GenerationCursor::default(),
            metrics: GenerationMetrics::new(),
            unsettled: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turns(&self) -> &[Turn] {
        self.history.as_slice()
    }

    pub fn metrics(&self) -> GenerationMetrics {
        self.metrics
    }

    pub fn store_history(&self) -> bool {
        self.store_history
    }

    /// The underlying engine, or `None` once closed
    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    /// Appends a turn outside of generation, e.g. a system prompt or a turn
    /// replayed from a saved conversation.
    pub fn add_turn(&mut self, role: Role, content: impl Into<String>) -> Result<(), SessionError> {
        self.expect_idle("add a turn")?;
        // Settle first so the next delta still covers this turn
        if self.unsettled {
            self.settle()?;
        }
        self.history.push(Turn::new(role, content));
        Ok(())
    }

    /// Begins a response to `query`.
    pub fn start(&mut self, query: &str) -> Result<(), SessionError> {
        self.expect_idle("start")?;
        if self.unsettled {
            self.settle()?;
        }

        self.history.push(Turn::user(query));
        let tokens = match self.tokenize_delta(query) {
            Ok(tokens) => tokens,
            Err(e) => {
                // A failed start leaves no trace in the history
                self.history.pop();
                return Err(e);
            }
        };

        self.cursor.clear();
        self.cursor.pending_tokens = tokens;
        self.metrics.reset();
        self.state = SessionState::Prompting;
        Ok(())
    }

    /// Renders the history with a generation prompt and tokenizes the part
    /// past the watermark.
    fn tokenize_delta(&mut self, query: &str) -> Result<Vec<TokenId>, SessionError> {
        let engine = self.engine.as_ref().ok_or(SessionError::Closed)?;
        self.formatter.render(engine, self.history.as_slice(), true)?;
        let delta = self.formatter.delta()?;
        let add_bos = engine.context_cells_used() == 0;
        let tokens = engine
            .tokenize(delta, add_bos, true)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;

        tracing::debug!(
            "Starting completion for {:?}: {} delta bytes, {} tokens (bos: {})",
            truncate_str(query, 48),
            delta.len(),
            tokens.len(),
            add_bos
        );
        Ok(tokens)
    }

    /// Runs one decode/sample step.
    ///
    /// Errors are fatal for the current response: the caller should `stop`
    /// (after [`SessionError::ContextOverflow`]) or `close` (after
    /// [`SessionError::Decode`]). After [`SessionError::Detokenization`]
    /// that token's text is lost but stepping may continue.
    pub fn step(&mut self) -> Result<StepOutput, SessionError> {
        match self.state {
            SessionState::Prompting | SessionState::Streaming => {}
            SessionState::Closed => return Err(SessionError::Closed),
            state => {
                return Err(SessionError::InvalidState {
                    operation: "step",
                    state,
                })
            }
        }
        let engine = self.engine.as_mut().ok_or(SessionError::Closed)?;

        let used = engine.context_cells_used();
        let window = engine.context_window_size();
        let pending = self.cursor.pending_tokens.len();
        if used as usize + pending > window as usize {
            tracing::warn!(
                "Context window exceeded: {} used + {} pending > {}",
                used,
                pending,
                window
            );
            return Err(SessionError::ContextOverflow {
                used,
                pending,
                window,
            });
        }

        let step_started = Instant::now();
        engine
            .decode(&self.cursor.pending_tokens)
            .map_err(|e| SessionError::Decode(e.to_string()))?;

        let token = engine.sample();
        if engine.is_end_of_generation(token) {
            tracing::debug!(
                "End of generation after {} tokens",
                self.metrics.tokens_generated()
            );
            if !self.cursor.scratch.is_empty() {
                tracing::debug!(
                    "Dropping {} bytes of an unfinished character",
                    self.cursor.scratch.pending().len()
                );
            }
            if self.store_history {
                let response = std::mem::take(&mut self.cursor.response);
                self.history.push(Turn::assistant(response));
            }
            self.cursor.clear();
            self.unsettled = true;
            self.state = SessionState::Idle;
            return Ok(StepOutput::EndOfGeneration);
        }

        // The batch is resident now; only the sampled token is pending.
        self.cursor.pending_tokens.clear();
        self.cursor.pending_tokens.push(token);
        self.metrics.record(step_started.elapsed());

        let piece = engine
            .detokenize(token)
            .map_err(|e| SessionError::Detokenization(e.to_string()))?;

        match self.cursor.scratch.push(&piece) {
            Some(text) => {
                self.cursor.response.push_str(&text);
                self.state = SessionState::Streaming;
                Ok(StepOutput::Text(text))
            }
            None => Ok(StepOutput::Empty),
        }
    }

    /// Ends the current response, keeping any partial text as an assistant
    /// turn when history is stored, and prepares the prompt for the next turn.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        let was_generating = self.state != SessionState::Idle;
        if self.store_history && !self.cursor.response.is_empty() {
            let response = std::mem::take(&mut self.cursor.response);
            self.history.push(Turn::assistant(response));
        }
        self.cursor.clear();
        self.state = SessionState::Idle;

        if was_generating || self.unsettled {
            self.settle()?;
        }
        Ok(())
    }

    /// Releases the engine. Every later call fails with [`SessionError::Closed`].
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.engine = None;
        self.cursor.clear();
        self.state = SessionState::Closed;
        tracing::info!("Chat session closed");
        Ok(())
    }

    /// Tokens per second of the current or last response
    pub fn throughput(&self) -> Result<f32, SessionError> {
        self.expect_open()?;
        Ok(self.metrics.throughput())
    }

    /// Context cells currently resident in the engine
    pub fn context_used(&self) -> Result<u32, SessionError> {
        let engine = self.engine.as_ref().ok_or(SessionError::Closed)?;
        Ok(engine.context_cells_used())
    }

    /// Runs a full response: `start`, `step` until the end of generation,
    /// then `stop`.
    ///
    /// `on_chunk` sees every text chunk and may break to stop early. The
    /// session is stopped even when a step fails; the step error wins.
    pub fn respond<F>(&mut self, query: &str, mut on_chunk: F) -> Result<ResponseSummary, SessionError>
    where
        F: FnMut(&str) -> ControlFlow<()>,
    {
        let started = Instant::now();
        self.start(query)?;

        let mut response = String::new();
        let outcome = loop {
            match self.step() {
                Ok(StepOutput::Text(text)) => {
                    response.push_str(&text);
                    if on_chunk(&text).is_break() {
                        tracing::debug!("Generation stopped by caller");
                        break Ok(false);
                    }
                }
                Ok(StepOutput::Empty) => {}
                Ok(StepOutput::EndOfGeneration) => break Ok(true),
                Err(e) => break Err(e),
            }
        };

        let stopped = self.stop();
        let completed = outcome?;
        stopped?;

        Ok(ResponseSummary {
            response,
            completed,
            tokens_per_second: self.metrics.throughput(),
            elapsed: started.elapsed(),
            context_used: self.context_used()?,
        })
    }

    /// Brings the watermark up to date with the finished turns.
    ///
    /// Without stored history the conversation turns are dropped and the
    /// engine starts over from an empty context.
    fn settle(&mut self) -> Result<(), SessionError> {
        let engine = self.engine.as_mut().ok_or(SessionError::Closed)?;
        if self.store_history {
            self.formatter.settle(&*engine, self.history.as_slice())?;
        } else {
            let removed = self.history.clear_conversation();
            engine.clear_context();
            self.formatter.reset();
            tracing::debug!("History not stored, dropped {} turns", removed);
        }
        self.unsettled = false;
        Ok(())
    }

    fn expect_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn expect_idle(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Closed => Err(SessionError::Closed),
            state => Err(SessionError::InvalidState { operation, state }),
        }
    }
}
