//! LLM inference engine
//!
//! This module handles all interaction with llama-cpp: model validation,
//! the engine adapter the chat session drives, and the host-facing handle.

pub mod adapter;
pub mod engine;
pub mod llama;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use adapter::{AdapterError, EngineAdapter, TokenId};
pub use engine::{EngineError, LlamaEngine, LoadedModelInfo, SamplingParams, SessionParams};
pub use model::{read_gguf_metadata, GgufMetadata, ModelError, GGUF_MAGIC};
pub use streaming::{StepOutput, StreamToken};
