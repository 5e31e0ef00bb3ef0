//! llama.cpp engine adapter
//!
//! Implements [`EngineAdapter`] over one `llama-cpp-2` context. The adapter
//! borrows the model, so it lives on the worker thread that owns both.

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::adapter::{AdapterError, EngineAdapter, TokenId};
use crate::inference::engine::{EngineError, SamplingParams};
use crate::types::Turn;

/// Context settings for a new adapter
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Threads for generation and prompt processing (`None` = llama.cpp default)
    pub n_threads: Option<i32>,
}

/// [`EngineAdapter`] over a llama.cpp context
pub struct LlamaAdapter<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    /// Tokens decoded into the context so far
    n_past: i32,
    /// Batch index whose logits the sampler reads
    logits_index: i32,
}

impl<'m> LlamaAdapter<'m> {
    /// Creates a context for `model` and a min-p/temperature/dist sampler chain.
    pub fn new(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        settings: &ContextSettings,
        sampling: &SamplingParams,
    ) -> Result<Self, EngineError> {
        let n_ctx = NonZeroU32::new(settings.n_ctx).ok_or_else(|| {
            EngineError::ContextCreate("context size must be greater than zero".to_string())
        })?;

        // One batch can hold the whole window, so any delta that fits the
        // context also fits a single decode.
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(n_ctx.get());
        if let Some(n_threads) = settings.n_threads {
            ctx_params = ctx_params
                .with_n_threads(n_threads)
                .with_n_threads_batch(n_threads);
        }

        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        let seed = if sampling.seed == 0 {
            rand_seed()
        } else {
            sampling.seed
        };
        let sampler = LlamaSampler::chain_simple([
            LlamaSampler::min_p(sampling.min_p, 1),
            LlamaSampler::temp(sampling.temperature),
            LlamaSampler::dist(seed),
        ]);

        tracing::info!(
            "Context created: {} tokens (min_p {}, temperature {})",
            ctx.n_ctx(),
            sampling.min_p,
            sampling.temperature
        );

        Ok(Self {
            model,
            ctx,
            sampler,
            n_past: 0,
            logits_index: -1,
        })
    }
}

impl EngineAdapter for LlamaAdapter<'_> {
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, AdapterError> {
        // str_to_token always parses special tokens
        if !parse_special {
            tracing::debug!("Special tokens are always parsed by the llama tokenizer");
        }
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| AdapterError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn render_template(
        &self,
        template: &str,
        turns: &[Turn],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, AdapterError> {
        let template =
            LlamaChatTemplate::new(template).map_err(|e| AdapterError::Template(e.to_string()))?;
        let messages = turns
            .iter()
            .map(|turn| {
                LlamaChatMessage::new(turn.role().as_str().to_string(), turn.content().to_string())
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AdapterError::Template(e.to_string()))?;

        let rendered = self
            .model
            .apply_chat_template(&template, &messages, add_generation_prompt)
            .map_err(|e| AdapterError::Template(e.to_string()))?;

        let bytes = rendered.as_bytes();
        if let Some(dest) = buf.get_mut(..bytes.len()) {
            dest.copy_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), AdapterError> {
        if tokens.is_empty() {
            return Err(AdapterError::Decode("empty batch".to_string()));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken::new(*token), self.n_past + i as i32, &[0], i == last)
                .map_err(|e| AdapterError::Decode(format!("Failed to add token to batch: {e}")))?;
        }

        self.ctx
            .decode(&mut batch)
            .map_err(|e| AdapterError::Decode(e.to_string()))?;

        self.n_past += tokens.len() as i32;
        self.logits_index = batch.n_tokens() - 1;
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        self.sampler.sample(&self.ctx, self.logits_index).0
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, AdapterError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| AdapterError::Detokenize(token, e.to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn context_cells_used(&self) -> u32 {
        self.n_past.max(0) as u32
    }

    fn context_window_size(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn clear_context(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
        self.logits_index = -1;
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
