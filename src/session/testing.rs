//! Scripted engine for session tests

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

use crate::inference::adapter::{AdapterError, EngineAdapter, TokenId};
use crate::types::Turn;

pub const EOG: TokenId = -2;

/// First id handed out to scripted response pieces
const FIRST_PIECE_ID: TokenId = 1_000_000;

/// An [`EngineAdapter`] that replays scripted responses.
///
/// Tokenization maps each character to one token, templates substitute
/// `{role}` and `{content}` once per turn, and decoding only counts cells.
pub struct StubEngine {
    window: u32,
    used: u32,
    script: VecDeque<TokenId>,
    pieces: HashMap<TokenId, Vec<u8>>,
    next_id: TokenId,
    fail_decode: bool,
    template_mode: TemplateMode,
    decode_calls: usize,
    render_calls: Cell<usize>,
    tokenized: RefCell<Vec<String>>,
    bos_requests: RefCell<Vec<bool>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TemplateMode {
    Substitute,
    Growing,
    Failing,
}

impl StubEngine {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            used: 0,
            script: VecDeque::new(),
            pieces: HashMap::new(),
            next_id: FIRST_PIECE_ID,
            fail_decode: false,
            template_mode: TemplateMode::Substitute,
            decode_calls: 0,
            render_calls: Cell::new(0),
            tokenized: RefCell::new(Vec::new()),
            bos_requests: RefCell::new(Vec::new()),
        }
    }

    /// Queues one response made of `pieces`, followed by end of generation
    pub fn respond_with(self, pieces: &[&str]) -> Self {
        let bytes: Vec<&[u8]> = pieces.iter().map(|p| p.as_bytes()).collect();
        self.respond_with_bytes(&bytes)
    }

    pub fn respond_with_bytes(mut self, pieces: &[&[u8]]) -> Self {
        for piece in pieces {
            let id = self.next_id;
            self.next_id += 1;
            self.pieces.insert(id, piece.to_vec());
            self.script.push_back(id);
        }
        self.script.push_back(EOG);
        self
    }

    /// Queues a token that cannot be detokenized
    pub fn with_unreadable_token(mut self) -> Self {
        self.script.push_back(self.next_id);
        self.next_id += 1;
        self
    }

    pub fn with_used_cells(mut self, used: u32) -> Self {
        self.used = used;
        self
    }

    pub fn with_failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    /// Renderer that always asks for one byte more than it is given
    pub fn with_growing_template(mut self) -> Self {
        self.template_mode = TemplateMode::Growing;
        self
    }

    pub fn with_failing_template(mut self) -> Self {
        self.template_mode = TemplateMode::Failing;
        self
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.get()
    }

    /// Every text passed to `tokenize`, in order
    pub fn tokenized(&self) -> Vec<String> {
        self.tokenized.borrow().clone()
    }

    pub fn bos_requests(&self) -> Vec<bool> {
        self.bos_requests.borrow().clone()
    }
}

impl EngineAdapter for StubEngine {
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, AdapterError> {
        self.tokenized.borrow_mut().push(text.to_string());
        self.bos_requests.borrow_mut().push(add_bos);
        Ok(text.chars().map(|c| c as TokenId).collect())
    }

    fn render_template(
        &self,
        template: &str,
        turns: &[Turn],
        _add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, AdapterError> {
        self.render_calls.set(self.render_calls.get() + 1);
        match self.template_mode {
            TemplateMode::Failing => Err(AdapterError::Template("unsupported".to_string())),
            TemplateMode::Growing => Ok(buf.len() + 1),
            TemplateMode::Substitute => {
                let rendered: String = turns
                    .iter()
                    .map(|turn| {
                        template
                            .replace("{role}", turn.role().as_str())
                            .replace("{content}", turn.content())
                    })
                    .collect();
                let bytes = rendered.as_bytes();
                if bytes.len() <= buf.len() {
                    buf[..bytes.len()].copy_from_slice(bytes);
                }
                Ok(bytes.len())
            }
        }
    }

    fn decode(&mut self, batch: &[TokenId]) -> Result<(), AdapterError> {
        if self.fail_decode {
            return Err(AdapterError::Decode("stubbed failure".to_string()));
        }
        self.decode_calls += 1;
        self.used += batch.len() as u32;
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        self.script.pop_front().unwrap_or(EOG)
    }

    fn detokenize(&self, token: TokenId) -> Result<Vec<u8>, AdapterError> {
        self.pieces
            .get(&token)
            .cloned()
            .ok_or_else(|| AdapterError::Detokenize(token, "unknown token".to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn context_cells_used(&self) -> u32 {
        self.used
    }

    fn context_window_size(&self) -> u32 {
        self.window
    }

    fn clear_context(&mut self) {
        self.used = 0;
    }
}
