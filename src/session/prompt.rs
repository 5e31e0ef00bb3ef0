//! Prompt formatting
//!
//! Renders the turn history through the chat template and tracks the
//! watermark separating text the engine has already consumed from text that
//! still needs to be tokenized.

use crate::inference::adapter::EngineAdapter;
use crate::session::SessionError;
use crate::types::Turn;

/// Growable byte buffer the chat template is rendered into.
///
/// `capacity` is the number of bytes a renderer may write; `len` is the size
/// of the last successful rendering.
#[derive(Debug, Clone, Default)]
pub struct RenderBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl RenderBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grows the writable region to at least `capacity` bytes
    pub fn grow_to(&mut self, capacity: usize) {
        if capacity > self.bytes.len() {
            self.bytes.resize(capacity, 0);
        }
    }

    /// Forgets the current rendering without releasing storage
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The rendered bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.bytes.len());
        self.len = len;
    }
}

/// Renders turns through a chat template and extracts per-turn deltas.
#[derive(Debug, Clone)]
pub struct PromptFormatter {
    template: String,
    buffer: RenderBuffer,
    watermark: usize,
}

impl PromptFormatter {
    /// Creates a formatter for `template`.
    ///
    /// Fails with [`SessionError::Configuration`] when the template is empty:
    /// turns are never concatenated raw.
    pub fn new(template: impl Into<String>, initial_capacity: usize) -> Result<Self, SessionError> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(SessionError::Configuration(
                "chat template is empty".to_string(),
            ));
        }
        Ok(Self {
            template,
            buffer: RenderBuffer::with_capacity(initial_capacity),
            watermark: 0,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn buffer(&self) -> &RenderBuffer {
        &self.buffer
    }

    /// Renders `turns` into the buffer and returns the rendered length.
    ///
    /// A buffer that is too small is grown once to the size the renderer
    /// asked for. A second shortfall is a [`SessionError::Template`].
    pub fn render<E: EngineAdapter + ?Sized>(
        &mut self,
        engine: &E,
        turns: &[Turn],
        add_generation_prompt: bool,
    ) -> Result<usize, SessionError> {
        let mut required = engine
            .render_template(
                &self.template,
                turns,
                add_generation_prompt,
                self.buffer.writable(),
            )
            .map_err(|e| SessionError::Template(e.to_string()))?;

        if required > self.buffer.capacity() {
            tracing::debug!(
                "Growing render buffer from {} to {} bytes",
                self.buffer.capacity(),
                required
            );
            self.buffer.grow_to(required);
            required = engine
                .render_template(
                    &self.template,
                    turns,
                    add_generation_prompt,
                    self.buffer.writable(),
                )
                .map_err(|e| SessionError::Template(e.to_string()))?;
            if required > self.buffer.capacity() {
                return Err(SessionError::Template(format!(
                    "renderer needs {} bytes after growing the buffer to {}",
                    required,
                    self.buffer.capacity()
                )));
            }
        }

        self.buffer.set_len(required);
        Ok(required)
    }

    /// Text rendered since the watermark
    pub fn delta(&self) -> Result<&str, SessionError> {
        let rendered = self.buffer.as_bytes();
        let tail = rendered.get(self.watermark..).ok_or_else(|| {
            SessionError::Template(format!(
                "rendered prompt ({} bytes) is shorter than the consumed prefix ({} bytes)",
                rendered.len(),
                self.watermark
            ))
        })?;
        std::str::from_utf8(tail)
            .map_err(|e| SessionError::Template(format!("rendered delta is not UTF-8: {e}")))
    }

    /// Renders `turns` without a generation prompt and moves the watermark
    /// to the end of that rendering.
    pub fn settle<E: EngineAdapter + ?Sized>(
        &mut self,
        engine: &E,
        turns: &[Turn],
    ) -> Result<(), SessionError> {
        self.watermark = self.render(engine, turns, false)?;
        Ok(())
    }

    /// Starts over from an empty rendering
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.watermark = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::StubEngine;

    #[test]
    fn test_empty_template_is_configuration_error() {
        let result = PromptFormatter::new("  ", 16);
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[test]
    fn test_render_is_deterministic() {
        let engine = StubEngine::new(64);
        let turns = vec![Turn::system("sys"), Turn::user("Hi"), Turn::assistant("Yo")];
        let mut formatter = PromptFormatter::new("<{role}>{content}\n", 64).unwrap();

        let first_len = formatter.render(&engine, &turns, true).unwrap();
        let first = formatter.buffer().as_bytes().to_vec();
        let second_len = formatter.render(&engine, &turns, true).unwrap();

        assert_eq!(first_len, second_len);
        assert_eq!(first, formatter.buffer().as_bytes());
        assert_eq!(
            std::str::from_utf8(&first).unwrap(),
            "<system>sys\n<user>Hi\n<assistant>Yo\n"
        );
    }

    #[test]
    fn test_render_grows_buffer_once() {
        let engine = StubEngine::new(64);
        let turns = vec![Turn::user("a fairly long message")];
        let mut formatter = PromptFormatter::new("{content}", 4).unwrap();

        let len = formatter.render(&engine, &turns, false).unwrap();

        assert_eq!(len, "a fairly long message".len());
        assert_eq!(formatter.buffer().capacity(), len);
        assert_eq!(engine.render_calls(), 2);
    }

    #[test]
    fn test_second_shortfall_is_template_error() {
        let engine = StubEngine::new(64).with_growing_template();
        let turns = vec![Turn::user("hello")];
        let mut formatter = PromptFormatter::new("{content}", 1).unwrap();

        let result = formatter.render(&engine, &turns, false);
        assert!(matches!(result, Err(SessionError::Template(_))));
    }

    #[test]
    fn test_renderer_failure_is_template_error() {
        let engine = StubEngine::new(64).with_failing_template();
        let mut formatter = PromptFormatter::new("{content}", 16).unwrap();

        let result = formatter.render(&engine, &[Turn::user("x")], true);
        assert!(matches!(result, Err(SessionError::Template(_))));
    }

    #[test]
    fn test_delta_starts_at_watermark() {
        let engine = StubEngine::new(64);
        let mut formatter = PromptFormatter::new("[{role}]{content}", 8).unwrap();
        let mut turns = vec![Turn::user("one"), Turn::assistant("two")];

        formatter.settle(&engine, &turns).unwrap();
        assert_eq!(formatter.watermark(), "[user]one[assistant]two".len());

        turns.push(Turn::user("three"));
        formatter.render(&engine, &turns, false).unwrap();
        assert_eq!(formatter.delta().unwrap(), "[user]three");

        formatter.reset();
        assert_eq!(formatter.watermark(), 0);
        assert!(formatter.buffer().is_empty());
    }

    #[test]
    fn test_delta_below_watermark_is_template_error() {
        let engine = StubEngine::new(64);
        let mut formatter = PromptFormatter::new("{content}", 8).unwrap();

        formatter.settle(&engine, &[Turn::user("long text")]).unwrap();
        formatter.render(&engine, &[Turn::user("x")], false).unwrap();

        assert!(matches!(formatter.delta(), Err(SessionError::Template(_))));
    }
}
