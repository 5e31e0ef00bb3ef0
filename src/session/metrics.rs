//! Response generation metrics

use std::time::Duration;

/// Token count and decode time for the current (or last) response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationMetrics {
    tokens_generated: u64,
    elapsed_micros: u64,
}

impl GenerationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one generated token that took `elapsed` to produce
    pub fn record(&mut self, elapsed: Duration) {
        self.tokens_generated += 1;
        self.elapsed_micros = self
            .elapsed_micros
            .saturating_add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn tokens_generated(&self) -> u64 {
        self.tokens_generated
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.elapsed_micros
    }

    /// Tokens per second. Zero when no time has been recorded.
    pub fn throughput(&self) -> f32 {
        if self.elapsed_micros == 0 {
            return 0.0;
        }
        (self.tokens_generated as f64 / (self.elapsed_micros as f64 / 1_000_000.0)) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_arithmetic() {
        let metrics = GenerationMetrics {
            tokens_generated: 10,
            elapsed_micros: 2_000_000,
        };
        assert!((metrics.throughput() - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_zero_elapsed_is_zero_throughput() {
        let metrics = GenerationMetrics {
            tokens_generated: 3,
            elapsed_micros: 0,
        };
        assert_eq!(metrics.throughput(), 0.0);
        assert_eq!(GenerationMetrics::new().throughput(), 0.0);
    }

    #[test]
    fn test_record_and_reset() {
        let mut metrics = GenerationMetrics::new();
        metrics.record(Duration::from_millis(250));
        metrics.record(Duration::from_millis(250));

        assert_eq!(metrics.tokens_generated(), 2);
        assert_eq!(metrics.elapsed_micros(), 500_000);
        assert!((metrics.throughput() - 4.0).abs() < 1e-4);

        metrics.reset();
        assert_eq!(metrics, GenerationMetrics::default());
    }
}
