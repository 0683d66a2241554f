//! Prompt token estimation for pre-flight headroom checks.

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-ratio estimate; close enough for a budget check with a safety margin.
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}

impl CharacterEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: chars_per_token.max(0.1),
        }
    }
}

impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl TokenCounter for CharacterEstimator {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}
