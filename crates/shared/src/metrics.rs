//! Word and token estimates for display.
//!
//! Token counts are a rough `len / 4` heuristic, good enough for a UI badge.
//! Both figures are pure functions of the text: deterministic, non-negative,
//! and non-decreasing in input length.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMetrics {
    pub word_count: u32,
    pub token_count: u32,
}

pub fn estimate(text: &str) -> TextMetrics {
    TextMetrics {
        word_count: text.split_whitespace().count() as u32,
        token_count: (text.len() / 4) as u32,
    }
}
