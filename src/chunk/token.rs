use super::{ChunkParams, ChunkStrategy, Token, TokenRange};

/// Fixed-size token windows. Each window after the first starts
/// `overlap_tokens` before the end of the previous one.
pub struct TokenChunker;

impl TokenChunker {
    pub(crate) fn windows(window: TokenRange, params: &ChunkParams) -> Vec<TokenRange> {
        let max = params.max_tokens.max(1);
        if window.len() <= max {
            return vec![window];
        }

        let overlap = params.effective_overlap();
        let mut ranges = Vec::new();
        let mut start = window.start;
        loop {
            let end = (start + max).min(window.end);
            ranges.push(TokenRange::new(start, end));
            if end == window.end {
                break;
            }
            start = end - overlap;
        }
        ranges
    }
}

impl ChunkStrategy for TokenChunker {
    fn name(&self) -> &'static str {
        "token"
    }

    fn split(
        &self,
        _text: &str,
        _tokens: &[Token],
        window: TokenRange,
        params: &ChunkParams,
    ) -> Vec<TokenRange> {
        Self::windows(window, params)
    }
}
