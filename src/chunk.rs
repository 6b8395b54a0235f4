//! Token-bounded text chunking.
//!
//! Normalized document text is split into [`TextChunk`]s no larger than
//! `max_tokens` (except for a single indivisible unit, which is kept whole).
//! Three interchangeable strategies implement [`ChunkStrategy`]:
//!
//! | Strategy | Unit | Notes |
//! |----------|------|-------|
//! | [`ChunkingStrategy::Token`] | token | fixed windows with overlap |
//! | [`ChunkingStrategy::Sentence`] | sentence | falls back to token windows when no boundary exists |
//! | [`ChunkingStrategy::Paragraph`] | blank-line block | oversized paragraphs go through the sentence strategy |
//!
//! Every strategy works on token ranges, so each chunk is a contiguous slice
//! of the input and never splits a word. After splitting, chunks shorter than
//! `min_tokens` are folded into a neighbour so that no text is dropped.

mod paragraph;
mod sentence;
mod token;
pub mod tokenizer;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::config::ChunkingConfig;

pub use paragraph::ParagraphChunker;
pub use sentence::SentenceChunker;
pub use token::TokenChunker;
pub use tokenizer::{count_tokens, tokenize, Token, TokenRange};

/// Size limits shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
}

impl ChunkParams {
    /// Overlap clamped so that every window advances by at least one token.
    pub fn effective_overlap(&self) -> usize {
        self.overlap_tokens.min(self.max_tokens.saturating_sub(1))
    }
}

impl From<&ChunkingConfig> for ChunkParams {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            overlap_tokens: config.overlap_tokens,
            min_tokens: config.min_tokens,
        }
    }
}

/// A single chunk of normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    /// Byte offset of the first character in the source text.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkingResult {
    pub chunks: Vec<TextChunk>,
    pub total_tokens: usize,
    pub avg_tokens_per_chunk: f64,
    /// Tokens shared between consecutive chunks, summed.
    pub overlap_tokens: usize,
}

/// A way of cutting a token window into chunk-sized ranges.
///
/// Implementations return ranges that are non-empty, ascending, and leave no
/// token of `window` uncovered. Consecutive ranges may overlap.
pub trait ChunkStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn split(
        &self,
        text: &str,
        tokens: &[Token],
        window: TokenRange,
        params: &ChunkParams,
    ) -> Vec<TokenRange>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    Token,
    #[default]
    Sentence,
    Paragraph,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStrategy::Token => "token",
            ChunkingStrategy::Sentence => "sentence",
            ChunkingStrategy::Paragraph => "paragraph",
        }
    }

    pub fn strategy(&self) -> &'static dyn ChunkStrategy {
        match self {
            ChunkingStrategy::Token => &TokenChunker,
            ChunkingStrategy::Sentence => &SentenceChunker,
            ChunkingStrategy::Paragraph => &ParagraphChunker,
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Ok(ChunkingStrategy::Token),
            "sentence" => Ok(ChunkingStrategy::Sentence),
            "paragraph" => Ok(ChunkingStrategy::Paragraph),
            other => anyhow::bail!(
                "Unknown chunking strategy: '{}'. Must be token, sentence, or paragraph.",
                other
            ),
        }
    }
}

/// Chunk `text` with the selected strategy.
pub fn chunk_text(text: &str, strategy: ChunkingStrategy, params: &ChunkParams) -> ChunkingResult {
    chunk_with(text, strategy.strategy(), params)
}

pub fn chunk_with(text: &str, strategy: &dyn ChunkStrategy, params: &ChunkParams) -> ChunkingResult {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return ChunkingResult::default();
    }

    let all = TokenRange::new(0, tokens.len());
    let ranges = if all.len() < params.min_tokens.max(1) {
        vec![all]
    } else {
        strategy.split(text, &tokens, all, params)
    };
    let ranges = merge_small(ranges, params.min_tokens);

    let overlap_tokens = ranges
        .windows(2)
        .map(|pair| pair[0].end.saturating_sub(pair[1].start))
        .sum();

    let chunks: Vec<TextChunk> = ranges
        .iter()
        .enumerate()
        .map(|(ordinal, range)| make_chunk(text, &tokens, ordinal, *range))
        .collect();

    let total_tokens: usize = chunks.iter().map(|c| c.token_count).sum();
    let avg_tokens_per_chunk = if chunks.is_empty() {
        0.0
    } else {
        total_tokens as f64 / chunks.len() as f64
    };

    ChunkingResult {
        chunks,
        total_tokens,
        avg_tokens_per_chunk,
        overlap_tokens,
    }
}

/// Fold ranges below `min_tokens` into the preceding range, or into the
/// following one when the short range comes first.
fn merge_small(ranges: Vec<TokenRange>, min_tokens: usize) -> Vec<TokenRange> {
    let mut merged: Vec<TokenRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.len() < min_tokens => {
                prev.end = prev.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }

    if merged.len() >= 2 && merged[0].len() < min_tokens {
        let first = merged.remove(0);
        merged[0].start = first.start;
    }

    merged
}

fn make_chunk(text: &str, tokens: &[Token], ordinal: usize, range: TokenRange) -> TextChunk {
    let (start, end) = range.byte_span(tokens);
    let slice = &text[start..end];

    TextChunk {
        ordinal,
        text: slice.to_string(),
        token_count: range.len(),
        start,
        end,
        hash: sha256_hex(slice),
    }
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Greedy unit packer shared by the sentence and paragraph strategies.
///
/// Units are appended to the open chunk while it stays within `max_tokens`.
/// When a unit does not fit, the open chunk is closed and the next one is
/// seeded with up to `overlap_tokens` from its tail, reduced so the seed plus
/// the incoming unit still fits. A unit larger than `max_tokens` becomes a
/// chunk of its own.
pub(crate) struct Packer {
    max_tokens: usize,
    overlap_tokens: usize,
    open: Option<TokenRange>,
    /// Last chunk closed by [`Packer::extend_closed`]; seeds the next unit.
    closed_tail: Option<TokenRange>,
    out: Vec<TokenRange>,
}

impl Packer {
    pub(crate) fn new(params: &ChunkParams) -> Self {
        Self {
            max_tokens: params.max_tokens,
            overlap_tokens: params.effective_overlap(),
            open: None,
            closed_tail: None,
            out: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, unit: TokenRange) {
        self.open = Some(match self.open.take() {
            None => match self.closed_tail.take() {
                Some(prev) => self.seeded(prev, unit),
                None => unit,
            },
            Some(open) if open.len() + unit.len() <= self.max_tokens => {
                TokenRange::new(open.start, unit.end)
            }
            Some(open) => {
                self.out.push(open);
                self.seeded(open, unit)
            }
        });
    }

    fn seeded(&self, prev: TokenRange, unit: TokenRange) -> TokenRange {
        let room = self.max_tokens.saturating_sub(unit.len());
        let seed = self.overlap_tokens.min(room).min(prev.len());
        TokenRange::new(prev.end - seed, unit.end)
    }

    /// Close the open chunk without seeding an overlap.
    pub(crate) fn flush(&mut self) {
        if let Some(open) = self.open.take() {
            self.out.push(open);
        }
    }

    /// Emit already-split chunks as they are. The next pushed unit is seeded
    /// from the tail of the last of them.
    pub(crate) fn extend_closed(&mut self, ranges: impl IntoIterator<Item = TokenRange>) {
        self.flush();
        let before = self.out.len();
        self.out.extend(ranges);
        if self.out.len() > before {
            self.closed_tail = self.out.last().copied();
        }
    }

    pub(crate) fn finish(mut self) -> Vec<TokenRange> {
        self.flush();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max: usize, overlap: usize, min: usize) -> ChunkParams {
        ChunkParams {
            max_tokens: max,
            overlap_tokens: overlap,
            min_tokens: min,
        }
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for p in 0..6 {
            for s in 0..5 {
                text.push_str(&format!(
                    "Paragraph {} sentence {} talks about ingestion pipelines and chunking. ",
                    p, s
                ));
            }
            text.push_str("\n\n");
        }
        text
    }

    /// Every token of the input must fall inside some chunk, and chunks must
    /// be contiguous or overlapping.
    fn assert_covers(text: &str, result: &ChunkingResult) {
        let tokens = tokenize(text);
        let first = tokens.first().unwrap().start;
        let last = tokens.last().unwrap().end;
        assert_eq!(result.chunks.first().unwrap().start, first);
        assert_eq!(result.chunks.last().unwrap().end, last);
        for pair in result.chunks.windows(2) {
            let gap_start = pair[0].end;
            let gap_end = pair[1].start;
            if gap_end > gap_start {
                assert!(
                    text[gap_start..gap_end].trim().is_empty(),
                    "gap between chunks contains text: {:?}",
                    &text[gap_start..gap_end]
                );
            }
        }
        for chunk in &result.chunks {
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        for strategy in [
            ChunkingStrategy::Token,
            ChunkingStrategy::Sentence,
            ChunkingStrategy::Paragraph,
        ] {
            let result = chunk_text("   \n\n\t ", strategy, &params(10, 2, 1));
            assert!(result.chunks.is_empty());
            assert_eq!(result.total_tokens, 0);
            assert_eq!(result.avg_tokens_per_chunk, 0.0);
        }
    }

    #[test]
    fn test_short_text_single_chunk() {
        let result = chunk_text("Hello, world!", ChunkingStrategy::Sentence, &params(512, 50, 50));
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].text, "Hello, world!");
        assert_eq!(result.chunks[0].ordinal, 0);
        assert_eq!(result.chunks[0].token_count, 4);
    }

    #[test]
    fn test_all_strategies_cover_text() {
        let text = sample_text();
        for strategy in [
            ChunkingStrategy::Token,
            ChunkingStrategy::Sentence,
            ChunkingStrategy::Paragraph,
        ] {
            let result = chunk_text(&text, strategy, &params(40, 8, 10));
            assert!(result.chunks.len() > 1, "{} produced one chunk", strategy);
            assert_covers(&text, &result);
            for (i, c) in result.chunks.iter().enumerate() {
                assert_eq!(c.ordinal, i);
            }
        }
    }

    #[test]
    fn test_min_tokens_respected() {
        let text = sample_text();
        for strategy in [
            ChunkingStrategy::Token,
            ChunkingStrategy::Sentence,
            ChunkingStrategy::Paragraph,
        ] {
            let result = chunk_text(&text, strategy, &params(40, 8, 15));
            for chunk in &result.chunks {
                assert!(
                    chunk.token_count >= 15,
                    "{}: chunk {} has {} tokens",
                    strategy,
                    chunk.ordinal,
                    chunk.token_count
                );
            }
        }
    }

    #[test]
    fn test_text_below_min_is_one_chunk() {
        let result = chunk_text("Tiny. Text. Here.", ChunkingStrategy::Token, &params(2, 0, 50));
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].text, "Tiny. Text. Here.");
    }

    #[test]
    fn test_merge_small_folds_into_neighbours() {
        let ranges = vec![
            TokenRange::new(0, 2),
            TokenRange::new(2, 10),
            TokenRange::new(10, 11),
            TokenRange::new(11, 20),
        ];
        let merged = merge_small(ranges, 5);
        assert_eq!(merged, vec![TokenRange::new(0, 11), TokenRange::new(11, 20)]);
    }

    #[test]
    fn test_hash_is_sha256_of_text() {
        let result = chunk_text("Hello, world!", ChunkingStrategy::Token, &params(10, 0, 1));
        assert_eq!(result.chunks[0].hash, sha256_hex("Hello, world!"));
        assert_eq!(result.chunks[0].hash.len(), 64);
    }

    #[test]
    fn test_statistics() {
        let text = sample_text();
        let result = chunk_text(&text, ChunkingStrategy::Token, &params(50, 10, 1));
        let sum: usize = result.chunks.iter().map(|c| c.token_count).sum();
        assert_eq!(result.total_tokens, sum);
        assert!(result.overlap_tokens > 0);
        let avg = sum as f64 / result.chunks.len() as f64;
        assert!((result.avg_tokens_per_chunk - avg).abs() < f64::EPSILON);
    }

    #[test]
    fn test_packer_reseeds_with_overlap() {
        let mut packer = Packer::new(&params(10, 3, 1));
        packer.push(TokenRange::new(0, 6));
        packer.push(TokenRange::new(6, 12));
        packer.push(TokenRange::new(12, 14));
        let out = packer.finish();
        assert_eq!(
            out,
            vec![
                TokenRange::new(0, 6),
                TokenRange::new(3, 12),
                TokenRange::new(9, 14),
            ]
        );
    }

    #[test]
    fn test_packer_seeds_after_closed_ranges() {
        let mut packer = Packer::new(&params(10, 3, 1));
        packer.push(TokenRange::new(0, 2));
        packer.extend_closed([TokenRange::new(2, 10), TokenRange::new(10, 18)]);
        packer.push(TokenRange::new(18, 22));
        packer.push(TokenRange::new(22, 24));
        let out = packer.finish();
        assert_eq!(
            out,
            vec![
                TokenRange::new(0, 2),
                TokenRange::new(2, 10),
                TokenRange::new(10, 18),
                TokenRange::new(15, 24),
            ]
        );
    }

    #[test]
    fn test_packer_keeps_oversized_unit_whole() {
        let mut packer = Packer::new(&params(5, 2, 1));
        packer.push(TokenRange::new(0, 3));
        packer.push(TokenRange::new(3, 12));
        packer.push(TokenRange::new(12, 14));
        let out = packer.finish();
        assert_eq!(
            out,
            vec![
                TokenRange::new(0, 3),
                TokenRange::new(3, 12),
                TokenRange::new(10, 14),
            ]
        );
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Paragraph".parse::<ChunkingStrategy>().unwrap(), ChunkingStrategy::Paragraph);
        assert!("semantic".parse::<ChunkingStrategy>().is_err());
        assert_eq!(ChunkingStrategy::default(), ChunkingStrategy::Sentence);
    }
}
