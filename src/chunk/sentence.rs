use regex::Regex;
use std::sync::LazyLock;

use super::tokenizer::group_tokens;
use super::{ChunkParams, ChunkStrategy, Packer, Token, TokenChunker, TokenRange};

/// Sentences shorter than this (in characters) are merged with a neighbour.
const MIN_SENTENCE_CHARS: usize = 20;

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?]+(?:\s+|$)|[。！？]+\s*|\.{3,}\s*").expect("valid regex")
});

/// Packs whole sentences into chunks.
pub struct SentenceChunker;

impl SentenceChunker {
    /// Sentence token ranges inside `window`, or `None` when the window has
    /// no sentence boundary at all.
    pub(crate) fn sentences(
        text: &str,
        tokens: &[Token],
        window: TokenRange,
    ) -> Option<Vec<TokenRange>> {
        if window.is_empty() {
            return None;
        }
        let (lo, hi) = window.byte_span(tokens);

        let mut bounds = Vec::new();
        let mut last = lo;
        for m in SENTENCE_END.find_iter(&text[lo..hi]) {
            let end = lo + m.end();
            bounds.push((last, end));
            last = end;
        }
        if bounds.is_empty() {
            return None;
        }
        if last < hi {
            bounds.push((last, hi));
        }

        let sentences = group_tokens(tokens, window, &bounds);
        Some(merge_short(text, tokens, sentences))
    }
}

/// The first sentence absorbs its followers while it is short; any later
/// short sentence joins the one before it.
fn merge_short(text: &str, tokens: &[Token], sentences: Vec<TokenRange>) -> Vec<TokenRange> {
    let chars = |r: &TokenRange| r.slice(text, tokens).chars().count();

    let mut iter = sentences.into_iter();
    let Some(mut current) = iter.next() else {
        return Vec::new();
    };

    let mut merged = Vec::new();
    for next in iter {
        if (merged.is_empty() && chars(&current) < MIN_SENTENCE_CHARS)
            || chars(&next) < MIN_SENTENCE_CHARS
        {
            current.end = next.end;
        } else {
            merged.push(current);
            current = next;
        }
    }
    merged.push(current);
    merged
}

impl ChunkStrategy for SentenceChunker {
    fn name(&self) -> &'static str {
        "sentence"
    }

    fn split(
        &self,
        text: &str,
        tokens: &[Token],
        window: TokenRange,
        params: &ChunkParams,
    ) -> Vec<TokenRange> {
        let Some(sentences) = Self::sentences(text, tokens, window) else {
            return TokenChunker::windows(window, params);
        };

        let mut packer = Packer::new(params);
        for sentence in sentences {
            packer.push(sentence);
        }
        packer.finish()
    }
}
