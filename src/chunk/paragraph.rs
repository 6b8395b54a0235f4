use regex::Regex;
use std::sync::LazyLock;

use super::tokenizer::group_tokens;
use super::{ChunkParams, ChunkStrategy, Packer, SentenceChunker, Token, TokenRange};

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

/// Packs blank-line separated paragraphs. A paragraph that alone exceeds
/// `max_tokens` is closed off and split with [`SentenceChunker`].
pub struct ParagraphChunker;

impl ParagraphChunker {
    pub(crate) fn paragraphs(text: &str, tokens: &[Token], window: TokenRange) -> Vec<TokenRange> {
        if window.is_empty() {
            return Vec::new();
        }
        let (lo, hi) = window.byte_span(tokens);

        let mut bounds = Vec::new();
        let mut last = lo;
        for m in BLANK_LINE.find_iter(&text[lo..hi]) {
            let end = lo + m.end();
            bounds.push((last, end));
            last = end;
        }
        bounds.push((last, hi));

        group_tokens(tokens, window, &bounds)
    }
}

impl ChunkStrategy for ParagraphChunker {
    fn name(&self) -> &'static str {
        "paragraph"
    }

    fn split(
        &self,
        text: &str,
        tokens: &[Token],
        window: TokenRange,
        params: &ChunkParams,
    ) -> Vec<TokenRange> {
        let mut packer = Packer::new(params);
        for paragraph in Self::paragraphs(text, tokens, window) {
            if paragraph.len() > params.max_tokens {
                let pieces = SentenceChunker.split(text, tokens, paragraph, params);
                packer.extend_closed(pieces);
            } else {
                packer.push(paragraph);
            }
        }
        packer.finish()
    }
}
