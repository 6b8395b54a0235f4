//! Word-boundary tokenizer.
//!
//! A token is any Unicode word-boundary segment (UAX #29) that is not pure
//! whitespace: words, numbers, and individual punctuation marks. Tokens keep
//! their byte span so a range of tokens maps back to an exact slice of the
//! source text.

use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
}

/// Half-open range of token indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRange {
    pub start: usize,
    pub end: usize,
}

impl TokenRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte span of this range in the source text.
    pub fn byte_span(&self, tokens: &[Token]) -> (usize, usize) {
        (tokens[self.start].start, tokens[self.end - 1].end)
    }

    pub fn slice<'a>(&self, text: &'a str, tokens: &[Token]) -> &'a str {
        let (start, end) = self.byte_span(tokens);
        &text[start..end]
    }
}

pub fn tokenize(text: &str) -> Vec<Token> {
    text.split_word_bound_indices()
        .filter(|(_, segment)| !segment.chars().all(char::is_whitespace))
        .map(|(start, segment)| Token {
            start,
            end: start + segment.len(),
        })
        .collect()
}

pub fn count_tokens(text: &str) -> usize {
    text.split_word_bounds()
        .filter(|segment| !segment.chars().all(char::is_whitespace))
        .count()
}

/// Assign the tokens of `window` to consecutive byte ranges.
///
/// `bounds` must be ascending and cover the window; each token belongs to the
/// first range whose end lies past the token's start. Ranges that receive no
/// tokens are dropped, and any tokens left over join the last range.
pub fn group_tokens(tokens: &[Token], window: TokenRange, bounds: &[(usize, usize)]) -> Vec<TokenRange> {
    let mut groups = Vec::with_capacity(bounds.len());
    let mut idx = window.start;

    for &(_, end) in bounds {
        let first = idx;
        while idx < window.end && tokens[idx].start < end {
            idx += 1;
        }
        if idx > first {
            groups.push(TokenRange::new(first, idx));
        }
    }

    if idx < window.end {
        match groups.last_mut() {
            Some(last) => last.end = window.end,
            None => groups.push(TokenRange::new(idx, window.end)),
        }
    }

    groups
}
