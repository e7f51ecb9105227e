//! Deterministic text analysis shared by index-time binning and query-time
//! routing. The two sides must run the identical pipeline or tokens will hash
//! into different bins.

use rust_stemmers::{Algorithm, Stemmer};

/// One analyzed term together with the byte span it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub start: usize,
    pub end: usize,
}

/// A deterministic `text -> tokens` function.
pub trait Analyzer {
    fn analyze(&self, text: &str) -> Vec<Token>;
}

// Lucene's classic English stop set.
const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it", "no", "not", "of", "on", "or",
    "such", "that", "the", "their", "then", "there", "these", "they", "this", "to", "was", "will", "with",
];

fn is_stop_word(term: &str) -> bool {
    ENGLISH_STOP_WORDS.contains(&term)
}

/// English analysis pipeline: periods and commas are treated as whitespace,
/// tokens are maximal letter runs (with token-internal apostrophes, so
/// possessives survive tokenization), then possessive-`'s` stripping,
/// lowercasing, stop-word removal, Snowball stemming and a term length
/// filter.
pub struct EnglishAnalyzer {
    stemmer: Stemmer,
    min_term_len: usize,
    max_term_len: usize,
}

impl EnglishAnalyzer {
    pub fn new() -> EnglishAnalyzer {
        EnglishAnalyzer {
            stemmer: Stemmer::create(Algorithm::English),
            min_term_len: 2,
            max_term_len: 40,
        }
    }
}

impl Default for EnglishAnalyzer {
    fn default() -> EnglishAnalyzer {
        EnglishAnalyzer::new()
    }
}

const APOSTROPHES: [char; 2] = ['\'', '\u{2019}'];

#[inline]
fn is_token_char(c: char) -> bool {
    // '.' and ',' are never token chars; everything non-alphabetic splits.
    c.is_alphabetic() || APOSTROPHES.contains(&c)
}

fn strip_possessive(raw: &str) -> &str {
    for apostrophe in APOSTROPHES {
        for s in ['s', 'S'] {
            if let Some(stem) = raw.strip_suffix(s).and_then(|rest| rest.strip_suffix(apostrophe)) {
                if !stem.is_empty() {
                    return stem;
                }
            }
        }
    }
    raw
}

impl Analyzer for EnglishAnalyzer {
    fn analyze(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();

        let mut iter = text.char_indices().peekable();
        while let Some(&(start, c)) = iter.peek() {
            if !is_token_char(c) || APOSTROPHES.contains(&c) {
                iter.next();
                continue;
            }

            let mut end = start;
            while let Some(&(at, c)) = iter.peek() {
                if !is_token_char(c) {
                    break;
                }
                end = at + c.len_utf8();
                iter.next();
            }

            let raw = &text[start..end];
            let raw = raw.trim_matches(|c| APOSTROPHES.contains(&c));
            if raw.is_empty() {
                continue;
            }

            let lowered = strip_possessive(raw).to_lowercase();
            if is_stop_word(&lowered) {
                continue;
            }

            let term = self.stemmer.stem(&lowered).into_owned();
            let term_len = term.chars().count();
            if term_len < self.min_term_len || term_len > self.max_term_len {
                continue;
            }

            tokens.push(Token { term, start, end });
        }

        tokens
    }
}
