// src/chunk.rs
//! Token-budgeted text chunking for LLM calls.
//!
//! Token counts are estimated, not tokenized: a CJK character counts as one
//! token, anything else as a quarter token, and the sum is rounded up.
//! Splitting prefers paragraph boundaries, then sentence boundaries, and as
//! a last resort hard-slices at `2 * max_tokens` characters.

const PARAGRAPH_JOIN: &str = "\n\n";

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F      // CJK symbols and punctuation
        | 0x3040..=0x30FF    // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK compatibility ideographs
        | 0xFF00..=0xFFEF    // Half/full-width forms
    )
}

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(c, o), ch| {
        if is_cjk(ch) {
            (c + 1, o)
        } else {
            (c, o + 1)
        }
    });
    cjk + other.div_ceil(4)
}

/// Split `text` into trimmed chunks whose estimate fits `max_tokens`.
///
/// Text already within budget comes back as a single trimmed chunk. Otherwise
/// chunks only exceed the budget when a single sentence had to be hard-sliced,
/// and such slices are at most `2 * max_tokens` characters.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_tokens = max_tokens.max(1);
    if estimate_tokens(text) <= max_tokens {
        return vec![text.trim().to_string()];
    }

    let mut packer = Packer::new(max_tokens, PARAGRAPH_JOIN);
    for para in split_paragraphs(text) {
        if estimate_tokens(para) <= max_tokens {
            packer.add(para);
        } else {
            packer.flush();
            packer.extend(chunk_paragraph(para, max_tokens));
        }
    }
    packer.finish()
}

/// Greedy packing of pieces into chunks joined by `sep`.
struct Packer {
    max_tokens: usize,
    sep: &'static str,
    current: String,
    out: Vec<String>,
}

impl Packer {
    fn new(max_tokens: usize, sep: &'static str) -> Self {
        Self {
            max_tokens,
            sep,
            current: String::new(),
            out: Vec::new(),
        }
    }

    fn add(&mut self, piece: &str) {
        if self.current.trim().is_empty() {
            self.current = piece.to_string();
            return;
        }
        let joined = format!("{}{}{}", self.current, self.sep, piece);
        if estimate_tokens(&joined) <= self.max_tokens {
            self.current = joined;
        } else {
            self.flush();
            self.current = piece.to_string();
        }
    }

    fn extend(&mut self, chunks: Vec<String>) {
        for c in chunks {
            self.push_finished(c);
        }
    }

    fn push_finished(&mut self, chunk: String) {
        let t = chunk.trim();
        if !t.is_empty() {
            self.out.push(t.to_string());
        }
    }

    fn flush(&mut self) {
        let current = std::mem::take(&mut self.current);
        self.push_finished(current);
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.out
    }
}

/// Paragraphs are separated by lines that are empty or whitespace-only.
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0usize;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                out.push(&text[s..last_end]);
            }
        } else {
            if start.is_none() {
                start = Some(line_start);
            }
            last_end = offset;
        }
    }
    if let Some(s) = start {
        out.push(&text[s..last_end]);
    }
    out.into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}

/// Sentences as contiguous slices of `text`: each ends after a run of
/// terminators, and whitespace following it starts the next slice.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !is_terminator(c) {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if is_terminator(next) {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        out.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn chunk_paragraph(para: &str, max_tokens: usize) -> Vec<String> {
    let mut packer = Packer::new(max_tokens, "");
    for sentence in split_sentences(para) {
        if estimate_tokens(sentence) <= max_tokens {
            packer.add(sentence);
            continue;
        }
        packer.flush();
        let rest = hard_slice(sentence, max_tokens, &mut packer);
        if !rest.trim().is_empty() {
            packer.add(rest);
        }
    }
    packer.finish()
}

/// Emit fixed-size character slices until the remainder fits the budget.
fn hard_slice<'a>(sentence: &'a str, max_tokens: usize, packer: &mut Packer) -> &'a str {
    let slice_chars = max_tokens * 2;
    let mut rest = sentence;
    while estimate_tokens(rest) > max_tokens {
        let cut = rest
            .char_indices()
            .nth(slice_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        packer.push_finished(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    rest
}
