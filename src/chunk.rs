//! Sentence-aware text splitter with overlap.
//!
//! Splits a document body into ordered chunks no longer than a character
//! budget, carrying the last `overlap` characters of each chunk into the
//! next one so retrieval does not lose context at chunk seams.
//!
//! Split points are chosen greedily inside the budget window, preferring
//! in order: paragraph break (`\n\n`), line break, sentence terminator
//! followed by whitespace, any whitespace, hard cut.

/// Split `text` into overlapping chunks of at most `chunk_size` characters.
///
/// Empty (or whitespace-only) input yields an empty vector; input that fits
/// the budget yields exactly one chunk. `overlap >= chunk_size` is a
/// programming error — configuration validation rejects it before any text
/// reaches this function.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    assert!(overlap < chunk_size, "overlap must be smaller than chunk_size");

    let mut remaining = text.trim();
    if remaining.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut carry = String::new();

    loop {
        let budget = chunk_size - carry.chars().count();

        let window_end = match byte_index_of_char(remaining, budget) {
            Some(idx) => idx,
            None => {
                // The remainder fits in the current budget.
                let chunk = format!("{carry}{remaining}");
                let chunk = chunk.trim_end();
                if !chunk.is_empty() {
                    chunks.push(chunk.to_string());
                }
                break;
            }
        };

        let split = boundary_split(remaining, window_end);
        let piece = &remaining[..split];
        let chunk = format!("{carry}{piece}").trim_end().to_string();
        carry = tail_chars(&chunk, overlap);
        chunks.push(chunk);

        remaining = remaining[split..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

/// Byte index of the `n`-th character, or `None` if the string has at most
/// `n` characters (i.e. it fits entirely within the budget).
fn byte_index_of_char(s: &str, n: usize) -> Option<usize> {
    s.char_indices().nth(n).map(|(idx, _)| idx)
}

/// Pick the split point inside `text[..window_end]`, searching backwards by
/// boundary priority. Falls back to a hard cut at the window edge.
fn boundary_split(text: &str, window_end: usize) -> usize {
    let window = &text[..window_end];

    if let Some(pos) = window.rfind("\n\n") {
        if pos > 0 {
            return pos + 2;
        }
    }

    if let Some(pos) = window.rfind('\n') {
        if pos > 0 {
            return pos + 1;
        }
    }

    let mut sentence_end = None;
    for (idx, ch) in window.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let after = idx + ch.len_utf8();
            let followed_by_space = text[after..]
                .chars()
                .next()
                .is_some_and(|next| next.is_whitespace());
            if followed_by_space && after < window_end {
                sentence_end = Some(after);
            }
        }
    }
    if let Some(pos) = sentence_end {
        return pos;
    }

    if let Some((idx, ch)) = window
        .char_indices()
        .filter(|(_, ch)| ch.is_whitespace())
        .last()
    {
        if idx > 0 {
            return idx + ch.len_utf8();
        }
    }

    window_end
}

/// Last `n` characters of `s`, or the whole string if shorter.
pub fn tail_chars(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    let start = s
        .char_indices()
        .nth(count - n)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    s[start..].to_string()
}
