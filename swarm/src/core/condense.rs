//! Bounding of long text (test output, prompt sections) without splitting UTF-8.

/// Text reduced to a byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condensed {
    pub text: String,
    /// Bytes removed from the middle of the input.
    pub elided_bytes: usize,
}

/// Keep the head and the tail of `text` within `limit` bytes.
///
/// Test runners print failures early and summaries last, so both ends are
/// kept and the middle is replaced by a marker. The marker itself is not
/// counted against `limit`.
pub fn condense_output(text: &str, limit: usize) -> Condensed {
    if text.len() <= limit {
        return Condensed {
            text: text.to_string(),
            elided_bytes: 0,
        };
    }
    let head_len = limit / 2;
    let tail_len = limit - head_len;
    let head = prefix_within(text, head_len);
    let tail = suffix_within(text, tail_len);
    let elided_bytes = text.len() - head.len() - tail.len();
    Condensed {
        text: format!("{head}\n[... {elided_bytes} bytes elided ...]\n{tail}"),
        elided_bytes,
    }
}

/// Longest prefix of `text` that fits in `max` bytes on a char boundary.
pub fn prefix_within(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Longest suffix of `text` that fits in `max` bytes on a char boundary.
pub fn suffix_within(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
