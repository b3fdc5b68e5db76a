//! Character-boundary safe text helpers shared by the context assembler and
//! the summarizer.

/// Take the first `max_chars` characters of `text` (not bytes).
pub(crate) fn take_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Slice `text` by a character range, clamping both ends.
pub(crate) fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    if start >= end {
        return "";
    }
    let begin = match text.char_indices().nth(start) {
        Some((idx, _)) => idx,
        None => return "",
    };
    let finish = match text.char_indices().nth(end) {
        Some((idx, _)) => idx,
        None => text.len(),
    };
    &text[begin..finish]
}

/// Truncate long upstream error bodies before they end up inside error
/// messages or the job record.
pub(crate) fn truncate_error_message(body: &str) -> String {
    const MAX_LEN: usize = 500;
    if body.chars().count() <= MAX_LEN {
        return body.to_string();
    }
    format!("{}... (truncated)", take_chars(body, MAX_LEN))
}
