//! Markdown normalization applied to raw LLM output before parsing.
//!
//! Models frequently wrap pipe tables in code fences, emit unicode dashes, or
//! indent table rows like code blocks. Downstream parsers and the dashboard
//! renderer expect plain tables, so the raw output is repaired up front.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)\n```").expect("fence regex"));
static PIPE_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|.*\|\s*$").expect("pipe header regex"));
static INDENTED_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]{4,}(\|)").expect("indented row regex"));

fn is_pipe_table_header(line: &str) -> bool {
    PIPE_HEADER_RE.is_match(line)
}

/// Build (or keep) a separator row whose column count matches the header.
fn repair_separator(header: &str, sep: &str) -> String {
    let cols = header
        .split('|')
        .filter(|c| !c.trim().is_empty())
        .count();
    if cols < 2 {
        return sep.to_string();
    }
    let canonical = format!("|{}|", vec!["---"; cols].join("|"));
    let looks_ok = sep.contains('-') && sep.matches('|').count() >= cols - 1;
    if looks_ok {
        sep.to_string()
    } else {
        canonical
    }
}

fn unwrap_fence(caps: &Captures<'_>) -> String {
    let whole = caps.get(0).map_or("", |m| m.as_str());
    let body = caps.get(1).map_or("", |m| m.as_str()).trim();
    let lines: Vec<&str> = body.lines().collect();
    if lines.len() < 2 {
        return whole.to_string();
    }
    let non_empty: Vec<&str> = lines.iter().copied().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.len() < 2 {
        return whole.to_string();
    }
    let header = non_empty[0];
    if !is_pipe_table_header(header) {
        return whole.to_string();
    }

    let mut repaired = Vec::with_capacity(lines.len());
    let mut seen_header = false;
    let mut replaced_sep = false;
    for line in &lines {
        if !seen_header && !line.trim().is_empty() {
            repaired.push((*line).to_string());
            seen_header = true;
            continue;
        }
        if seen_header && !replaced_sep {
            repaired.push(repair_separator(header, line));
            replaced_sep = true;
            continue;
        }
        repaired.push((*line).to_string());
    }
    format!("\n{}\n", repaired.join("\n"))
}

/// Normalize Markdown to improve table rendering.
///
/// - Unwrap code-fenced pipe tables into real tables
/// - Repair/insert separator rows based on header column count
/// - Normalize unicode dashes to hyphens
/// - Dedent lines that look like pipe-table rows but are indented like code
pub(crate) fn normalize_markdown_tables(text: &str) -> String {
    if text.is_empty() {
        return text.to_string();
    }

    let out = text.replace(['–', '—', '−'], "-");
    let out = FENCE_RE.replace_all(&out, |caps: &Captures<'_>| unwrap_fence(caps));
    INDENTED_ROW_RE.replace_all(&out, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_fenced_pipe_table() {
        let input = "Intro\n```\n| A | B |\n| 1 | 2 |\n```\nOutro";
        let out = normalize_markdown_tables(input);
        assert!(!out.contains("```"), "fence should be removed: {out}");
        assert!(out.contains("| A | B |"));
        // A separator row is inserted between header and first data row.
        assert!(out.contains("|---|---|"), "separator missing: {out}");
    }

    #[test]
    fn keeps_valid_separator_row() {
        let input = "```\n| A | B |\n| --- | --- |\n| 1 | 2 |\n```";
        let out = normalize_markdown_tables(input);
        assert!(out.contains("| --- | --- |"));
        assert!(!out.contains("```"));
    }

    #[test]
    fn leaves_non_table_fences_alone() {
        let input = "```rust\nfn main() {}\nlet x = 1;\n```";
        let out = normalize_markdown_tables(input);
        assert!(out.contains("```rust"));
    }

    #[test]
    fn normalizes_unicode_dashes() {
        let out = normalize_markdown_tables("a – b — c − d");
        assert_eq!(out, "a - b - c - d");
    }

    #[test]
    fn dedents_indented_table_rows() {
        let input = "Heading\n    | A | B |\n    | 1 | 2 |";
        let out = normalize_markdown_tables(input);
        assert!(out.contains("\n| A | B |"));
    }

    #[test]
    fn empty_input_is_untouched() {
        assert_eq!(normalize_markdown_tables(""), "");
    }
}
