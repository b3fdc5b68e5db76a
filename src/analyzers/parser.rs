//! Response parser capability.
//!
//! `Sections` splits a markdown response into a heading -> body map under a
//! `sections` key, which downstream consumers (the insight aggregator, the
//! dashboard) mine for actionable content. `Plain` performs no structural
//! parsing; the shared insight/concept extraction in the runner still applies.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParserKind {
    Sections,
    Plain,
}

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{2,6})\s+(.+?)\s*$").expect("heading regex"));

impl ParserKind {
    pub(crate) fn parse(self, response: &str) -> Value {
        match self {
            ParserKind::Sections => parse_sections(response),
            ParserKind::Plain => json!({}),
        }
    }
}

/// Split markdown into `{"sections": {heading: body}}` using h2..h6 headings.
/// Repeated headings are concatenated. Responses without headings produce an
/// empty map.
fn parse_sections(response: &str) -> Value {
    let mut sections: Map<String, Value> = Map::new();
    let mut current_heading: Option<String> = None;
    let mut current_body: Vec<&str> = Vec::new();

    let mut flush = |heading: &Option<String>, body: &mut Vec<&str>, sections: &mut Map<String, Value>| {
        if let Some(name) = heading {
            let text = body.join("\n").trim().to_string();
            match sections.get_mut(name) {
                Some(Value::String(existing)) => {
                    existing.push('\n');
                    existing.push_str(&text);
                }
                _ => {
                    sections.insert(name.clone(), Value::String(text));
                }
            }
        }
        body.clear();
    };

    for line in response.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            flush(&current_heading, &mut current_body, &mut sections);
            let name = caps[2].trim().trim_end_matches(':').to_string();
            current_heading = Some(name);
        } else {
            current_body.push(line);
        }
    }
    flush(&current_heading, &mut current_body, &mut sections);

    json!({ "sections": Value::Object(sections) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_parser_maps_headings_to_bodies() {
        let response = "# Title\nintro\n\n## Summary\nThe summary text.\n\n## Action Items:\n- Ship it\n- Owner: Ana";
        let parsed = ParserKind::Sections.parse(response);
        let sections = parsed["sections"].as_object().expect("sections map");

        assert_eq!(sections["Summary"], "The summary text.");
        // Trailing colon is stripped from the key.
        assert!(sections.contains_key("Action Items"));
        assert!(sections["Action Items"]
            .as_str()
            .unwrap()
            .contains("Ship it"));
    }

    #[test]
    fn repeated_headings_are_concatenated() {
        let response = "## Risks\nfirst\n## Risks\nsecond";
        let parsed = ParserKind::Sections.parse(response);
        let risks = parsed["sections"]["Risks"].as_str().unwrap();
        assert!(risks.contains("first"));
        assert!(risks.contains("second"));
    }

    #[test]
    fn heading_free_response_produces_empty_map() {
        let parsed = ParserKind::Sections.parse("just plain prose, no headings");
        assert!(parsed["sections"].as_object().unwrap().is_empty());
    }

    #[test]
    fn plain_parser_returns_empty_object() {
        let parsed = ParserKind::Plain.parse("## Anything\nbody");
        assert!(parsed.as_object().unwrap().is_empty());
    }
}
