//! JSON Schema contract for the LLM insight extraction pass.
//!
//! The extraction prompt demands a fixed payload shape; the schema below pins
//! that contract and `check_against_schema` enforces it at runtime. A response
//! that fails validation is dropped wholesale rather than partially parsed,
//! so a misbehaving model can never poison the aggregated dashboard.

use jsonschema::validator_for;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// Shape of the `{items: [...]}` payload the insight extraction prompt asks
/// the model to produce.
pub(crate) static INSIGHT_ITEMS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "required": ["items"],
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "summary"],
                    "properties": {
                        "type": { "type": "string", "enum": ["action", "decision", "risk"] },
                        "summary": { "type": "string" },
                        "owner": { "type": ["string", "null"] },
                        "due": { "type": ["string", "null"] },
                        "source": { "type": ["string", "null"] },
                        "evidence": {
                            "type": "object",
                            "properties": {
                                "segment_ids": { "type": "array", "items": { "type": "integer" } },
                                "speakers": { "type": "array", "items": { "type": "string" } },
                                "timestamps": { "type": "array", "items": { "type": "string" } },
                                "quotes": { "type": "array", "items": { "type": "string" } },
                                "confidence": { "type": ["number", "null"] }
                            }
                        }
                    }
                }
            }
        }
    })
});

/// Validate `instance` against `schema`. On failure every validation error
/// message is returned, so callers can log the complete diagnosis instead of
/// just the first mismatch.
pub(crate) fn check_against_schema(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let validator =
        validator_for(schema).map_err(|e| vec![format!("schema did not compile: {e}")])?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
