//! Turns raw model output into a [`ClassificationResult`].
//!
//! Well-formed JSON (optionally wrapped in a markdown fence) is mapped field
//! by field. Anything else goes through a low-confidence keyword heuristic.

use serde_json::{Map, Value};

use super::types::{ClassificationResult, DocumentType};

/// Confidence assigned by the keyword heuristic.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// How far into the response the heuristic looks for a negation.
const NEGATION_WINDOW_CHARS: usize = 100;

/// Parse a model response. Never fails.
pub fn parse_classification(raw: &str) -> ClassificationResult {
    let text = strip_code_fence(raw);

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(data)) => match from_object(data) {
            Some(result) => result,
            None => {
                tracing::warn!("document_type is not a string, using keyword fallback");
                keyword_fallback(text)
            }
        },
        Ok(_) => {
            tracing::warn!("Model response is JSON but not an object, using keyword fallback");
            keyword_fallback(text)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not parse model response as JSON");
            tracing::debug!(response = text, "Unparsed model response");
            keyword_fallback(text)
        }
    }
}

/// Trim, then drop a leading ```` ```json ```` / ```` ``` ```` and a trailing ```` ``` ````.
fn strip_code_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    }
    if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// `None` when `document_type` is present but not a string.
fn from_object(mut data: Map<String, Value>) -> Option<ClassificationResult> {
    let document_type = match data.get("document_type") {
        None | Some(Value::Null) => DocumentType::Unknown,
        Some(Value::String(label)) => DocumentType::from_label(label),
        Some(_) => return None,
    };

    let confidence = match data.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };

    let reasoning = match data.remove("reasoning") {
        Some(Value::String(s)) => s,
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    };

    let metadata = match data.remove("metadata") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    Some(ClassificationResult::new(
        document_type,
        confidence,
        reasoning,
        metadata,
    ))
}

/// Invoice if "invoice" appears anywhere and "not" does not appear in the
/// first hundred characters; otherwise non-invoice.
fn keyword_fallback(text: &str) -> ClassificationResult {
    let lowered = text.to_lowercase();
    let window: String = lowered.chars().take(NEGATION_WINDOW_CHARS).collect();

    if lowered.contains("invoice") && !window.contains("not") {
        ClassificationResult::new(
            DocumentType::Invoice,
            FALLBACK_CONFIDENCE,
            "Detected 'invoice' in response text (parsing failed)",
            Map::new(),
        )
    } else {
        ClassificationResult::new(
            DocumentType::NonInvoice,
            FALLBACK_CONFIDENCE,
            "Could not parse structured response",
            Map::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_json() {
        let result = parse_classification(
            r#"{"document_type":"invoice","confidence":0.9,"reasoning":"x","metadata":{}}"#,
        );
        assert_eq!(result.document_type(), DocumentType::Invoice);
        assert_eq!(result.confidence(), 0.9);
        assert_eq!(result.reasoning(), "x");
        assert!(result.metadata().is_empty());
    }

    #[test]
    fn fenced_json_with_metadata() {
        let raw = "```json\n{\"document_type\": \"NON_INVOICE\", \"confidence\": 0.8, \"reasoning\": \"letter\", \"metadata\": {\"pages\": 2}}\n```";
        let result = parse_classification(raw);
        assert_eq!(result.document_type(), DocumentType::NonInvoice);
        assert_eq!(result.confidence(), 0.8);
        assert_eq!(result.metadata()["pages"], 2);
    }

    #[test]
    fn plain_fence_is_stripped() {
        let raw = "```\n{\"document_type\": \"invoice\", \"confidence\": 0.7}\n```";
        let result = parse_classification(raw);
        assert_eq!(result.document_type(), DocumentType::Invoice);
        assert_eq!(result.reasoning(), "");
    }

    #[test]
    fn fallback_detects_invoice() {
        let result = parse_classification("I think this IS an invoice based on...");
        assert_eq!(result.document_type(), DocumentType::Invoice);
        assert_eq!(result.confidence(), 0.5);
    }

    #[test]
    fn fallback_respects_early_negation() {
        let result = parse_classification("This is definitely not an invoice");
        assert_eq!(result.document_type(), DocumentType::NonInvoice);
        assert_eq!(result.confidence(), 0.5);
    }

    #[test]
    fn negation_beyond_window_is_ignored() {
        let raw = format!("invoice {} not", "x".repeat(120));
        assert_eq!(parse_classification(&raw).document_type(), DocumentType::Invoice);
    }

    #[test]
    fn unrelated_garbage_is_non_invoice() {
        let result = parse_classification("Sorry, I cannot help with that.");
        assert_eq!(result.document_type(), DocumentType::NonInvoice);
        assert_eq!(result.reasoning(), "Could not parse structured response");
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let high = parse_classification(r#"{"document_type":"invoice","confidence":3.5}"#);
        let low = parse_classification(r#"{"document_type":"invoice","confidence":-1}"#);
        assert_eq!(high.confidence(), 1.0);
        assert_eq!(low.confidence(), 0.0);
    }

    #[test]
    fn non_numeric_confidence_defaults_to_zero() {
        let missing = parse_classification(r#"{"document_type":"invoice"}"#);
        let junk = parse_classification(r#"{"document_type":"invoice","confidence":"high"}"#);
        let quoted = parse_classification(r#"{"document_type":"invoice","confidence":"0.75"}"#);
        assert_eq!(missing.confidence(), 0.0);
        assert_eq!(junk.confidence(), 0.0);
        assert_eq!(quoted.confidence(), 0.75);
    }

    #[test]
    fn unrecognised_label_is_unknown_with_zero_confidence() {
        let result = parse_classification(r#"{"document_type":"receipt","confidence":0.9}"#);
        assert_eq!(result.document_type(), DocumentType::Unknown);
        assert_eq!(result.confidence(), 0.0);
    }

    #[test]
    fn non_object_json_uses_fallback() {
        let result = parse_classification(r#"["invoice"]"#);
        assert_eq!(result.document_type(), DocumentType::Invoice);
        assert_eq!(result.confidence(), 0.5);
    }

    #[test]
    fn non_object_metadata_becomes_empty() {
        let result =
            parse_classification(r#"{"document_type":"invoice","confidence":0.6,"metadata":"n/a"}"#);
        assert!(result.metadata().is_empty());
    }
}
