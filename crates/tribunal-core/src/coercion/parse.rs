//! Payload extraction and repair.
//!
//! Turns whatever an evaluator returned into a JSON object with the canonical
//! field names. Nothing here decides validity; that is the validator's job.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use super::RawOutput;

lazy_static! {
    /// Fenced ```json block (language tag optional)
    static ref FENCED_JSON: Regex = Regex::new(
        r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```"
    ).unwrap();

    /// `score: 4`, `Score = 4.0`, `"score": "4"`
    static ref SCORE_FIELD: Regex = Regex::new(
        r#"(?i)\bscore\b"?\s*[:=]\s*"?([0-9]+(?:\.[0-9]+)?)"#
    ).unwrap();

    /// `4/5`, `4 / 5`
    static ref SCORE_FRACTION: Regex = Regex::new(
        r"\b([1-5])\s*/\s*5\b"
    ).unwrap();

    /// `[collector:location]` citations inside prose
    static ref BRACKET_CITATION: Regex = Regex::new(
        r"\[([A-Za-z0-9_.-]+:[^\]\s]+)\]"
    ).unwrap();
}

const RATIONALE_ALIASES: [&str; 3] = ["rationale", "argument", "reasoning"];
const CITATION_ALIASES: [&str; 3] = ["cited_evidence", "evidence", "citations"];

/// Extract a candidate payload object from raw output.
///
/// Order: structured value, fenced JSON block, outermost braces, free text.
pub fn extract_payload(raw: &RawOutput) -> Option<Value> {
    match raw {
        RawOutput::Structured(Value::String(text)) => extract_from_text(text),
        RawOutput::Structured(value) => Some(value.clone()),
        RawOutput::Text(text) => extract_from_text(text),
    }
}

fn extract_from_text(text: &str) -> Option<Value> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(value);
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(value);
            }
        }
    }

    free_text_payload(text)
}

/// Last resort: read a score out of prose and keep the prose as rationale.
fn free_text_payload(text: &str) -> Option<Value> {
    let score = SCORE_FIELD
        .captures(text)
        .or_else(|| SCORE_FRACTION.captures(text))
        .map(|caps| caps[1].to_string())?;

    let citations: Vec<Value> = BRACKET_CITATION
        .captures_iter(text)
        .map(|caps| Value::String(caps[1].to_string()))
        .collect();

    let mut payload = Map::new();
    payload.insert("score".into(), Value::String(score));
    payload.insert("rationale".into(), Value::String(text.trim().to_string()));
    payload.insert("cited_evidence".into(), Value::Array(citations));
    Some(Value::Object(payload))
}

/// Repair near-schema values in place.
///
/// Non-objects are returned untouched so schema validation reports them.
pub fn normalize(value: Value) -> Value {
    let Value::Object(mut fields) = value else {
        return value;
    };

    if let Some(rationale) = take_first(&mut fields, &RATIONALE_ALIASES) {
        fields.insert("rationale".into(), rationale);
    }

    let citations = take_first(&mut fields, &CITATION_ALIASES).unwrap_or(Value::Null);
    fields.insert("cited_evidence".into(), repair_citations(citations));

    if let Some(score) = fields.remove("score") {
        fields.insert("score".into(), repair_score(score));
    }

    if let Some(criterion) = fields.remove("criterion") {
        fields.entry("criterion_id").or_insert(criterion);
    }

    Value::Object(fields)
}

fn take_first(fields: &mut Map<String, Value>, names: &[&str]) -> Option<Value> {
    let mut found = None;
    for name in names {
        if let Some(value) = fields.remove(*name) {
            if found.is_none() && !value.is_null() {
                found = Some(value);
            }
        }
    }
    found
}

fn repair_score(score: Value) -> Value {
    match &score {
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) if n.fract() == 0.0 => Value::from(n as i64),
            _ => score,
        },
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => Value::from(f as i64),
            _ => score,
        },
        _ => score,
    }
}

fn repair_citations(citations: Value) -> Value {
    match citations {
        Value::Null => Value::Array(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Value::Array(Vec::new()),
        Value::String(s) => Value::Array(vec![Value::String(s)]),
        other => other,
    }
}
