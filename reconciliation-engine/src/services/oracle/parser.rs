//! Tolerant parsing of oracle output.
//!
//! Models wrap JSON in prose, code fences, or single quotes, rename keys and
//! emit numeric ids. Parsing proceeds from strict to lenient:
//!
//! 1. the whole text as JSON;
//! 2. the largest balanced `{...}` / `[...]` fragment that has the expected
//!    shape, so an echoed schema example loses to the real answer;
//! 3. the same two steps after swapping single quotes for double quotes.
//!
//! Individual entries that cannot be read are counted and dropped rather
//! than failing the chunk.

use crate::error::ReconError;
use crate::models::Side;
use serde_json::{Map, Value};

const WRAPPER_KEYS: [&str; 4] = ["matches", "results", "classification", "reconciliation"];
const BANK_ID_KEYS: [&str; 5] = [
    "bank_id",
    "bank_record_id",
    "bank_transaction_id",
    "bank_txn_id",
    "bank",
];
const BOOK_ID_KEYS: [&str; 5] = [
    "book_id",
    "book_record_id",
    "book_transaction_id",
    "book_txn_id",
    "book",
];
const RED_ID_KEYS: [&str; 4] = ["id", "record_id", "transaction_id", "txn_id"];

/// A pair the oracle placed in Green or Yellow.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleEntry {
    pub bank_id: String,
    pub book_id: String,
    /// `note` for Green, `adjustment` for Yellow.
    pub text: Option<String>,
}

/// A single record the oracle placed in Red. The side may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRedEntry {
    pub side: Option<Side>,
    pub id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleVerdicts {
    pub green: Vec<OracleEntry>,
    pub yellow: Vec<OracleEntry>,
    pub red: Vec<OracleRedEntry>,
    /// Entries that were present but unreadable.
    pub discarded_entries: usize,
}

impl OracleVerdicts {
    pub fn is_empty(&self) -> bool {
        self.green.is_empty() && self.yellow.is_empty() && self.red.is_empty()
    }
}

pub fn parse_oracle_response(chunk_id: usize, raw: &str) -> Result<OracleVerdicts, ReconError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ReconError::OracleResponseError {
            chunk_id,
            message: "empty response".to_string(),
        });
    }

    if let Some(verdicts) = interpret_text(text) {
        return Ok(verdicts);
    }

    let repaired = text.replace('\'', "\"");
    if let Some(verdicts) = interpret_text(&repaired) {
        tracing::debug!(chunk_id, "Oracle response parsed after quote repair");
        return Ok(verdicts);
    }

    Err(ReconError::OracleResponseError {
        chunk_id,
        message: format!(
            "no green/yellow/red structure found in {} bytes of output",
            raw.len()
        ),
    })
}

fn interpret_text(text: &str) -> Option<OracleVerdicts> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(verdicts) = interpret(&value) {
            return Some(verdicts);
        }
    }

    // Largest span wins; ties keep the earlier fragment.
    json_fragments(text)
        .into_iter()
        .filter_map(|fragment| {
            let value = serde_json::from_str::<Value>(fragment).ok()?;
            interpret(&value).map(|verdicts| (fragment.len(), verdicts))
        })
        .rev()
        .max_by_key(|(len, _)| *len)
        .map(|(_, verdicts)| verdicts)
}

/// Balanced top-level `{...}` and `[...]` spans, skipping brackets inside
/// string literals.
fn json_fragments(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut fragments = Vec::new();
    let mut start = 0;

    while start < bytes.len() {
        let Some(offset) = bytes[start..].iter().position(|&b| b == b'{' || b == b'[') else {
            break;
        };
        let open = start + offset;
        match balanced_end(bytes, open) {
            Some(close) => {
                fragments.push(&text[open..=close]);
                start = close + 1;
            }
            None => start = open + 1,
        }
    }

    fragments
}

fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn interpret(value: &Value) -> Option<OracleVerdicts> {
    match value {
        Value::Object(map) => {
            if has_bucket_keys(map) {
                return Some(read_buckets(map));
            }
            WRAPPER_KEYS
                .iter()
                .find_map(|key| lookup(map, key))
                .and_then(interpret)
        }
        Value::Array(items) => read_status_list(items),
        _ => None,
    }
}

fn has_bucket_keys(map: &Map<String, Value>) -> bool {
    ["green", "yellow", "red"]
        .iter()
        .any(|key| lookup(map, key).is_some())
}

/// Case-insensitive key lookup.
fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn entries(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn read_buckets(map: &Map<String, Value>) -> OracleVerdicts {
    let mut verdicts = OracleVerdicts::default();

    for item in entries(lookup(map, "green")) {
        match read_pair(item, &["note", "notes", "reason", "comment"]) {
            Some(entry) => verdicts.green.push(entry),
            None => verdicts.discarded_entries += 1,
        }
    }
    for item in entries(lookup(map, "yellow")) {
        match read_pair(item, &["adjustment", "adjustments", "note", "reason"]) {
            Some(entry) => verdicts.yellow.push(entry),
            None => verdicts.discarded_entries += 1,
        }
    }
    for item in entries(lookup(map, "red")) {
        match read_red(item) {
            Some(entry) => verdicts.red.push(entry),
            None => verdicts.discarded_entries += 1,
        }
    }

    verdicts
}

/// A flat list of entries each carrying its own `status`.
fn read_status_list(items: &[Value]) -> Option<OracleVerdicts> {
    let mut verdicts = OracleVerdicts::default();
    let mut recognized = false;

    for item in items {
        let status = item
            .as_object()
            .and_then(|obj| {
                ["status", "category", "classification", "bucket"]
                    .iter()
                    .find_map(|key| lookup(obj, key))
            })
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase());

        match status.as_deref() {
            Some("green") => {
                recognized = true;
                match read_pair(item, &["note", "notes", "reason"]) {
                    Some(entry) => verdicts.green.push(entry),
                    None => verdicts.discarded_entries += 1,
                }
            }
            Some("yellow") => {
                recognized = true;
                match read_pair(item, &["adjustment", "note", "reason"]) {
                    Some(entry) => verdicts.yellow.push(entry),
                    None => verdicts.discarded_entries += 1,
                }
            }
            Some("red") => {
                recognized = true;
                match read_red(item) {
                    Some(entry) => verdicts.red.push(entry),
                    None => verdicts.discarded_entries += 1,
                }
            }
            _ => verdicts.discarded_entries += 1,
        }
    }

    recognized.then_some(verdicts)
}

fn read_pair(item: &Value, text_keys: &[&str]) -> Option<OracleEntry> {
    let obj = item.as_object()?;
    Some(OracleEntry {
        bank_id: first_id(obj, &BANK_ID_KEYS)?,
        book_id: first_id(obj, &BOOK_ID_KEYS)?,
        text: first_text(obj, text_keys),
    })
}

fn read_red(item: &Value) -> Option<OracleRedEntry> {
    let reason_keys = ["reason", "note", "explanation"];

    // A bare id string carries no side.
    if let Some(id) = id_string(item) {
        return Some(OracleRedEntry {
            side: None,
            id,
            reason: None,
        });
    }

    let obj = item.as_object()?;
    let reason = first_text(obj, &reason_keys);

    if let Some(id) = first_id(obj, &RED_ID_KEYS) {
        let side = ["side", "source", "type"]
            .iter()
            .find_map(|key| lookup(obj, key))
            .and_then(Value::as_str)
            .and_then(Side::parse_loose);
        return Some(OracleRedEntry { side, id, reason });
    }

    // {"bank_id": "..."} or {"book_id": "..."} on its own.
    match (first_id(obj, &BANK_ID_KEYS), first_id(obj, &BOOK_ID_KEYS)) {
        (Some(id), None) => Some(OracleRedEntry {
            side: Some(Side::Bank),
            id,
            reason,
        }),
        (None, Some(id)) => Some(OracleRedEntry {
            side: Some(Side::Book),
            id,
            reason,
        }),
        _ => None,
    }
}

fn first_id(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| lookup(obj, key))
        .and_then(id_string)
}

/// Ids may come back as strings or bare numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| lookup(obj, key))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Array(parts) => {
                let joined: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
                (!joined.is_empty()).then(|| joined.join("; "))
            }
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json() {
        let raw = r#"{"green":[{"bank_id":"b1","book_id":"k1","note":"exact"}],
                      "yellow":[{"bank_id":"b2","book_id":"k2","adjustment":"fix amount"}],
                      "red":[{"side":"book","id":"k3","reason":"no match"}]}"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green[0].bank_id, "b1");
        assert_eq!(v.green[0].text.as_deref(), Some("exact"));
        assert_eq!(v.yellow[0].text.as_deref(), Some("fix amount"));
        assert_eq!(v.red[0].side, Some(Side::Book));
        assert_eq!(v.discarded_entries, 0);
    }

    #[test]
    fn json_embedded_in_prose_and_fences() {
        let raw = "Sure! Here is the result:\n```json\n{\"green\": [{\"bank_id\": \"b1\", \"book_id\": \"k1\"}], \"yellow\": [], \"red\": []}\n```\nLet me know.";
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green.len(), 1);
    }

    #[test]
    fn single_quotes_are_repaired() {
        let raw = "{'green': [{'bank_id': 'b1', 'book_id': 'k1'}], 'yellow': [], 'red': []}";
        let v = parse_oracle_response(3, raw).unwrap();
        assert_eq!(v.green[0].book_id, "k1");
    }

    #[test]
    fn matches_wrapper_and_numeric_ids() {
        let raw = r#"{"matches": {"Green": [{"bank_transaction_id": 17, "book_record_id": 4}], "red": [{"bank_id": 9}]}}"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green[0].bank_id, "17");
        assert_eq!(v.green[0].book_id, "4");
        assert_eq!(v.red[0].side, Some(Side::Bank));
        assert_eq!(v.red[0].id, "9");
    }

    #[test]
    fn status_list_shape() {
        let raw = r#"[{"status":"green","bank_id":"b1","book_id":"k1"},{"status":"red","id":"k2","side":"ledger"},{"status":"blue"}]"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green.len(), 1);
        assert_eq!(v.red[0].side, Some(Side::Book));
        assert_eq!(v.discarded_entries, 1);
    }

    #[test]
    fn malformed_entries_are_counted() {
        let raw = r#"{"green":[{"bank_id":"b1"}, "junk"], "red":["k7", {"reason":"?"}]}"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert!(v.green.is_empty());
        assert_eq!(v.red.len(), 1);
        assert_eq!(v.red[0].side, None);
        assert_eq!(v.discarded_entries, 3);
    }

    #[test]
    fn garbage_is_an_error() {
        for raw in ["", "I could not reconcile these.", "{\"answer\": 42}", "{unclosed"] {
            assert!(matches!(
                parse_oracle_response(5, raw),
                Err(ReconError::OracleResponseError { chunk_id: 5, .. })
            ));
        }
    }

    #[test]
    fn echoed_schema_loses_to_the_full_answer() {
        let raw = r#"The expected format is {"green":[{"bank_id":"...","book_id":"..."}]}.
            Here is the full answer:
            {"green":[{"bank_id":"b1","book_id":"k1"},{"bank_id":"b2","book_id":"k2"}],
             "yellow":[],
             "red":[{"side":"bank","id":"b3"}]}"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green.len(), 2);
        assert_eq!(v.green[1].book_id, "k2");
        assert_eq!(v.red[0].id, "b3");
    }

    #[test]
    fn equal_fragments_keep_the_first() {
        let raw = r#"{"green":[{"bank_id":"b1","book_id":"k1"}]} or {"green":[{"bank_id":"b2","book_id":"k2"}]}"#;
        let v = parse_oracle_response(0, raw).unwrap();
        assert_eq!(v.green[0].bank_id, "b1");
    }

    #[test]
    fn fragments_skip_brackets_inside_strings() {
        let text = r#"note {"a": "x}y"} tail [1, 2]"#;
        assert_eq!(json_fragments(text), vec![r#"{"a": "x}y"}"#, "[1, 2]"]);
    }
}
