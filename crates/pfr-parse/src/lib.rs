//! Loose-data parsers for semi-structured profile columns.
//!
//! The diploma/experience columns accumulated years of inconsistent
//! writes: plain JSON arrays, double-encoded JSON strings, delimiter
//! separated free text, and JSON-like text with bare keys or single
//! quotes. These parsers reduce any of those shapes to a clean list,
//! trying the stricter interpretations first and falling back to
//! heuristics. They are total: bad input yields an empty result, never
//! an error.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use pfr_core::RawField;
use regex::Regex;
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pfr-parse";

/// A structured entry such as a diploma `{nom, annee}` record. Values
/// are kept as opaque strings; no numeric coercion.
pub type CleanObject = BTreeMap<String, String>;

static RE_QUOTED_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("static regex"));
static RE_TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("static regex"));
static RE_BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:").expect("static regex"));
static RE_SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'((?:[^'\\]|\\.)*)'").expect("static regex"));

/// Cleans one raw token into display-ready text.
///
/// Strips one surrounding quote pair, undoes the escape sequences the
/// legacy writers left behind as literal two-character text, trims stray
/// quote/bracket residue from both ends, and decodes `\uXXXX` escapes.
/// Unparseable escapes stay as literal text.
pub fn normalize(token: &str) -> String {
    let mut text = token.trim().to_string();

    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            text = text[1..text.len() - 1].to_string();
        }
    }

    text = text
        .replace("\\r", " ")
        .replace("\\n", " ")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\")
        .replace("\\/", "/");
    if text.ends_with('\\') {
        text.pop();
    }

    let trimmed = text
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '[' | ']' | '{' | '}'));
    decode_unicode_escapes(trimmed).trim().to_string()
}

/// Parses a raw field into an ordered, deduplicated list of clean
/// strings. Branches are tried strictest-first; every candidate entry
/// goes through [`normalize`] before dedup.
pub fn parse_list(raw: &RawField) -> Vec<String> {
    let candidates = match raw {
        RawField::Absent => Vec::new(),
        RawField::List(values) => flatten_scalars(values),
        RawField::Text(text) => list_candidates_from_text(text),
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let cleaned = normalize(&candidate);
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.clone()) {
            out.push(cleaned);
        }
    }
    out
}

/// Parses a raw field expected to hold structured entries (diploma or
/// experience records). Applies a staged JSON repair pass before giving
/// up, then falls back to decoding each balanced `{...}` substring on
/// its own. Entries that still fail to decode are dropped.
pub fn parse_object_list(raw: &RawField) -> Vec<CleanObject> {
    match raw {
        RawField::Absent => Vec::new(),
        RawField::List(values) => objects_from_values(values),
        RawField::Text(text) => objects_from_text(text),
    }
}

fn list_candidates_from_text(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Some(values) = decode_json_list(trimmed) {
        return flatten_scalars(&values);
    }

    // Some writers stored escape sequences doubled or left raw control
    // characters inside the string body; soften those and retry.
    let softened = soften_double_escapes(trimmed);
    if let Some(values) = decode_json_list(&softened) {
        return flatten_scalars(&values);
    }

    let quoted = quoted_segments(trimmed);
    if !quoted.is_empty() {
        return quoted;
    }

    split_on_first_delimiter(trimmed)
}

/// Strict JSON decode with one extra decode when the value is itself a
/// JSON-encoded string (double-encoding).
fn decode_json_list(text: &str) -> Option<Vec<JsonValue>> {
    let mut value: JsonValue = serde_json::from_str(text).ok()?;
    if let JsonValue::String(inner) = &value {
        value = serde_json::from_str(inner).ok()?;
    }
    match value {
        JsonValue::Array(values) => Some(values),
        _ => None,
    }
}

/// One level of flattening: a list entry that is itself a list of
/// scalars contributes its members in place.
fn flatten_scalars(values: &[JsonValue]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        match value {
            JsonValue::Array(inner) => out.extend(inner.iter().filter_map(scalar_text)),
            other => out.extend(scalar_text(other)),
        }
    }
    out
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn soften_double_escapes(text: &str) -> String {
    text.replace("\\\\r", "\\r")
        .replace("\\\\n", "\\n")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

fn quoted_segments(text: &str) -> Vec<String> {
    RE_QUOTED_SEGMENT
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// First delimiter kind present wins: newline, then semicolon, then
/// comma. A string with none of them is a single entry.
fn split_on_first_delimiter(text: &str) -> Vec<String> {
    for delimiter in ['\n', ';', ','] {
        if text.contains(delimiter) {
            return text.split(delimiter).map(str::to_string).collect();
        }
    }
    vec![text.to_string()]
}

fn objects_from_values(values: &[JsonValue]) -> Vec<CleanObject> {
    let mut out = Vec::new();
    for value in values {
        match value {
            JsonValue::Object(map) => out.extend(object_from_map(map)),
            JsonValue::String(text) => {
                let Ok(decoded) = serde_json::from_str::<JsonValue>(text) else {
                    continue;
                };
                match decoded {
                    JsonValue::Array(inner) => {
                        out.extend(inner.iter().filter_map(|v| v.as_object()).flat_map(object_from_map))
                    }
                    JsonValue::Object(map) => out.extend(object_from_map(&map)),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    out
}

fn objects_from_text(text: &str) -> Vec<CleanObject> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Some(objects) = decode_object_list(trimmed) {
        return objects;
    }

    // Staged repair, retrying the decode after each stage.
    let mut repaired = trimmed.to_string();
    for stage in [strip_trailing_commas, quote_bare_keys, double_quote_single_quoted] {
        repaired = stage(&repaired);
        if let Some(objects) = decode_object_list(&repaired) {
            return objects;
        }
    }

    balanced_brace_chunks(trimmed)
        .iter()
        .filter_map(|chunk| decode_lone_object(chunk))
        .collect()
}

/// Direct decode of an object list: a JSON array keeps only its mapping
/// entries, a lone mapping is wrapped, and a double-encoded string is
/// decoded once more under the same rule.
fn decode_object_list(text: &str) -> Option<Vec<CleanObject>> {
    let mut value: JsonValue = serde_json::from_str(text).ok()?;
    if let JsonValue::String(inner) = &value {
        value = serde_json::from_str(inner).ok()?;
    }
    match value {
        JsonValue::Array(values) => Some(
            values
                .iter()
                .filter_map(|v| v.as_object())
                .flat_map(object_from_map)
                .collect(),
        ),
        JsonValue::Object(map) => Some(object_from_map(&map).into_iter().collect()),
        _ => None,
    }
}

fn strip_trailing_commas(text: &str) -> String {
    RE_TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

fn quote_bare_keys(text: &str) -> String {
    RE_BARE_KEY.replace_all(text, "${1}\"${2}\":").into_owned()
}

fn double_quote_single_quoted(text: &str) -> String {
    RE_SINGLE_QUOTED
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let inner = caps[1].replace('"', "\\\"").replace("\\'", "'");
            format!("\"{inner}\"")
        })
        .into_owned()
}

/// Extracts every balanced `{...}` substring, tracking quoted spans so
/// braces inside string literals do not skew the depth count.
fn balanced_brace_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(from) = start.take() {
                            chunks.push(text[from..idx + 1].to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    chunks
}

fn decode_lone_object(chunk: &str) -> Option<CleanObject> {
    let repaired = double_quote_single_quoted(&quote_bare_keys(&strip_trailing_commas(chunk)));
    let value: JsonValue = serde_json::from_str(&repaired).ok()?;
    object_from_map(value.as_object()?)
}

/// Converts a decoded mapping into string key/value pairs. Null values
/// and blank entries are dropped; an object left with no entries is
/// dropped entirely.
fn object_from_map(map: &serde_json::Map<String, JsonValue>) -> Option<CleanObject> {
    let mut object = CleanObject::new();
    for (key, value) in map {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let text = match value {
            JsonValue::String(text) => text.trim().to_string(),
            JsonValue::Number(number) => number.to_string(),
            JsonValue::Bool(flag) => flag.to_string(),
            _ => continue,
        };
        if text.is_empty() {
            continue;
        }
        object.insert(key.to_string(), text);
    }
    if object.is_empty() {
        None
    } else {
        Some(object)
    }
}

/// Decodes `\uXXXX` escapes as UTF-16 code units, pairing surrogates.
/// Anything that does not form a valid unit is left as literal text.
fn decode_unicode_escapes(input: &str) -> String {
    if !input.contains("\\u") {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find("\\u") {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let Some(unit) = parse_utf16_unit(tail) else {
            out.push_str("\\u");
            rest = &tail[2..];
            continue;
        };
        if (0xD800..0xDC00).contains(&unit) {
            if let Some(low) = parse_utf16_unit(&tail[6..]) {
                if (0xDC00..0xE000).contains(&low) {
                    let combined =
                        0x10000 + ((u32::from(unit - 0xD800)) << 10) + u32::from(low - 0xDC00);
                    if let Some(ch) = char::from_u32(combined) {
                        out.push(ch);
                        rest = &tail[12..];
                        continue;
                    }
                }
            }
            out.push_str(&tail[..6]);
            rest = &tail[6..];
            continue;
        }
        match char::from_u32(u32::from(unit)) {
            Some(ch) => out.push(ch),
            None => out.push_str(&tail[..6]),
        }
        rest = &tail[6..];
    }
    out.push_str(rest);
    out
}

fn parse_utf16_unit(text: &str) -> Option<u16> {
    let hex = text.strip_prefix("\\u")?.get(..4)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(raw: &str) -> RawField {
        RawField::Text(raw.to_string())
    }

    #[test]
    fn normalize_strips_one_quote_pair_and_escapes() {
        assert_eq!(normalize("  \"CPR Certified\"  "), "CPR Certified");
        assert_eq!(normalize("'Premiers secours'"), "Premiers secours");
        assert_eq!(normalize("Ward A\\nWard B"), "Ward A Ward B");
        assert_eq!(normalize("say \\\"hi\\\""), "say \"hi");
        assert_eq!(normalize("a\\/b"), "a/b");
        assert_eq!(normalize("trailing\\"), "trailing");
        assert_eq!(normalize("[\"bracket residue\"]"), "bracket residue");
    }

    #[test]
    fn normalize_decodes_unicode_escapes() {
        assert_eq!(normalize("Dipl\\u00f4me d'\\u00e9tat"), "Dipl\u{f4}me d'\u{e9}tat");
        assert_eq!(normalize("\\ud83d\\ude00 ok"), "\u{1f600} ok");
        // Broken escapes stay literal.
        assert_eq!(normalize("bad \\uZZZZ escape"), "bad \\uZZZZ escape");
        assert_eq!(normalize("lone \\ud800 surrogate"), "lone \\ud800 surrogate");
    }

    #[test]
    fn native_list_dedups_preserving_first_seen_order() {
        let raw = RawField::List(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(parse_list(&raw), vec!["a", "b"]);
    }

    #[test]
    fn native_list_flattens_one_level() {
        let raw = RawField::List(vec![
            serde_json::json!(["CPR", "BLS"]),
            serde_json::json!("First Aid"),
            serde_json::json!({"ignored": true}),
        ]);
        assert_eq!(parse_list(&raw), vec!["CPR", "BLS", "First Aid"]);
    }

    #[test]
    fn strict_json_array_decodes_first() {
        assert_eq!(parse_list(&text("[\"a\", \"b\"]")), vec!["a", "b"]);
    }

    #[test]
    fn double_encoded_array_decodes_twice() {
        let raw = text("\"[\\\"Diploma A\\\", \\\"Diploma B\\\"]\"");
        assert_eq!(parse_list(&raw), vec!["Diploma A", "Diploma B"]);
    }

    #[test]
    fn raw_newline_inside_json_string_is_softened_and_retried() {
        let raw = text("[\"Ward\nA\"]");
        assert_eq!(parse_list(&raw), vec!["Ward\nA"]);
    }

    #[test]
    fn quoted_segments_recover_concatenated_strings() {
        let raw = text("\"Hospital X\"\"Clinic Y\"");
        assert_eq!(parse_list(&raw), vec!["Hospital X", "Clinic Y"]);
    }

    #[test]
    fn delimiter_fallback_splits_on_semicolons() {
        let raw = text("CPR Certified; First Aid; BLS");
        assert_eq!(parse_list(&raw), vec!["CPR Certified", "First Aid", "BLS"]);
    }

    #[test]
    fn newline_wins_over_comma() {
        let raw = text("CPR, advanced\nFirst Aid");
        assert_eq!(parse_list(&raw), vec!["CPR, advanced", "First Aid"]);
    }

    #[test]
    fn undelimited_text_is_a_single_entry() {
        assert_eq!(parse_list(&text("Just one diploma")), vec!["Just one diploma"]);
    }

    #[test]
    fn blank_and_absent_yield_empty_lists() {
        assert!(parse_list(&RawField::Absent).is_empty());
        assert!(parse_list(&text("   ")).is_empty());
        assert!(parse_object_list(&RawField::Absent).is_empty());
        assert!(parse_object_list(&text("")).is_empty());
    }

    fn obj(pairs: &[(&str, &str)]) -> CleanObject {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn well_formed_object_list_decodes_directly() {
        let raw = text("[{\"nom\": \"DE Kin\u{e9}\", \"annee\": \"2012\"}]");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "DE Kin\u{e9}"), ("annee", "2012")])]);
    }

    #[test]
    fn lone_mapping_is_wrapped() {
        let raw = text("{\"nom\": \"CES Cardiologie\"}");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "CES Cardiologie")])]);
    }

    #[test]
    fn double_encoded_object_list_decodes() {
        let raw = text("\"[{\\\"nom\\\": \\\"DU Echographie\\\"}]\"");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "DU Echographie")])]);
    }

    #[test]
    fn malformed_object_is_repaired() {
        let raw = text("{name: 'Dr A', year: 2010,}");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("name", "Dr A"), ("year", "2010")])]);
    }

    #[test]
    fn stray_non_mapping_entries_are_dropped() {
        let raw = text("[{\"nom\": \"A\"}, \"stray\", 3]");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "A")])]);
    }

    #[test]
    fn balanced_chunks_rescue_objects_from_surrounding_garbage() {
        let raw = text("saved: {nom: 'DES Radiologie'} and {nom: 'DU IRM', } and {broken");
        assert_eq!(
            parse_object_list(&raw),
            vec![obj(&[("nom", "DES Radiologie")]), obj(&[("nom", "DU IRM")])]
        );
    }

    #[test]
    fn null_and_blank_values_are_dropped_from_objects() {
        let raw = text("[{\"nom\": \"A\", \"annee\": null, \"mention\": \"  \"}, {\"nom\": null}]");
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "A")])]);
    }

    #[test]
    fn native_list_of_mappings_passes_through() {
        let raw = RawField::List(vec![
            serde_json::json!({"nom": "A"}),
            serde_json::json!("[{\"nom\": \"B\"}]"),
            serde_json::json!(42),
        ]);
        assert_eq!(parse_object_list(&raw), vec![obj(&[("nom", "A")]), obj(&[("nom", "B")])]);
    }
}
