//! Helpers for working with JSON fragments whose on-the-wire byte layout
//! must be preserved.
//!
//! The image configuration blob contains string fields (notably `Env` and
//! `Cmd`) that may carry `\uXXXX` escape sequences. Re-encoding them through
//! a decode/encode cycle would normalize the escapes and change the bytes of
//! the emitted per-layer metadata, which in turn changes the synthetic layer
//! IDs. The v1 document schemas therefore hold their values as
//! [`serde_json::value::RawValue`] fragments, and this module provides the
//! supporting pieces: one-time whitespace compaction, the emptiness rule
//! used for field omission, and constructors for fragments built at runtime.

use serde_json::value::RawValue;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Removes all whitespace between tokens of a JSON document, leaving string
/// contents (including their escape sequences) untouched.
///
/// The input must be valid JSON; the function does not validate it.
pub fn compact_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else {
            match ch {
                ' ' | '\t' | '\n' | '\r' => {}
                '"' => {
                    in_string = true;
                    out.push(ch);
                }
                _ => out.push(ch),
            }
        }
    }

    out
}

/// Returns true when a compacted JSON fragment holds an "empty" value.
///
/// This mirrors the omission rule of the legacy v1 metadata encoder: absent,
/// `null`, `false`, zero, the empty string, the empty array and the empty
/// object are all treated as empty.
pub fn raw_is_empty(raw: &str) -> bool {
    matches!(raw.trim(), "null" | "false" | "0" | "0.0" | "\"\"" | "[]" | "{}")
}

/// Builds a raw fragment from a literal piece of JSON text.
///
/// Intended for fixed literals such as `""`, `false` or `null`; the text
/// must be valid JSON.
pub fn raw_literal(text: &str) -> Box<RawValue> {
    RawValue::from_string(text.to_string()).expect("literal is valid JSON")
}

/// Builds a raw fragment holding the given string value, JSON-encoded.
pub fn raw_string(value: &str) -> Box<RawValue> {
    let encoded = serde_json::to_string(value).expect("strings always serialize");
    RawValue::from_string(encoded).expect("encoded string is valid JSON")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
