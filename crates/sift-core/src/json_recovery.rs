//! Recovery parser for free-form generator output.
//!
//! Generators are asked for JSON but reply with prose, markdown fences,
//! trailing commas, and stray control characters. This module recovers a
//! structured value from such text without ever raising to the caller.

use serde_json::Value;

/// Recover a JSON value from arbitrary generator text.
///
/// Strategies, first success wins:
/// 1. direct parse when the trimmed text starts with `{` or `[`
/// 2. balanced `{...}` extraction (string- and escape-aware)
/// 3. balanced `[...]` extraction
/// 4. repair pass (fences, trailing commas, control characters, bare
///    newlines inside strings), then retry 1-3 on the repaired text
///
/// Returns `None` when every strategy fails.
pub fn parse(text: &str) -> Option<Value> {
    parse_strategies(text).or_else(|| {
        let repaired = repair(text);
        if repaired == text {
            None
        } else {
            parse_strategies(&repaired)
        }
    })
}

/// Like [`parse`], but additionally requires the result to be an object
/// containing every key in `required_keys`.
///
/// A successful parse with the wrong shape returns `None`, letting callers
/// treat it identically to unparseable text.
pub fn parse_with_keys(text: &str, required_keys: &[&str]) -> Option<Value> {
    let value = parse(text)?;
    let object = value.as_object()?;
    if required_keys.iter().all(|k| object.contains_key(*k)) {
        Some(value)
    } else {
        None
    }
}

fn parse_strategies(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(slice) = balanced_slice(text, open, close) {
            if let Ok(value) = serde_json::from_str(slice) {
                return Some(value);
            }
        }
    }
    None
}

/// Slice from the first `open` to its matching `close`.
///
/// Delimiters inside string literals are ignored: a quote toggles string
/// state and a backslash escapes the next character.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match c {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fix-up pass: drop markdown fence markers, drop trailing commas before a
/// closing brace/bracket, drop control characters, and escape bare newlines
/// inside string literals.
fn repair(text: &str) -> String {
    let text = text
        .replace("```json", " ")
        .replace("```JSON", " ")
        .replace("```", " ");

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
            } else {
                match c {
                    '\\' => {
                        out.push(c);
                        escaped = true;
                    }
                    '"' => {
                        out.push(c);
                        in_string = false;
                    }
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c if c.is_control() => {}
                    c => out.push(c),
                }
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                out.push(c);
                in_string = true;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                // trailing comma right before a closer: drop it
                if !(j < chars.len() && (chars[j] == '}' || chars[j] == ']')) {
                    out.push(c);
                }
            }
            c if c.is_control() && c != '\n' && c != '\t' && c != '\r' => {}
            c => out.push(c),
        }
        i += 1;
    }
    out
}
