//! JSON extraction helpers for agent output.
//!
//! Agent CLIs are asked for JSON but routinely wrap it in prose, markdown
//! fences, or log noise. [`extract_first_object`] scans for the first
//! complete, balanced JSON object so the invoker can fall back from strict
//! parsing without resorting to fragile regexes.

/// Find the first complete JSON object in `text` and return it as a slice.
///
/// Brace counting is string- and escape-aware, so braces inside string
/// literals do not confuse the scan. Returns `None` when no balanced
/// object exists.
pub fn extract_first_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse `text` as JSON, falling back to extraction of the first balanced
/// object. Returns the parsed value and whether extraction was needed.
pub fn parse_lenient(text: &str) -> Option<(serde_json::Value, bool)> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some((value, false));
    }
    let candidate = extract_first_object(text)?;
    let value = serde_json::from_str(candidate).ok()?;
    Some((value, true))
}
