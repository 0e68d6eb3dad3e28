//! Post-model output cleanup.
//!
//! Strips model artifacts (thinking tags, unused tokens) and locates the
//! JSON document inside free-form model text before it is parsed.

use std::sync::LazyLock;

use regex::Regex;

static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

static FENCED_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```").expect("valid regex"));

/// Strip model-specific artifacts from raw output.
///
/// Handles MedGemma thinking prefixes (`<unusedN>thought\n...`) and stray
/// `<unusedN>` tokens, then trims.
pub fn sanitize_model_output(raw: &str) -> String {
    let mut text = raw;

    if let Some(idx) = text.find("<unused") {
        if let Some(offset) = text[idx..].find("thought\n") {
            text = &text[idx + offset + "thought\n".len()..];
        }
    }

    UNUSED_TOKEN_RE.replace_all(text, "").trim().to_string()
}

/// Locate the JSON document in model text.
///
/// Prefers a fenced code block; otherwise takes the first balanced `{...}`
/// or `[...]`, skipping brackets inside string literals. `None` when the text
/// holds no JSON-looking structure.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(caps) = FENCED_BLOCK_RE.captures(text) {
        if let Some(inner) = caps.get(1) {
            let inner = inner.as_str().trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let (open, close) = if bytes[start] == b'{' {
        (b'{', b'}')
    } else {
        (b'[', b']')
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
