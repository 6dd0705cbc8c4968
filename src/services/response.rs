//! Generator response shapes.
//!
//! A reply is either a final script or an iterate-directive asking to see
//! the effect of some code first. Anything that parses as a JSON object with
//! a string `code` field is a directive; everything else is the final script.
//! A single enclosing Markdown code fence is stripped in both cases.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentResponse {
    Final(String),
    Iterate { code: String, reason: String },
}

impl AgentResponse {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let body = strip_fence(raw.trim());
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body)
            && let Some(Value::String(code)) = map.get("code")
        {
            let reason = map
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            return Self::Iterate { code: code.clone(), reason };
        }
        Self::Final(body.to_owned())
    }
}

/// Body of a single enclosing code fence, or `text` unchanged.
fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // the opening line may carry a language tag
    match inner.split_once('\n') {
        Some((_, body)) => body.trim(),
        None => inner.trim(),
    }
}

#[cfg(test)]
#[path = "response_test.rs"]
mod tests;
