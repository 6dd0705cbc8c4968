//! Script validator — sanitizes generator output and rejects unsafe scripts.
//!
//! DESIGN
//! ======
//! Generator output routinely contains typographic substitutions (curly
//! quotes, dashes, ellipsis glyphs, exotic spaces) that break parsing for
//! reasons unrelated to the intended logic. `sanitize` folds them back to
//! plain ASCII before anything else looks at the text.
//!
//! `validate` then runs two checks against the sanitized text: a denylist of
//! dangerous constructs (dynamic evaluation, indirect function construction,
//! cookie access, outbound network) and a syntax check through the
//! `ScriptRuntime`. The denylist only looks at code: the contents of quoted
//! strings and comments are blanked first, so copy that mentions cookies is
//! still editable. The denylist runs first so a construct the sandbox would
//! refuse to parse is still reported by name. Nothing here executes a script.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use super::sandbox::ScriptRuntime;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("disallowed construct `{pattern}` ({description})")]
    Denied { pattern: &'static str, description: &'static str },
    #[error("syntax error: {0}")]
    Syntax(String),
}

impl crate::error::ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "E_DENIED_CONSTRUCT",
            Self::Syntax(_) => "E_SYNTAX",
        }
    }
}

// =============================================================================
// SANITIZE
// =============================================================================

fn replacement(c: char) -> Option<&'static str> {
    let plain = match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => "'",
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => "\"",
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' | '\u{2212}' => "-",
        '\u{2026}' => "...",
        '\u{00A0}' | '\u{2002}' | '\u{2003}' | '\u{2007}' | '\u{2009}' | '\u{202F}' => " ",
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => "",
        _ => return None,
    };
    Some(plain)
}

/// Rewrite typographic substitutions to their plain-text equivalents.
/// Plain text is returned unchanged.
#[must_use]
pub fn sanitize(text: &str) -> String {
    if !text.chars().any(|c| replacement(c).is_some()) {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match replacement(c) {
            Some(plain) => out.push_str(plain),
            None => out.push(c),
        }
    }
    out
}

// =============================================================================
// DENYLIST
// =============================================================================

struct DenyRule {
    pattern: &'static str,
    description: &'static str,
    regex: Regex,
}

/// `(reported pattern, regex, description)`.
const DENY_RULES: &[(&str, &str, &str)] = &[
    ("eval(", r"\beval\s*\(", "dynamic code evaluation"),
    ("Fn(", r"\bFn\s*\(", "indirect function construction"),
    ("Function(", r"\bFunction\s*\(", "indirect function construction"),
    ("call(", r"\bcall\s*\(", "indirect function invocation"),
    ("curry(", r"\bcurry\s*\(", "indirect function construction"),
    ("cookie", r"\bcookies?\b", "cookie access"),
    ("fetch(", r"\bfetch\s*\(", "outbound network call"),
    ("XMLHttpRequest", r"\bXMLHttpRequest\b", "outbound network call"),
    ("WebSocket", r"\bWebSocket\b", "outbound network call"),
    ("sendBeacon", r"\bsendBeacon\b", "outbound network call"),
    ("http_*(", r"\bhttp_[a-z]+\s*\(", "outbound network call"),
];

static DENYLIST: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    DENY_RULES
        .iter()
        .filter_map(|&(pattern, source, description)| match Regex::new(source) {
            Ok(regex) => Some(DenyRule { pattern, description, regex }),
            Err(e) => {
                warn!(pattern, error = %e, "validator: denylist rule failed to compile");
                None
            }
        })
        .collect()
});

fn scan_denylist(text: &str) -> Option<ValidationError> {
    let code = code_only(text);
    DENYLIST
        .iter()
        .find(|rule| rule.regex.is_match(&code))
        .map(|rule| ValidationError::Denied { pattern: rule.pattern, description: rule.description })
}

#[derive(Clone, Copy)]
enum Lexeme {
    Code,
    Str,
    StrEscape,
    Char,
    CharEscape,
    Backtick,
    LineComment,
    BlockComment,
}

/// Blank the contents of `"..."` strings, character literals, and comments,
/// keeping delimiters and line breaks. Quoted literals end at a line break. Backtick strings stay visible since
/// they can interpolate code.
fn code_only(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut state = Lexeme::Code;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        let blank = if c == '\n' { '\n' } else { ' ' };
        state = match state {
            Lexeme::Code => match c {
                '"' => {
                    out.push(c);
                    Lexeme::Str
                }
                '\'' => {
                    out.push(c);
                    Lexeme::Char
                }
                '`' => {
                    out.push(c);
                    Lexeme::Backtick
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    Lexeme::LineComment
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    Lexeme::BlockComment
                }
                _ => {
                    out.push(c);
                    Lexeme::Code
                }
            },
            Lexeme::Str | Lexeme::Char => {
                let close = if matches!(state, Lexeme::Str) { '"' } else { '\'' };
                if c == close || c == '\n' {
                    out.push(c);
                    Lexeme::Code
                } else {
                    out.push(blank);
                    match (c, state) {
                        ('\\', Lexeme::Str) => Lexeme::StrEscape,
                        ('\\', _) => Lexeme::CharEscape,
                        _ => state,
                    }
                }
            }
            Lexeme::StrEscape => {
                out.push(blank);
                Lexeme::Str
            }
            Lexeme::CharEscape => {
                out.push(blank);
                Lexeme::Char
            }
            Lexeme::Backtick => {
                out.push(c);
                if c == '`' { Lexeme::Code } else { Lexeme::Backtick }
            }
            Lexeme::LineComment => {
                out.push(blank);
                if c == '\n' { Lexeme::Code } else { Lexeme::LineComment }
            }
            Lexeme::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    Lexeme::Code
                } else {
                    out.push(blank);
                    Lexeme::BlockComment
                }
            }
        };
    }
    out
}

// =============================================================================
// VALIDATE
// =============================================================================

/// Outcome of validating one script. `sanitized` is always populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub sanitized: String,
    pub error: Option<ValidationError>,
}

impl Validation {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    /// The sanitized script, or the reason it was rejected.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] if validation failed.
    pub fn into_result(self) -> Result<String, ValidationError> {
        match self.error {
            None => Ok(self.sanitized),
            Some(e) => Err(e),
        }
    }
}

/// Sanitize `raw` and check it against the denylist and `runtime`'s parser.
#[must_use]
pub fn validate(runtime: &dyn ScriptRuntime, raw: &str) -> Validation {
    let sanitized = sanitize(raw);
    let error = scan_denylist(&sanitized).or_else(|| {
        runtime
            .check_syntax(&sanitized)
            .err()
            .map(ValidationError::Syntax)
    });
    Validation { sanitized, error }
}

#[cfg(test)]
#[path = "validator_test.rs"]
mod tests;
