//! Output safety filter
//!
//! Replies are spoken verbatim by the TTS, so anything machine-flavoured
//! must be stripped before synthesis: literal tool names, JSON fragments,
//! and stage-direction markup like `*transferring*`.

use once_cell::sync::Lazy;
use regex::Regex;

static TOOL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(update_qualification|set_call_outcome|tool_call|function_call)").unwrap()
});

static JSON_FRAGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

static MARKUP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*[^*\n]{1,60}\*").unwrap());

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip machine artifacts from a spoken reply and collapse whitespace.
pub fn sanitize_reply(raw: &str) -> String {
    let text = TOOL_NAME_RE.replace_all(raw, "");
    let text = JSON_FRAGMENT_RE.replace_all(&text, "");
    let text = MARKUP_RE.replace_all(&text, "");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(
            sanitize_reply("Great, and how old are you?"),
            "Great, and how old are you?"
        );
    }

    #[test]
    fn test_strips_tool_names() {
        assert_eq!(
            sanitize_reply("Let me update_qualification that for you. Thanks!"),
            "Let me that for you. Thanks!"
        );
    }

    #[test]
    fn test_strips_json_fragments() {
        assert_eq!(
            sanitize_reply("Noted. {\"no_hospice\": true} And your age?"),
            "Noted. And your age?"
        );
    }

    #[test]
    fn test_strips_markup() {
        assert_eq!(
            sanitize_reply("*transitioning* Wonderful, you qualify!"),
            "Wonderful, you qualify!"
        );
    }

    #[test]
    fn test_collapses_whitespace() {
        assert_eq!(sanitize_reply("  Hello \n  there  "), "Hello there");
    }
}
