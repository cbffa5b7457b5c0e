//! Fenced-payload extraction from free-form model replies.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, SpecExtractError};

static MARKDOWN_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&fence_pattern("markdown")).expect("valid regex"));

/// The tag must end the opening fence line, so `markdownlint` is not `markdown`.
fn fence_pattern(tag: &str) -> String {
    format!(r"(?s)```{}[ \t]*\r?\n(.*?)\s*```", regex::escape(tag))
}

/// Extract the inner text of the first fenced block tagged `tag`.
///
/// The match is non-greedy, so with several blocks the first one wins.
/// Surrounding whitespace inside the fence is trimmed. A reply without a
/// matching block is a [`SpecExtractError::MalformedModelOutput`].
pub fn extract_fenced(reply: &str, tag: &str) -> Result<String> {
    let compiled;
    let re = if tag == "markdown" {
        &*MARKDOWN_FENCE_RE
    } else {
        compiled = Regex::new(&fence_pattern(tag))
            .map_err(|e| SpecExtractError::malformed(format!("bad fence tag {tag:?}: {e}")))?;
        &compiled
    };

    re.captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .ok_or_else(|| {
            SpecExtractError::malformed(format!(
                "no ```{tag} block found in model reply ({} chars)",
                reply.len()
            ))
        })
}

/// Return the body of a fenced block of any tag, or the whole reply trimmed
/// when it is not fenced at all.
///
/// Used for JSON answers, where backends sometimes add a fence and
/// sometimes do not. Only a fence that opens its own line counts, so
/// backticks quoted inside a JSON string value are left alone.
pub fn strip_optional_fence(reply: &str) -> &str {
    static ANY_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?sm)^[ \t]*```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\s*```").expect("valid regex")
    });

    match ANY_FENCE_RE.captures(reply).and_then(|caps| caps.get(1)) {
        Some(m) => m.as_str().trim(),
        None => reply.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_markdown_block_ignoring_prose() {
        let reply = "Sure! Here is the document:\n\n```markdown\n# Heading\n\nBody\n```\nLet me know.";
        assert_eq!(extract_fenced(reply, "markdown").unwrap(), "# Heading\n\nBody");
    }

    #[test]
    fn trims_inner_whitespace() {
        let reply = "```markdown\n\n   Heading   \n\n```";
        assert_eq!(extract_fenced(reply, "markdown").unwrap(), "Heading");
    }

    #[test]
    fn first_block_wins() {
        let reply = "```markdown\nfirst\n```\n\n```markdown\nsecond\n```";
        assert_eq!(extract_fenced(reply, "markdown").unwrap(), "first");
    }

    #[test]
    fn missing_block_is_malformed() {
        let err = extract_fenced("# Heading without a fence", "markdown").unwrap_err();
        assert!(matches!(err, SpecExtractError::MalformedModelOutput { .. }));
    }

    #[test]
    fn other_tag_does_not_match() {
        let err = extract_fenced("```html\n<p>x</p>\n```", "markdown").unwrap_err();
        assert!(matches!(err, SpecExtractError::MalformedModelOutput { .. }));
    }

    #[test]
    fn tag_must_end_the_fence_line() {
        let reply = "```markdownlint\nrule\n```\n```markdown\nHeading\n```";
        assert_eq!(extract_fenced(reply, "markdown").unwrap(), "Heading");
    }

    #[test]
    fn non_markdown_tags_still_extract() {
        let reply = "Result:\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_fenced(reply, "json").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn optional_fence_stripped() {
        assert_eq!(strip_optional_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_optional_fence("Here you go:\n```\n[1]\n```"), "[1]");
        assert_eq!(strip_optional_fence("  {\"a\": 1}\n"), "{\"a\": 1}");
    }

    #[test]
    fn inline_backticks_are_not_a_fence() {
        let reply = r#"[{"a": "see ```ГОСТ 123``` below"}]"#;
        assert_eq!(strip_optional_fence(reply), reply);
    }
}
