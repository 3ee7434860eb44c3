//! Output-safety helpers shared by the lookup and RAG formatters.
//!
//! Chat clients render both markdown and a small HTML-entity subset, so any
//! value that originates outside this crate is escaped for both before it is
//! interpolated into an answer.

/// Characters with meaning in chat markdown dialects.
const MARKDOWN_SPECIALS: &[char] = &[
    '\\', '`', '*', '_', '[', ']', '(', ')', '#', '|', '~', '!', '{', '}',
];

/// Escape a value for interpolation into a markdown answer.
///
/// `&`, `<` and `>` become HTML entities (which also defuses chat mention
/// syntax such as `<!channel>`); markdown control characters are
/// backslash-escaped. Newlines collapse to spaces so a value cannot open a
/// new block.
///
/// ```rust
/// use ask_harness::text::escape_markdown;
///
/// assert_eq!(escape_markdown("<b>*hi*</b>"), "&lt;b&gt;\\*hi\\*&lt;/b&gt;");
/// ```
pub fn escape_markdown(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' | '\r' | '\t' => out.push(' '),
            c if MARKDOWN_SPECIALS.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Neutralise HTML and chat mention syntax in generated text while leaving
/// its markdown intact.
pub fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Cut `text` to at most `max_chars` characters, preferring a whitespace
/// boundary. Returns the text and whether it was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let byte_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..byte_end];
    let cut = head
        .rfind(char::is_whitespace)
        .filter(|&i| i > byte_end / 2)
        .unwrap_or(byte_end);
    (head[..cut].trim_end().to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html_and_markdown() {
        assert_eq!(
            escape_markdown("[click](javascript:alert(1))"),
            "\\[click\\]\\(javascript:alert\\(1\\)\\)"
        );
        assert_eq!(escape_markdown("a & b"), "a &amp; b");
        assert_eq!(escape_markdown("<!channel>"), "&lt;\\!channel&gt;");
    }

    #[test]
    fn test_escape_flattens_newlines() {
        assert_eq!(escape_markdown("line1\n# heading"), "line1 \\# heading");
    }

    #[test]
    fn test_escape_leaves_plain_text() {
        assert_eq!(escape_markdown("Alice Example"), "Alice Example");
    }

    #[test]
    fn test_escape_html_keeps_markdown() {
        assert_eq!(escape_html("**bold** <@here> & co"), "**bold** &lt;@here&gt; &amp; co");
    }

    #[test]
    fn test_truncate_on_whitespace() {
        let (out, cut) = truncate_chars("alpha beta gamma delta", 13);
        assert!(cut);
        assert_eq!(out, "alpha beta");
    }

    #[test]
    fn test_truncate_noop_when_short() {
        let (out, cut) = truncate_chars("short", 10);
        assert!(!cut);
        assert_eq!(out, "short");
    }

    #[test]
    fn test_truncate_multibyte() {
        let (out, cut) = truncate_chars("ééééé", 3);
        assert!(cut);
        assert_eq!(out, "ééé");
    }
}
