//! Text processing and retry utilities.
//!
//! The backend answers in lightweight markdown; Telegram wants a restricted
//! HTML dialect. The conversion regexes are compile-time validated through
//! the `lazy_regex!` macro and initialized on first use.

// lazy_regex! uses once_cell internally; the patterns are validated at
// compile time so the lazy statics cannot panic at runtime.
#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use lazy_regex::lazy_regex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// Fenced code blocks: ```...```
static RE_CODE_BLOCK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"```[\s\S]*?```");

/// Fenced code blocks with optional language tag
static RE_CODE_BLOCK_FENCE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"```(\w+)?\n([\s\S]*?)```");

/// Bullet marker at the start of a line
static RE_BULLET: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^\* ");

/// Bold: **text**
static RE_BOLD: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*\*(.*?)\*\*");

/// Italic: *text*
static RE_ITALIC: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*(.*?)\*");

/// Inline code: `code`
static RE_INLINE_CODE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"`(.*?)`");

/// Three or more consecutive newlines
static RE_MULTI_NEWLINE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\n{3,}");

/// Markdown code fence marker
const FENCE: &str = "```";

/// A part that would hold only an opening and a closing fence
const EMPTY_FENCED_BLOCK: &str = "```\n```";

/// HTML tags Telegram accepts in `ParseMode::Html`
const TELEGRAM_ALLOWED_TAGS: &[&str] = &[
    "b", "i", "u", "s", "code", "pre", "a", "/b", "/i", "/u", "/s", "/code", "/pre", "/a",
];

/// Escape naked angle brackets while leaving Telegram-allowed tags intact.
fn escape_angle_brackets(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_tag = false;

    while let Some(c) = chars.next() {
        match c {
            '<' => {
                // Peek at the tag name to decide whether this is real HTML
                let mut name = String::new();
                let mut consumed = Vec::new();

                if chars.peek() == Some(&'/') {
                    chars.next();
                    consumed.push('/');
                    name.push('/');
                }
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() {
                        chars.next();
                        consumed.push(next);
                        name.push(next);
                    } else {
                        break;
                    }
                }

                if !name.is_empty() && TELEGRAM_ALLOWED_TAGS.contains(&name.as_str()) {
                    result.push('<');
                    result.push_str(&name);
                    in_tag = true;
                } else {
                    result.push_str("&lt;");
                    for peeked in consumed {
                        result.push(peeked);
                    }
                }
            }
            '>' => {
                if in_tag {
                    result.push(c);
                    in_tag = false;
                } else {
                    result.push_str("&gt;");
                }
            }
            _ => result.push(c),
        }
    }
    result
}

/// Escape naked angle brackets, leaving code blocks and valid tags alone.
///
/// # Examples
///
/// ```
/// use kelly_telegram_bot::utils::clean_html;
/// let cleaned = clean_html("1 < 2 pero <b>negritas</b> funcionan");
/// assert_eq!(cleaned, "1 &lt; 2 pero <b>negritas</b> funcionan");
/// ```
pub fn clean_html(text: &str) -> String {
    // Pull code blocks out behind UUID placeholders so user text containing
    // a literal placeholder string cannot collide with them.
    let mut code_blocks: Vec<(String, String)> = Vec::new();
    let mut out = String::new();
    let mut last_end = 0;

    for mat in RE_CODE_BLOCK.find_iter(text) {
        out.push_str(&text[last_end..mat.start()]);
        let placeholder = format!("__CODE_BLOCK_{}__", Uuid::new_v4().as_simple());
        code_blocks.push((placeholder.clone(), mat.as_str().to_string()));
        out.push_str(&placeholder);
        last_end = mat.end();
    }
    out.push_str(&text[last_end..]);

    let mut out = escape_angle_brackets(&out);

    for (placeholder, block) in code_blocks {
        out = out.replace(&placeholder, &block);
    }

    out
}

/// Convert the backend's markdown-flavored answer to Telegram HTML.
///
/// Handles fenced code blocks, `* ` bullets, `**bold**`, `*italic*`, inline
/// code and collapses runs of 3+ newlines.
///
/// # Examples
///
/// ```
/// use kelly_telegram_bot::utils::format_text;
/// let formatted = format_text("**Negritas** y *cursiva* con `codigo`");
/// assert_eq!(formatted, "<b>Negritas</b> y <i>cursiva</i> con <code>codigo</code>");
/// ```
pub fn format_text(text: &str) -> String {
    let mut out = clean_html(text);

    out = RE_CODE_BLOCK_FENCE
        .replace_all(&out, |caps: &regex::Captures| {
            let lang = caps.get(1).map_or("", |m| m.as_str());
            let code = caps.get(2).map_or("", |m| m.as_str()).trim();
            let escaped = html_escape::encode_text(code);
            format!("<pre><code class=\"{lang}\">{escaped}</code></pre>")
        })
        .to_string();

    out = RE_BULLET.replace_all(&out, "• ").to_string();
    out = RE_BOLD.replace_all(&out, "<b>$1</b>").to_string();
    out = RE_ITALIC.replace_all(&out, "<i>$1</i>").to_string();

    out = RE_INLINE_CODE
        .replace_all(&out, |caps: &regex::Captures| {
            let code = caps.get(1).map_or("", |m| m.as_str());
            format!("<code>{}</code>", html_escape::encode_text(code))
        })
        .to_string();

    out = RE_MULTI_NEWLINE.replace_all(&out, "\n\n").to_string();

    out.trim().to_string()
}

/// Split a long message into parts within Telegram's length limit.
///
/// Code fences are closed at a boundary and reopened in the next part so
/// formatting survives the split. A single line longer than `max_length` is
/// split by grapheme clusters so multi-byte text never breaks mid-character.
///
/// # Examples
///
/// ```
/// use kelly_telegram_bot::utils::split_long_message;
/// let parts = split_long_message(&"linea larga\n".repeat(500), 4000);
/// assert!(parts.len() > 1);
/// assert!(parts.iter().all(|p| p.len() <= 4000));
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_length: usize) -> Vec<String> {
    if message.is_empty() {
        return Vec::new();
    }
    if message.len() <= max_length {
        return vec![message.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_code_block = false;

    for line in message.lines() {
        // Inside a fence a line must leave room for the reopening and the
        // closing fence markers of the part that carries it.
        let line_budget = if in_code_block {
            max_length.saturating_sub(2 * (FENCE.len() + 1))
        } else {
            max_length
        };

        // A single oversize line gets chunked by graphemes
        if line.len() > line_budget {
            let mut chunk = String::new();
            for grapheme in line.graphemes(true) {
                if chunk.len() + grapheme.len() > line_budget {
                    append_line(&mut current, &mut parts, &chunk, in_code_block, max_length);
                    chunk.clear();
                }
                chunk.push_str(grapheme);
            }
            if !chunk.is_empty() {
                append_line(&mut current, &mut parts, &chunk, in_code_block, max_length);
            }
            continue;
        }

        append_line(&mut current, &mut parts, line, in_code_block, max_length);

        if line.starts_with(FENCE) {
            in_code_block = !in_code_block;
        }
    }

    if !current.is_empty() {
        flush(&mut current, in_code_block, &mut parts);
    }

    parts
}

/// Append a line to the part under construction, flushing first when the
/// part (plus its closing fence, if one will be added) would exceed the
/// limit.
fn append_line(
    current: &mut String,
    parts: &mut Vec<String>,
    line: &str,
    in_code_block: bool,
    max_length: usize,
) {
    let close_overhead = if in_code_block { FENCE.len() + 1 } else { 0 };
    if !current.is_empty() && current.len() + line.len() + 1 + close_overhead > max_length {
        flush(current, in_code_block, parts);
    }
    current.push_str(line);
    current.push('\n');
}

/// Emit the part under construction, closing an open fence and reopening it
/// for the next part. Parts that hold nothing but fence markers are dropped.
fn flush(current: &mut String, in_code_block: bool, parts: &mut Vec<String>) {
    if in_code_block {
        current.push_str(FENCE);
        current.push('\n');
    }
    let part = current.trim_end();
    if !part.is_empty() && part != FENCE && part != EMPTY_FENCED_BLOCK {
        parts.push(part.to_string());
    }
    current.clear();
    if in_code_block {
        current.push_str(FENCE);
        current.push('\n');
    }
}

/// Truncate a string to a maximum number of characters (not bytes).
///
/// # Examples
///
/// ```
/// use kelly_telegram_bot::utils::truncate_str;
/// assert_eq!(truncate_str("¿Qué es MiAdminXML?", 4), "¿Qué");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a Telegram API operation with exponential backoff and jitter.
///
/// Intended for outbound sends that can fail on transient network errors.
/// Defaults: 500 ms initial delay, 4 s max delay, 3 attempts (see
/// `config::get_telegram_max_retries`).
///
/// # Errors
///
/// Returns the last error once all attempts are exhausted.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        get_telegram_max_retries, TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS,
    };

    let max_retries = get_telegram_max_retries();
    let strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(max_retries);

    Retry::spawn(strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} attempts: {}",
            max_retries, e
        );
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_html_escapes_naked_brackets() {
        assert_eq!(clean_html("a < b y c > d"), "a &lt; b y c &gt; d");
        assert_eq!(clean_html("<b>ok</b>"), "<b>ok</b>");
        assert_eq!(clean_html("<script>x</script>"), "&lt;script&gt;x&lt;/script&gt;");
    }

    #[test]
    fn test_clean_html_preserves_code_blocks() {
        let input = "Inicio\n```rust\nfn main() { if 1 < 2 {} }\n```\nFin < 3";
        let cleaned = clean_html(input);
        assert!(cleaned.contains("if 1 < 2"));
        assert!(cleaned.ends_with("Fin &lt; 3"));
    }

    #[test]
    fn test_format_text_basics() {
        assert_eq!(format_text("**hola**"), "<b>hola</b>");
        assert_eq!(format_text("* item"), "• item");
        assert_eq!(
            format_text("```py\nprint(1 < 2)\n```"),
            "<pre><code class=\"py\">print(1 &lt; 2)</code></pre>"
        );
        // 3+ newlines collapse into 2
        assert_eq!(format_text("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_split_respects_limit() {
        let msg = "una línea de prueba razonablemente larga\n".repeat(300);
        let parts = split_long_message(&msg, 4000);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= 4000));
    }

    #[test]
    fn test_split_reopens_code_fence() {
        let mut msg = String::from("```\n");
        for i in 0..200 {
            msg.push_str(&format!("linea de codigo numero {i}\n"));
        }
        msg.push_str("```\n");

        let parts = split_long_message(&msg, 1000);
        assert!(parts.len() > 1);
        // Every part must contain an even number of fences (closed blocks)
        for part in &parts {
            let fences = part.matches("```").count();
            assert_eq!(fences % 2, 0, "unbalanced fences in part: {part}");
        }
    }

    #[test]
    fn test_split_fenced_parts_stay_within_limit() {
        // Lines that almost fill the limit force a split right where the
        // closing fence gets appended; the fence must be budgeted for.
        let msg = format!("```\n{}\n{}\n```\n", "a".repeat(95), "b".repeat(90));
        let parts = split_long_message(&msg, 100);
        for part in &parts {
            assert!(part.len() <= 100, "part exceeds limit: {} bytes", part.len());
            assert_eq!(part.matches("```").count() % 2, 0, "unbalanced fences: {part}");
        }
        let joined = parts.join("");
        assert_eq!(joined.matches('a').count(), 95);
        assert_eq!(joined.matches('b').count(), 90);
    }

    #[test]
    fn test_split_oversize_line_inside_code_block() {
        let msg = format!("```\n{}\n```\n", "x".repeat(5000));
        let parts = split_long_message(&msg, 1000);
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.len() <= 1000, "part exceeds limit: {} bytes", part.len());
            assert_eq!(part.matches("```").count() % 2, 0, "unbalanced fences: {part}");
        }
        assert_eq!(parts.join("").matches('x').count(), 5000);
    }

    #[test]
    fn test_split_oversize_single_line() {
        let msg = "x".repeat(9000);
        let parts = split_long_message(&msg, 4000);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.len() <= 4000));
    }

    #[test]
    fn test_truncate_str_unicode() {
        let s = "¿Qué es MiAdminXML?";
        assert_eq!(truncate_str(s, 4), "¿Qué");
        assert_eq!(truncate_str(s, 100), s);
    }
}
