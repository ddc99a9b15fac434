//! Deterministic cleanup of extracted page text.
//!
//! pdfium's text layer comes back with CRLF line endings, trailing blanks,
//! zero-width characters and runs of empty lines where the layout had
//! whitespace. Each rule below is a pure `&str → String` pass; [`clean_page_text`]
//! runs them in order.
//!
//! Line endings are normalised first so later rules only ever see `\n`.
//! Form feeds are dropped from page text because the extractor uses them as
//! its own page separator.

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean the text of a single page.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Remove stray form feeds
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ blank lines down to one
/// 6. Trim leading/trailing blank lines
pub fn clean_page_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_form_feeds(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

/// Make a whole document end with exactly one newline.
pub fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Remove form feeds ────────────────────────────────────────────────

fn remove_form_feeds(input: &str) -> String {
    input.replace('\u{000C}', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse blank lines ─────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_and_trailing_spaces() {
        assert_eq!(clean_page_text("a  \r\nb\t\r\n"), "a\nb");
    }

    #[test]
    fn form_feeds_never_survive() {
        let out = clean_page_text("one\u{000C}two");
        assert!(!out.contains('\u{000C}'));
        assert_eq!(out, "one\ntwo");
    }

    #[test]
    fn invisible_chars_removed() {
        assert_eq!(clean_page_text("\u{FEFF}he\u{200B}llo"), "hello");
    }

    #[test]
    fn blank_runs_collapse_to_one_empty_line() {
        assert_eq!(clean_page_text("\n\na\n\n\n\n\nb\n\n"), "a\n\nb");
    }

    #[test]
    fn final_newline() {
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline("   "), "\n");
    }
}
