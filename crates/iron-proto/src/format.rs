//! IRC formatting code handling.
//!
//! Conversion between mIRC control codes and Matrix-flavoured HTML, plus
//! stripping for plain-text fallbacks.
//!
//! # IRC format codes
//! - 0x02 (^B): Bold
//! - 0x03 (^C): Color (optional `fg[,bg]` digits follow)
//! - 0x0F (^O): Reset all formatting
//! - 0x11: Monospace
//! - 0x16 (^V): Reverse
//! - 0x1D: Italic
//! - 0x1E: Strikethrough
//! - 0x1F (^_): Underline

pub const BOLD: char = '\x02';
pub const COLOR: char = '\x03';
pub const RESET: char = '\x0F';
pub const MONOSPACE: char = '\x11';
pub const REVERSE: char = '\x16';
pub const ITALIC: char = '\x1d';
pub const STRIKETHROUGH: char = '\x1e';
pub const UNDERLINE: char = '\x1f';

const FORMAT_CHARS: &[char] = &[
    BOLD, COLOR, RESET, MONOSPACE, REVERSE, ITALIC, STRIKETHROUGH, UNDERLINE, '\x04',
];

/// Check whether a string contains any IRC formatting codes.
pub fn is_formatted(s: &str) -> bool {
    s.contains(FORMAT_CHARS)
}

/// Strip all IRC formatting codes, including color arguments.
pub fn strip_codes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            COLOR => {
                // up to two digits, optionally `,` and two more
                for _ in 0..2 {
                    if chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                        chars.next();
                    }
                }
                if chars.peek() == Some(&',') {
                    let mut ahead = chars.clone();
                    ahead.next();
                    if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                        chars.next();
                        for _ in 0..2 {
                            if chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                                chars.next();
                            }
                        }
                    }
                }
            }
            '\x04' => {
                // hex color variant: 6 hex digits, optionally `,` + 6 more
                for _ in 0..6 {
                    if chars.peek().is_some_and(|d| d.is_ascii_hexdigit()) {
                        chars.next();
                    }
                }
            }
            c if FORMAT_CHARS.contains(&c) => {}
            c => out.push(c),
        }
    }
    out
}

#[derive(Default)]
struct Toggles {
    bold: bool,
    italic: bool,
    underline: bool,
    strikethrough: bool,
    monospace: bool,
}

impl Toggles {
    fn any(&self) -> bool {
        self.bold || self.italic || self.underline || self.strikethrough || self.monospace
    }

    fn close_all(&self, html: &mut String) {
        if self.underline {
            html.push_str("</u>");
        }
        if self.strikethrough {
            html.push_str("</del>");
        }
        if self.italic {
            html.push_str("</i>");
        }
        if self.monospace {
            html.push_str("</code>");
        }
        if self.bold {
            html.push_str("</b>");
        }
    }

    fn open_all(&self, html: &mut String) {
        if self.bold {
            html.push_str("<b>");
        }
        if self.monospace {
            html.push_str("<code>");
        }
        if self.italic {
            html.push_str("<i>");
        }
        if self.strikethrough {
            html.push_str("<del>");
        }
        if self.underline {
            html.push_str("<u>");
        }
    }
}

fn escape_html(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

/// Convert an IRC message body to `(plain, Some(html))`.
///
/// Returns `None` for the HTML side when the input carries no formatting,
/// so callers can skip `formatted_body` entirely. Color codes are consumed
/// but not rendered; the toggled styles map to Matrix HTML tags.
pub fn irc_to_matrix(input: &str) -> (String, Option<String>) {
    if !is_formatted(input) {
        return (input.to_owned(), None);
    }

    let plain = strip_codes(input);
    let mut html = String::with_capacity(input.len() + 16);
    let mut t = Toggles::default();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            BOLD | MONOSPACE | ITALIC | STRIKETHROUGH | UNDERLINE => {
                t.close_all(&mut html);
                match c {
                    BOLD => t.bold = !t.bold,
                    MONOSPACE => t.monospace = !t.monospace,
                    ITALIC => t.italic = !t.italic,
                    STRIKETHROUGH => t.strikethrough = !t.strikethrough,
                    UNDERLINE => t.underline = !t.underline,
                    _ => unreachable!(),
                }
                t.open_all(&mut html);
            }
            RESET => {
                t.close_all(&mut html);
                t = Toggles::default();
            }
            COLOR | '\x04' | REVERSE => {
                // colors and reverse are dropped, arguments skipped
                if c == COLOR {
                    for _ in 0..2 {
                        if chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                            chars.next();
                        }
                    }
                    if chars.peek() == Some(&',') {
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                            chars.next();
                            for _ in 0..2 {
                                if chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                                    chars.next();
                                }
                            }
                        }
                    }
                } else if c == '\x04' {
                    for _ in 0..6 {
                        if chars.peek().is_some_and(|d| d.is_ascii_hexdigit()) {
                            chars.next();
                        }
                    }
                }
            }
            c => {
                let mut buf = [0u8; 4];
                escape_html(c.encode_utf8(&mut buf), &mut html);
            }
        }
    }
    t.close_all(&mut html);

    (plain, Some(html))
}

/// Convert Matrix HTML (`formatted_body`) to text with IRC control codes.
///
/// Handles the tags the bridge emits and the common ones clients produce:
/// b/strong, i/em, u, del/s/strike, code, br, p and anchors (rendered as
/// `text (url)`). Unknown tags are dropped, entities unescaped.
pub fn matrix_html_to_irc(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut pending_href: Option<String> = None;
    let mut anchor_start: Option<usize> = None;

    while let Some(idx) = rest.find('<') {
        push_entities(&rest[..idx], &mut out);
        rest = &rest[idx..];

        let Some(end) = rest.find('>') else {
            push_entities(rest, &mut out);
            return out;
        };
        let tag = &rest[1..end];
        rest = &rest[end + 1..];

        let (closing, name_attrs) = match tag.strip_prefix('/') {
            Some(n) => (true, n),
            None => (false, tag),
        };
        let name_attrs = name_attrs.trim_end_matches('/').trim();
        let (name, attrs) = match name_attrs.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a),
            None => (name_attrs, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "b" | "strong" => out.push(BOLD),
            "i" | "em" => out.push(ITALIC),
            "u" => out.push(UNDERLINE),
            "del" | "s" | "strike" => out.push(STRIKETHROUGH),
            "code" => out.push(MONOSPACE),
            "pre" => {}
            "br" => out.push('\n'),
            "p" | "div" | "blockquote" | "ul" | "ol" | "li" => {
                if closing && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            "a" => {
                if closing {
                    if let (Some(href), Some(start)) = (pending_href.take(), anchor_start.take()) {
                        // skip the URL suffix when the link text is the URL
                        if out[start..] != href {
                            out.push_str(&format!(" ({href})"));
                        }
                    }
                } else {
                    pending_href = attrs
                        .split_whitespace()
                        .find_map(|a| a.strip_prefix("href="))
                        .map(|v| v.trim_matches(['"', '\'']).to_owned());
                    anchor_start = Some(out.len());
                }
            }
            _ => {}
        }
    }
    push_entities(rest, &mut out);
    out
}

fn push_entities(text: &str, out: &mut String) {
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let entity = rest.find(';').map(|semi| &rest[..=semi]);
        match entity {
            Some("&amp;") => {
                out.push('&');
                rest = &rest[5..];
            }
            Some("&lt;") => {
                out.push('<');
                rest = &rest[4..];
            }
            Some("&gt;") => {
                out.push('>');
                rest = &rest[4..];
            }
            Some("&quot;") => {
                out.push('"');
                rest = &rest[6..];
            }
            Some("&nbsp;") => {
                out.push(' ');
                rest = &rest[6..];
            }
            _ => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_with_args() {
        assert_eq!(strip_codes("\x0304,07red\x0f plain"), "red plain");
        assert_eq!(strip_codes("\x02bold\x02 text"), "bold text");
    }

    #[test]
    fn unformatted_passes_through() {
        let (plain, html) = irc_to_matrix("hello world");
        assert_eq!(plain, "hello world");
        assert!(html.is_none());
    }

    #[test]
    fn bold_toggles_to_html() {
        let (plain, html) = irc_to_matrix("say \x02this\x02 loud");
        assert_eq!(plain, "say this loud");
        assert_eq!(html.as_deref(), Some("say <b>this</b> loud"));
    }

    #[test]
    fn reset_closes_open_tags() {
        let (_, html) = irc_to_matrix("\x02\x1dwow\x0f done");
        assert_eq!(html.as_deref(), Some("<b><i>wow</i></b> done"));
    }

    #[test]
    fn html_escapes_in_formatted_body() {
        let (_, html) = irc_to_matrix("\x02<tag>\x02");
        assert_eq!(html.as_deref(), Some("<b>&lt;tag&gt;</b>"));
    }

    #[test]
    fn html_to_irc_basic_tags() {
        assert_eq!(matrix_html_to_irc("<b>bold</b> ok"), "\x02bold\x02 ok");
        assert_eq!(matrix_html_to_irc("a<br>b"), "a\nb");
        assert_eq!(matrix_html_to_irc("<em>it</em>"), "\x1dit\x1d");
    }

    #[test]
    fn html_to_irc_anchor_appends_url() {
        assert_eq!(
            matrix_html_to_irc("<a href=\"https://example.com\">docs</a>"),
            "docs (https://example.com)"
        );
        // link text equal to URL is not doubled
        assert_eq!(
            matrix_html_to_irc("<a href=\"https://example.com\">https://example.com</a>"),
            "https://example.com"
        );
    }

    #[test]
    fn html_entities_unescaped() {
        assert_eq!(matrix_html_to_irc("fish &amp; chips &lt;3"), "fish & chips <3");
    }
}
