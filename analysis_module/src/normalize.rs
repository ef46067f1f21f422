//! Lexical cleanup applied to thread text before it reaches the model.
//!
//! Best-effort only: downstream code must not assume the output is fully
//! canonical. Empty input yields empty output and nothing here fails.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use unicode_normalization::UnicodeNormalization;

const MAX_BLANK_LINES: usize = 2;

/// Canonicalize a raw email body for interpretation.
///
/// Order matters: entity unescape and line endings first, then NFKC and
/// separator collapse, then the phrase/time/date rewrites that expect
/// plain ASCII spacing, then per-line whitespace collapse.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let s = unescape_entities(raw);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s: String = s.nfkc().collect();
    let s: String = s
        .chars()
        .filter(|ch| *ch != '\u{feff}')
        .map(|ch| if is_separator(ch) { ' ' } else { ch })
        .collect();

    let s = rewrite_acceptance_phrases(&s);
    let s = normalize_meridiem(&s);
    let s = pad_numeric_dates(&s);
    collapse_whitespace_keep_lines(&s).trim().to_string()
}

// Unicode separator characters (Zs/Zl/Zp) that survive NFKC, plus the
// ASCII-adjacent ones so ordering against NFKC does not matter.
fn is_separator(ch: char) -> bool {
    matches!(
        ch,
        '\u{00a0}'
            | '\u{1680}'
            | '\u{2000}'..='\u{200a}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202f}'
            | '\u{205f}'
            | '\u{3000}'
    )
}

fn unescape_entities(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest[1..].find(';').map(|i| i + 1);
        let replaced = match end {
            Some(end) if end <= 10 => {
                let entity = &rest[1..end];
                match decode_entity(entity) {
                    Some(decoded) => {
                        out.push_str(&decoded);
                        rest = &rest[end + 1..];
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };
        if !replaced {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<String> {
    match entity {
        "amp" => return Some("&".to_string()),
        "lt" => return Some("<".to_string()),
        "gt" => return Some(">".to_string()),
        "quot" => return Some("\"".to_string()),
        "apos" => return Some("'".to_string()),
        "nbsp" => return Some(" ".to_string()),
        _ => {}
    }
    let digits = entity.strip_prefix('#')?;
    let code = if let Some(hex) = digits.strip_prefix('x').or_else(|| digits.strip_prefix('X')) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u32>().ok()?
    };
    char::from_u32(code).map(|ch| ch.to_string())
}

fn acceptance_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?i)\bi\s*am\s*ok\s*(?:to|with|for)\s*both(?:\s*times?)?\b").unwrap(),
                "I am ok with both times",
            ),
            (
                Regex::new(r"(?i)\bok\s*(?:to|with|for)\s*both(?:\s*times?)?\b").unwrap(),
                "ok with both times",
            ),
            (Regex::new(r"(?i)\bboth\s*time\b").unwrap(), "both times"),
        ]
    })
}

fn rewrite_acceptance_phrases(s: &str) -> String {
    let mut out = s.to_string();
    for (pattern, replacement) in acceptance_rules() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

fn normalize_meridiem(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\b(\d{1,2}:\d{2})\s*(am|pm)\b").unwrap());
    re.replace_all(s, |caps: &Captures<'_>| {
        format!("{} {}", &caps[1], caps[2].to_ascii_uppercase())
    })
    .into_owned()
}

fn pad_numeric_dates(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re =
        RE.get_or_init(|| Regex::new(r"\b(\d{4})([/-])(\d{1,2})([/-])(\d{1,2})\b").unwrap());
    re.replace_all(s, |caps: &Captures<'_>| {
        format!(
            "{}{}{:0>2}{}{:0>2}",
            &caps[1], &caps[2], &caps[3], &caps[4], &caps[5]
        )
    })
    .into_owned()
}

fn collapse_whitespace_keep_lines(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[ \t]+").unwrap());

    let mut out: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in s.split('\n') {
        let line = re.replace_all(line, " ");
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run <= MAX_BLANK_LINES {
                out.push(String::new());
            }
        } else {
            blank_run = 0;
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \n\n  "), "");
    }

    #[test]
    fn unescapes_entities_and_line_endings() {
        let out = normalize("a &amp; b&#33;\r\nnext&nbsp;line");
        assert_eq!(out, "a & b!\nnext line");
    }

    #[test]
    fn collapses_unicode_separators() {
        let out = normalize("meet\u{00a0}at\u{3000}noon\u{feff}");
        assert_eq!(out, "meet at noon");
    }

    #[test]
    fn rewrites_informal_acceptance_phrases() {
        assert_eq!(normalize("ok to both"), "ok with both times");
        assert_eq!(normalize("I am OK to both time"), "I am ok with both times");
        assert_eq!(normalize("ok for both times"), "ok with both times");
        assert_eq!(normalize("both time work"), "both times work");
    }

    #[test]
    fn uppercases_meridiem_with_space() {
        assert_eq!(normalize("see you at 3:00pm"), "see you at 3:00 PM");
        assert_eq!(normalize("11:00 am works"), "11:00 AM works");
    }

    #[test]
    fn pads_numeric_date_components() {
        assert_eq!(normalize("2025/11/4 is fine"), "2025/11/04 is fine");
        assert_eq!(normalize("2025-1-7"), "2025-01-07");
    }

    #[test]
    fn collapses_inline_whitespace_and_blank_runs() {
        let out = normalize("a\t\t b\n\n\n\n\nc   d");
        assert_eq!(out, "a b\n\n\nc d");
    }

    #[test]
    fn nfkc_folds_fullwidth_digits() {
        assert_eq!(normalize("２０２５/１１/０４"), "2025/11/04");
    }
}
