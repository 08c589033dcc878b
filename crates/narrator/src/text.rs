/// Normalize narration text before synthesis
///
/// Typographic punctuation is mapped to ASCII, whitespace runs collapse to a single
/// space, and every character outside letters, digits and basic sentence
/// punctuation is dropped.
pub fn clean_text(text: &str) -> String {
    let mut mapped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{2032}' => mapped.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201F}' | '\u{2033}' => mapped.push('"'),
            '\u{2014}' => mapped.push_str("; "),
            '\u{2013}' => mapped.push('-'),
            '\u{2026}' => mapped.push_str("..."),
            c if c.is_whitespace() => mapped.push(' '),
            c => mapped.push(c),
        }
    }

    let kept: String = mapped
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | ',' | '?' | '!' | '\''))
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Uppercase a transcribed word for display, dropping quotes drawtext cannot hold
pub fn display_word(word: &str) -> String {
    word.trim()
        .chars()
        .filter(|c| *c != '\'' && *c != '"')
        .flat_map(char::to_uppercase)
        .collect()
}

/// Escape a value embedded in a single-quoted drawtext `text=` option
///
/// Single quotes cannot be escaped inside a quoted value and are removed.
pub fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\'' => {}
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '%' => out.push_str("\\%"),
            c => out.push(c),
        }
    }
    out
}

/// Escape a file path used as a filter option value
pub fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
}

/// Quote a path for a concat demuxer list entry
pub fn escape_concat_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clean_text_maps_typography() {
        assert_eq!(
            clean_text("\u{201C}Wait\u{2026}\u{201D} she said\u{2014}then\tleft."),
            "Wait... she said then left."
        );
        assert_eq!(clean_text("It\u{2019}s  fine"), "It's fine");
    }

    #[test]
    fn test_clean_text_strips_filter_breaking_symbols() {
        assert_eq!(clean_text("a:b [c] {d} <e> $f & g|h ~i"), "ab c d e f gh i");
        assert_eq!(clean_text("   "), "");
        assert_eq!(clean_text("\u{1F600}\u{1F600}"), "");
    }

    #[test]
    fn test_display_word() {
        assert_eq!(display_word(" don't "), "DONT");
        assert_eq!(display_word("world,"), "WORLD,");
    }

    #[test]
    fn test_escape_drawtext() {
        assert_eq!(escape_drawtext("12:30"), "12\\:30");
        assert_eq!(escape_drawtext("100%"), "100\\%");
        assert_eq!(escape_drawtext("a\\b"), "a\\\\b");
        assert_eq!(escape_drawtext("it's"), "its");
    }

    #[test]
    fn test_escape_paths() {
        assert_eq!(escape_filter_path("C:\\Fonts\\bold.ttf"), "C\\:\\\\Fonts\\\\bold.ttf");
        assert_eq!(escape_filter_path("/f/o'b.ttf"), "/f/o\\'b.ttf");
        assert_eq!(escape_concat_path("/jobs/it's.mp3"), "'/jobs/it'\\''s.mp3'");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Cleaned text never contains characters that break filter syntax
        #[test]
        fn test_clean_text_output_alphabet(input in "\\PC{0,80}") {
            let cleaned = clean_text(&input);
            prop_assert!(cleaned.chars().all(|c| c.is_ascii_alphanumeric() || " .,?!'".contains(c)));
            prop_assert!(!cleaned.contains("  "));
            prop_assert_eq!(cleaned.trim(), cleaned.as_str());
        }

        /// Escaped drawtext values have no unescaped colon and no quote
        #[test]
        fn test_escape_drawtext_has_no_bare_colon(input in "[a-z:%'\\\\]{0,30}") {
            let escaped = escape_drawtext(&input);
            prop_assert!(!escaped.contains('\''));
            let bytes = escaped.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'\\' {
                    i += 2;
                    continue;
                }
                prop_assert!(bytes[i] != b':' && bytes[i] != b'%');
                i += 1;
            }
        }
    }
}
