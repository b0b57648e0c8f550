use std::collections::HashMap;

use once_cell::sync::OnceCell;
use regex::Regex;

macro_rules! static_regex {
    ($name:ident = $init:expr) => {
        fn $name() -> &'static Regex {
            static REGEX: OnceCell<Regex> = OnceCell::new();
            REGEX.get_or_init(|| $init)
        }
    };
}

// The `regex` crate's compiled Unicode tables cover General_Category and
// Script, not the `emoji-data.txt` properties (`\p{Emoji}` and friends), so
// those property escapes fail to compile. Emoji-as-such has no single
// general-category; this enumerates the block ranges the emoji keyboards
// actually draw from plus the variation-selector-16 presentation marker.
static_regex!(
    emoji_regex = Regex::new(concat!(
        r"[",
        r"\x{1F300}-\x{1F5FF}",
        r"\x{1F600}-\x{1F64F}",
        r"\x{1F680}-\x{1F6FF}",
        r"\x{1F700}-\x{1F77F}",
        r"\x{1F780}-\x{1F7FF}",
        r"\x{1F800}-\x{1F8FF}",
        r"\x{1F900}-\x{1F9FF}",
        r"\x{1FA00}-\x{1FA6F}",
        r"\x{1FA70}-\x{1FAFF}",
        r"\x{2600}-\x{26FF}",
        r"\x{2700}-\x{27BF}",
        r"\x{2300}-\x{23FF}",
        r"\x{2B00}-\x{2BFF}",
        r"\x{1F1E6}-\x{1F1FF}",
        r"\x{FE0F}",
        r"]",
    ))
    .unwrap()
);

const TRIM_CHARS: &[char] = &['.', ',', '!', '?', '-', ':', ';', '(', ')', '#'];
const MIN_TOKEN_LEN: usize = 3;

/// Lowercase, emoji-strip, punctuation-trim, ignored-token filter, length
/// floor — in that fixed order (§4.1). `ignored_words` is matched
/// case-insensitively; callers are expected to have lowercased it already via
/// `Dictionary`.
pub fn tokenize(text: &str, ignored_words: &[String]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();

    for raw in text.split_whitespace() {
        let stripped = emoji_regex().replace_all(raw, "");
        let trimmed = stripped.trim_matches(TRIM_CHARS);
        if trimmed.is_empty() {
            continue;
        }

        let lowered = trimmed.to_lowercase();

        if lowered.chars().count() < MIN_TOKEN_LEN {
            continue;
        }

        if ignored_words.iter().any(|w| w.eq_ignore_ascii_case(&lowered) || w == &lowered) {
            continue;
        }

        *counts.entry(lowered).or_insert(0) += 1;
    }

    counts
}

/// Lowercase + emoji-strip only, used by the stop-phrase substring check
/// (§4.5.2 step 3), which needs a normalized haystack rather than a token
/// bag.
pub fn normalize_for_substring_match(text: &str) -> String {
    let stripped = emoji_regex().replace_all(text, "");
    stripped.to_lowercase()
}

/// Count of emoji grapheme clusters in `text` (§4.1, used by the emoji-count
/// check in the Detector).
pub fn count_emoji(text: &str) -> usize {
    emoji_regex().find_iter(text).count()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn filters_short_tokens() {
        let counts = tokenize("a bb ccc dddd", &[]);
        assert_eq!(counts.get("ccc"), Some(&1));
        assert_eq!(counts.get("dddd"), Some(&1));
        assert_eq!(counts.get("a"), None);
        assert_eq!(counts.get("bb"), None);
    }

    #[test]
    fn trims_punctuation() {
        let counts = tokenize("hello, world! (foo) #bar", &[]);
        assert_eq!(counts.get("hello"), Some(&1));
        assert_eq!(counts.get("world"), Some(&1));
        assert_eq!(counts.get("foo"), Some(&1));
        assert_eq!(counts.get("bar"), Some(&1));
    }

    #[test]
    fn strips_emoji() {
        let counts = tokenize("win😁now 🐶🍕", &[]);
        assert_eq!(counts.get("winnow"), Some(&1));
    }

    #[test]
    fn drops_ignored_words() {
        let ignored = vec!["lottery".to_owned()];
        let counts = tokenize("win the LOTTERY today", &ignored);
        assert_eq!(counts.get("lottery"), None);
        assert_eq!(counts.get("today"), Some(&1));
    }

    #[test]
    fn lowercases() {
        let counts = tokenize("WIN FREE STUFF", &[]);
        assert_eq!(counts.get("win"), Some(&1));
        assert_eq!(counts.get("free"), Some(&1));
        assert_eq!(counts.get("stuff"), Some(&1));
    }

    #[test]
    fn counts_emoji() {
        assert_eq!(count_emoji("😁🐶🍕"), 3);
        assert_eq!(count_emoji("no emoji here"), 0);
    }
}
