use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

const SEARCH_TRIGGER_PATTERNS: [&str; 6] = [
    r"(?i)\b(today|yesterday|this (week|month|year)|right now|currently|latest|recent|newest)\b",
    r"(?i)\b(breaking|just announced|just released|as of \d{4})\b",
    r"(?i)\b(what('s| is| are) the? (current|latest|newest|price|score|weather))\b",
    r"(?i)\b(news about|update on|what happened (to|with|at)|who won|who is the current)\b",
    r"\b(20(24|25|26))\b",
    r"(?i)\b(stock price|weather forecast|election results|release date)\b",
];

fn search_triggers() -> &'static [Regex] {
    static TRIGGERS: OnceLock<Vec<Regex>> = OnceLock::new();
    TRIGGERS.get_or_init(|| {
        SEARCH_TRIGGER_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn url_pattern() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"https?://[^\s)>,"'\]]+"#).ok())
        .as_ref()
}

/// True when the text looks like it needs fresh information.
pub fn needs_search(text: &str) -> bool {
    search_triggers().iter().any(|re| re.is_match(text))
}

/// URLs in order of first appearance, duplicates removed.
pub fn extract_urls(text: &str) -> Vec<String> {
    let Some(re) = url_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ';', ':', '!', '?']))
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

/// Cuts `input` to at most `max_chars` characters.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_trigger_patterns_compile() {
        assert_eq!(search_triggers().len(), SEARCH_TRIGGER_PATTERNS.len());
        assert!(url_pattern().is_some());
    }

    #[test]
    fn freshness_phrases_trigger_search() {
        assert!(needs_search("What's the weather today in Paris?"));
        assert!(needs_search("who won the match"));
        assert!(needs_search("Best laptops 2025"));
        assert!(needs_search("what is the current price of gold"));
        assert!(needs_search("Tesla stock price"));
        assert!(needs_search("LATEST rust release"));
    }

    #[test]
    fn timeless_questions_do_not_trigger() {
        assert!(!needs_search("Explain how a B-tree works"));
        assert!(!needs_search("Summarize https://example.com/a and https://example.org/b"));
        assert!(!needs_search("write a haiku about 1999"));
    }

    #[test]
    fn urls_are_extracted_in_order_without_duplicates() {
        let text = "see https://a.example/x, then (https://b.example/y) and https://a.example/x.";
        assert_eq!(
            extract_urls(text),
            vec!["https://a.example/x".to_string(), "https://b.example/y".to_string()]
        );
    }

    #[test]
    fn url_stops_at_quotes_and_brackets() {
        let urls = extract_urls(r#"["http://x.test/p"] 'https://y.test/q'"#);
        assert_eq!(urls, vec!["http://x.test/p", "https://y.test/q"]);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
