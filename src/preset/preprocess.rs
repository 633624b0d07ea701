//! Text preprocessing for embedding generation.
//!
//! Prepares preset query text for the embedding provider:
//! 1. Trim whitespace
//! 2. Reject if empty
//! 3. Truncate to max length with ellipsis

/// Maximum content length for embedding input (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Words too common to carry meaning for token-based embeddings.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "as", "and", "or", "but", "not", "no", "so", "if", "then",
];

/// Preprocess query text for embedding generation.
///
/// Returns `None` if the text is empty after trimming.
pub fn preprocess_query(text: &str) -> Option<String> {
    let text = text.trim();

    if text.is_empty() {
        return None;
    }

    Some(truncate_content(text))
}

/// Truncate content to MAX_CONTENT_LENGTH characters, adding ellipsis if truncated.
fn truncate_content(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Tokenize text into lowercase terms.
/// Filters out single-character terms and common stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_returns_none() {
        assert!(preprocess_query("").is_none());
        assert!(preprocess_query("   ").is_none());
        assert!(preprocess_query("\n\t ").is_none());
    }

    #[test]
    fn test_text_is_trimmed() {
        assert_eq!(
            preprocess_query("  show total sales \n"),
            Some("show total sales".to_string())
        );
    }

    #[test]
    fn test_long_text_truncated() {
        let long = "x".repeat(1000);
        let result = preprocess_query(&long).unwrap();

        assert_eq!(result.chars().count(), MAX_CONTENT_LENGTH);
        assert!(result.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn test_truncation_respects_utf8() {
        let long = "销售额".repeat(300);
        let result = preprocess_query(&long).unwrap();

        assert_eq!(result.chars().count(), MAX_CONTENT_LENGTH);
    }

    #[test]
    fn test_tokenize_drops_stop_words_and_short_terms() {
        let tokens = tokenize("Show the total of Sales, a b c!");
        assert_eq!(tokens, vec!["show", "total", "sales"]);
    }

    #[test]
    fn test_tokenize_keeps_non_ascii() {
        let tokens = tokenize("近7天 销售额");
        assert_eq!(tokens, vec!["近7天", "销售额"]);
    }
}
