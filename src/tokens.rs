//! Token accounting for budget math.
//!
//! Single source of truth for token counts across the engine. Every component
//! that writes a `token_count` column or fills a retrieval budget goes through
//! this module, so counts are comparable everywhere.
//!
//! The tokenization is a deterministic approximation of a BPE vocabulary:
//! alphanumeric runs are split into chunks of at most four characters, and
//! each punctuation/symbol character is its own token. Whitespace is free.
//! The exact segmentation matters less than the fact that it is stable and
//! used consistently.

/// Characters per chunk when splitting an alphanumeric run.
const CHARS_PER_CHUNK: usize = 4;

/// Byte offsets of token ends in `text`, in order.
fn token_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut run_len = 0usize;

    for (idx, ch) in text.char_indices() {
        let end = idx + ch.len_utf8();
        if ch.is_whitespace() {
            if run_len > 0 {
                run_len = 0;
            }
            continue;
        }
        if ch.is_alphanumeric() {
            run_len += 1;
            if run_len == 1 {
                ends.push(end);
            } else if let Some(last) = ends.last_mut() {
                *last = end;
            }
            if run_len == CHARS_PER_CHUNK {
                run_len = 0;
            }
        } else {
            run_len = 0;
            ends.push(end);
        }
    }

    ends
}

/// Number of tokens in `text`.
pub fn count(text: &str) -> usize {
    token_ends(text).len()
}

/// Longest prefix of `text` whose token count is at most `budget`,
/// together with that count.
///
/// May return fewer than `budget` tokens when the text is short.
pub fn truncate(text: &str, budget: usize) -> (String, usize) {
    let ends = token_ends(text);
    if ends.len() <= budget {
        return (text.to_string(), ends.len());
    }
    if budget == 0 {
        return (String::new(), 0);
    }
    let cut = ends[budget - 1];
    (text[..cut].to_string(), budget)
}

/// Cheap character-based lower envelope: ⌈len/4⌉.
///
/// Only a fast gate for callers; never written to a row.
pub fn estimate(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(count(""), 0);
        assert_eq!(count("   \n\t"), 0);
    }

    #[test]
    fn short_words_are_one_token() {
        assert_eq!(count("one two ten"), 3);
    }

    #[test]
    fn long_words_split_into_chunks() {
        // "configuration" = 13 chars -> 4 chunks
        assert_eq!(count("configuration"), 4);
    }

    #[test]
    fn punctuation_is_counted_separately() {
        assert_eq!(count("ten."), 2);
        assert_eq!(count("a, b"), 3);
    }

    #[test]
    fn truncate_respects_budget() {
        let text = "one two three four five six seven eight nine ten";
        let total = count(text);
        for budget in 0..=total + 2 {
            let (prefix, n) = truncate(text, budget);
            assert!(n <= budget.min(total));
            assert_eq!(count(&prefix), n);
            assert!(text.starts_with(&prefix));
        }
    }

    #[test]
    fn truncate_returns_whole_text_under_budget() {
        let (text, n) = truncate("short note", 100);
        assert_eq!(text, "short note");
        assert_eq!(n, 2);
    }

    #[test]
    fn estimate_is_ceil_len_over_four() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("abcd"), 1);
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn count_is_deterministic() {
        let text = "User prefers dark mode with #0a0e27 base and #6c63ff accents.";
        assert_eq!(count(text), count(text));
    }
}
