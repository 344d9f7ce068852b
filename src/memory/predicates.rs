//! Predicate inference for facts stored with multiple entities.
//!
//! The content is scanned case-insensitively against an ordered pattern
//! list; the first match wins. Nothing matching falls back to `related_to`.

use regex::RegexSet;
use std::sync::OnceLock;

/// `(pattern, canonical predicate)` in match-priority order.
const PATTERNS: &[(&str, &str)] = &[
    (r"lives|located|resides|based in|moved to", "located_in"),
    (r"works (at|for)|employed (at|by)", "works_at"),
    (r"likes|loves|enjoys|prefers", "prefers"),
    (r"hates|dislikes|avoids", "dislikes"),
    (r"is a|is an|is the", "is_a"),
    (r"has|owns|possesses", "has"),
    (r"knows|met|friends with", "knows"),
    (r"wants to|plans to|intends to|going to", "wants_to"),
    (r"created|built|made|wrote|authored", "created"),
    (r"uses|utilizes", "uses"),
    (r"visited|went to|traveled to", "visited"),
    (r"learned|studied|knows about", "learned"),
    (r"born in|from", "from"),
    (r"married to|spouse|partner", "married_to"),
    (r"parent|father|mother of", "parent_of"),
    (r"child|son|daughter of", "child_of"),
    (r"member of|part of|belongs to", "member_of"),
    (r"manages|leads|heads", "manages"),
    (r"reports to|supervised by", "reports_to"),
    (r"teaches|mentors|coaches", "teaches"),
];

/// Fallback when no pattern matches.
pub const DEFAULT_PREDICATE: &str = "related_to";

fn pattern_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(PATTERNS.iter().map(|(pattern, _)| format!("(?i){pattern}")))
            .expect("predicate patterns are valid")
    })
}

/// Canonical predicate inferred from note content.
pub fn infer_predicate(content: &str) -> &'static str {
    pattern_set()
        .matches(content)
        .iter()
        .min()
        .map(|index| PATTERNS[index].1)
        .unwrap_or(DEFAULT_PREDICATE)
}
