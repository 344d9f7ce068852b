//! Context assembler: gather, score, deduplicate, budget-fill, format.
//!
//! Two operating modes, selected by configuration:
//!
//! - **Session-isolated**: candidates come only from the current session's
//!   working memory and its Tier-1 summaries. No vectors, no graph, no
//!   cross-session tiers.
//! - **Cross-session**: six sources — Tier-3 core (included up-front),
//!   working memory, vector search, graph neighborhoods for entity mentions
//!   in the query, current- and past-session Tier-1, and Tier-2 epochs.
//!
//! Every candidate carries similarity, recency, priority and frequency
//! signals fused into one composite score. Near-duplicates are collapsed by
//! Jaccard similarity before a greedy first-fit pass fills the token budget.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::config::{RankingConfig, TokenBudgets};
use crate::graph::KnowledgeGraph;
use crate::memory::MemoryManager;
use crate::store::{DurableStore, SummaryRow};
use crate::tokens;
use crate::vector_store::{VectorFilter, VectorStore};

/// Vector candidates below this cosine are dropped.
const MIN_VECTOR_SIMILARITY: f32 = 0.3;

/// Recency half-life parameter: one week, in hours.
const RECENCY_DECAY_HOURS: f32 = 168.0;

/// Access count at which the frequency signal saturates.
const FREQUENCY_SATURATION: f32 = 10.0;

/// How many candidates each source may contribute.
const VECTOR_TOP_K: usize = 20;
const CURRENT_SESSION_LIMIT: usize = 5;
const PAST_SESSIONS_LIMIT: usize = 10;
const EPOCH_LIMIT: usize = 5;
const MAX_QUERY_MENTIONS: usize = 5;

/// Shown when nothing survives selection.
const EMPTY_RESULT_GUIDANCE: &str = "No relevant memories found for this query. \
The current session has no stored context yet; use memory_store to capture \
self-contained notes as the conversation progresses.";

/// Filters forwarded to the vector search.
#[derive(Debug, Clone, Default)]
pub struct RetrieveFilters {
    pub memory_types: Option<Vec<String>>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub min_confidence: Option<f32>,
}

impl RetrieveFilters {
    fn to_vector_filter(&self) -> VectorFilter {
        VectorFilter {
            source_types: self.memory_types.clone(),
            after: self.after,
            before: self.before,
            min_confidence: self.min_confidence,
        }
    }
}

/// Assembled context plus accounting metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrieveResult {
    pub text: String,
    pub total_tokens: usize,
    pub budget_used: usize,
    pub budget_remaining: usize,
    /// `(source tag, candidates included)` in inclusion order.
    pub source_counts: Vec<(String, usize)>,
    pub candidates_considered: usize,
    pub candidates_selected: usize,
    pub session_id: Option<String>,
}

/// Candidate source, in fixed section order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Core,
    Working,
    CurrentSession,
    Graph,
    LongTerm,
    PastSessions,
    Vector,
}

impl Source {
    fn tag(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Working => "working",
            Self::CurrentSession => "current_session",
            Self::Graph => "graph",
            Self::LongTerm => "long_term",
            Self::PastSessions => "past_sessions",
            Self::Vector => "vector",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Core => "## Core Memory",
            Self::Working => "## Working Memory",
            Self::CurrentSession => "## Current Session",
            Self::Graph => "## Knowledge Graph",
            Self::LongTerm => "## Long-Term Memory",
            Self::PastSessions => "## Past Sessions",
            Self::Vector => "## Related Memories",
        }
    }

    fn priority(self) -> f32 {
        match self {
            Self::Core => 1.0,
            Self::Working => 0.95,
            Self::CurrentSession => 0.9,
            Self::Graph => 0.8,
            Self::LongTerm => 0.65,
            Self::PastSessions => 0.5,
            Self::Vector => 0.4,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    source: Source,
    text: String,
    tokens: usize,
    similarity: f32,
    recency: f32,
    frequency: f32,
    score: f32,
}

/// `exp(-age_hours / 168)`: one-week half-life curve.
fn recency_of(created_at: &DateTime<Utc>) -> f32 {
    let age_hours = (Utc::now() - *created_at).num_minutes().max(0) as f32 / 60.0;
    (-age_hours / RECENCY_DECAY_HOURS).exp()
}

/// Lowercased whitespace tokens longer than 2 characters.
fn dedup_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|word| word.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity over `dedup_tokens`. Two empty token sets count as
/// identical.
fn text_similarity(a: &str, b: &str) -> f32 {
    let set_a = dedup_tokens(a);
    let set_b = dedup_tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

/// Up to `max` candidate entity mentions: capitalized sequences and quoted
/// substrings, minus common English stopwords.
fn extract_mentions(query: &str, max: usize) -> Vec<String> {
    static CAPITALIZED: OnceLock<Regex> = OnceLock::new();
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let capitalized = CAPITALIZED
        .get_or_init(|| Regex::new(r"[A-Z][a-z]*(?:\s[A-Z][a-z]*)*").expect("valid regex"));
    let quoted = QUOTED.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));

    const STOPWORDS: &[&str] = &[
        "the", "a", "an", "i", "it", "is", "are", "was", "were", "do", "does", "did", "can",
        "could", "will", "would", "should", "what", "when", "where", "who", "whom", "why", "how",
        "this", "that", "these", "those", "my", "your", "our", "their", "his", "her", "its", "we",
        "they", "he", "she", "you", "if", "in", "on", "at", "for", "of", "to", "and", "or", "but",
        "not", "with", "about", "from", "tell", "me", "please", "remember", "recall",
    ];

    let mut mentions = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |mention: &str| {
        let trimmed = mention.trim();
        if trimmed.is_empty() || STOPWORDS.contains(&trimmed.to_lowercase().as_str()) {
            return;
        }
        if seen.insert(trimmed.to_lowercase()) {
            mentions.push(trimmed.to_string());
        }
    };

    for capture in capitalized.find_iter(query) {
        push(capture.as_str());
    }
    for capture in quoted.captures_iter(query) {
        push(&capture[1]);
    }

    mentions.truncate(max);
    mentions
}

/// Budget-aware context assembler.
pub struct ContextAssembler {
    store: DurableStore,
    vectors: Arc<VectorStore>,
    graph: Arc<KnowledgeGraph>,
    manager: Arc<MemoryManager>,
    budgets: TokenBudgets,
    ranking: RankingConfig,
    cross_session: bool,
}

impl ContextAssembler {
    pub fn new(
        store: DurableStore,
        vectors: Arc<VectorStore>,
        graph: Arc<KnowledgeGraph>,
        manager: Arc<MemoryManager>,
        budgets: TokenBudgets,
        ranking: RankingConfig,
        cross_session: bool,
    ) -> Self {
        Self {
            store,
            vectors,
            graph,
            manager,
            budgets,
            ranking,
            cross_session,
        }
    }

    fn score(&self, candidate: &mut Candidate) {
        candidate.score = self.ranking.semantic_weight * candidate.similarity
            + self.ranking.recency_weight * candidate.recency
            + self.ranking.priority_weight * candidate.source.priority()
            + self.ranking.frequency_weight * candidate.frequency;
    }

    fn frequency_of(&self, memory_id: &str) -> f32 {
        let accesses = self.store.access_count(memory_id).unwrap_or(0) as f32;
        (accesses / FREQUENCY_SATURATION).min(1.0)
    }

    fn summary_candidate(&self, summary: &SummaryRow, source: Source, similarity: f32) -> Candidate {
        Candidate {
            id: summary.id.clone(),
            source,
            text: summary.content.clone(),
            tokens: summary.token_count,
            similarity,
            recency: recency_of(&summary.created_at),
            frequency: self.frequency_of(&summary.id),
            score: 0.0,
        }
    }

    fn working_candidate(&self, session_id: Option<&str>) -> Option<Candidate> {
        let entries = self.manager.working_entries(session_id);
        if entries.is_empty() {
            return None;
        }
        let text: String = entries
            .iter()
            .map(|entry| entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let tokens = tokens::count(&text);
        Some(Candidate {
            id: "working".to_string(),
            source: Source::Working,
            tokens,
            text,
            similarity: 0.6,
            recency: 1.0,
            frequency: 1.0,
            score: 0.0,
        })
    }

    /// Session-isolated gathering: working memory plus this session's
    /// Tier-1 summaries, nothing else.
    fn gather_session_only(&self, session_id: Option<&str>) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        if let Some(working) = self.working_candidate(session_id) {
            candidates.push(working);
        }
        if let Some(session) = session_id {
            for summary in self.store.summaries_for_session(1, session, None)? {
                candidates.push(self.summary_candidate(&summary, Source::CurrentSession, 0.6));
            }
        }
        Ok(candidates)
    }

    /// Cross-session gathering over the five scored sources (core is handled
    /// separately by the budget fill).
    fn gather_cross_session(
        &self,
        query: &str,
        filters: &RetrieveFilters,
        session_id: Option<&str>,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        if let Some(working) = self.working_candidate(session_id) {
            candidates.push(working);
        }

        // Vector search is best-effort: an error shrinks the candidate list.
        match self
            .vectors
            .search(query, VECTOR_TOP_K, &filters.to_vector_filter())
        {
            Ok(hits) => {
                for hit in hits {
                    if hit.similarity < MIN_VECTOR_SIMILARITY {
                        continue;
                    }
                    let tokens = tokens::count(&hit.row.content_preview);
                    candidates.push(Candidate {
                        id: hit.row.source_id.clone(),
                        source: Source::Vector,
                        text: hit.row.content_preview.clone(),
                        tokens,
                        similarity: hit.similarity,
                        recency: recency_of(&hit.row.created_at),
                        frequency: self.frequency_of(&hit.row.source_id),
                        score: 0.0,
                    });
                }
            }
            Err(e) => tracing::warn!("Vector search failed, skipping stage: {e:#}"),
        }

        // Graph neighborhoods for entity mentions in the query, one candidate.
        let mut graph_blocks = Vec::new();
        for mention in extract_mentions(query, MAX_QUERY_MENTIONS) {
            match self.graph.query_entity(&mention, 2) {
                Ok(Some(result)) => {
                    let _ = self
                        .store
                        .log_access(&result.entity.id, "entity", &Utc::now());
                    graph_blocks.push(result.text);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Graph lookup failed for '{mention}': {e:#}"),
            }
        }
        if !graph_blocks.is_empty() {
            let text = graph_blocks.join("\n\n");
            let tokens = tokens::count(&text);
            candidates.push(Candidate {
                id: "graph".to_string(),
                source: Source::Graph,
                text,
                tokens,
                similarity: 0.7,
                recency: 1.0,
                frequency: 0.5,
                score: 0.0,
            });
        }

        match session_id {
            Some(session) => {
                for summary in
                    self.store
                        .summaries_for_session(1, session, Some(CURRENT_SESSION_LIMIT))?
                {
                    candidates.push(self.summary_candidate(&summary, Source::CurrentSession, 0.6));
                }
                for summary in
                    self.store
                        .summaries_excluding_session(1, session, Some(PAST_SESSIONS_LIMIT))?
                {
                    candidates.push(self.summary_candidate(&summary, Source::PastSessions, 0.5));
                }
            }
            None => {
                for summary in self.store.summaries_at_tier(1, Some(PAST_SESSIONS_LIMIT))? {
                    candidates.push(self.summary_candidate(&summary, Source::PastSessions, 0.5));
                }
            }
        }

        for summary in self.store.summaries_at_tier(2, Some(EPOCH_LIMIT))? {
            candidates.push(self.summary_candidate(&summary, Source::LongTerm, 0.4));
        }

        Ok(candidates)
    }

    /// Collapse near-duplicates: iterate in arrival order; when a candidate
    /// matches an already-kept one at or above the threshold, the higher
    /// scored of the two survives in place.
    fn deduplicate(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let threshold = self.ranking.dedup_similarity_threshold;
        let mut kept: Vec<Candidate> = Vec::new();
        'next: for candidate in candidates {
            for existing in kept.iter_mut() {
                if text_similarity(&existing.text, &candidate.text) >= threshold {
                    if candidate.score > existing.score {
                        *existing = candidate;
                    }
                    continue 'next;
                }
            }
            kept.push(candidate);
        }
        kept
    }

    /// Assemble a context block for `query` within `token_budget`.
    pub fn retrieve(
        &self,
        query: &str,
        token_budget: Option<usize>,
        filters: &RetrieveFilters,
        session_id: Option<&str>,
    ) -> Result<RetrieveResult> {
        let budget = token_budget.unwrap_or(self.budgets.default_retrieve_budget);
        let now = Utc::now();

        let mut candidates = if self.cross_session {
            self.gather_cross_session(query, filters, session_id)?
        } else {
            self.gather_session_only(session_id)?
        };
        for candidate in &mut candidates {
            self.score(candidate);
        }
        let mut considered = candidates.len();

        let mut candidates = self.deduplicate(candidates);
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut sections: Vec<(Source, Vec<String>)> = Vec::new();
        let mut source_counts: Vec<(String, usize)> = Vec::new();
        let mut used = 0usize;
        let mut selected = 0usize;

        let mut include = |source: Source, text: String, id: &str| {
            match sections.iter_mut().find(|(s, _)| *s == source) {
                Some((_, texts)) => texts.push(text),
                None => sections.push((source, vec![text])),
            }
            match source_counts.iter_mut().find(|(tag, _)| tag == source.tag()) {
                Some((_, count)) => *count += 1,
                None => source_counts.push((source.tag().to_string(), 1)),
            }
            if let Err(e) = self.store.log_access(id, source.tag(), &now) {
                tracing::warn!("Access log write failed: {e:#}");
            }
        };

        // Core memory first, before budget accounting for the loop, capped by
        // its own tier budget (and never past the retrieve budget).
        if self.cross_session {
            let mut tier3 = self.store.summaries_at_tier(3, None)?;
            if !tier3.is_empty() {
                tier3.reverse(); // oldest first
                considered += 1;
                let combined: String = tier3
                    .iter()
                    .map(|summary| summary.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                let cap = self.budgets.tier3_core.min(budget);
                let (core_text, core_tokens) = tokens::truncate(&combined, cap);
                if core_tokens > 0 {
                    used += core_tokens;
                    selected += 1;
                    include(Source::Core, core_text, &tier3[0].id);
                }
            }
        }

        // Greedy first-fit in score order.
        for candidate in &candidates {
            if candidate.tokens <= budget.saturating_sub(used) {
                used += candidate.tokens;
                selected += 1;
                include(candidate.source, candidate.text.clone(), &candidate.id);
            }
        }

        // Fixed section order regardless of inclusion order.
        const SECTION_ORDER: [Source; 7] = [
            Source::Core,
            Source::Working,
            Source::CurrentSession,
            Source::Graph,
            Source::LongTerm,
            Source::PastSessions,
            Source::Vector,
        ];
        let mut blocks = Vec::new();
        for source in SECTION_ORDER {
            if let Some((_, texts)) = sections.iter().find(|(s, _)| *s == source) {
                blocks.push(format!("{}\n{}", source.label(), texts.join("\n")));
            }
        }

        let session_prefix = session_id
            .map(|session| {
                let prefix: String = session.chars().take(8).collect();
                prefix
            })
            .unwrap_or_else(|| "none".to_string());
        let sources_line = source_counts
            .iter()
            .map(|(tag, count)| format!("{tag}:{count}"))
            .collect::<Vec<_>>()
            .join(", ");
        let footer =
            format!("--- Session: {session_prefix} | Sources: {sources_line} | Tokens: {used}/{budget} ---");

        let text = if selected == 0 {
            format!("{EMPTY_RESULT_GUIDANCE}\n\n{footer}")
        } else {
            format!("{}\n\n{footer}", blocks.join("\n\n"))
        };

        Ok(RetrieveResult {
            text,
            total_tokens: used,
            budget_used: used,
            budget_remaining: budget.saturating_sub(used),
            source_counts,
            candidates_considered: considered,
            candidates_selected: selected,
            session_id: session_id.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_decays_with_age() {
        let fresh = recency_of(&Utc::now());
        assert!(fresh > 0.99);
        let old = recency_of(&(Utc::now() - chrono::Duration::hours(168)));
        assert!((old - (-1.0f32).exp()).abs() < 0.01);
    }

    #[test]
    fn text_similarity_ignores_short_words() {
        // "a", "of" and "in" fall out of the token sets
        let a = "the cat sat on a mat of straw in peace";
        let b = "the cat sat on the mat of straw in peace";
        assert!(text_similarity(a, b) > 0.9);
    }

    #[test]
    fn text_similarity_is_symmetric() {
        let a = "user prefers dark mode themes";
        let b = "user prefers light mode themes";
        assert!((text_similarity(a, b) - text_similarity(b, a)).abs() < f32::EPSILON);
    }

    #[test]
    fn identical_empty_token_sets_are_duplicates() {
        assert_eq!(text_similarity("a b c", "x y z"), 1.0);
    }

    #[test]
    fn extract_mentions_finds_capitalized_and_quoted() {
        let mentions = extract_mentions(r#"What did Alice say about "the beta rollout" in Paris?"#, 5);
        assert!(mentions.contains(&"Alice".to_string()));
        assert!(mentions.contains(&"Paris".to_string()));
        assert!(mentions.contains(&"the beta rollout".to_string()));
    }

    #[test]
    fn extract_mentions_drops_stopwords() {
        let mentions = extract_mentions("What is The Answer", 5);
        assert!(!mentions.iter().any(|m| m.eq_ignore_ascii_case("what")));
        assert!(!mentions.iter().any(|m| m.eq_ignore_ascii_case("the")));
    }

    #[test]
    fn extract_mentions_caps_count() {
        let mentions = extract_mentions("Alice Bob Carol Dave Erin Frank Grace", 5);
        assert!(mentions.len() <= 5);
    }

    #[test]
    fn multi_word_capitalized_sequences_stay_together() {
        let mentions = extract_mentions("Did Ada Lovelace meet Charles Babbage?", 5);
        assert!(mentions.contains(&"Ada Lovelace".to_string()));
        assert!(mentions.contains(&"Charles Babbage".to_string()));
    }
}
