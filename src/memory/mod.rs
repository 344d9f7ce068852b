//! Memory manager: tiered store-and-route, compression, and forgetting.
//!
//! Owns the in-memory Tier-0 working buffer and routes incoming notes by
//! declared kind:
//!
//! | kind       | tier | graph side-effect                        |
//! |------------|------|------------------------------------------|
//! | core       | 3    | none                                     |
//! | fact       | 1    | entities + inferred-predicate facts      |
//! | preference | 2    | `User → prefers → entity` facts          |
//! | event      | 0    | entities only                            |
//! | summary    | 1    | none                                     |
//!
//! Vector indexing is best-effort everywhere: a failure is logged and the
//! tier write still succeeds.

pub mod predicates;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{CompressionConfig, TokenBudgets};
use crate::graph::KnowledgeGraph;
use crate::store::{DurableStore, SummaryRow};
use crate::tokens;
use crate::vector_store::VectorStore;

/// Extra tokens charged when a summary is deprecated in place.
const DEPRECATION_TOKEN_PADDING: usize = 15;

/// Declared kind of an incoming note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Core,
    Fact,
    Preference,
    Event,
    Summary,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Event => "event",
            Self::Summary => "summary",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "core" => Ok(Self::Core),
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "event" => Ok(Self::Event),
            "summary" => Ok(Self::Summary),
            other => Err(format!(
                "unknown kind '{other}' (expected fact, preference, event, summary or core)"
            )),
        }
    }
}

/// Requested forget action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetAction {
    Deprecate,
    Correct,
    Delete,
}

impl FromStr for ForgetAction {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "deprecate" => Ok(Self::Deprecate),
            "correct" => Ok(Self::Correct),
            "delete" => Ok(Self::Delete),
            other => Err(format!(
                "unknown action '{other}' (expected deprecate, correct or delete)"
            )),
        }
    }
}

/// Manual compression scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressScope {
    Working,
    Session,
    Epoch,
}

impl FromStr for CompressScope {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "working" => Ok(Self::Working),
            "session" => Ok(Self::Session),
            "epoch" => Ok(Self::Epoch),
            other => Err(format!(
                "unknown scope '{other}' (expected working, session or epoch)"
            )),
        }
    }
}

/// Ephemeral Tier-0 record. Lives only in process memory.
#[derive(Debug, Clone)]
pub struct WorkingEntry {
    pub id: String,
    pub content: String,
    pub token_count: usize,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
}

/// Result of a `store` call.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    pub memory_id: String,
    pub tier: u8,
    pub entities_created: Vec<String>,
    pub facts_stored: usize,
    pub vector_id: Option<String>,
    pub session_id: Option<String>,
}

/// Per-tier counts and token totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStatus {
    pub count: usize,
    pub token_estimate: usize,
}

/// Snapshot returned by `memory_status`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub tier0: TierStatus,
    pub tier1: TierStatus,
    pub tier2: TierStatus,
    pub tier3: TierStatus,
    pub graph_entities: usize,
    pub graph_relations: usize,
    pub vector_count: usize,
    pub session_id: Option<String>,
}

/// Tiered memory manager.
pub struct MemoryManager {
    store: DurableStore,
    vectors: Arc<VectorStore>,
    graph: Arc<KnowledgeGraph>,
    budgets: TokenBudgets,
    compression: CompressionConfig,
    working: RwLock<Vec<WorkingEntry>>,
}

impl MemoryManager {
    pub fn new(
        store: DurableStore,
        vectors: Arc<VectorStore>,
        graph: Arc<KnowledgeGraph>,
        budgets: TokenBudgets,
        compression: CompressionConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            graph,
            budgets,
            compression,
            working: RwLock::new(Vec::new()),
        }
    }

    fn write_summary(
        &self,
        tier: u8,
        content: &str,
        token_count: usize,
        session_id: Option<&str>,
        source_ids: Vec<String>,
        metadata: serde_json::Value,
    ) -> Result<SummaryRow> {
        let now = Utc::now();
        let summary = SummaryRow {
            id: Uuid::new_v4().to_string(),
            tier,
            content: content.to_string(),
            token_count,
            created_at: now,
            updated_at: now,
            session_id: session_id.map(str::to_string),
            source_ids,
            metadata,
        };
        self.store.insert_summary(&summary)?;
        Ok(summary)
    }

    /// Index a memory as a vector, swallowing failures.
    fn index_vector(
        &self,
        source_id: &str,
        source_type: &str,
        content: &str,
        confidence: f32,
    ) -> Option<String> {
        match self
            .vectors
            .add(source_id, source_type, content, confidence, serde_json::json!({}))
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Vector indexing failed for {source_id}: {e:#}");
                None
            }
        }
    }

    /// Classify a note by kind and route it to its tier, the graph, and the
    /// vector index.
    pub fn store(
        &self,
        content: &str,
        kind: MemoryKind,
        confidence: f32,
        entities: &[String],
        session_id: Option<&str>,
    ) -> Result<StoreOutcome> {
        let token_count = tokens::count(content);
        let mut entities_created = Vec::new();
        let mut facts_stored = 0usize;

        let mut ensure = |label: &str| -> Result<()> {
            let (_, created) = self.graph.ensure_entity(label, None, None, confidence, None)?;
            if created {
                entities_created.push(label.to_string());
            }
            Ok(())
        };

        let (memory_id, tier, vector_id) = match kind {
            MemoryKind::Event => {
                let entry = WorkingEntry {
                    id: Uuid::new_v4().to_string(),
                    content: content.to_string(),
                    token_count,
                    timestamp: Utc::now(),
                    session_id: session_id.map(str::to_string),
                };
                for label in entities {
                    ensure(label)?;
                }
                let vector_id = self.index_vector(&entry.id, "event", content, confidence);
                let id = entry.id.clone();
                self.working.write().push(entry);
                self.maybe_compress_overflow(session_id)?;
                (id, 0u8, vector_id)
            }
            MemoryKind::Fact => {
                let summary = self.write_summary(
                    1,
                    content,
                    token_count,
                    session_id,
                    vec![],
                    serde_json::json!({ "type": "fact" }),
                )?;
                for label in entities {
                    ensure(label)?;
                }
                if entities.len() >= 2 {
                    let predicate = predicates::infer_predicate(content);
                    for object in &entities[1..] {
                        self.graph.store_fact(
                            &entities[0],
                            predicate,
                            object,
                            confidence,
                            Some(&summary.id),
                        )?;
                        facts_stored += 1;
                    }
                }
                let vector_id = self.index_vector(&summary.id, "fact", content, confidence);
                (summary.id, 1, vector_id)
            }
            MemoryKind::Preference => {
                let summary = self.write_summary(
                    2,
                    content,
                    token_count,
                    session_id,
                    vec![],
                    serde_json::json!({ "type": "preference" }),
                )?;
                ensure("User")?;
                for label in entities {
                    ensure(label)?;
                    self.graph
                        .store_fact("User", "prefers", label, confidence, Some(&summary.id))?;
                    facts_stored += 1;
                }
                let vector_id = self.index_vector(&summary.id, "preference", content, confidence);
                (summary.id, 2, vector_id)
            }
            MemoryKind::Summary => {
                let summary = self.write_summary(
                    1,
                    content,
                    token_count,
                    session_id,
                    vec![],
                    serde_json::json!({ "type": "summary" }),
                )?;
                let vector_id = self.index_vector(&summary.id, "summary", content, confidence);
                (summary.id, 1, vector_id)
            }
            MemoryKind::Core => {
                let summary = self.write_summary(
                    3,
                    content,
                    token_count,
                    session_id,
                    vec![],
                    serde_json::json!({ "type": "core" }),
                )?;
                let vector_id = self.index_vector(&summary.id, "core", content, confidence);
                (summary.id, 3, vector_id)
            }
        };

        Ok(StoreOutcome {
            memory_id,
            tier,
            entities_created,
            facts_stored,
            vector_id,
            session_id: session_id.map(str::to_string),
        })
    }

    /// Auto-compress the oldest half of the current session's working buffer
    /// when its token total exceeds the overflow threshold. Runs at most
    /// once per insert.
    fn maybe_compress_overflow(&self, session_id: Option<&str>) -> Result<()> {
        let threshold = self.compression.tier0_overflow_threshold;
        let consumed: Vec<WorkingEntry> = {
            let working = self.working.read();
            let in_session: Vec<&WorkingEntry> = working
                .iter()
                .filter(|entry| entry.session_id.as_deref() == session_id)
                .collect();
            let total: usize = in_session.iter().map(|entry| entry.token_count).sum();
            if total <= threshold {
                return Ok(());
            }
            let half = (in_session.len() / 2).max(1);
            in_session[..half].iter().map(|&entry| entry.clone()).collect()
        };

        let original_tokens: usize = consumed.iter().map(|entry| entry.token_count).sum();
        let combined: String = consumed
            .iter()
            .map(|entry| entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let (compressed, compressed_tokens) =
            tokens::truncate(&combined, self.budgets.tier1_session);

        let summary = self.write_summary(
            1,
            &compressed,
            compressed_tokens,
            session_id,
            consumed.iter().map(|entry| entry.id.clone()).collect(),
            serde_json::json!({
                "type": "auto_compressed",
                "originalCount": consumed.len(),
                "originalTokens": original_tokens,
            }),
        )?;
        self.index_vector(&summary.id, "summary", &compressed, 1.0);

        let consumed_ids: Vec<&str> = consumed.iter().map(|entry| entry.id.as_str()).collect();
        self.working
            .write()
            .retain(|entry| !consumed_ids.contains(&entry.id.as_str()));

        tracing::debug!(
            "Auto-compressed {} working entries ({original_tokens} tokens) into {}",
            consumed.len(),
            summary.id
        );
        Ok(())
    }

    /// Manual compression. Returns a human-readable report.
    pub fn compress(&self, scope: CompressScope, session_id: Option<&str>) -> Result<String> {
        match scope {
            CompressScope::Working => self.compress_working(session_id),
            CompressScope::Session => self.compress_session(session_id),
            CompressScope::Epoch => self.compress_epoch(session_id),
        }
    }

    fn compress_working(&self, session_id: Option<&str>) -> Result<String> {
        let consumed: Vec<WorkingEntry> = self
            .working
            .read()
            .iter()
            .filter(|entry| entry.session_id.as_deref() == session_id)
            .cloned()
            .collect();
        if consumed.is_empty() {
            return Ok("No working memory to compress.".to_string());
        }

        let original_tokens: usize = consumed.iter().map(|entry| entry.token_count).sum();
        let combined: String = consumed
            .iter()
            .map(|entry| entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let (compressed, compressed_tokens) =
            tokens::truncate(&combined, self.budgets.tier1_session);

        let summary = self.write_summary(
            1,
            &compressed,
            compressed_tokens,
            session_id,
            consumed.iter().map(|entry| entry.id.clone()).collect(),
            serde_json::json!({
                "type": "manual_compressed",
                "originalCount": consumed.len(),
                "originalTokens": original_tokens,
            }),
        )?;
        self.index_vector(&summary.id, "summary", &compressed, 1.0);

        let consumed_ids: Vec<&str> = consumed.iter().map(|entry| entry.id.as_str()).collect();
        self.working
            .write()
            .retain(|entry| !consumed_ids.contains(&entry.id.as_str()));

        let ratio = original_tokens as f32 / compressed_tokens.max(1) as f32;
        Ok(format!(
            "Compressed {} working entries into a session summary: {} tokens → {} tokens ({:.1}x).",
            consumed.len(),
            original_tokens,
            compressed_tokens,
            ratio
        ))
    }

    fn compress_session(&self, session_id: Option<&str>) -> Result<String> {
        let mut tier1 = self.store.summaries_at_tier(1, None)?;
        if tier1.len() < 2 {
            return Ok(
                "Not enough Tier-1 summaries to consolidate (need at least 2).".to_string()
            );
        }
        tier1.reverse(); // oldest first

        let original_tokens: usize = tier1.iter().map(|summary| summary.token_count).sum();
        let combined: String = tier1
            .iter()
            .map(|summary| summary.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let (compressed, compressed_tokens) =
            tokens::truncate(&combined, self.budgets.tier1_session * 2);

        let summary = self.write_summary(
            1,
            &compressed,
            compressed_tokens,
            session_id,
            tier1.iter().map(|summary| summary.id.clone()).collect(),
            serde_json::json!({
                "type": "session_consolidated",
                "originalCount": tier1.len(),
                "originalTokens": original_tokens,
            }),
        )?;
        self.index_vector(&summary.id, "summary", &compressed, 1.0);

        for old in &tier1 {
            self.vectors.delete_by_source(&old.id)?;
            self.store.delete_summary(&old.id)?;
        }

        Ok(format!(
            "Consolidated {} Tier-1 summaries into one: {} tokens → {} tokens.",
            tier1.len(),
            original_tokens,
            compressed_tokens
        ))
    }

    fn compress_epoch(&self, session_id: Option<&str>) -> Result<String> {
        let needed = self.compression.tier1_consolidation_count;
        let mut tier1 = self.store.summaries_at_tier(1, None)?;
        if tier1.len() < needed {
            return Ok(format!(
                "Need at least {needed} Tier-1 summaries for an epoch consolidation (have {}).",
                tier1.len()
            ));
        }
        tier1.reverse();

        let original_tokens: usize = tier1.iter().map(|summary| summary.token_count).sum();
        let combined: String = tier1
            .iter()
            .map(|summary| summary.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let (compressed, compressed_tokens) =
            tokens::truncate(&combined, self.budgets.tier2_epoch);

        let summary = self.write_summary(
            2,
            &compressed,
            compressed_tokens,
            session_id,
            tier1.iter().map(|summary| summary.id.clone()).collect(),
            serde_json::json!({
                "type": "epoch_consolidated",
                "originalCount": tier1.len(),
                "originalTokens": original_tokens,
            }),
        )?;
        self.index_vector(&summary.id, "summary", &compressed, 1.0);

        for old in &tier1 {
            self.vectors.delete_by_source(&old.id)?;
            self.store.delete_summary(&old.id)?;
        }

        Ok(format!(
            "Consolidated {} Tier-1 summaries into an epoch summary: {} tokens → {} tokens.",
            tier1.len(),
            original_tokens,
            compressed_tokens
        ))
    }

    /// Forget a memory by id. The graph is never altered here.
    pub fn forget(
        &self,
        memory_id: &str,
        action: ForgetAction,
        correction: Option<&str>,
    ) -> Result<String> {
        if let Some(summary) = self.store.summary_by_id(memory_id)? {
            return match action {
                ForgetAction::Delete => {
                    self.vectors.delete_by_source(memory_id)?;
                    self.store.delete_summary(memory_id)?;
                    Ok(format!("Deleted memory {memory_id} and its vectors."))
                }
                ForgetAction::Deprecate => {
                    let content = format!("[DEPRECATED] {}", summary.content);
                    self.store.update_summary_content(
                        memory_id,
                        &content,
                        summary.token_count + DEPRECATION_TOKEN_PADDING,
                        &Utc::now(),
                    )?;
                    Ok(format!("Deprecated memory {memory_id}."))
                }
                ForgetAction::Correct => {
                    let correction = correction
                        .ok_or_else(|| anyhow::anyhow!("correct requires a correction text"))?;
                    let token_count = tokens::count(correction);
                    self.store.update_summary_content(
                        memory_id,
                        correction,
                        token_count,
                        &Utc::now(),
                    )?;
                    self.vectors.delete_by_source(memory_id)?;
                    let source_type = summary
                        .metadata
                        .get("type")
                        .and_then(|value| value.as_str())
                        .unwrap_or("summary")
                        .to_string();
                    self.index_vector(memory_id, &source_type, correction, 1.0);
                    Ok(format!(
                        "Corrected memory {memory_id} ({} → {} tokens).",
                        summary.token_count, token_count
                    ))
                }
            };
        }

        let position = self
            .working
            .read()
            .iter()
            .position(|entry| entry.id == memory_id);
        if let Some(index) = position {
            return match action {
                ForgetAction::Delete => {
                    self.working.write().remove(index);
                    self.vectors.delete_by_source(memory_id)?;
                    Ok(format!("Deleted working entry {memory_id}."))
                }
                ForgetAction::Correct => {
                    let correction = correction
                        .ok_or_else(|| anyhow::anyhow!("correct requires a correction text"))?;
                    {
                        let mut working = self.working.write();
                        if let Some(entry) = working.get_mut(index) {
                            entry.content = correction.to_string();
                            entry.token_count = tokens::count(correction);
                        }
                    }
                    self.vectors.delete_by_source(memory_id)?;
                    self.index_vector(memory_id, "event", correction, 1.0);
                    Ok(format!("Corrected working entry {memory_id}."))
                }
                ForgetAction::Deprecate => Ok(format!(
                    "Deprecate is not supported for working entries; {memory_id} left unchanged."
                )),
            };
        }

        Ok(format!("No memory found with id {memory_id}."))
    }

    /// Archive a session's working entries as a Tier-1 summary.
    ///
    /// Returns `None` when the session has no working entries; otherwise a
    /// one-line report.
    pub fn archive_working(&self, session_id: &str) -> Result<Option<String>> {
        let consumed: Vec<WorkingEntry> = self
            .working
            .read()
            .iter()
            .filter(|entry| entry.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect();
        if consumed.is_empty() {
            return Ok(None);
        }

        let original_tokens: usize = consumed.iter().map(|entry| entry.token_count).sum();
        let combined: String = consumed
            .iter()
            .map(|entry| entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let (compressed, compressed_tokens) =
            tokens::truncate(&combined, self.budgets.tier1_session);

        let summary = self.write_summary(
            1,
            &compressed,
            compressed_tokens,
            Some(session_id),
            consumed.iter().map(|entry| entry.id.clone()).collect(),
            serde_json::json!({
                "type": "session_archive",
                "originalCount": consumed.len(),
                "originalTokens": original_tokens,
            }),
        )?;
        self.index_vector(&summary.id, "summary", &compressed, 1.0);

        let consumed_ids: Vec<&str> = consumed.iter().map(|entry| entry.id.as_str()).collect();
        self.working
            .write()
            .retain(|entry| !consumed_ids.contains(&entry.id.as_str()));

        Ok(Some(format!(
            "Archived {} working entries ({original_tokens} tokens → {compressed_tokens} tokens).",
            consumed.len()
        )))
    }

    /// Empty the working buffer unconditionally.
    pub fn clear_working(&self) {
        self.working.write().clear();
    }

    /// Snapshot of working entries for a session, in insertion order.
    pub fn working_entries(&self, session_id: Option<&str>) -> Vec<WorkingEntry> {
        self.working
            .read()
            .iter()
            .filter(|entry| entry.session_id.as_deref() == session_id)
            .cloned()
            .collect()
    }

    /// Token total of a session's working entries.
    pub fn working_tokens(&self, session_id: Option<&str>) -> usize {
        self.working
            .read()
            .iter()
            .filter(|entry| entry.session_id.as_deref() == session_id)
            .map(|entry| entry.token_count)
            .sum()
    }

    /// Per-tier counts, graph totals, vector total, active session.
    pub fn status(&self, session_id: Option<&str>) -> Result<MemoryStatus> {
        let working = self.working_entries(session_id);
        let aggregates = self.store.tier_aggregates()?;
        let tier = |n: u8| -> TierStatus {
            aggregates
                .get(&n)
                .map(|aggregate| TierStatus {
                    count: aggregate.count,
                    token_estimate: aggregate.token_sum,
                })
                .unwrap_or_default()
        };
        let (graph_entities, graph_relations) = self.graph.counts()?;

        Ok(MemoryStatus {
            tier0: TierStatus {
                count: working.len(),
                token_estimate: working.iter().map(|entry| entry.token_count).sum(),
            },
            tier1: tier(1),
            tier2: tier(2),
            tier3: tier(3),
            graph_entities,
            graph_relations,
            vector_count: self.vectors.count()?,
            session_id: session_id.map(str::to_string),
        })
    }
}
