//! Engine facade: the tool surface consumed by the transport.
//!
//! One handler per tool. Handlers validate arguments, invoke the core, and
//! format replies; every reply is a JSON object with a human-readable
//! `reply` field plus structured fields. Unknown ids and labels come back as
//! benign textual results, not errors.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::embeddings::{build_embedder, Embedder};
use crate::errors::{EngineError, Result};
use crate::graph::KnowledgeGraph;
use crate::memory::{CompressScope, ForgetAction, MemoryKind, MemoryManager};
use crate::prompts;
use crate::retrieval::{ContextAssembler, RetrieveFilters};
use crate::session::SessionRegistry;
use crate::store::DurableStore;
use crate::vector_store::VectorStore;

/// Reject a store below this many whitespace-separated words.
const MIN_STORE_WORDS: usize = 10;

/// Accept but annotate a store below this many words.
const SHORT_STORE_WORDS: usize = 25;

fn default_confidence() -> f32 {
    1.0
}

fn default_depth() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct MemoryStoreArgs {
    pub content: String,
    pub kind: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RetrieveFilterArgs {
    pub memory_types: Option<Vec<String>>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRetrieveArgs {
    pub query: String,
    pub token_budget: Option<usize>,
    #[serde(default)]
    pub filters: RetrieveFilterArgs,
}

#[derive(Debug, Deserialize)]
pub struct MemoryCompressArgs {
    pub scope: String,
}

#[derive(Debug, Deserialize)]
pub struct MemoryForgetArgs {
    pub memory_id: String,
    pub action: String,
    pub correction: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQueryArgs {
    pub entity: String,
    pub relation: Option<String>,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

#[derive(Debug, Deserialize)]
pub struct PromptGetArgs {
    pub name: String,
}

/// The memory engine: one value owned by the transport, no ambient state.
pub struct Engine {
    config: EngineConfig,
    store: DurableStore,
    sessions: SessionRegistry,
    manager: Arc<MemoryManager>,
    graph: Arc<KnowledgeGraph>,
    assembler: ContextAssembler,
}

impl Engine {
    /// Boot the engine. A store that fails to open is fatal; the caller
    /// should refuse to serve.
    pub fn boot(config: EngineConfig) -> anyhow::Result<Self> {
        let store = DurableStore::open(&config.storage.data_dir, &config.storage.sqlite_file)
            .context("durable store failed to open")?;

        let embedder: Arc<dyn Embedder> = build_embedder(&config.embedding);
        let vectors = Arc::new(VectorStore::new(store.clone(), embedder));
        let graph = Arc::new(KnowledgeGraph::new(store.clone()));
        let manager = Arc::new(MemoryManager::new(
            store.clone(),
            Arc::clone(&vectors),
            Arc::clone(&graph),
            config.token_budgets.clone(),
            config.compression.clone(),
        ));
        let assembler = ContextAssembler::new(
            store.clone(),
            Arc::clone(&vectors),
            Arc::clone(&graph),
            Arc::clone(&manager),
            config.token_budgets.clone(),
            config.ranking.clone(),
            config.retrieval.cross_session,
        );
        let sessions = SessionRegistry::new(store.clone());

        Ok(Self {
            config,
            store,
            sessions,
            manager,
            graph,
            assembler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.sessions.current_id()
    }

    /// Dispatch a tool invocation by name.
    pub fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "session_start" => self.session_start(),
            "memory_store" => self.memory_store(parse_args(params)?),
            "memory_retrieve" => self.memory_retrieve(parse_args(params)?),
            "memory_compress" => self.memory_compress(parse_args(params)?),
            "memory_forget" => self.memory_forget(parse_args(params)?),
            "memory_status" => self.memory_status(),
            "graph_query" => self.graph_query(parse_args(params)?),
            "prompt_get" => self.prompt_get(parse_args(params)?),
            other => Err(EngineError::NotFound(format!("method '{other}'"))),
        }
    }

    /// Start a new session: archive the outgoing working buffer, end the old
    /// session, mint a new id, clear the working buffer.
    pub fn session_start(&self) -> Result<Value> {
        let hook = |old_id: &str| self.manager.archive_working(old_id);
        let result = self.sessions.start(Some(&hook))?;
        self.manager.clear_working();

        let mut reply = format!("Session started: {}", result.new_id);
        if let Some(summary) = &result.archive_summary {
            reply.push_str(&format!("\nPrevious session archived. {summary}"));
        }

        Ok(json!({
            "reply": reply,
            "new_id": result.new_id,
            "started_at": result.started_at.to_rfc3339(),
            "previous_id": result.previous_id,
            "archived": result.archived,
            "archive_summary": result.archive_summary,
        }))
    }

    pub fn memory_store(&self, args: MemoryStoreArgs) -> Result<Value> {
        let words = args.content.split_whitespace().count();
        if words < MIN_STORE_WORDS {
            return Err(EngineError::validation(
                "content",
                format!(
                    "REJECTED: \"{}\" has only {words} words. Store self-contained notes of at \
                     least {MIN_STORE_WORDS} words, e.g. \"User prefers dark mode with a #0a0e27 \
                     base color across all editors and terminals.\"",
                    args.content
                ),
            ));
        }
        if !(0.0..=1.0).contains(&args.confidence) {
            return Err(EngineError::validation(
                "confidence",
                format!("{} is outside [0, 1]", args.confidence),
            ));
        }
        let kind = MemoryKind::from_str(&args.kind)
            .map_err(|reason| EngineError::validation("kind", reason))?;

        let session_id = self.sessions.current_id();
        let outcome = self.manager.store(
            &args.content,
            kind,
            args.confidence,
            &args.entities,
            session_id.as_deref(),
        )?;

        let mut reply = format!(
            "Stored {} memory {} at tier {}.",
            kind.as_str(),
            outcome.memory_id,
            outcome.tier
        );
        if !outcome.entities_created.is_empty() {
            reply.push_str(&format!(
                " New entities: {}.",
                outcome.entities_created.join(", ")
            ));
        }
        if outcome.facts_stored > 0 {
            reply.push_str(&format!(" Facts stored: {}.", outcome.facts_stored));
        }
        if words < SHORT_STORE_WORDS {
            reply.push_str(&format!(
                " Note: only {words} words; fuller self-contained notes retrieve better."
            ));
        }

        let mut value = serde_json::to_value(&outcome)?;
        value["reply"] = Value::String(reply);
        Ok(value)
    }

    pub fn memory_retrieve(&self, args: MemoryRetrieveArgs) -> Result<Value> {
        if args.query.trim().is_empty() {
            return Err(EngineError::validation("query", "must not be empty"));
        }
        if let Some(budget) = args.token_budget {
            if budget < 1 {
                return Err(EngineError::validation("token_budget", "must be at least 1"));
            }
        }

        let parse_instant = |field: &str, raw: &Option<String>| -> Result<Option<DateTime<Utc>>> {
            match raw {
                None => Ok(None),
                Some(value) => DateTime::parse_from_rfc3339(value)
                    .map(|ts| Some(ts.with_timezone(&Utc)))
                    .map_err(|e| {
                        EngineError::validation(field, format!("'{value}' is not ISO-8601: {e}"))
                    }),
            }
        };
        if let Some(min) = args.filters.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(EngineError::validation(
                    "filters.min_confidence",
                    format!("{min} is outside [0, 1]"),
                ));
            }
        }
        let filters = RetrieveFilters {
            memory_types: args.filters.memory_types.clone(),
            after: parse_instant("filters.after", &args.filters.after)?,
            before: parse_instant("filters.before", &args.filters.before)?,
            min_confidence: args.filters.min_confidence,
        };

        let session_id = self.sessions.current_id();
        let result = self.assembler.retrieve(
            &args.query,
            args.token_budget,
            &filters,
            session_id.as_deref(),
        )?;
        Ok(serde_json::to_value(&result)?)
    }

    pub fn memory_compress(&self, args: MemoryCompressArgs) -> Result<Value> {
        let scope = CompressScope::from_str(&args.scope)
            .map_err(|reason| EngineError::validation("scope", reason))?;
        let session_id = self.sessions.current_id();
        let report = self.manager.compress(scope, session_id.as_deref())?;
        Ok(json!({ "reply": report }))
    }

    pub fn memory_forget(&self, args: MemoryForgetArgs) -> Result<Value> {
        let action = ForgetAction::from_str(&args.action)
            .map_err(|reason| EngineError::validation("action", reason))?;
        if action == ForgetAction::Correct && args.correction.as_deref().unwrap_or("").is_empty() {
            return Err(EngineError::validation(
                "correction",
                "the correct action requires a correction text",
            ));
        }
        let report = self
            .manager
            .forget(&args.memory_id, action, args.correction.as_deref())?;
        Ok(json!({ "reply": report }))
    }

    pub fn memory_status(&self) -> Result<Value> {
        let session_id = self.sessions.current_id();
        let status = self.manager.status(session_id.as_deref())?;
        let mut value = serde_json::to_value(&status)?;
        value["reply"] = Value::String(format!(
            "Tiers: T0 {} entries / {} tokens, T1 {} / {}, T2 {} / {}, T3 {} / {}. \
             Graph: {} entities, {} relations. Vectors: {}. Session: {}.",
            status.tier0.count,
            status.tier0.token_estimate,
            status.tier1.count,
            status.tier1.token_estimate,
            status.tier2.count,
            status.tier2.token_estimate,
            status.tier3.count,
            status.tier3.token_estimate,
            status.graph_entities,
            status.graph_relations,
            status.vector_count,
            status.session_id.as_deref().unwrap_or("none"),
        ));
        Ok(value)
    }

    pub fn graph_query(&self, args: GraphQueryArgs) -> Result<Value> {
        if let Some(relation) = &args.relation {
            let facts = self.graph.query_by_predicate(relation)?;
            let facts: Vec<_> = if args.entity.trim().is_empty() {
                facts
            } else {
                facts
                    .into_iter()
                    .filter(|fact| {
                        fact.subject.eq_ignore_ascii_case(&args.entity)
                            || fact.object.eq_ignore_ascii_case(&args.entity)
                    })
                    .collect()
            };
            if facts.is_empty() {
                return Ok(json!({
                    "reply": format!("No facts found with predicate '{relation}'."),
                    "facts": [],
                }));
            }
            let lines: Vec<String> = facts.iter().map(|fact| fact.serialize()).collect();
            return Ok(json!({
                "reply": lines.join("\n"),
                "facts": lines,
            }));
        }

        match self.graph.query_entity(&args.entity, args.depth.max(1))? {
            Some(result) => Ok(json!({
                "reply": result.text,
                "entity": result.entity.label,
                "entity_type": result.entity.entity_type,
                "outgoing": result.outgoing.len(),
                "incoming": result.incoming.len(),
                "neighbors": result.neighbors.len(),
            })),
            None => Ok(json!({
                "reply": format!("No entity found matching '{}'.", args.entity),
            })),
        }
    }

    pub fn prompt_get(&self, args: PromptGetArgs) -> Result<Value> {
        match prompts::get(&args.name) {
            Some(text) => Ok(json!({ "reply": text, "name": args.name })),
            None => Ok(json!({
                "reply": format!(
                    "No prompt template named '{}'. Available: {}.",
                    args.name,
                    prompts::names().join(", ")
                ),
            })),
        }
    }

    /// Graceful shutdown: end the session, flush synchronously.
    pub fn shutdown(&self) {
        if let Err(e) = self.sessions.end_current() {
            tracing::warn!("Failed to end session during shutdown: {e:#}");
        }
        self.store.close();
        tracing::info!("Engine shut down");
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| EngineError::validation("params", e.to_string()))
}
