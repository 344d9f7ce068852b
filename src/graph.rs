//! Entity-relation knowledge graph with temporal supersession.
//!
//! Entities are unique by case-insensitive label. Relations are directed
//! `(subject, predicate, object)` edges; at most one relation per
//! `(subject, predicate)` pair is active at a time. Writing a contradicting
//! fact ends the previous relation (`temporal_end = now`) and halves its
//! confidence, so "X moved from Paris to London" keeps the Paris edge as
//! history without surfacing it in default queries.

use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::store::{DurableStore, EntityRow, RelationRow};

/// A relation joined with its endpoint labels.
#[derive(Debug, Clone)]
pub struct FactView {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

impl FactView {
    /// `<subj> → <pred> → <obj>[ [conf:<0.xx>]]`
    pub fn serialize(&self) -> String {
        format!(
            "{} → {} → {}{}",
            self.subject,
            self.predicate,
            self.object,
            conf_suffix(self.confidence)
        )
    }
}

/// Result of a neighborhood query.
#[derive(Debug, Clone)]
pub struct EntityQueryResult {
    pub entity: EntityRow,
    pub outgoing: Vec<FactView>,
    pub incoming: Vec<FactView>,
    pub neighbors: Vec<EntityRow>,
    /// Serialized text block for direct inclusion in context.
    pub text: String,
}

/// ` [conf:<0.xx>]` when confidence is below 1.0, empty otherwise.
fn conf_suffix(confidence: f32) -> String {
    if confidence < 1.0 {
        format!(" [conf:{confidence:.2}]")
    } else {
        String::new()
    }
}

/// Knowledge graph over the `entities` and `relations` tables.
pub struct KnowledgeGraph {
    store: DurableStore,
}

impl KnowledgeGraph {
    pub fn new(store: DurableStore) -> Self {
        Self { store }
    }

    /// Look up an entity by case-insensitive label, creating it if absent.
    ///
    /// On a hit, the stored confidence only moves up: it is replaced when the
    /// incoming value strictly exceeds it and ignored otherwise. Returns the
    /// entity id and whether a new entity was created.
    pub fn ensure_entity(
        &self,
        label: &str,
        entity_type: Option<&str>,
        properties: Option<serde_json::Value>,
        confidence: f32,
        source_summary_id: Option<&str>,
    ) -> Result<(String, bool)> {
        if let Some(existing) = self.store.entity_by_label_ci(label)? {
            if confidence > existing.confidence {
                self.store
                    .update_entity_confidence(&existing.id, confidence, &Utc::now())?;
            }
            return Ok((existing.id, false));
        }

        let now = Utc::now();
        let entity = EntityRow {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            entity_type: entity_type.unwrap_or("unknown").to_string(),
            properties: properties.unwrap_or_else(|| serde_json::json!({})),
            created_at: now,
            updated_at: now,
            confidence,
            source_summary_id: source_summary_id.map(str::to_string),
        };
        self.store.upsert_entity(&entity)?;
        Ok((entity.id, true))
    }

    /// Upsert a `(subject, predicate, object)` fact.
    ///
    /// An active relation with the same subject/predicate but a different
    /// object is superseded: ended at `now` with its confidence halved. The
    /// same object means the existing relation is refreshed in place.
    pub fn store_fact(
        &self,
        subject_label: &str,
        predicate: &str,
        object_label: &str,
        confidence: f32,
        source_summary_id: Option<&str>,
    ) -> Result<String> {
        let (subject_id, _) =
            self.ensure_entity(subject_label, None, None, confidence, source_summary_id)?;
        let (object_id, _) =
            self.ensure_entity(object_label, None, None, confidence, source_summary_id)?;

        let now = Utc::now();
        if let Some(active) = self.store.active_relation(&subject_id, predicate)? {
            if active.object_id == object_id {
                self.store
                    .update_relation_confidence(&active.id, confidence, source_summary_id)?;
                return Ok(active.id);
            }
            // Contradiction: supersede the old edge.
            self.store
                .end_relation(&active.id, &now, active.confidence * 0.5)?;
        }

        let relation = RelationRow {
            id: Uuid::new_v4().to_string(),
            subject_id,
            predicate: predicate.to_string(),
            object_id,
            properties: serde_json::json!({}),
            // Clamped to now: a future-dated start would make supersession
            // ordering undefined.
            temporal_start: Some(now),
            temporal_end: None,
            confidence,
            source_summary_id: source_summary_id.map(str::to_string),
        };
        self.store.upsert_relation(&relation)?;
        Ok(relation.id)
    }

    /// Label for an entity id, tolerating dangling references.
    fn label_of(&self, id: &str, cache: &mut HashMap<String, String>) -> String {
        if let Some(label) = cache.get(id) {
            return label.clone();
        }
        let label = self
            .store
            .entity_by_id(id)
            .ok()
            .flatten()
            .map(|entity| entity.label)
            .unwrap_or_else(|| id.to_string());
        cache.insert(id.to_string(), label.clone());
        label
    }

    fn fact_view(&self, relation: &RelationRow, cache: &mut HashMap<String, String>) -> FactView {
        FactView {
            subject: self.label_of(&relation.subject_id, cache),
            predicate: relation.predicate.clone(),
            object: self.label_of(&relation.object_id, cache),
            confidence: relation.confidence,
        }
    }

    /// Neighborhood query by case-insensitive label, with a substring
    /// fallback ordered by confidence. Returns `None` when nothing matches.
    ///
    /// Depth 1 collects the root's active edges and one-hop neighbors.
    /// Depth 2 additionally walks each first-hop neighbor's active edges,
    /// tracking visited entities to avoid revisiting the root.
    pub fn query_entity(&self, label: &str, depth: usize) -> Result<Option<EntityQueryResult>> {
        let root = match self.store.entity_by_label_ci(label)? {
            Some(entity) => entity,
            None => match self.store.entity_by_label_like(label)? {
                Some(entity) => entity,
                None => return Ok(None),
            },
        };

        let mut labels: HashMap<String, String> = HashMap::new();
        labels.insert(root.id.clone(), root.label.clone());

        let mut outgoing = Vec::new();
        let mut incoming = Vec::new();
        let mut neighbors: Vec<EntityRow> = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut neighbor_blocks: Vec<String> = Vec::new();

        if depth >= 1 {
            let root_out = self.store.outgoing_active(&root.id)?;
            let root_in = self.store.incoming_active(&root.id)?;

            for relation in &root_out {
                outgoing.push(self.fact_view(relation, &mut labels));
                if visited.insert(relation.object_id.clone()) {
                    if let Some(entity) = self.store.entity_by_id(&relation.object_id)? {
                        neighbors.push(entity);
                    }
                }
            }
            for relation in &root_in {
                incoming.push(self.fact_view(relation, &mut labels));
                if visited.insert(relation.subject_id.clone()) {
                    if let Some(entity) = self.store.entity_by_id(&relation.subject_id)? {
                        neighbors.push(entity);
                    }
                }
            }

            if depth > 1 {
                let first_hop: Vec<EntityRow> = neighbors.clone();
                for neighbor in &first_hop {
                    let mut block_out = Vec::new();
                    let mut block_in = Vec::new();
                    for relation in self.store.outgoing_active(&neighbor.id)? {
                        if relation.object_id == root.id {
                            continue;
                        }
                        block_out.push(self.fact_view(&relation, &mut labels));
                        if visited.insert(relation.object_id.clone()) {
                            if let Some(entity) = self.store.entity_by_id(&relation.object_id)? {
                                neighbors.push(entity);
                            }
                        }
                    }
                    for relation in self.store.incoming_active(&neighbor.id)? {
                        if relation.subject_id == root.id {
                            continue;
                        }
                        block_in.push(self.fact_view(&relation, &mut labels));
                        if visited.insert(relation.subject_id.clone()) {
                            if let Some(entity) = self.store.entity_by_id(&relation.subject_id)? {
                                neighbors.push(entity);
                            }
                        }
                    }
                    if !block_out.is_empty() || !block_in.is_empty() {
                        neighbor_blocks.push(serialize_block(neighbor, &block_out, &block_in));
                        outgoing.extend(block_out);
                        incoming.extend(block_in);
                    }
                }
            }
        }

        let root_direct_out: Vec<&FactView> = outgoing
            .iter()
            .filter(|fact| fact.subject == root.label)
            .collect();
        let root_direct_in: Vec<&FactView> = incoming
            .iter()
            .filter(|fact| fact.object == root.label)
            .collect();

        let mut text = serialize_block_refs(&root, &root_direct_out, &root_direct_in);
        for block in &neighbor_blocks {
            text.push('\n');
            text.push_str(block);
        }

        Ok(Some(EntityQueryResult {
            entity: root,
            outgoing,
            incoming,
            neighbors,
            text,
        }))
    }

    /// All active facts with a case-insensitively equal predicate.
    pub fn query_by_predicate(&self, predicate: &str) -> Result<Vec<FactView>> {
        let mut labels = HashMap::new();
        let relations = self.store.relations_by_predicate_ci(predicate)?;
        Ok(relations
            .iter()
            .map(|relation| self.fact_view(relation, &mut labels))
            .collect())
    }

    /// Delete an entity and every relation it participates in, active or
    /// superseded. Returns false when the label resolves to nothing.
    pub fn remove_entity(&self, label: &str) -> Result<bool> {
        let entity = match self.store.entity_by_label_ci(label)? {
            Some(entity) => entity,
            None => return Ok(false),
        };
        self.store.delete_relations_for_entity(&entity.id)?;
        self.store.delete_entity(&entity.id)?;
        Ok(true)
    }

    /// Set a relation's confidence and mark it ended now.
    pub fn deprecate_relation(&self, id: &str, new_confidence: f32) -> Result<bool> {
        match self.store.relation_by_id(id)? {
            Some(_) => {
                self.store.end_relation(id, &Utc::now(), new_confidence)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `(entities, active relations)` totals.
    pub fn counts(&self) -> Result<(usize, usize)> {
        Ok((
            self.store.entity_count()?,
            self.store.active_relation_count()?,
        ))
    }
}

fn serialize_block(entity: &EntityRow, outgoing: &[FactView], incoming: &[FactView]) -> String {
    let out_refs: Vec<&FactView> = outgoing.iter().collect();
    let in_refs: Vec<&FactView> = incoming.iter().collect();
    serialize_block_refs(entity, &out_refs, &in_refs)
}

/// ```text
/// Entity: <label> (<entity_type>)
///   → <predicate> → <object>[ [conf:<0.xx>]]
///   ← <subject> → <predicate>[ [conf:<0.xx>]]
/// ```
fn serialize_block_refs(
    entity: &EntityRow,
    outgoing: &[&FactView],
    incoming: &[&FactView],
) -> String {
    let mut lines = vec![format!("Entity: {} ({})", entity.label, entity.entity_type)];
    for fact in outgoing {
        lines.push(format!(
            "  → {} → {}{}",
            fact.predicate,
            fact.object,
            conf_suffix(fact.confidence)
        ));
    }
    for fact in incoming {
        lines.push(format!(
            "  ← {} → {}{}",
            fact.subject,
            fact.predicate,
            conf_suffix(fact.confidence)
        ));
    }
    lines.join("\n")
}
