//! Vector store: append/delete over the `vectors` table plus brute-force
//! cosine search over an in-process cache.
//!
//! Brute force is intentional. At the target scale (≲10⁵ vectors per
//! personal store) a linear scan is simpler and faster to warm than a
//! persistent ANN index, and it sidesteps index-staleness bugs. The cache
//! has exactly one invariant: stale ⇒ the next search reloads.

use anyhow::Result;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::embeddings::{cosine, Embedder};
use crate::store::{DurableStore, VectorRow};

/// Longest preview stored alongside an embedding, in characters.
const PREVIEW_CHARS: usize = 200;

/// Metadata filter applied during search.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// Restrict to these source types (e.g. `fact`, `preference`).
    pub source_types: Option<Vec<String>>,
    /// Only records created at or after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Only records created at or before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Minimum record confidence.
    pub min_confidence: Option<f32>,
}

impl VectorFilter {
    fn matches(&self, record: &CachedVector) -> bool {
        if let Some(types) = &self.source_types {
            if !types.iter().any(|t| t == &record.row.source_type) {
                return false;
            }
        }
        if let Some(after) = &self.after {
            if record.row.created_at < *after {
                return false;
            }
        }
        if let Some(before) = &self.before {
            if record.row.created_at > *before {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if record.row.confidence < min {
                return false;
            }
        }
        true
    }
}

/// A search hit: the stored record plus its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub row: VectorRow,
    pub similarity: f32,
}

struct CachedVector {
    row: VectorRow,
    embedding: Vec<f32>,
}

/// Vector store over the durable `vectors` table.
pub struct VectorStore {
    store: DurableStore,
    embedder: Arc<dyn Embedder>,
    cache: RwLock<Vec<CachedVector>>,
    stale: AtomicBool,
}

impl VectorStore {
    pub fn new(store: DurableStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            cache: RwLock::new(Vec::new()),
            stale: AtomicBool::new(true),
        }
    }

    /// Encode an embedding as float32 little-endian bytes in index order.
    pub fn vec_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Decode a float32 little-endian blob.
    pub fn bytes_to_vec(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn preview_of(content: &str) -> String {
        let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
        if content.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        preview
    }

    /// Embed `content` and append a record for `source_id`.
    pub fn add(
        &self,
        source_id: &str,
        source_type: &str,
        content: &str,
        confidence: f32,
        metadata: serde_json::Value,
    ) -> Result<String> {
        let embedding = self.embedder.embed(content);
        let id = Uuid::new_v4().to_string();
        let row = VectorRow {
            id: id.clone(),
            source_id: source_id.to_string(),
            source_type: source_type.to_string(),
            content_preview: Self::preview_of(content),
            dimensions: embedding.len(),
            embedding: Self::vec_to_bytes(&embedding),
            metadata,
            created_at: Utc::now(),
            confidence,
        };
        self.store.insert_vector(&row)?;
        self.stale.store(true, Ordering::SeqCst);
        Ok(id)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_vector(id)?;
        self.stale.store(true, Ordering::SeqCst);
        Ok(deleted)
    }

    /// Remove every record embedding a given source. Returns how many.
    pub fn delete_by_source(&self, source_id: &str) -> Result<usize> {
        let deleted = self.store.delete_vectors_by_source(source_id)?;
        self.stale.store(true, Ordering::SeqCst);
        Ok(deleted)
    }

    fn ensure_cache(&self) -> Result<()> {
        if !self.stale.load(Ordering::SeqCst) {
            return Ok(());
        }
        let rows = self.store.all_vectors()?;
        let mut cache = self.cache.write();
        cache.clear();
        cache.extend(rows.into_iter().map(|row| CachedVector {
            embedding: Self::bytes_to_vec(&row.embedding),
            row,
        }));
        self.stale.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Top-k records by cosine similarity to `query`, after filtering.
    ///
    /// Low similarities are NOT floored here; callers apply their own cut.
    /// Ties keep insertion order (stable sort).
    pub fn search_by_embedding(
        &self,
        query: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>> {
        self.ensure_cache()?;
        let cache = self.cache.read();

        let mut scored: Vec<(OrderedFloat<f32>, &CachedVector)> = cache
            .iter()
            .filter(|record| filter.matches(record))
            .map(|record| (OrderedFloat(cosine(query, &record.embedding)), record))
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, record)| VectorHit {
                row: record.row.clone(),
                similarity: similarity.0,
            })
            .collect())
    }

    /// Embed `text` and search.
    pub fn search(&self, text: &str, k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>> {
        let query = self.embedder.embed(text);
        self.search_by_embedding(&query, k, filter)
    }

    pub fn count(&self) -> Result<usize> {
        self.store.vector_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::NullEmbedder;
    use tempfile::TempDir;

    fn setup() -> (VectorStore, DurableStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path(), "memory.db").unwrap();
        let vectors = VectorStore::new(store.clone(), Arc::new(NullEmbedder::new(4)));
        (vectors, store, dir)
    }

    fn insert_raw(store: &DurableStore, id: &str, embedding: &[f32], source_type: &str, conf: f32) {
        store
            .insert_vector(&VectorRow {
                id: id.to_string(),
                source_id: format!("src-{id}"),
                source_type: source_type.to_string(),
                content_preview: String::new(),
                embedding: VectorStore::vec_to_bytes(embedding),
                dimensions: embedding.len(),
                metadata: serde_json::json!({}),
                created_at: Utc::now(),
                confidence: conf,
            })
            .unwrap();
    }

    #[test]
    fn bytes_round_trip_is_bitwise_exact() {
        let vectors: Vec<Vec<f32>> = vec![
            vec![-1.0, -0.5, 0.0, 0.5, 1.0],
            vec![f32::MIN_POSITIVE, -f32::MIN_POSITIVE],
            vec![0.1, 0.2, 0.3],
        ];
        for v in vectors {
            let decoded = VectorStore::bytes_to_vec(&VectorStore::vec_to_bytes(&v));
            assert_eq!(decoded.len(), v.len());
            for (a, b) in decoded.iter().zip(v.iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn preview_truncates_with_ellipsis() {
        let long = "x".repeat(300);
        let preview = VectorStore::preview_of(&long);
        assert_eq!(preview.chars().count(), 201);
        assert!(preview.ends_with('…'));
        assert_eq!(VectorStore::preview_of("short"), "short");
    }

    #[test]
    fn search_ranks_by_cosine() {
        let (vectors, store, _dir) = setup();
        insert_raw(&store, "a", &[1.0, 0.0], "fact", 1.0);
        insert_raw(&store, "b", &[0.0, 1.0], "fact", 1.0);
        insert_raw(&store, "c", &[0.7, 0.7], "fact", 1.0);
        // force reload after out-of-band writes
        vectors.stale.store(true, Ordering::SeqCst);

        let hits = vectors
            .search_by_embedding(&[1.0, 0.0], 2, &VectorFilter::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].row.id, "a");
        assert_eq!(hits[1].row.id, "c");
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn filters_apply_before_ranking() {
        let (vectors, store, _dir) = setup();
        insert_raw(&store, "a", &[1.0, 0.0], "fact", 1.0);
        insert_raw(&store, "b", &[1.0, 0.0], "preference", 0.4);
        vectors.stale.store(true, Ordering::SeqCst);

        let only_prefs = VectorFilter {
            source_types: Some(vec!["preference".to_string()]),
            ..Default::default()
        };
        let hits = vectors
            .search_by_embedding(&[1.0, 0.0], 10, &only_prefs)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.id, "b");

        let confident = VectorFilter {
            min_confidence: Some(0.5),
            ..Default::default()
        };
        let hits = vectors
            .search_by_embedding(&[1.0, 0.0], 10, &confident)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.id, "a");
    }

    #[test]
    fn mutation_marks_cache_stale() {
        let (vectors, _store, _dir) = setup();
        let id = vectors
            .add("m-1", "event", "cache staleness check", 1.0, serde_json::json!({}))
            .unwrap();
        // first search warms the cache
        let hits = vectors.search("anything", 10, &VectorFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);

        vectors.delete(&id).unwrap();
        let hits = vectors.search("anything", 10, &VectorFilter::default()).unwrap();
        assert!(hits.is_empty(), "delete must invalidate the cache");
    }

    #[test]
    fn delete_by_source_removes_every_record() {
        let (vectors, _store, _dir) = setup();
        vectors
            .add("m-1", "event", "first", 1.0, serde_json::json!({}))
            .unwrap();
        vectors
            .add("m-1", "summary", "second", 1.0, serde_json::json!({}))
            .unwrap();
        assert_eq!(vectors.delete_by_source("m-1").unwrap(), 2);
        assert_eq!(vectors.count().unwrap(), 0);
    }

    #[test]
    fn zero_vector_query_yields_zero_similarity() {
        let (vectors, store, _dir) = setup();
        insert_raw(&store, "a", &[1.0, 0.0], "fact", 1.0);
        vectors.stale.store(true, Ordering::SeqCst);

        let hits = vectors
            .search_by_embedding(&[0.0, 0.0], 5, &VectorFilter::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 0.0);
    }
}
