//! Knowledge graph integration tests: persistence across restarts and the
//! supersession / case-folding invariants through the full store path.

use tempfile::TempDir;

use latent_context::graph::KnowledgeGraph;
use latent_context::store::DurableStore;

fn open(dir: &TempDir) -> KnowledgeGraph {
    let store = DurableStore::open(dir.path(), "memory.db").expect("open store");
    KnowledgeGraph::new(store)
}

#[test]
fn graph_state_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = DurableStore::open(dir.path(), "memory.db").unwrap();
        let graph = KnowledgeGraph::new(store.clone());
        graph
            .store_fact("User", "located_in", "Paris", 1.0, None)
            .unwrap();
        graph
            .store_fact("User", "located_in", "London", 1.0, None)
            .unwrap();
        // no runtime here, so the debounced flush never fires; close flushes
        store.close();
    }
    let reopened = open(&dir);

    let user = reopened.query_entity("user", 1).unwrap().unwrap();
    assert_eq!(user.outgoing.len(), 1);
    assert_eq!(user.outgoing[0].object, "London");
}

#[test]
fn case_folded_lookup_resolves_to_one_entity() {
    let dir = TempDir::new().unwrap();
    let graph = open(&dir);
    let (id, _) = graph
        .ensure_entity("Rust Programming", None, None, 1.0, None)
        .unwrap();

    for variant in ["rust programming", "RUST PROGRAMMING", "Rust Programming"] {
        let result = graph.query_entity(variant, 1).unwrap().unwrap();
        assert_eq!(result.entity.id, id, "variant '{variant}' resolved elsewhere");
    }
}

#[test]
fn active_relation_uniqueness_holds_across_many_writes() {
    let dir = TempDir::new().unwrap();
    let graph = open(&dir);

    let cities = ["Paris", "London", "Berlin", "Madrid", "Lisbon"];
    for city in cities {
        graph
            .store_fact("User", "located_in", city, 1.0, None)
            .unwrap();
    }

    let user = graph.query_entity("User", 1).unwrap().unwrap();
    assert_eq!(user.outgoing.len(), 1, "one active edge per (subject, predicate)");
    assert_eq!(user.outgoing[0].object, "Lisbon");

    // Every superseded edge carries halved confidence
    let facts = graph.query_by_predicate("located_in").unwrap();
    assert_eq!(facts.len(), 1, "predicate query sees actives only");
}

#[test]
fn serialization_emits_confidence_below_one() {
    let dir = TempDir::new().unwrap();
    let graph = open(&dir);
    graph
        .store_fact("User", "prefers", "dvorak layouts", 0.75, None)
        .unwrap();

    let user = graph.query_entity("User", 1).unwrap().unwrap();
    assert_eq!(
        user.text,
        "Entity: User (unknown)\n  → prefers → dvorak layouts [conf:0.75]"
    );
}

#[test]
fn removing_an_entity_detaches_its_relations() {
    let dir = TempDir::new().unwrap();
    let graph = open(&dir);
    graph.store_fact("User", "uses", "Helix", 1.0, None).unwrap();

    graph.remove_entity("Helix").unwrap();

    // The relation died with the entity; the root still queries cleanly
    let user = graph.query_entity("User", 2).unwrap();
    assert!(user.is_some());
    assert!(user.unwrap().outgoing.is_empty());
}
