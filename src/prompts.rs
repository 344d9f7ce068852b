//! Static prompt templates the host asks for by name.

/// Instructions a host injects into its system prompt to use the sidecar.
const SYSTEM: &str = "\
You have access to a persistent memory sidecar. Delegate memory to it instead \
of relying on conversation history:
- Call memory_store for durable information: stable facts, user preferences, \
notable events, and explicit 'remember this' requests. Write each memory as a \
self-contained note of at least 10 words; include entity names.
- Call memory_retrieve with the user's query before answering questions that \
may touch prior conversations.
- Call memory_forget when the user corrects or retracts something you stored.
- Call session_start when a new conversation begins.";

/// Guidance on writing good memories.
const STORE_GUIDANCE: &str = "\
Write memories as self-contained notes a stranger could understand without \
the surrounding conversation. Name the subject explicitly ('User prefers...', \
'Alice works at...'), include concrete values, and pick the right kind: \
fact for stable truths, preference for likes and dislikes, event for \
session-scoped happenings, summary for condensed context, core for \
permanent identity-level information.";

/// Guidance on retrieving effectively.
const RETRIEVE_GUIDANCE: &str = "\
Query with the user's own words plus any entity names involved. Capitalized \
names and quoted phrases are matched against the knowledge graph. Narrow \
results with filters (memory_types, after, before, min_confidence) and set \
token_budget to bound how much context comes back.";

const TEMPLATES: &[(&str, &str)] = &[
    ("system", SYSTEM),
    ("store_guidance", STORE_GUIDANCE),
    ("retrieve_guidance", RETRIEVE_GUIDANCE),
];

/// Look up a template by name.
pub fn get(name: &str) -> Option<&'static str> {
    TEMPLATES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, text)| *text)
}

/// Available template names.
pub fn names() -> Vec<&'static str> {
    TEMPLATES.iter().map(|(key, _)| *key).collect()
}
