//! Session registry: one active session per engine.
//!
//! State machine: `none → active → ended/replaced`. Starting a new session
//! archives the outgoing one through a best-effort hook, marks it ended, and
//! mints a fresh id. Session ids are `<unix-millis>-<uuid>` so rows sort
//! lexicographically by start time.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::store::{DurableStore, SessionRow};

/// Hook invoked with the outgoing session id before it is ended. Returns an
/// optional textual summary of what was archived.
pub type ArchiveHook<'a> = &'a dyn Fn(&str) -> Result<Option<String>>;

/// Result of `start`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStartResult {
    pub new_id: String,
    pub started_at: DateTime<Utc>,
    pub previous_id: Option<String>,
    pub archived: bool,
    pub archive_summary: Option<String>,
}

struct ActiveSession {
    id: String,
}

/// Registry owning the current session identifier.
pub struct SessionRegistry {
    store: DurableStore,
    current: Mutex<Option<ActiveSession>>,
}

impl SessionRegistry {
    pub fn new(store: DurableStore) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    /// Start a new session, replacing any active one.
    ///
    /// The archive hook runs against the outgoing session and is best-effort:
    /// a hook error is logged and ignored, the start still succeeds.
    pub fn start(&self, archive_hook: Option<ArchiveHook<'_>>) -> Result<SessionStartResult> {
        let mut current = self.current.lock();

        let previous_id = current.as_ref().map(|session| session.id.clone());
        let mut archive_summary = None;

        if let Some(old_id) = &previous_id {
            if let Some(hook) = archive_hook {
                match hook(old_id) {
                    Ok(summary) => archive_summary = summary,
                    Err(e) => {
                        tracing::warn!("Archive hook failed for session {old_id}: {e:#}");
                    }
                }
            }
            self.store.end_session(old_id, &Utc::now())?;
        }

        let started_at = Utc::now();
        let new_id = format!("{}-{}", started_at.timestamp_millis(), Uuid::new_v4());
        self.store.insert_session(&SessionRow {
            id: new_id.clone(),
            started_at,
            ended_at: None,
            metadata: serde_json::json!({ "previous_session_id": previous_id }),
        })?;

        *current = Some(ActiveSession { id: new_id.clone() });
        tracing::info!("Session started: {new_id}");

        Ok(SessionStartResult {
            new_id,
            started_at,
            previous_id,
            archived: archive_summary.is_some(),
            archive_summary,
        })
    }

    /// Mark the active session ended and clear in-process state.
    pub fn end_current(&self) -> Result<()> {
        let mut current = self.current.lock();
        if let Some(session) = current.take() {
            self.store.end_session(&session.id, &Utc::now())?;
            tracing::info!("Session ended: {}", session.id);
        }
        Ok(())
    }

    /// O(1) current session id.
    pub fn current_id(&self) -> Option<String> {
        self.current.lock().as_ref().map(|session| session.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (SessionRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path(), "memory.db").unwrap();
        (SessionRegistry::new(store), dir)
    }

    #[test]
    fn start_mints_distinct_ids() {
        let (registry, _dir) = setup();
        assert!(registry.current_id().is_none());

        let first = registry.start(None).unwrap();
        assert_eq!(registry.current_id().as_deref(), Some(first.new_id.as_str()));
        assert!(first.previous_id.is_none());

        let second = registry.start(None).unwrap();
        assert_ne!(first.new_id, second.new_id);
        assert_eq!(second.previous_id.as_deref(), Some(first.new_id.as_str()));
    }

    #[test]
    fn replaced_session_is_marked_ended() {
        let (registry, _dir) = setup();
        let first = registry.start(None).unwrap();
        registry.start(None).unwrap();

        let row = registry.store.session_by_id(&first.new_id).unwrap().unwrap();
        assert!(row.ended_at.is_some());
    }

    #[test]
    fn archive_hook_summary_is_reported() {
        let (registry, _dir) = setup();
        registry.start(None).unwrap();

        let hook = |old_id: &str| -> Result<Option<String>> {
            Ok(Some(format!("archived {old_id}")))
        };
        let result = registry.start(Some(&hook)).unwrap();
        assert!(result.archived);
        assert!(result.archive_summary.unwrap().starts_with("archived "));
    }

    #[test]
    fn archive_hook_errors_are_swallowed() {
        let (registry, _dir) = setup();
        registry.start(None).unwrap();

        let hook = |_: &str| -> Result<Option<String>> { anyhow::bail!("boom") };
        let result = registry.start(Some(&hook)).unwrap();
        assert!(!result.archived);
        assert!(result.archive_summary.is_none());
        assert!(registry.current_id().is_some());
    }

    #[test]
    fn end_current_clears_state() {
        let (registry, _dir) = setup();
        let started = registry.start(None).unwrap();
        registry.end_current().unwrap();
        assert!(registry.current_id().is_none());

        let row = registry.store.session_by_id(&started.new_id).unwrap().unwrap();
        assert!(row.ended_at.is_some());
        // ending again is a no-op
        registry.end_current().unwrap();
    }

    #[test]
    fn session_ids_sort_by_start_time() {
        let (registry, _dir) = setup();
        let first = registry.start(None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = registry.start(None).unwrap();
        assert!(first.new_id < second.new_id);
    }
}
