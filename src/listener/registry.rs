//! Link-id → session map.

use std::sync::Arc;

use dashmap::DashMap;

use super::session::Session;
use crate::transport::LinkId;

/// Sessions keyed by link id. Cheap to clone; all clones share the map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<LinkId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &LinkId) -> Option<Arc<Session>> {
        self.sessions.get(tag).map(|entry| entry.value().clone())
    }

    /// Register a session, replacing any prior entry for the tag.
    pub fn put(&self, tag: LinkId, session: Arc<Session>) {
        self.sessions.insert(tag, session);
    }

    /// Remove a session. A no-op for absent tags.
    pub fn clear(&self, tag: &LinkId) {
        self.sessions.remove(tag);
    }
}
