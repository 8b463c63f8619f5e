//! Who is ready to receive a file right now
//!
//! A username maps to the handle of the session that marked it ready. Entries
//! are added and removed only by that session's own unit; every other unit
//! only reads. Handles whose channel has died are never handed out.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::session::SessionHandle;

#[derive(Default)]
pub struct Registry {
    ready: Mutex<HashMap<String, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its username. Returns the handle it displaced,
    /// if another session of the same user was ready before.
    pub fn mark_ready(&self, session: SessionHandle) -> Option<SessionHandle> {
        let name = session.username().to_string();
        self.ready.lock().insert(name, session)
    }

    /// Remove `session`'s entry. A newer session of the same user that has
    /// since marked itself ready is left alone.
    pub fn mark_unready(&self, session: &SessionHandle) -> bool {
        let mut ready = self.ready.lock();
        match ready.get(session.username()) {
            Some(current) if current.id() == session.id() => {
                ready.remove(session.username());
                true
            }
            _ => false,
        }
    }

    /// Sorted names of ready parties with a live channel, minus `exclude`
    pub fn snapshot(&self, exclude: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .ready
            .lock()
            .iter()
            .filter(|(name, handle)| Some(name.as_str()) != exclude && handle.is_live())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.ready
            .lock()
            .get(username)
            .filter(|h| h.is_live())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
