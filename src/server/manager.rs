//! Session manager.

use super::managed::ManagedSession;
use std::collections::HashMap;

/// Owns every session the server supervises.
#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<String, ManagedSession>,
    name_counter: HashMap<String, u32>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an unused session name.
    pub fn generate_name(&mut self) -> String {
        let mut generator = names::Generator::default();
        loop {
            let base_name = generator.next().unwrap_or_else(|| "session".to_string());
            if !self.sessions.contains_key(&base_name) {
                return base_name;
            }

            let counter = self.name_counter.entry(base_name.clone()).or_insert(1);
            *counter += 1;
            let numbered_name = format!("{base_name}-{counter}");
            if !self.sessions.contains_key(&numbered_name) {
                return numbered_name;
            }
        }
    }

    pub fn add(&mut self, session: ManagedSession) {
        self.sessions.insert(session.name().to_string(), session);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ManagedSession> {
        self.sessions.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ManagedSession> {
        self.sessions.remove(name)
    }

    /// Sessions sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<&ManagedSession> {
        let mut sessions: Vec<_> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagedSession> {
        self.sessions.values_mut()
    }
}
