//! Session arena and connection lifecycle bookkeeping
//!
//! This module keeps every connected session, including:
//! - Id assignment (ids 0 and 1 are reserved, freed ids are reused)
//! - Lookup by id and by account name
//! - Mark-then-sweep removal so a session can be torn down while a
//!   handler is still iterating over other sessions
//!
//! Sessions live in a vector indexed by their id. Removal leaves a hole that
//! the next connection fills.

use crate::error::ServerError;
use crate::session::Session;
use log::info;
use std::time::Instant;

/// First id handed out; 0 and 1 mean "nobody" and "the server" on the wire
pub const FIRST_SESSION_ID: u16 = 2;

/// Owns all sessions, indexed by their id
pub struct SessionRegistry {
    /// Slot per id; `None` marks a free id
    sessions: Vec<Option<Session>>,
    /// Sessions waiting for the next sweep, in marking order
    marked: Vec<u16>,
    /// Highest id that may be assigned
    max_id: u16,
}

impl SessionRegistry {
    /// Creates an empty registry that assigns ids up to `max_id`
    pub fn new(max_id: u16) -> Self {
        Self {
            sessions: Vec::new(),
            marked: Vec::new(),
            max_id: max_id.max(FIRST_SESSION_ID),
        }
    }

    /// Registers a newly accepted connection
    ///
    /// The session gets the lowest free id starting at 2. Fails with
    /// [`ServerError::NoFreeSessionId`] once every id is taken.
    pub fn add_session(&mut self, ip: &str, now: Instant) -> Result<u16, ServerError> {
        let start = usize::from(FIRST_SESSION_ID);
        let id = (start..=usize::from(self.max_id))
            .find(|&i| self.sessions.get(i).map_or(true, Option::is_none))
            .ok_or(ServerError::NoFreeSessionId)?;

        if self.sessions.len() <= id {
            self.sessions.resize_with(id + 1, || None);
        }
        let id = id as u16;
        self.sessions[usize::from(id)] = Some(Session::new(id, ip, now));
        info!("Session {} connected from {}", id, ip);
        Ok(id)
    }

    /// Drops a session and frees its id. Returns false if it was already gone.
    pub fn remove_session(&mut self, id: u16) -> bool {
        self.marked.retain(|&m| m != id);
        match self.sessions.get_mut(usize::from(id)).and_then(Option::take) {
            Some(session) => {
                info!("Session {} ({}) removed", id, session.account.name);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u16) -> Option<&Session> {
        self.sessions.get(usize::from(id)).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Session> {
        self.sessions.get_mut(usize::from(id)).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    /// Queues a session for the next sweep. Returns true the first time.
    pub fn mark_for_removal(&mut self, id: u16) -> bool {
        if !self.contains(id) || self.marked.contains(&id) {
            return false;
        }
        self.marked.push(id);
        true
    }

    pub fn is_marked(&self, id: u16) -> bool {
        self.marked.contains(&id)
    }

    /// Sessions marked for removal, oldest first
    pub fn marked(&self) -> Vec<u16> {
        self.marked.clone()
    }

    /// Ids of every connected session in ascending order
    pub fn ids(&self) -> Vec<u16> {
        self.iter().map(|s| s.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut().filter_map(Option::as_mut)
    }

    /// Finds a logged in session by account name, ignoring case
    pub fn find_by_account(&self, account: &str) -> Option<u16> {
        self.iter()
            .find(|s| s.is_logged_in() && s.account.name.eq_ignore_ascii_case(account))
            .map(|s| s.id)
    }

    /// Number of logged in player sessions (clients and RCs)
    pub fn player_count(&self) -> usize {
        self.iter()
            .filter(|s| s.is_client() || s.is_rc())
            .count()
    }

    /// Returns the number of connected sessions
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Role;

    #[test]
    fn test_registry_creation() {
        let registry = SessionRegistry::new(10);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.marked().is_empty());
    }

    #[test]
    fn test_add_session_skips_reserved_ids() {
        let mut registry = SessionRegistry::new(10);
        let first = registry.add_session("127.0.0.1", Instant::now()).unwrap();
        let second = registry.add_session("127.0.0.1", Instant::now()).unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 3);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(0).is_none());
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn test_ids_are_reused() {
        let mut registry = SessionRegistry::new(10);
        let a = registry.add_session("10.0.0.1", Instant::now()).unwrap();
        let _b = registry.add_session("10.0.0.2", Instant::now()).unwrap();
        assert!(registry.remove_session(a));
        let c = registry.add_session("10.0.0.3", Instant::now()).unwrap();
        assert_eq!(c, a);
        assert_eq!(registry.get(c).unwrap().ip, "10.0.0.3");
    }

    #[test]
    fn test_no_free_session_id() {
        let mut registry = SessionRegistry::new(3);
        registry.add_session("a", Instant::now()).unwrap();
        registry.add_session("b", Instant::now()).unwrap();
        let result = registry.add_session("c", Instant::now());
        assert!(matches!(result, Err(ServerError::NoFreeSessionId)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_nonexistent_session() {
        let mut registry = SessionRegistry::new(10);
        assert!(!registry.remove_session(999));
        assert!(!registry.remove_session(2));
    }

    #[test]
    fn test_mark_for_removal_once() {
        let mut registry = SessionRegistry::new(10);
        let id = registry.add_session("127.0.0.1", Instant::now()).unwrap();
        assert!(registry.mark_for_removal(id));
        assert!(!registry.mark_for_removal(id));
        assert!(registry.is_marked(id));
        assert_eq!(registry.marked(), vec![id]);

        registry.remove_session(id);
        assert!(!registry.is_marked(id));
        assert!(!registry.mark_for_removal(id));
    }

    #[test]
    fn test_find_by_account() {
        let mut registry = SessionRegistry::new(10);
        let id = registry.add_session("127.0.0.1", Instant::now()).unwrap();
        {
            let session = registry.get_mut(id).unwrap();
            session.role = Role::Client3;
            session.account.name = "Stefan".to_string();
        }
        assert_eq!(registry.find_by_account("stefan"), Some(id));
        assert_eq!(registry.find_by_account("nobody"), None);
        assert_eq!(registry.player_count(), 1);
    }
}
