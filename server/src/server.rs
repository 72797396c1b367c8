//! The protocol core: sessions, world and collaborators behind one owner
//!
//! Everything here runs on the main loop. Network tasks hand received bytes
//! to [`Server::receive`] and collect encoded output with
//! [`Server::take_outbound`]; nothing in the core blocks or locks.

use crate::collab::{
    FileSystem, ListWordFilter, LevelSource, LocalServerList, NoScripts, ScriptHost, ServerList,
    WordFilter,
};
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use crate::router::Scope;
use crate::session::Session;
use crate::settings::{ServerConfig, Settings};
use crate::utils::unix_time;
use crate::watchdog::ScriptWatchdog;
use crate::world::World;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::gstring::GWrite;
use shared::opcodes::*;
use shared::packet;
use shared::RoleMask;
use shared::props::PLPROP_PCONNECTED;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_MAX_SESSION_ID: i64 = 16000;

/// Last run of each periodic job
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timers {
    pub last_second: Instant,
    pub last_world_time: Instant,
    pub last_invalid_reset: Instant,
    pub last_group_sweep: Instant,
}

impl Timers {
    fn new(now: Instant) -> Self {
        Self {
            last_second: now,
            last_world_time: now,
            last_invalid_reset: now,
            last_group_sweep: now,
        }
    }
}

pub struct Server {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    pub world: World,
    pub files: Box<dyn FileSystem>,
    pub list: Box<dyn ServerList>,
    pub filter: Box<dyn WordFilter>,
    pub scripts: Box<dyn ScriptHost>,
    pub rng: StdRng,
    /// Guards script calls made from the main loop
    pub watchdog: ScriptWatchdog,
    /// `server.` flags shared by every player
    pub server_flags: HashMap<String, String>,
    pub(crate) timers: Timers,
}

impl Server {
    /// Creates a server with the local collaborators; swap them with the
    /// `with_*` builders
    pub fn new(config: ServerConfig, files: Box<dyn FileSystem>, levels: Box<dyn LevelSource>) -> Self {
        let max_id = config
            .settings
            .get_int("maxsessionids", DEFAULT_MAX_SESSION_ID)
            .clamp(2, i64::from(u16::MAX)) as u16;
        let script_limit = config.settings.get_float("scripttimeout", 5.0).max(0.1);
        let world = World::new(levels, &config);
        Self {
            list: Box::new(LocalServerList::new(&config.name)),
            filter: Box::new(ListWordFilter::new(config.word_filter.clone())),
            scripts: Box::new(NoScripts),
            registry: SessionRegistry::new(max_id),
            world,
            files,
            rng: StdRng::from_entropy(),
            watchdog: ScriptWatchdog::new(Duration::from_secs_f32(script_limit)),
            server_flags: HashMap::new(),
            timers: Timers::new(Instant::now()),
            config,
        }
    }

    pub fn with_server_list(mut self, list: Box<dyn ServerList>) -> Self {
        self.list = list;
        self
    }

    pub fn with_word_filter(mut self, filter: Box<dyn WordFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_scripts(mut self, scripts: Box<dyn ScriptHost>) -> Self {
        self.scripts = scripts;
        self
    }

    /// Fixes the random sequence used for drops
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    /// World clock sent with NEWWORLDTIME
    pub fn world_time(&self) -> u32 {
        (unix_time().saturating_sub(11078 * 24 * 60 * 60) / 5) as u32
    }

    /// Registers a freshly accepted connection
    pub fn connect(&mut self, ip: &str) -> Result<u16, ServerError> {
        self.registry.add_session(ip, Instant::now())
    }

    pub fn session(&self, id: u16) -> Option<&Session> {
        self.registry.get(id)
    }

    pub fn session_mut(&mut self, id: u16) -> Option<&mut Session> {
        self.registry.get_mut(id)
    }

    pub fn send_to(&mut self, id: u16, packet: &[u8]) {
        if let Some(session) = self.registry.get_mut(id) {
            session.send(packet);
        }
    }

    pub fn send_all_to(&mut self, id: u16, packets: &[Vec<u8>]) {
        if let Some(session) = self.registry.get_mut(id) {
            session.send_all(packets);
        }
    }

    /// Encodes and drains a session's queued packets
    pub fn take_outbound(&mut self, id: u16) -> Vec<u8> {
        self.registry
            .get_mut(id)
            .map(|s| s.outbound.flush())
            .unwrap_or_default()
    }

    /// Sessions with queued output
    pub fn pending_outbound(&self) -> Vec<u16> {
        self.registry
            .iter()
            .filter(|s| !s.outbound.is_empty())
            .map(|s| s.id)
            .collect()
    }

    /// Queues an optional disconnect message and marks the session for the
    /// next sweep
    pub fn disconnect(&mut self, id: u16, reason: Option<&str>) {
        if let Some(reason) = reason {
            let mut p = packet(PLO_DISCMESSAGE);
            p.write_bytes(reason.as_bytes());
            self.send_to(id, &p);
            info!("Disconnecting session {}: {}", id, reason);
        }
        self.delete_session(id);
    }

    /// The socket went away; nothing more can be sent
    pub fn mark_disconnected(&mut self, id: u16) {
        debug!("Connection for session {} closed", id);
        self.delete_session(id);
    }

    fn delete_session(&mut self, id: u16) {
        if !self.registry.mark_for_removal(id) {
            return;
        }
        if let Some(session) = self.registry.get(id) {
            if session.loaded {
                let account = session.account.name.clone();
                self.list.delete_player(id, &account);
            }
        }
    }

    /// Removes every marked session whose script references have drained.
    ///
    /// Returns the final encoded bytes of each removed session so the
    /// caller can write them before closing the socket.
    pub fn sweep(&mut self) -> Vec<(u16, Vec<u8>)> {
        let mut removed = Vec::new();
        for id in self.registry.marked() {
            if self.scripts.is_referenced(id) {
                continue;
            }
            self.depart(id);
            let bytes = self.take_outbound(id);
            self.registry.remove_session(id);
            removed.push((id, bytes));
        }
        removed
    }

    /// Leaves the level and announces that the session is gone
    fn depart(&mut self, id: u16) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let loaded = session.loaded;
        let has_level = session.level.is_some();
        let role = session.role;
        let account = session.account.name.clone();
        let clones: Vec<_> = session.singleplayer_levels.values().copied().collect();

        if loaded {
            if has_level {
                self.leave_level(id, false);
            }

            if !role.is_nc() {
                let mut gone = packet(PLO_OTHERPLPROPS);
                gone.write_gshort(u32::from(id)).write_gchar(PLPROP_PCONNECTED);
                self.route(&gone, Scope::roles(RoleMask::ANY_CLIENT, id));

                let mut del = packet(PLO_DELPLAYER);
                del.write_gshort(u32::from(id));
                self.route(&del, Scope::roles(RoleMask::ANY_RC, id));
            }

            if !account.is_empty() {
                if role.is_rc() {
                    let mut p = packet(PLO_RC_CHAT);
                    p.write_bytes(format!("RC Disconnected: {}", account).as_bytes());
                    self.route(&p, Scope::roles(RoleMask::ANY_RC, id));
                } else if role.is_nc() {
                    let mut p = packet(PLO_RC_CHAT);
                    p.write_bytes(format!("NC Disconnected: {}", account).as_bytes());
                    self.route(&p, Scope::roles(RoleMask::ANY_NC, id));
                }
            }

            info!("{} disconnected: {}", role.label(), account);
        }

        for level in clones {
            self.world.free_level(level);
        }
        self.scripts.release(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MemoryFileSystem, MemoryLevelSource};

    fn server() -> Server {
        Server::new(
            ServerConfig::default(),
            Box::new(MemoryFileSystem::new()),
            Box::new(MemoryLevelSource::new()),
        )
        .with_seed(1)
    }

    #[test]
    fn test_connect_assigns_ids_from_two() {
        let mut server = server();
        assert_eq!(server.connect("127.0.0.1").unwrap(), 2);
        assert_eq!(server.connect("127.0.0.1").unwrap(), 3);
    }

    #[test]
    fn test_disconnect_is_deferred_until_sweep() {
        let mut server = server();
        let id = server.connect("127.0.0.1").unwrap();
        server.disconnect(id, Some("bye"));
        assert!(server.session(id).is_some());

        let removed = server.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, id);
        assert!(!removed[0].1.is_empty());
        assert!(server.session(id).is_none());
        assert!(server.sweep().is_empty());
    }

    #[test]
    fn test_world_time_advances_from_epoch_offset() {
        let server = server();
        let expected = (unix_time() - 11078 * 24 * 60 * 60) / 5;
        assert!(u64::from(server.world_time()).abs_diff(expected) <= 1);
    }

    #[test]
    fn test_referenced_sessions_wait() {
        struct Holding;
        impl ScriptHost for Holding {
            fn wrap_player(&mut self, _id: u16) {}
            fn queue_action(&mut self, _level: &str, _id: u16, _action: &str, _x: f32, _y: f32) {}
            fn is_referenced(&self, _id: u16) -> bool {
                true
            }
            fn release(&mut self, _id: u16) {}
        }

        let mut server = server().with_scripts(Box::new(Holding));
        let id = server.connect("127.0.0.1").unwrap();
        server.mark_disconnected(id);
        assert!(server.sweep().is_empty());
        assert!(server.session(id).is_some());
    }
}
