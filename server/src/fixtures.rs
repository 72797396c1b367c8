//! Helpers shared by the unit tests

use crate::collab::{LoginVerdict, MemoryFileSystem, MemoryLevelSource, ServerList};
use crate::server::Server;
use crate::session::Session;
use crate::settings::ServerConfig;
use crate::world::LevelData;
use shared::versions::CLVER_2_31;
use shared::Role;
use std::sync::{Arc, Mutex};

/// A server holding empty levels with the given names.
///
/// `solo.nw` is singleplayer and `arena.nw` a sparring zone when listed.
pub(crate) fn test_server(levels: &[&str]) -> Server {
    let mut source = MemoryLevelSource::new();
    for name in levels {
        source.insert(name, LevelData::empty(1));
    }
    let mut config = ServerConfig::default();
    config.singleplayer_levels = vec!["solo.nw".to_string()];
    config.sparring_levels = vec!["arena.nw".to_string()];
    Server::new(config, Box::new(MemoryFileSystem::new()), Box::new(source)).with_seed(1)
}

/// Connects a loaded 2.31 client standing in `level` with an empty queue
pub(crate) fn place(server: &mut Server, level: &str) -> u16 {
    let id = server.connect("127.0.0.1").expect("free session id");
    let level_id = server.world.find_level(level).expect("level exists");
    let map = server.world.map_for_level(level);
    server.world.level_mut(level_id).expect("level loaded").add_player(id);

    let session = server.session_mut(id).expect("session exists");
    session.role = Role::Client3;
    session.version = CLVER_2_31;
    session.loaded = true;
    session.account.name = format!("player{}", id);
    session.account.level_name = level.to_string();
    session.level = Some(level_id);
    session.map = map;
    session.outbound = Default::default();
    id
}

/// Unbiased opcodes of everything queued for a session
pub(crate) fn opcodes_of(session: &Session) -> Vec<u8> {
    session
        .outbound
        .packets()
        .iter()
        .filter_map(|p| p.first())
        .map(|b| b.wrapping_sub(32))
        .collect()
}

/// List server that accepts everyone and remembers what it was asked to relay
#[derive(Clone, Default)]
pub(crate) struct RecordingList {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingList {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ServerList for RecordingList {
    fn is_connected(&self) -> bool {
        true
    }
    fn verify_account(&mut self, _id: u16, _account: &str, _password: &str, _role: Role) -> LoginVerdict {
        LoginVerdict::Accepted
    }
    fn add_player(&mut self, _id: u16, _account: &str, _nick: &str, _level: &str) {}
    fn delete_player(&mut self, _id: u16, _account: &str) {}
    fn request_file(&mut self, id: u16, name: &str) {
        self.record(format!("file {} {}", id, name));
    }
    fn verify_guild(&mut self, id: u16, _account: &str, _nick: &str, guild: &str) {
        self.record(format!("guild {} {}", id, guild));
    }
    fn server_warp(&mut self, _id: u16, _server: &str) {}
    fn servers(&self) -> Vec<(String, u32)> {
        Vec::new()
    }
    fn profile_get(&mut self, id: u16, request: &[u8]) {
        self.record(format!("profileget {} {}", id, String::from_utf8_lossy(request)));
    }
    fn profile_set(&mut self, id: u16, profile: &[u8]) {
        self.record(format!("profileset {} {}", id, String::from_utf8_lossy(profile)));
    }
    fn request_text(&mut self, id: u16, text: &[u8]) {
        self.record(format!("requesttext {} {}", id, String::from_utf8_lossy(text)));
    }
    fn send_text(&mut self, id: u16, account: &str, text: &[u8]) {
        self.record(format!("sendtext {} {} {}", id, account, String::from_utf8_lossy(text)));
    }
    fn pm_external(&mut self, from: &str, target: u16, message: &str) {
        self.record(format!("pm {} {} {}", from, target, message));
    }
}
