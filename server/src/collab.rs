//! Interfaces to everything the protocol core does not own
//!
//! The core talks to the file system, the list server, the word filter, the
//! level loader and an optional script engine only through these traits.
//! Each trait has a local implementation so the binary runs on its own, plus
//! in-memory variants used by the tests.

use crate::error::ServerError;
use crate::world::LevelData;
use log::{debug, warn};
use shared::Role;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Contents and modification time of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub data: Vec<u8>,
    pub mod_time: u64,
}

pub trait FileSystem: Send {
    /// Loads a file by logical name
    fn load(&self, name: &str) -> Option<FileEntry>;

    fn mod_time(&self, name: &str) -> Option<u64> {
        self.load(name).map(|f| f.mod_time)
    }

    fn exists(&self, name: &str) -> bool {
        self.mod_time(name).is_some()
    }
}

/// Serves files from a directory tree, addressed by relative path or by
/// bare file name
#[derive(Debug)]
pub struct DirFileSystem {
    root: PathBuf,
    index: HashMap<String, PathBuf>,
}

impl DirFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let root = root.into();
        let mut index = HashMap::new();
        Self::scan(&root, &mut index)?;
        debug!("Indexed {} files under {}", index.len(), root.display());
        Ok(Self { root, index })
    }

    fn scan(dir: &Path, index: &mut HashMap<String, PathBuf>) -> Result<(), ServerError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::scan(&path, index)?;
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                index.entry(name.to_string()).or_insert_with(|| path.clone());
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.contains("..") {
            return None;
        }
        let direct = self.root.join(name);
        if direct.is_file() {
            return Some(direct);
        }
        self.index.get(name).cloned()
    }
}

impl FileSystem for DirFileSystem {
    fn load(&self, name: &str) -> Option<FileEntry> {
        let path = self.resolve(name)?;
        let data = std::fs::read(&path)
            .map_err(|e| warn!("Failed to read {}: {}", path.display(), e))
            .ok()?;
        let mod_time = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Some(FileEntry { data, mod_time })
    }
}

#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: HashMap<String, FileEntry>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>, mod_time: u64) {
        self.files.insert(
            name.to_string(),
            FileEntry {
                data: data.into(),
                mod_time,
            },
        );
    }
}

impl FileSystem for MemoryFileSystem {
    fn load(&self, name: &str) -> Option<FileEntry> {
        self.files.get(name).cloned()
    }
}

/// Answer of the list server to a login request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginVerdict {
    Accepted,
    Denied(String),
    /// The answer arrives later through `Server::account_verified`
    Deferred,
}

pub trait ServerList: Send {
    fn is_connected(&self) -> bool;
    fn verify_account(&mut self, id: u16, account: &str, password: &str, role: Role) -> LoginVerdict;
    fn add_player(&mut self, id: u16, account: &str, nick: &str, level: &str);
    fn delete_player(&mut self, id: u16, account: &str);
    fn request_file(&mut self, id: u16, name: &str);
    fn verify_guild(&mut self, id: u16, account: &str, nick: &str, guild: &str);
    fn server_warp(&mut self, id: u16, server: &str);
    /// Known servers with their player counts
    fn servers(&self) -> Vec<(String, u32)>;
    /// Profile lookup; the answer comes back addressed to `id`
    fn profile_get(&mut self, id: u16, request: &[u8]);
    fn profile_set(&mut self, id: u16, profile: &[u8]);
    /// Text requests and commands from client scripts (lister, pmservers, irc)
    fn request_text(&mut self, id: u16, text: &[u8]);
    fn send_text(&mut self, id: u16, account: &str, text: &[u8]);
    /// Private message to a player on another server (ids from 16000)
    fn pm_external(&mut self, from: &str, target: u16, message: &str);
}

/// Stand-alone list server: every account is accepted
#[derive(Debug, Clone)]
pub struct LocalServerList {
    name: String,
    players: HashMap<u16, String>,
}

impl LocalServerList {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            players: HashMap::new(),
        }
    }
}

impl ServerList for LocalServerList {
    fn is_connected(&self) -> bool {
        true
    }

    fn verify_account(&mut self, _id: u16, _account: &str, _password: &str, _role: Role) -> LoginVerdict {
        LoginVerdict::Accepted
    }

    fn add_player(&mut self, id: u16, account: &str, _nick: &str, _level: &str) {
        self.players.insert(id, account.to_string());
    }

    fn delete_player(&mut self, id: u16, _account: &str) {
        self.players.remove(&id);
    }

    fn request_file(&mut self, id: u16, name: &str) {
        debug!("Player {} wants {} which is not available locally", id, name);
    }

    fn verify_guild(&mut self, id: u16, account: &str, _nick: &str, guild: &str) {
        debug!("Global guild {} for {} ({}) cannot be verified locally", guild, account, id);
    }

    fn server_warp(&mut self, id: u16, server: &str) {
        debug!("Player {} asked to warp to server {}", id, server);
    }

    fn servers(&self) -> Vec<(String, u32)> {
        vec![(self.name.clone(), self.players.len() as u32)]
    }

    fn profile_get(&mut self, id: u16, _request: &[u8]) {
        debug!("Profiles are not kept locally ({})", id);
    }

    fn profile_set(&mut self, id: u16, _profile: &[u8]) {
        debug!("Profiles are not kept locally ({})", id);
    }

    fn request_text(&mut self, id: u16, text: &[u8]) {
        debug!("Text request from {}: {}", id, String::from_utf8_lossy(text));
    }

    fn send_text(&mut self, _id: u16, account: &str, text: &[u8]) {
        debug!("Text from {}: {}", account, String::from_utf8_lossy(text));
    }

    fn pm_external(&mut self, from: &str, target: u16, _message: &str) {
        debug!("No external player {} for a message from {}", target, from);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCheck {
    Chat,
    Nick,
    ToAll,
    PrivateMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    pub replaced: bool,
    pub warned: bool,
}

pub trait WordFilter: Send {
    /// Checks `text`, rewriting it in place when the filter replaces words
    fn apply(&self, text: &mut String, check: FilterCheck) -> FilterOutcome;
}

/// Blocks a configured list of words.
///
/// Chat has matches starred out; nicknames, toall and private messages are
/// replaced with a warning.
#[derive(Debug, Clone)]
pub struct ListWordFilter {
    words: Vec<String>,
    warn_message: String,
}

impl ListWordFilter {
    pub fn new(words: Vec<String>) -> Self {
        Self {
            words: words.into_iter().map(|w| w.to_lowercase()).filter(|w| !w.is_empty()).collect(),
            warn_message: "Watch your language!".to_string(),
        }
    }
}

impl WordFilter for ListWordFilter {
    fn apply(&self, text: &mut String, check: FilterCheck) -> FilterOutcome {
        let lower = text.to_lowercase();
        let hits: Vec<&String> = self.words.iter().filter(|w| lower.contains(w.as_str())).collect();
        if hits.is_empty() {
            return FilterOutcome::default();
        }

        match check {
            FilterCheck::Chat => {
                let mut out = lower.clone();
                for word in hits {
                    out = out.replace(word.as_str(), &"*".repeat(word.len()));
                }
                // Keep the original casing of everything that was not starred
                *text = text
                    .chars()
                    .zip(out.chars())
                    .map(|(orig, filtered)| if filtered == '*' { '*' } else { orig })
                    .collect();
                FilterOutcome {
                    replaced: true,
                    warned: false,
                }
            }
            _ => {
                *text = self.warn_message.clone();
                FilterOutcome {
                    replaced: false,
                    warned: true,
                }
            }
        }
    }
}

pub trait ScriptHost: Send {
    /// Creates the script-side object for a newly logged in player
    fn wrap_player(&mut self, id: u16);
    /// Queues a trigger action raised by a player at a level position
    fn queue_action(&mut self, level: &str, id: u16, action: &str, x: f32, y: f32);
    /// Whether a running script still holds the player
    fn is_referenced(&self, id: u16) -> bool;
    fn release(&mut self, id: u16);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoScripts;

impl ScriptHost for NoScripts {
    fn wrap_player(&mut self, _id: u16) {}

    fn queue_action(&mut self, _level: &str, _id: u16, _action: &str, _x: f32, _y: f32) {}

    fn is_referenced(&self, _id: u16) -> bool {
        false
    }

    fn release(&mut self, _id: u16) {}
}

pub trait LevelSource: Send {
    fn load(&self, name: &str) -> Option<LevelData>;
}

/// Levels exist when their file is present; content starts empty
pub struct StaticLevelSource {
    files: Box<dyn FileSystem>,
}

impl StaticLevelSource {
    pub fn new(files: Box<dyn FileSystem>) -> Self {
        Self { files }
    }
}

impl LevelSource for StaticLevelSource {
    fn load(&self, name: &str) -> Option<LevelData> {
        let mod_time = self.files.mod_time(name)?;
        Some(LevelData::empty(mod_time))
    }
}

#[derive(Debug, Default)]
pub struct MemoryLevelSource {
    levels: HashMap<String, LevelData>,
}

impl MemoryLevelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: LevelData) {
        self.levels.insert(name.to_string(), data);
    }

    pub fn with_level(mut self, name: &str, data: LevelData) -> Self {
        self.insert(name, data);
        self
    }
}

impl LevelSource for MemoryLevelSource {
    fn load(&self, name: &str) -> Option<LevelData> {
        self.levels.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_file_system() {
        let mut fs = MemoryFileSystem::new();
        fs.insert("a.png", b"png".to_vec(), 42);
        assert_eq!(fs.mod_time("a.png"), Some(42));
        assert!(fs.exists("a.png"));
        assert!(fs.load("b.png").is_none());
    }

    #[test]
    fn test_dir_file_system_by_basename() {
        let root = std::env::temp_dir().join(format!("gserver-fs-{}", std::process::id()));
        let nested = root.join("images");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("head9.png"), b"data").unwrap();

        let fs = DirFileSystem::new(&root).unwrap();
        let entry = fs.load("head9.png").unwrap();
        assert_eq!(entry.data, b"data");
        assert!(entry.mod_time > 0);
        assert!(fs.load("images/head9.png").is_some());
        assert!(fs.load("../etc/passwd").is_none());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_word_filter_chat_replaces() {
        let filter = ListWordFilter::new(vec!["darn".to_string()]);
        let mut text = "Oh DARN it".to_string();
        let outcome = filter.apply(&mut text, FilterCheck::Chat);
        assert!(outcome.replaced);
        assert!(!outcome.warned);
        assert_eq!(text, "Oh **** it");
    }

    #[test]
    fn test_word_filter_warns_elsewhere() {
        let filter = ListWordFilter::new(vec!["darn".to_string()]);
        let mut text = "darn".to_string();
        assert!(filter.apply(&mut text, FilterCheck::ToAll).warned);
        assert_eq!(text, "Watch your language!");

        let mut clean = "hello".to_string();
        assert_eq!(filter.apply(&mut clean, FilterCheck::Nick), FilterOutcome::default());
    }

    #[test]
    fn test_local_server_list_counts_players() {
        let mut list = LocalServerList::new("Local");
        assert_eq!(list.verify_account(2, "bob", "pw", Role::Client), LoginVerdict::Accepted);
        list.add_player(2, "bob", "bob", "start.nw");
        assert_eq!(list.servers(), vec![("Local".to_string(), 1)]);
        list.delete_player(2, "bob");
        assert_eq!(list.servers()[0].1, 0);
    }
}
