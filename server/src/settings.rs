//! Server configuration
//!
//! The configuration is a JSON document deserialised with serde. Missing keys
//! fall back to defaults; free-form settings are looked up with typed getters
//! that take the default at the call site.

use crate::error::ServerError;
use crate::utils::wildcard_match;
use crate::world::MapKind;
use serde::Deserialize;
use serde_json::Value;
use shared::versions::{client_version_id, VersionId};
use std::collections::HashMap;
use std::path::Path;

/// Files a client already ships with; never re-sent on UPDATEFILE
pub const DEFAULT_FILES: &[&str] = &[
    "carried.gani", "carry.gani", "carrystill.gani", "carrypeople.gani", "dead.gani",
    "def.gani", "ghostani.gani", "grab.gani", "gralats.gani", "hatoff.gani", "haton.gani",
    "hidden.gani", "hiddenstill.gani", "hurt.gani", "idle.gani", "kick.gani", "lava.gani",
    "lift.gani", "maps1.gani", "maps2.gani", "maps3.gani", "pull.gani", "push.gani",
    "ride.gani", "rideeat.gani", "ridefire.gani", "ridehurt.gani", "ridejump.gani",
    "ridestill.gani", "ridesword.gani", "shoot.gani", "sit.gani", "skip.gani", "sleep.gani",
    "spin.gani", "swim.gani", "sword.gani", "walk.gani", "walkslow.gani",
    "sword?.png", "sword?.gif", "shield?.png", "shield?.gif",
    "body.png", "body2.png", "body3.png",
    "arrow.wav", "arrowon.wav", "axe.wav", "bomb.wav", "chest.wav", "compudead.wav",
    "crush.wav", "dead.wav", "extra.wav", "fire.wav", "frog.wav", "frog2.wav", "goal.wav",
    "horse.wav", "horse2.wav", "item.wav", "item2.wav", "jump.wav", "lift.wav", "lift2.wav",
    "nextpage.wav", "put.wav", "sign.wav", "steps.wav", "steps2.wav", "stonemove.wav",
    "sword.wav", "swordon.wav", "thunder.wav", "water.wav",
    "pics1.png",
];

/// Free-form key/value settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: HashMap<String, Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_lowercase(), value.into());
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map_or(default, |v| v != 0.0),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => default,
        }
    }

    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        match self.get(key) {
            Some(Value::Number(n)) => n.as_f64().map_or(default, |v| v as f32),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Comma separated string or JSON array, trimmed, empties dropped
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::String(s)) => s
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// One grid-map definition
#[derive(Debug, Clone, Deserialize)]
pub struct MapConfig {
    pub name: String,
    pub kind: MapKind,
    /// Instanced per player group
    #[serde(default)]
    pub group: bool,
    /// Level names, row by row
    pub levels: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub settings: Settings,
    /// Version codes or `from:to` ranges; empty allows every client
    pub allowed_versions: Vec<String>,
    pub ip_bans: Vec<String>,
    pub staff: Vec<String>,
    pub status_list: Vec<String>,
    pub default_files: Vec<String>,
    pub singleplayer_levels: Vec<String>,
    pub sparring_levels: Vec<String>,
    pub maps: Vec<MapConfig>,
    pub word_filter: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Local Server".to_string(),
            settings: Settings::new(),
            allowed_versions: Vec::new(),
            ip_bans: Vec::new(),
            staff: Vec::new(),
            status_list: vec![
                "Online".to_string(),
                "Away".to_string(),
                "DND".to_string(),
                "Eating".to_string(),
                "Hiding".to_string(),
                "No PMs".to_string(),
            ],
            default_files: DEFAULT_FILES.iter().map(|s| s.to_string()).collect(),
            singleplayer_levels: Vec::new(),
            sparring_levels: Vec::new(),
            maps: Vec::new(),
            word_filter: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(text: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = serde_json::from_str(text)?;
        for entry in &config.allowed_versions {
            for code in entry.split(':') {
                if client_version_id(code.trim().as_bytes()) < 0 {
                    return Err(ServerError::InvalidSetting {
                        key: "allowed_versions".to_string(),
                        value: entry.clone(),
                    });
                }
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn is_version_allowed(&self, version: VersionId) -> bool {
        if self.allowed_versions.is_empty() {
            return true;
        }
        self.allowed_versions.iter().any(|entry| match entry.split_once(':') {
            Some((from, to)) => {
                let from = client_version_id(from.trim().as_bytes());
                let to = client_version_id(to.trim().as_bytes());
                version >= from && version <= to
            }
            None => client_version_id(entry.trim().as_bytes()) == version,
        })
    }

    pub fn allowed_versions_text(&self) -> String {
        self.allowed_versions.join(", ")
    }

    pub fn is_ip_banned(&self, ip: &str) -> bool {
        self.ip_bans.iter().any(|pattern| wildcard_match(pattern, ip))
    }

    pub fn is_staff(&self, account: &str) -> bool {
        self.staff.iter().any(|s| s.eq_ignore_ascii_case(account))
    }

    pub fn is_default_file(&self, name: &str) -> bool {
        self.default_files.iter().any(|pattern| wildcard_match(pattern, name))
    }

    pub fn is_jail_level(&self, level: &str) -> bool {
        self.settings
            .get_list("jaillevels")
            .iter()
            .any(|l| l == level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut settings = Settings::new();
        settings.set("apsystem", true);
        settings.set("maxnomovement", "600");
        settings.set("startx", 12.5);
        settings.set("jaillevels", "jail.nw, police.nw");

        assert!(settings.get_bool("apsystem", false));
        assert!(!settings.get_bool("missing", false));
        assert_eq!(settings.get_int("maxnomovement", 1200), 600);
        assert_eq!(settings.get_int("missing", 1200), 1200);
        assert_eq!(settings.get_float("startx", 30.0), 12.5);
        assert_eq!(settings.get_list("jaillevels"), vec!["jail.nw", "police.nw"]);
    }

    #[test]
    fn test_config_from_json() {
        let config = ServerConfig::from_json(
            r#"{
                "name": "Test",
                "settings": { "serverside": true, "unstickmelevel": "start.nw" },
                "allowed_versions": ["GNW13110:G3D0511C"],
                "ip_bans": ["10.0.*"],
                "maps": [{ "name": "world.gmap", "kind": "gmap", "levels": [["a.nw", "b.nw"]] }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.name, "Test");
        assert!(config.settings.get_bool("serverside", false));
        assert_eq!(config.maps[0].kind, MapKind::Gmap);
        assert!(!config.maps[0].group);
        assert!(config.is_ip_banned("10.0.3.4"));
        assert!(!config.is_ip_banned("127.0.0.1"));
        assert!(!config.status_list.is_empty());
    }

    #[test]
    fn test_version_ranges() {
        let mut config = ServerConfig::default();
        assert!(config.is_version_allowed(shared::versions::CLVER_1_41));

        config.allowed_versions = vec!["GNW13110:GNW14110".to_string(), "G3D0511C".to_string()];
        assert!(config.is_version_allowed(shared::versions::CLVER_2_1));
        assert!(config.is_version_allowed(shared::versions::CLVER_2_17));
        assert!(config.is_version_allowed(shared::versions::CLVER_6_015));
        assert!(!config.is_version_allowed(shared::versions::CLVER_2_3));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let result = ServerConfig::from_json(r#"{ "allowed_versions": ["NOPE0000"] }"#);
        assert!(matches!(result, Err(ServerError::InvalidSetting { .. })));
    }

    #[test]
    fn test_default_files() {
        let config = ServerConfig::default();
        assert!(config.is_default_file("sword3.png"));
        assert!(config.is_default_file("walk.gani"));
        assert!(!config.is_default_file("custom.png"));
    }
}
