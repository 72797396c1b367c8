//! Levels, grid-maps and the level arena
//!
//! The world owns every level instance. Sessions and the transition manager
//! refer to levels by [`LevelId`]. Shared levels are loaded on first use;
//! singleplayer and group instances are clones of a shared level.

use crate::collab::LevelSource;
use crate::settings::ServerConfig;
use log::{debug, info};
use serde::Deserialize;
use shared::gstring::{GReader, GWrite};
use shared::opcodes::*;
use shared::packet;
use std::collections::{HashMap, HashSet};

pub const BOARD_WIDTH: usize = 64;
pub const BOARD_TILES: usize = BOARD_WIDTH * BOARD_WIDTH;
const MAX_BADDIES: usize = 50;
/// Lowest id handed to NPCs placed at runtime
pub const FIRST_NPC_ID: u32 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    /// One seamless grid; positions come from the player's grid coordinates
    Gmap,
    /// Independently addressed levels laid out on a grid
    Bigmap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sign {
    pub x: u8,
    pub y: u8,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chest {
    pub x: u8,
    pub y: u8,
    pub item: u8,
    pub sign_index: u8,
}

/// Static level content as provided by the level source
#[derive(Debug, Clone)]
pub struct LevelData {
    pub board: Vec<u16>,
    pub mod_time: u64,
    pub links: Vec<String>,
    pub signs: Vec<Sign>,
    pub chests: Vec<Chest>,
}

impl LevelData {
    pub fn empty(mod_time: u64) -> Self {
        Self {
            board: vec![0; BOARD_TILES],
            mod_time,
            links: Vec::new(),
            signs: Vec::new(),
            chests: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoardChange {
    pub x: u8,
    pub y: u8,
    pub width: u8,
    pub height: u8,
    pub tiles: Vec<u8>,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelItem {
    pub x: f32,
    pub y: f32,
    pub item: u8,
}

#[derive(Debug, Clone)]
pub struct Horse {
    pub x: f32,
    pub y: f32,
    pub dir: u8,
    pub bushes: u8,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct Baddy {
    pub id: u8,
    pub x: f32,
    pub y: f32,
    pub kind: u8,
    pub power: u8,
    pub image: String,
    /// Latest props reported by the level leader
    pub props: Vec<u8>,
}

impl Baddy {
    pub fn props_packet(&self) -> Vec<u8> {
        let mut p = packet(PLO_BADDYPROPS);
        p.write_gchar(self.id)
            .write_gchar((self.x * 2.0) as u8)
            .write_gchar((self.y * 2.0) as u8)
            .write_gchar(self.kind)
            .write_gchar(self.power)
            .write_gstring(self.image.as_bytes())
            .write_bytes(&self.props);
        p
    }
}

#[derive(Debug, Clone)]
pub struct Npc {
    pub id: u32,
    pub image: String,
    pub script: String,
    pub x: f32,
    pub y: f32,
}

impl Npc {
    pub fn props_packet(&self) -> Vec<u8> {
        let mut p = packet(PLO_NPCPROPS);
        p.write_gint(self.id)
            .write_gchar(0)
            .write_gstring(self.image.as_bytes())
            .write_gchar(2)
            .write_gchar((self.x * 2.0) as u8)
            .write_gchar(3)
            .write_gchar((self.y * 2.0) as u8);
        p
    }
}

/// One level instance
#[derive(Debug, Clone)]
pub struct Level {
    pub name: String,
    pub data: LevelData,
    pub players: Vec<u16>,
    pub board_changes: Vec<BoardChange>,
    pub items: Vec<LevelItem>,
    pub horses: Vec<Horse>,
    pub baddies: Vec<Baddy>,
    pub npcs: Vec<Npc>,
    pub singleplayer: bool,
    pub sparring: bool,
    /// Group tag when this is a group instance
    pub group: Option<String>,
}

impl Level {
    pub fn new(name: &str, data: LevelData) -> Self {
        Self {
            name: name.to_string(),
            data,
            players: Vec::new(),
            board_changes: Vec::new(),
            items: Vec::new(),
            horses: Vec::new(),
            baddies: Vec::new(),
            npcs: Vec::new(),
            singleplayer: false,
            sparring: false,
            group: None,
        }
    }

    pub fn mod_time(&self) -> u64 {
        self.data.mod_time
    }

    /// Adds a player; a player is never listed twice
    pub fn add_player(&mut self, id: u16) -> bool {
        if self.players.contains(&id) {
            return false;
        }
        self.players.push(id);
        true
    }

    pub fn remove_player(&mut self, id: u16) -> bool {
        let before = self.players.len();
        self.players.retain(|&p| p != id);
        before != self.players.len()
    }

    pub fn leader(&self) -> Option<u16> {
        self.players.first().copied()
    }

    pub fn tile(&self, x: usize, y: usize) -> u16 {
        self.data.board.get(x + y * BOARD_WIDTH).copied().unwrap_or(0)
    }

    /// Applies a rectangle of GShort-encoded tiles and records the change
    pub fn alter_board(&mut self, x: i8, y: i8, width: i8, height: i8, tiles: &[u8], now: u64) -> bool {
        if x < 0 || y < 0 || width <= 0 || height <= 0 {
            return false;
        }
        let (x, y, w, h) = (x as usize, y as usize, width as usize, height as usize);
        if x + w > BOARD_WIDTH || y + h > BOARD_WIDTH || tiles.len() < w * h * 2 {
            return false;
        }

        let mut reader = GReader::new(tiles);
        for row in y..y + h {
            for col in x..x + w {
                self.data.board[col + row * BOARD_WIDTH] = reader.read_gushort();
            }
        }

        self.board_changes.push(BoardChange {
            x: x as u8,
            y: y as u8,
            width: w as u8,
            height: h as u8,
            tiles: tiles[..w * h * 2].to_vec(),
            time: now,
        });
        true
    }

    /// BOARDMODIFY packets for every change recorded after `since`
    pub fn board_changes_since(&self, since: u64) -> Vec<Vec<u8>> {
        self.board_changes
            .iter()
            .filter(|c| c.time > since)
            .map(|c| {
                let mut p = packet(PLO_BOARDMODIFY);
                p.write_gchar(c.x)
                    .write_gchar(c.y)
                    .write_gchar(c.width)
                    .write_gchar(c.height)
                    .write_bytes(&c.tiles);
                p
            })
            .collect()
    }

    /// The full board as a raw BOARDPACKET body (two bytes per tile)
    pub fn board_packet(&self) -> Vec<u8> {
        let mut p = packet(PLO_BOARDPACKET);
        for tile in &self.data.board {
            p.extend_from_slice(&tile.to_le_bytes());
        }
        p
    }

    pub fn link_packets(&self) -> Vec<Vec<u8>> {
        self.data
            .links
            .iter()
            .map(|link| {
                let mut p = packet(PLO_LEVELLINK);
                p.write_bytes(link.as_bytes());
                p
            })
            .collect()
    }

    pub fn sign_packets(&self) -> Vec<Vec<u8>> {
        self.data
            .signs
            .iter()
            .map(|sign| {
                let mut p = packet(PLO_LEVELSIGN);
                p.write_gchar(sign.x)
                    .write_gchar(sign.y)
                    .write_bytes(sign.text.replace('\n', "#b").as_bytes());
                p
            })
            .collect()
    }

    pub fn chest_key(&self, chest: &Chest) -> String {
        format!("{}:{}:{}", chest.x, chest.y, self.name)
    }

    pub fn chest_at(&self, x: u8, y: u8) -> Option<&Chest> {
        self.data.chests.iter().find(|c| c.x == x && c.y == y)
    }

    /// LEVELCHEST packets; opened chests only carry their position
    pub fn chest_packets(&self, opened: &[String]) -> Vec<Vec<u8>> {
        self.data
            .chests
            .iter()
            .map(|chest| {
                let is_open = opened.contains(&self.chest_key(chest));
                let mut p = packet(PLO_LEVELCHEST);
                p.write_gchar(u8::from(is_open))
                    .write_gchar(chest.x)
                    .write_gchar(chest.y);
                if !is_open {
                    p.write_gchar(chest.item).write_gchar(chest.sign_index);
                }
                p
            })
            .collect()
    }

    pub fn add_item(&mut self, x: f32, y: f32, item: u8) {
        self.items.push(LevelItem { x, y, item });
    }

    /// Removes the item at a position and returns its type
    pub fn remove_item(&mut self, x: f32, y: f32) -> Option<u8> {
        let idx = self.items.iter().position(|i| i.x == x && i.y == y)?;
        Some(self.items.remove(idx).item)
    }

    pub fn add_horse(&mut self, horse: Horse) {
        self.horses.push(horse);
    }

    pub fn remove_horse(&mut self, x: f32, y: f32) {
        self.horses.retain(|h| !(h.x == x && h.y == y));
    }

    pub fn horse_packets(&self) -> Vec<Vec<u8>> {
        self.horses
            .iter()
            .map(|h| {
                let mut p = packet(PLO_HORSEADD);
                p.write_gchar((h.x * 2.0) as u8)
                    .write_gchar((h.y * 2.0) as u8)
                    .write_gchar((h.bushes << 2) | (h.dir & 0x03))
                    .write_bytes(h.image.as_bytes());
                p
            })
            .collect()
    }

    /// Adds a baddy with the lowest free id, up to a fixed limit
    pub fn add_baddy(&mut self, x: f32, y: f32, kind: u8) -> Option<&mut Baddy> {
        if self.baddies.len() >= MAX_BADDIES {
            return None;
        }
        let id = (1..=u8::MAX).find(|id| !self.baddies.iter().any(|b| b.id == *id))?;
        self.baddies.push(Baddy {
            id,
            x,
            y,
            kind,
            power: 1,
            image: String::new(),
            props: Vec::new(),
        });
        self.baddies.last_mut()
    }

    pub fn baddy_mut(&mut self, id: u8) -> Option<&mut Baddy> {
        self.baddies.iter_mut().find(|b| b.id == id)
    }

    pub fn baddy_packets(&self) -> Vec<Vec<u8>> {
        self.baddies.iter().map(Baddy::props_packet).collect()
    }

    pub fn npc_packets(&self) -> Vec<Vec<u8>> {
        self.npcs.iter().map(Npc::props_packet).collect()
    }

    pub fn has_npc(&self, id: u32) -> bool {
        self.npcs.iter().any(|n| n.id == id)
    }

    pub fn npc(&self, id: u32) -> Option<&Npc> {
        self.npcs.iter().find(|n| n.id == id)
    }

    pub fn remove_npc(&mut self, id: u32) -> Option<Npc> {
        let idx = self.npcs.iter().position(|n| n.id == id)?;
        Some(self.npcs.remove(idx))
    }
}

impl Npc {
    /// Weapon name declared by a `toweapons` statement in the script
    pub fn weapon_name(&self) -> Option<&str> {
        let start = self.script.find("toweapons ")? + "toweapons ".len();
        let rest = &self.script[start..];
        let end = rest.find(';').unwrap_or(rest.len());
        let name = rest[..end].trim();
        (!name.is_empty()).then_some(name)
    }
}

/// A grid of levels
#[derive(Debug, Clone)]
pub struct GridMap {
    pub name: String,
    pub kind: MapKind,
    pub group: bool,
    levels: Vec<Vec<String>>,
}

impl GridMap {
    pub fn new(name: &str, kind: MapKind, group: bool, levels: Vec<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            group,
            levels,
        }
    }

    pub fn is_gmap(&self) -> bool {
        self.kind == MapKind::Gmap
    }

    pub fn position_of(&self, level: &str) -> Option<(i32, i32)> {
        self.levels.iter().enumerate().find_map(|(y, row)| {
            row.iter()
                .position(|l| l == level)
                .map(|x| (x as i32, y as i32))
        })
    }

    pub fn level_at(&self, x: i32, y: i32) -> Option<&str> {
        if x < 0 || y < 0 {
            return None;
        }
        self.levels
            .get(y as usize)
            .and_then(|row| row.get(x as usize))
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn contains(&self, level: &str) -> bool {
        self.position_of(level).is_some()
    }
}

/// Two grid positions are neighbours when both deltas are below two
pub fn adjacent(a: (i32, i32), b: (i32, i32)) -> bool {
    (a.0 - b.0).abs() < 2 && (a.1 - b.1).abs() < 2
}

/// Owner of all level instances and grid-maps
pub struct World {
    levels: HashMap<LevelId, Level>,
    next_id: u32,
    shared: HashMap<String, LevelId>,
    group_levels: HashMap<String, HashMap<String, LevelId>>,
    maps: Vec<GridMap>,
    /// Level holding each runtime NPC
    npc_levels: HashMap<u32, LevelId>,
    source: Box<dyn LevelSource>,
    singleplayer: HashSet<String>,
    sparring: HashSet<String>,
}

impl World {
    pub fn new(source: Box<dyn LevelSource>, config: &ServerConfig) -> Self {
        let maps = config
            .maps
            .iter()
            .map(|m| GridMap::new(&m.name, m.kind, m.group, m.levels.clone()))
            .collect();
        Self {
            levels: HashMap::new(),
            next_id: 1,
            shared: HashMap::new(),
            group_levels: HashMap::new(),
            maps,
            npc_levels: HashMap::new(),
            source,
            singleplayer: config.singleplayer_levels.iter().cloned().collect(),
            sparring: config.sparring_levels.iter().cloned().collect(),
        }
    }

    fn insert(&mut self, level: Level) -> LevelId {
        let id = LevelId(self.next_id);
        self.next_id += 1;
        self.levels.insert(id, level);
        id
    }

    /// Resolves a shared level by name, loading it on first use
    pub fn find_level(&mut self, name: &str) -> Option<LevelId> {
        if let Some(id) = self.shared.get(name) {
            return Some(*id);
        }
        let data = self.source.load(name)?;
        let mut level = Level::new(name, data);
        level.singleplayer = self.singleplayer.contains(name);
        level.sparring = self.sparring.contains(name);
        let id = self.insert(level);
        self.shared.insert(name.to_string(), id);
        debug!("Loaded level {}", name);
        Some(id)
    }

    /// Copies a level's content into a fresh instance with no players
    pub fn clone_level(&mut self, source: LevelId) -> Option<LevelId> {
        let mut level = self.levels.get(&source)?.clone();
        level.players.clear();
        level.npcs.retain(|n| n.id < FIRST_NPC_ID);
        Some(self.insert(level))
    }

    /// The group's instance of a level, created on first use
    pub fn group_level(&mut self, group: &str, name: &str) -> Option<LevelId> {
        if let Some(id) = self.group_levels.get(group).and_then(|g| g.get(name)) {
            return Some(*id);
        }
        let base = self.find_level(name)?;
        let id = self.clone_level(base)?;
        if let Some(level) = self.levels.get_mut(&id) {
            level.group = Some(group.to_string());
        }
        self.group_levels
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), id);
        Some(id)
    }

    pub fn level(&self, id: LevelId) -> Option<&Level> {
        self.levels.get(&id)
    }

    pub fn level_mut(&mut self, id: LevelId) -> Option<&mut Level> {
        self.levels.get_mut(&id)
    }

    pub fn free_level(&mut self, id: LevelId) {
        if let Some(level) = self.levels.remove(&id) {
            for npc in &level.npcs {
                self.npc_levels.remove(&npc.id);
            }
        }
    }

    /// Places an NPC in a level under the lowest free runtime id
    pub fn add_npc(&mut self, level_id: LevelId, image: &str, script: &str, x: f32, y: f32) -> Option<u32> {
        let level = self.levels.get_mut(&level_id)?;
        let id = (FIRST_NPC_ID..=u32::MAX).find(|id| !self.npc_levels.contains_key(id))?;
        level.npcs.push(Npc {
            id,
            image: image.to_string(),
            script: script.to_string(),
            x,
            y,
        });
        self.npc_levels.insert(id, level_id);
        Some(id)
    }

    /// The level an NPC stands in
    pub fn npc_level(&self, id: u32) -> Option<LevelId> {
        self.npc_levels.get(&id).copied()
    }

    pub fn remove_npc(&mut self, id: u32) -> Option<Npc> {
        let level_id = self.npc_levels.remove(&id)?;
        self.levels.get_mut(&level_id)?.remove_npc(id)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn map(&self, id: MapId) -> Option<&GridMap> {
        self.maps.get(id.0)
    }

    pub fn map_for_level(&self, name: &str) -> Option<MapId> {
        self.maps.iter().position(|m| m.contains(name)).map(MapId)
    }

    /// Frees group instances nobody is standing in
    pub fn sweep_group_levels(&mut self) -> usize {
        let mut freed = Vec::new();
        for group in self.group_levels.values_mut() {
            group.retain(|_, id| {
                let empty = self.levels.get(id).map_or(true, |l| l.players.is_empty());
                if empty {
                    freed.push(*id);
                }
                !empty
            });
        }
        self.group_levels.retain(|_, g| !g.is_empty());
        for id in &freed {
            self.free_level(*id);
        }
        if !freed.is_empty() {
            info!("Freed {} empty group level instances", freed.len());
        }
        freed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryLevelSource;

    fn world_with(levels: &[&str]) -> World {
        let mut source = MemoryLevelSource::new();
        for name in levels {
            source.insert(name, LevelData::empty(100));
        }
        let mut config = ServerConfig::default();
        config.singleplayer_levels = vec!["solo.nw".to_string()];
        World::new(Box::new(source), &config)
    }

    #[test]
    fn test_find_level_loads_once() {
        let mut world = world_with(&["a.nw"]);
        let first = world.find_level("a.nw").unwrap();
        let second = world.find_level("a.nw").unwrap();
        assert_eq!(first, second);
        assert!(world.find_level("missing.nw").is_none());
        assert_eq!(world.level_count(), 1);
    }

    #[test]
    fn test_player_list_has_no_duplicates() {
        let mut level = Level::new("a.nw", LevelData::empty(0));
        assert!(level.add_player(3));
        assert!(!level.add_player(3));
        assert!(level.add_player(4));
        assert_eq!(level.leader(), Some(3));
        level.remove_player(3);
        assert_eq!(level.leader(), Some(4));
    }

    #[test]
    fn test_singleplayer_flag_from_config() {
        let mut world = world_with(&["solo.nw"]);
        let id = world.find_level("solo.nw").unwrap();
        assert!(world.level(id).unwrap().singleplayer);
    }

    #[test]
    fn test_group_instances_are_separate_and_swept() {
        let mut world = world_with(&["g.nw"]);
        let red = world.group_level("red", "g.nw").unwrap();
        let blue = world.group_level("blue", "g.nw").unwrap();
        assert_ne!(red, blue);
        assert_eq!(world.group_level("red", "g.nw"), Some(red));

        world.level_mut(red).unwrap().add_player(5);
        assert_eq!(world.sweep_group_levels(), 1);
        assert!(world.level(blue).is_none());
        assert!(world.level(red).is_some());
    }

    #[test]
    fn test_alter_board_records_change() {
        let mut level = Level::new("a.nw", LevelData::empty(0));
        let mut tiles = Vec::new();
        tiles.write_gshort(0x2ac).write_gshort(2);
        assert!(level.alter_board(10, 5, 2, 1, &tiles, 50));
        assert_eq!(level.tile(10, 5), 0x2ac);
        assert_eq!(level.tile(11, 5), 2);
        assert_eq!(level.board_changes_since(49).len(), 1);
        assert!(level.board_changes_since(50).is_empty());
        assert!(!level.alter_board(63, 0, 2, 1, &tiles, 51));
    }

    #[test]
    fn test_runtime_npc_ids_are_reused() {
        let mut world = world_with(&["a.nw"]);
        let level = world.find_level("a.nw").unwrap();
        let first = world.add_npc(level, "block.png", "", 10.0, 10.0).unwrap();
        let second = world.add_npc(level, "block.png", "", 12.0, 10.0).unwrap();
        assert_eq!(first, FIRST_NPC_ID);
        assert_eq!(second, FIRST_NPC_ID + 1);
        assert_eq!(world.npc_level(second), Some(level));

        assert!(world.remove_npc(first).is_some());
        assert!(!world.level(level).unwrap().has_npc(first));
        assert_eq!(world.add_npc(level, "x.png", "", 0.0, 0.0), Some(first));
    }

    #[test]
    fn test_npc_weapon_name() {
        let npc = Npc {
            id: 1,
            image: "sword.png".into(),
            script: "if (playertouchsme) { toweapons Magic Sword; }".into(),
            x: 0.0,
            y: 0.0,
        };
        assert_eq!(npc.weapon_name(), Some("Magic Sword"));
    }

    #[test]
    fn test_grid_positions() {
        let map = GridMap::new(
            "world.gmap",
            MapKind::Gmap,
            false,
            vec![
                vec!["a.nw".to_string(), "b.nw".to_string()],
                vec!["c.nw".to_string(), "d.nw".to_string()],
            ],
        );
        assert_eq!(map.position_of("d.nw"), Some((1, 1)));
        assert_eq!(map.level_at(0, 1), Some("c.nw"));
        assert_eq!(map.level_at(2, 0), None);
        assert!(adjacent((3, 3), (4, 4)));
        assert!(!adjacent((3, 3), (5, 5)));
    }

    #[test]
    fn test_chest_packets_hide_opened_content() {
        let mut data = LevelData::empty(0);
        data.chests.push(Chest {
            x: 4,
            y: 6,
            item: 10,
            sign_index: 0,
        });
        let level = Level::new("c.nw", data);
        let closed = level.chest_packets(&[]);
        assert_eq!(closed[0].len(), 6);
        let opened = level.chest_packets(&["4:6:c.nw".to_string()]);
        assert_eq!(opened[0].len(), 4);
    }
}
