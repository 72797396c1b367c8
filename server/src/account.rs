//! Persistent player state carried by a session

use shared::props::{PLSTATUS_ALLOWWEAPONS, PLSTATUS_MALE};
use std::collections::HashMap;

pub const DEFAULT_START_LEVEL: &str = "onlinestartlocal.nw";

/// Everything the account store would persist for one player
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub nick: String,
    pub guild: String,
    pub community_name: String,
    pub level_name: String,

    /// Half-unit tile position
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Pixel position (1/16 tile)
    pub x2: i32,
    pub y2: i32,
    pub z2: i32,
    pub gmap_level_x: u8,
    pub gmap_level_y: u8,

    pub power: f32,
    pub max_power: u8,
    pub rupees: u32,
    pub arrows: u8,
    pub bombs: u8,
    pub glove_power: u8,
    pub bomb_power: u8,
    pub sword_power: u8,
    pub sword_image: String,
    pub shield_power: u8,
    pub shield_image: String,
    pub bow_power: u8,
    pub bow_image: String,

    pub gani: String,
    pub head_image: String,
    pub body_image: String,
    pub horse_image: String,
    pub horse_bushes: u8,
    pub chat: String,
    pub colors: [u8; 5],
    pub sprite: u8,
    pub status: u8,
    pub carry_sprite: u8,
    pub carry_npc: u32,
    pub attached_npc: u32,

    pub ap: u8,
    pub ap_counter: u16,
    pub magic_points: u8,
    pub kills: u32,
    pub deaths: u32,
    pub online_secs: u32,
    pub udp_port: u32,
    pub additional_flags: u8,
    pub language: String,
    pub status_msg: u8,
    pub attributes: Vec<String>,

    pub rating: f32,
    pub deviation: f32,
    /// Unix seconds of the last sparring match
    pub last_sparring: u64,

    pub flags: HashMap<String, String>,
    pub opened_chests: Vec<String>,
    pub weapons: Vec<String>,
}

impl Account {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nick: String::new(),
            guild: String::new(),
            community_name: name.to_string(),
            level_name: DEFAULT_START_LEVEL.to_string(),
            x: 30.0,
            y: 30.5,
            z: 0.0,
            x2: 30 * 16,
            y2: (30.5 * 16.0) as i32,
            z2: 0,
            gmap_level_x: 0,
            gmap_level_y: 0,
            power: 3.0,
            max_power: 3,
            rupees: 0,
            arrows: 10,
            bombs: 5,
            glove_power: 1,
            bomb_power: 1,
            sword_power: 1,
            sword_image: "sword1.png".to_string(),
            shield_power: 1,
            shield_image: "shield1.png".to_string(),
            bow_power: 1,
            bow_image: String::new(),
            gani: "idle".to_string(),
            head_image: "head0.png".to_string(),
            body_image: "body.png".to_string(),
            horse_image: String::new(),
            horse_bushes: 0,
            chat: String::new(),
            colors: [2, 0, 10, 4, 18],
            sprite: 2,
            status: PLSTATUS_MALE | PLSTATUS_ALLOWWEAPONS,
            carry_sprite: 0,
            carry_npc: 0,
            attached_npc: 0,
            ap: 50,
            ap_counter: 0,
            magic_points: 0,
            kills: 0,
            deaths: 0,
            online_secs: 0,
            udp_port: 0,
            additional_flags: 0,
            language: "English".to_string(),
            status_msg: 0,
            attributes: vec![String::new(); 30],
            rating: 1500.0,
            deviation: 350.0,
            last_sparring: 0,
            flags: HashMap::new(),
            opened_chests: Vec::new(),
            weapons: Vec::new(),
        }
    }

    pub fn set_x(&mut self, x: f32) {
        self.x = x;
        self.x2 = (x * 16.0) as i32;
    }

    pub fn set_y(&mut self, y: f32) {
        self.y = y;
        self.y2 = (y * 16.0) as i32;
    }

    pub fn set_z(&mut self, z: f32) {
        self.z = z;
        self.z2 = (z * 16.0) as i32;
    }

    pub fn set_x2(&mut self, x2: i32) {
        self.x2 = x2;
        self.x = x2 as f32 / 16.0;
    }

    pub fn set_y2(&mut self, y2: i32) {
        self.y2 = y2;
        self.y = y2 as f32 / 16.0;
    }

    /// Z snaps to whole units when set from pixels
    pub fn set_z2(&mut self, z2: i32) {
        self.z2 = z2;
        self.z = ((z2 as f32 / 16.0) + 0.5).trunc();
    }

    pub fn set_power(&mut self, power: f32) {
        self.power = power.clamp(0.0, f32::from(self.max_power));
    }

    pub fn set_max_power(&mut self, max: u8, limit: u8) {
        self.max_power = max.min(limit);
    }

    pub fn has_status(&self, bit: u8) -> bool {
        self.status & bit != 0
    }

    pub fn set_flag(&mut self, name: &str, value: &str) {
        self.flags.insert(name.to_string(), value.to_string());
    }

    pub fn delete_flag(&mut self, name: &str) -> bool {
        self.flags.remove(name).is_some()
    }

    pub fn has_weapon(&self, name: &str) -> bool {
        self.weapons.iter().any(|w| w == name)
    }

    pub fn add_weapon(&mut self, name: &str) -> bool {
        if self.has_weapon(name) {
            return false;
        }
        self.weapons.push(name.to_string());
        true
    }

    pub fn delete_weapon(&mut self, name: &str) -> bool {
        let before = self.weapons.len();
        self.weapons.retain(|w| w != name);
        before != self.weapons.len()
    }
}
