//! Level items and what picking them up does
//!
//! Item types are fixed by the client. Picking one up is expressed as a
//! props packet that the session applies to itself, so every clamp in the
//! property codec still holds.

use crate::error::HandlerResult;
use crate::router::Scope;
use crate::server::Server;
use crate::utils::clip;
use log::debug;
use rand::Rng;
use shared::gstring::GWrite;
use shared::opcodes::{PLO_DEFAULTWEAPON, PLO_ITEMADD, PLO_PLAYERPROPS};
use shared::packet;
use shared::props::*;

pub const ITEM_NAMES: [&str; 25] = [
    "greenrupee",
    "bluerupee",
    "redrupee",
    "bombs",
    "darts",
    "heart",
    "glove1",
    "bow",
    "bomb",
    "shield",
    "sword",
    "fullheart",
    "superbomb",
    "battleaxe",
    "goldensword",
    "mirrorshield",
    "glove2",
    "lizardshield",
    "lizardsword",
    "goldrupee",
    "fireball",
    "fireblast",
    "nukeshot",
    "joltbomb",
    "spinattack",
];

pub const ITEM_BOMBS: u8 = 3;
pub const ITEM_DARTS: u8 = 4;
pub const ITEM_HEART: u8 = 5;
pub const ITEM_GOLDRUPEE: u8 = 19;

pub fn item_name(item: u8) -> Option<&'static str> {
    ITEM_NAMES.get(usize::from(item)).copied()
}

pub fn item_id(name: &str) -> Option<u8> {
    ITEM_NAMES.iter().position(|n| *n == name).map(|i| i as u8)
}

/// Weapons the client knows how to draw without a script
fn is_default_weapon(item: u8) -> bool {
    matches!(item, 7 | 8 | 12 | 20 | 21 | 22 | 23)
}

impl Server {
    /// Props a session gets from picking up `item`; empty when the item
    /// grants nothing new
    pub fn item_props(&self, id: u16, item: u8) -> Vec<u8> {
        let Some(session) = self.registry.get(id) else {
            return Vec::new();
        };
        let a = &session.account;
        let heart_limit = self.settings().get_int("heartlimit", 3).clamp(0, 255) as u8;
        let mut out = Vec::new();
        match item {
            0 | 1 | 2 | ITEM_GOLDRUPEE => {
                let value = match item {
                    0 => 1,
                    1 => 5,
                    2 => 30,
                    _ => 100,
                };
                out.write_gchar(PLPROP_RUPEESCOUNT).write_gint(a.rupees.saturating_add(value));
            }
            ITEM_BOMBS => {
                out.write_gchar(PLPROP_BOMBSCOUNT).write_gchar(clip(a.bombs + 5, 0, 99));
            }
            ITEM_DARTS => {
                out.write_gchar(PLPROP_ARROWSCOUNT).write_gchar(clip(a.arrows + 5, 0, 99));
            }
            ITEM_HEART => {
                let power = (a.power + 1.0).min(f32::from(a.max_power));
                out.write_gchar(PLPROP_CURPOWER).write_gchar((power * 2.0) as u8);
            }
            6 | 16 => {
                let glove = if item == 6 { 2 } else { 3 };
                if a.glove_power < glove {
                    out.write_gchar(PLPROP_GLOVEPOWER).write_gchar(glove);
                }
            }
            9 | 15 | 17 => {
                let shield = match item {
                    9 => 1,
                    15 => 2,
                    _ => 3,
                };
                if a.shield_power < shield {
                    out.write_gchar(PLPROP_SHIELDPOWER).write_gchar(shield);
                }
            }
            10 | 13 | 14 | 18 => {
                let sword = match item {
                    10 => 1,
                    13 => 2,
                    18 => 3,
                    _ => 4,
                };
                if a.sword_power < sword {
                    out.write_gchar(PLPROP_SWORDPOWER).write_gchar(sword);
                }
            }
            11 => {
                if a.max_power < heart_limit {
                    out.write_gchar(PLPROP_MAXPOWER).write_gchar(a.max_power + 1);
                }
            }
            24 => {
                out.write_gchar(PLPROP_STATUS).write_gchar(a.status | PLSTATUS_HASSPIN);
            }
            _ => {}
        }
        out
    }

    /// Applies an item to the session; default weapons join the weapon list
    pub fn give_item(&mut self, id: u16, item: u8) -> HandlerResult {
        if is_default_weapon(item) {
            let Some(name) = item_name(item) else {
                return Ok(());
            };
            let added = self
                .registry
                .get_mut(id)
                .is_some_and(|s| s.account.add_weapon(name));
            if added {
                let mut p = packet(PLO_DEFAULTWEAPON);
                p.write_gchar(item);
                self.send_to(id, &p);
            }
            return Ok(());
        }
        let props = self.item_props(id, item);
        if props.is_empty() {
            return Ok(());
        }
        self.set_props(id, &props, true, true)
    }

    /// Places an item in the session's level and shows it to the others.
    /// `x` and `y` are in half tiles, as on the wire.
    pub fn add_level_item(&mut self, id: u16, x: u8, y: u8, item: u8) {
        let Some(level_id) = self.registry.get(id).and_then(|s| s.level) else {
            return;
        };
        if let Some(level) = self.world.level_mut(level_id) {
            level.add_item(f32::from(x) / 2.0, f32::from(y) / 2.0, item);
        }
        let mut p = packet(PLO_ITEMADD);
        p.write_gchar(x).write_gchar(y).write_gchar(item);
        self.route(&p, Scope::level(level_id, Some(id)));
    }

    /// Drops an item for everyone, the dropping session included
    fn drop_item(&mut self, id: u16, x: f32, y: f32, item: u8) {
        let (hx, hy) = ((x * 2.0) as i32 as u8, (y * 2.0) as i32 as u8);
        self.add_level_item(id, hx, hy, item);
        let mut p = packet(PLO_ITEMADD);
        p.write_gchar(hx).write_gchar(hy).write_gchar(item);
        self.send_to(id, &p);
    }

    /// Scatters part of a dead player's gralats, arrows and bombs
    pub fn drop_items_on_death(&mut self, id: u16) {
        if !self.settings().get_bool("dropitemsdead", true) {
            return;
        }
        let min_gralats = self.settings().get_int("mindeathgralats", 1).max(0) as u32;
        let max_gralats = self.settings().get_int("maxdeathgralats", 50).max(0) as u32;

        let Some(session) = self.registry.get(id) else {
            return;
        };
        let (rupees, arrows, bombs) = (
            session.account.rupees,
            session.account.arrows,
            session.account.bombs,
        );

        let mut gralats = 0;
        if max_gralats > 0 {
            gralats = clip(self.rng.gen_range(0..max_gralats), min_gralats, max_gralats).min(rupees);
        }
        let mut drop_arrows = self.rng.gen_range(0..4u8);
        let mut drop_bombs = self.rng.gen_range(0..4u8);
        if drop_arrows * 5 > arrows {
            drop_arrows = arrows / 5;
        }
        if drop_bombs * 5 > bombs {
            drop_bombs = bombs / 5;
        }

        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let a = &mut session.account;
        a.rupees -= gralats;
        a.arrows -= drop_arrows * 5;
        a.bombs -= drop_bombs * 5;
        let mut p = packet(PLO_PLAYERPROPS);
        p.write_gchar(PLPROP_RUPEESCOUNT)
            .write_gint(a.rupees)
            .write_gchar(PLPROP_ARROWSCOUNT)
            .write_gchar(a.arrows)
            .write_gchar(PLPROP_BOMBSCOUNT)
            .write_gchar(a.bombs);
        let (x, y) = (a.x, a.y);
        session.send(&p);
        debug!(
            "Session {} dropped {} gralats, {} arrows, {} bombs",
            id, gralats, drop_arrows, drop_bombs
        );

        let mut drops = Vec::new();
        while gralats > 0 {
            let item = if gralats >= 100 {
                gralats -= 100;
                ITEM_GOLDRUPEE
            } else if gralats >= 30 {
                gralats -= 30;
                2
            } else if gralats >= 5 {
                gralats -= 5;
                1
            } else {
                gralats -= 1;
                0
            };
            drops.push(item);
        }
        drops.extend(std::iter::repeat(ITEM_DARTS).take(usize::from(drop_arrows)));
        drops.extend(std::iter::repeat(ITEM_BOMBS).take(usize::from(drop_bombs)));

        for item in drops {
            let dx = x + 1.5 + self.rng.gen_range(0..8) as f32 - 2.0;
            let dy = y + 2.0 + self.rng.gen_range(0..8) as f32 - 2.0;
            self.drop_item(id, dx, dy, item);
        }
    }

    /// Bushes and vases may leave an item behind when destroyed
    pub fn tile_drop(&mut self, id: u16, x: u8, y: u8, old_tile: u16) {
        let bush_items = self.settings().get_bool("bushitems", true);
        let vases_drop = self.settings().get_bool("vasesdrop", true);
        let drop_rate = self.settings().get_int("tiledroprate", 50);

        let item = match old_tile {
            2 | 0x1a4 | 0x1ff | 0x3ff if bush_items => {
                (drop_rate > 0 && i64::from(self.rng.gen_range(0..100u8)) < drop_rate)
                    .then(|| self.rng.gen_range(0..6u8))
            }
            0x2ac if vases_drop => Some(ITEM_HEART),
            _ => None,
        };
        if let Some(item) = item {
            let (hx, hy) = (x.wrapping_mul(2), y.wrapping_mul(2));
            self.add_level_item(id, hx, hy, item);
            let mut p = packet(PLO_ITEMADD);
            p.write_gchar(hx).write_gchar(hy).write_gchar(item);
            self.send_to(id, &p);
        }
    }
}
