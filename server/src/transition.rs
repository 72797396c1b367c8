//! Level transitions: warping, level sync and leaving
//!
//! A warp resolves the target instance, leaves the old level, joins the new
//! one and syncs it. Sync is full when the session never saw the level, its
//! cache was reset, or the level changed on disk since the last visit;
//! otherwise only board changes made since the visit are sent.
//!
//! Failed warps fall back to the previous level, then to the unstick level.

use crate::error::{Disconnect, HandlerResult};
use crate::router::Scope;
use crate::server::Server;
use crate::utils::unix_time;
use crate::visibility::VISIBILITY;
use crate::world::{adjacent, LevelId, MapId};
use log::{debug, warn};
use shared::gstring::GWrite;
use shared::opcodes::*;
use shared::packet;
use shared::props::{PLPROP_ALIGNMENT, PLPROP_CURLEVEL, PLPROP_JOINLEAVELVL, PLPROP_X, PLPROP_Y};

/// RAWDATA announcement for a BOARDPACKET: opcode, 64x64 tiles, newline
const BOARD_RAW_LEN: u32 = 1 + 64 * 64 * 2 + 1;

impl Server {
    /// Moves a session to `name` at (`x`, `y`).
    ///
    /// `mod_time` is the client's cached copy of the level, `Some(0)` when
    /// it has none and `None` to trust the level's own time.
    pub fn warp(&mut self, id: u16, name: &str, x: f32, y: f32, mod_time: Option<u64>) -> HandlerResult {
        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let current = session
            .level
            .and_then(|l| self.world.level(l))
            .map(|l| l.name.clone());
        let (old_x, old_y) = session.position();

        if current.as_deref() == Some(name) {
            let mut props = Vec::new();
            props
                .write_gchar(PLPROP_X)
                .write_gchar((x * 2.0) as i32 as u8)
                .write_gchar(PLPROP_Y)
                .write_gchar((y * 2.0) as i32 as u8);
            return self.set_props(id, &props, true, true);
        }

        let unstick = self.settings().get_str("unstickmelevel", "onlinestartlocal.nw");
        let unstick_x = self.settings().get_float("unstickmex", 30.0);
        let unstick_y = self.settings().get_float("unstickmey", 35.0);

        self.leave_level(id, false);
        self.place_at(id, name, x, y);
        if self.set_level(id, name, mod_time) {
            return Ok(());
        }

        if let Some(previous) = current {
            debug!("Warp of session {} to {} failed, returning to {}", id, name, previous);
            self.place_at(id, &previous, old_x, old_y);
            if self.set_level(id, &previous, Some(0)) {
                return Ok(());
            }
        }

        warn!("Session {} has no level to return to, trying {}", id, unstick);
        if self.world.find_level(&unstick).is_some() {
            self.place_at(id, &unstick, unstick_x, unstick_y);
            if self.set_level(id, &unstick, Some(0)) {
                return Ok(());
            }
        }
        Err(Disconnect::with_reason("No level available."))
    }

    /// Sets the position and grid-map a session will have in `level`
    fn place_at(&mut self, id: u16, level: &str, x: f32, y: f32) {
        let map = self.world.map_for_level(level);
        if let Some(s) = self.registry.get_mut(id) {
            s.map = map;
            s.account.set_x(x);
            s.account.set_y(y);
        }
    }

    /// Joins the instance of `name` this session should see and syncs it.
    /// Sends WARPFAILED and returns false when the level does not exist.
    pub fn set_level(&mut self, id: u16, name: &str, mod_time: Option<u64>) -> bool {
        let Some(mut level_id) = self.world.find_level(name) else {
            let mut p = packet(PLO_WARPFAILED);
            p.write_bytes(name.as_bytes());
            self.send_to(id, &p);
            return false;
        };
        let Some(session) = self.registry.get(id) else {
            return false;
        };
        let map_id = session.map;
        let group = session.group.clone();
        let legacy = session.is_legacy_client();

        let singleplayer = self.world.level(level_id).map_or(false, |l| l.singleplayer);
        if singleplayer {
            let cached = session.singleplayer_levels.get(name).copied();
            level_id = match cached {
                Some(clone) => clone,
                None => {
                    let Some(clone) = self.world.clone_level(level_id) else {
                        return false;
                    };
                    if let Some(s) = self.registry.get_mut(id) {
                        s.singleplayer_levels.insert(name.to_string(), clone);
                    }
                    clone
                }
            };
        }

        let group_map = map_id
            .and_then(|m| self.world.map(m))
            .map_or(false, |m| m.group);
        if group_map && !group.is_empty() {
            self.hide_cached_occupants(id, level_id);
            match self.world.group_level(&group, name) {
                Some(instance) => level_id = instance,
                None => return false,
            }
        }

        let Some(level) = self.world.level_mut(level_id) else {
            return false;
        };
        level.add_player(id);
        let level_name = level.name.clone();
        let sparring = level.sparring;
        if let Some(s) = self.registry.get_mut(id) {
            s.level = Some(level_id);
            s.account.level_name = level_name.clone();
        }

        if mod_time == Some(0) || legacy {
            self.send_player_warp(id, &level_name, map_id, legacy);
        }

        if !self.sync_level(id, level_id, mod_time, false) {
            let mut p = packet(PLO_WARPFAILED);
            p.write_bytes(name.as_bytes());
            self.send_to(id, &p);
            return false;
        }

        // Full alignment is capped inside sparring zones
        let capped = sparring
            && self.registry.get_mut(id).is_some_and(|s| {
                if s.account.ap != 100 {
                    return false;
                }
                s.account.ap = 99;
                s.account.ap_counter = 1;
                true
            });
        if capped {
            let mut props = Vec::new();
            props.write_gchar(PLPROP_ALIGNMENT).write_gchar(99);
            if let Err(disconnect) = self.set_props(id, &props, true, true) {
                self.disconnect(id, disconnect.reason.as_deref());
            }
        }

        self.announce_location(id, map_id, group_map);
        true
    }

    fn send_player_warp(&mut self, id: u16, level_name: &str, map_id: Option<MapId>, legacy: bool) {
        let gmap = map_id
            .and_then(|m| self.world.map(m))
            .filter(|m| m.is_gmap())
            .map(|m| (m.name.clone(), m.position_of(level_name)));
        let Some(s) = self.registry.get_mut(id) else {
            return;
        };
        let a = &mut s.account;
        let p = match gmap {
            Some((map_name, cell)) if !legacy => {
                let (gx, gy) = cell.unwrap_or_default();
                a.gmap_level_x = gx as u8;
                a.gmap_level_y = gy as u8;
                let mut p = packet(PLO_PLAYERWARP2);
                p.write_gchar((a.x * 2.0) as i32 as u8)
                    .write_gchar((a.y * 2.0) as i32 as u8)
                    .write_gchar((a.z + 50.0) as i32 as u8)
                    .write_gchar(a.gmap_level_x)
                    .write_gchar(a.gmap_level_y)
                    .write_bytes(map_name.as_bytes());
                p
            }
            _ => {
                let mut p = packet(PLO_PLAYERWARP);
                p.write_gchar((a.x * 2.0) as i32 as u8)
                    .write_gchar((a.y * 2.0) as i32 as u8)
                    .write_bytes(level_name.as_bytes());
                p
            }
        };
        s.send(&p);
    }

    /// Group instances share a name with the base level; hide players the
    /// client may still have cached from it
    fn hide_cached_occupants(&mut self, id: u16, level_id: LevelId) {
        let Some(level) = self.world.level(level_id) else {
            return;
        };
        let name = level.name.clone();
        let occupants = level.players.clone();
        for other in occupants {
            let mut p = self.props_packet(other, None);
            p.write_gchar(PLPROP_CURLEVEL)
                .write_gchar((name.len() + 1 + 7) as u8)
                .write_bytes(name.as_bytes())
                .write_bytes(b".unknown")
                .write_gchar(PLPROP_X);
            p.extend(self.prop_value(other, PLPROP_X));
            p.write_gchar(PLPROP_Y);
            p.extend(self.prop_value(other, PLPROP_Y));
            self.send_to(id, &p);
        }
    }

    /// Tells everyone else the new location for their minimaps
    fn announce_location(&mut self, id: u16, map_id: Option<MapId>, group_map: bool) {
        let mut p = self.props_packet(id, None);
        for prop in [PLPROP_CURLEVEL, PLPROP_X, PLPROP_Y] {
            p.write_gchar(prop);
            p.extend(self.prop_value(id, prop));
        }
        let group = self.registry.get(id).map(|s| s.group.clone()).unwrap_or_default();
        let audience: Vec<u16> = self
            .registry
            .iter()
            .filter(|s| s.id != id)
            .filter(|s| !(map_id.is_some() && group_map && s.group != group))
            .map(|s| s.id)
            .collect();
        for other in audience {
            self.send_to(other, &p);
        }
    }

    /// Sends a level in the dialect the session speaks
    pub fn sync_level(&mut self, id: u16, level_id: LevelId, mod_time: Option<u64>, from_adjacent: bool) -> bool {
        let legacy = self.registry.get(id).is_some_and(|s| s.is_legacy_client());
        if legacy {
            self.send_level_141(id, level_id, mod_time, from_adjacent)
        } else {
            self.send_level(id, level_id, mod_time, from_adjacent)
        }
    }

    /// Cached leave time if the cached copy is still usable, else 0
    fn cached_since(&self, id: u16, level_id: LevelId) -> u64 {
        let cached = self.registry.get(id).and_then(|s| s.cached_visit(level_id));
        let level_time = self.world.level(level_id).map_or(0, |l| l.mod_time());
        match cached {
            Some(t) if t != 0 && level_time <= t => t,
            _ => 0,
        }
    }

    fn send_level(&mut self, id: u16, level_id: LevelId, mod_time: Option<u64>, from_adjacent: bool) -> bool {
        let since = self.cached_since(id, level_id);
        let Some(session) = self.registry.get(id) else {
            return false;
        };
        let Some(level) = self.world.level(level_id) else {
            return false;
        };
        let map = session.map.and_then(|m| self.world.map(m));
        let gmap_name = map.filter(|m| m.is_gmap()).map(|m| m.name.clone());
        let on_map = map.is_some();
        let level_time = level.mod_time();
        let client_time = mod_time.unwrap_or(level_time);

        let mut out: Vec<Vec<u8>> = Vec::new();
        let mut name = packet(PLO_LEVELNAME);
        name.write_bytes(level.name.as_bytes());
        out.push(name);

        if since == 0 {
            if client_time != level_time {
                let mut raw = packet(PLO_RAWDATA);
                raw.write_gint(BOARD_RAW_LEN);
                out.push(raw);
                out.push(level.board_packet());
            }
            let mut p = packet(PLO_LEVELMODTIME);
            p.write_gint5(level_time);
            out.push(p);
            out.extend(level.link_packets());
            out.extend(level.sign_packets());
        }

        if !from_adjacent {
            out.extend(level.board_changes_since(since));
            out.extend(level.chest_packets(&session.account.opened_chests));
            out.extend(level.horse_packets());
            out.extend(level.baddy_packets());
        }

        if let Some(map_name) = &gmap_name {
            let mut p = packet(PLO_LEVELNAME);
            p.write_bytes(map_name.as_bytes());
            out.push(p);
        }

        let mut ghost = packet(PLO_GHOSTICON);
        ghost.write_gchar(0);
        out.push(ghost);

        if !from_adjacent || on_map {
            if level.leader() == Some(id) || level.singleplayer {
                out.push(packet(PLO_ISLEADER));
            }
        }

        let mut time = packet(PLO_NEWWORLDTIME);
        time.write_gint4(self.world_time());
        out.push(time);

        if !from_adjacent || on_map {
            let mut active = packet(PLO_SETACTIVELEVEL);
            active.write_bytes(gmap_name.as_deref().unwrap_or(&level.name).as_bytes());
            out.push(active);
            out.extend(level.npc_packets());
        }

        self.send_all_to(id, &out);
        self.exchange_props(id, level_id);
        true
    }

    fn send_level_141(&mut self, id: u16, level_id: LevelId, mod_time: Option<u64>, from_adjacent: bool) -> bool {
        let since = self.cached_since(id, level_id);
        let serverside = self.settings().get_bool("serverside", false);
        let Some(session) = self.registry.get(id) else {
            return false;
        };
        let Some(level) = self.world.level(level_id) else {
            return false;
        };
        let first_level = !session.first_level_sent;
        let level_time = level.mod_time();
        let client_time = mod_time.unwrap_or(level_time);

        let mut out: Vec<Vec<u8>> = Vec::new();
        if since != 0 {
            out.extend(level.board_changes_since(since));
        } else {
            if client_time != level_time {
                let mut raw = packet(PLO_RAWDATA);
                raw.write_gint(BOARD_RAW_LEN);
                out.push(raw);
                out.push(level.board_packet());
                if first_level {
                    let mut name = packet(PLO_LEVELNAME);
                    name.write_bytes(level.name.as_bytes());
                    out.push(name);
                }
                if !serverside {
                    out.extend(level.link_packets());
                    out.extend(level.sign_packets());
                }
                let mut p = packet(PLO_LEVELMODTIME);
                p.write_gint5(level_time);
                out.push(p);
            } else {
                out.push(packet(PLO_LEVELBOARD));
            }
            if !from_adjacent {
                out.extend(level.board_changes_since(0));
                out.extend(level.chest_packets(&session.account.opened_chests));
            }
        }

        if !from_adjacent {
            out.extend(level.horse_packets());
            out.extend(level.baddy_packets());
            if level.leader() == Some(id) || level.singleplayer {
                out.push(packet(PLO_ISLEADER));
            }
        }

        let mut time = packet(PLO_NEWWORLDTIME);
        time.write_gint4(self.world_time());
        out.push(time);

        if !from_adjacent {
            out.extend(level.npc_packets());
        }

        let board_sent = since == 0 && client_time != level_time;
        if let Some(s) = self.registry.get_mut(id) {
            s.send_all(&out);
            if board_sent {
                s.first_level_sent = true;
            }
        }
        if !from_adjacent {
            self.exchange_props(id, level_id);
        }
        true
    }

    /// Introduces the session to the players around it and back
    fn exchange_props(&mut self, id: u16, level_id: LevelId) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let in_singleplayer = session
            .level
            .and_then(|l| self.world.level(l))
            .map_or(true, |l| l.singleplayer);
        if in_singleplayer {
            return;
        }

        let map = session.map.filter(|_| !session.is_legacy_client());
        let mine = self.props_packet(id, Some(&VISIBILITY.get_login));
        let others = match map {
            Some(map_id) => {
                self.route(&mine, Scope::nearby(id));
                self.map_neighbours(id, map_id, level_id)
            }
            _ => {
                self.route(&mine, Scope::level(level_id, Some(id)));
                self.world
                    .level(level_id)
                    .map(|l| l.players.iter().copied().filter(|&p| p != id).collect())
                    .unwrap_or_default()
            }
        };
        for other in others {
            let p = self.props_packet(other, Some(&VISIBILITY.get_login));
            self.send_to(id, &p);
        }
    }

    /// Players on the same grid-map near `level_id`
    fn map_neighbours(&self, id: u16, map_id: MapId, level_id: LevelId) -> Vec<u16> {
        let (Some(me), Some(map)) = (self.registry.get(id), self.world.map(map_id)) else {
            return Vec::new();
        };
        let center = if map.is_gmap() {
            Some((i32::from(me.account.gmap_level_x), i32::from(me.account.gmap_level_y)))
        } else {
            self.world.level(level_id).and_then(|l| map.position_of(&l.name))
        };
        let Some(center) = center else {
            return Vec::new();
        };
        self.registry
            .iter()
            .filter(|s| s.id != id && s.map == Some(map_id))
            .filter(|s| !map.group || s.group == me.group)
            .filter(|s| {
                self.grid_position(s, map)
                    .is_some_and(|pos| adjacent(pos, center))
            })
            .map(|s| s.id)
            .collect()
    }

    /// Leaves the current level, remembering when for the client cache.
    /// `reset_cache` forces a full sync on the next visit.
    pub fn leave_level(&mut self, id: u16, reset_cache: bool) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let Some(level_id) = session.level else {
            return;
        };
        session.record_leave(level_id, reset_cache, unix_time());

        let leader = self.world.level_mut(level_id).and_then(|level| {
            level.remove_player(id);
            level.leader()
        });
        if let Some(leader) = leader {
            self.send_to(leader, &packet(PLO_ISLEADER));
        }

        let mut gone = self.props_packet(id, None);
        gone.write_gchar(PLPROP_JOINLEAVELVL).write_gchar(0);
        self.route(&gone, Scope::level(level_id, Some(id)));

        for other in self.audience(Scope::level(level_id, Some(id))) {
            let mut p = self.props_packet(other, None);
            p.write_gchar(PLPROP_JOINLEAVELVL).write_gchar(0);
            self.send_to(id, &p);
        }

        if let Some(s) = self.registry.get_mut(id) {
            s.level = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{opcodes_of, place, test_server};
    use assert_approx_eq::assert_approx_eq;
    use shared::props::PLSTATUS_DEAD;

    #[test]
    fn test_warp_to_same_level_only_moves() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        server.session_mut(id).unwrap().outbound = Default::default();

        server.warp(id, "a.nw", 5.0, 5.0, Some(0)).unwrap();

        let session = server.session(id).unwrap();
        assert_approx_eq!(session.account.x, 5.0);
        assert_eq!(opcodes_of(session), vec![PLO_PLAYERPROPS]);
    }

    #[test]
    fn test_warp_syncs_new_level() {
        let mut server = test_server(&["a.nw", "b.nw"]);
        let id = place(&mut server, "a.nw");
        server.session_mut(id).unwrap().outbound = Default::default();

        server.warp(id, "b.nw", 10.0, 12.0, Some(0)).unwrap();

        let session = server.session(id).unwrap();
        assert_eq!(session.account.level_name, "b.nw");
        let ops = opcodes_of(session);
        assert_eq!(ops[0], PLO_PLAYERWARP);
        assert!(ops.contains(&PLO_BOARDPACKET));
        assert!(ops.contains(&PLO_LEVELMODTIME));
        assert!(ops.contains(&PLO_ISLEADER));

        let old = server.world.find_level("a.nw").unwrap();
        assert!(server.world.level(old).unwrap().players.is_empty());
        assert!(server.session(id).unwrap().cached_visit(old).is_some());
    }

    #[test]
    fn test_revisit_is_incremental() {
        let mut server = test_server(&["a.nw", "b.nw"]);
        let id = place(&mut server, "a.nw");
        server.warp(id, "b.nw", 10.0, 10.0, Some(0)).unwrap();
        server.session_mut(id).unwrap().outbound = Default::default();

        server.warp(id, "a.nw", 10.0, 10.0, Some(0)).unwrap();
        let ops = opcodes_of(server.session(id).unwrap());
        assert!(!ops.contains(&PLO_LEVELMODTIME));
        assert!(!ops.contains(&PLO_BOARDPACKET));
    }

    #[test]
    fn test_failed_warp_returns_to_previous_level() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        server.warp(id, "missing.nw", 1.0, 1.0, Some(0)).unwrap();

        let session = server.session(id).unwrap();
        assert_eq!(session.account.level_name, "a.nw");
        assert!(opcodes_of(session).contains(&PLO_WARPFAILED));
    }

    #[test]
    fn test_failed_warp_without_fallback_disconnects() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        server.leave_level(id, false);
        let result = server.warp(id, "missing.nw", 1.0, 1.0, Some(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_singleplayer_levels_are_private() {
        let mut server = test_server(&["a.nw", "solo.nw"]);
        let first = place(&mut server, "a.nw");
        let second = place(&mut server, "a.nw");
        server.warp(first, "solo.nw", 1.0, 1.0, Some(0)).unwrap();
        server.warp(second, "solo.nw", 1.0, 1.0, Some(0)).unwrap();

        let a = server.session(first).unwrap().level.unwrap();
        let b = server.session(second).unwrap().level.unwrap();
        assert_ne!(a, b);

        server.warp(first, "a.nw", 1.0, 1.0, Some(0)).unwrap();
        server.warp(first, "solo.nw", 1.0, 1.0, Some(0)).unwrap();
        assert_eq!(server.session(first).unwrap().level, Some(a));
    }

    #[test]
    fn test_leaving_hands_over_leadership() {
        let mut server = test_server(&["a.nw", "b.nw"]);
        let first = place(&mut server, "a.nw");
        let second = place(&mut server, "a.nw");
        server.session_mut(second).unwrap().outbound = Default::default();

        server.leave_level(first, false);

        let level = server.world.find_level("a.nw").unwrap();
        assert_eq!(server.world.level(level).unwrap().leader(), Some(second));
        let ops = opcodes_of(server.session(second).unwrap());
        assert_eq!(ops, vec![PLO_ISLEADER, PLO_OTHERPLPROPS]);
        assert!(server.session(first).unwrap().level.is_none());
    }

    #[test]
    fn test_sparring_caps_alignment() {
        let mut server = test_server(&["a.nw", "arena.nw"]);
        let id = place(&mut server, "a.nw");
        {
            let account = &mut server.session_mut(id).unwrap().account;
            account.ap = 100;
            account.status &= !PLSTATUS_DEAD;
        }
        server.warp(id, "arena.nw", 1.0, 1.0, Some(0)).unwrap();
        assert_eq!(server.session(id).unwrap().account.ap, 99);
    }
}
