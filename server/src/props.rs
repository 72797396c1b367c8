//! Player property codec
//!
//! Every property id has its own wire form. [`Server::prop_value`] encodes
//! one property of a session, [`Server::set_props`] decodes a property packet
//! into the session and fans the accepted values out:
//!
//! - the global buffer goes to every other session,
//! - the level buffers go to the neighbourhood,
//! - the self buffer echoes clamped or rejected values back to the sender.
//!
//! Position props are mirrored between the half-tile and pixel forms so
//! clients on either side of 2.3 see the movement.

use crate::collab::FilterCheck;
use crate::error::HandlerResult;
use crate::router::Scope;
use crate::server::Server;
use crate::session::Session;
use crate::utils::{clip, extension};
use crate::visibility::{PropTable, VISIBILITY};
use log::debug;
use shared::gstring::{to_text, GReader, GWrite};
use shared::opcodes::*;
use shared::packet;
use shared::props::*;
use shared::RoleMask;
use std::net::Ipv4Addr;
use std::time::Instant;

const IMAGE_NAME_LIMIT: usize = 223;

/// Adds `.gif` to extensionless image names from 1.41 clients
fn legacy_image(mut name: String, legacy: bool) -> String {
    if legacy && !name.is_empty() && extension(&name).is_empty() {
        name.push_str(".gif");
    }
    name
}

fn default_image(base: &str, n: u8, legacy: bool) -> String {
    format!("{}{}{}", base, n, if legacy { ".gif" } else { ".png" })
}

impl Server {
    /// Encodes one property of a session, without the leading id
    pub fn encode_prop(&self, session: &Session, prop: u8) -> Vec<u8> {
        let a = &session.account;
        let mut out = Vec::new();
        match prop {
            PLPROP_NICKNAME => {
                out.write_gstring(a.nick.as_bytes());
            }
            PLPROP_MAXPOWER => {
                out.write_gchar(a.max_power);
            }
            PLPROP_CURPOWER => {
                out.write_gchar((a.power * 2.0) as i32 as u8);
            }
            PLPROP_RUPEESCOUNT => {
                out.write_gint(a.rupees);
            }
            PLPROP_ARROWSCOUNT => {
                out.write_gchar(a.arrows);
            }
            PLPROP_BOMBSCOUNT => {
                out.write_gchar(a.bombs);
            }
            PLPROP_GLOVEPOWER => {
                out.write_gchar(a.glove_power);
            }
            PLPROP_BOMBPOWER => {
                out.write_gchar(a.bomb_power);
            }
            PLPROP_SWORDPOWER => {
                out.write_gchar(a.sword_power.wrapping_add(30))
                    .write_gstring(a.sword_image.as_bytes());
            }
            PLPROP_SHIELDPOWER => {
                out.write_gchar(a.shield_power.wrapping_add(10))
                    .write_gstring(a.shield_image.as_bytes());
            }
            PLPROP_GANI => {
                // 1.41 clients carry the bow in this slot
                if session.is_legacy_client() {
                    if a.bow_image.is_empty() {
                        out.write_gchar(a.bow_power);
                    } else {
                        out.write_gchar((10 + a.bow_image.len()) as u8)
                            .write_bytes(a.bow_image.as_bytes());
                    }
                } else {
                    out.write_gstring(a.gani.as_bytes());
                }
            }
            PLPROP_HEADGIF => {
                out.write_gchar((a.head_image.len() + 100) as u8)
                    .write_bytes(a.head_image.as_bytes());
            }
            PLPROP_CURCHAT => {
                out.write_gstring(a.chat.as_bytes());
            }
            PLPROP_COLORS => {
                for color in a.colors {
                    out.write_gchar(color);
                }
            }
            PLPROP_ID => {
                out.write_gshort(u32::from(session.id));
            }
            PLPROP_X => {
                out.write_gchar((a.x * 2.0) as i32 as u8);
            }
            PLPROP_Y => {
                out.write_gchar((a.y * 2.0) as i32 as u8);
            }
            PLPROP_Z => {
                out.write_gchar(((a.z + 0.5) + 50.0) as i32 as u8);
            }
            PLPROP_SPRITE => {
                out.write_gchar(a.sprite);
            }
            PLPROP_STATUS => {
                out.write_gchar(a.status);
            }
            PLPROP_CARRYSPRITE => {
                out.write_gchar(a.carry_sprite);
            }
            PLPROP_CURLEVEL => {
                self.encode_current_level(session, &mut out);
            }
            PLPROP_HORSEGIF => {
                out.write_gstring(a.horse_image.as_bytes());
            }
            PLPROP_HORSEBUSHES => {
                out.write_gchar(a.horse_bushes);
            }
            PLPROP_EFFECTCOLORS => {
                out.write_gchar(0);
            }
            PLPROP_CARRYNPC => {
                out.write_gint(a.carry_npc);
            }
            PLPROP_APCOUNTER => {
                out.write_gshort(u32::from(a.ap_counter) + 1);
            }
            PLPROP_MAGICPOINTS => {
                out.write_gchar(a.magic_points);
            }
            PLPROP_KILLSCOUNT => {
                out.write_gint(a.kills);
            }
            PLPROP_DEATHSCOUNT => {
                out.write_gint(a.deaths);
            }
            PLPROP_ONLINESECS => {
                out.write_gint(a.online_secs);
            }
            PLPROP_IPADDR => {
                let ip = session.ip.parse::<Ipv4Addr>().map_or(0, u32::from);
                out.write_gint5(u64::from(ip));
            }
            PLPROP_UDPPORT => {
                out.write_gint(a.udp_port);
            }
            PLPROP_ALIGNMENT => {
                out.write_gchar(a.ap);
            }
            PLPROP_ADDITFLAGS => {
                out.write_gchar(a.additional_flags);
            }
            PLPROP_ACCOUNTNAME => {
                out.write_gstring(a.name.as_bytes());
            }
            PLPROP_BODYIMG => {
                out.write_gstring(a.body_image.as_bytes());
            }
            PLPROP_RATING => {
                let packed = (((a.rating as i32) & 0xFFF) << 9) | ((a.deviation as i32) & 0x1FF);
                out.write_gint(packed as u32);
            }
            PLPROP_ATTACHNPC => {
                out.write_gchar(0).write_gint(a.attached_npc);
            }
            PLPROP_GMAPLEVELX => {
                out.write_gchar(a.gmap_level_x);
            }
            PLPROP_GMAPLEVELY => {
                out.write_gchar(a.gmap_level_y);
            }
            PLPROP_JOINLEAVELVL => {
                out.write_gchar(1);
            }
            PLPROP_PCONNECTED | PLPROP_UNKNOWN81 => {}
            PLPROP_PLANGUAGE => {
                out.write_gstring(a.language.as_bytes());
            }
            PLPROP_PSTATUSMSG => {
                let msg = if usize::from(a.status_msg) >= self.config.status_list.len() {
                    0
                } else {
                    a.status_msg
                };
                out.write_gchar(msg);
            }
            PLPROP_OSTYPE => {
                out.write_gstring(session.os_type.as_bytes());
            }
            PLPROP_TEXTCODEPAGE => {
                out.write_gint(session.codepage);
            }
            PLPROP_X2 => {
                out.write_gshort(encode_precise(a.x2));
            }
            PLPROP_Y2 => {
                out.write_gshort(encode_precise(a.y2));
            }
            PLPROP_Z2 => {
                out.write_gshort(encode_precise(a.z2));
            }
            PLPROP_COMMUNITYNAME => {
                out.write_gstring(a.community_name.as_bytes());
            }
            _ => {
                if let Some(slot) = attribute_slot(prop) {
                    if let Some(value) = a.attributes.get(slot) {
                        out.write_gstring(value.as_bytes());
                    }
                }
            }
        }
        out
    }

    fn encode_current_level(&self, session: &Session, out: &mut Vec<u8>) {
        if !session.is_client() {
            out.write_gchar(1).write_bytes(b" ");
            return;
        }
        let map = session.map.and_then(|m| self.world.map(m));
        if let Some(map) = map.filter(|m| m.is_gmap()) {
            out.write_gstring(map.name.as_bytes());
            return;
        }
        let name = &session.account.level_name;
        let singleplayer = session
            .level
            .and_then(|l| self.world.level(l))
            .map_or(false, |l| l.singleplayer);
        if singleplayer {
            out.write_gchar((name.len() + 13) as u8)
                .write_bytes(name.as_bytes())
                .write_bytes(b".singleplayer");
        } else {
            out.write_gstring(name.as_bytes());
        }
    }

    pub fn prop_value(&self, id: u16, prop: u8) -> Vec<u8> {
        self.registry
            .get(id)
            .map(|s| self.encode_prop(s, prop))
            .unwrap_or_default()
    }

    /// Appends `prop` and its current value to a props buffer
    fn append_prop(&self, buf: &mut Vec<u8>, id: u16, prop: u8) {
        buf.write_gchar(prop);
        buf.extend(self.prop_value(id, prop));
    }

    /// OTHERPLPROPS describing a session to others
    ///
    /// With no table only the header is built, which callers extend by hand.
    pub fn props_packet(&self, id: u16, table: Option<&PropTable>) -> Vec<u8> {
        let mut p = packet(PLO_OTHERPLPROPS);
        p.write_gshort(u32::from(id));
        let (Some(table), Some(session)) = (table, self.registry.get(id)) else {
            return p;
        };

        if session.is_client() && table[PLPROP_JOINLEAVELVL as usize] {
            p.write_gchar(PLPROP_JOINLEAVELVL).write_gchar(1);
        }
        let count = if session.is_legacy_client() {
            LEGACY_PROPS_COUNT
        } else {
            PROPS_COUNT
        };
        for (i, &visible) in table.iter().enumerate().take(count) {
            let prop = i as u8;
            if prop == PLPROP_JOINLEAVELVL {
                continue;
            }
            if prop == PLPROP_ATTACHNPC && session.account.attached_npc != 0 {
                p.write_gchar(prop);
                p.extend(self.encode_prop(session, prop));
            }
            if visible {
                p.write_gchar(prop);
                p.extend(self.encode_prop(session, prop));
            }
        }
        p
    }

    /// Sends a session its own props from a table as PLAYERPROPS
    pub fn send_props(&mut self, id: u16, table: &PropTable) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let count = if session.is_legacy_client() {
            LEGACY_PROPS_COUNT
        } else {
            PROPS_COUNT
        };
        let mut p = packet(PLO_PLAYERPROPS);
        for (i, _) in table.iter().enumerate().take(count).filter(|(_, v)| **v) {
            p.write_gchar(i as u8);
            p.extend(self.encode_prop(session, i as u8));
        }
        self.send_to(id, &p);
    }

    /// Checks a custom image name; default asset names are refused and
    /// unknown files are requested from the list server
    fn accept_image(&mut self, id: u16, name: &str) -> bool {
        if name.is_empty() {
            return true;
        }
        if self.config.is_default_file(name) {
            debug!("Session {} tried to use default file {} as a custom image", id, name);
            return false;
        }
        if !self.files.exists(name) {
            self.list.request_file(id, name);
        }
        true
    }

    /// Decodes a props packet into the session and forwards the result.
    ///
    /// `forward` sends locally visible props to the neighbourhood,
    /// `forward_to_self` echoes every applied prop back.
    pub fn set_props(&mut self, id: u16, data: &[u8], forward: bool, forward_to_self: bool) -> HandlerResult {
        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let legacy = session.is_legacy_client();
        let sword_limit = self.settings().get_int("swordlimit", 3).clamp(0, 255) as u8;
        let shield_limit = self.settings().get_int("shieldlimit", 3).clamp(0, 255) as u8;
        let heart_limit = self.settings().get_int("heartlimit", 3).clamp(0, 255) as u8;

        let mut reader = GReader::new(data);
        let mut global = Vec::new();
        let mut level_buf = Vec::new();
        let mut level_buf2 = Vec::new();
        let mut self_buf = Vec::new();
        let mut sign_check = false;
        let mut invalid = false;

        while !reader.is_empty() {
            let prop = reader.read_guchar();
            let mut skip_forward = false;
            let now = Instant::now();

            match prop {
                PLPROP_NICKNAME => {
                    let len = usize::from(reader.read_guchar());
                    let mut nick = to_text(reader.read_chars(len));
                    let outcome = self.filter.apply(&mut nick, FilterCheck::Nick);
                    if outcome.warned {
                        let empty = self.registry.get(id).map_or(true, |s| s.account.nick.is_empty());
                        if empty {
                            self.set_nick(id, "unknown", false);
                        }
                    } else {
                        self.set_nick(id, &nick, false);
                    }
                    self.append_prop(&mut global, id, prop);
                    if !forward_to_self {
                        self.append_prop(&mut self_buf, id, prop);
                    }
                }
                PLPROP_MAXPOWER => {
                    let max = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.set_max_power(max, heart_limit);
                        let full = f32::from(s.account.max_power);
                        s.account.set_power(full);
                    }
                    self.append_prop(&mut level_buf, id, PLPROP_CURPOWER);
                    self.append_prop(&mut self_buf, id, PLPROP_CURPOWER);
                }
                PLPROP_CURPOWER => {
                    let p = f32::from(reader.read_guchar()) / 2.0;
                    if let Some(s) = self.registry.get_mut(id) {
                        // Low alignment players cannot heal themselves
                        if !(s.account.ap < 40 && p > s.account.power) {
                            s.account.set_power(p);
                        }
                    }
                }
                PLPROP_RUPEESCOUNT => {
                    let v = reader.read_guint();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.rupees = clip(v, 0, 9_999_999);
                    }
                }
                PLPROP_ARROWSCOUNT => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.arrows = clip(v, 0, 99);
                    }
                }
                PLPROP_BOMBSCOUNT => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.bombs = clip(v, 0, 99);
                    }
                }
                PLPROP_GLOVEPOWER => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.glove_power = clip(v, 0, 3);
                    }
                }
                PLPROP_BOMBPOWER => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.bomb_power = clip(v, 0, 3);
                    }
                }
                PLPROP_SWORDPOWER => {
                    let raw = i32::from(reader.read_guchar());
                    let (power, image) = if raw <= 4 {
                        let sp = clip(raw, 0, i32::from(sword_limit)) as u8;
                        (sp, Some(default_image("sword", sp, legacy)))
                    } else {
                        let sp = clip(raw - 30, 0, i32::from(sword_limit)) as u8;
                        let len = usize::from(reader.read_guchar());
                        let name = legacy_image(to_text(reader.read_chars(len)), legacy);
                        let accepted = self.accept_image(id, &name);
                        (sp, accepted.then_some(name))
                    };
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.sword_power = power;
                        if let Some(image) = image {
                            s.account.sword_image = image;
                        }
                    }
                }
                PLPROP_SHIELDPOWER => {
                    let raw = i32::from(reader.read_guchar());
                    if raw <= 3 {
                        let sp = clip(raw, 0, i32::from(shield_limit)) as u8;
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.shield_power = sp;
                            s.account.shield_image = default_image("shield", sp, legacy);
                        }
                    } else if reader.is_empty() {
                        // 1.41 sends a bare power byte at the end of the packet
                        skip_forward = true;
                    } else if raw - 10 >= 0 {
                        let sp = clip(raw - 10, 0, i32::from(shield_limit)) as u8;
                        let len = usize::from(reader.read_guchar());
                        let name = legacy_image(to_text(reader.read_chars(len)), legacy);
                        let accepted = self.accept_image(id, &name);
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.shield_power = sp;
                            if accepted {
                                s.account.shield_image = name;
                            }
                        }
                    }
                }
                PLPROP_GANI => {
                    if legacy {
                        let sp = reader.read_guchar();
                        let bow = if sp < 10 {
                            (sp, String::new())
                        } else {
                            let name = to_text(reader.read_chars(usize::from(sp - 10)));
                            (10, legacy_image(name, true))
                        };
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.bow_power = bow.0;
                            s.account.bow_image = bow.1;
                        }
                    } else {
                        let len = usize::from(reader.read_guchar());
                        let gani = to_text(reader.read_chars(len));
                        let spin = gani == "spin";
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.gani = gani;
                        }
                        if spin {
                            self.spin_attack(id);
                        }
                    }
                }
                PLPROP_HEADGIF => {
                    let len = usize::from(reader.read_guchar());
                    let image = if len < 100 {
                        Some(default_image("head", len as u8, legacy))
                    } else if len > 100 {
                        let raw = to_text(reader.read_chars(len - 100));
                        let name = match raw.find('\n') {
                            Some(cut) if cut > 0 => raw[..cut].to_string(),
                            _ => raw,
                        };
                        let name = legacy_image(name, legacy);
                        self.accept_image(id, &name).then_some(name)
                    } else {
                        None
                    };
                    if len != 100 {
                        if let (Some(image), Some(s)) = (image, self.registry.get_mut(id)) {
                            s.account.head_image = image;
                        }
                        self.append_prop(&mut global, id, prop);
                    }
                }
                PLPROP_CURCHAT => {
                    let len = usize::from(reader.read_guchar()).min(IMAGE_NAME_LIMIT);
                    let mut chat = to_text(reader.read_chars(len));
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.chat = chat.clone();
                        s.last_chat = now;
                    }
                    if !self.process_chat(id, &chat)? {
                        let outcome = self.filter.apply(&mut chat, FilterCheck::Chat);
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.chat = chat;
                        }
                        if !forward_to_self && (outcome.replaced || outcome.warned) {
                            self.append_prop(&mut self_buf, id, prop);
                        }
                    }
                }
                PLPROP_COLORS => {
                    let mut colors = [0u8; 5];
                    for color in colors.iter_mut() {
                        *color = reader.read_guchar();
                    }
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.colors = colors;
                    }
                }
                PLPROP_ID => {
                    reader.read_gushort();
                }
                PLPROP_X | PLPROP_Y | PLPROP_Z => {
                    let v = f32::from(reader.read_guchar());
                    if let Some(s) = self.registry.get_mut(id) {
                        match prop {
                            PLPROP_X => s.account.set_x(v / 2.0),
                            PLPROP_Y => s.account.set_y(v / 2.0),
                            _ => s.account.set_z(v - 50.0),
                        }
                        s.account.status &= !PLSTATUS_PAUSED;
                        s.last_movement = now;
                        s.gr_movement_updated = true;
                    }
                    let mirrored = match prop {
                        PLPROP_X => PLPROP_X2,
                        PLPROP_Y => PLPROP_Y2,
                        _ => PLPROP_Z2,
                    };
                    self.append_prop(&mut level_buf2, id, mirrored);
                    sign_check |= prop == PLPROP_Y;
                }
                PLPROP_SPRITE => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.sprite = v;
                    }
                    sign_check = true;
                }
                PLPROP_STATUS => {
                    let status = reader.read_guchar();
                    self.apply_status(id, status, &mut self_buf, &mut level_buf);
                }
                PLPROP_CARRYSPRITE => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.carry_sprite = v;
                    }
                }
                PLPROP_CURLEVEL => {
                    let len = usize::from(reader.read_guchar());
                    let name = to_text(reader.read_chars(len));
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.level_name = name;
                    }
                }
                PLPROP_HORSEGIF => {
                    let len = usize::from(reader.read_guchar()).min(219);
                    let name = legacy_image(to_text(reader.read_chars(len)), legacy);
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.horse_image = name;
                    }
                }
                PLPROP_HORSEBUSHES => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.horse_bushes = v;
                    }
                }
                PLPROP_EFFECTCOLORS => {
                    if reader.read_guchar() > 0 {
                        reader.read_guint4();
                    }
                }
                PLPROP_CARRYNPC => {
                    let npc = reader.read_guint();
                    self.carry_npc(id, npc);
                }
                PLPROP_APCOUNTER => {
                    let v = reader.read_gushort();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.ap_counter = v;
                    }
                }
                PLPROP_MAGICPOINTS => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.magic_points = clip(v, 0, 100);
                    }
                }
                PLPROP_KILLSCOUNT | PLPROP_DEATHSCOUNT | PLPROP_ONLINESECS | PLPROP_RATING => {
                    reader.read_guint();
                }
                PLPROP_IPADDR => {
                    reader.read_guint5();
                }
                PLPROP_UDPPORT => {
                    let port = reader.read_guint();
                    let loaded = match self.registry.get_mut(id) {
                        Some(s) => {
                            s.account.udp_port = port;
                            s.loaded
                        }
                        None => false,
                    };
                    if loaded {
                        let mut p = packet(PLO_OTHERPLPROPS);
                        p.write_gshort(u32::from(id)).write_gchar(PLPROP_UDPPORT).write_gint(port);
                        self.route(&p, Scope::roles(RoleMask::ANY_CLIENT, id));
                    }
                }
                PLPROP_ALIGNMENT => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.ap = clip(v, 0, 100);
                    }
                }
                PLPROP_ADDITFLAGS => {
                    let v = reader.read_guchar();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.additional_flags = v;
                    }
                }
                PLPROP_ACCOUNTNAME | PLPROP_COMMUNITYNAME => {
                    let len = usize::from(reader.read_guchar());
                    reader.read_chars(len);
                }
                PLPROP_BODYIMG => {
                    let len = usize::from(reader.read_guchar());
                    let name = to_text(reader.read_chars(len));
                    if self.accept_image(id, &name) {
                        if let Some(s) = self.registry.get_mut(id) {
                            s.account.body_image = name;
                        }
                    }
                }
                PLPROP_ATTACHNPC => {
                    let _object_type = reader.read_guchar();
                    let npc = reader.read_guint();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.attached_npc = npc;
                    }
                    self.append_prop(&mut level_buf, id, PLPROP_ATTACHNPC);
                }
                PLPROP_GMAPLEVELX | PLPROP_GMAPLEVELY => {
                    let v = reader.read_guchar();
                    self.set_grid_cell(id, prop, v);
                }
                PLPROP_PCONNECTED => {}
                PLPROP_PLANGUAGE => {
                    let len = usize::from(reader.read_guchar());
                    let language = to_text(reader.read_chars(len));
                    if let Some(s) = self.registry.get_mut(id) {
                        s.account.language = language;
                    }
                }
                PLPROP_PSTATUSMSG => {
                    let msg = reader.read_guchar();
                    let loaded = match self.registry.get_mut(id) {
                        Some(s) => {
                            s.account.status_msg = msg;
                            s.loaded
                        }
                        None => false,
                    };
                    if loaded {
                        let mut p = packet(PLO_OTHERPLPROPS);
                        p.write_gshort(u32::from(id)).write_gchar(PLPROP_PSTATUSMSG).write_gchar(msg);
                        self.route(&p, Scope::all_except(id));
                    }
                }
                PLPROP_OSTYPE => {
                    let len = usize::from(reader.read_guchar());
                    let os = to_text(reader.read_chars(len));
                    if let Some(s) = self.registry.get_mut(id) {
                        s.os_type = os;
                    }
                }
                PLPROP_TEXTCODEPAGE => {
                    let v = reader.read_guint();
                    if let Some(s) = self.registry.get_mut(id) {
                        s.codepage = v;
                    }
                }
                PLPROP_X2 | PLPROP_Y2 | PLPROP_Z2 => {
                    let v = decode_precise(reader.read_gushort());
                    if let Some(s) = self.registry.get_mut(id) {
                        match prop {
                            PLPROP_X2 => s.account.set_x2(v),
                            PLPROP_Y2 => s.account.set_y2(v),
                            _ => s.account.set_z2(v),
                        }
                        s.account.status &= !PLSTATUS_PAUSED;
                        s.last_movement = now;
                        s.gr_movement_updated = true;
                    }
                    let mirrored = match prop {
                        PLPROP_X2 => PLPROP_X,
                        PLPROP_Y2 => PLPROP_Y,
                        _ => PLPROP_Z,
                    };
                    self.append_prop(&mut level_buf2, id, mirrored);
                    sign_check |= prop == PLPROP_Y2;
                }
                _ => match attribute_slot(prop) {
                    Some(slot) => {
                        let len = usize::from(reader.read_guchar());
                        let value = to_text(reader.read_chars(len));
                        if let Some(s) = self.registry.get_mut(id) {
                            if let Some(attr) = s.account.attributes.get_mut(slot) {
                                *attr = value;
                            }
                        }
                    }
                    None => {
                        debug!("Session {} sent unknown prop {} at {}", id, prop, reader.position());
                        invalid = true;
                        break;
                    }
                },
            }

            if skip_forward {
                continue;
            }
            if forward && VISIBILITY.send_on_local_change[usize::from(prop)] {
                self.append_prop(&mut level_buf, id, prop);
            }
            if forward_to_self {
                self.append_prop(&mut self_buf, id, prop);
            }
        }

        self.flush_props(id, global, level_buf, level_buf2, self_buf, sign_check);

        if invalid {
            return self.count_invalid_packet(id);
        }
        Ok(())
    }

    fn flush_props(
        &mut self,
        id: u16,
        global: Vec<u8>,
        level_buf: Vec<u8>,
        level_buf2: Vec<u8>,
        self_buf: Vec<u8>,
        sign_check: bool,
    ) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        if !(session.is_logged_in() && session.loaded) {
            return;
        }
        let precise = session.has_precise_movement();

        if !global.is_empty() {
            let mut p = self.props_packet(id, None);
            p.extend(global);
            self.route(&p, Scope::all_except(id));
        }
        if !level_buf.is_empty() {
            let mut p = self.props_packet(id, None);
            if precise {
                p.extend(level_buf2);
                p.extend(level_buf);
            } else {
                p.extend(level_buf);
                p.extend(level_buf2);
            }
            self.route(&p, Scope::nearby(id));
        }
        if !self_buf.is_empty() {
            let mut p = packet(PLO_PLAYERPROPS);
            p.extend(self_buf);
            self.send_to(id, &p);
        }
        if sign_check {
            self.test_sign(id);
        }
    }

    /// Applies a status byte; life and death side effects fire only on the
    /// edge
    fn apply_status(&mut self, id: u16, status: u8, self_buf: &mut Vec<u8>, level_buf: &mut Vec<u8>) {
        let Some(s) = self.registry.get_mut(id) else {
            return;
        };
        let was_dead = s.account.has_status(PLSTATUS_DEAD);
        s.account.status = status;
        let is_dead = s.account.has_status(PLSTATUS_DEAD);
        let level = s.level;

        if was_dead && !is_dead {
            let ap = s.account.ap;
            let max = f32::from(s.account.max_power);
            let base = if ap < 20 {
                3.0
            } else if ap < 40 {
                5.0
            } else {
                max
            };
            s.account.set_power(clip(base, 0.5, max));
            let half = (s.account.power * 2.0) as i32 as u8;
            self_buf.write_gchar(PLPROP_CURPOWER).write_gchar(half);
            level_buf.write_gchar(PLPROP_CURPOWER).write_gchar(half);

            let leads = level
                .and_then(|l| self.world.level(l))
                .is_some_and(|l| l.leader() == Some(id));
            if leads {
                self.send_to(id, &packet(PLO_ISLEADER));
            }
        }

        if !was_dead && is_dead {
            let Some(level_id) = level else {
                return;
            };
            let sparring = self.world.level(level_id).map_or(false, |l| l.sparring);
            if !sparring {
                if let Some(s) = self.registry.get_mut(id) {
                    s.account.deaths += 1;
                }
                self.drop_items_on_death(id);
            }

            let new_leader = self.world.level_mut(level_id).and_then(|l| {
                if l.leader() == Some(id) && l.players.len() > 1 {
                    l.remove_player(id);
                    l.add_player(id);
                    l.leader()
                } else {
                    None
                }
            });
            if let Some(leader) = new_leader {
                self.send_to(leader, &packet(PLO_ISLEADER));
            }
        }
    }

    fn spin_attack(&mut self, id: u16) {
        let Some(s) = self.registry.get(id) else {
            return;
        };
        let Some(level) = s.level else {
            return;
        };
        let mut base = packet(PLO_HITOBJECTS);
        base.write_gshort(u32::from(id)).write_gchar(s.account.sword_power);
        let hx = ((s.account.x + 1.5) * 2.0) as i32;
        let hy = ((s.account.y + 2.0) * 2.0) as i32;
        for (dx, dy) in [(0, -4), (0, 4), (-4, 0), (4, 0)] {
            let mut p = base.clone();
            p.write_gchar((hx + dx) as u8).write_gchar((hy + dy) as u8);
            self.route(&p, Scope::level(level, Some(id)));
        }
    }

    /// A carried NPC belongs to whoever picked it up first
    fn carry_npc(&mut self, id: u16, npc: u32) {
        let duplicates = self.settings().get_bool("duplicatecanbecarried", false);
        let taken = npc != 0
            && !duplicates
            && self
                .registry
                .iter()
                .any(|s| s.id != id && s.account.carry_npc == npc);

        let Some(s) = self.registry.get_mut(id) else {
            return;
        };
        if !taken {
            s.account.carry_npc = npc;
            return;
        }
        s.account.carry_npc = 0;
        let mut p = packet(PLO_PLAYERPROPS);
        p.write_gchar(PLPROP_CARRYNPC).write_gint(0);
        self.send_to(id, &p);

        let mut other = self.props_packet(id, None);
        other.write_gchar(PLPROP_CARRYNPC).write_gint(0);
        self.route(&other, Scope::nearby(id));
    }

    /// Moving between gmap cells changes the level
    fn set_grid_cell(&mut self, id: u16, prop: u8, value: u8) {
        let Some(s) = self.registry.get_mut(id) else {
            return;
        };
        if prop == PLPROP_GMAPLEVELX {
            s.account.gmap_level_x = value;
        } else {
            s.account.gmap_level_y = value;
        }
        let (gx, gy) = (i32::from(s.account.gmap_level_x), i32::from(s.account.gmap_level_y));
        let Some(map) = s.map.and_then(|m| self.world.map(m)) else {
            return;
        };
        let Some(name) = map.level_at(gx, gy).map(str::to_string) else {
            debug!("Session {} moved to empty gmap cell {},{}", id, gx, gy);
            return;
        };
        if let Some(s) = self.registry.get_mut(id) {
            s.account.level_name = name.clone();
        }
        self.leave_level(id, false);
        self.set_level(id, &name, None);
    }

    /// Splits `nick (guild)`, checks the guild and stores the nickname
    pub fn set_nick(&mut self, id: u16, requested: &str, force: bool) {
        let requested: String = requested.chars().take(223).collect();
        let (nick, guild) = match requested.find('(') {
            None => (requested.trim().to_string(), String::new()),
            Some(start) => {
                let end = requested[start..]
                    .find(')')
                    .map_or(requested.len(), |e| start + e);
                let guild = requested[start + 1..end].trim().trim_end_matches(')').to_string();
                (requested[..start].trim().to_string(), guild)
            }
        };

        let Some(session) = self.registry.get(id) else {
            return;
        };
        let is_rc = session.is_rc();
        let account = session.account.name.clone();

        if force || (guild == "RC" && is_rc) {
            if let Some(s) = self.registry.get_mut(id) {
                s.account.nick = requested;
                s.account.guild = guild;
            }
            return;
        }

        let mut nick = nick.trim_start_matches('*').to_string();
        if nick.is_empty() {
            nick = "unknown".to_string();
        }
        let new_nick = if nick == account {
            format!("*{}", nick)
        } else {
            nick.clone()
        };

        if guild.is_empty() {
            if let Some(s) = self.registry.get_mut(id) {
                s.account.nick = new_nick;
                s.account.guild.clear();
            }
            return;
        }

        if self.guild_lists_member(&guild, &account, &nick) {
            if let Some(s) = self.registry.get_mut(id) {
                s.account.nick = format!("{} ({})", new_nick, guild);
                s.account.guild = guild;
            }
            return;
        }

        if let Some(s) = self.registry.get_mut(id) {
            s.account.nick = new_nick.clone();
        }
        let mut ask_global = self.settings().get_bool("globalguilds", true);
        if !ask_global {
            ask_global = self
                .settings()
                .get_list("allowedglobalguilds")
                .iter()
                .any(|g| *g == guild);
        }
        if ask_global {
            self.list.verify_guild(id, &account, &new_nick, &guild);
        }
    }

    /// Local guild files list `account` or `account:nick` per line
    fn guild_lists_member(&self, guild: &str, account: &str, nick: &str) -> bool {
        let file = self
            .files
            .load(&format!("guilds/guild{}.txt", guild))
            .or_else(|| self.files.load(&format!("guilds/guild{}.txt", guild.replace(' ', "_"))));
        let Some(file) = file else {
            return false;
        };
        let text = to_text(&file.data);
        text.lines()
            .map(|line| line.trim_end_matches('\r'))
            .find(|line| {
                let name = line.split(':').next().unwrap_or_default();
                name.trim().eq_ignore_ascii_case(account)
            })
            .is_some_and(|line| match line.split_once(':') {
                Some((_, listed)) => listed.trim().trim_start_matches('*') == nick,
                None => true,
            })
    }

    /// Facing north in front of a sign shows its text
    fn test_sign(&mut self, id: u16) {
        if !self.settings().get_bool("serverside", false) {
            return;
        }
        let Some(s) = self.registry.get(id) else {
            return;
        };
        if s.account.sprite % 4 != 0 {
            return;
        }
        let (x, y) = s.position();
        let Some(level) = s.level.and_then(|l| self.world.level(l)) else {
            return;
        };
        let texts: Vec<String> = level
            .data
            .signs
            .iter()
            .filter(|sign| {
                let (sx, sy) = (f32::from(sign.x), f32::from(sign.y));
                y == sy && x >= sx - 1.5 && x <= sx + 0.5
            })
            .map(|sign| sign.text.replace('\n', "#b"))
            .collect();
        for text in texts {
            let mut p = packet(PLO_SAY2);
            p.write_bytes(text.as_bytes());
            self.send_to(id, &p);
        }
    }
}
