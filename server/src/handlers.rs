//! Handlers for every client record
//!
//! Each handler reads its record through a [`GReader`] positioned after the
//! opcode and either answers, forwards or updates the world. Forwarded
//! records usually keep the sender's bytes and only swap the opcode for the
//! outbound one, prefixed with the sender id where the client expects it.

use crate::collab::FilterCheck;
use crate::error::{Disconnect, HandlerResult};
use crate::router::Scope;
use crate::server::Server;
use crate::utils::{clip, extension, unix_time};
use log::{debug, warn};
use shared::frame::FrameState;
use shared::gstring::{to_text, GReader, GWrite};
use shared::opcodes::*;
use shared::packet;
use shared::props::*;
use shared::versions::{CLVER_2_1, CLVER_2_14, CLVER_2_3};
use shared::RoleMask;
use std::time::{Duration, Instant};

/// Largest FILE packet body; bigger files go out in chunks
const FILE_CHUNK: usize = 32000;
/// Clients before 2.14 take a file in one piece up to this size
const LEGACY_FILE_LIMIT: usize = 64000;
const MESSAGE_LIMIT: usize = 1024;
const MESSAGE_INTERVAL: Duration = Duration::from_secs(4);
const PACKET_COUNT_LIMIT: u32 = 10000;
/// Players on other servers are numbered from here
const EXTERNAL_PLAYER_ID: u16 = 16000;

/// The unbiased opcode of the record being handled
fn opcode(reader: &GReader) -> u8 {
    reader.data().first().map_or(0, |b| b.wrapping_sub(32))
}

/// The record without its opcode
fn body<'a>(reader: &GReader<'a>) -> &'a [u8] {
    reader.data().get(1..).unwrap_or_default()
}

/// Forwarded record: new opcode, optional sender id, then the sender's bytes
fn forward(opcode: u8, sender: Option<u16>, rest: &[u8]) -> Vec<u8> {
    let mut p = packet(opcode);
    if let Some(id) = sender {
        p.write_gshort(u32::from(id));
    }
    p.write_bytes(rest);
    p
}

/// Adds `.gif` to extensionless names from pre-2.1 clients
fn legacy_file_name(mut name: String, legacy: bool) -> String {
    if legacy && extension(&name).is_empty() {
        name.push_str(".gif");
    }
    name
}

/// AP regeneration interval for an alignment bracket
pub(crate) fn ap_interval(server: &Server, ap: u8) -> u16 {
    let (key, default) = match ap {
        0..=19 => ("aptime0", 30),
        20..=39 => ("aptime1", 90),
        40..=59 => ("aptime2", 300),
        60..=79 => ("aptime3", 600),
        _ => ("aptime4", 1200),
    };
    server.settings().get_int(key, default).clamp(0, i64::from(u16::MAX)) as u16
}

/// One Glicko rating period between a winner and a loser.
///
/// Ratings are `(rating, deviation)`; returns the new winner and loser
/// ratings, clipped to the ranges the client can display.
pub fn glicko(winner: (f32, f32), loser: (f32, f32)) -> ((f32, f32), (f32, f32)) {
    const Q: f32 = 0.0057565;
    const PI: f32 = 3.14159265;
    let g = |rd: f32| 1.0 / (1.0 + 3.0 * Q.powi(2) * rd.powi(2) / PI.powi(2)).sqrt();

    let g_win = g(winner.1);
    let g_lose = g(loser.1);
    let e_win = 1.0 / (1.0 + 10f32.powf(-g_lose * (winner.0 - loser.0) / 400.0));
    let e_lose = 1.0 / (1.0 + 10f32.powf(-g_win * (loser.0 - winner.0) / 400.0));
    let d_win = 1.0 / (Q.powi(2) * g_win.powi(2) * e_win * (1.0 - e_win));
    let d_lose = 1.0 / (Q.powi(2) * g_lose.powi(2) * e_lose * (1.0 - e_lose));

    let win_rating = winner.0 + (Q / (1.0 / winner.1.powi(2) + 1.0 / d_win)) * (g_win * (1.0 - e_win));
    let lose_rating = loser.0 + (Q / (1.0 / loser.1.powi(2) + 1.0 / d_lose)) * (g_lose * (0.0 - e_lose));
    let win_dev = (1.0 / (1.0 / winner.1.powi(2) + 1.0 / d_win)).sqrt();
    let lose_dev = (1.0 / (1.0 / loser.1.powi(2) + 1.0 / d_lose)).sqrt();

    (
        (clip(win_rating, 0.0, 4000.0), clip(win_dev, 50.0, 350.0)),
        (clip(lose_rating, 0.0, 4000.0), clip(lose_dev, 50.0, 350.0)),
    )
}

pub(crate) fn ignore(_server: &mut Server, _id: u16, _reader: &mut GReader) -> HandlerResult {
    Ok(())
}

pub(crate) fn level_warp(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let mod_time = if opcode(reader) == PLI_LEVELWARPMOD {
        reader.read_guint5()
    } else {
        0
    };
    let x = f32::from(reader.read_gchar()) / 2.0;
    let y = f32::from(reader.read_gchar()) / 2.0;
    let name = to_text(reader.read_rest());
    server.warp(id, &name, x, y, Some(mod_time))
}

pub(crate) fn board_modify(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let x = reader.read_gchar();
    let y = reader.read_gchar();
    let width = reader.read_gchar();
    let height = reader.read_gchar();
    let tiles = reader.read_rest();

    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let legacy = session.is_legacy_client();
    let Some(level_id) = session.level else {
        return Ok(());
    };
    let in_bounds = (0..64).contains(&x) && (0..64).contains(&y);
    let Some(level) = server.world.level_mut(level_id) else {
        return Ok(());
    };
    let old_tile = if in_bounds {
        level.tile(x as usize, y as usize)
    } else {
        0
    };

    if level.alter_board(x, y, width, height, tiles, unix_time()) {
        let p = forward(PLO_BOARDMODIFY, None, body(reader));
        server.route(&p, Scope::level(level_id, None));
    }

    // 1.41 clients drop their own items
    if in_bounds && !legacy {
        server.tile_drop(id, x as u8, y as u8, old_tile);
    }
    Ok(())
}

pub(crate) fn player_props(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    server.set_props(id, reader.read_rest(), true, false)
}

pub(crate) fn npc_props(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let npc = reader.read_guint();
    let props = reader.read_rest();
    let level = server.session(id).and_then(|s| s.level);
    if level.is_none() || server.world.npc_level(npc) != level {
        return Ok(());
    }
    let mut p = packet(PLO_NPCPROPS);
    p.write_gint(npc).write_bytes(props);
    server.route(
        &p,
        Scope::Nearby {
            origin: id,
            include_self: false,
            only_gmap: true,
        },
    );
    Ok(())
}

/// Forwards a record to the sender's level, sender excluded
fn to_level(server: &mut Server, id: u16, p: &[u8]) {
    if let Some(level) = server.session(id).and_then(|s| s.level) {
        server.route(p, Scope::level(level, Some(id)));
    }
}

pub(crate) fn bomb_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_BOMBADD, Some(id), body(reader));
    to_level(server, id, &p);
    Ok(())
}

pub(crate) fn bomb_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_BOMBDEL, None, body(reader));
    to_level(server, id, &p);
    Ok(())
}

pub(crate) fn to_all(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    if server.config.is_jail_level(&session.account.level_name) {
        return Ok(());
    }
    let len = usize::from(reader.read_guchar());
    let mut message = to_text(reader.read_chars(len));

    let outcome = server.filter.apply(&mut message, FilterCheck::ToAll);
    if outcome.warned {
        let mut chat = Vec::new();
        chat.write_gchar(PLPROP_CURCHAT).write_gstring(message.as_bytes());
        return server.set_props(id, &chat, true, true);
    }

    let mut p = packet(PLO_TOALL);
    p.write_gshort(u32::from(id))
        .write_gchar(message.len() as u8)
        .write_bytes(message.as_bytes());
    let audience: Vec<u16> = server
        .registry
        .iter()
        .filter(|s| s.id != id && s.is_client())
        .filter(|s| s.account.additional_flags & PLFLAG_NOTOALL == 0)
        .map(|s| s.id)
        .collect();
    for other in audience {
        server.send_to(other, &p);
    }
    Ok(())
}

pub(crate) fn horse_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_HORSEADD, None, body(reader));
    to_level(server, id, &p);

    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    let dir_bushes = reader.read_guchar();
    let image = to_text(reader.read_rest());
    if let Some(level) = server.session(id).and_then(|s| s.level) {
        if let Some(level) = server.world.level_mut(level) {
            level.add_horse(crate::world::Horse {
                x,
                y,
                dir: dir_bushes & 0x03,
                bushes: dir_bushes >> 2,
                image,
            });
        }
    }
    Ok(())
}

pub(crate) fn horse_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_HORSEDEL, None, body(reader));
    to_level(server, id, &p);

    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    if let Some(level) = server.session(id).and_then(|s| s.level) {
        if let Some(level) = server.world.level_mut(level) {
            level.remove_horse(x, y);
        }
    }
    Ok(())
}

pub(crate) fn arrow_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_ARROWADD, Some(id), body(reader));
    to_level(server, id, &p);
    Ok(())
}

pub(crate) fn fire_spy(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_FIRESPY, Some(id), body(reader));
    to_level(server, id, &p);
    Ok(())
}

pub(crate) fn throw_carried(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_THROWCARRIED, Some(id), body(reader));
    to_level(server, id, &p);
    Ok(())
}

pub(crate) fn item_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    let item = reader.read_guchar();
    if let Some(level) = server.session(id).and_then(|s| s.level) {
        if let Some(level) = server.world.level_mut(level) {
            level.add_item(x, y, item);
        }
    }
    let p = forward(PLO_ITEMADD, None, body(reader));
    to_level(server, id, &p);
    Ok(())
}

/// ITEMDEL removes an item, ITEMTAKE also hands it to the sender
pub(crate) fn item_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_ITEMDEL, None, body(reader));
    to_level(server, id, &p);

    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    let Some(level) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    let item = server
        .world
        .level_mut(level)
        .and_then(|l| l.remove_item(x, y));
    match item {
        Some(item) if opcode(reader) == PLI_ITEMTAKE => server.give_item(id, item),
        _ => Ok(()),
    }
}

pub(crate) fn claim_pker(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let killer = reader.read_gushort();
    if killer == id || !server.session(killer).is_some_and(|s| s.is_client()) {
        return Ok(());
    }
    let Some(level) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    let sparring = server.world.level(level).is_some_and(|l| l.sparring);

    if sparring {
        rate_spar(server, killer, id);
        return Ok(());
    }

    if !server.settings().get_bool("dontchangekills", false) {
        if let Some(s) = server.session_mut(killer) {
            s.account.kills += 1;
        }
    }
    if !server.settings().get_bool("apsystem", true) {
        return Ok(());
    }

    let my_ap = server.session(id).map_or(0, |s| s.account.ap);
    let killer_ap = server.session(killer).map_or(0, |s| s.account.ap);
    if killer_ap == 0 || my_ap <= 19 {
        return Ok(());
    }
    let loss = (u32::from(killer_ap) / 20 + 1) * (u32::from(my_ap) / 20);
    let new_ap = u32::from(killer_ap).saturating_sub(loss) as u8;
    let interval = ap_interval(server, new_ap);
    if let Some(s) = server.session_mut(killer) {
        s.account.ap_counter = interval;
    }
    let mut props = Vec::new();
    props.write_gchar(PLPROP_ALIGNMENT).write_gchar(new_ap);
    server.set_props(killer, &props, true, true)
}

/// Sparring result: the winner and loser trade rating
fn rate_spar(server: &mut Server, winner: u16, loser: u16) {
    let (Some(w), Some(l)) = (server.session(winner), server.session(loser)) else {
        return;
    };
    if w.ip == l.ip {
        debug!("Ignoring spar between {} and {} from the same address", winner, loser);
        return;
    }
    let before_win = (w.account.rating, w.account.deviation);
    let before_lose = (l.account.rating, l.account.deviation);
    let (after_win, after_lose) = glicko(before_win, before_lose);
    let now = unix_time();

    for (id, before, after) in [(loser, before_lose, after_lose), (winner, before_win, after_win)] {
        let Some(s) = server.session_mut(id) else {
            continue;
        };
        s.account.last_sparring = now;
        if before != after {
            s.account.rating = after.0.trunc();
            s.account.deviation = after.1.trunc();
            server.send_rating(id);
        }
    }
}

pub(crate) fn baddy_props(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let baddy_id = reader.read_guchar();
    let props = reader.read_rest();
    let Some(level_id) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    let Some(level) = server.world.level_mut(level_id) else {
        return Ok(());
    };
    let leader = level.leader();
    let Some(baddy) = level.baddy_mut(baddy_id) else {
        return Ok(());
    };
    baddy.props = props.to_vec();

    let mut p = packet(PLO_BADDYPROPS);
    p.write_gchar(baddy_id).write_bytes(props);
    server.route(&p, Scope::level(level_id, leader));
    Ok(())
}

pub(crate) fn baddy_hurt(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let leader = server
        .session(id)
        .and_then(|s| s.level)
        .and_then(|l| server.world.level(l))
        .and_then(|l| l.leader());
    if let Some(leader) = leader {
        let p = forward(PLO_BADDYHURT, None, body(reader));
        server.send_to(leader, &p);
    }
    Ok(())
}

pub(crate) fn baddy_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    let kind = reader.read_guchar();
    let power = reader.read_guchar().min(12);
    let mut image = to_text(reader.read_rest());
    if !image.is_empty() && extension(&image).is_empty() {
        image.push_str(".gif");
    }

    let Some(level_id) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    let Some(level) = server.world.level_mut(level_id) else {
        return Ok(());
    };
    let Some(baddy) = level.add_baddy(x, y, kind) else {
        debug!("Level {} has no room for another baddy", level.name);
        return Ok(());
    };
    baddy.power = power;
    baddy.image = image;
    let p = baddy.props_packet();
    server.route(&p, Scope::level(level_id, None));
    Ok(())
}

/// Flags a client must never write
fn is_protected_flag(name: &str) -> bool {
    name.contains("this.") || name.contains("clientr.") || name.contains("serverr.")
}

pub(crate) fn flag_set(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let text = to_text(reader.read_rest());
    let (name, value) = match text.split_once('=') {
        Some((_, "")) => {
            reader.set_position(1);
            return flag_del(server, id, reader);
        }
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => (text.clone(), String::new()),
    };

    if name.contains("gr.") {
        if name == "gr.fileerror" || name == "gr.filedata" {
            return Ok(());
        }
        if server.settings().get_bool("flaghack_movement", true) {
            if let Some(prop) = match name.as_str() {
                "gr.x" => Some(PLPROP_X),
                "gr.y" => Some(PLPROP_Y),
                "gr.z" => Some(PLPROP_Z),
                _ => None,
            } {
                queue_gr_movement(server, id, prop, &value);
                return Ok(());
            }
        }
    }

    if is_protected_flag(&name) {
        return Ok(());
    }

    if name.contains("server.") {
        server.server_flags.insert(name.clone(), value.clone());
        let mut p = packet(PLO_FLAGSET);
        p.write_bytes(format!("{}={}", name, value).as_bytes());
        server.route(
            &p,
            Scope::Roles {
                mask: RoleMask::ANY_CLIENT,
                except: None,
            },
        );
        return Ok(());
    }

    if let Some(s) = server.session_mut(id) {
        s.account.set_flag(&name, &value);
    }
    Ok(())
}

/// Movement sent as `gr.` flags by scripts helping pre-2.3 clients
fn queue_gr_movement(server: &mut Server, id: u16, prop: u8, value: &str) {
    let Some(s) = server.session_mut(id) else {
        return;
    };
    if s.version >= CLVER_2_3 {
        return;
    }
    let pos: f32 = value.trim().parse().unwrap_or(0.0);
    let (current, encoded) = match prop {
        PLPROP_X => (s.account.x, (pos * 2.0) as i32 as u8),
        PLPROP_Y => (s.account.y, (pos * 2.0) as i32 as u8),
        _ => (s.account.z, ((pos + 0.5) + 50.0) as i32 as u8),
    };
    if pos != current {
        let mut props = Vec::new();
        props.write_gchar(prop).write_gchar(encoded);
        s.gr_movement.push(props);
    }
}

pub(crate) fn flag_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let text = to_text(reader.read_rest());
    let name = match text.split_once('=') {
        Some((name, _)) => name.trim().to_string(),
        None => text,
    };
    if is_protected_flag(&name) {
        return Ok(());
    }

    if name.contains("server.") {
        if server.server_flags.remove(&name).is_some() {
            let mut p = packet(PLO_FLAGDEL);
            p.write_bytes(name.as_bytes());
            server.route(
                &p,
                Scope::Roles {
                    mask: RoleMask::ANY_CLIENT,
                    except: None,
                },
            );
        }
        return Ok(());
    }

    if let Some(s) = server.session_mut(id) {
        s.account.delete_flag(&name);
    }
    Ok(())
}

pub(crate) fn open_chest(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let x = reader.read_guchar();
    let y = reader.read_guchar();
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let Some(level) = session.level.and_then(|l| server.world.level(l)) else {
        return Ok(());
    };
    let Some(chest) = level.chest_at(x, y) else {
        return Ok(());
    };
    let key = level.chest_key(chest);
    let item = chest.item;
    if session.account.opened_chests.contains(&key) {
        return Ok(());
    }

    server.give_item(id, item)?;
    let mut p = packet(PLO_LEVELCHEST);
    p.write_gchar(1).write_gchar(x).write_gchar(y);
    server.send_to(id, &p);
    if let Some(s) = server.session_mut(id) {
        s.account.opened_chests.push(key);
    }
    Ok(())
}

pub(crate) fn put_npc(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let image_len = usize::from(reader.read_guchar());
    let image = to_text(reader.read_chars(image_len));
    let code_len = usize::from(reader.read_guchar());
    let code_file = to_text(reader.read_chars(code_len));
    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;

    if !server.settings().get_bool("putnpcenabled", false) {
        return Ok(());
    }
    let Some(level_id) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    let script = server
        .files
        .load(&code_file)
        .map(|f| to_text(&f.data).replace('\r', "").replace('\n', "\u{a7}"))
        .unwrap_or_default();

    let Some(npc_id) = server.world.add_npc(level_id, &image, &script, x, y) else {
        return Ok(());
    };
    let Some(p) = server
        .world
        .level(level_id)
        .and_then(|l| l.npc(npc_id))
        .map(|npc| npc.props_packet())
    else {
        return Ok(());
    };
    let map = server.session(id).and_then(|s| s.map);
    server.route(
        &p,
        Scope::Area {
            level: level_id,
            map,
            except: None,
            only_gmap: true,
        },
    );
    debug!("Session {} put npc {} from {}", id, npc_id, code_file);
    Ok(())
}

pub(crate) fn npc_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let npc = reader.read_guint();
    let level = server.session(id).and_then(|s| s.level);
    let Some(level_id) = level.filter(|l| server.world.npc_level(npc) == Some(*l)) else {
        return Ok(());
    };
    server.world.remove_npc(npc);
    let mut p = packet(PLO_NPCDEL);
    p.write_gint(npc);
    server.route(&p, Scope::level(level_id, None));
    Ok(())
}

pub(crate) fn want_file(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let legacy = server.session(id).is_some_and(|s| s.version < CLVER_2_1);
    let name = legacy_file_name(to_text(reader.read_rest()), legacy);
    server.send_file(id, &name);
    Ok(())
}

pub(crate) fn show_img(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let Some(level) = session.level else {
        return Ok(());
    };
    let map = session.map;
    let p = forward(PLO_SHOWIMG, Some(id), body(reader));
    server.route(
        &p,
        Scope::Area {
            level,
            map,
            except: Some(id),
            only_gmap: false,
        },
    );
    Ok(())
}

pub(crate) fn hurt_player(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let victim = reader.read_gushort();
    let dx = reader.read_guchar();
    let dy = reader.read_guchar();
    let power = reader.read_guchar();
    let npc = reader.read_guint();

    let Some(target) = server.session(victim).filter(|s| s.is_client()) else {
        return Ok(());
    };
    if target.account.has_status(PLSTATUS_PAUSED) {
        return Ok(());
    }
    let mut p = packet(PLO_HURTPLAYER);
    p.write_gshort(u32::from(id))
        .write_gchar(dx)
        .write_gchar(dy)
        .write_gchar(power)
        .write_gint(npc);
    server.send_to(victim, &p);
    Ok(())
}

pub(crate) fn explosion(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    if server.settings().get_bool("noexplosions", false) {
        return Ok(());
    }
    let radius = reader.read_guchar();
    let x = reader.read_guchar();
    let y = reader.read_guchar();
    let power = reader.read_guchar();

    let mut p = packet(PLO_EXPLOSION);
    p.write_gshort(u32::from(id))
        .write_gchar(radius)
        .write_gchar(x)
        .write_gchar(y)
        .write_gchar(power);
    server.route(&p, Scope::nearby(id));
    Ok(())
}

fn admin_message(server: &mut Server, id: u16, text: &str) {
    let mut p = packet(PLO_RC_ADMINMESSAGE);
    p.write_bytes(text.as_bytes());
    server.send_to(id, &p);
}

pub(crate) fn private_message(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let now = Instant::now();
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let is_client = session.is_client();
    let recent = session
        .last_message
        .is_some_and(|t| now.saturating_duration_since(t) <= MESSAGE_INTERVAL);
    if is_client && recent {
        admin_message(
            server,
            id,
            "Server message:\u{a7}You can only send messages once every 4 seconds.",
        );
        return Ok(());
    }
    let sender = session.account.name.clone();
    let sender_staff = server.config.is_staff(&sender);
    let jailed = server.config.is_jail_level(&session.account.level_name);
    if let Some(s) = server.session_mut(id) {
        s.last_message = Some(now);
    }

    let count = reader.read_gushort();
    let targets: Vec<u16> = (0..count).map(|_| reader.read_gushort()).collect();
    let kind = if count > 1 { "\"Mass message:\"," } else { "\"Private message:\"," };

    let mut message = to_text(reader.read_rest());
    if message.len() > MESSAGE_LIMIT {
        admin_message(
            server,
            id,
            &format!(
                "Server message:\u{a7}There is a message limit of {} characters.",
                MESSAGE_LIMIT
            ),
        );
        return Ok(());
    }
    if is_client && server.filter.apply(&mut message, FilterCheck::PrivateMessage).warned {
        admin_message(
            server,
            id,
            "Word Filter:\u{a7}Your PM could not be sent because it was caught by the word filter.",
        );
        return Ok(());
    }

    let mut p = packet(PLO_PRIVATEMESSAGE);
    p.write_gshort(u32::from(id))
        .write_bytes(b"\"\",")
        .write_bytes(kind.as_bytes())
        .write_bytes(message.as_bytes());

    for target in targets {
        if target >= EXTERNAL_PLAYER_ID {
            server.list.pm_external(&sender, target, &message);
            continue;
        }
        if target == id {
            continue;
        }
        let Some(other) = server.session(target) else {
            continue;
        };
        if count != 1 && other.account.additional_flags & PLFLAG_NOMASSMESSAGE != 0 {
            continue;
        }
        if jailed && !sender_staff && !server.config.is_staff(&other.account.name) {
            let mut refusal = packet(PLO_PRIVATEMESSAGE);
            refusal
                .write_gshort(u32::from(target))
                .write_bytes(b"\"Server Message:\",\"From jail you can only send PMs to admins (RCs).\"");
            server.send_to(id, &refusal);
            continue;
        }
        server.send_to(target, &p);
    }
    Ok(())
}

pub(crate) fn npc_weapon_del(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let name = to_text(reader.read_rest());
    if let Some(s) = server.session_mut(id) {
        s.account.delete_weapon(&name);
    }
    Ok(())
}

pub(crate) fn packet_count(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let reported = u32::from(reader.read_gushort());
    if let Some(s) = server.session_mut(id) {
        if reported != s.packet_count || s.packet_count > PACKET_COUNT_LIMIT {
            warn!(
                "Session {} ({}) reported {} packets, counted {}",
                id, s.account.name, reported, s.packet_count
            );
        }
        s.packet_count = 0;
    }
    Ok(())
}

pub(crate) fn weapon_add(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    if reader.read_guchar() == 0 {
        let item = reader.read_guchar();
        return server.give_item(id, item);
    }

    let npc_id = reader.read_guint();
    let Some(level) = server.world.npc_level(npc_id).and_then(|l| server.world.level(l)) else {
        return Ok(());
    };
    let Some(npc) = level.npc(npc_id) else {
        return Ok(());
    };
    let Some(name) = npc.weapon_name().map(str::to_string) else {
        return Ok(());
    };
    let image = npc.image.clone();
    let script = npc.script.clone();

    let added = server
        .session_mut(id)
        .is_some_and(|s| s.account.add_weapon(&name));
    if added {
        let mut p = packet(PLO_NPCWEAPONADD);
        p.write_gstring(name.as_bytes())
            .write_gchar(0)
            .write_gstring(image.as_bytes())
            .write_gchar(1)
            .write_gshort(script.len() as u32)
            .write_bytes(script.as_bytes());
        server.send_to(id, &p);
    }
    Ok(())
}

pub(crate) fn update_file(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let client_time = reader.read_guint5();
    let requested = to_text(reader.read_rest());
    let server_time = server.files.mod_time(&requested).unwrap_or(0);
    let legacy = server.session(id).is_some_and(|s| s.version < CLVER_2_1);
    let name = legacy_file_name(requested, legacy);

    if !server.config.is_default_file(&name) && server_time > client_time {
        server.send_file(id, &name);
        return Ok(());
    }

    let mut p = packet(if legacy { PLO_FILESENDFAILED } else { PLO_FILEUPTODATE });
    p.write_bytes(name.as_bytes());
    server.send_to(id, &p);
    Ok(())
}

pub(crate) fn adjacent_level(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let mod_time = reader.read_guint5();
    let name = to_text(reader.read_rest());
    let Some(adjacent) = server.world.find_level(&name) else {
        return Ok(());
    };
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let Some(current) = session.level else {
        return Err(Disconnect::silent());
    };

    server.sync_level(id, adjacent, Some(mod_time), true);

    let Some(session) = server.session(id) else {
        return Ok(());
    };
    let gmap = session
        .map
        .and_then(|m| server.world.map(m))
        .filter(|m| m.is_gmap())
        .map(|m| m.name.clone());
    let Some(level) = server.world.level(current) else {
        return Ok(());
    };
    let mut p = packet(PLO_LEVELNAME);
    p.write_bytes(gmap.unwrap_or_else(|| level.name.clone()).as_bytes());
    let leader = level.leader() == Some(id);
    server.send_to(id, &p);
    if leader {
        server.send_to(id, &packet(PLO_ISLEADER));
    }
    Ok(())
}

pub(crate) fn hit_objects(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let power = f32::from(reader.read_gchar()) / 2.0;
    let x = f32::from(reader.read_gchar()) / 2.0;
    let y = f32::from(reader.read_gchar()) / 2.0;
    let npc = (!reader.is_empty()).then(|| reader.read_guint());

    let mut p = packet(PLO_HITOBJECTS);
    p.write_gshort(if npc.is_some() { 0 } else { u32::from(id) })
        .write_gchar((power * 2.0) as i32 as u8)
        .write_gchar((x * 2.0) as i32 as u8)
        .write_gchar((y * 2.0) as i32 as u8);
    if let Some(npc) = npc {
        p.write_gint(npc);
    }
    server.route(&p, Scope::nearby_with_self(id));
    Ok(())
}

pub(crate) fn language(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let mut language = to_text(reader.read_rest());
    if language.is_empty() {
        language = "English".to_string();
    }
    if let Some(s) = server.session_mut(id) {
        s.account.language = language;
    }
    Ok(())
}

pub(crate) fn trigger_action(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let _npc = reader.read_guint();
    let x = f32::from(reader.read_guchar()) / 2.0;
    let y = f32::from(reader.read_guchar()) / 2.0;
    let action = to_text(reader.read_rest()).trim().to_string();

    if x == 0.0 && y == 0.0 && action.starts_with("gr.serverlist") {
        let mut data = String::from("clientside,-Serverlist_v4,updateservers,");
        for (name, count) in server.list.servers() {
            data.push_str(&format!("{},{},", name, count));
        }
        let mut p = packet(PLO_TRIGGERACTION);
        p.write_gshort(0)
            .write_gint(0)
            .write_gchar(0)
            .write_gchar(0)
            .write_bytes(data.as_bytes());
        server.send_to(id, &p);
        return Ok(());
    }

    let Some(level_id) = server.session(id).and_then(|s| s.level) else {
        return Ok(());
    };
    if let Some(level_name) = server.world.level(level_id).map(|l| l.name.clone()) {
        server.watchdog.begin();
        server.scripts.queue_action(&level_name, id, &action, x, y);
        if server.watchdog.end() {
            warn!("Trigger action {} from session {} was aborted", action, id);
        }
    }
    let p = forward(PLO_TRIGGERACTION, Some(id), body(reader));
    server.route(&p, Scope::level(level_id, Some(id)));
    Ok(())
}

pub(crate) fn shoot(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let p = forward(PLO_SHOOT, Some(id), body(reader));
    server.route(&p, Scope::nearby(id));
    Ok(())
}

pub(crate) fn server_warp(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let name = to_text(reader.read_rest());
    server.list.server_warp(id, &name);
    Ok(())
}

pub(crate) fn profile_get(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    server.list.profile_get(id, body(reader));
    Ok(())
}

/// Only a player's own profile can be changed
pub(crate) fn profile_set(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let account = to_text(reader.read_gstring());
    let Some(session) = server.session(id) else {
        return Ok(());
    };
    if account != session.account.name {
        debug!("Session {} tried to set the profile of {}", id, account);
        return Ok(());
    }
    server.list.profile_set(id, body(reader));
    Ok(())
}

pub(crate) fn request_text(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    server.list.request_text(id, reader.read_rest());
    Ok(())
}

pub(crate) fn send_text(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let Some(account) = server.session(id).map(|s| s.account.name.clone()) else {
        return Ok(());
    };
    server.list.send_text(id, &account, reader.read_rest());
    Ok(())
}

/// Newer clients ask for the animation a gani falls back to
pub(crate) fn gani_back_to(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let _mod_time = reader.read_guint5();
    let gani = to_text(reader.read_rest());
    let back = server
        .files
        .load(&format!("{}.gani", gani))
        .and_then(|entry| set_back_to(&entry.data))
        .unwrap_or_default();

    let mut p = packet(PLO_UNKNOWN195);
    p.write_gchar(clip_len(gani.len()))
        .write_bytes(gani.as_bytes())
        .write_bytes(format!("\"SETBACKTO {}\"", back).as_bytes());
    server.send_to(id, &p);
    Ok(())
}

/// Value of the `SETBACKTO` line of a gani
fn set_back_to(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let start = text.find("SETBACKTO")? + "SETBACKTO".len();
    let line = text[start..].lines().next().unwrap_or_default();
    Some(line.trim().to_string())
}

fn clip_len(len: usize) -> u8 {
    len.min(223) as u8
}

/// Announces that the next record is a fixed number of bytes
pub(crate) fn raw_data(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    let len = reader.read_guint() as usize;
    if let Some(s) = server.session_mut(id) {
        s.frame_state = FrameState::RawBlock(len);
    }
    Ok(())
}

impl Server {
    /// Sends a file, in chunks when it does not fit one packet.
    ///
    /// Every chunk is announced with RAWDATA so the client reads it as a
    /// raw block.
    pub fn send_file(&mut self, id: u16, name: &str) {
        let entry = self.files.load(name).filter(|f| !f.data.is_empty());
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let Some(entry) = entry else {
            let mut p = packet(PLO_FILESENDFAILED);
            p.write_bytes(name.as_bytes());
            session.send(&p);
            return;
        };

        let old_client = session.is_client() && session.version < CLVER_2_14;
        let no_mod_time = session.is_client() && session.version < CLVER_2_1;
        let mut header_len = 1 + 5 + 1 + name.len() + 1;
        let mut large = entry.data.len() > FILE_CHUNK;
        if old_client {
            if no_mod_time {
                header_len -= 5;
            }
            if entry.data.len() > LEGACY_FILE_LIMIT {
                let mut p = packet(PLO_FILESENDFAILED);
                p.write_bytes(name.as_bytes());
                session.send(&p);
                return;
            }
            large = false;
        }

        if large {
            let mut start = packet(PLO_LARGEFILESTART);
            start.write_bytes(name.as_bytes());
            session.send(&start);
            let mut size = packet(PLO_LARGEFILESIZE);
            size.write_gint5(entry.data.len() as u64);
            session.send(&size);
        }

        let chunk_size = if old_client { entry.data.len() } else { FILE_CHUNK };
        for chunk in entry.data.chunks(chunk_size) {
            let mut raw = packet(PLO_RAWDATA);
            let mut file = packet(PLO_FILE);
            if no_mod_time {
                raw.write_gint((header_len - 1 + chunk.len()) as u32);
                file.write_gstring(name.as_bytes()).write_bytes(chunk);
            } else {
                raw.write_gint((header_len + chunk.len()) as u32);
                file.write_gint5(entry.mod_time)
                    .write_gstring(name.as_bytes())
                    .write_bytes(chunk)
                    .write_bytes(b"\n");
            }
            session.send(&raw);
            session.send_raw(&file);
        }

        if large {
            let mut end = packet(PLO_LARGEFILEEND);
            end.write_bytes(name.as_bytes());
            session.send(&end);
        }
        debug!("Sent {} ({} bytes) to session {}", name, entry.data.len(), id);
    }

    /// Shows a session's rating to itself and its neighbourhood
    fn send_rating(&mut self, id: u16) {
        let value = self.prop_value(id, PLPROP_RATING);
        let mut own = packet(PLO_PLAYERPROPS);
        own.write_gchar(PLPROP_RATING).write_bytes(&value);
        self.send_to(id, &own);

        let mut other = packet(PLO_OTHERPLPROPS);
        other
            .write_gshort(u32::from(id))
            .write_gchar(PLPROP_RATING)
            .write_bytes(&value);
        self.route(&other, Scope::nearby(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MemoryFileSystem;
    use crate::fixtures::{opcodes_of, place, test_server, RecordingList};
    use crate::world::Chest;
    use assert_approx_eq::assert_approx_eq;
    use shared::versions::CLVER_1_41;

    fn record(opcode: u8, build: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut p = packet(opcode);
        build(&mut p);
        p
    }

    fn clear(server: &mut Server, ids: &[u16]) {
        for id in ids {
            server.session_mut(*id).unwrap().outbound = Default::default();
        }
    }

    #[test]
    fn test_bomb_forwarded_with_sender_id() {
        let mut server = test_server(&["a.nw", "b.nw"]);
        let me = place(&mut server, "a.nw");
        let near = place(&mut server, "a.nw");
        let far = place(&mut server, "b.nw");

        let rec = record(PLI_BOMBADD, |p| {
            p.write_gchar(20).write_gchar(20).write_gchar(1).write_gchar(55);
        });
        server.dispatch(me, &rec).unwrap();

        assert!(server.session(me).unwrap().outbound.is_empty());
        assert!(server.session(far).unwrap().outbound.is_empty());
        let got = &server.session(near).unwrap().outbound.packets()[0];
        let mut reader = GReader::new(got);
        assert_eq!(reader.read_guchar(), PLO_BOMBADD);
        assert_eq!(reader.read_gushort(), me);
        assert_eq!(reader.read_guchar(), 20);
    }

    #[test]
    fn test_board_modify_reaches_whole_level_and_drops_vase_heart() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let other = place(&mut server, "a.nw");
        let level = server.session(me).unwrap().level.unwrap();
        let mut vase = Vec::new();
        vase.write_gshort(0x2ac);
        server
            .world
            .level_mut(level)
            .unwrap()
            .alter_board(5, 6, 1, 1, &vase, 1);

        let rec = record(PLI_BOARDMODIFY, |p| {
            p.write_gchar(5).write_gchar(6).write_gchar(1).write_gchar(1).write_gshort(0x2af);
        });
        server.dispatch(me, &rec).unwrap();

        let l = server.world.level(level).unwrap();
        assert_eq!(l.tile(5, 6), 0x2af);
        assert_eq!(l.items.len(), 1);
        assert!(opcodes_of(server.session(me).unwrap()).contains(&PLO_BOARDMODIFY));
        assert!(opcodes_of(server.session(me).unwrap()).contains(&PLO_ITEMADD));
        assert!(opcodes_of(server.session(other).unwrap()).contains(&PLO_BOARDMODIFY));
    }

    #[test]
    fn test_item_take_gives_item() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let level = server.session(me).unwrap().level.unwrap();
        server.world.level_mut(level).unwrap().add_item(10.0, 12.0, 2);

        let rec = record(PLI_ITEMTAKE, |p| {
            p.write_gchar(20).write_gchar(24);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(me).unwrap().account.rupees, 30);
        assert!(server.world.level(level).unwrap().items.is_empty());

        // A second take finds nothing
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(me).unwrap().account.rupees, 30);
    }

    #[test]
    fn test_item_del_does_not_give() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let level = server.session(me).unwrap().level.unwrap();
        server.world.level_mut(level).unwrap().add_item(10.0, 12.0, 2);
        let rec = record(PLI_ITEMDEL, |p| {
            p.write_gchar(20).write_gchar(24);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(me).unwrap().account.rupees, 0);
        assert!(server.world.level(level).unwrap().items.is_empty());
    }

    #[test]
    fn test_horse_add_and_remove() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let level = server.session(me).unwrap().level.unwrap();
        let add = record(PLI_HORSEADD, |p| {
            p.write_gchar(30).write_gchar(40).write_gchar((2 << 2) | 1).write_bytes(b"horse.png");
        });
        server.dispatch(me, &add).unwrap();
        {
            let horses = &server.world.level(level).unwrap().horses;
            assert_eq!(horses.len(), 1);
            assert_eq!(horses[0].dir, 1);
            assert_eq!(horses[0].bushes, 2);
            assert_eq!(horses[0].image, "horse.png");
        }
        let del = record(PLI_HORSEDEL, |p| {
            p.write_gchar(30).write_gchar(40);
        });
        server.dispatch(me, &del).unwrap();
        assert!(server.world.level(level).unwrap().horses.is_empty());
    }

    #[test]
    fn test_to_all_respects_flags_and_jail() {
        let mut server = test_server(&["a.nw", "jail.nw"]);
        server.config.settings.set("jaillevels", "jail.nw");
        let me = place(&mut server, "a.nw");
        let listening = place(&mut server, "a.nw");
        let muted = place(&mut server, "a.nw");
        server.session_mut(muted).unwrap().account.additional_flags = PLFLAG_NOTOALL;

        let rec = record(PLI_TOALL, |p| {
            p.write_gstring(b"hello");
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(opcodes_of(server.session(listening).unwrap()), vec![PLO_TOALL]);
        assert!(server.session(muted).unwrap().outbound.is_empty());
        assert!(server.session(me).unwrap().outbound.is_empty());

        clear(&mut server, &[listening]);
        let prisoner = place(&mut server, "jail.nw");
        server.dispatch(prisoner, &rec).unwrap();
        assert!(server.session(listening).unwrap().outbound.is_empty());
    }

    #[test]
    fn test_flag_rules() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let other = place(&mut server, "a.nw");

        let set = |text: &str| record(PLI_FLAGSET, |p| {
            p.write_bytes(text.as_bytes());
        });
        server.dispatch(me, &set("quest=done")).unwrap();
        server.dispatch(me, &set("clientr.gold=99")).unwrap();
        server.dispatch(me, &set("server.event=on")).unwrap();
        let flags = &server.session(me).unwrap().account.flags;
        assert_eq!(flags.get("quest").map(String::as_str), Some("done"));
        assert!(!flags.contains_key("clientr.gold"));
        assert_eq!(server.server_flags.get("server.event").map(String::as_str), Some("on"));
        assert!(opcodes_of(server.session(other).unwrap()).contains(&PLO_FLAGSET));

        // An empty value deletes the flag
        server.dispatch(me, &set("quest=")).unwrap();
        assert!(!server.session(me).unwrap().account.flags.contains_key("quest"));

        let del = record(PLI_FLAGDEL, |p| {
            p.write_bytes(b"server.event");
        });
        server.dispatch(me, &del).unwrap();
        assert!(server.server_flags.is_empty());
        assert!(opcodes_of(server.session(other).unwrap()).contains(&PLO_FLAGDEL));
    }

    #[test]
    fn test_gr_movement_ignored_for_new_clients() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_FLAGSET, |p| {
            p.write_bytes(b"gr.x=12");
        });
        server.dispatch(me, &rec).unwrap();
        let session = server.session(me).unwrap();
        assert!(session.gr_movement.is_empty());
        assert!(!session.account.flags.contains_key("gr.x"));
    }

    #[test]
    fn test_chest_opens_once() {
        let mut source = crate::collab::MemoryLevelSource::new();
        let mut data = crate::world::LevelData::empty(1);
        data.chests.push(Chest {
            x: 3,
            y: 4,
            item: 19,
            sign_index: 0,
        });
        source.insert("c.nw", data);
        let mut server = Server::new(
            Default::default(),
            Box::new(MemoryFileSystem::new()),
            Box::new(source),
        );
        let me = place(&mut server, "c.nw");

        let rec = record(PLI_OPENCHEST, |p| {
            p.write_gchar(3).write_gchar(4);
        });
        server.dispatch(me, &rec).unwrap();
        server.dispatch(me, &rec).unwrap();
        let account = &server.session(me).unwrap().account;
        assert_eq!(account.rupees, 100);
        assert_eq!(account.opened_chests, vec!["3:4:c.nw".to_string()]);
    }

    #[test]
    fn test_put_npc_and_delete() {
        let mut files = MemoryFileSystem::new();
        files.insert("block.txt", "setimg block.png;\r\nshow;", 1);
        let mut source = crate::collab::MemoryLevelSource::new();
        source.insert("a.nw", crate::world::LevelData::empty(1));
        let mut server = Server::new(Default::default(), Box::new(files), Box::new(source));
        server.config.settings.set("putnpcenabled", true);
        let me = place(&mut server, "a.nw");
        let level = server.session(me).unwrap().level.unwrap();

        let rec = record(PLI_PUTNPC, |p| {
            p.write_gstring(b"block.png")
                .write_gstring(b"block.txt")
                .write_gchar(20)
                .write_gchar(30);
        });
        server.dispatch(me, &rec).unwrap();
        let npc = server.world.level(level).unwrap().npcs[0].clone();
        assert_eq!(npc.script, "setimg block.png;\u{a7}show;");
        assert_eq!(npc.x, 10.0);
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_NPCPROPS]);

        let del = record(PLI_NPCDEL, |p| {
            p.write_gint(npc.id);
        });
        server.dispatch(me, &del).unwrap();
        assert!(server.world.level(level).unwrap().npcs.is_empty());
    }

    #[test]
    fn test_put_npc_disabled_by_default() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_PUTNPC, |p| {
            p.write_gstring(b"a.png").write_gstring(b"a.txt").write_gchar(0).write_gchar(0);
        });
        server.dispatch(me, &rec).unwrap();
        let level = server.session(me).unwrap().level.unwrap();
        assert!(server.world.level(level).unwrap().npcs.is_empty());
    }

    #[test]
    fn test_hurt_player_skips_paused_victims() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let victim = place(&mut server, "a.nw");
        let rec = record(PLI_HURTPLAYER, |p| {
            p.write_gshort(u32::from(victim))
                .write_gchar(1)
                .write_gchar(1)
                .write_gchar(2)
                .write_gint(0);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(opcodes_of(server.session(victim).unwrap()), vec![PLO_HURTPLAYER]);

        clear(&mut server, &[victim]);
        server.session_mut(victim).unwrap().account.status |= PLSTATUS_PAUSED;
        server.dispatch(me, &rec).unwrap();
        assert!(server.session(victim).unwrap().outbound.is_empty());
    }

    #[test]
    fn test_private_message_rate_limit() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let friend = place(&mut server, "a.nw");
        let rec = record(PLI_PRIVATEMESSAGE, |p| {
            p.write_gshort(1).write_gshort(u32::from(friend)).write_bytes(b"hi");
        });
        server.dispatch(me, &rec).unwrap();
        server.dispatch(me, &rec).unwrap();

        let got = server.session(friend).unwrap().outbound.packets().to_vec();
        assert_eq!(got.len(), 1);
        assert!(got[0].ends_with(b"\"Private message:\",hi\n"));
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_RC_ADMINMESSAGE]);
    }

    #[test]
    fn test_private_message_from_jail() {
        let mut server = test_server(&["a.nw", "jail.nw"]);
        server.config.settings.set("jaillevels", "jail.nw");
        let prisoner = place(&mut server, "jail.nw");
        let friend = place(&mut server, "a.nw");
        let rec = record(PLI_PRIVATEMESSAGE, |p| {
            p.write_gshort(1).write_gshort(u32::from(friend)).write_bytes(b"let me out");
        });
        server.dispatch(prisoner, &rec).unwrap();
        assert!(server.session(friend).unwrap().outbound.is_empty());
        assert_eq!(opcodes_of(server.session(prisoner).unwrap()), vec![PLO_PRIVATEMESSAGE]);
    }

    #[test]
    fn test_mass_message_skips_opted_out() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let a = place(&mut server, "a.nw");
        let b = place(&mut server, "a.nw");
        server.session_mut(b).unwrap().account.additional_flags = PLFLAG_NOMASSMESSAGE;
        let rec = record(PLI_PRIVATEMESSAGE, |p| {
            p.write_gshort(2)
                .write_gshort(u32::from(a))
                .write_gshort(u32::from(b))
                .write_bytes(b"event at noon");
        });
        server.dispatch(me, &rec).unwrap();
        assert!(server.session(a).unwrap().outbound.packets()[0]
            .windows(15)
            .any(|w| w == b"\"Mass message:\""));
        assert!(server.session(b).unwrap().outbound.is_empty());
    }

    #[test]
    fn test_claim_pker_moves_alignment_and_kills() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let killer = place(&mut server, "a.nw");
        server.session_mut(me).unwrap().account.ap = 60;
        server.session_mut(killer).unwrap().account.ap = 50;

        let rec = record(PLI_CLAIMPKER, |p| {
            p.write_gshort(u32::from(killer));
        });
        server.dispatch(me, &rec).unwrap();
        let account = &server.session(killer).unwrap().account;
        assert_eq!(account.kills, 1);
        // 50 - (50 / 20 + 1) * (60 / 20)
        assert_eq!(account.ap, 41);
        assert_eq!(account.ap_counter, 300);
    }

    #[test]
    fn test_spar_updates_ratings() {
        let mut server = test_server(&["arena.nw"]);
        let me = place(&mut server, "arena.nw");
        let winner = place(&mut server, "arena.nw");
        server.session_mut(winner).unwrap().ip = "10.0.0.2".into();

        let rec = record(PLI_CLAIMPKER, |p| {
            p.write_gshort(u32::from(winner));
        });
        server.dispatch(me, &rec).unwrap();
        let w = &server.session(winner).unwrap().account;
        let l = &server.session(me).unwrap().account;
        assert!(w.rating > 1500.0);
        assert!(l.rating < 1500.0);
        assert!(w.deviation < 350.0);
        assert_eq!(w.kills, 0);
        assert!(w.last_sparring > 0);
    }

    #[test]
    fn test_spar_same_address_is_ignored() {
        let mut server = test_server(&["arena.nw"]);
        let me = place(&mut server, "arena.nw");
        let winner = place(&mut server, "arena.nw");
        let rec = record(PLI_CLAIMPKER, |p| {
            p.write_gshort(u32::from(winner));
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(winner).unwrap().account.rating, 1500.0);
    }

    #[test]
    fn test_glicko_is_symmetric_for_equal_players() {
        let (win, lose) = glicko((1500.0, 350.0), (1500.0, 350.0));
        assert_approx_eq!(win.0 - 1500.0, 1500.0 - lose.0, 0.01);
        assert!(win.1 < 350.0);
    }

    #[test]
    fn test_send_small_file() {
        let mut files = MemoryFileSystem::new();
        files.insert("sign.png", vec![1u8; 10], 77);
        let mut server = Server::new(
            Default::default(),
            Box::new(files),
            Box::new(crate::collab::MemoryLevelSource::new().with_level("a.nw", crate::world::LevelData::empty(1))),
        );
        let me = place(&mut server, "a.nw");
        server.send_file(me, "sign.png");

        let packets = server.session(me).unwrap().outbound.packets().to_vec();
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_RAWDATA, PLO_FILE]);
        let mut raw = GReader::new(&packets[0]);
        raw.read_guchar();
        assert_eq!(raw.read_guint() as usize, packets[1].len());
        assert!(packets[1].ends_with(b"\n"));
    }

    #[test]
    fn test_send_large_file_in_chunks() {
        let mut files = MemoryFileSystem::new();
        files.insert("big.png", vec![7u8; 70000], 1);
        let mut server = Server::new(
            Default::default(),
            Box::new(files),
            Box::new(crate::collab::MemoryLevelSource::new().with_level("a.nw", crate::world::LevelData::empty(1))),
        );
        let me = place(&mut server, "a.nw");
        server.send_file(me, "big.png");
        assert_eq!(
            opcodes_of(server.session(me).unwrap()),
            vec![
                PLO_LARGEFILESTART,
                PLO_LARGEFILESIZE,
                PLO_RAWDATA,
                PLO_FILE,
                PLO_RAWDATA,
                PLO_FILE,
                PLO_RAWDATA,
                PLO_FILE,
                PLO_LARGEFILEEND
            ]
        );

        // 1.41 clients cannot take it at all
        clear(&mut server, &[me]);
        server.session_mut(me).unwrap().version = CLVER_1_41;
        server.send_file(me, "big.png");
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_FILESENDFAILED]);
    }

    #[test]
    fn test_missing_file_fails() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_WANTFILE, |p| {
            p.write_bytes(b"nothing.png");
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_FILESENDFAILED]);
    }

    #[test]
    fn test_update_file_up_to_date() {
        let mut files = MemoryFileSystem::new();
        files.insert("hat.png", vec![1u8; 4], 100);
        let mut server = Server::new(
            Default::default(),
            Box::new(files),
            Box::new(crate::collab::MemoryLevelSource::new().with_level("a.nw", crate::world::LevelData::empty(1))),
        );
        let me = place(&mut server, "a.nw");
        let fresh = record(PLI_UPDATEFILE, |p| {
            p.write_gint5(100).write_bytes(b"hat.png");
        });
        server.dispatch(me, &fresh).unwrap();
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_FILEUPTODATE]);

        clear(&mut server, &[me]);
        let stale = record(PLI_UPDATEFILE, |p| {
            p.write_gint5(50).write_bytes(b"hat.png");
        });
        server.dispatch(me, &stale).unwrap();
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_RAWDATA, PLO_FILE]);
    }

    #[test]
    fn test_serverlist_trigger() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_TRIGGERACTION, |p| {
            p.write_gint(0).write_gchar(0).write_gchar(0).write_bytes(b"gr.serverlist");
        });
        server.dispatch(me, &rec).unwrap();
        let packets = server.session(me).unwrap().outbound.packets();
        assert_eq!(packets.len(), 1);
        assert!(to_text(&packets[0]).contains("clientside,-Serverlist_v4,updateservers,"));
    }

    #[test]
    fn test_trigger_action_forwarded_to_level() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let other = place(&mut server, "a.nw");
        let rec = record(PLI_TRIGGERACTION, |p| {
            p.write_gint(0).write_gchar(20).write_gchar(20).write_bytes(b"open,door");
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(opcodes_of(server.session(other).unwrap()), vec![PLO_TRIGGERACTION]);
        assert!(server.session(me).unwrap().outbound.is_empty());
    }

    #[test]
    fn test_packet_count_resets() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        server.session_mut(me).unwrap().packet_count = 12;
        let rec = record(PLI_PACKETCOUNT, |p| {
            p.write_gshort(12);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(me).unwrap().packet_count, 0);
    }

    #[test]
    fn test_language_defaults_to_english() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        server.dispatch(me, &packet(PLI_LANGUAGE)).unwrap();
        assert_eq!(server.session(me).unwrap().account.language, "English");
    }

    #[test]
    fn test_hit_objects_includes_sender() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let other = place(&mut server, "a.nw");
        let rec = record(PLI_HITOBJECTS, |p| {
            p.write_gchar(2).write_gchar(20).write_gchar(20);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(opcodes_of(server.session(me).unwrap()), vec![PLO_HITOBJECTS]);
        assert_eq!(opcodes_of(server.session(other).unwrap()), vec![PLO_HITOBJECTS]);
    }

    #[test]
    fn test_weapon_add_default_weapon() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_WEAPONADD, |p| {
            p.write_gchar(0).write_gchar(8);
        });
        server.dispatch(me, &rec).unwrap();
        assert!(server.session(me).unwrap().account.has_weapon("bomb"));

        let del = record(PLI_NPCWEAPONDEL, |p| {
            p.write_bytes(b"bomb");
        });
        server.dispatch(me, &del).unwrap();
        assert!(!server.session(me).unwrap().account.has_weapon("bomb"));
    }

    #[test]
    fn test_baddy_add_and_props() {
        let mut server = test_server(&["a.nw"]);
        let leader = place(&mut server, "a.nw");
        let other = place(&mut server, "a.nw");
        let add = record(PLI_BADDYADD, |p| {
            p.write_gchar(20).write_gchar(20).write_gchar(1).write_gchar(40).write_bytes(b"baddy");
        });
        server.dispatch(other, &add).unwrap();
        let level = server.session(leader).unwrap().level.unwrap();
        {
            let baddy = &server.world.level(level).unwrap().baddies[0];
            assert_eq!(baddy.power, 12);
            assert_eq!(baddy.image, "baddy.gif");
        }
        clear(&mut server, &[leader, other]);

        let props = record(PLI_BADDYPROPS, |p| {
            p.write_gchar(1).write_gchar(2).write_gchar(30);
        });
        server.dispatch(leader, &props).unwrap();
        assert!(server.session(leader).unwrap().outbound.is_empty());
        assert_eq!(opcodes_of(server.session(other).unwrap()), vec![PLO_BADDYPROPS]);
        assert!(!server.world.level(level).unwrap().baddies[0].props.is_empty());
    }

    #[test]
    fn test_raw_data_sets_block_length() {
        let mut server = test_server(&["a.nw"]);
        let me = place(&mut server, "a.nw");
        let rec = record(PLI_RAWDATA, |p| {
            p.write_gint(40);
        });
        server.dispatch(me, &rec).unwrap();
        assert_eq!(server.session(me).unwrap().frame_state, FrameState::RawBlock(40));
    }

    #[test]
    fn test_profile_set_only_for_own_account() {
        let list = RecordingList::default();
        let mut server = test_server(&["a.nw"]).with_server_list(Box::new(list.clone()));
        let me = place(&mut server, "a.nw");
        let own = format!("player{}", me);

        let other = record(PLI_PROFILESET, |p| {
            p.write_gchar(7).write_bytes(b"mallory").write_bytes(b"hacked");
        });
        server.dispatch(me, &other).unwrap();
        assert!(list.calls().is_empty());

        let mine = record(PLI_PROFILESET, |p| {
            p.write_gchar(own.len() as u8)
                .write_bytes(own.as_bytes())
                .write_bytes(b"hello");
        });
        server.dispatch(me, &mine).unwrap();
        let calls = list.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with(&format!("profileset {} ", me)));
        assert!(calls[0].ends_with("hello"));
    }

    #[test]
    fn test_profile_and_text_requests_relay_to_list() {
        let list = RecordingList::default();
        let mut server = test_server(&["a.nw"]).with_server_list(Box::new(list.clone()));
        let me = place(&mut server, "a.nw");

        server
            .dispatch(me, &record(PLI_PROFILEGET, |p| {
                p.write_bytes(b"alice");
            }))
            .unwrap();
        server
            .dispatch(me, &record(PLI_REQUESTTEXT, |p| {
                p.write_bytes(b"-Serverlist,lister,simplelist");
            }))
            .unwrap();
        server
            .dispatch(me, &record(PLI_SENDTEXT, |p| {
                p.write_bytes(b"GraalEngine,irc,login,-");
            }))
            .unwrap();

        assert_eq!(
            list.calls(),
            vec![
                format!("profileget {} alice", me),
                format!("requesttext {} -Serverlist,lister,simplelist", me),
                format!("sendtext {} player{} GraalEngine,irc,login,-", me, me),
            ]
        );
        assert!(server.session(me).unwrap().outbound.is_empty());
    }

    #[test]
    fn test_gani_back_to_reads_setbackto() {
        let mut files = MemoryFileSystem::new();
        files.insert("sword.gani", b"SPRITES\nSETBACKTO idle\nANI\n".to_vec(), 1);
        let mut server = test_server(&["a.nw"]);
        server.files = Box::new(files);
        let me = place(&mut server, "a.nw");

        let ask = |name: &str| {
            record(PLI_UNKNOWN157, |p| {
                p.write_gint5(0).write_bytes(name.as_bytes());
            })
        };
        server.dispatch(me, &ask("sword")).unwrap();
        server.dispatch(me, &ask("missing")).unwrap();

        let packets = server.session(me).unwrap().outbound.packets().to_vec();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0][0].wrapping_sub(32), PLO_UNKNOWN195);
        assert!(packets[0].ends_with(b"sword\"SETBACKTO idle\"\n"));
        assert!(packets[1].ends_with(b"missing\"SETBACKTO \"\n"));
    }

    #[test]
    fn test_private_message_to_external_player() {
        let list = RecordingList::default();
        let mut server = test_server(&["a.nw"]).with_server_list(Box::new(list.clone()));
        let me = place(&mut server, "a.nw");
        let friend = place(&mut server, "a.nw");
        let rec = record(PLI_PRIVATEMESSAGE, |p| {
            p.write_gshort(2)
                .write_gshort(u32::from(friend))
                .write_gshort(16003)
                .write_bytes(b"across servers");
        });
        server.dispatch(me, &rec).unwrap();

        assert_eq!(list.calls(), vec![format!("pm player{} 16003 across servers", me)]);
        assert_eq!(opcodes_of(server.session(friend).unwrap()), vec![PLO_PRIVATEMESSAGE]);
        assert!(server.session(me).unwrap().outbound.is_empty());
    }
}
