//! Frame reading and opcode dispatch
//!
//! Received bytes are buffered per session and cut into length-prefixed
//! frames. Each frame is decoded for the session's generation and split into
//! records:
//! - the first frame of a connection carries the login record
//! - afterwards records are newline delimited
//! - a RAWDATA record switches the next record to a fixed byte count
//!
//! Every record starts with a biased opcode that indexes [`HANDLERS`].

use crate::error::{Disconnect, HandlerResult};
use crate::handlers;
use crate::server::Server;
use log::{debug, trace, warn};
use shared::frame::{FrameState, Records};
use shared::gstring::GReader;
use shared::opcodes::*;
use shared::versions::RCVER_1_1;
use std::time::Instant;

/// Reads one record for a session. The reader is positioned after the opcode.
pub type Handler = fn(&mut Server, u16, &mut GReader) -> HandlerResult;

/// Invalid records tolerated before the session is dropped
pub const INVALID_PACKET_LIMIT: u32 = 5;

const fn handler_table() -> [Handler; 256] {
    let mut table: [Handler; 256] = [invalid_packet as Handler; 256];
    table[PLI_LEVELWARP as usize] = handlers::level_warp;
    table[PLI_BOARDMODIFY as usize] = handlers::board_modify;
    table[PLI_PLAYERPROPS as usize] = handlers::player_props;
    table[PLI_NPCPROPS as usize] = handlers::npc_props;
    table[PLI_BOMBADD as usize] = handlers::bomb_add;
    table[PLI_BOMBDEL as usize] = handlers::bomb_del;
    table[PLI_TOALL as usize] = handlers::to_all;
    table[PLI_HORSEADD as usize] = handlers::horse_add;
    table[PLI_HORSEDEL as usize] = handlers::horse_del;
    table[PLI_ARROWADD as usize] = handlers::arrow_add;
    table[PLI_FIRESPY as usize] = handlers::fire_spy;
    table[PLI_THROWCARRIED as usize] = handlers::throw_carried;
    table[PLI_ITEMADD as usize] = handlers::item_add;
    table[PLI_ITEMDEL as usize] = handlers::item_del;
    table[PLI_CLAIMPKER as usize] = handlers::claim_pker;
    table[PLI_BADDYPROPS as usize] = handlers::baddy_props;
    table[PLI_BADDYHURT as usize] = handlers::baddy_hurt;
    table[PLI_BADDYADD as usize] = handlers::baddy_add;
    table[PLI_FLAGSET as usize] = handlers::flag_set;
    table[PLI_FLAGDEL as usize] = handlers::flag_del;
    table[PLI_OPENCHEST as usize] = handlers::open_chest;
    table[PLI_PUTNPC as usize] = handlers::put_npc;
    table[PLI_NPCDEL as usize] = handlers::npc_del;
    table[PLI_WANTFILE as usize] = handlers::want_file;
    table[PLI_SHOWIMG as usize] = handlers::show_img;
    table[PLI_HURTPLAYER as usize] = handlers::hurt_player;
    table[PLI_EXPLOSION as usize] = handlers::explosion;
    table[PLI_PRIVATEMESSAGE as usize] = handlers::private_message;
    table[PLI_NPCWEAPONDEL as usize] = handlers::npc_weapon_del;
    table[PLI_LEVELWARPMOD as usize] = handlers::level_warp;
    table[PLI_PACKETCOUNT as usize] = handlers::packet_count;
    table[PLI_ITEMTAKE as usize] = handlers::item_del;
    table[PLI_WEAPONADD as usize] = handlers::weapon_add;
    table[PLI_UPDATEFILE as usize] = handlers::update_file;
    table[PLI_ADJACENTLEVEL as usize] = handlers::adjacent_level;
    table[PLI_HITOBJECTS as usize] = handlers::hit_objects;
    table[PLI_LANGUAGE as usize] = handlers::language;
    table[PLI_TRIGGERACTION as usize] = handlers::trigger_action;
    table[PLI_MAPINFO as usize] = handlers::ignore;
    table[PLI_SHOOT as usize] = handlers::shoot;
    table[PLI_SERVERWARP as usize] = handlers::server_warp;
    table[PLI_PROCESSLIST as usize] = handlers::ignore;
    table[PLI_UNKNOWN46 as usize] = handlers::ignore;
    table[PLI_UNKNOWN47 as usize] = handlers::ignore;
    table[PLI_UPDATECLASS as usize] = handlers::ignore;
    table[PLI_RAWDATA as usize] = handlers::raw_data;
    table[PLI_PROFILEGET as usize] = handlers::profile_get;
    table[PLI_PROFILESET as usize] = handlers::profile_set;
    table[PLI_REQUESTTEXT as usize] = handlers::request_text;
    table[PLI_SENDTEXT as usize] = handlers::send_text;
    table[PLI_UNKNOWN157 as usize] = handlers::gani_back_to;
    table[PLI_UPDATESCRIPT as usize] = handlers::ignore;
    table
}

/// Opcode to handler, fixed at compile time
pub static HANDLERS: [Handler; 256] = handler_table();

/// Catch-all for opcodes without a handler
fn invalid_packet(server: &mut Server, id: u16, reader: &mut GReader) -> HandlerResult {
    debug!(
        "Unknown packet {} from session {}: {:?}",
        reader.data().first().map_or(0, |b| b.wrapping_sub(32)),
        id,
        reader.data()
    );
    server.count_invalid_packet(id)
}

impl Server {
    /// Counts a malformed record against the session's budget
    pub fn count_invalid_packet(&mut self, id: u16) -> HandlerResult {
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };
        session.invalid_packets += 1;
        if session.invalid_packets > INVALID_PACKET_LIMIT {
            warn!(
                "Session {} ({}) is sending invalid packets",
                id, session.account.name
            );
            return Err(Disconnect::with_reason(
                "Disconnected for sending invalid packets.",
            ));
        }
        Ok(())
    }

    /// Feeds bytes read from a session's socket through the frame reader.
    ///
    /// Any handler asking for a disconnect stops processing; the session is
    /// marked and removed by the next sweep.
    pub fn receive(&mut self, id: u16, bytes: &[u8]) {
        if self.registry.is_marked(id) {
            return;
        }
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        session.inbound.push(bytes);
        session.last_data = Instant::now();

        loop {
            let frame = match self.registry.get_mut(id) {
                Some(session) => session.inbound.next_frame(),
                None => None,
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(disconnect) = self.process_frame(id, &frame) {
                self.disconnect(id, disconnect.reason.as_deref());
                return;
            }
            if self.registry.is_marked(id) {
                return;
            }
        }

        if let Err(disconnect) = self.apply_gr_movement(id) {
            self.disconnect(id, disconnect.reason.as_deref());
        }
    }

    fn process_frame(&mut self, id: u16, frame: &[u8]) -> HandlerResult {
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let data = session.codec.decode_frame(frame);
        let mut records = Records::new(&data);

        if session.frame_state == FrameState::AwaitingLogin {
            session.frame_state = FrameState::Framing;
            session.packet_count += 1;
            let login = records.next_line().unwrap_or_default();
            self.login(id, login)?;
        }

        while records.has_more() {
            let Some(session) = self.registry.get_mut(id) else {
                return Ok(());
            };
            let next = match session.frame_state {
                FrameState::RawBlock(len) => {
                    session.frame_state = FrameState::Framing;
                    let strip = session.is_client() || (session.is_rc() && session.version > RCVER_1_1);
                    records.next_raw(len, strip)
                }
                _ => records.next_line(),
            };
            let Some(next) = next else {
                break;
            };
            let mut record = next.to_vec();
            if session.is_client() {
                session.codec.decrypt_record(&mut record);
            }
            if record.is_empty() {
                trace!("Skipping empty record from session {}", id);
                continue;
            }
            session.packet_count += 1;
            self.dispatch(id, &record)?;
        }
        Ok(())
    }

    /// Runs the handler for one complete record
    pub fn dispatch(&mut self, id: u16, record: &[u8]) -> HandlerResult {
        let mut reader = GReader::new(record);
        let opcode = reader.read_guchar();
        HANDLERS[usize::from(opcode)](self, id, &mut reader)
    }

    /// Movement queued by `gr.` flags, unless real movement arrived in the
    /// same read
    fn apply_gr_movement(&mut self, id: u16) -> HandlerResult {
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let queued = std::mem::take(&mut session.gr_movement);
        let updated = std::mem::replace(&mut session.gr_movement_updated, false);
        if updated {
            return Ok(());
        }
        for props in queued {
            self.set_props(id, &props, true, false)?;
        }
        Ok(())
    }
}
