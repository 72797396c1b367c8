//! One connected peer and everything the protocol core tracks for it

use crate::account::Account;
use crate::outbound::OutboundQueue;
use crate::world::{LevelId, MapId};
use shared::frame::{FrameBuffer, FrameState};
use shared::versions::{VersionId, VERSION_UNKNOWN, CLVER_2_1, CLVER_2_3};
use shared::{Codec, Role};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Inbound data silence after which a session is dropped
pub const DATA_TIMEOUT: Duration = Duration::from_secs(300);

/// When a session last left a level, or 0 to force a full resync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelVisit {
    pub level: LevelId,
    pub left_at: u64,
}

/// A connected session
///
/// Created on accept in the `Await` role; the login record promotes it.
/// Levels and maps are held by id, the world owns them.
#[derive(Debug)]
pub struct Session {
    pub id: u16,
    pub role: Role,
    pub ip: String,
    pub version: VersionId,
    pub version_code: String,

    pub codec: Codec,
    pub frame_state: FrameState,
    pub inbound: FrameBuffer,
    pub outbound: OutboundQueue,

    pub account: Account,
    pub level: Option<LevelId>,
    pub map: Option<MapId>,
    /// Party tag used to pick group map instances
    pub group: String,
    /// Private clones of singleplayer levels by name
    pub singleplayer_levels: HashMap<String, LevelId>,
    pub visits: Vec<LevelVisit>,
    /// Set once the first level has been sent
    pub first_level_sent: bool,

    pub loaded: bool,
    pub invalid_packets: u32,
    pub packet_count: u32,

    pub connected_at: Instant,
    pub last_data: Instant,
    pub last_movement: Instant,
    pub last_chat: Instant,
    pub last_message: Option<Instant>,
    pub last_nick: Option<Instant>,

    /// Legacy `gr.` movement flags waiting to be applied after the frame
    pub gr_movement: Vec<Vec<u8>>,
    pub gr_movement_updated: bool,

    pub os_type: String,
    pub codepage: u32,
}

impl Session {
    pub fn new(id: u16, ip: &str, now: Instant) -> Self {
        Self {
            id,
            role: Role::Await,
            ip: ip.to_string(),
            version: VERSION_UNKNOWN,
            version_code: String::new(),
            codec: Codec::new(),
            frame_state: FrameState::AwaitingLogin,
            inbound: FrameBuffer::new(),
            outbound: OutboundQueue::new(),
            account: Account::new(""),
            level: None,
            map: None,
            group: String::new(),
            singleplayer_levels: HashMap::new(),
            visits: Vec::new(),
            first_level_sent: false,
            loaded: false,
            invalid_packets: 0,
            packet_count: 0,
            connected_at: now,
            last_data: now,
            last_movement: now,
            last_chat: now,
            last_message: None,
            last_nick: None,
            gr_movement: Vec::new(),
            gr_movement_updated: false,
            os_type: "wind".to_string(),
            codepage: 1252,
        }
    }

    pub fn is_client(&self) -> bool {
        self.role.is_client()
    }

    pub fn is_rc(&self) -> bool {
        self.role.is_rc()
    }

    pub fn is_nc(&self) -> bool {
        self.role.is_nc()
    }

    pub fn is_npc_server(&self) -> bool {
        self.role.is_npc_server()
    }

    pub fn is_logged_in(&self) -> bool {
        self.role != Role::Await
    }

    /// Client older than 2.1, which speaks the 1.41 dialect
    pub fn is_legacy_client(&self) -> bool {
        self.is_client() && self.version < CLVER_2_1
    }

    /// Client that understands X2/Y2/Z2 movement
    pub fn has_precise_movement(&self) -> bool {
        self.is_client() && self.version >= CLVER_2_3
    }

    pub fn send(&mut self, packet: &[u8]) {
        self.outbound.push(packet);
    }

    pub fn send_all(&mut self, packets: &[Vec<u8>]) {
        for packet in packets {
            self.outbound.push(packet);
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.outbound.push_raw(bytes);
    }

    pub fn position(&self) -> (f32, f32) {
        (self.account.x, self.account.y)
    }

    /// Last leave time for a level, or `None` when it was never left
    pub fn cached_visit(&self, level: LevelId) -> Option<u64> {
        self.visits.iter().find(|v| v.level == level).map(|v| v.left_at)
    }

    /// Updates the visit cache on leaving a level; `reset` forces the next
    /// visit to resync everything
    pub fn record_leave(&mut self, level: LevelId, reset: bool, now: u64) {
        let left_at = if reset { 0 } else { now };
        match self.visits.iter_mut().find(|v| v.level == level) {
            Some(visit) => visit.left_at = left_at,
            None => self.visits.push(LevelVisit { level, left_at }),
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_data) > DATA_TIMEOUT
    }
}
