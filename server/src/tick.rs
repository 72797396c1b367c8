//! Timed events, run by the main loop once per second
//!
//! Per client session:
//! - online time and AP regeneration
//! - inactivity and data timeouts
//!
//! Server wide:
//! - NEWWORLDTIME broadcast every 5 seconds
//! - invalid packet counters reset every minute
//! - empty group level instances freed every 5 minutes

use crate::handlers::ap_interval;
use crate::router::Scope;
use crate::server::Server;
use log::info;
use shared::gstring::GWrite;
use shared::opcodes::PLO_NEWWORLDTIME;
use shared::packet;
use shared::props::{PLPROP_ALIGNMENT, PLSTATUS_PAUSED};
use std::time::{Duration, Instant};

const SECOND: Duration = Duration::from_secs(1);
const WORLD_TIME_INTERVAL: Duration = Duration::from_secs(5);
const INVALID_RESET_INTERVAL: Duration = Duration::from_secs(60);
const GROUP_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

impl Server {
    /// Runs the timed events if a second has passed since the last run.
    /// Returns whether they ran.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.timers.last_second) < SECOND {
            return false;
        }
        self.timers.last_second = now;

        let clients: Vec<u16> = self
            .registry
            .iter()
            .filter(|s| s.is_client() && !self.registry.is_marked(s.id))
            .map(|s| s.id)
            .collect();
        for id in clients {
            self.session_events(id, now);
        }

        if now.saturating_duration_since(self.timers.last_world_time) >= WORLD_TIME_INTERVAL {
            self.timers.last_world_time = now;
            let mut p = packet(PLO_NEWWORLDTIME);
            p.write_gint4(self.world_time());
            self.route(&p, Scope::All { except: None });
        }

        if now.saturating_duration_since(self.timers.last_invalid_reset) >= INVALID_RESET_INTERVAL {
            self.timers.last_invalid_reset = now;
            for session in self.registry.iter_mut() {
                session.invalid_packets = 0;
            }
        }

        if now.saturating_duration_since(self.timers.last_group_sweep) >= GROUP_SWEEP_INTERVAL {
            self.timers.last_group_sweep = now;
            self.world.sweep_group_levels();
        }
        true
    }

    fn session_events(&mut self, id: u16, now: Instant) {
        let disconnect_idle = self.settings().get_bool("disconnectifnotmoved", false);
        let max_idle = Duration::from_secs(self.settings().get_int("maxnomovement", 1200).max(0) as u64);
        let ap_system = self.settings().get_bool("apsystem", true);

        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        session.account.online_secs += 1;

        if disconnect_idle
            && now.saturating_duration_since(session.last_movement) > max_idle
            && now.saturating_duration_since(session.last_chat) > max_idle
        {
            info!("Client {} has been disconnected due to inactivity", session.account.name);
            self.disconnect(id, Some("You have been disconnected due to inactivity."));
            return;
        }

        if session.is_timed_out(now) {
            info!("Client {} has timed out", session.account.name);
            self.disconnect(id, None);
            return;
        }

        if !ap_system {
            return;
        }
        let Some(level) = session.level else {
            return;
        };
        let sparring = self.world.level(level).is_some_and(|l| l.sparring);
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        if !session.account.has_status(PLSTATUS_PAUSED) && !sparring {
            session.account.ap_counter = session.account.ap_counter.saturating_sub(1);
        }
        if session.account.ap_counter > 0 {
            return;
        }

        let ap = session.account.ap;
        if ap < 100 {
            let mut props = Vec::new();
            props.write_gchar(PLPROP_ALIGNMENT).write_gchar(ap + 1);
            if let Err(disconnect) = self.set_props(id, &props, true, true) {
                self.disconnect(id, disconnect.reason.as_deref());
            }
        }
        let ap = self.registry.get(id).map_or(ap, |s| s.account.ap);
        let interval = ap_interval(self, ap);
        if let Some(session) = self.registry.get_mut(id) {
            session.account.ap_counter = interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{opcodes_of, place, test_server};
    use shared::opcodes::PLO_DISCMESSAGE;

    fn later(server: &Server, secs: u64) -> Instant {
        server.timers.last_second + Duration::from_secs(secs)
    }

    #[test]
    fn test_tick_runs_once_per_second() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        let start = server.timers.last_second;
        assert!(!server.tick(start + Duration::from_millis(500)));
        assert!(server.tick(start + SECOND));
        assert_eq!(server.session(id).unwrap().account.online_secs, 1);
    }

    #[test]
    fn test_ap_rises_when_counter_expires() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        {
            let account = &mut server.session_mut(id).unwrap().account;
            account.ap = 19;
            account.ap_counter = 1;
        }
        let now = later(&server, 1);
        server.session_mut(id).unwrap().last_data = now;
        server.tick(now);
        let account = &server.session(id).unwrap().account;
        assert_eq!(account.ap, 20);
        assert_eq!(account.ap_counter, 90);
    }

    #[test]
    fn test_ap_frozen_while_paused_or_sparring() {
        let mut server = test_server(&["a.nw", "arena.nw"]);
        let paused = place(&mut server, "a.nw");
        let sparring = place(&mut server, "arena.nw");
        server.session_mut(paused).unwrap().account.status |= PLSTATUS_PAUSED;
        for id in [paused, sparring] {
            server.session_mut(id).unwrap().account.ap_counter = 5;
        }
        let now = later(&server, 1);
        server.tick(now);
        assert_eq!(server.session(paused).unwrap().account.ap_counter, 5);
        assert_eq!(server.session(sparring).unwrap().account.ap_counter, 5);
    }

    #[test]
    fn test_data_timeout_disconnects() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        let now = later(&server, 301);
        server.tick(now);
        assert!(server.registry.is_marked(id));
    }

    #[test]
    fn test_inactivity_disconnect_when_enabled() {
        let mut server = test_server(&["a.nw"]);
        server.config.settings.set("disconnectifnotmoved", true);
        server.config.settings.set("maxnomovement", 10);
        let id = place(&mut server, "a.nw");
        let now = later(&server, 11);
        server.session_mut(id).unwrap().last_data = now;
        server.tick(now);
        assert!(server.registry.is_marked(id));
        assert_eq!(opcodes_of(server.session(id).unwrap()), vec![PLO_DISCMESSAGE]);
    }

    #[test]
    fn test_world_time_every_five_seconds() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        server.session_mut(id).unwrap().account.ap_counter = 1000;
        for secs in 1..=5 {
            let now = later(&server, 1);
            server.session_mut(id).unwrap().last_data = now;
            server.tick(now);
            let sent = opcodes_of(server.session(id).unwrap());
            assert_eq!(sent.contains(&PLO_NEWWORLDTIME), secs == 5, "second {}", secs);
        }
    }

    #[test]
    fn test_invalid_packets_reset_each_minute() {
        let mut server = test_server(&["a.nw"]);
        let id = place(&mut server, "a.nw");
        server.session_mut(id).unwrap().invalid_packets = 4;
        let now = later(&server, 60);
        server.session_mut(id).unwrap().last_data = now;
        server.tick(now);
        assert_eq!(server.session(id).unwrap().invalid_packets, 0);
    }
}
