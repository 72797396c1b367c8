//! Login record handling and session promotion
//!
//! The first record of a connection names the peer's role, cipher key,
//! version and account. After the admission checks the account goes to the
//! server list, which may answer right away or later through
//! [`Server::account_verified`].

use crate::collab::LoginVerdict;
use crate::error::{Disconnect, HandlerResult};
use crate::router::Scope;
use crate::server::Server;
use crate::visibility::VISIBILITY;
use log::{info, warn};
use shared::gstring::{to_text, GReader, GWrite};
use shared::opcodes::*;
use shared::versions::{version_id_for, version_name};
use shared::{packet, Generation, Role, RoleMask};

impl Server {
    /// Parses the login record and runs the admission checks
    pub(crate) fn login(&mut self, id: u16, record: &[u8]) -> HandlerResult {
        let mut reader = GReader::new(record);
        let type_byte = reader.read_gchar();
        let Some(role) = Role::from_login_byte(type_byte) else {
            warn!("New login: unknown type {} on session {}", type_byte, id);
            let shown = u32::try_from(type_byte)
                .ok()
                .and_then(|t| 1u32.checked_shl(t))
                .unwrap_or(0);
            return Err(Disconnect::with_reason(format!(
                "Your client type is unknown.  Please inform the Graal Reborn staff.  Type: {}.",
                shown
            )));
        };

        let generation = role.generation();
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };
        session.role = role;
        session.codec.set_generation(generation);

        if role.is_client() || (role.is_rc() && generation > Generation::Gen3) {
            let key = reader.read_gchar() as u8;
            session.codec.reset(key);
            if generation > Generation::Gen3 {
                session.outbound.set_codec(generation, key);
            }
        }

        let version = reader.read_chars(8);
        session.version = version_id_for(role, version);
        session.version_code = to_text(version);
        let account_len = usize::from(reader.read_guchar());
        let account = to_text(reader.read_chars(account_len));
        let password_len = usize::from(reader.read_guchar());
        let password = to_text(reader.read_chars(password_len));
        session.account.name = account.clone();
        session.account.community_name = account.clone();
        let ip = session.ip.clone();
        let version_id = session.version;

        info!(
            "New login: {} version {} ({}) account {}",
            role.label(),
            session.version_code,
            version_name(role, version),
            account
        );

        let max_players = self.settings().get_int("maxplayers", 128).max(0) as usize;
        let others = self.registry.player_count().saturating_sub(1);
        if others >= max_players {
            return Err(Disconnect::with_reason("This server has reached its player limit."));
        }

        if self.config.is_ip_banned(&ip) && !self.config.is_staff(&account) {
            return Err(Disconnect::with_reason("You have been banned from this server."));
        }

        if role.is_client() && !self.config.is_version_allowed(version_id) {
            return Err(Disconnect::with_reason(format!(
                "Your client version is not allowed on this server.\rAllowed: {}",
                self.config.allowed_versions_text()
            )));
        }

        if !self.list.is_connected() {
            return Err(Disconnect::with_reason(
                "The login server is offline.  Try again later.",
            ));
        }

        let verdict = self.list.verify_account(id, &account, &password, role);
        self.apply_verdict(id, verdict)
    }

    /// Completes a login the server list answered later
    pub fn account_verified(&mut self, id: u16, verdict: LoginVerdict) {
        if let Err(disconnect) = self.apply_verdict(id, verdict) {
            self.disconnect(id, disconnect.reason.as_deref());
        }
    }

    fn apply_verdict(&mut self, id: u16, verdict: LoginVerdict) -> HandlerResult {
        match verdict {
            LoginVerdict::Accepted => self.complete_login(id),
            LoginVerdict::Denied(reason) => Err(Disconnect::with_reason(reason)),
            LoginVerdict::Deferred => Ok(()),
        }
    }

    fn complete_login(&mut self, id: u16) -> HandlerResult {
        let Some(session) = self.registry.get_mut(id) else {
            return Ok(());
        };
        if session.loaded {
            return Ok(());
        }
        session.loaded = true;
        let role = session.role;

        if role.is_client() {
            self.complete_client_login(id)
        } else if role.is_rc() {
            self.complete_staff_login(id, RoleMask::ANY_RC, "New RC");
            Ok(())
        } else if role.is_nc() {
            self.complete_staff_login(id, RoleMask::ANY_NC, "New NC");
            Ok(())
        } else {
            info!("NPC server logged in on session {}", id);
            Ok(())
        }
    }

    fn complete_client_login(&mut self, id: u16) -> HandlerResult {
        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let account = session.account.name.clone();
        let nick = if session.account.nick.is_empty() {
            account.clone()
        } else {
            session.account.nick.clone()
        };
        self.set_nick(id, &nick, false);

        let mut signature = packet(PLO_SIGNATURE);
        signature.write_gchar(73);
        self.send_to(id, &signature);
        self.send_props(id, &VISIBILITY.send_on_login);

        let me = self.props_packet(id, Some(&VISIBILITY.get_login));
        self.route(&me, Scope::roles(RoleMask::ANY_CLIENT, id));
        let me = self.props_packet(id, Some(&VISIBILITY.get_rc_login));
        self.route(&me, Scope::roles(RoleMask::ANY_RC, id));
        let me = self.props_packet(id, Some(&VISIBILITY.get_login_nc));
        self.route(&me, Scope::roles(RoleMask::ANY_NC, id));

        let others: Vec<u16> = self
            .registry
            .iter()
            .filter(|s| s.id != id && s.is_client() && s.loaded)
            .map(|s| s.id)
            .collect();
        for other in others {
            let p = self.props_packet(other, Some(&VISIBILITY.get_login));
            self.send_to(id, &p);
        }

        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let (nick, level_name) = (session.account.nick.clone(), session.account.level_name.clone());
        self.list.add_player(id, &account, &nick, &level_name);

        let (level, x, y) = if level_name.is_empty() {
            (
                self.settings().get_str("startlevel", "onlinestartlocal.nw"),
                self.settings().get_float("startx", 30.0),
                self.settings().get_float("starty", 30.5),
            )
        } else {
            (level_name, session.account.x, session.account.y)
        };
        info!("{} logged in as {}", account, nick);
        self.warp(id, &level, x, y, Some(0))
    }

    /// RC and NC logins only need the player list
    fn complete_staff_login(&mut self, id: u16, peers: RoleMask, label: &str) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        let account = session.account.name.clone();
        session.account.nick = account.clone();
        let table = if peers == RoleMask::ANY_NC {
            &VISIBILITY.get_login_nc
        } else {
            &VISIBILITY.get_rc_login
        };

        let mut p = packet(PLO_RC_CHAT);
        p.write_bytes(format!("{}: {}", label, account).as_bytes());
        self.route(&p, Scope::roles(peers, id));

        let clients: Vec<u16> = self
            .registry
            .iter()
            .filter(|s| s.is_client() && s.loaded)
            .map(|s| s.id)
            .collect();
        for other in clients {
            let p = self.props_packet(other, Some(table));
            self.send_to(id, &p);
        }
        self.list.add_player(id, &account, &account, "");
        info!("{} logged in: {}", label, account);
    }
}
