//! Chat bar commands
//!
//! A chat message is checked for a command before the word filter runs.
//! Commands answer by replacing the player's own chat text, so the result
//! shows up in the chat bubble above the player.

use crate::account::DEFAULT_START_LEVEL;
use crate::collab::FilterCheck;
use crate::error::{Disconnect, HandlerResult};
use crate::server::Server;
use log::debug;
use shared::gstring::GWrite;
use shared::opcodes::PLO_PRIVATEMESSAGE;
use shared::packet;
use shared::props::*;
use std::time::{Duration, Instant};

const NICK_INTERVAL: Duration = Duration::from_secs(10);
/// How long a player must stand still before `unstick me` works
const UNSTICK_STILLNESS: Duration = Duration::from_secs(30);
const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".mng", ".gif"];

/// Palette indices understood by the COLORS prop
const COLOR_NAMES: [&str; 20] = [
    "white", "yellow", "orange", "pink", "red", "darkred", "lightgreen", "green", "darkgreen",
    "lightblue", "blue", "darkblue", "brown", "cynober", "purple", "darkpurple", "lightgray",
    "gray", "black", "transparent",
];

fn color_index(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = if name == "grey" { "gray" } else { name.as_str() };
    COLOR_NAMES.iter().position(|c| *c == name).map(|i| i as u8)
}

/// Text after a command word such as `setnick ` or `toguild: `
fn argument_text<'a>(chat: &'a str, command: &str) -> &'a str {
    chat.get(command.len()..).unwrap_or_default().trim()
}

impl Server {
    /// Runs a chat command.
    ///
    /// Returns `true` when the message was a command, in which case it is
    /// not passed through the word filter.
    pub fn process_chat(&mut self, id: u16, chat: &str) -> Result<bool, Disconnect> {
        let words: Vec<&str> = chat.split_whitespace().collect();
        let Some(&command) = words.first() else {
            return Ok(false);
        };
        let colors_allowed = self.settings().get_bool("setcolorsallowed", true);

        match (command, words.len()) {
            ("setnick", _) => {
                self.chat_set_nick(id, chat)?;
                Ok(true)
            }
            ("sethead" | "setbody" | "setsword" | "setshield", 2) => self.chat_set_image(id, command, words[1]),
            ("setskin" | "setcoat" | "setsleeves" | "setshoes" | "setbelt", 2) if colors_allowed => {
                self.chat_set_color(id, command, words[1])?;
                Ok(true)
            }
            ("warpto", _) => {
                self.chat_warp_to(id, &words[1..])?;
                Ok(true)
            }
            ("summon", 2) => {
                self.chat_summon(id, words[1])?;
                Ok(true)
            }
            ("unstick" | "unstuck", 2) if words[1] == "me" => self.chat_unstick(id, chat),
            ("showguild", _) => {
                self.chat_show_guild(id, &words[1..])?;
                Ok(true)
            }
            ("toguild:", _) => self.chat_to_guild(id, chat),
            ("showadmins", 1) => {
                let admins: Vec<String> = self
                    .registry
                    .iter()
                    .filter(|s| s.is_rc())
                    .map(|s| s.account.name.clone())
                    .collect();
                let list = if admins.is_empty() {
                    "(no one)".to_string()
                } else {
                    admins.join(", ")
                };
                self.set_chat(id, &format!("admins: {}", list))?;
                Ok(true)
            }
            ("showkills" | "showdeaths" | "showonlinetime", 1) => {
                let Some(account) = self.registry.get(id).map(|s| &s.account) else {
                    return Ok(true);
                };
                let text = match command {
                    "showkills" => format!("kills: {}", account.kills),
                    "showdeaths" => format!("deaths: {}", account.deaths),
                    _ => format!("onlinetime: {}", online_time(account.online_secs)),
                };
                self.set_chat(id, &text)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Replaces a player's chat text with a server answer
    pub(crate) fn set_chat(&mut self, id: u16, text: &str) -> HandlerResult {
        let mut props = Vec::new();
        props.write_gchar(PLPROP_CURCHAT).write_gstring(text.as_bytes());
        self.set_props(id, &props, true, true)
    }

    fn chat_set_nick(&mut self, id: u16, chat: &str) -> HandlerResult {
        let now = Instant::now();
        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let recent = session
            .last_nick
            .is_some_and(|t| now.saturating_duration_since(t) < NICK_INTERVAL);
        if recent {
            return self.set_chat(id, "Wait 10 seconds before changing your nick again!");
        }
        if let Some(s) = self.registry.get_mut(id) {
            s.last_nick = Some(now);
        }

        let mut nick = argument_text(chat, "setnick").to_string();
        if self.filter.apply(&mut nick, FilterCheck::Nick).warned {
            debug!("Nickname from session {} caught by the word filter", id);
            return Ok(());
        }
        let mut props = Vec::new();
        props.write_gchar(PLPROP_NICKNAME).write_gstring(nick.as_bytes());
        self.set_props(id, &props, true, true)
    }

    /// Local file for a requested image, trying the usual extensions
    fn find_image(&self, requested: &str) -> String {
        if self.files.exists(requested) {
            return requested.to_string();
        }
        IMAGE_EXTENSIONS
            .iter()
            .map(|ext| format!("{}{}", requested, ext))
            .find(|name| self.files.exists(name))
            .unwrap_or_else(|| requested.to_string())
    }

    /// Head, body, sword and shield images go through the image props, which
    /// refuse default assets and fetch unknown files from the list server
    fn chat_set_image(&mut self, id: u16, command: &str, requested: &str) -> Result<bool, Disconnect> {
        if !self.settings().get_bool(&format!("{}allowed", command), true) {
            return Ok(false);
        }
        let Some((sword, shield)) = self
            .registry
            .get(id)
            .map(|s| (s.account.sword_power, s.account.shield_power))
        else {
            return Ok(true);
        };
        let name: String = self.find_image(requested).chars().take(120).collect();

        let mut props = Vec::new();
        match command {
            "sethead" => {
                props
                    .write_gchar(PLPROP_HEADGIF)
                    .write_gchar((name.len() + 100) as u8)
                    .write_bytes(name.as_bytes());
            }
            "setbody" => {
                props.write_gchar(PLPROP_BODYIMG).write_gstring(name.as_bytes());
            }
            "setsword" => {
                props
                    .write_gchar(PLPROP_SWORDPOWER)
                    .write_gchar(sword.saturating_add(30))
                    .write_gstring(name.as_bytes());
            }
            _ => {
                props
                    .write_gchar(PLPROP_SHIELDPOWER)
                    .write_gchar(shield.saturating_add(10))
                    .write_gstring(name.as_bytes());
            }
        }
        self.set_props(id, &props, true, true)?;
        Ok(true)
    }

    fn chat_set_color(&mut self, id: u16, command: &str, color: &str) -> HandlerResult {
        let slot = match command {
            "setskin" => 0,
            "setcoat" => 1,
            "setsleeves" => 2,
            "setshoes" => 3,
            _ => 4,
        };
        let Some(index) = color_index(color) else {
            return Ok(());
        };
        let Some(mut colors) = self.registry.get(id).map(|s| s.account.colors) else {
            return Ok(());
        };
        colors[slot] = index;

        let mut props = Vec::new();
        props.write_gchar(PLPROP_COLORS);
        for c in colors {
            props.write_gchar(c);
        }
        self.set_props(id, &props, true, true)
    }

    fn is_staff_session(&self, id: u16) -> bool {
        self.registry
            .get(id)
            .is_some_and(|s| self.config.is_staff(&s.account.name))
    }

    fn client_by_account(&self, account: &str) -> Option<u16> {
        self.registry
            .iter()
            .find(|s| s.is_client() && s.account.name == account)
            .map(|s| s.id)
    }

    /// Level name and position of a session standing in a level
    fn whereabouts(&self, id: u16) -> Option<(String, f32, f32)> {
        let session = self.registry.get(id)?;
        let level = self.world.level(session.level?)?;
        let (x, y) = session.position();
        Some((level.name.clone(), x, y))
    }

    fn chat_warp_to(&mut self, id: u16, args: &[&str]) -> HandlerResult {
        if args.is_empty() || args.len() > 3 {
            return Ok(());
        }
        if !self.is_staff_session(id) && !self.settings().get_bool("warptoforall", false) {
            return self.set_chat(id, "(not authorized to warp)");
        }
        let coord = |s: &str| s.parse::<f32>().unwrap_or(0.0);
        match *args {
            [player] => {
                let target = self
                    .client_by_account(player)
                    .and_then(|other| self.whereabouts(other));
                match target {
                    Some((level, x, y)) => self.warp(id, &level, x, y, None),
                    None => Ok(()),
                }
            }
            [x, y] => {
                let mut props = Vec::new();
                props
                    .write_gchar(PLPROP_X)
                    .write_gchar((coord(x) * 2.0) as i32 as u8)
                    .write_gchar(PLPROP_Y)
                    .write_gchar((coord(y) * 2.0) as i32 as u8);
                self.set_props(id, &props, true, true)
            }
            [x, y, level] => self.warp(id, level, coord(x), coord(y), None),
            _ => Ok(()),
        }
    }

    fn chat_summon(&mut self, id: u16, player: &str) -> HandlerResult {
        if !self.is_staff_session(id) {
            return self.set_chat(id, "(not authorized to summon)");
        }
        let (Some(target), Some((level, x, y))) = (self.client_by_account(player), self.whereabouts(id)) else {
            return Ok(());
        };
        if let Err(disconnect) = self.warp(target, &level, x, y, None) {
            self.disconnect(target, disconnect.reason.as_deref());
        }
        Ok(())
    }

    /// Jailed players cannot unstick; the message is then ordinary chat
    fn chat_unstick(&mut self, id: u16, chat: &str) -> Result<bool, Disconnect> {
        let now = Instant::now();
        let Some(session) = self.registry.get(id) else {
            return Ok(true);
        };
        if self.config.is_jail_level(&session.account.level_name) {
            return Ok(false);
        }
        if now.saturating_duration_since(session.last_movement) < UNSTICK_STILLNESS {
            self.set_chat(id, &format!("Don't move for 30 seconds before doing '{}'!", chat))?;
            return Ok(true);
        }
        if let Some(s) = self.registry.get_mut(id) {
            s.last_movement = now;
        }

        let level = self.settings().get_str("unstickmelevel", DEFAULT_START_LEVEL);
        let x = self.settings().get_float("unstickmex", 30.0);
        let y = self.settings().get_float("unstickmey", 30.5);
        self.warp(id, &level, x, y, None)?;
        self.set_chat(id, "Warped!")?;
        Ok(true)
    }

    fn chat_show_guild(&mut self, id: u16, args: &[&str]) -> HandlerResult {
        let Some(own) = self.registry.get(id).map(|s| s.account.guild.clone()) else {
            return Ok(());
        };
        let guild = match args {
            [named] => named.to_string(),
            _ => own,
        };
        if guild.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = self
            .registry
            .iter()
            .filter(|s| s.account.guild == guild)
            .map(|s| {
                let nick = &s.account.nick;
                nick[..nick.find('(').unwrap_or(nick.len())].trim().to_string()
            })
            .collect();
        let list = if members.is_empty() {
            "(no one)".to_string()
        } else {
            members.join(", ")
        };
        self.set_chat(id, &format!("members of '{}': {}", guild, list))
    }

    /// Guildless players and empty messages fall through to ordinary chat
    fn chat_to_guild(&mut self, id: u16, chat: &str) -> Result<bool, Disconnect> {
        let Some(guild) = self.registry.get(id).map(|s| s.account.guild.clone()) else {
            return Ok(true);
        };
        let message = argument_text(chat, "toguild:");
        if guild.is_empty() || message.is_empty() {
            return Ok(false);
        }

        let members: Vec<u16> = self
            .registry
            .iter()
            .filter(|s| s.id != id && s.account.guild == guild)
            .map(|s| s.id)
            .collect();
        let mut p = packet(PLO_PRIVATEMESSAGE);
        p.write_gshort(u32::from(id))
            .write_bytes(format!("\"\",\"Guild message:\",\"{}\"", message).as_bytes());
        for member in &members {
            self.send_to(*member, &p);
        }

        let count = members.len();
        let plural = if count == 1 { "" } else { "s" };
        self.set_chat(id, &format!("({} guild member{} received your message)", count, plural))?;
        Ok(true)
    }
}

fn online_time(secs: u32) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
    let mut text = String::new();
    if hours != 0 {
        text.push_str(&format!("{}h ", hours));
    }
    if minutes != 0 || hours != 0 {
        text.push_str(&format!("{}m ", minutes));
    }
    text.push_str(&format!("{}s", seconds));
    text
}
