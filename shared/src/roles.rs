//! Connection roles negotiated by the first byte of the login record

use crate::codec::Generation;

/// What kind of program is on the other end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connected but not logged in yet
    Await,
    Client,
    Rc,
    NpcServer,
    Nc,
    /// 2.19 - 2.21 and 3.0 clients
    Client2,
    /// 2.22+ clients
    Client3,
    /// 2.22+ remote control
    Rc2,
}

impl Role {
    /// The role bit carried on the wire (`1 << n`)
    pub fn bit(self) -> u8 {
        match self {
            Role::Await => 0,
            Role::Client => 0x01,
            Role::Rc => 0x02,
            Role::NpcServer => 0x04,
            Role::Nc => 0x08,
            Role::Client2 => 0x10,
            Role::Client3 => 0x20,
            Role::Rc2 => 0x40,
        }
    }

    /// Resolves the login byte; `None` for unknown types
    pub fn from_login_byte(value: i8) -> Option<Role> {
        if !(0..8).contains(&value) {
            return None;
        }
        match 1u8 << value {
            0x01 => Some(Role::Client),
            0x02 => Some(Role::Rc),
            0x04 => Some(Role::NpcServer),
            0x08 => Some(Role::Nc),
            0x10 => Some(Role::Client2),
            0x20 => Some(Role::Client3),
            0x40 => Some(Role::Rc2),
            _ => None,
        }
    }

    /// Inbound encryption generation the role speaks
    pub fn generation(self) -> Generation {
        match self {
            Role::Await => Generation::Gen2,
            Role::Client | Role::Rc | Role::NpcServer | Role::Nc => Generation::Gen3,
            Role::Client2 => Generation::Gen4,
            Role::Client3 | Role::Rc2 => Generation::Gen5,
        }
    }

    pub fn is_client(self) -> bool {
        RoleMask::ANY_CLIENT.contains(self)
    }

    pub fn is_rc(self) -> bool {
        RoleMask::ANY_RC.contains(self)
    }

    pub fn is_nc(self) -> bool {
        self == Role::Nc
    }

    pub fn is_npc_server(self) -> bool {
        self == Role::NpcServer
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Await => "Awaiting login",
            Role::Client => "Client",
            Role::Rc => "RC",
            Role::NpcServer => "NPCSERVER",
            Role::Nc => "NC",
            Role::Client2 => "New Client (2.19 - 2.21, 3 - 3.01)",
            Role::Client3 => "New Client (2.22+)",
            Role::Rc2 => "New RC (2.22+)",
        }
    }
}

/// A set of roles, used to address broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleMask(pub u8);

impl RoleMask {
    pub const ANY_CLIENT: RoleMask = RoleMask(0x01 | 0x10 | 0x20);
    pub const ANY_RC: RoleMask = RoleMask(0x02 | 0x40);
    pub const ANY_NC: RoleMask = RoleMask(0x08);
    pub const NPC_SERVER: RoleMask = RoleMask(0x04);
    pub const ANY_PLAYER: RoleMask = RoleMask(0x01 | 0x10 | 0x20 | 0x02 | 0x40);

    pub fn contains(self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn union(self, other: RoleMask) -> RoleMask {
        RoleMask(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_byte_mapping() {
        assert_eq!(Role::from_login_byte(0), Some(Role::Client));
        assert_eq!(Role::from_login_byte(4), Some(Role::Client2));
        assert_eq!(Role::from_login_byte(5), Some(Role::Client3));
        assert_eq!(Role::from_login_byte(6), Some(Role::Rc2));
        assert_eq!(Role::from_login_byte(7), None);
        assert_eq!(Role::from_login_byte(-3), None);
    }

    #[test]
    fn test_generations() {
        assert_eq!(Role::Client.generation(), Generation::Gen3);
        assert_eq!(Role::Client2.generation(), Generation::Gen4);
        assert_eq!(Role::Client3.generation(), Generation::Gen5);
        assert_eq!(Role::Rc2.generation(), Generation::Gen5);
    }

    #[test]
    fn test_masks() {
        assert!(Role::Client3.is_client());
        assert!(!Role::Rc.is_client());
        assert!(RoleMask::ANY_PLAYER.contains(Role::Rc2));
        assert!(!RoleMask::ANY_PLAYER.contains(Role::NpcServer));
        assert!(!RoleMask::ANY_PLAYER.contains(Role::Await));
        assert!(RoleMask::ANY_PLAYER.union(RoleMask::NPC_SERVER).contains(Role::NpcServer));
    }
}
