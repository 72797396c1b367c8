//! Broadcast scopes and audience resolution
//!
//! A packet is routed by describing who should get it. The audience is
//! resolved against the registry and the world at send time, so sessions
//! that warp or disconnect mid-tick are never addressed through stale lists.

use crate::server::Server;
use crate::session::Session;
use crate::world::{adjacent, GridMap, LevelId, MapId};
use shared::RoleMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One session
    Session(u16),
    /// Every session except NPC servers
    All { except: Option<u16> },
    /// Sessions whose role is in the mask
    Roles { mask: RoleMask, except: Option<u16> },
    /// Clients standing in one level instance
    Level { level: LevelId, except: Option<u16> },
    /// Clients around a level, used for objects that are not players
    Area {
        level: LevelId,
        map: Option<MapId>,
        except: Option<u16>,
        only_gmap: bool,
    },
    /// Clients around a player: same level, or neighbouring grid cells
    Nearby {
        origin: u16,
        include_self: bool,
        only_gmap: bool,
    },
}

impl Scope {
    pub fn all_except(id: u16) -> Self {
        Scope::All { except: Some(id) }
    }

    pub fn roles(mask: RoleMask, except: u16) -> Self {
        Scope::Roles {
            mask,
            except: Some(except),
        }
    }

    pub fn level(level: LevelId, except: Option<u16>) -> Self {
        Scope::Level { level, except }
    }

    /// Neighbourhood of a player, not including the player
    pub fn nearby(origin: u16) -> Self {
        Scope::Nearby {
            origin,
            include_self: false,
            only_gmap: false,
        }
    }

    pub fn nearby_with_self(origin: u16) -> Self {
        Scope::Nearby {
            origin,
            include_self: true,
            only_gmap: false,
        }
    }
}

impl Server {
    /// Where a session stands on a grid map
    ///
    /// Gmaps track the grid cell in the session's own props; bigmaps derive it
    /// from the level the session is in.
    pub fn grid_position(&self, session: &Session, map: &GridMap) -> Option<(i32, i32)> {
        if map.is_gmap() {
            return Some((
                i32::from(session.account.gmap_level_x),
                i32::from(session.account.gmap_level_y),
            ));
        }
        let level = self.world.level(session.level?)?;
        map.position_of(&level.name)
    }

    /// Resolves a scope to session ids, ascending
    pub fn audience(&self, scope: Scope) -> Vec<u16> {
        match scope {
            Scope::Session(id) => self.registry.get(id).map(|s| vec![s.id]).unwrap_or_default(),
            Scope::All { except } => self
                .registry
                .iter()
                .filter(|s| Some(s.id) != except && !s.is_npc_server())
                .map(|s| s.id)
                .collect(),
            Scope::Roles { mask, except } => self
                .registry
                .iter()
                .filter(|s| Some(s.id) != except && mask.contains(s.role))
                .map(|s| s.id)
                .collect(),
            Scope::Level { level, except } => self.level_audience(level, except),
            Scope::Area {
                level,
                map,
                except,
                only_gmap,
            } => self.area_audience(level, map, except, only_gmap),
            Scope::Nearby {
                origin,
                include_self,
                only_gmap,
            } => self.nearby_audience(origin, include_self, only_gmap),
        }
    }

    pub fn route(&mut self, packet: &[u8], scope: Scope) {
        for id in self.audience(scope) {
            self.send_to(id, packet);
        }
    }

    fn level_audience(&self, level: LevelId, except: Option<u16>) -> Vec<u16> {
        self.registry
            .iter()
            .filter(|s| Some(s.id) != except && s.is_client() && s.level == Some(level))
            .map(|s| s.id)
            .collect()
    }

    fn area_audience(&self, level: LevelId, map: Option<MapId>, except: Option<u16>, only_gmap: bool) -> Vec<u16> {
        let grid = map.and_then(|m| self.world.map(m));
        let Some(grid) = grid.filter(|g| !(only_gmap && !g.is_gmap())) else {
            return self.level_audience(level, except);
        };
        let Some(center) = self
            .world
            .level(level)
            .and_then(|l| grid.position_of(&l.name))
        else {
            return Vec::new();
        };
        let group = except
            .and_then(|id| self.registry.get(id))
            .filter(|_| grid.group)
            .map(|s| s.group.clone());

        self.registry
            .iter()
            .filter(|s| s.is_client() && Some(s.id) != except && s.level.is_some())
            .filter(|s| group.as_ref().map_or(true, |g| *g == s.group))
            .filter(|s| s.map == map)
            .filter(|s| {
                self.grid_position(s, grid)
                    .is_some_and(|pos| adjacent(pos, center))
            })
            .map(|s| s.id)
            .collect()
    }

    fn nearby_audience(&self, origin: u16, include_self: bool, only_gmap: bool) -> Vec<u16> {
        let Some(me) = self.registry.get(origin) else {
            return Vec::new();
        };
        let Some(level_id) = me.level else {
            return Vec::new();
        };
        let singleplayer = self.world.level(level_id).map_or(false, |l| l.singleplayer);
        let grid = me.map.and_then(|m| self.world.map(m));

        let grid = match grid {
            Some(g) if !(only_gmap && !g.is_gmap()) && !singleplayer => g,
            _ => {
                let except = if include_self { None } else { Some(origin) };
                return self.level_audience(level_id, except);
            }
        };
        let Some(center) = self.grid_position(me, grid) else {
            return if include_self && me.is_client() { vec![origin] } else { Vec::new() };
        };

        let mut out = Vec::new();
        for other in self.registry.iter() {
            if !other.is_client() {
                continue;
            }
            if other.id == origin {
                if include_self {
                    out.push(origin);
                }
                continue;
            }
            if other.level.is_none() || other.map != me.map {
                continue;
            }
            if grid.group && other.group != me.group {
                continue;
            }
            if self
                .grid_position(other, grid)
                .is_some_and(|pos| adjacent(pos, center))
            {
                out.push(other.id);
            }
        }
        out
    }
}
