//! # Game Server Library
//!
//! Session and protocol core of a Graal-style game server. It accepts
//! clients, remote-control tools and an NPC server over TCP, decodes their
//! length-prefixed frames in any of the five protocol generations and keeps
//! the shared world (levels, maps, items, NPCs) consistent across all of
//! them.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Every connection gets a session id from the registry. The first record
//! negotiates role, cipher key and version; admission checks, the server
//! list and the initial warp follow. Disconnects are deferred: sessions are
//! marked and removed by a sweep once nothing references them.
//!
//! ### Record Dispatch
//! Inbound records are routed through a 256-entry opcode table. Unassigned
//! opcodes count as invalid packets; more than five within a minute
//! disconnect the session.
//!
//! ### Replication
//! Player properties, level contents and gameplay events are forwarded to
//! the right audience: one session, a role class, a level, a map area or
//! the neighbours of a player.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Core
//! [`server::Server`] owns all sessions and the world and is only touched
//! from the main loop. Network tasks exchange bytes with it over channels,
//! so the core needs no locks and can be driven directly in tests.
//!
//! ### TCP Front End
//! [`network::NetworkServer`] accepts connections, spawns a reader and a
//! writer task per socket and runs the main loop with `tokio::select!`.
//!
//! ## Module Organization
//!
//! - `session`, `registry`, `account`: per-connection state and id allocation
//! - `dispatch`, `login`, `handlers`: the inbound record path
//! - `props`, `items`: player property and item codecs
//! - `router`, `visibility`: audience selection
//! - `world`, `transition`: levels, maps and warps
//! - `outbound`: per-session output queues
//! - `tick`, `watchdog`: timed events and script time limits
//! - `collab`: file system, server list, word filter and script interfaces
//! - `settings`, `error`, `utils`: configuration and shared helpers
//! - `network`: sockets and the main loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::collab::{DirFileSystem, StaticLevelSource};
//! use server::network::NetworkServer;
//! use server::server::Server;
//! use server::settings::ServerConfig;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let files = DirFileSystem::new("world")?;
//!     let levels = StaticLevelSource::new(Box::new(DirFileSystem::new("world")?));
//!     let core = Server::new(ServerConfig::default(), Box::new(files), Box::new(levels));
//!
//!     let mut server =
//!         NetworkServer::new("127.0.0.1:14900", core, Duration::from_millis(50)).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod chat;
pub mod collab;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod items;
pub mod login;
pub mod network;
pub mod outbound;
pub mod props;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod settings;
pub mod tick;
pub mod transition;
pub mod utils;
pub mod visibility;
pub mod watchdog;
pub mod world;

#[cfg(test)]
pub(crate) mod fixtures;
