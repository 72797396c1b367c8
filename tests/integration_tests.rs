//! End-to-end tests driving the protocol core through wire bytes
//!
//! Each test builds a [`Server`] with in-memory levels and talks to it the
//! way the network layer does: encoded frames in through `receive`, encoded
//! frames out through `take_outbound` and `sweep`. The network tests at the
//! end run the same exchange over real TCP sockets.

use assert_approx_eq::assert_approx_eq;
use server::collab::{MemoryFileSystem, MemoryLevelSource};
use server::server::Server;
use server::settings::ServerConfig;
use server::world::LevelData;
use shared::codec::{frame, zlib_compress, Codec, Encoder, Generation};
use shared::frame::FrameBuffer;
use shared::gstring::GWrite;
use shared::opcodes::*;
use shared::packet;
use shared::props::{PLPROP_CURCHAT, PLPROP_PCONNECTED, PLPROP_X};
use std::time::{Duration, Instant};

const START_LEVEL: &str = "onlinestartlocal.nw";

fn test_server() -> Server {
    let levels = MemoryLevelSource::new()
        .with_level(START_LEVEL, LevelData::empty(1))
        .with_level("second.nw", LevelData::empty(1));
    Server::new(
        ServerConfig::default(),
        Box::new(MemoryFileSystem::new()),
        Box::new(levels),
    )
    .with_seed(7)
}

/// One simulated 2.22+ client with its own cipher state in both directions
struct WireClient {
    id: u16,
    encoder: Encoder,
    codec: Codec,
    inbound: FrameBuffer,
}

impl WireClient {
    fn login(server: &mut Server, account: &str, key: u8) -> Self {
        let id = server.connect("127.0.0.1").unwrap();
        let mut record = Vec::new();
        record.write_gchar(5).write_gchar(key);
        record.write_bytes(b"G3D22067");
        record.write_gchar(account.len() as u8).write_bytes(account.as_bytes());
        record.write_gchar(4).write_bytes(b"pass");
        record.push(b'\n');
        server.receive(id, &frame(&zlib_compress(&record)));

        let mut codec = Codec::new();
        codec.set_generation(Generation::Gen5);
        codec.reset(key);
        WireClient {
            id,
            encoder: Encoder::new(Generation::Gen5, key),
            codec,
            inbound: FrameBuffer::new(),
        }
    }

    fn send(&mut self, server: &mut Server, records: &[Vec<u8>]) {
        let mut plain = Vec::new();
        for r in records {
            plain.extend_from_slice(r);
            plain.push(b'\n');
        }
        server.receive(self.id, &frame(&self.encoder.encode_frame(&plain)));
    }

    fn decode(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.inbound.push(bytes);
        let mut records = Vec::new();
        while let Some(body) = self.inbound.next_frame() {
            let plain = self.codec.decode_frame(&body);
            records.extend(
                plain
                    .split(|&b| b == b'\n')
                    .filter(|r| !r.is_empty())
                    .map(|r| r.to_vec()),
            );
        }
        records
    }

    /// Everything the server queued for this client since the last read
    fn read(&mut self, server: &mut Server) -> Vec<Vec<u8>> {
        let bytes = server.take_outbound(self.id);
        self.decode(&bytes)
    }

    fn opcodes(&mut self, server: &mut Server) -> Vec<u8> {
        self.read(server)
            .iter()
            .map(|r| r[0].wrapping_sub(32))
            .collect()
    }
}

mod login_tests {
    use super::*;

    #[test]
    fn test_login_answers_in_negotiated_generation() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 9);

        let ops = alice.opcodes(&mut server);
        assert_eq!(ops.first(), Some(&PLO_SIGNATURE));
        assert!(ops.contains(&PLO_LEVELMODTIME));

        let session = server.session(alice.id).unwrap();
        assert!(session.loaded);
        assert_eq!(session.account.level_name, START_LEVEL);
    }

    #[test]
    fn test_players_see_each_other() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 1);
        alice.read(&mut server);

        let mut bob = WireClient::login(&mut server, "bob", 2);
        assert!(bob.opcodes(&mut server).contains(&PLO_OTHERPLPROPS));
        assert!(alice.opcodes(&mut server).contains(&PLO_OTHERPLPROPS));
    }

    #[test]
    fn test_garbage_login_type_disconnects() {
        let mut server = test_server();
        let id = server.connect("127.0.0.1").unwrap();
        let mut record = Vec::new();
        record.write_gchar(7).write_bytes(b"junk\n");
        server.receive(id, &frame(&zlib_compress(&record)));

        let removed = server.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, id);
        assert!(server.session(id).is_none());
    }
}

mod replication_tests {
    use super::*;

    #[test]
    fn test_movement_reaches_level_neighbours() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 3);
        let mut bob = WireClient::login(&mut server, "bob", 4);
        alice.read(&mut server);
        bob.read(&mut server);

        let mut props = packet(PLI_PLAYERPROPS);
        props.write_gchar(PLPROP_X).write_gchar(80);
        alice.send(&mut server, &[props]);

        let records = bob.read(&mut server);
        let moved = records
            .iter()
            .find(|r| r[0].wrapping_sub(32) == PLO_OTHERPLPROPS)
            .expect("bob sees alice move");
        assert!(moved.len() > 3);
        assert_approx_eq!(server.session(alice.id).unwrap().account.x, 40.0);
    }

    #[test]
    fn test_chat_and_toall_in_one_frame() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 5);
        let mut bob = WireClient::login(&mut server, "bob", 6);
        alice.read(&mut server);
        bob.read(&mut server);

        let mut chat = packet(PLI_PLAYERPROPS);
        chat.write_gchar(PLPROP_CURCHAT).write_gchar(2).write_bytes(b"hi");
        let mut toall = packet(PLI_TOALL);
        toall.write_gchar(5).write_bytes(b"hello");
        alice.send(&mut server, &[chat, toall]);

        let ops = bob.opcodes(&mut server);
        assert!(ops.contains(&PLO_OTHERPLPROPS));
        assert!(ops.contains(&PLO_TOALL));
        assert_eq!(server.session(alice.id).unwrap().account.chat, "hi");
    }

    #[test]
    fn test_level_warp_moves_between_levels() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 8);
        alice.read(&mut server);

        let mut warp = packet(PLI_LEVELWARP);
        warp.write_gchar(60).write_gchar(70).write_bytes(b"second.nw");
        alice.send(&mut server, &[warp]);

        let second = server.world.find_level("second.nw").unwrap();
        let session = server.session(alice.id).unwrap();
        assert_eq!(session.account.level_name, "second.nw");
        assert_approx_eq!(session.account.x, 30.0);
        assert_approx_eq!(session.account.y, 35.0);
        assert_eq!(session.level, Some(second));
    }
}

mod disconnect_tests {
    use super::*;

    #[test]
    fn test_sixth_invalid_packet_disconnects_with_message() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 11);
        alice.read(&mut server);

        alice.send(&mut server, &vec![packet(200); 5]);
        assert!(server.sweep().is_empty());

        alice.send(&mut server, &[packet(200)]);
        let removed = server.sweep();
        assert_eq!(removed.len(), 1);
        let records = alice.decode(&removed[0].1);
        let last = records.last().expect("a disconnect message");
        assert_eq!(last[0].wrapping_sub(32), PLO_DISCMESSAGE);
        assert_eq!(&last[1..], b"Disconnected for sending invalid packets.");
    }

    #[test]
    fn test_closed_socket_announces_departure() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 12);
        let mut bob = WireClient::login(&mut server, "bob", 13);
        alice.read(&mut server);
        bob.read(&mut server);

        server.mark_disconnected(alice.id);
        let removed = server.sweep();
        assert_eq!(removed.len(), 1);

        let gone = bob
            .read(&mut server)
            .into_iter()
            .filter(|r| r[0].wrapping_sub(32) == PLO_OTHERPLPROPS)
            .any(|r| r.last().map(|b| b.wrapping_sub(32)) == Some(PLPROP_PCONNECTED));
        assert!(gone);
        assert!(server.session(alice.id).is_none());
    }

    #[test]
    fn test_freed_session_id_is_reused() {
        let mut server = test_server();
        let alice = WireClient::login(&mut server, "alice", 14);
        let first = alice.id;
        server.mark_disconnected(first);
        server.sweep();

        let bob = WireClient::login(&mut server, "bob", 15);
        assert_eq!(bob.id, first);
    }
}

mod tick_tests {
    use super::*;

    #[test]
    fn test_world_time_broadcast() {
        let mut server = test_server();
        let mut alice = WireClient::login(&mut server, "alice", 16);
        alice.read(&mut server);

        assert!(server.tick(Instant::now() + Duration::from_secs(6)));
        let records = alice.read(&mut server);
        let time = records
            .iter()
            .find(|r| r[0].wrapping_sub(32) == PLO_NEWWORLDTIME)
            .expect("world time sent");
        assert_eq!(time.len(), 5);
    }

    #[test]
    fn test_silent_client_times_out() {
        let mut server = test_server();
        let alice = WireClient::login(&mut server, "alice", 17);
        server.tick(Instant::now() + Duration::from_secs(400));
        let removed = server.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, alice.id);
    }
}

mod network_tests {
    use super::*;
    use server::network::{NetworkServer, ServerMessage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn next_records(stream: &mut TcpStream, client: &mut WireClient) -> Vec<Vec<u8>> {
        let mut chunk = [0u8; 4096];
        loop {
            let len = timeout(Duration::from_secs(5), stream.read(&mut chunk))
                .await
                .expect("data within timeout")
                .expect("read succeeds");
            assert!(len > 0, "server closed the connection");
            let records = client.decode(&chunk[..len]);
            if !records.is_empty() {
                return records;
            }
        }
    }

    #[tokio::test]
    async fn test_two_clients_over_tcp() {
        let mut network = NetworkServer::new("127.0.0.1:0", test_server(), Duration::from_millis(10))
            .await
            .unwrap();
        let addr = network.local_addr().unwrap();
        let shutdown = network.sender();
        let handle = tokio::spawn(async move { network.run().await.map_err(|e| e.to_string()) });

        let mut sockets = Vec::new();
        let mut clients = Vec::new();
        for (account, key) in [("alice", 21u8), ("bob", 22u8)] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut record = Vec::new();
            record.write_gchar(5).write_gchar(key);
            record.write_bytes(b"G3D22067");
            record.write_gchar(account.len() as u8).write_bytes(account.as_bytes());
            record.write_gchar(4).write_bytes(b"pass");
            record.push(b'\n');
            stream.write_all(&frame(&zlib_compress(&record))).await.unwrap();

            let mut client = WireClient {
                id: 0,
                encoder: Encoder::new(Generation::Gen5, key),
                codec: Codec::new(),
                inbound: FrameBuffer::new(),
            };
            client.codec.set_generation(Generation::Gen5);
            client.codec.reset(key);
            let records = next_records(&mut stream, &mut client).await;
            assert_eq!(records[0][0].wrapping_sub(32), PLO_SIGNATURE);
            sockets.push(stream);
            clients.push(client);
        }

        // Alice talks to everyone; bob should hear it
        let mut toall = packet(PLI_TOALL);
        toall.write_gchar(3).write_bytes(b"hey");
        let mut plain = toall.clone();
        plain.push(b'\n');
        let bytes = frame(&clients[0].encoder.encode_frame(&plain));
        sockets[0].write_all(&bytes).await.unwrap();

        let mut heard = false;
        for _ in 0..10 {
            let records = next_records(&mut sockets[1], &mut clients[1]).await;
            if records.iter().any(|r| r[0].wrapping_sub(32) == PLO_TOALL && r.ends_with(b"hey")) {
                heard = true;
                break;
            }
        }
        assert!(heard);

        tokio_test::assert_ok!(shutdown.send(ServerMessage::Shutdown).await);
        let result = tokio_test::assert_ok!(handle.await);
        tokio_test::assert_ok!(result);
    }
}
