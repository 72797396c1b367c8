//! TCP front end and main loop coordination
//!
//! The protocol core in [`crate::server::Server`] is single threaded and never
//! touches a socket. This module owns the listener and one reader and one
//! writer task per connection, all talking to the main loop over channels:
//! - reader tasks forward raw bytes as [`ServerMessage::DataReceived`] over a
//!   bounded queue, so a flooding peer waits on the main loop
//! - the main loop feeds them to the core, then flushes queued output
//! - writer tasks drain [`WriterCommand`]s onto the socket
//! - removed sessions get their final bytes written before the socket closes

use crate::error::ServerError;
use crate::server::Server;
use log::{debug, error, info, warn};
use shared::codec::{frame, zlib_compress};
use shared::gstring::GWrite;
use shared::opcodes::PLO_DISCMESSAGE;
use shared::packet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const READ_BUFFER: usize = 8192;
const WATCHDOG_POLL: Duration = Duration::from_millis(100);
/// Capacity of the queue from the network tasks to the main loop
const MESSAGE_QUEUE: usize = 1000;

/// Messages sent from network tasks to the main loop
#[derive(Debug)]
pub enum ServerMessage {
    DataReceived {
        id: u16,
        serial: u64,
        data: Vec<u8>,
    },
    ConnectionClosed {
        id: u16,
        serial: u64,
    },
    Shutdown,
}

/// Messages sent from the main loop to a connection's writer task
#[derive(Debug)]
pub enum WriterCommand {
    Send(Vec<u8>),
    Close,
}

/// Socket side of one session.
///
/// Session ids are reused, so every event carries the serial of the
/// connection that produced it and stale events are dropped.
#[derive(Debug)]
struct Connection {
    serial: u64,
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<WriterCommand>,
    reader: JoinHandle<()>,
}

/// Listener plus the protocol core it drives
pub struct NetworkServer {
    listener: TcpListener,
    core: Server,
    tick_duration: Duration,
    connections: HashMap<u16, Connection>,
    next_serial: u64,

    // Communication channels
    server_tx: mpsc::Sender<ServerMessage>,
    server_rx: mpsc::Receiver<ServerMessage>,
}

impl NetworkServer {
    pub async fn new(
        addr: &str,
        core: Server,
        tick_duration: Duration,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::channel(MESSAGE_QUEUE);

        Ok(NetworkServer {
            listener,
            core,
            tick_duration,
            connections: HashMap::new(),
            next_serial: 0,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Channel into the main loop; send [`ServerMessage::Shutdown`] to stop it
    pub fn sender(&self) -> mpsc::Sender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn core(&self) -> &Server {
        &self.core
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registers an accepted stream with the core and starts its tasks
    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }

        let id = match self.core.connect(&addr.ip().to_string()) {
            Ok(id) => id,
            Err(e) => {
                warn!("Refusing connection from {}: {}", addr, e);
                tokio::spawn(Self::refuse(stream, "This server is full."));
                return;
            }
        };

        self.next_serial += 1;
        let serial = self.next_serial;
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_loop(write_half, writer_rx));
        let reader = tokio::spawn(Self::read_loop(
            read_half,
            id,
            serial,
            self.server_tx.clone(),
        ));

        info!("Accepted connection {} from {} as session {}", serial, addr, id);
        self.connections.insert(
            id,
            Connection {
                serial,
                addr,
                writer: writer_tx,
                reader,
            },
        );
    }

    /// Sends a disconnect message in the pre-login encoding and closes
    async fn refuse(mut stream: TcpStream, reason: &str) {
        let mut p = packet(PLO_DISCMESSAGE);
        p.write_bytes(reason.as_bytes()).write_bytes(b"\n");
        let bytes = frame(&zlib_compress(&p));
        if let Err(e) = stream.write_all(&bytes).await {
            debug!("Failed to send refusal: {}", e);
        }
        let _ = stream.shutdown().await;
    }

    /// Forwards everything read from the socket until it closes
    async fn read_loop(
        mut reader: OwnedReadHalf,
        id: u16,
        serial: u64,
        server_tx: mpsc::Sender<ServerMessage>,
    ) {
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(len) => {
                    let message = ServerMessage::DataReceived {
                        id,
                        serial,
                        data: buffer[..len].to_vec(),
                    };
                    if let Err(e) = server_tx.send(message).await {
                        error!("Failed to send data to main loop: {}", e);
                        return;
                    }
                }
                Err(e) => {
                    debug!("Read error on session {}: {}", id, e);
                    break;
                }
            }
        }
        if server_tx
            .send(ServerMessage::ConnectionClosed { id, serial })
            .await
            .is_err()
        {
            debug!("Main loop gone before session {} closed", id);
        }
    }

    /// Writes queued bytes in order; stops on close or the first error
    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        while let Some(command) = writer_rx.recv().await {
            match command {
                WriterCommand::Send(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!("Write failed: {}", e);
                        break;
                    }
                }
                WriterCommand::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    }

    fn is_current(&self, id: u16, serial: u64) -> bool {
        self.connections.get(&id).is_some_and(|c| c.serial == serial)
    }

    /// Processes one message from the network tasks; false on shutdown
    fn handle_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::DataReceived { id, serial, data } => {
                if self.is_current(id, serial) {
                    self.core.receive(id, &data);
                }
            }
            ServerMessage::ConnectionClosed { id, serial } => {
                if self.is_current(id, serial) {
                    self.core.mark_disconnected(id);
                }
            }
            ServerMessage::Shutdown => return false,
        }
        true
    }

    /// Hands queued output to the writers and closes removed sessions
    fn flush(&mut self) {
        for id in self.core.pending_outbound() {
            let bytes = self.core.take_outbound(id);
            if let Some(connection) = self.connections.get(&id) {
                if connection.writer.send(WriterCommand::Send(bytes)).is_err() {
                    debug!("Writer for session {} is gone", id);
                }
            }
        }

        for (id, bytes) in self.core.sweep() {
            let Some(connection) = self.connections.remove(&id) else {
                continue;
            };
            if !bytes.is_empty() {
                let _ = connection.writer.send(WriterCommand::Send(bytes));
            }
            let _ = connection.writer.send(WriterCommand::Close);
            connection.reader.abort();
            info!("Closed session {} ({})", id, connection.addr);
        }
    }

    /// Main loop: accepts, feeds received bytes to the core, runs the timed
    /// events and flushes output after every step
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let watchdog = self.core.watchdog.spawn(WATCHDOG_POLL);
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },
                message = self.server_rx.recv() => {
                    let running = match message {
                        Some(message) => self.handle_message(message),
                        None => false,
                    };
                    if !running {
                        info!("Server shutting down");
                        break;
                    }
                },
                _ = tick_interval.tick() => {
                    self.core.tick(Instant::now());
                }
            }
            self.flush();
        }

        for (_, connection) in self.connections.drain() {
            let _ = connection.writer.send(WriterCommand::Close);
            connection.reader.abort();
        }
        watchdog.abort();
        Ok(())
    }
}
