//! TCP listener and per-connection tasks
//!
//! The accept loop admits a connection, sniffs the protocol variant, and
//! hands the stream to a pair of tasks: the inbound decoder (this module's
//! read loops) and the outbound pusher draining the session's egress queue.
//! V2 connections run the Noise handshake before any mining traffic.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};

use orepool_core::{ConnectionId, ProtocolVariant};
use orepool_protocol::detect::{detect, Detected};
use orepool_protocol::noise::{
    encrypted_frame, handshake_frame, NoiseKeypair, NoiseReceiver, NoiseSender, NoiseSession,
    MSG_ENCRYPTED, MSG_HANDSHAKE,
};
use orepool_protocol::v1::{StratumRequest, MAX_LINE_LENGTH};
use orepool_protocol::v2::frame::{FrameCodec, FrameHeader, HEADER_SIZE};
use orepool_protocol::{Message, ProtocolError};

use crate::manager::ConnectionManager;
use crate::session::Session;
use crate::{DisconnectReason, Incoming, ServerCounters, ServerError, SessionHandler};

/// Listener tuning
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Serve line-delimited JSON-RPC on this port
    pub accept_v1: bool,
    /// Serve binary frames over Noise on this port
    pub accept_v2: bool,
    /// Deadline for protocol detection reads
    pub detect_timeout: Duration,
    /// Deadline for the whole Noise handshake
    pub handshake_timeout: Duration,
    /// Egress queue depth per session
    pub egress_capacity: usize,
    /// Best-effort egress drain window at close
    pub drain_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            bind_addr: "0.0.0.0:3333".parse().unwrap(),
            accept_v1: true,
            accept_v2: true,
            detect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            egress_capacity: 128,
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// Accepts miner connections on one port
pub struct PoolListener {
    config: ListenerConfig,
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn SessionHandler>,
    counters: Arc<ServerCounters>,
    noise_keypair: Option<NoiseKeypair>,
    next_id: AtomicU64,
}

impl PoolListener {
    pub fn new(
        config: ListenerConfig,
        manager: Arc<ConnectionManager>,
        handler: Arc<dyn SessionHandler>,
        counters: Arc<ServerCounters>,
        noise_keypair: Option<NoiseKeypair>,
    ) -> Result<Arc<PoolListener>, ServerError> {
        if config.accept_v2 && noise_keypair.is_none() {
            return Err(ServerError::Handler(
                "v2 listener requires a noise keypair".to_string(),
            ));
        }
        Ok(Arc::new(PoolListener {
            config,
            manager,
            handler,
            counters,
            noise_keypair,
            next_id: AtomicU64::new(1),
        }))
    }

    /// Accept until shutdown flips true
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(
            "listening on {} (v1: {}, v2: {})",
            self.config.bind_addr, self.config.accept_v1, self.config.accept_v2
        );

        let mut shutdown_accept = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let this = self.clone();
                            let conn_shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                this.handle_connection(stream, addr, conn_shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                        }
                    }
                }
                changed = shutdown_accept.changed() => {
                    if changed.is_err() || *shutdown_accept.borrow() {
                        info!("listener on {} stopping", self.config.bind_addr);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        self.counters
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        if self.manager.is_banned(&addr.ip()) {
            self.counters
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            debug!("{} dropped: banned", addr);
            return;
        }
        let _ = stream.set_nodelay(true);

        // Sniff the variant; Unknown closes with no reply
        let detected = match detect(&mut stream, self.config.detect_timeout).await {
            Ok(Detected::Variant { variant, prefix }) => (variant, prefix),
            Ok(Detected::Unknown) => {
                debug!("{} dropped: unknown protocol", addr);
                self.counters
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!("{} dropped during detection: {}", addr, e);
                self.counters
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let (variant, prefix) = detected;

        let allowed = match variant {
            ProtocolVariant::V1 => self.config.accept_v1,
            ProtocolVariant::V2 => self.config.accept_v2,
        };
        if !allowed {
            debug!("{} dropped: {} not served on this port", addr, variant);
            self.counters
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let extranonce1: [u8; 4] = rand::random();
        let (session, egress_rx) = Session::new(
            id,
            addr,
            variant,
            extranonce1.to_vec(),
            self.config.egress_capacity,
        );

        // Admission rejections close the socket with no Stratum reply
        if let Err(e) = self.manager.add(session.clone()) {
            debug!("{} admission rejected: {}", addr, e);
            self.counters
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        info!("{} connected from {} ({})", id, addr, variant);
        self.handler.on_connect(&session).await;

        let (read_half, write_half) = stream.into_split();
        let replay = Cursor::new(prefix).chain(read_half);

        match variant {
            ProtocolVariant::V1 => {
                self.serve_v1(session.clone(), egress_rx, replay, write_half, shutdown)
                    .await;
            }
            ProtocolVariant::V2 => {
                self.serve_v2(session.clone(), egress_rx, replay, write_half, shutdown)
                    .await;
            }
        }

        let reason = session.close_reason().unwrap_or(DisconnectReason::PeerGone);
        session.close(reason);
        self.handler.on_disconnect(&session, reason).await;
        self.manager.remove(id, reason);
        info!("{} disconnected ({})", id, reason);
    }

    /// V1: line-delimited JSON-RPC
    async fn serve_v1<R>(
        &self,
        session: Arc<Session>,
        egress_rx: mpsc::Receiver<Bytes>,
        read: R,
        write: OwnedWriteHalf,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let writer = tokio::spawn(pusher_loop(
            session.clone(),
            egress_rx,
            write,
            None,
            self.counters.clone(),
            self.config.drain_grace,
        ));

        let codec = LinesCodec::new_with_max_length(MAX_LINE_LENGTH);
        let mut lines = FramedRead::new(read, codec);

        loop {
            tokio::select! {
                _ = session.wait_closed() => break,
                changed = shutdown.changed() => {
                    // A dropped shutdown sender means the server is going away
                    if changed.is_err() || *shutdown.borrow() {
                        session.close(DisconnectReason::Shutdown);
                    }
                }
                line = lines.next() => {
                    match line {
                        None => {
                            session.close(DisconnectReason::PeerGone);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("{} read error: {}", session.id(), e);
                            session.close(DisconnectReason::ProtocolError);
                            break;
                        }
                        Some(Ok(line)) => {
                            self.counters.add_bytes_in(line.len() as u64 + 1);
                            session.touch();
                            trace!("{} <- {}", session.id(), line);
                            match StratumRequest::parse(&line) {
                                Ok(request) => {
                                    if let Err(e) =
                                        self.handler.on_frame(&session, Incoming::V1(request)).await
                                    {
                                        warn!("{} handler error: {}", session.id(), e);
                                        session.close(DisconnectReason::HandlerClosed);
                                        break;
                                    }
                                }
                                Err(e) => {
                                    // A malformed line fails only that message
                                    debug!("{} malformed request: {}", session.id(), e);
                                }
                            }
                        }
                    }
                }
            }
        }

        let _ = writer.await;
    }

    /// V2: Noise handshake, then encrypted binary frames
    async fn serve_v2<R>(
        &self,
        session: Arc<Session>,
        egress_rx: mpsc::Receiver<Bytes>,
        mut read: R,
        mut write: OwnedWriteHalf,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        // The keypair is checked at construction for v2 listeners
        let keypair = match &self.noise_keypair {
            Some(keypair) => keypair,
            None => {
                session.close(DisconnectReason::ProtocolError);
                return;
            }
        };

        let handshake = timeout(
            self.config.handshake_timeout,
            noise_handshake(keypair, &mut read, &mut write),
        )
        .await;
        let (noise_tx, noise_rx) = match handshake {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                debug!("{} handshake failed: {}", session.id(), e);
                session.close(DisconnectReason::ProtocolError);
                return;
            }
            Err(_) => {
                debug!("{} handshake timed out", session.id());
                session.close(DisconnectReason::ProtocolError);
                return;
            }
        };
        trace!("{} noise channel established", session.id());

        let writer = tokio::spawn(pusher_loop(
            session.clone(),
            egress_rx,
            write,
            Some(noise_tx),
            self.counters.clone(),
            self.config.drain_grace,
        ));

        let mut frames = FramedRead::new(read, FrameCodec);
        let mut noise_rx = noise_rx;

        loop {
            tokio::select! {
                _ = session.wait_closed() => break,
                changed = shutdown.changed() => {
                    // A dropped shutdown sender means the server is going away
                    if changed.is_err() || *shutdown.borrow() {
                        session.close(DisconnectReason::Shutdown);
                    }
                }
                frame = frames.next() => {
                    match frame {
                        None => {
                            session.close(DisconnectReason::PeerGone);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("{} frame error: {}", session.id(), e);
                            session.close(DisconnectReason::ProtocolError);
                            break;
                        }
                        Some(Ok(carrier)) => {
                            self.counters
                                .add_bytes_in(HEADER_SIZE as u64 + carrier.payload.len() as u64);
                            session.touch();

                            if carrier.header.message_type != MSG_ENCRYPTED {
                                // A handshake frame on an established channel
                                // is a frame-layer violation
                                session.close(DisconnectReason::ProtocolError);
                                break;
                            }
                            // A failed MAC terminates with no recovery
                            let plaintext = match noise_rx.decrypt(&carrier.payload) {
                                Ok(plaintext) => plaintext,
                                Err(e) => {
                                    warn!("{} decrypt failed: {}", session.id(), e);
                                    session.close(DisconnectReason::ProtocolError);
                                    break;
                                }
                            };
                            match decode_mining_frame(&plaintext) {
                                Ok(message) => {
                                    if let Err(e) =
                                        self.handler.on_frame(&session, Incoming::V2(message)).await
                                    {
                                        warn!("{} handler error: {}", session.id(), e);
                                        session.close(DisconnectReason::HandlerClosed);
                                        break;
                                    }
                                }
                                Err(e) => {
                                    // Payload-level violations fail the message only
                                    debug!("{} malformed message: {}", session.id(), e);
                                }
                            }
                        }
                    }
                }
            }
        }

        let _ = writer.await;
    }
}

/// Parse a decrypted transport payload into a typed message
fn decode_mining_frame(plaintext: &[u8]) -> Result<Message, ProtocolError> {
    let frame = orepool_protocol::noise::parse_inner_frame(plaintext)?;
    Message::decode_payload(frame.header.message_type, &frame.payload)
}

/// Run the NX handshake: read `-> e`, answer `<- e, ee, s, es`
async fn noise_handshake<R>(
    keypair: &NoiseKeypair,
    read: &mut R,
    write: &mut OwnedWriteHalf,
) -> Result<(NoiseSender, NoiseReceiver), ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut noise = NoiseSession::responder(keypair)?;

    let first = read_carrier_frame(read).await?;
    noise.read_message(&first)?;

    let response = noise.write_message()?;
    let encoded = handshake_frame(response).encode();
    write.write_all(&encoded).await?;
    write.flush().await?;

    if !noise.is_finished() {
        return Err(ServerError::Protocol(ProtocolError::Handshake(
            "handshake incomplete after message exchange".into(),
        )));
    }
    Ok(noise.into_transport()?.split())
}

/// Read one noise carrier frame during the handshake phase
async fn read_carrier_frame<R>(read: &mut R) -> Result<Vec<u8>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    read.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::parse(&header_bytes)?;
    if !header.length_in_bounds() {
        return Err(ServerError::Protocol(ProtocolError::OversizedFrame(
            header.length as usize,
        )));
    }
    if header.message_type != MSG_HANDSHAKE {
        return Err(ServerError::Protocol(ProtocolError::Handshake(
            "expected handshake frame".into(),
        )));
    }
    let mut payload = vec![0u8; header.length as usize];
    read.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Outbound pusher: the only consumer of a session's egress queue.
///
/// V1 payloads are JSON lines and gain their newline here; V2 payloads are
/// plaintext mining frames encrypted per message. After close the queue is
/// drained best-effort within the grace window.
async fn pusher_loop<W>(
    session: Arc<Session>,
    mut egress_rx: mpsc::Receiver<Bytes>,
    mut write: W,
    mut noise_tx: Option<NoiseSender>,
    counters: Arc<ServerCounters>,
    drain_grace: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            payload = egress_rx.recv() => {
                match payload {
                    Some(payload) => {
                        if let Err(e) =
                            write_payload(&mut write, &mut noise_tx, &payload, &counters).await
                        {
                            debug!("{} write failed: {}", session.id(), e);
                            session.close(DisconnectReason::PeerGone);
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = session.wait_closed() => {
                // Best-effort drain of whatever is already queued
                let drain = async {
                    while let Ok(payload) = egress_rx.try_recv() {
                        if write_payload(&mut write, &mut noise_tx, &payload, &counters)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    let _ = write.flush().await;
                };
                let _ = timeout(drain_grace, drain).await;
                break;
            }
        }
    }
}

async fn write_payload<W>(
    write: &mut W,
    noise_tx: &mut Option<NoiseSender>,
    payload: &Bytes,
    counters: &ServerCounters,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    match noise_tx {
        // V2: encrypt the plaintext frame and wrap it in a carrier
        Some(noise) => {
            let ciphertext = noise.encrypt(payload)?;
            let encoded = encrypted_frame(ciphertext).encode();
            write.write_all(&encoded).await?;
            counters.add_bytes_out(encoded.len() as u64);
        }
        // V1: one JSON line per payload
        None => {
            write.write_all(payload).await?;
            write.write_all(b"\n").await?;
            counters.add_bytes_out(payload.len() as u64 + 1);
        }
    }
    write.flush().await?;
    Ok(())
}
