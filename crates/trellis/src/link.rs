//! TCP I/O: acceptors, dialing, the identity handshake, and the per-link
//! reader/writer task pair.
//!
//! Each accepted or dialed socket goes through the handshake before anything
//! else: both sides exchange a fixed protocol magic (version check) and an
//! identity packet carrying the node id and the advertised listen port. Only
//! then is the link published upward through the event channel handed to the
//! transport at construction.
//!
//! Per link, two tokio tasks run until the cancellation token fires:
//! - **Reader**: reads into a fixed buffer, feeds the frame decoder, and
//!   forwards every completed frame upward.
//! - **Writer**: drains the per-peer queue with one `write_all` at a time,
//!   which preserves FIFO order per direct neighbor.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::{encode_frame, Frame, FrameDecoder};
use crate::command::Command;
use crate::config::Config;
use crate::peer::{Link, Peer};
use crate::types::{Error, PeerId, Result};

/// Protocol identity magic, first word. Bump on any incompatible change.
pub const PROTOCOL_ID_1: u32 = 755_960_663;
/// Protocol identity magic, second word.
pub const PROTOCOL_ID_2: u32 = 1_683_390_694;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const WRITER_CHANNEL_SIZE: usize = 512;

/// Length of the handshake packet: two magic words, a length byte, the
/// 36-character hyphenated id, and the advertised port.
pub const HANDSHAKE_LEN: usize = 8 + 1 + 36 + 2;

// ---------------------------------------------------------------------------
// Upward events
// ---------------------------------------------------------------------------

/// Events delivered from the I/O layer to the peer manager.
pub(crate) enum IoEvent {
    /// A socket completed the handshake.
    Connected {
        id: PeerId,
        host: IpAddr,
        port: u16,
        link: Link,
    },
    /// A frame arrived on a direct link.
    Frame { from: PeerId, frame: Frame },
    /// A link's reader terminated (socket error, EOF, or cancellation).
    Closed { id: PeerId, seq: u64 },
}

// ---------------------------------------------------------------------------
// Transport capability interface
// ---------------------------------------------------------------------------

/// What the peer manager needs from a transport. The TCP implementation is
/// [`TcpIo`]; tests substitute their own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind the acceptors. Returns the actually bound port (resolves 0).
    async fn listen(&self, port: u16) -> Result<u16>;

    /// Dial a remote node and run the handshake. On `Ok(true)` the new link
    /// has been published through the event channel.
    async fn dial(&self, host: IpAddr, port: u16) -> Result<bool>;

    /// Encode a frame and queue it on a direct peer's link. Returns false
    /// if the peer has no live link.
    fn send(&self, command: Command, payload: &[u8], peer: &Peer) -> bool;

    /// Stop accepting new sockets. Established links are closed separately
    /// by cancelling their tokens.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// TCP implementation
// ---------------------------------------------------------------------------

pub struct TcpIo {
    local_id: PeerId,
    config: Config,
    /// The listen port carried in our handshake packets.
    advertised_port: AtomicU16,
    events: mpsc::Sender<IoEvent>,
    next_seq: Arc<AtomicU64>,
    accept_cancel: Mutex<CancellationToken>,
}

impl TcpIo {
    pub(crate) fn new(local_id: PeerId, config: Config, events: mpsc::Sender<IoEvent>) -> Self {
        Self {
            local_id,
            config,
            advertised_port: AtomicU16::new(0),
            events,
            next_seq: Arc::new(AtomicU64::new(0)),
            accept_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener, cancel: CancellationToken) {
        let local_id = self.local_id;
        let advertised = self.advertised_port.load(Ordering::Relaxed);
        let config = self.config.clone();
        let events = self.events.clone();
        let seq = self.next_seq.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote)) => {
                                tracing::debug!("accepted connection from {}", remote);
                                stream.set_nodelay(true).ok();
                                let events = events.clone();
                                let config = config.clone();
                                let seq = seq.clone();
                                tokio::spawn(async move {
                                    match complete_handshake(stream, local_id, advertised, &config)
                                        .await
                                    {
                                        Ok((stream, id, port)) => {
                                            publish_link(stream, id, port, false, seq, &config, events)
                                                .await;
                                        }
                                        Err(e) => {
                                            tracing::info!(
                                                "inbound handshake with {} failed: {}",
                                                remote, e
                                            );
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("accept error: {}", e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for TcpIo {
    async fn listen(&self, port: u16) -> Result<u16> {
        let v6 = TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)).await?;
        let bound = v6.local_addr()?.port();
        self.advertised_port.store(bound, Ordering::Relaxed);

        let cancel = {
            let mut guard = self.accept_cancel.lock().unwrap();
            guard.cancel();
            *guard = CancellationToken::new();
            guard.clone()
        };

        tracing::info!("listening on [::]:{}", bound);
        self.spawn_accept_loop(v6, cancel.clone());

        // A separate IPv4 acceptor; on dual-stack hosts the IPv6 socket
        // already covers this and the bind fails with AddrInUse.
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, bound)).await {
            Ok(v4) => self.spawn_accept_loop(v4, cancel),
            Err(e) => tracing::debug!("no separate IPv4 acceptor: {}", e),
        }

        Ok(bound)
    }

    async fn dial(&self, host: IpAddr, port: u16) -> Result<bool> {
        let stream =
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!("failed to connect to {}:{}: {}", host, port, e);
                    return Ok(false);
                }
                Err(_) => {
                    tracing::debug!("connection to {}:{} timed out", host, port);
                    return Ok(false);
                }
            };
        stream.set_nodelay(true).ok();

        let advertised = self.advertised_port.load(Ordering::Relaxed);
        match complete_handshake(stream, self.local_id, advertised, &self.config).await {
            Ok((stream, id, declared_port)) => {
                publish_link(
                    stream,
                    id,
                    declared_port,
                    true,
                    self.next_seq.clone(),
                    &self.config,
                    self.events.clone(),
                )
                .await;
                Ok(true)
            }
            Err(e) => {
                tracing::info!("handshake with {}:{} failed: {}", host, port, e);
                Ok(false)
            }
        }
    }

    fn send(&self, command: Command, payload: &[u8], peer: &Peer) -> bool {
        let Some(link) = peer.link.as_ref() else {
            return false;
        };
        let frame = encode_frame(command, payload);
        match link.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Queue is full; hand off to a task so dispatch never blocks.
                let tx = link.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(frame).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn shutdown(&self) {
        self.accept_cancel.lock().unwrap().cancel();
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Build the handshake packet: magic, id length, canonical id text, port.
pub fn handshake_packet(id: &PeerId, port: u16) -> [u8; HANDSHAKE_LEN] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[..4].copy_from_slice(&PROTOCOL_ID_1.to_be_bytes());
    out[4..8].copy_from_slice(&PROTOCOL_ID_2.to_be_bytes());
    out[8] = 36;
    let mut buf = uuid::Uuid::encode_buffer();
    let text = id.hyphenated().encode_lower(&mut buf);
    out[9..45].copy_from_slice(text.as_bytes());
    out[45] = (port >> 8) as u8;
    out[46] = (port & 0xFF) as u8;
    out
}

/// Run both directions of the handshake over any byte stream. Returns the
/// remote id and its declared listening port.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    local_id: PeerId,
    advertised_port: u16,
) -> Result<(PeerId, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&handshake_packet(&local_id, advertised_port))
        .await?;
    stream.flush().await?;

    let mut magic = [0u8; 8];
    stream.read_exact(&mut magic).await?;
    if magic[..4] != PROTOCOL_ID_1.to_be_bytes() || magic[4..] != PROTOCOL_ID_2.to_be_bytes() {
        return Err(Error::Handshake);
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    if len[0] as usize != 36 {
        return Err(Error::Handshake);
    }

    let mut id_text = [0u8; 36];
    stream.read_exact(&mut id_text).await?;
    let text = std::str::from_utf8(&id_text).map_err(|_| Error::Handshake)?;
    let id = PeerId::parse_str(text).map_err(|_| Error::Handshake)?;

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let declared_port = u16::from_be_bytes(port);

    if id == local_id {
        return Err(Error::Handshake);
    }
    Ok((id, declared_port))
}

async fn complete_handshake(
    mut stream: TcpStream,
    local_id: PeerId,
    advertised_port: u16,
    config: &Config,
) -> Result<(TcpStream, PeerId, u16)> {
    let (id, port) = tokio::time::timeout(
        config.handshake_timeout,
        handshake(&mut stream, local_id, advertised_port),
    )
    .await
    .map_err(|_| Error::Handshake)??;
    Ok((stream, id, port))
}

// ---------------------------------------------------------------------------
// Per-link tasks
// ---------------------------------------------------------------------------

/// Publish a handshaken socket: announce the link, then start its tasks.
/// The `Connected` event is sent before the reader starts so it always
/// precedes the link's frames in the event channel.
async fn publish_link(
    stream: TcpStream,
    id: PeerId,
    declared_port: u16,
    outbound: bool,
    seq: Arc<AtomicU64>,
    config: &Config,
    events: mpsc::Sender<IoEvent>,
) {
    let host = stream
        .peer_addr()
        .map(|a| match a.ip() {
            IpAddr::V6(v6) => v6.to_canonical(),
            v4 => v4,
        })
        .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));

    let seq = seq.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITER_CHANNEL_SIZE);
    let cancel = CancellationToken::new();

    let link = Link {
        seq,
        outbound,
        tx,
        cancel: cancel.clone(),
        last_seen: Instant::now(),
    };
    if events
        .send(IoEvent::Connected {
            id,
            host,
            port: declared_port,
            link,
        })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(link_reader(
        id,
        seq,
        read_half,
        events.clone(),
        cancel.clone(),
        config.read_buffer,
        config.max_payload,
    ));
    tokio::spawn(link_writer(id, rx, write_half, cancel));
}

/// Read loop: fixed-size reads through the frame decoder, frames upward.
pub(crate) async fn link_reader<R>(
    id: PeerId,
    seq: u64,
    mut conn: R,
    events: mpsc::Sender<IoEvent>,
    cancel: CancellationToken,
    read_buffer: usize,
    max_payload: usize,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut decoder = FrameDecoder::new(max_payload);
    let mut buf = vec![0u8; read_buffer];

    'read: loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = conn.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("peer {} read error: {}", id, e);
                    break;
                }
            },
        };

        match decoder.feed(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    if events.send(IoEvent::Frame { from: id, frame }).await.is_err() {
                        break 'read;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("peer {} sent an undecodable frame ({}), closing", id, e);
                break;
            }
        }
    }

    let _ = events.send(IoEvent::Closed { id, seq }).await;
    cancel.cancel();
}

/// Write loop: one frame in flight at a time, FIFO per destination.
pub(crate) async fn link_writer<W>(
    id: PeerId,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut conn: W,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(frame) => frame,
                None => break,
            },
        };
        if conn.write_all(&frame).await.is_err() {
            break;
        }
        if conn.flush().await.is_err() {
            break;
        }
    }
    tracing::trace!("peer {} writer stopped", id);
    cancel.cancel();
}
