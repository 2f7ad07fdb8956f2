//! The peer manager.
//!
//! A single event-loop task owns all membership state. Per-socket reader
//! tasks only decode frames and forward `(source, command, payload)` into
//! the loop's event channel; cross-thread entry points (`send_to`,
//! `send_to_all`, `disconnect`) post control messages instead of touching
//! the state directly. Handlers return a list of actions which the loop
//! executes after every lock has been released, so user callbacks never run
//! under a lock and may freely call back into the mesh.
//!
//! Membership protocol in short:
//! - A new direct neighbor is asked for its peer table (`RetrievePeers`) and
//!   announced to every other neighbor (`ForwardingTo`), so routes exist
//!   before any direct link does.
//! - Peers learned through gossip are recorded with the announcing neighbor
//!   as their bridge and re-announced to the other neighbors the first time
//!   they are seen, so membership floods the whole mesh; shorter routes
//!   replace longer ones.
//! - Losing a direct neighbor drops every peer bridged through it and
//!   propagates `StopForwarding` so downstream tables converge.
//! - Unicasts carry the destination id and hop along bridges; broadcasts
//!   carry the origin id and flood, with an on-route acceptance check that
//!   keeps delivery exactly-once on cyclic meshes.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::Frame;
use crate::command::{self, Command, PayloadReader};
use crate::config::Config;
use crate::link::{IoEvent, TcpIo, Transport};
use crate::listeners::{ListenerId, Listeners};
use crate::peer::{Link, Peer, DISTANCE_UNKNOWN};
use crate::types::{Error, PeerId, Result};

const EVENT_CHANNEL_SIZE: usize = 512;
const CONTROL_CHANNEL_SIZE: usize = 64;

/// Grace period for the goodbye frames to reach the wire on disconnect.
const GOODBYE_GRACE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Loop inputs and outputs
// ---------------------------------------------------------------------------

/// Work posted to the event loop from other threads.
enum Control {
    SendTo { target: PeerId, data: Vec<u8> },
    SendToAll { data: Vec<u8> },
    DialFailed { requester: PeerId, target: PeerId },
    Shutdown,
}

/// What a handler wants done once the peer table lock is released.
enum Action {
    /// Queue a frame on a direct peer's link.
    Send {
        to: Peer,
        command: Command,
        payload: Vec<u8>,
    },
    /// Hand a payload to the data listeners.
    Deliver {
        from: Peer,
        data: Vec<u8>,
        broadcast: bool,
    },
    /// Fire the connection listeners.
    Connected(Peer),
    /// Fire the disconnection listeners.
    Disconnected(Peer),
    /// Force-close a link.
    Cancel(CancellationToken),
    /// Dial a peer in the background; failure reports back as `CantConnect`
    /// to the requester.
    Dial {
        requester: PeerId,
        target: PeerId,
        host: IpAddr,
        port: u16,
    },
}

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

/// A node in the overlay mesh.
///
/// Every participant runs one `Mesh`: it accepts connections on its port,
/// keeps the table of direct and forwarded peers, and can send bytes to any
/// of them, relaying through a neighbor when no direct link exists.
pub struct Mesh {
    local_id: PeerId,
    config: Config,
    port: AtomicU16,
    transport: Arc<dyn Transport>,
    peers: RwLock<HashMap<PeerId, Peer>>,
    listeners: Listeners,
    /// Pairs already introduced to each other, so a failed dial in one
    /// direction triggers at most one reverse attempt.
    introduced: StdMutex<HashSet<(PeerId, PeerId)>>,
    running: AtomicBool,
    control_tx: mpsc::Sender<Control>,
    /// Receivers parked here while the loop is stopped; taken on start and
    /// returned on exit so the mesh can be restarted.
    rx_slots: StdMutex<Option<(mpsc::Receiver<IoEvent>, mpsc::Receiver<Control>)>>,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Mesh {
    /// Create a node with a fresh random identity.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_id(PeerId::new_v4(), config)
    }

    /// Create a node with a fixed identity.
    pub fn with_id(local_id: PeerId, config: Config) -> Arc<Self> {
        let (io_tx, io_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let transport = Arc::new(TcpIo::new(local_id, config.clone(), io_tx));
        Self::with_transport(local_id, config, transport, io_rx)
    }

    pub(crate) fn with_transport(
        local_id: PeerId,
        config: Config,
        transport: Arc<dyn Transport>,
        io_rx: mpsc::Receiver<IoEvent>,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        Arc::new(Self {
            local_id,
            port: AtomicU16::new(config.port),
            config,
            transport,
            peers: RwLock::new(HashMap::new()),
            listeners: Listeners::new(),
            introduced: StdMutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            control_tx,
            rx_slots: StdMutex::new(Some((io_rx, control_rx))),
            loop_handle: tokio::sync::Mutex::new(None),
        })
    }

    // -- identity and lifecycle -------------------------------------------

    pub fn id(&self) -> PeerId {
        self.local_id
    }

    /// The listening port (the actually bound one once running).
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// Change the listening port. Only allowed while stopped.
    pub fn set_port(&self, port: u16) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("cannot change the port while running"));
        }
        self.port.store(port, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start accepting connections and spawn the event loop.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("already running"));
        }
        if let Err(e) = self.bind_and_launch().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Like [`run`](Self::run), but blocks until the mesh shuts down.
    pub async fn sync_run(self: &Arc<Self>) -> Result<()> {
        self.run().await?;
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Join an existing mesh through one of its members. On success the
    /// event loop is started; on a failed dial or handshake the node is left
    /// stopped and `Ok(false)` is returned.
    pub async fn connect(self: &Arc<Self>, host: IpAddr, port: u16) -> Result<bool> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("already running"));
        }
        let bound = match self.transport.listen(self.port.load(Ordering::Relaxed)).await {
            Ok(bound) => bound,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.port.store(bound, Ordering::Relaxed);

        match self.transport.dial(host, port).await {
            Ok(true) => {
                if let Err(e) = self.launch().await {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                Ok(true)
            }
            Ok(false) | Err(_) => {
                self.transport.shutdown().await;
                self.running.store(false, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    async fn bind_and_launch(self: &Arc<Self>) -> Result<()> {
        let bound = self.transport.listen(self.port.load(Ordering::Relaxed)).await?;
        self.port.store(bound, Ordering::Relaxed);
        self.launch().await
    }

    async fn launch(self: &Arc<Self>) -> Result<()> {
        let slots = self.rx_slots.lock().unwrap().take();
        let Some((io_rx, mut control_rx)) = slots else {
            return Err(Error::InvalidState("event loop already started"));
        };
        // A previous session may have left a stale shutdown request behind.
        while control_rx.try_recv().is_ok() {}
        let mesh = self.clone();
        let handle = tokio::spawn(async move { mesh.event_loop(io_rx, control_rx).await });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Leave the mesh: announce the departure, close every socket, and join
    /// the event loop. Idempotent.
    pub async fn disconnect(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.control_tx.send(Control::Shutdown).await;
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -- sending -----------------------------------------------------------

    /// Send bytes to one peer, relayed through its bridge if it is not a
    /// direct neighbor. Unknown peers are dropped silently (watch the
    /// connection listeners to track membership). FIFO per destination.
    pub fn send_to(&self, target: PeerId, data: impl Into<Vec<u8>>) {
        self.post(Control::SendTo {
            target,
            data: data.into(),
        });
    }

    /// Send bytes to every peer in the mesh, relayed hop by hop.
    pub fn send_to_all(&self, data: impl Into<Vec<u8>>) {
        self.post(Control::SendToAll { data: data.into() });
    }

    fn post(&self, control: Control) {
        match self.control_tx.try_send(control) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(control)) => {
                let tx = self.control_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(control).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("mesh control channel closed, dropping request");
            }
        }
    }

    // -- observation -------------------------------------------------------

    /// Snapshot of the peer table (self excluded).
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().unwrap().get(id).cloned()
    }

    // -- listeners ---------------------------------------------------------

    pub fn add_connection_listener(
        &self,
        listener: impl Fn(&Peer) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listeners.next_id();
        self.listeners.connection.add(id, Arc::new(listener));
        id
    }

    pub fn add_data_listener(
        &self,
        listener: impl Fn(&Peer, &[u8], bool) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listeners.next_id();
        self.listeners.data.add(id, Arc::new(listener));
        id
    }

    pub fn add_disconnection_listener(
        &self,
        listener: impl Fn(&Peer) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listeners.next_id();
        self.listeners.disconnection.add(id, Arc::new(listener));
        id
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.listeners.connection.remove(id)
    }

    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        self.listeners.data.remove(id)
    }

    pub fn remove_disconnection_listener(&self, id: ListenerId) -> bool {
        self.listeners.disconnection.remove(id)
    }

    pub fn clear_connection_listeners(&self) {
        self.listeners.connection.clear();
    }

    pub fn clear_data_listeners(&self) {
        self.listeners.data.clear();
    }

    pub fn clear_disconnection_listeners(&self) {
        self.listeners.disconnection.clear();
    }

    pub fn clear_all_listeners(&self) {
        self.clear_connection_listeners();
        self.clear_data_listeners();
        self.clear_disconnection_listeners();
    }

    // -- event loop --------------------------------------------------------

    async fn event_loop(
        self: Arc<Self>,
        mut io_rx: mpsc::Receiver<IoEvent>,
        mut control_rx: mpsc::Receiver<Control>,
    ) {
        tracing::debug!("{} event loop started", self.local_id);
        let mut keep_alive = tokio::time::interval(self.config.keep_alive);
        keep_alive.tick().await; // skip the immediate first tick
        let mut timeout_check = tokio::time::interval(self.config.timeout_check);
        timeout_check.tick().await;

        loop {
            let actions = tokio::select! {
                event = io_rx.recv() => match event {
                    Some(event) => self.handle_io(event),
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => {
                        self.shutdown_mesh().await;
                        break;
                    }
                    Some(control) => self.handle_control(control),
                },
                _ = keep_alive.tick() => self.keep_alive_actions(),
                _ = timeout_check.tick() => self.timeout_actions(),
            };
            self.run_actions(actions);
        }

        self.running.store(false, Ordering::SeqCst);
        while control_rx.try_recv().is_ok() {}
        *self.rx_slots.lock().unwrap() = Some((io_rx, control_rx));
        tracing::debug!("{} event loop stopped", self.local_id);
    }

    async fn shutdown_mesh(&self) {
        tracing::info!("{} leaving the mesh", self.local_id);
        let removed: Vec<Peer> = {
            let mut peers = self.peers.write().unwrap();
            let all = peers.values().cloned().collect();
            peers.clear();
            all
        };

        let mut goodbye = Vec::with_capacity(16);
        command::put_id(&mut goodbye, &self.local_id);
        for peer in &removed {
            if peer.is_direct() {
                self.transport.send(Command::PeerDisconnection, &goodbye, peer);
            }
        }
        self.transport.shutdown().await;
        // Let the writers drain the goodbye before the tokens kill them.
        tokio::time::sleep(GOODBYE_GRACE).await;
        for peer in &removed {
            if let Some(link) = peer.link.as_ref() {
                link.cancel.cancel();
            }
        }
        for peer in &removed {
            self.notify_disconnected(peer);
        }
    }

    fn handle_io(&self, event: IoEvent) -> Vec<Action> {
        match event {
            IoEvent::Connected {
                id,
                host,
                port,
                link,
            } => self.on_link_up(id, host, port, link),
            IoEvent::Frame { from, frame } => self.on_frame(from, frame),
            IoEvent::Closed { id, seq } => self.on_link_down(id, seq),
        }
    }

    fn handle_control(&self, control: Control) -> Vec<Action> {
        match control {
            Control::SendTo { target, data } => {
                let mut payload = Vec::with_capacity(16 + data.len());
                command::put_id(&mut payload, &target);
                payload.extend_from_slice(&data);
                self.route_unicast(target, payload)
            }
            Control::SendToAll { data } => {
                let mut payload = Vec::with_capacity(16 + data.len());
                command::put_id(&mut payload, &self.local_id);
                payload.extend_from_slice(&data);
                let peers = self.peers.read().unwrap();
                peers
                    .values()
                    .filter(|p| p.is_direct())
                    .map(|p| Action::Send {
                        to: p.clone(),
                        command: Command::SendToAll,
                        payload: payload.clone(),
                    })
                    .collect()
            }
            Control::DialFailed { requester, target } => {
                let peers = self.peers.read().unwrap();
                match peers.get(&requester) {
                    Some(p) if p.is_direct() => {
                        let mut payload = Vec::with_capacity(16);
                        command::put_id(&mut payload, &target);
                        vec![Action::Send {
                            to: p.clone(),
                            command: Command::CantConnect,
                            payload,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            Control::Shutdown => Vec::new(),
        }
    }

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send {
                    to,
                    command,
                    payload,
                } => {
                    if !self.transport.send(command, &payload, &to) {
                        tracing::debug!(
                            "{} could not queue {:?} for {}",
                            self.local_id,
                            command,
                            to.id()
                        );
                    }
                }
                Action::Deliver {
                    from,
                    data,
                    broadcast,
                } => {
                    for (id, listener) in self.listeners.data.snapshot() {
                        tracing::trace!("calling data listener {}", id);
                        listener(&from, &data, broadcast);
                    }
                }
                Action::Connected(peer) => {
                    for (_, listener) in self.listeners.connection.snapshot() {
                        listener(&peer);
                    }
                }
                Action::Disconnected(peer) => self.notify_disconnected(&peer),
                Action::Cancel(token) => token.cancel(),
                Action::Dial {
                    requester,
                    target,
                    host,
                    port,
                } => {
                    let transport = self.transport.clone();
                    let control = self.control_tx.clone();
                    tokio::spawn(async move {
                        let ok = transport.dial(host, port).await.unwrap_or(false);
                        if !ok {
                            let _ = control.send(Control::DialFailed { requester, target }).await;
                        }
                    });
                }
            }
        }
    }

    fn notify_disconnected(&self, peer: &Peer) {
        for (_, listener) in self.listeners.disconnection.snapshot() {
            listener(peer);
        }
    }

    // -- link lifecycle ----------------------------------------------------

    fn on_link_up(&self, id: PeerId, host: IpAddr, port: u16, link: Link) -> Vec<Action> {
        use std::collections::hash_map::Entry;

        let mut actions = Vec::new();
        let mut peers = self.peers.write().unwrap();

        let mut newly_known = false;
        match peers.entry(id) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if let Some(old) = existing.link.as_ref() {
                    // Crossed simultaneous dials: the surviving socket is the
                    // one dialed by the smaller id.
                    let keep_outbound = self.local_id < id;
                    if link.outbound == keep_outbound && old.outbound != keep_outbound {
                        tracing::debug!("{} replacing duplicate link to {}", self.local_id, id);
                        actions.push(Action::Cancel(old.cancel.clone()));
                        existing.attach_link(host, port, link);
                    } else {
                        tracing::debug!("{} closing duplicate link to {}", self.local_id, id);
                        actions.push(Action::Cancel(link.cancel.clone()));
                    }
                    return actions;
                }
                tracing::info!("{} now directly connected to {}", self.local_id, id);
                existing.attach_link(host, port, link);
            }
            Entry::Vacant(entry) => {
                tracing::info!("{} connected to {} ({}:{})", self.local_id, id, host, port);
                entry.insert(Peer::direct(id, host, port, link));
                newly_known = true;
            }
        }

        let peer = peers.get(&id).cloned();
        let others: Vec<Peer> = peers
            .values()
            .filter(|p| p.is_direct() && p.id() != id)
            .cloned()
            .collect();
        drop(peers);
        let Some(peer) = peer else { return actions };

        // Ask the newcomer for its table, and tell everyone else there is a
        // route to it through us.
        actions.push(Action::Send {
            to: peer.clone(),
            command: Command::RetrievePeers,
            payload: Vec::new(),
        });
        let mut announce = Vec::with_capacity(17);
        command::put_id(&mut announce, &id);
        announce.push(0);
        for other in others {
            actions.push(Action::Send {
                to: other,
                command: Command::ForwardingTo,
                payload: announce.clone(),
            });
        }
        if newly_known {
            actions.push(Action::Connected(peer));
        }
        actions
    }

    fn on_link_down(&self, id: PeerId, seq: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut peers = self.peers.write().unwrap();

        let current = peers
            .get(&id)
            .and_then(|p| p.link.as_ref())
            .map(|l| l.seq == seq)
            .unwrap_or(false);
        if !current {
            // A socket we already replaced or forgot about.
            return actions;
        }
        let Some(lost) = peers.remove(&id) else {
            return actions;
        };

        let stranded: Vec<PeerId> = peers
            .values()
            .filter(|p| p.bridge() == Some(id))
            .map(|p| p.id())
            .collect();
        let mut dropped = Vec::with_capacity(stranded.len());
        for sid in &stranded {
            if let Some(peer) = peers.remove(sid) {
                dropped.push(peer);
            }
        }
        let neighbors: Vec<Peer> = peers.values().filter(|p| p.is_direct()).cloned().collect();
        drop(peers);

        tracing::info!(
            "{} lost direct peer {} ({} stranded)",
            self.local_id,
            id,
            dropped.len()
        );
        if let Some(link) = lost.link.as_ref() {
            actions.push(Action::Cancel(link.cancel.clone()));
        }
        for gone in std::iter::once(&lost).chain(dropped.iter()) {
            let mut payload = Vec::with_capacity(16);
            command::put_id(&mut payload, &gone.id());
            for neighbor in &neighbors {
                actions.push(Action::Send {
                    to: neighbor.clone(),
                    command: Command::StopForwarding,
                    payload: payload.clone(),
                });
            }
        }
        actions.push(Action::Disconnected(lost));
        for peer in dropped {
            actions.push(Action::Disconnected(peer));
        }
        actions
    }

    // -- frame dispatch ----------------------------------------------------

    fn on_frame(&self, from: PeerId, frame: Frame) -> Vec<Action> {
        let source = {
            let mut peers = self.peers.write().unwrap();
            let Some(peer) = peers.get_mut(&from) else {
                tracing::debug!("frame from unknown peer {}, ignoring", from);
                return Vec::new();
            };
            if let Some(link) = peer.link.as_mut() {
                link.last_seen = Instant::now();
            }
            peer.clone()
        };

        let payload = frame.payload;
        match frame.command {
            Command::SendTo | Command::ForwardTo => self.on_unicast(&source, &payload),
            Command::SendToAll => self.on_broadcast(&source, &payload),
            Command::StopForwarding => self.on_stop_forwarding(&source, &payload),
            Command::ForwardingTo => self.on_forwarding_to(&source, &payload),
            Command::ConnectTo => self.on_connect_to(&source, &payload),
            Command::CantConnect => self.on_cant_connect(&source, &payload),
            Command::UpdateDistance => self.on_update_distance(&source, &payload),
            Command::RetrieveDistance => {
                // The asker is on the other end of a socket of ours.
                vec![Action::Send {
                    to: source,
                    command: Command::UpdateDistance,
                    payload: vec![0],
                }]
            }
            Command::RetrievePeers => self.on_retrieve_peers(&source),
            Command::PeersList => self.on_peers_list(&source, &payload),
            Command::PeerDisconnection => self.on_peer_disconnection(&source, &payload),
            Command::KeepAlive => {
                tracing::trace!("keep-alive from {}", from);
                Vec::new()
            }
            Command::NullCommand => {
                tracing::warn!("sentinel command from {}", from);
                Vec::new()
            }
        }
    }

    /// A malformed payload poisons the link.
    fn poison(&self, source: &Peer) -> Vec<Action> {
        tracing::warn!("{} sent a malformed payload, closing", source.id());
        source
            .link
            .as_ref()
            .map(|l| Action::Cancel(l.cancel.clone()))
            .into_iter()
            .collect()
    }

    // -- user traffic ------------------------------------------------------

    fn on_unicast(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(dest) = r.read_id() else {
            return self.poison(source);
        };
        if dest == self.local_id {
            return vec![Action::Deliver {
                from: source.clone(),
                data: r.rest().to_vec(),
                broadcast: false,
            }];
        }
        // Not ours: pass the frame along unchanged.
        self.route_unicast(dest, payload.to_vec())
    }

    fn route_unicast(&self, dest: PeerId, payload: Vec<u8>) -> Vec<Action> {
        let peers = self.peers.read().unwrap();
        let Some(peer) = peers.get(&dest) else {
            tracing::debug!("{} dropping message for unknown peer {}", self.local_id, dest);
            return Vec::new();
        };
        if peer.is_direct() {
            return vec![Action::Send {
                to: peer.clone(),
                command: Command::SendTo,
                payload,
            }];
        }
        match peer.bridge().and_then(|b| peers.get(&b)) {
            Some(bridge) if bridge.is_direct() => vec![Action::Send {
                to: bridge.clone(),
                command: Command::SendTo,
                payload,
            }],
            _ => {
                tracing::warn!("{} has no route to {}", self.local_id, dest);
                Vec::new()
            }
        }
    }

    fn on_broadcast(&self, arrived_from: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(origin) = r.read_id() else {
            return self.poison(arrived_from);
        };
        if origin == self.local_id {
            return Vec::new();
        }

        let peers = self.peers.read().unwrap();
        // Accept a broadcast only over the edge we would use to reach its
        // origin; duplicates arriving over the other edges of a cycle are
        // dropped before delivery or re-broadcast.
        let origin_peer = peers.get(&origin);
        let on_route = match origin_peer {
            Some(p) if p.is_direct() => p.id() == arrived_from.id(),
            Some(p) => p.bridge() == Some(arrived_from.id()),
            None => true,
        };
        if !on_route {
            tracing::trace!(
                "{} dropping off-route broadcast of {} via {}",
                self.local_id,
                origin,
                arrived_from.id()
            );
            return Vec::new();
        }

        let mut actions = Vec::new();
        match origin_peer {
            Some(origin_peer) => actions.push(Action::Deliver {
                from: origin_peer.clone(),
                data: r.rest().to_vec(),
                broadcast: true,
            }),
            None => tracing::debug!(
                "{} got a broadcast from unknown origin {}, not delivering",
                self.local_id,
                origin
            ),
        }
        for peer in peers.values() {
            if peer.is_direct() && peer.id() != origin && peer.id() != arrived_from.id() {
                actions.push(Action::Send {
                    to: peer.clone(),
                    command: Command::SendToAll,
                    payload: payload.to_vec(),
                });
            }
        }
        actions
    }

    // -- membership --------------------------------------------------------

    fn on_stop_forwarding(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(target) = r.read_id() else {
            return self.poison(source);
        };
        let mut peers = self.peers.write().unwrap();
        let reachable_elsewhere = match peers.get(&target) {
            None => return Vec::new(),
            Some(p) if p.is_direct() => true,
            Some(p) => p.bridge() != Some(source.id()),
        };
        if reachable_elsewhere {
            return Vec::new();
        }
        let Some(dropped) = peers.remove(&target) else {
            return Vec::new();
        };
        let neighbors: Vec<Peer> = peers
            .values()
            .filter(|p| p.is_direct() && p.id() != source.id())
            .cloned()
            .collect();
        drop(peers);

        tracing::info!("{} lost its route to {}", self.local_id, target);
        let mut actions = Vec::new();
        for neighbor in neighbors {
            actions.push(Action::Send {
                to: neighbor,
                command: Command::StopForwarding,
                payload: payload.to_vec(),
            });
        }
        actions.push(Action::Disconnected(dropped));
        actions
    }

    fn on_forwarding_to(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(target) = r.read_id() else {
            return self.poison(source);
        };
        let Ok(distance) = r.read_u8() else {
            return self.poison(source);
        };
        if target == self.local_id {
            return Vec::new();
        }
        let hops = distance.saturating_add(1);

        let mut peers = self.peers.write().unwrap();
        match peers.entry(target) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                if !peer.is_direct() && hops < peer.distance() {
                    peer.set_route(source.id(), hops);
                }
                Vec::new()
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let peer = entry.insert(Peer::unlocated(target, source.id(), hops)).clone();
                let neighbors: Vec<Peer> = peers
                    .values()
                    .filter(|p| p.is_direct() && p.id() != source.id())
                    .cloned()
                    .collect();
                drop(peers);
                tracing::info!(
                    "{} learned of peer {} through {}",
                    self.local_id,
                    target,
                    source.id()
                );
                // First knowledge: pass the announcement on so membership
                // floods the whole mesh. Repeats stop at already-known peers.
                let mut actions = Vec::new();
                let mut announce = Vec::with_capacity(17);
                command::put_id(&mut announce, &target);
                announce.push(hops);
                for neighbor in neighbors {
                    actions.push(Action::Send {
                        to: neighbor,
                        command: Command::ForwardingTo,
                        payload: announce.clone(),
                    });
                }
                actions.push(Action::Connected(peer));
                actions
            }
        }
    }

    fn on_connect_to(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(target) = r.read_id() else {
            return self.poison(source);
        };
        let Ok(host) = r.read_ip() else {
            return self.poison(source);
        };
        let Ok(port) = r.read_port() else {
            return self.poison(source);
        };
        if target == self.local_id {
            return Vec::new();
        }
        {
            let peers = self.peers.read().unwrap();
            if peers.get(&target).map(|p| p.is_direct()).unwrap_or(false) {
                return Vec::new();
            }
        }
        if !self.config.auto_connect {
            let mut payload = Vec::with_capacity(16);
            command::put_id(&mut payload, &target);
            return vec![Action::Send {
                to: source.clone(),
                command: Command::CantConnect,
                payload,
            }];
        }
        vec![Action::Dial {
            requester: source.id(),
            target,
            host,
            port,
        }]
    }

    fn on_cant_connect(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(target) = r.read_id() else {
            return self.poison(source);
        };
        let peers = self.peers.read().unwrap();
        let Some(target_peer) = peers.get(&target) else {
            return Vec::new();
        };

        // We know both sides; stand in as their forwarder.
        let mut actions = Vec::new();
        let mut to_source = Vec::with_capacity(17);
        command::put_id(&mut to_source, &target);
        to_source.push(target_peer.distance());
        actions.push(Action::Send {
            to: source.clone(),
            command: Command::ForwardingTo,
            payload: to_source,
        });

        if target_peer.is_direct() {
            let mut to_target = Vec::with_capacity(17);
            command::put_id(&mut to_target, &source.id());
            to_target.push(0);
            actions.push(Action::Send {
                to: target_peer.clone(),
                command: Command::ForwardingTo,
                payload: to_target,
            });

            // The dial failed one way; maybe the other direction works.
            // One reverse introduction per pair, or the two would bounce
            // dial requests forever.
            if self.config.auto_connect && source.has_endpoint() {
                let mut introduced = self.introduced.lock().unwrap();
                if introduced.insert(pair_key(source.id(), target)) {
                    let mut request = Vec::with_capacity(34);
                    command::put_id(&mut request, &source.id());
                    command::put_ip(&mut request, &source.host());
                    command::put_port(&mut request, source.port());
                    actions.push(Action::Send {
                        to: target_peer.clone(),
                        command: Command::ConnectTo,
                        payload: request,
                    });
                }
            }
        }
        actions
    }

    fn on_update_distance(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(distance) = r.read_u8() else {
            return self.poison(source);
        };
        let mut peers = self.peers.write().unwrap();
        if let Some(peer) = peers.get_mut(&source.id()) {
            if peer.is_direct() {
                // Direct neighbors are distance 0 by definition.
                tracing::trace!("distance update from direct peer {}", source.id());
            } else {
                peer.set_distance(distance);
            }
        }
        Vec::new()
    }

    fn on_retrieve_peers(&self, source: &Peer) -> Vec<Action> {
        let peers = self.peers.read().unwrap();
        let mut payload = Vec::new();
        for peer in peers.values() {
            if peer.id() == source.id() || peer.distance() == DISTANCE_UNKNOWN {
                continue;
            }
            command::put_id(&mut payload, &peer.id());
            command::put_ip(&mut payload, &peer.host());
            command::put_port(&mut payload, peer.port());
            payload.push(peer.distance());
        }
        vec![Action::Send {
            to: source.clone(),
            command: Command::PeersList,
            payload,
        }]
    }

    fn on_peers_list(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let mut entries = Vec::new();
        while !r.is_empty() {
            let (Ok(id), Ok(host), Ok(port), Ok(distance)) =
                (r.read_id(), r.read_ip(), r.read_port(), r.read_u8())
            else {
                return self.poison(source);
            };
            entries.push((id, host, port, distance));
        }

        let mut fresh = Vec::new();
        let mut dials = Vec::new();
        let neighbors: Vec<Peer>;
        {
            let mut peers = self.peers.write().unwrap();
            for (id, host, port, distance) in entries {
                if id == self.local_id {
                    continue;
                }
                let hops = distance.saturating_add(1);
                match peers.entry(id) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let peer = entry.get_mut();
                        if peer.is_direct() {
                            continue;
                        }
                        if hops < peer.distance() {
                            peer.set_route(source.id(), hops);
                        }
                        if !peer.has_endpoint() {
                            peer.set_endpoint(host, port);
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let peer = entry
                            .insert(Peer::indirect(id, host, port, source.id(), hops))
                            .clone();
                        if self.config.auto_connect && peer.has_endpoint() {
                            dials.push((id, host, port));
                        }
                        fresh.push(peer);
                    }
                }
            }
            neighbors = peers
                .values()
                .filter(|p| p.is_direct() && p.id() != source.id())
                .cloned()
                .collect();
        }

        let mut actions = Vec::new();
        for peer in fresh {
            tracing::info!(
                "{} learned of peer {} from {}'s table",
                self.local_id,
                peer.id(),
                source.id()
            );
            // Announce first-seen peers onward so the whole mesh hears.
            let mut announce = Vec::with_capacity(17);
            command::put_id(&mut announce, &peer.id());
            announce.push(peer.distance());
            for neighbor in &neighbors {
                actions.push(Action::Send {
                    to: neighbor.clone(),
                    command: Command::ForwardingTo,
                    payload: announce.clone(),
                });
            }
            actions.push(Action::Connected(peer));
        }
        for (target, host, port) in dials {
            actions.push(Action::Dial {
                requester: source.id(),
                target,
                host,
                port,
            });
        }
        actions
    }

    fn on_peer_disconnection(&self, source: &Peer, payload: &[u8]) -> Vec<Action> {
        let mut r = PayloadReader::new(payload);
        let Ok(id) = r.read_id() else {
            return self.poison(source);
        };
        if id == self.local_id {
            return Vec::new();
        }
        let mut peers = self.peers.write().unwrap();
        let Some(peer) = peers.get(&id) else {
            return Vec::new();
        };
        if peer.is_direct() {
            if id == source.id() {
                // Graceful leave: drop the socket, the close event cleans up.
                tracing::info!("{} announced its departure", id);
                return peer
                    .link
                    .as_ref()
                    .map(|l| Action::Cancel(l.cancel.clone()))
                    .into_iter()
                    .collect();
            }
            // Someone else thinks our neighbor left; our socket knows better.
            return Vec::new();
        }
        let Some(dropped) = peers.remove(&id) else {
            return Vec::new();
        };
        drop(peers);
        tracing::info!("{} was announced as disconnected", id);
        vec![Action::Disconnected(dropped)]
    }

    // -- timers ------------------------------------------------------------

    fn keep_alive_actions(&self) -> Vec<Action> {
        let peers = self.peers.read().unwrap();
        peers
            .values()
            .filter(|p| p.is_direct())
            .map(|p| Action::Send {
                to: p.clone(),
                command: Command::KeepAlive,
                payload: Vec::new(),
            })
            .collect()
    }

    fn timeout_actions(&self) -> Vec<Action> {
        let now = Instant::now();
        let peers = self.peers.read().unwrap();
        let mut actions = Vec::new();
        for peer in peers.values() {
            if let Some(link) = peer.link.as_ref() {
                if now.duration_since(link.last_seen) > self.config.timeout {
                    tracing::info!("{} timing out silent peer {}", self.local_id, peer.id());
                    actions.push(Action::Cancel(link.cancel.clone()));
                }
            }
        }
        actions
    }
}

fn pair_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
