//! End-to-end tests: real nodes over loopback TCP.
//!
//! Topologies are built through the public API only (`run` one seed node,
//! `connect` the others), and assertions poll the peer tables until they
//! converge or a deadline passes.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use trellis::link::{handshake_packet, HANDSHAKE_LEN};
use trellis::{Config, Mesh, PeerId};

const LOCALHOST: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

/// Fast timers so tests converge quickly without spurious timeouts.
fn test_config() -> Config {
    Config::default()
        .with_port(0)
        .with_keep_alive(Duration::from_millis(200))
        .with_timeout(Duration::from_secs(10))
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn knows_directly(mesh: &Mesh, id: PeerId) -> bool {
    mesh.peer(&id).map(|p| p.is_direct()).unwrap_or(false)
}

fn knows(mesh: &Mesh, id: PeerId) -> bool {
    mesh.peer(&id)
        .map(|p| p.distance() != trellis::DISTANCE_UNKNOWN)
        .unwrap_or(false)
}

#[tokio::test]
async fn two_peer_handshake() {
    let a = Mesh::new(test_config());
    let b = Mesh::new(test_config());

    let a_connections = Arc::new(AtomicUsize::new(0));
    let b_connections = Arc::new(AtomicUsize::new(0));
    let count = a_connections.clone();
    a.add_connection_listener(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let count = b_connections.clone();
    b.add_connection_listener(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());

    wait_for("mutual direct records", || {
        knows_directly(&a, b.id()) && knows_directly(&b, a.id())
    })
    .await;

    let a_view = a.peer(&b.id()).unwrap();
    assert_eq!(a_view.distance(), 0);
    assert_eq!(a_view.port(), b.port(), "declared listen port recorded");
    let b_view = b.peer(&a.id()).unwrap();
    assert_eq!(b_view.distance(), 0);
    assert_eq!(b_view.port(), a.port());

    // Exactly one connection event on each side.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a_connections.load(Ordering::SeqCst), 1);
    assert_eq!(b_connections.load(Ordering::SeqCst), 1);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn connect_to_dead_endpoint_returns_false() {
    let a = Mesh::new(test_config());
    // Nobody listens on the reserved discard port.
    let joined = a.connect(LOCALHOST, 9).await.unwrap();
    assert!(!joined);
    assert!(!a.is_running());

    // The node is still usable afterwards.
    a.set_port(0).unwrap();
    a.run().await.unwrap();
    a.disconnect().await;
}

#[tokio::test]
async fn connect_while_running_is_an_invalid_state() {
    let a = Mesh::new(test_config());
    let b = Mesh::new(test_config());
    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    assert!(b.connect(LOCALHOST, a.port()).await.is_err());

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn relayed_unicast_through_a_forwarder() {
    // A - B - C chain; the ends never dial each other.
    let config = || test_config().with_auto_connect(false);
    let a = Mesh::new(config());
    let b = Mesh::new(config());
    let c = Mesh::new(config());

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    assert!(c.connect(LOCALHOST, b.port()).await.unwrap());

    wait_for("gossip to reach the chain ends", || {
        knows(&a, c.id()) && knows(&c, a.id())
    })
    .await;

    let a_view = a.peer(&c.id()).unwrap();
    assert!(!a_view.is_direct());
    assert_eq!(a_view.bridge(), Some(b.id()));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    c.add_data_listener(move |from, data, to_all| {
        sink.lock().unwrap().push((from.id(), data.to_vec(), to_all));
    });

    a.send_to(c.id(), vec![0x01, 0x02]);

    wait_for("payload to arrive at C", || !received.lock().unwrap().is_empty()).await;
    let got = received.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    // The wire carries no origin for unicasts: the source is the last hop.
    assert_eq!(got[0], (b.id(), vec![0x01, 0x02], false));

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn broadcast_on_a_triangle_delivers_exactly_once() {
    // Full triangle: C joins through A and upgrades its route to B into a
    // direct link on its own.
    let a = Mesh::new(test_config());
    let b = Mesh::new(test_config());
    let c = Mesh::new(test_config());

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    assert!(c.connect(LOCALHOST, a.port()).await.unwrap());

    wait_for("triangle to close", || {
        knows_directly(&a, b.id())
            && knows_directly(&a, c.id())
            && knows_directly(&b, c.id())
            && knows_directly(&c, b.id())
    })
    .await;

    let deliveries = |mesh: &Mesh| {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        mesh.add_data_listener(move |_, data, to_all| {
            assert_eq!(data, [0xFF]);
            assert!(to_all);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        count
    };
    let at_a = deliveries(&a);
    let at_b = deliveries(&b);
    let at_c = deliveries(&c);

    a.send_to_all(vec![0xFF]);

    wait_for("broadcast to reach B and C", || {
        at_b.load(Ordering::SeqCst) >= 1 && at_c.load(Ordering::SeqCst) >= 1
    })
    .await;
    // Let any stray duplicates arrive before counting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(at_b.load(Ordering::SeqCst), 1);
    assert_eq!(at_c.load(Ordering::SeqCst), 1);
    assert_eq!(at_a.load(Ordering::SeqCst), 0, "no echo to the origin");

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn broadcast_reaches_the_far_end_of_a_chain() {
    let config = || test_config().with_auto_connect(false);
    let a = Mesh::new(config());
    let b = Mesh::new(config());
    let c = Mesh::new(config());

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    assert!(c.connect(LOCALHOST, b.port()).await.unwrap());
    wait_for("chain gossip", || knows(&a, c.id()) && knows(&c, a.id())).await;

    let count = Arc::new(AtomicUsize::new(0));
    let sources = Arc::new(Mutex::new(Vec::new()));
    let counter = count.clone();
    let sink = sources.clone();
    c.add_data_listener(move |from, data, to_all| {
        assert_eq!(data, [0x42]);
        assert!(to_all);
        sink.lock().unwrap().push(from.id());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    a.send_to_all(vec![0x42]);
    wait_for("broadcast to cross the chain", || count.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // Broadcasts carry their origin; C attributes the message to A.
    assert_eq!(sources.lock().unwrap().as_slice(), &[a.id()]);

    a.disconnect().await;
    b.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn losing_the_bridge_drops_everything_behind_it() {
    let config = || test_config().with_auto_connect(false);
    let a = Mesh::new(config());
    let b = Mesh::new(config());
    let c = Mesh::new(config());

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    assert!(c.connect(LOCALHOST, b.port()).await.unwrap());
    wait_for("chain gossip", || knows(&a, c.id())).await;

    let gone = Arc::new(Mutex::new(Vec::new()));
    let sink = gone.clone();
    a.add_disconnection_listener(move |peer| {
        sink.lock().unwrap().push(peer.id());
    });

    b.disconnect().await;

    wait_for("A to drop B and C", || a.peers().is_empty()).await;
    let gone = gone.lock().unwrap().clone();
    assert!(gone.contains(&b.id()), "bridge loss surfaced");
    assert!(gone.contains(&c.id()), "stranded peer surfaced");

    a.disconnect().await;
    c.disconnect().await;
}

#[tokio::test]
async fn duplicate_handshake_closes_the_new_socket() {
    let a = Mesh::new(test_config());
    let b = Mesh::new(test_config());
    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    wait_for("initial link", || knows_directly(&a, b.id())).await;

    // A second inbound socket claiming B's identity.
    let mut raw = TcpStream::connect((LOCALHOST, a.port())).await.unwrap();
    raw.write_all(&handshake_packet(&b.id(), b.port()))
        .await
        .unwrap();
    let mut their_packet = [0u8; HANDSHAKE_LEN];
    raw.read_exact(&mut their_packet).await.unwrap();

    // The duplicate is rejected: the socket dies without ever carrying a frame.
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
        .await
        .expect("duplicate socket should be closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected EOF on the duplicate socket");

    // And the first link survived untouched.
    assert!(knows_directly(&a, b.id()));
    assert_eq!(a.peers().len(), 1);

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn keep_alives_prevent_idle_timeouts() {
    let config = || {
        Config::default()
            .with_port(0)
            .with_keep_alive(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(500))
    };
    let a = Mesh::new(config());
    let b = Mesh::new(config());

    a.run().await.unwrap();
    assert!(b.connect(LOCALHOST, a.port()).await.unwrap());
    wait_for("link", || knows_directly(&a, b.id()) && knows_directly(&b, a.id())).await;

    // Nothing but keep-alives for several timeout periods.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(knows_directly(&a, b.id()), "A kept B alive");
    assert!(knows_directly(&b, a.id()), "B kept A alive");

    a.disconnect().await;
    b.disconnect().await;
}

#[tokio::test]
async fn a_silent_peer_times_out() {
    let a = Mesh::new(
        Config::default()
            .with_port(0)
            .with_keep_alive(Duration::from_millis(100))
            .with_timeout(Duration::from_millis(400)),
    );
    a.run().await.unwrap();

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = dropped.clone();
    a.add_disconnection_listener(move |peer| {
        sink.lock().unwrap().push(peer.id());
    });

    // Handshake, then go completely silent.
    let ghost = PeerId::new_v4();
    let mut raw = TcpStream::connect((LOCALHOST, a.port())).await.unwrap();
    raw.write_all(&handshake_packet(&ghost, 1)).await.unwrap();
    let mut their_packet = [0u8; HANDSHAKE_LEN];
    raw.read_exact(&mut their_packet).await.unwrap();

    wait_for("ghost to be admitted", || knows_directly(&a, ghost)).await;
    wait_for("ghost to be timed out", || a.peer(&ghost).is_none()).await;
    assert!(dropped.lock().unwrap().contains(&ghost));

    a.disconnect().await;
}

#[tokio::test]
async fn four_node_chain_converges() {
    let config = || test_config().with_auto_connect(false);
    let nodes: Vec<Arc<Mesh>> = (0..4).map(|_| Mesh::new(config())).collect();

    nodes[0].run().await.unwrap();
    for i in 1..nodes.len() {
        let previous_port = nodes[i - 1].port();
        assert!(nodes[i].connect(LOCALHOST, previous_port).await.unwrap());
    }

    wait_for("every table to hold every other peer", || {
        nodes.iter().all(|node| {
            nodes
                .iter()
                .filter(|other| other.id() != node.id())
                .all(|other| knows(node, other.id()))
        })
    })
    .await;

    // Distance counts intermediate forwarders, so the chain ends see each
    // other two forwarders apart; no table ever gained a direct link that
    // was not dialed explicitly.
    let first = &nodes[0];
    let last = &nodes[nodes.len() - 1];
    assert_eq!(first.peer(&last.id()).unwrap().distance(), 2);
    assert_eq!(last.peer(&first.id()).unwrap().distance(), 2);
    assert_eq!(
        first.peers().iter().filter(|p| p.is_direct()).count(),
        1,
        "chain ends have a single neighbor"
    );

    // And a unicast still crosses the whole chain.
    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    last.add_data_listener(move |_, data, to_all| {
        assert_eq!(data, [7]);
        assert!(!to_all);
        counter.fetch_add(1, Ordering::SeqCst);
    });
    first.send_to(last.id(), vec![7]);
    wait_for("unicast across three hops", || received.load(Ordering::SeqCst) == 1).await;

    for node in &nodes {
        node.disconnect().await;
    }
}
