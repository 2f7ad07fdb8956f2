//! Peer-to-peer overlay mesh.
//!
//! Every participant runs an identical [`Mesh`] node: it listens on a TCP
//! port, keeps direct sockets to the neighbors it could reach, and learns
//! the rest of the mesh through gossip. Bytes can be sent to any peer with
//! [`Mesh::send_to`], which relays through a forwarding neighbor when no
//! direct link exists, or to everyone at once with [`Mesh::send_to_all`].
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use trellis::{Config, Mesh};
//!
//! # async fn example() -> trellis::Result<()> {
//! let node = Mesh::new(Config::default().with_port(0));
//! node.add_data_listener(|from, data, to_all| {
//!     println!("{} sent {} bytes (broadcast: {})", from.id(), data.len(), to_all);
//! });
//! node.connect(IpAddr::V4(Ipv4Addr::LOCALHOST), 3479).await?;
//! node.send_to_all(b"hello".to_vec());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod link;
pub mod listeners;
pub mod mesh;
pub mod peer;
pub mod types;

pub use crate::command::Command;
pub use crate::config::Config;
pub use crate::link::Transport;
pub use crate::listeners::ListenerId;
pub use crate::mesh::Mesh;
pub use crate::peer::{Peer, DISTANCE_UNKNOWN};
pub use crate::types::{Error, PeerId, Result};
