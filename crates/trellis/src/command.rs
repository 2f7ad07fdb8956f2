//! Command codes and payload layout helpers.
//!
//! Every frame on the wire is `command(u8) | escaped-length | payload`.
//! Command codes are dense and stable; `NullCommand` is a sentinel that
//! must never appear on the wire.

use std::net::{IpAddr, Ipv6Addr};

use crate::types::{Error, PeerId, Result};

// ---------------------------------------------------------------------------
// Command codes
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `dest-id(16) | user bytes`: unicast, relayed hop by hop.
    SendTo = 0,
    /// `source-id(16) | user bytes`: broadcast, flooded with origin tagging.
    SendToAll = 1,
    /// `dest-id(16) | user bytes`: relay envelope, handled like `SendTo`.
    ForwardTo = 2,
    /// `target-id(16)`: the sender no longer forwards traffic for target.
    StopForwarding = 3,
    /// `target-id(16) | distance(1)`: the sender offers a route to target.
    ForwardingTo = 4,
    /// `target-id(16) | ip(16) | port(2 BE)`: request to dial target.
    ConnectTo = 5,
    /// `target-id(16)`: the sender failed to dial target.
    CantConnect = 6,
    /// `distance(1)`: distance refresh for the sending peer.
    UpdateDistance = 7,
    /// empty: ask the sender's distance back.
    RetrieveDistance = 8,
    /// empty: ask for the sender's peer table.
    RetrievePeers = 9,
    /// repeated `{id(16), ip(16), port(2 BE), distance(1)}`.
    PeersList = 10,
    /// `id(16)`: graceful-leave announcement.
    PeerDisconnection = 11,
    /// empty: refreshes the liveness timestamp.
    KeepAlive = 12,
    /// Sentinel; never sent.
    NullCommand = 13,
}

impl TryFrom<u8> for Command {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::SendTo),
            1 => Ok(Self::SendToAll),
            2 => Ok(Self::ForwardTo),
            3 => Ok(Self::StopForwarding),
            4 => Ok(Self::ForwardingTo),
            5 => Ok(Self::ConnectTo),
            6 => Ok(Self::CantConnect),
            7 => Ok(Self::UpdateDistance),
            8 => Ok(Self::RetrieveDistance),
            9 => Ok(Self::RetrievePeers),
            10 => Ok(Self::PeersList),
            11 => Ok(Self::PeerDisconnection),
            12 => Ok(Self::KeepAlive),
            13 => Ok(Self::NullCommand),
            _ => Err(Error::Decode),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload encoding helpers
// ---------------------------------------------------------------------------

/// Append the 16 raw bytes of a peer id.
pub fn put_id(out: &mut Vec<u8>, id: &PeerId) {
    out.extend_from_slice(id.as_bytes());
}

/// Append an address as 16 bytes (IPv4 addresses are v6-mapped).
pub fn put_ip(out: &mut Vec<u8>, ip: &IpAddr) {
    let v6 = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    };
    out.extend_from_slice(&v6.octets());
}

/// Append a port as two big-endian bytes.
pub fn put_port(out: &mut Vec<u8>, port: u16) {
    out.extend_from_slice(&port.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Payload decoding cursor
// ---------------------------------------------------------------------------

/// A cursor for decoding command payloads.
pub struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the remaining bytes.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [b] = self.read_fixed::<1>()?;
        Ok(b)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.data.len() < N {
            return Err(Error::Decode);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[..N]);
        self.data = &self.data[N..];
        Ok(out)
    }

    pub fn read_id(&mut self) -> Result<PeerId> {
        Ok(PeerId::from_bytes(self.read_fixed::<16>()?))
    }

    /// Read a 16-byte address, unmapping v6-mapped IPv4.
    pub fn read_ip(&mut self) -> Result<IpAddr> {
        let v6 = Ipv6Addr::from(self.read_fixed::<16>()?);
        Ok(v6.to_canonical())
    }

    pub fn read_port(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_fixed::<2>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn codes_are_dense_and_stable() {
        for v in 0u8..=13 {
            let cmd = Command::try_from(v).unwrap();
            assert_eq!(cmd as u8, v);
        }
        assert!(Command::try_from(14).is_err());
        assert!(Command::try_from(0xFF).is_err());
    }

    #[test]
    fn ip_round_trips_v4_as_mapped() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
        let mut out = Vec::new();
        put_ip(&mut out, &ip);
        assert_eq!(out.len(), 16);
        let mut r = PayloadReader::new(&out);
        assert_eq!(r.read_ip().unwrap(), ip);
    }

    #[test]
    fn id_and_port_round_trip() {
        let id = PeerId::new_v4();
        let mut out = Vec::new();
        put_id(&mut out, &id);
        put_port(&mut out, 3479);
        let mut r = PayloadReader::new(&out);
        assert_eq!(r.read_id().unwrap(), id);
        assert_eq!(r.read_port().unwrap(), 3479);
        assert!(r.is_empty());
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut r = PayloadReader::new(&[0u8; 15]);
        assert!(r.read_id().is_err());
    }
}
