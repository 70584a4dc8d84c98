//! Wire actor: the per-peer TCP+UDP socket pair and the admission state
//! machine that precedes it (spec §4.5).
//!
//! `PendingWire` is the self-owning wire of `Accepting..Decide`: it exists
//! only in the host's handshake table, is driven one readiness event at a
//! time by the host's reactor loop, and is either promoted into a
//! `ClientWire` (moved into the roster) or dropped. `ClientWire` is the
//! steady-state `Live` actor; it holds no handshake state at all, matching
//! the source's split between `Wire::Init`/`CinfoReadHeader`/`CinfoReadBody`
//! (handshake) and the post-`HinfoWrite` steady state.
pub mod tcp;
pub mod udp;

use std::{
    io,
    net::{SocketAddr, TcpStream as StdTcpStream},
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::{
    buffer::ByteBuffer,
    codec::Side,
    message::{Builder, DecodeMessage, Inbound, PeerId},
};
use hcnet_utils::ArrayStr;
use tcp::{TcpHalf, TcpReadOutcome};
use udp::UdpHalf;

/// Opens a UDP socket bound to the same local 4-tuple `tcp` is using and
/// connects it to `tcp`'s peer, per spec §4.5/§9 "UDP same-endpoint trick".
/// `SO_REUSEADDR`/`SO_REUSEPORT` must be set before bind since the TCP
/// socket is already holding that local address.
pub fn open_bind_connect_udp(
    local: SocketAddr,
    remote: SocketAddr,
) -> io::Result<mio::net::UdpSocket> {
    let domain = if local.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&remote.into())?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}

/// A wire mid-handshake: TCP registered and readable, UDP already paired
/// but otherwise idle until promotion.
pub struct PendingWire {
    pub tcp: TcpHalf,
    pub udp: UdpHalf,
}

pub enum PendingOutcome {
    /// No complete client-info frame yet; keep waiting for readiness.
    Pending,
    /// Client-info message fully decoded (spec `AwaitCinfoHeader` →
    /// `AwaitCinfoBody`, collapsed since `TcpHalf` already assembles whole
    /// frames). Carries the raw payload bytes too, so the host can
    /// re-broadcast the client-info frame verbatim on admission.
    Cinfo { msg_type: i16, message: Box<dyn DecodeMessage>, raw: std::sync::Arc<[u8]> },
    /// Read error, disconnect, or a header-only/malformed client-info frame
    /// — any of these abort the handshake (`Accepting`/`AwaitCinfo* → Dead`).
    Dead,
}

impl PendingWire {
    pub fn new(tcp: StdTcpStream, local: SocketAddr, remote: SocketAddr) -> io::Result<Self> {
        let tcp = mio::net::TcpStream::from_std(tcp);
        let tcp = TcpHalf::new(tcp, Side::Host)?;
        let udp = open_bind_connect_udp(local, remote)?;
        let udp = UdpHalf::new(udp, Side::Host);
        Ok(Self { tcp, udp })
    }

    /// Drives the TCP read side once for this readiness event. The host
    /// only ever expects one client-info frame here, so the first decoded
    /// or header-only frame ends the handshake either way.
    pub fn poll_cinfo(&mut self, builder: &dyn Builder) -> PendingOutcome {
        let mut outcome = PendingOutcome::Pending;
        self.tcp.poll_read(builder, |read_outcome| {
            outcome = match read_outcome {
                TcpReadOutcome::WouldBlock => PendingOutcome::Pending,
                TcpReadOutcome::Message {
                    inbound: Inbound::Payload { msg_type, message, raw },
                    ..
                } => PendingOutcome::Cinfo { msg_type, message, raw },
                TcpReadOutcome::Message { inbound: Inbound::HeaderOnly { msg_type }, .. } => {
                    debug!(msg_type, "handshake: client-info arrived header-only");
                    PendingOutcome::Dead
                }
                TcpReadOutcome::Disconnected(_) => PendingOutcome::Dead,
                TcpReadOutcome::Malformed { msg_type } => {
                    debug!(msg_type, "handshake: malformed client-info");
                    PendingOutcome::Dead
                }
            };
        });
        outcome
    }
}

/// A promoted, roster-resident wire (spec `Live`). Holds no handshake
/// state; `id`/`name` are fixed for its lifetime in the roster.
pub struct ClientWire {
    pub id: PeerId,
    pub name: ArrayStr<64>,
    pub tcp: TcpHalf,
    pub udp: UdpHalf,
}

/// One roster entry as it appears in an `AcceptedRoster` blob (spec §4.6
/// point 3). `id` is narrowed from the wire's `u64` descriptor on decode
/// and validated against `[0, capacity)` per spec §9's open question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: PeerId,
    pub name: String,
}

/// Encodes the `AcceptedRoster` blob: `{ max_clients: i64, clients_count:
/// i64, (name_size: u64, id: u64, name_bytes) × clients_count }`.
pub fn encode_accepted_roster(max_clients: usize, entries: &[RosterEntry]) -> Vec<u8> {
    let mut buf = ByteBuffer::with_capacity(16 + entries.len() * 24);
    buf.append_pod::<i64>(max_clients as i64);
    buf.append_pod::<i64>(entries.len() as i64);
    for entry in entries {
        let name_bytes = entry.name.as_bytes();
        buf.append_pod::<u64>(name_bytes.len() as u64);
        buf.append_pod::<u64>(entry.id as u64);
        buf.append_raw(name_bytes);
    }
    buf.into_vec()
}

#[derive(Debug, thiserror::Error)]
pub enum RosterBlobError {
    #[error("accepted-roster blob truncated")]
    Truncated,
    #[error("accepted-roster entry id {0} out of range [0, {1})")]
    IdOutOfRange(u64, usize),
    #[error("accepted-roster entry name is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug)]
pub struct AcceptedRoster {
    pub max_clients: i64,
    pub entries: Vec<RosterEntry>,
}

/// Decodes the blob produced by `encode_accepted_roster`, narrowing each
/// `u64` id to `PeerId` and rejecting ids outside `[0, max_clients)` (spec
/// §9 open question on the `id` field's width mismatch).
pub fn decode_accepted_roster(payload: &[u8]) -> Result<AcceptedRoster, RosterBlobError> {
    let mut buf = ByteBuffer::new();
    buf.append_raw(payload);
    let max_clients = buf.take_pod::<i64>().ok_or(RosterBlobError::Truncated)?;
    let count = buf.take_pod::<i64>().ok_or(RosterBlobError::Truncated)?;
    let mut entries = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name_size = buf.take_pod::<u64>().ok_or(RosterBlobError::Truncated)?;
        let id = buf.take_pod::<u64>().ok_or(RosterBlobError::Truncated)?;
        if id >= max_clients.max(0) as u64 {
            return Err(RosterBlobError::IdOutOfRange(id, max_clients.max(0) as usize));
        }
        let mut name_bytes = vec![0u8; name_size as usize];
        if !buf.take_raw(&mut name_bytes) {
            return Err(RosterBlobError::Truncated);
        }
        let name = String::from_utf8(name_bytes).map_err(|_| RosterBlobError::InvalidUtf8)?;
        entries.push(RosterEntry { id: id as PeerId, name });
    }
    Ok(AcceptedRoster { max_clients, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_blob_roundtrip() {
        let entries = vec![
            RosterEntry { id: 1, name: "alice_host".to_string() },
            RosterEntry { id: 2, name: "bob".to_string() },
        ];
        let blob = encode_accepted_roster(4, &entries);
        let decoded = decode_accepted_roster(&blob).unwrap();
        assert_eq!(decoded.max_clients, 4);
        assert_eq!(decoded.entries, entries);
    }

    #[test]
    fn roster_blob_rejects_out_of_range_id() {
        let mut buf = ByteBuffer::new();
        buf.append_pod::<i64>(2);
        buf.append_pod::<i64>(1);
        buf.append_pod::<u64>(3);
        buf.append_pod::<u64>(99);
        buf.append_raw(b"bad");
        let err = decode_accepted_roster(&buf.into_vec()).unwrap_err();
        assert!(matches!(err, RosterBlobError::IdOutOfRange(99, 2)));
    }

    #[test]
    fn empty_roster_blob_roundtrip() {
        let blob = encode_accepted_roster(2, &[]);
        let decoded = decode_accepted_roster(&blob).unwrap();
        assert_eq!(decoded.max_clients, 2);
        assert!(decoded.entries.is_empty());
    }
}
