//! Header layouts and frame assembly (spec §3, §4.3).
//!
//! All multi-byte fields are little-endian regardless of host, per spec §9's
//! open question on endianness. `size` is the payload length and excludes
//! the header; a `size` of zero means the message is delivered header-only
//! (invariant: no payload bytes are read or written in that case).

use crate::message::{Message, PeerId};

pub const TCP_C2S_HEADER_LEN: usize = 6;
pub const TCP_S2C_HEADER_LEN: usize = 8;
pub const UDP_C2S_HEADER_LEN: usize = 2;
pub const UDP_S2C_HEADER_LEN: usize = 4;

/// `{ size: u32, msg_type: i16 }`, 6 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpClientHeader {
    pub size: u32,
    pub msg_type: i16,
}

impl TcpClientHeader {
    pub fn encode(self) -> [u8; TCP_C2S_HEADER_LEN] {
        let mut buf = [0u8; TCP_C2S_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; TCP_C2S_HEADER_LEN]) -> Self {
        Self {
            size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            msg_type: i16::from_le_bytes(buf[4..6].try_into().unwrap()),
        }
    }
}

/// `{ size: u32, msg_type: i16, from_id: i16 }`, 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpServerHeader {
    pub size: u32,
    pub msg_type: i16,
    pub from_id: PeerId,
}

impl TcpServerHeader {
    pub fn encode(self) -> [u8; TCP_S2C_HEADER_LEN] {
        let mut buf = [0u8; TCP_S2C_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[6..8].copy_from_slice(&self.from_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; TCP_S2C_HEADER_LEN]) -> Self {
        Self {
            size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            msg_type: i16::from_le_bytes(buf[4..6].try_into().unwrap()),
            from_id: i16::from_le_bytes(buf[6..8].try_into().unwrap()),
        }
    }
}

/// `{ msg_type: i16 }`, 2 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpClientHeader {
    pub msg_type: i16,
}

impl UdpClientHeader {
    pub fn encode(self) -> [u8; UDP_C2S_HEADER_LEN] {
        self.msg_type.to_le_bytes()
    }

    pub fn decode(buf: [u8; UDP_C2S_HEADER_LEN]) -> Self {
        Self { msg_type: i16::from_le_bytes(buf) }
    }
}

/// `{ msg_type: i16, from_id: i16 }`, 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpServerHeader {
    pub msg_type: i16,
    pub from_id: PeerId,
}

impl UdpServerHeader {
    pub fn encode(self) -> [u8; UDP_S2C_HEADER_LEN] {
        let mut buf = [0u8; UDP_S2C_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.msg_type.to_le_bytes());
        buf[2..4].copy_from_slice(&self.from_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; UDP_S2C_HEADER_LEN]) -> Self {
        Self {
            msg_type: i16::from_le_bytes(buf[0..2].try_into().unwrap()),
            from_id: i16::from_le_bytes(buf[2..4].try_into().unwrap()),
        }
    }
}

/// Encodes `msg` as a complete client→server TCP frame (header + payload).
pub fn frame_tcp_client(msg: &dyn Message) -> Vec<u8> {
    let mut payload = Vec::new();
    msg.encode(&mut payload);
    let header = TcpClientHeader { size: payload.len() as u32, msg_type: msg.msg_type() };
    let mut out = Vec::with_capacity(TCP_C2S_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    out
}

/// Encodes `msg` as a complete server→client TCP frame, stamped with the
/// sender's id (spec §4.6 "fan-out stamps the outgoing header's `from_id`").
pub fn frame_tcp_server(msg: &dyn Message, from_id: PeerId) -> Vec<u8> {
    let mut payload = Vec::new();
    msg.encode(&mut payload);
    let header =
        TcpServerHeader { size: payload.len() as u32, msg_type: msg.msg_type(), from_id };
    let mut out = Vec::with_capacity(TCP_S2C_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&payload);
    out
}

/// Encodes a header-only server→client TCP frame (e.g. `ClientDisconnect`,
/// admission rejection replies).
pub fn frame_tcp_server_header_only(msg_type: i16, from_id: PeerId) -> Vec<u8> {
    TcpServerHeader { size: 0, msg_type, from_id }.encode().to_vec()
}

pub fn frame_udp_client(msg: &dyn Message) -> Vec<u8> {
    let mut out = UdpClientHeader { msg_type: msg.msg_type() }.encode().to_vec();
    msg.encode(&mut out);
    out
}

pub fn frame_udp_server(msg: &dyn Message, from_id: PeerId) -> Vec<u8> {
    let mut out = UdpServerHeader { msg_type: msg.msg_type(), from_id }.encode().to_vec();
    msg.encode(&mut out);
    out
}

/// Which end of the wire a `Wire`/`Client` half is playing. Determines
/// which of the two header shapes per transport is read vs written —
/// the host reads client-shaped headers and writes server-shaped ones
/// (stamped with `from_id`), the client does the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Client,
}

/// A header as parsed off the wire, with transport- and shape-specific
/// fields normalized into one shape for the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub size: u32,
    pub msg_type: i16,
    pub from_id: Option<PeerId>,
}

impl Side {
    pub fn recv_tcp_header_len(self) -> usize {
        match self {
            Side::Host => TCP_C2S_HEADER_LEN,
            Side::Client => TCP_S2C_HEADER_LEN,
        }
    }

    pub fn recv_udp_header_len(self) -> usize {
        match self {
            Side::Host => UDP_C2S_HEADER_LEN,
            Side::Client => UDP_S2C_HEADER_LEN,
        }
    }

    pub fn decode_recv_tcp_header(self, buf: &[u8]) -> ParsedHeader {
        match self {
            Side::Host => {
                let h = TcpClientHeader::decode(buf.try_into().unwrap());
                ParsedHeader { size: h.size, msg_type: h.msg_type, from_id: None }
            }
            Side::Client => {
                let h = TcpServerHeader::decode(buf.try_into().unwrap());
                ParsedHeader { size: h.size, msg_type: h.msg_type, from_id: Some(h.from_id) }
            }
        }
    }

    pub fn decode_recv_udp_header(self, buf: &[u8]) -> ParsedHeader {
        match self {
            Side::Host => {
                let h = UdpClientHeader::decode(buf.try_into().unwrap());
                ParsedHeader { size: 0, msg_type: h.msg_type, from_id: None }
            }
            Side::Client => {
                let h = UdpServerHeader::decode(buf.try_into().unwrap());
                ParsedHeader { size: 0, msg_type: h.msg_type, from_id: Some(h.from_id) }
            }
        }
    }

    /// Encodes a complete outbound frame (header + payload) in the shape
    /// this side sends. `from_id` is only meaningful (and only written)
    /// for `Side::Host`.
    pub fn frame_tcp(self, msg: &dyn Message, from_id: PeerId) -> Vec<u8> {
        match self {
            Side::Host => frame_tcp_server(msg, from_id),
            Side::Client => frame_tcp_client(msg),
        }
    }

    pub fn frame_udp(self, msg: &dyn Message, from_id: PeerId) -> Vec<u8> {
        match self {
            Side::Host => frame_udp_server(msg, from_id),
            Side::Client => frame_udp_client(msg),
        }
    }

    pub fn frame_tcp_header_only(self, msg_type: i16, from_id: PeerId) -> Vec<u8> {
        match self {
            Side::Host => frame_tcp_server_header_only(msg_type, from_id),
            Side::Client => TcpClientHeader { size: 0, msg_type }.encode().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_widths_match_spec() {
        assert_eq!(TCP_C2S_HEADER_LEN, 6);
        assert_eq!(TCP_S2C_HEADER_LEN, 8);
        assert_eq!(UDP_C2S_HEADER_LEN, 2);
        assert_eq!(UDP_S2C_HEADER_LEN, 4);
    }

    #[test]
    fn tcp_server_header_roundtrip() {
        let h = TcpServerHeader { size: 17, msg_type: 3, from_id: 2 };
        assert_eq!(TcpServerHeader::decode(h.encode()), h);
    }

    #[test]
    fn udp_server_header_roundtrip() {
        let h = UdpServerHeader { msg_type: 9, from_id: -1 };
        assert_eq!(UdpServerHeader::decode(h.encode()), h);
    }

    struct Ping;
    impl Message for Ping {
        fn msg_type(&self) -> i16 {
            5
        }
        fn encode(&self, _out: &mut Vec<u8>) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn header_only_frame_has_zero_size() {
        let frame = frame_tcp_client(&Ping);
        let header = TcpClientHeader::decode(frame.try_into().unwrap());
        assert_eq!(header.size, 0);
        assert_eq!(header.msg_type, 5);
    }
}
