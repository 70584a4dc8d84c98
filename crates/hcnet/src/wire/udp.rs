//! Per-wire UDP read/write pipeline (spec §4.5 "Read (UDP)"/"Write (UDP)").
//!
//! UDP carries no backlog and no partial-frame state: each readable event
//! yields zero or more complete datagrams, and a write either lands whole or
//! is dropped (spec invariant: UDP delivery is best-effort, unordered, and
//! lossy — callers must not assume a send was received). The socket is
//! `connect`ed to the single peer it speaks for (see `wire/mod.rs`'s
//! same-local-endpoint accept trick), so `send`/`recv` address a fixed
//! 4-tuple rather than `send_to`/`recv_from`.

use std::io;

use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::{
    codec::Side,
    message::{Builder, Inbound, PeerId},
};

/// Largest datagram this pipeline will attempt to read. Payloads beyond
/// this are truncated by the kernel before we ever see them; we treat that
/// as malformed rather than silently accepting a corrupt message.
const MAX_DATAGRAM: usize = 65_507;

pub enum UdpReadOutcome {
    Message { from_id: Option<PeerId>, inbound: Inbound },
    WouldBlock,
    Malformed { msg_type: i16 },
}

pub struct UdpHalf {
    socket: mio::net::UdpSocket,
    side: Side,
    buf: [u8; MAX_DATAGRAM],
}

impl UdpHalf {
    pub fn new(socket: mio::net::UdpSocket, side: Side) -> Self {
        Self { socket, side, buf: [0u8; MAX_DATAGRAM] }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.socket);
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Drains every datagram currently pending, dispatching each to
    /// `on_message`. A malformed datagram is reported but does not stop the
    /// drain — unlike TCP, one bad UDP frame doesn't taint the stream.
    pub fn poll_read(&mut self, builder: &dyn Builder, mut on_message: impl FnMut(UdpReadOutcome)) {
        loop {
            match self.read_datagram(builder) {
                UdpReadOutcome::WouldBlock => break,
                outcome => on_message(outcome),
            }
        }
    }

    fn read_datagram(&mut self, builder: &dyn Builder) -> UdpReadOutcome {
        let header_len = self.side.recv_udp_header_len();
        let n = match self.socket.recv(&mut self.buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return UdpReadOutcome::WouldBlock,
            Err(err) => {
                debug!(?err, "udp: recv");
                return UdpReadOutcome::WouldBlock;
            }
        };
        if n < header_len {
            return UdpReadOutcome::Malformed { msg_type: 0 };
        }
        let header = self.side.decode_recv_udp_header(&self.buf[..header_len]);
        let payload = &self.buf[header_len..n];
        if payload.is_empty() {
            return UdpReadOutcome::Message {
                from_id: header.from_id,
                inbound: Inbound::HeaderOnly { msg_type: header.msg_type },
            };
        }
        let Some(mut shell) = builder.build(header.msg_type) else {
            return UdpReadOutcome::Malformed { msg_type: header.msg_type };
        };
        if !shell.decode(payload) {
            return UdpReadOutcome::Malformed { msg_type: header.msg_type };
        }
        UdpReadOutcome::Message {
            from_id: header.from_id,
            inbound: Inbound::Payload {
                msg_type: header.msg_type,
                message: shell,
                raw: std::sync::Arc::from(payload),
            },
        }
    }

    /// Sends `frame` (header + payload) as a single datagram. Drops it
    /// silently on `WouldBlock` — there is no backlog to queue into, per
    /// spec's no-reliability-for-UDP invariant.
    pub fn send(&mut self, frame: &[u8]) {
        match self.socket.send(frame) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("udp: send would block, dropping datagram");
            }
            Err(err) => {
                debug!(?err, "udp: send failed, dropping datagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::Message;

    struct Echo(Vec<u8>);
    impl Message for Echo {
        fn msg_type(&self) -> i16 {
            7
        }
        fn encode(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.0);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct EchoShell(Vec<u8>);
    impl crate::message::DecodeMessage for EchoShell {
        fn decode(&mut self, payload: &[u8]) -> bool {
            self.0 = payload.to_vec();
            true
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn builder() -> impl Builder {
        |msg_type: i16| -> Option<Box<dyn crate::message::DecodeMessage>> {
            (msg_type == 7).then(|| Box::new(EchoShell(Vec::new())) as Box<_>)
        }
    }

    fn bind_pair() -> (std::net::UdpSocket, std::net::UdpSocket) {
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn roundtrip_host_to_client() {
        let (std_a, std_b) = bind_pair();
        let mut host = UdpHalf::new(mio::net::UdpSocket::from_std(std_a), Side::Host);
        let mut client = UdpHalf::new(mio::net::UdpSocket::from_std(std_b), Side::Client);

        let frame = Side::Host.frame_udp(&Echo(vec![1, 2, 3]), 9);
        host.send(&frame);
        std::thread::sleep(Duration::from_millis(10));

        let b = builder();
        let mut seen: Option<(Option<PeerId>, i16)> = None;
        client.poll_read(&b, |outcome| {
            if let UdpReadOutcome::Message { from_id, inbound } = outcome {
                seen = Some((from_id, inbound.msg_type()));
            }
        });
        let (from_id, msg_type) = seen.expect("message delivered");
        assert_eq!(from_id, Some(9));
        assert_eq!(msg_type, 7);
    }

    #[test]
    fn empty_socket_would_block() {
        let (std_a, _std_b) = bind_pair();
        let mut host = UdpHalf::new(mio::net::UdpSocket::from_std(std_a), Side::Host);
        let b = builder();
        let mut called = false;
        host.poll_read(&b, |_| called = true);
        assert!(!called);
    }
}
