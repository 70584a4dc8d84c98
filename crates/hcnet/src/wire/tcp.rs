//! Per-wire TCP read/write pipeline (spec §4.5 "Read (TCP)"/"Write (TCP)").
//!
//! Grounded on the teacher's `flux-network::tcp::TcpStream`: a length-
//! prefixed reader state machine plus a write-or-enqueue backlog drained on
//! writability. Generalized here to the spec's variable header shape
//! (`Side`) and to dispatch through the application's `Builder` instead of
//! a single fixed wire type.
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
};

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

use crate::{
    codec::Side,
    message::{Builder, Inbound, PeerId},
};

/// Outcome of a read/write attempt. `Disconnected` carries the underlying
/// `io::Error` when the wire died on a genuine I/O failure, and `None` when
/// the peer closed cleanly (`read` returned `Ok(0)`) — callers report the
/// former as `FailedToRead`/`FailedToWrite` and the latter as an empty cause.
#[derive(Debug)]
pub enum ConnState {
    Alive,
    Disconnected(Option<io::Error>),
}

impl ConnState {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnState::Disconnected(_))
    }
}

pub enum TcpReadOutcome {
    Message { from_id: Option<PeerId>, inbound: Inbound },
    WouldBlock,
    Disconnected(Option<io::Error>),
    Malformed { msg_type: i16 },
}

enum RxState {
    Header { buf: [u8; 8], have: usize },
    Payload { msg_type: i16, from_id: Option<PeerId>, data: Vec<u8>, have: usize },
}

pub struct TcpHalf {
    stream: mio::net::TcpStream,
    side: Side,
    token: Token,
    rx_state: RxState,
    send_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

impl TcpHalf {
    pub fn new(stream: mio::net::TcpStream, side: Side) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            side,
            token: Token(usize::MAX),
            rx_state: RxState::Header { buf: [0; 8], have: 0 },
            send_backlog: VecDeque::new(),
            writable_armed: false,
        })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.token = token;
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.local_addr()
    }

    /// Drives the read side for one readiness event, dispatching every
    /// fully assembled frame to `on_message`. Stops at the first
    /// `WouldBlock`, malformed frame, or disconnect.
    pub fn poll_read(&mut self, builder: &dyn Builder, mut on_message: impl FnMut(TcpReadOutcome)) {
        loop {
            match self.read_frame(builder) {
                TcpReadOutcome::WouldBlock => break,
                outcome @ TcpReadOutcome::Message { .. } => on_message(outcome),
                outcome @ (TcpReadOutcome::Disconnected(_) | TcpReadOutcome::Malformed { .. }) => {
                    on_message(outcome);
                    break;
                }
            }
        }
    }

    fn read_frame(&mut self, builder: &dyn Builder) -> TcpReadOutcome {
        loop {
            match &mut self.rx_state {
                RxState::Header { buf, have } => {
                    let header_len = self.side.recv_tcp_header_len();
                    while *have < header_len {
                        match self.stream.read(&mut buf[*have..header_len]) {
                            Ok(0) => return TcpReadOutcome::Disconnected(None),
                            Ok(n) => *have += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return TcpReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp: read header");
                                return TcpReadOutcome::Disconnected(Some(err));
                            }
                        }
                    }
                    let header = self.side.decode_recv_tcp_header(&buf[..header_len]);
                    if header.size == 0 {
                        self.rx_state = RxState::Header { buf: [0; 8], have: 0 };
                        return TcpReadOutcome::Message {
                            from_id: header.from_id,
                            inbound: Inbound::HeaderOnly { msg_type: header.msg_type },
                        };
                    }
                    self.rx_state = RxState::Payload {
                        msg_type: header.msg_type,
                        from_id: header.from_id,
                        data: vec![0u8; header.size as usize],
                        have: 0,
                    };
                }
                RxState::Payload { msg_type, from_id, data, have } => {
                    while *have < data.len() {
                        match self.stream.read(&mut data[*have..]) {
                            Ok(0) => return TcpReadOutcome::Disconnected(None),
                            Ok(n) => *have += n,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return TcpReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp: read payload");
                                return TcpReadOutcome::Disconnected(Some(err));
                            }
                        }
                    }
                    let msg_type = *msg_type;
                    let from_id = *from_id;
                    let Some(mut shell) = builder.build(msg_type) else {
                        return TcpReadOutcome::Malformed { msg_type };
                    };
                    let ok = shell.decode(data);
                    let raw: std::sync::Arc<[u8]> = std::mem::take(data).into();
                    self.rx_state = RxState::Header { buf: [0; 8], have: 0 };
                    if !ok {
                        return TcpReadOutcome::Malformed { msg_type };
                    }
                    return TcpReadOutcome::Message {
                        from_id,
                        inbound: Inbound::Payload { msg_type, message: shell, raw },
                    };
                }
            }
        }
    }

    /// Writes `frame` (a complete, already-encoded header+payload) now if
    /// possible, otherwise queues it and arms writable notifications.
    pub fn send(&mut self, registry: &Registry, frame: Vec<u8>) -> ConnState {
        if !self.send_backlog.is_empty() {
            self.send_backlog.push_back(frame);
            return self.arm_writable(registry);
        }

        match self.stream.write(&frame) {
            Ok(0) => {
                warn!("tcp: write returned 0, disconnecting");
                ConnState::Disconnected(None)
            }
            Ok(n) if n == frame.len() => ConnState::Alive,
            Ok(n) => {
                self.send_backlog.push_back(frame[n..].to_vec());
                self.arm_writable(registry)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_backlog.push_back(frame);
                self.arm_writable(registry)
            }
            Err(err) => {
                warn!(?err, "tcp: write failed");
                ConnState::Disconnected(Some(err))
            }
        }
    }

    /// Flushes the backlog on a writable event; drops writable interest
    /// once drained.
    pub fn poll_write(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected(None),
                Ok(n) if n == front.len() => {
                    self.send_backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "tcp: backlog write");
                    return ConnState::Disconnected(Some(err));
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected(Some(err));
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: arm writable");
                return ConnState::Disconnected(Some(err));
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub fn dispatch_event(ev: &Event) -> (bool, bool) {
    (ev.is_readable(), ev.is_writable())
}
