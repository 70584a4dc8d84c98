//! Client controller (spec §4.7): single-peer connect, admission, and the
//! steady-state read/write loops.
//!
//! Grounded on `flux-network::tcp::TcpConnector`'s outbound-connect path
//! (`maybe_reconnect`), *without* its auto-reconnect behavior — spec.md's
//! Non-goals rule out reconnection, so a dropped connection here surfaces
//! once via `on_close_connection` rather than retrying. Threading mirrors
//! spec §5's client model: one reactor thread plus one write-pump thread
//! per transport, symmetric to the host's reactor-plus-broadcast-consumer
//! split in `host.rs`.
use std::{
    io,
    net::{SocketAddr, TcpStream as StdTcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::{Events, Poll, Registry, Token, net::TcpStream};
use tracing::{debug, info};

use crate::{
    codec::Side,
    error::Error,
    message::{Builder, DecodeMessage, Inbound, Message, PeerId, admission},
    queue::{BroadcastItem, BroadcastQueue},
    wire::{
        AcceptedRoster, decode_accepted_roster, open_bind_connect_udp,
        tcp::{ConnState, TcpHalf, TcpReadOutcome},
        udp::{UdpHalf, UdpReadOutcome},
    },
};

const TCP_TOKEN: Token = Token(0);
const UDP_TOKEN: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const OUT_QUEUE_CAPACITY: usize = 256;

/// Mirrors `HostHandler`, but for the single-peer client side (spec §6
/// "symmetric... matching builder/new-packet/close callbacks").
pub trait ClientHandler: Send {
    fn builder_tcp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>>;
    fn builder_udp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>>;
    fn new_packet_tcp(&mut self, from_id: PeerId, inbound: Inbound);
    fn new_packet_udp(&mut self, from_id: PeerId, inbound: Inbound) -> bool;
    /// Fired once admission succeeds, carrying the decoded roster snapshot
    /// (spec §4.7 "install the roster view, mark connected, notify owner").
    fn on_connected(&mut self, roster: AcceptedRoster);
    /// Fired on `DuplicateName`/`ServerFull`, or on a handshake I/O failure.
    fn on_rejected(&mut self, reason: RejectReason);
    fn on_close_connection(&mut self, cause: Option<Error>);
    fn on_error(&mut self, err: Error);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateName,
    ServerFull,
    /// The server closed or sent something other than one of the three
    /// reserved admission-response kinds.
    HandshakeFailed,
}

/// Shared, `Send + Sync` handle used by the reactor thread and the two
/// write-pump threads, mirroring `host.rs`'s `Shared`.
struct Shared {
    tcp: Mutex<TcpHalf>,
    udp: Mutex<UdpHalf>,
    registry: Registry,
    running: AtomicBool,
    connected: AtomicBool,
}

pub struct Client<H: ClientHandler> {
    handler: Option<H>,
    poll: Option<Poll>,
    shared: Option<Arc<Shared>>,
    out_tcp: Arc<BroadcastQueue>,
    out_udp: Arc<BroadcastQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl<H: ClientHandler + 'static> Client<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Some(handler),
            poll: None,
            shared: None,
            out_tcp: Arc::new(BroadcastQueue::new(OUT_QUEUE_CAPACITY)),
            out_udp: Arc::new(BroadcastQueue::new(OUT_QUEUE_CAPACITY)),
            threads: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.as_ref().is_some_and(|s| s.connected.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.shared.as_ref().is_some_and(|s| s.running.load(Ordering::Acquire))
    }

    /// Enqueues `msg` for the TCP write-pump thread (spec §4.7 "single-peer
    /// outbound queue for each transport, no fan-out").
    pub fn send_tcp(&self, msg: &dyn Message) {
        let frame = Side::Client.frame_tcp(msg, 0);
        self.out_tcp.push(BroadcastItem { frame: Arc::from(frame), skip: None });
    }

    pub fn send_udp(&self, msg: &dyn Message) {
        let frame = Side::Client.frame_udp(msg, 0);
        self.out_udp.push(BroadcastItem { frame: Arc::from(frame), skip: None });
    }

    /// Connects TCP, pairs a UDP socket on the same local endpoint (spec
    /// §4.7), hands off the client-info packet, and spawns the reactor plus
    /// the two write-pump threads.
    pub fn start(
        &mut self,
        host_ip: std::net::IpAddr,
        port: u16,
        cinfo: &dyn Message,
    ) -> io::Result<()> {
        let remote: SocketAddr = (host_ip, port).into();
        let std_stream = StdTcpStream::connect(remote)?;
        std_stream.set_nonblocking(true)?;
        let local_addr = std_stream.local_addr()?;

        let poll = Poll::new()?;
        let mut tcp = TcpHalf::new(TcpStream::from_std(std_stream), Side::Client)?;
        tcp.register(poll.registry(), TCP_TOKEN)?;

        let udp_socket = open_bind_connect_udp(local_addr, remote)?;
        let mut udp = UdpHalf::new(udp_socket, Side::Client);
        udp.register(poll.registry(), UDP_TOKEN)?;

        let cinfo_frame = Side::Client.frame_tcp(cinfo, 0);
        tcp.send(poll.registry(), cinfo_frame);

        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(Shared {
            tcp: Mutex::new(tcp),
            udp: Mutex::new(udp),
            registry,
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
        });
        self.shared = Some(shared.clone());

        self.threads.push(spawn_write_pump(shared.clone(), self.out_tcp.clone(), true));
        self.threads.push(spawn_write_pump(shared.clone(), self.out_udp.clone(), false));

        let handler = self.handler.take().expect("start called twice");
        self.threads.push(std::thread::spawn(move || {
            let mut runner = Runner { poll, handler, shared, state: RunState::AwaitAdmission };
            runner.run();
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.running.store(false, Ordering::Release);
        }
        self.out_tcp.stop();
        self.out_udp.stop();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// Blocks on the outbound queue and writes each frame to the shared wire;
/// mirrors `host.rs::spawn_consumer` minus the roster fan-out and skip
/// logic, since the client speaks to exactly one peer.
fn spawn_write_pump(shared: Arc<Shared>, queue: Arc<BroadcastQueue>, is_tcp: bool) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Some(item) = queue.pop() {
            if is_tcp {
                let mut tcp = shared.tcp.lock().unwrap();
                tcp.send(&shared.registry, item.frame.to_vec());
            } else {
                let mut udp = shared.udp.lock().unwrap();
                udp.send(&item.frame);
            }
        }
    })
}

enum RunState {
    AwaitAdmission,
    Live,
    Done,
}

struct Runner<H: ClientHandler> {
    poll: Poll,
    handler: H,
    shared: Arc<Shared>,
    state: RunState,
}

/// Admission responses carry no payload the application can decode (the
/// three kinds are header-only or the roster blob), so the handshake's
/// `Builder` never needs to hand out a real shell.
struct NoBuilder;
impl Builder for NoBuilder {
    fn build(&self, _msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        None
    }
}

impl<H: ClientHandler> Runner<H> {
    fn run(&mut self) {
        let mut events = Events::with_capacity(32);
        while self.shared.running.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.handler.on_error(Error::FailedToRunReactor(err));
                break;
            }

            let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
            for token in tokens {
                match (token, &self.state) {
                    (TCP_TOKEN, RunState::AwaitAdmission) => self.drive_admission(),
                    (TCP_TOKEN, RunState::Live) => self.drive_live_tcp(),
                    (UDP_TOKEN, RunState::Live) => self.drive_live_udp(),
                    _ => {}
                }
            }

            if matches!(self.state, RunState::Done) {
                break;
            }
        }

        let mut tcp = self.shared.tcp.lock().unwrap();
        tcp.close(&self.shared.registry);
        let mut udp = self.shared.udp.lock().unwrap();
        udp.deregister(&self.shared.registry);
    }

    fn drive_admission(&mut self) {
        let builder = NoBuilder;
        let mut outcome = None;
        let mut tcp = self.shared.tcp.lock().unwrap();
        tcp.poll_read(&builder, |o| {
            if outcome.is_none() {
                outcome = Some(o);
            }
        });
        drop(tcp);
        let Some(outcome) = outcome else { return };
        match outcome {
            TcpReadOutcome::WouldBlock => {}
            TcpReadOutcome::Disconnected(err) => {
                debug!(?err, "client: disconnected during admission");
                self.handler.on_rejected(RejectReason::HandshakeFailed);
                self.state = RunState::Done;
            }
            TcpReadOutcome::Malformed { msg_type } => {
                debug!(msg_type, "client: malformed admission response");
                self.handler.on_rejected(RejectReason::HandshakeFailed);
                self.state = RunState::Done;
            }
            TcpReadOutcome::Message { inbound, .. } => self.decide_admission(inbound),
        }
    }

    fn decide_admission(&mut self, inbound: Inbound) {
        match inbound.msg_type() {
            admission::ACCEPTED_ROSTER => {
                let Inbound::Payload { raw, .. } = inbound else {
                    self.handler.on_rejected(RejectReason::HandshakeFailed);
                    self.state = RunState::Done;
                    return;
                };
                match decode_accepted_roster(&raw) {
                    Ok(roster) => {
                        info!(count = roster.entries.len(), "client: admitted");
                        self.shared.connected.store(true, Ordering::Release);
                        self.state = RunState::Live;
                        self.handler.on_connected(roster);
                    }
                    Err(err) => {
                        debug!(?err, "client: malformed accepted-roster blob");
                        self.handler.on_rejected(RejectReason::HandshakeFailed);
                        self.state = RunState::Done;
                    }
                }
            }
            admission::DUPLICATE_NAME => {
                self.handler.on_rejected(RejectReason::DuplicateName);
                self.state = RunState::Done;
            }
            admission::SERVER_FULL => {
                self.handler.on_rejected(RejectReason::ServerFull);
                self.state = RunState::Done;
            }
            other => {
                debug!(msg_type = other, "client: unexpected admission response");
                self.handler.on_rejected(RejectReason::HandshakeFailed);
                self.state = RunState::Done;
            }
        }
    }

    fn drive_live_tcp(&mut self) {
        let builder = AdapterTcp(&self.handler);
        let mut collected = Vec::new();
        let mut died = false;
        let mut cause = None;
        {
            let mut tcp = self.shared.tcp.lock().unwrap();
            tcp.poll_read(&builder, |outcome| match outcome {
                TcpReadOutcome::Message { from_id, inbound } => collected.push((from_id, inbound)),
                TcpReadOutcome::WouldBlock => {}
                TcpReadOutcome::Disconnected(err) => {
                    died = true;
                    cause = err.map(|source| Error::FailedToRead { peer: None, source });
                }
                TcpReadOutcome::Malformed { .. } => died = true,
            });
            if !died {
                if let ConnState::Disconnected(err) = tcp.poll_write(&self.shared.registry) {
                    died = true;
                    cause = err.map(|source| Error::FailedToWrite { peer: None, source });
                }
            }
        }
        for (from_id, inbound) in collected {
            self.handler.new_packet_tcp(from_id.unwrap_or(0), inbound);
        }
        if died {
            self.handler.on_close_connection(cause);
            self.state = RunState::Done;
        }
    }

    fn drive_live_udp(&mut self) {
        let builder = AdapterUdp(&self.handler);
        let mut collected = Vec::new();
        {
            let mut udp = self.shared.udp.lock().unwrap();
            udp.poll_read(&builder, |outcome| {
                if let UdpReadOutcome::Message { from_id, inbound } = outcome {
                    collected.push((from_id, inbound));
                }
            });
        }
        // See `host.rs::drive_live_udp`: `false` means the application
        // didn't recognize the payload, which tears the wire down.
        let mut unknown = false;
        for (from_id, inbound) in collected {
            if !self.handler.new_packet_udp(from_id.unwrap_or(0), inbound) {
                unknown = true;
            }
        }
        if unknown {
            self.handler.on_close_connection(None);
            self.state = RunState::Done;
        }
    }
}

struct AdapterTcp<'a, H: ClientHandler>(&'a H);
impl<'a, H: ClientHandler> Builder for AdapterTcp<'a, H> {
    fn build(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        self.0.builder_tcp(msg_type)
    }
}

struct AdapterUdp<'a, H: ClientHandler>(&'a H);
impl<'a, H: ClientHandler> Builder for AdapterUdp<'a, H> {
    fn build(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        self.0.builder_udp(msg_type)
    }
}
