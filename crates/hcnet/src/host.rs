//! Host controller (spec §4.6): accept loop, admission handshake, roster
//! management, fan-out.
//!
//! Grounded on `flux-network::tcp::ConnectionManager::handle_event`'s
//! `Listener` arm for the accept/event-loop shape, generalized with the
//! `Accepting → … → Live` handshake states from `wire::PendingWire` and the
//! two-queue fan-out engine from `queue::BroadcastQueue`.
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, net::TcpListener};
use tracing::{debug, info};

use hcnet_utils::ArrayStr;

use crate::{
    codec::Side,
    error::Error,
    message::{Builder, DecodeMessage, Inbound, Message, PeerId},
    queue::{BroadcastItem, BroadcastQueue},
    roster::Roster,
    wire::{
        ClientWire, PendingOutcome, PendingWire, RosterEntry, encode_accepted_roster,
        tcp::{ConnState, TcpReadOutcome},
        udp::UdpReadOutcome,
    },
};

const LISTENER_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const BROADCAST_QUEUE_CAPACITY: usize = 256;

/// Outcome of the application's admission decision (spec §4.6 point 2).
/// `ServerFull` is never produced by the handler — the host enforces it
/// unconditionally before the handler is ever consulted (spec §4.6 point 5).
pub enum Decision {
    Accepted { name: ArrayStr<64> },
    Rejected,
}

/// Capability set the host needs from its owner (spec §9 "templated
/// `UserHost`"), expressed as a trait per the faithful-rewrite note there.
pub trait HostHandler: Send {
    fn builder_tcp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>>;
    fn builder_udp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>>;
    /// Decides whether to admit a newly handshaking client. The host has
    /// already rejected with `ServerFull` if the roster was full and
    /// already rejected with `DuplicateName` if `name` collides with a
    /// live client; this callback only gets to veto for application
    /// reasons (e.g. a ban list) — a veto also surfaces as `DuplicateName`
    /// on the wire, the only generic rejection kind the protocol reserves
    /// beside `ServerFull`.
    fn new_client(&mut self, cinfo: &dyn DecodeMessage) -> Decision;
    fn new_packet_tcp(&mut self, from_id: PeerId, inbound: Inbound);
    fn new_packet_udp(&mut self, from_id: PeerId, inbound: Inbound) -> bool;
    fn on_close_connection(&mut self, id: PeerId, cause: Option<Error>);
    fn on_error(&mut self, err: Error);
}

enum TokenKind {
    LiveTcp(PeerId),
    LiveUdp(PeerId),
}

struct PendingEntry {
    wire: PendingWire,
    udp_token: Token,
}

/// Cloneable, `Send + Sync` handle onto a host's outbound broadcast queues.
/// See `Host::broadcaster`.
#[derive(Clone)]
pub struct Broadcaster {
    out_tcp: Arc<BroadcastQueue>,
    out_udp: Arc<BroadcastQueue>,
}

impl Broadcaster {
    pub fn send_tcp(&self, msg: &dyn Message, from_id: PeerId, skip: Option<PeerId>) {
        let frame = Side::Host.frame_tcp(msg, from_id);
        self.out_tcp.push(BroadcastItem { frame: Arc::from(frame), skip });
    }

    pub fn send_udp(&self, msg: &dyn Message, from_id: PeerId, skip: Option<PeerId>) {
        let frame = Side::Host.frame_udp(msg, from_id);
        self.out_udp.push(BroadcastItem { frame: Arc::from(frame), skip });
    }
}

/// Shared, `Send + Sync` handle used by the reactor thread and the two
/// broadcast consumer threads.
struct Shared {
    roster: Roster<ClientWire>,
    registry: Registry,
    running: AtomicBool,
    host_id: PeerId,
    local_addr: SocketAddr,
}

pub struct Host<H: HostHandler> {
    handler: Option<H>,
    poll: Option<Poll>,
    listener: Option<TcpListener>,
    shared: Arc<Shared>,
    out_tcp: Arc<BroadcastQueue>,
    out_udp: Arc<BroadcastQueue>,
    threads: Vec<JoinHandle<()>>,
}

impl<H: HostHandler + 'static> Host<H> {
    /// `host_id` is the id the host reserves for itself in roster snapshots
    /// handed to clients (original source's `Host(port, host_id, ...)`;
    /// spec.md's §6 constructor signature omits it, but scenario 1 of §8
    /// requires one, so it is supplemented here per `original_source`).
    pub fn new(port: u16, host_id: PeerId, max_clients: usize, handler: H) -> io::Result<Self> {
        let poll = Poll::new()?;
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            handler: Some(handler),
            poll: Some(poll),
            listener: Some(listener),
            shared: Arc::new(Shared {
                roster: Roster::new(max_clients),
                registry,
                running: AtomicBool::new(false),
                host_id,
                local_addr,
            }),
            out_tcp: Arc::new(BroadcastQueue::new(BROADCAST_QUEUE_CAPACITY)),
            out_udp: Arc::new(BroadcastQueue::new(BROADCAST_QUEUE_CAPACITY)),
            threads: Vec::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn host_id(&self) -> PeerId {
        self.shared.host_id
    }

    /// The bound listener address, useful when `port` was `0` (OS-assigned)
    /// and a caller needs the actual port, e.g. in tests. Valid before and
    /// after `start()`.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Enqueues `msg` for delivery over TCP to every live client except
    /// `skip`, stamping the outgoing header with `from_id` (spec §4.6 point
    /// 4). Callers relaying a just-received client message pass that
    /// client's id; host-originated broadcasts pass `host_id()`.
    pub fn send_tcp(&self, msg: &dyn Message, from_id: PeerId, skip: Option<PeerId>) {
        self.broadcaster().send_tcp(msg, from_id, skip);
    }

    pub fn send_udp(&self, msg: &dyn Message, from_id: PeerId, skip: Option<PeerId>) {
        self.broadcaster().send_udp(msg, from_id, skip);
    }

    /// A cheap, cloneable handle onto this host's outbound queues. Handed to
    /// the application's `HostHandler` before `start()` so a callback
    /// running on the reactor thread (which owns the handler exclusively)
    /// can re-broadcast a just-received packet, e.g. relaying chat to the
    /// rest of the roster from inside `new_packet_tcp`.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster { out_tcp: self.out_tcp.clone(), out_udp: self.out_udp.clone() }
    }

    /// Spawns the reactor thread plus one broadcast-consumer thread per
    /// transport (spec §5: "one background thread drives the I/O reactor;
    /// one additional thread per transport... drives the broadcast
    /// consumer").
    pub fn start(&mut self) -> io::Result<()> {
        self.shared.running.store(true, Ordering::Release);

        self.threads.push(spawn_consumer(self.shared.clone(), self.out_tcp.clone(), true));
        self.threads.push(spawn_consumer(self.shared.clone(), self.out_udp.clone(), false));

        let poll = self.poll.take().expect("start called twice");
        let listener = self.listener.take().expect("start called twice");
        let handler = self.handler.take().expect("start called twice");
        let shared = self.shared.clone();
        let out_tcp = self.out_tcp.clone();
        let out_udp = self.out_udp.clone();
        self.threads.push(std::thread::spawn(move || {
            let mut runner = Runner {
                poll,
                listener,
                handler,
                shared,
                out_tcp,
                out_udp,
                pending: HashMap::new(),
                live: HashMap::new(),
                next_token: 1,
            };
            runner.run();
        }));
        Ok(())
    }

    /// Signals shutdown and unblocks the broadcast consumers; in-flight
    /// handlers complete before the threads exit (spec §5 cancellation).
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.out_tcp.stop();
        self.out_udp.stop();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn spawn_consumer(shared: Arc<Shared>, queue: Arc<BroadcastQueue>, is_tcp: bool) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Some(item) = queue.pop() {
            let mut dead = Vec::new();
            shared.roster.for_each(|id, entry| {
                if Some(id) == item.skip {
                    return;
                }
                let mut wire = entry.lock().unwrap();
                let state = if is_tcp {
                    wire.tcp.send(&shared.registry, item.frame.to_vec())
                } else {
                    wire.udp.send(&item.frame);
                    ConnState::Alive
                };
                if state.is_disconnected() {
                    dead.push(id);
                }
            });
            if !dead.is_empty() {
                let shared = shared.clone();
                std::thread::spawn(move || reap(&shared, &dead));
            }
        }
    })
}

/// Exclusive-lock eviction pass, run on its own short-lived thread to
/// avoid the fan-out consumer (holding the roster's shared lock) ever
/// having to upgrade to exclusive (spec §4.6 point 4, §9 "dead-wire
/// reaping during iteration").
fn reap(shared: &Arc<Shared>, ids: &[PeerId]) {
    for &id in ids {
        if let Some(entry) = shared.roster.erase_at(id) {
            let mut wire = entry.lock().unwrap();
            wire.tcp.close(&shared.registry);
            wire.udp.deregister(&shared.registry);
        }
    }
}

struct Runner<H: HostHandler> {
    poll: Poll,
    listener: TcpListener,
    handler: H,
    shared: Arc<Shared>,
    out_tcp: Arc<BroadcastQueue>,
    out_udp: Arc<BroadcastQueue>,
    pending: HashMap<Token, PendingEntry>,
    live: HashMap<Token, TokenKind>,
    next_token: usize,
}

enum CollectedEvent {
    Accept,
    PendingReadable(Token),
    LiveTcp(PeerId),
    LiveUdp(PeerId),
}

impl<H: HostHandler> Runner<H> {
    fn run(&mut self) {
        let mut events = Events::with_capacity(128);
        while self.shared.running.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.handler.on_error(Error::FailedToRunReactor(err));
                break;
            }

            let collected: Vec<CollectedEvent> = events
                .iter()
                .filter_map(|ev| {
                    let token = ev.token();
                    if token == LISTENER_TOKEN {
                        Some(CollectedEvent::Accept)
                    } else if self.pending.contains_key(&token) {
                        Some(CollectedEvent::PendingReadable(token))
                    } else {
                        match self.live.get(&token) {
                            Some(TokenKind::LiveTcp(id)) => Some(CollectedEvent::LiveTcp(*id)),
                            Some(TokenKind::LiveUdp(id)) => Some(CollectedEvent::LiveUdp(*id)),
                            _ => None,
                        }
                    }
                })
                .collect();

            for event in collected {
                match event {
                    CollectedEvent::Accept => self.accept_all(),
                    CollectedEvent::PendingReadable(token) => self.drive_pending(token),
                    CollectedEvent::LiveTcp(id) => self.drive_live_tcp(id),
                    CollectedEvent::LiveUdp(id) => self.drive_live_udp(id),
                }
            }
        }

        self.out_tcp.stop();
        self.out_udp.stop();
    }

    fn accept_all(&mut self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.handler.on_error(Error::FailedToConnect {
                        addr: ([0, 0, 0, 0], 0).into(),
                        source: err,
                    });
                    return;
                }
            };
            info!(?peer_addr, "host: accepted connection");

            let local_addr = match stream.local_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    self.handler.on_error(Error::FailedToConnect { addr: peer_addr, source: err });
                    continue;
                }
            };

            let mut pending = match PendingWire::new(stream, local_addr, peer_addr) {
                Ok(p) => p,
                Err(err) => {
                    self.handler.on_error(Error::FailedToConnect { addr: peer_addr, source: err });
                    continue;
                }
            };

            let tcp_token = Token(self.next_token);
            let udp_token = Token(self.next_token + 1);
            self.next_token += 2;

            if let Err(err) = pending.tcp.register(self.poll.registry(), tcp_token) {
                self.handler.on_error(Error::FailedToConnect { addr: peer_addr, source: err });
                continue;
            }

            self.pending.insert(tcp_token, PendingEntry { wire: pending, udp_token });
        }
    }

    fn drive_pending(&mut self, token: Token) {
        let builder = AdapterTcp(&self.handler);
        let Some(entry) = self.pending.get_mut(&token) else { return };
        let outcome = entry.wire.poll_cinfo(&builder);
        match outcome {
            PendingOutcome::Pending => {}
            PendingOutcome::Dead => {
                let mut entry = self.pending.remove(&token).unwrap();
                entry.wire.tcp.close(self.poll.registry());
            }
            PendingOutcome::Cinfo { msg_type, message, raw } => {
                let mut entry = self.pending.remove(&token).unwrap();
                self.decide(token, entry.udp_token, entry.wire, msg_type, message, raw);
            }
        }
    }

    fn decide(
        &mut self,
        tcp_token: Token,
        udp_token: Token,
        mut wire: PendingWire,
        cinfo_msg_type: i16,
        cinfo: Box<dyn DecodeMessage>,
        cinfo_raw: std::sync::Arc<[u8]>,
    ) {
        if self.shared.roster.is_full() {
            debug!("host: rejecting connection, roster full");
            let frame = Side::Host
                .frame_tcp_header_only(crate::message::admission::SERVER_FULL, self.shared.host_id);
            let _ = wire.tcp.send(self.poll.registry(), frame);
            wire.tcp.close(self.poll.registry());
            return;
        }

        // Name extraction is application-defined (cinfo's shape is
        // app-registered); the handler supplies both the accept/reject
        // verdict and the name to register under in one call.
        let decision = self.handler.new_client(cinfo.as_ref());
        let Decision::Accepted { name } = decision else {
            debug!("host: rejecting connection, handler vetoed");
            let frame = Side::Host
                .frame_tcp_header_only(crate::message::admission::DUPLICATE_NAME, self.shared.host_id);
            let _ = wire.tcp.send(self.poll.registry(), frame);
            wire.tcp.close(self.poll.registry());
            return;
        };

        if self.shared.roster.first_if(|w: &ClientWire| w.name.as_str() == name.as_str()).is_some() {
            debug!(name = name.as_str(), "host: rejecting connection, duplicate name");
            let frame = Side::Host
                .frame_tcp_header_only(crate::message::admission::DUPLICATE_NAME, self.shared.host_id);
            let _ = wire.tcp.send(self.poll.registry(), frame);
            wire.tcp.close(self.poll.registry());
            return;
        }

        let Some(assigned_id) = self.shared.roster.next_empty_index() else {
            // Lost the race against another admission between the full
            // check above and now; treat identically to server-full.
            let frame = Side::Host
                .frame_tcp_header_only(crate::message::admission::SERVER_FULL, self.shared.host_id);
            let _ = wire.tcp.send(self.poll.registry(), frame);
            wire.tcp.close(self.poll.registry());
            return;
        };

        let mut entries = Vec::new();
        self.shared.roster.for_each(|id, entry| {
            let guard = entry.lock().unwrap();
            entries.push(RosterEntry { id, name: guard.name.as_str().to_string() });
        });
        let blob = encode_accepted_roster(self.shared.roster.capacity(), &entries);
        let hinfo = RawBlobMessage { msg_type: crate::message::admission::ACCEPTED_ROSTER, blob };

        if wire
            .tcp
            .send(self.poll.registry(), Side::Host.frame_tcp(&hinfo, self.shared.host_id))
            .is_disconnected()
        {
            wire.tcp.close(self.poll.registry());
            return;
        }

        if let Err(err) = wire.udp.register(self.poll.registry(), udp_token) {
            self.handler.on_error(Error::FailedToConnect {
                addr: wire.tcp.peer_addr().unwrap_or(([0, 0, 0, 0], 0).into()),
                source: err,
            });
            wire.tcp.close(self.poll.registry());
            return;
        }

        let client = ClientWire { id: assigned_id, name, tcp: wire.tcp, udp: wire.udp };
        self.shared.roster.emplace_at(assigned_id, client);
        self.live.insert(tcp_token, TokenKind::LiveTcp(assigned_id));
        self.live.insert(udp_token, TokenKind::LiveUdp(assigned_id));

        // Broadcast the raw client-info payload to existing peers, stamped
        // with the new client's id, so they learn of the new participant
        // (spec §4.6 "HinfoWrite ... broadcast the new-client packet").
        let announce = Side::Host.frame_tcp(
            &RawBlobMessage { msg_type: cinfo_msg_type, blob: cinfo_raw.to_vec() },
            assigned_id,
        );
        self.out_tcp.push(BroadcastItem { frame: Arc::from(announce), skip: Some(assigned_id) });
    }

    fn drive_live_tcp(&mut self, id: PeerId) {
        let Some(entry) = self.shared.roster.get(id) else { return };
        let builder = AdapterTcp(&self.handler);
        let mut collected = Vec::new();
        let mut died = false;
        let mut cause = None;
        {
            let mut wire = entry.lock().unwrap();
            wire.tcp.poll_read(&builder, |outcome| match outcome {
                TcpReadOutcome::Message { inbound, .. } => collected.push(inbound),
                TcpReadOutcome::WouldBlock => {}
                TcpReadOutcome::Disconnected(err) => {
                    died = true;
                    cause = err.map(|source| Error::FailedToRead { peer: Some(id), source });
                }
                TcpReadOutcome::Malformed { .. } => died = true,
            });
            if !died {
                if let ConnState::Disconnected(err) = wire.tcp.poll_write(self.poll.registry()) {
                    died = true;
                    cause = err.map(|source| Error::FailedToWrite { peer: Some(id), source });
                }
            }
        }
        for inbound in collected {
            self.handler.new_packet_tcp(id, inbound);
        }
        if died {
            self.close_client(id, cause);
        }
    }

    fn drive_live_udp(&mut self, id: PeerId) {
        let Some(entry) = self.shared.roster.get(id) else { return };
        let builder = AdapterUdp(&self.handler);
        let mut collected = Vec::new();
        {
            let mut wire = entry.lock().unwrap();
            wire.udp.poll_read(&builder, |outcome| {
                if let UdpReadOutcome::Message { inbound, .. } = outcome {
                    collected.push(inbound);
                }
            });
        }
        // `new_packet_udp` returning `false` means the application didn't
        // recognize the payload (original source's `ContinueAndNotify`
        // closing the wire with `unknown_msg_type`); treat it the same as a
        // malformed TCP frame.
        let mut unknown = false;
        for inbound in collected {
            if !self.handler.new_packet_udp(id, inbound) {
                unknown = true;
            }
        }
        if unknown {
            self.close_client(id, None);
        }
    }

    /// Spec `Closing`: shuts down both sockets, notifies the owner, and
    /// clears the roster slot, then announces the disconnect to the
    /// remaining clients with a header-only packet (spec §8 scenario 5).
    fn close_client(&mut self, id: PeerId, cause: Option<Error>) {
        if let Some(entry) = self.shared.roster.erase_at(id) {
            let mut wire = entry.lock().unwrap();
            wire.tcp.close(self.poll.registry());
            wire.udp.deregister(self.poll.registry());
        }
        self.handler.on_close_connection(id, cause);
        let disconnect = RawBlobMessage { msg_type: CLIENT_DISCONNECT_MSG_TYPE, blob: Vec::new() };
        self.out_tcp.push(BroadcastItem {
            frame: Arc::from(Side::Host.frame_tcp(&disconnect, id)),
            skip: None,
        });
    }
}

/// Reserved msg_type the host stamps on the header-only packet announcing
/// a client's disconnect (spec §8 scenario 5's `ClientDisconnect`). Chosen
/// outside the admission-response range (0..=2) and left for applications
/// to recognize by convention, since the core holds no fixed kind catalog
/// beyond the three admission responses.
pub const CLIENT_DISCONNECT_MSG_TYPE: i16 = -1;

/// A pre-encoded or opaque payload the host needs to frame without going
/// through the application's `Message` trait (admission responses,
/// disconnect announcements). `blob` is written verbatim.
struct RawBlobMessage {
    msg_type: i16,
    blob: Vec<u8>,
}

impl Message for RawBlobMessage {
    fn msg_type(&self) -> i16 {
        self.msg_type
    }
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.blob);
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct AdapterTcp<'a, H: HostHandler>(&'a H);
impl<'a, H: HostHandler> Builder for AdapterTcp<'a, H> {
    fn build(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        self.0.builder_tcp(msg_type)
    }
}

struct AdapterUdp<'a, H: HostHandler>(&'a H);
impl<'a, H: HostHandler> Builder for AdapterUdp<'a, H> {
    fn build(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        self.0.builder_udp(msg_type)
    }
}
