//! `chat-host`: a command-line chat server. Accepts up to `--max-clients`
//! clients, relays chat lines between them over TCP or UDP, and optionally
//! opens a UPnP port mapping on startup. Ported from the original's
//! `chat_cmd/src/host.cpp` sample.

use std::{
    io::{self, BufRead, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use hcnet::{Broadcaster, Decision, DecodeMessage, Host, HostHandler, Inbound, PeerId};
use hcnet_chat_demo::{APP_NAME, CHAT_MSG_TYPE, CinfoShell, ChatMsg, ChatShell, DEFAULT_PORT, MAX_NAME_LEN, build_tcp, build_udp};
use hcnet_igd::NatHelper;
use hcnet_utils::ArrayStr;
use tracing::{info, warn};

/// Host id stamped on messages this process itself sends (chat lines typed
/// at the host's own prompt); it never collides with a roster slot since
/// client ids are always in `[0, max_clients)`.
const HOST_ID: PeerId = -1;

#[derive(Parser)]
#[command(name = "chat-host", about = "hcnet chat demo host")]
struct Args {
    /// TCP/UDP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of simultaneously connected clients.
    #[arg(long, default_value_t = 8)]
    max_clients: usize,

    /// Ask a local UPnP/IGD router to forward `port` before accepting
    /// connections.
    #[arg(long, default_value_t = false)]
    upnp: bool,
}

struct ChatHost {
    relay: Arc<Mutex<Option<Broadcaster>>>,
}

impl HostHandler for ChatHost {
    fn builder_tcp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        build_tcp(msg_type)
    }

    fn builder_udp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        build_udp(msg_type)
    }

    fn new_client(&mut self, cinfo: &dyn DecodeMessage) -> Decision {
        let Some(cinfo) = cinfo.as_any().downcast_ref::<CinfoShell>() else {
            return Decision::Rejected;
        };
        if cinfo.0.is_empty() || cinfo.0.len() > MAX_NAME_LEN {
            return Decision::Rejected;
        }
        info!(name = cinfo.0.as_str(), "client joined");
        Decision::Accepted { name: ArrayStr::from_str_truncate(&cinfo.0) }
    }

    fn new_packet_tcp(&mut self, from_id: PeerId, inbound: Inbound) {
        let Inbound::Payload { msg_type, message, .. } = inbound else { return };
        if msg_type != CHAT_MSG_TYPE {
            return;
        }
        let Some(chat) = message.as_any().downcast_ref::<ChatShell>() else { return };
        println!("[{from_id}](tcp): {}", chat.0);
        if let Some(relay) = self.relay.lock().unwrap().as_ref() {
            relay.send_tcp(&ChatMsg(chat.0.clone()), from_id, Some(from_id));
        }
    }

    fn new_packet_udp(&mut self, from_id: PeerId, inbound: Inbound) -> bool {
        let Inbound::Payload { msg_type, message, .. } = inbound else { return true };
        if msg_type != CHAT_MSG_TYPE {
            return false;
        }
        let Some(chat) = message.as_any().downcast_ref::<ChatShell>() else { return false };
        println!("[{from_id}](udp): {}", chat.0);
        if let Some(relay) = self.relay.lock().unwrap().as_ref() {
            relay.send_udp(&ChatMsg(chat.0.clone()), from_id, Some(from_id));
        }
        true
    }

    fn on_close_connection(&mut self, id: PeerId, cause: Option<hcnet::Error>) {
        if let Some(cause) = cause {
            warn!(%id, %cause, "client disconnected with error");
        } else {
            info!(%id, "client disconnected");
        }
    }

    fn on_error(&mut self, err: hcnet::Error) {
        warn!(%err, "host error");
    }
}

fn setup_upnp(port: u16) {
    let mut nat = NatHelper::new(port, port, APP_NAME);
    if let Err(err) = nat.discover().and_then(|()| nat.get_valid_igd()).and_then(|()| nat.add_port_mapping()) {
        warn!(%err, "upnp setup failed, continuing without a port mapping");
        return;
    }
    match nat.pull_wan_address() {
        Ok(wan) => info!(lan = ?nat.lan_address(), %wan, "upnp port mapping installed"),
        Err(err) => warn!(%err, "upnp mapping installed but WAN address lookup failed"),
    }
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.upnp {
        setup_upnp(args.port);
    }

    let relay = Arc::new(Mutex::new(None));
    let mut host = Host::new(args.port, HOST_ID, args.max_clients, ChatHost { relay: relay.clone() })?;
    *relay.lock().unwrap() = Some(host.broadcaster());

    host.start()?;
    info!(port = host.local_addr().port(), "waiting for connections");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .expect("failed to install Ctrl-C handler");
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut udp_mode = false;
    print!("> ");
    io::stdout().flush().ok();
    while running.load(Ordering::Acquire) && host.is_running() {
        let Some(Ok(line)) = lines.next() else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.trim() {
            "/mode tcp" => udp_mode = false,
            "/mode udp" => udp_mode = true,
            text => {
                if udp_mode {
                    host.send_udp(&ChatMsg(text.to_string()), HOST_ID, None);
                } else {
                    host.send_tcp(&ChatMsg(text.to_string()), HOST_ID, None);
                }
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    host.stop();
    Ok(())
}
