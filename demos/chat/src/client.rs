//! `chat-client`: connects to a `chat-host` and relays typed chat lines.
//! Ported from the original's `chat_cmd/src/client.cpp` sample.

use std::{
    io::{self, BufRead, Write},
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use hcnet::{AcceptedRoster, Client, ClientHandler, DecodeMessage, Inbound, PeerId, RejectReason};
use hcnet_chat_demo::{CHAT_MSG_TYPE, CINFO_MSG_TYPE, CinfoMsg, CinfoShell, ChatMsg, ChatShell, DEFAULT_PORT, build_tcp, build_udp};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "chat-client", about = "hcnet chat demo client")]
struct Args {
    /// Address of the chat-host to connect to.
    #[arg(long)]
    host: IpAddr,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Name to register under; rejected if another live client already
    /// holds it.
    #[arg(long)]
    name: String,
}

struct ChatClient {
    roster_names: std::collections::BTreeMap<PeerId, String>,
}

impl ClientHandler for ChatClient {
    fn builder_tcp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        build_tcp(msg_type)
    }

    fn builder_udp(&self, msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
        build_udp(msg_type)
    }

    fn new_packet_tcp(&mut self, from_id: PeerId, inbound: Inbound) {
        match inbound {
            Inbound::Payload { msg_type, message, .. } if msg_type == CINFO_MSG_TYPE => {
                if let Some(cinfo) = message.as_any().downcast_ref::<CinfoShell>() {
                    info!(name = cinfo.0.as_str(), id = from_id, "client joined the session");
                    self.roster_names.insert(from_id, cinfo.0.clone());
                }
            }
            Inbound::Payload { msg_type, message, .. } if msg_type == CHAT_MSG_TYPE => {
                if let Some(chat) = message.as_any().downcast_ref::<ChatShell>() {
                    println!("[{}](tcp): {}", self.display_name(from_id), chat.0);
                }
            }
            Inbound::HeaderOnly { msg_type } if msg_type == hcnet::host::CLIENT_DISCONNECT_MSG_TYPE => {
                info!(id = from_id, name = self.display_name(from_id), "client left the session");
                self.roster_names.remove(&from_id);
            }
            _ => {}
        }
    }

    fn new_packet_udp(&mut self, from_id: PeerId, inbound: Inbound) -> bool {
        let Inbound::Payload { msg_type, message, .. } = inbound else { return true };
        if msg_type != CHAT_MSG_TYPE {
            return false;
        }
        let Some(chat) = message.as_any().downcast_ref::<ChatShell>() else { return false };
        println!("[{}](udp): {}", self.display_name(from_id), chat.0);
        true
    }

    fn on_connected(&mut self, roster: AcceptedRoster) {
        for entry in &roster.entries {
            self.roster_names.insert(entry.id, entry.name.clone());
        }
        let names: Vec<_> = roster.entries.iter().map(|e| e.name.as_str()).collect();
        info!(max_clients = roster.max_clients, users = ?names, "session ready");
    }

    fn on_rejected(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::DuplicateName => warn!("name is already in use"),
            RejectReason::ServerFull => warn!("server is full, connection denied"),
            RejectReason::HandshakeFailed => warn!("handshake with the host failed"),
        }
    }

    fn on_close_connection(&mut self, cause: Option<hcnet::Error>) {
        match cause {
            Some(cause) => warn!(%cause, "host disconnected with an error"),
            None => info!("host disconnected"),
        }
        self.roster_names.clear();
    }

    fn on_error(&mut self, err: hcnet::Error) {
        warn!(%err, "client error");
    }
}

impl ChatClient {
    fn display_name(&self, id: PeerId) -> String {
        self.roster_names.get(&id).cloned().unwrap_or_else(|| format!("#{id}"))
    }
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let handler = ChatClient { roster_names: std::collections::BTreeMap::new() };
    let mut client = Client::new(handler);
    client.start(args.host, args.port, &CinfoMsg(args.name))?;
    info!("waiting for connection...");

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
    while running.load(Ordering::Acquire) && client.is_connected() {
        let Some(Ok(line)) = lines.next() else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.trim() {
            "/mode tcp" => udp_mode = false,
            "/mode udp" => udp_mode = true,
            text => {
                if udp_mode {
                    client.send_udp(&ChatMsg(text.to_string()));
                } else {
                    client.send_tcp(&ChatMsg(text.to_string()));
                }
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    client.stop();
    Ok(())
}
