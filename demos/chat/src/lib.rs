//! Message types shared by `chat-host` and `chat-client` (ported from the
//! original `chat_cmd` sample's `Messages.hpp`: `client_info`, `host_info`
//! are already provided by `hcnet` as the admission handshake and
//! `AcceptedRoster`; only the application-level `chat_msg`/disconnect
//! announcement need a demo-local encoding).

use hcnet::{DecodeMessage, Message};

/// Client-info (admission) and chat messages use these `msg_type`s; both
/// must avoid `hcnet::message::admission`'s reserved `0..=2` range.
pub const CINFO_MSG_TYPE: i16 = 9;
pub const CHAT_MSG_TYPE: i16 = 10;

/// The handshake payload a connecting client sends: just its chosen name
/// (ported from `chat_cmd`'s `client_info`). The host also re-broadcasts
/// this frame verbatim to existing clients on admission (spec §4.6 point
/// 3), so both sides register a builder for it.
#[derive(Debug, Clone)]
pub struct CinfoMsg(pub String);

impl Message for CinfoMsg {
    fn msg_type(&self) -> i16 {
        CINFO_MSG_TYPE
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.0.as_bytes());
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct CinfoShell(pub String);

impl DecodeMessage for CinfoShell {
    fn decode(&mut self, payload: &[u8]) -> bool {
        match std::str::from_utf8(payload) {
            Ok(s) => {
                self.0 = s.to_string();
                true
            }
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A plain UTF-8 chat line. Encoded as raw bytes with no length prefix of
/// its own — the wire header already carries `size`.
#[derive(Debug, Clone)]
pub struct ChatMsg(pub String);

impl Message for ChatMsg {
    fn msg_type(&self) -> i16 {
        CHAT_MSG_TYPE
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.0.as_bytes());
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Empty shell a `Builder` hands back for `CHAT_MSG_TYPE`; filled in by
/// `decode`.
#[derive(Debug, Default, Clone)]
pub struct ChatShell(pub String);

impl DecodeMessage for ChatShell {
    fn decode(&mut self, payload: &[u8]) -> bool {
        match std::str::from_utf8(payload) {
            Ok(s) => {
                self.0 = s.to_string();
                true
            }
            Err(_) => false,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Builder shared by both the host's and the client's TCP side: it must
/// recognize `CINFO_MSG_TYPE` too, since a join announcement reuses the raw
/// client-info frame (spec §4.6 point 3).
pub fn build_tcp(msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
    match msg_type {
        CINFO_MSG_TYPE => Some(Box::new(CinfoShell::default())),
        CHAT_MSG_TYPE => Some(Box::new(ChatShell::default())),
        _ => None,
    }
}

/// The UDP side never carries a client-info frame.
pub fn build_udp(msg_type: i16) -> Option<Box<dyn DecodeMessage>> {
    (msg_type == CHAT_MSG_TYPE).then(|| Box::new(ChatShell::default()) as Box<dyn DecodeMessage>)
}

pub const APP_NAME: &str = "hcnet chat demo";
pub const DEFAULT_PORT: u16 = 9180;
pub const MAX_NAME_LEN: usize = 64;
