//! `hcnet`: a small, embeddable client/server session library multiplexing
//! TCP and UDP between one host and up to `max_clients` clients.
//!
//! See `host::Host`/`host::HostHandler` for the server side and
//! `client::Client`/`client::ClientHandler` for the client side. Both sides
//! share the framing codec (`codec`), typed-message traits (`message`), and
//! per-wire read/write pipelines (`wire`).

pub mod buffer;
pub mod client;
pub mod codec;
pub mod error;
pub mod host;
pub mod message;
pub mod queue;
pub mod roster;
pub mod wire;

pub use client::{Client, ClientHandler, RejectReason};
pub use error::{Error, Result};
pub use host::{Broadcaster, Decision, Host, HostHandler};
pub use message::{Builder, DecodeMessage, Inbound, Message, PeerId, admission};
pub use wire::{AcceptedRoster, RosterEntry};
