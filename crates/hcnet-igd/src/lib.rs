//! NAT traversal helper (spec §4.8): a thin state machine over the IGD
//! protocol. `discover()` broadcasts an SSDP probe, `get_valid_igd()` settles
//! on the gateway and records the LAN-facing address, `add_port_mapping()`
//! installs a permanent mapping on both TCP and UDP (the wire protocol
//! always needs both ports forwarded together), `pull_wan_address()` reports
//! the external address, and `port_mapping_exists()` checks the gateway's
//! mapping table for both.
//!
//! Grounded on the real `igd_next` crate's synchronous `search_gateway`/
//! `Gateway` API; the original source's `Upnp` class (built on libminiupnpc)
//! splits `Discover` from `GetValidIGD` because SSDP discovery and IGD
//! selection are two separate calls in that library. `igd_next::search_gateway`
//! folds both into one network round-trip, so `get_valid_igd()` here performs
//! no further IGD negotiation — it settles on the gateway `discover()` already
//! found and resolves the LAN address used to reach it.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::Duration,
};

use igd_next::{Gateway, PortMappingProtocol, SearchOptions, SearchError};
use tracing::debug;

const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Error taxonomy for the NAT helper (spec §7). Every variant keeps its
/// underlying cause, if any, behind `#[source]`.
#[derive(Debug, thiserror::Error)]
pub enum IgdError {
    #[error("IGD discovery failed")]
    Discover(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("no IGD has been discovered yet")]
    IgdNotFound,

    #[error("IGD was found but is not connected to the WAN")]
    IgdNotConnected(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("device answered but does not implement an IGD service")]
    UpnpWithoutIgd,

    #[error("failed to add port mapping")]
    PortMapping(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to pull WAN address")]
    PullWanAddress(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("unspecified UPnP/IGD error")]
    Unspecified(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, IgdError>;

/// Which transport protocol a port mapping applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn to_igd(self) -> PortMappingProtocol {
        match self {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// Both transports a `hcnet` host listens on. `add_port_mapping` installs one
/// mapping per protocol, since the wire protocol always needs its TCP and
/// UDP ports reachable together (spec §4.8 "AddPortMapping ... both TCP and
/// UDP").
const BOTH_PROTOCOLS: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

/// A NAT-traversal session for one `(wan_port, lan_port, description)` pair,
/// mapped on both TCP and UDP. Holds the discovered gateway and the
/// addresses it has learned so far; none of the querying methods are
/// retried internally — callers own the retry policy, matching the core
/// library's "errors terminate, they are not retried" propagation rule
/// (spec §7).
pub struct NatHelper {
    wan_port: u16,
    lan_port: u16,
    description: String,
    gateway: Option<Gateway>,
    lan_address: Option<Ipv4Addr>,
    wan_address: Option<Ipv4Addr>,
}

impl NatHelper {
    pub fn new(wan_port: u16, lan_port: u16, description: impl Into<String>) -> Self {
        Self {
            wan_port,
            lan_port,
            description: description.into(),
            gateway: None,
            lan_address: None,
            wan_address: None,
        }
    }

    pub fn lan_address(&self) -> Option<Ipv4Addr> {
        self.lan_address
    }

    pub fn wan_address(&self) -> Option<Ipv4Addr> {
        self.wan_address
    }

    /// Broadcasts an SSDP probe with a 2-second budget and keeps the first
    /// IGD that answers.
    pub fn discover(&mut self) -> Result<()> {
        let options = SearchOptions { timeout: Some(DISCOVERY_TIMEOUT), ..Default::default() };
        let gateway = igd_next::search_gateway(options).map_err(classify_search_error)?;
        debug!(addr = %gateway.addr, "discovered IGD");
        self.gateway = Some(gateway);
        Ok(())
    }

    /// Settles on the gateway found by `discover()` and records the local
    /// address used to reach it, by connecting a throwaway UDP socket to
    /// the gateway's control address and reading back its local endpoint.
    pub fn get_valid_igd(&mut self) -> Result<()> {
        let gateway = self.gateway.as_ref().ok_or(IgdError::IgdNotFound)?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.connect(SocketAddr::V4(gateway.addr)).map(|()| socket))
            .map_err(|err| IgdError::IgdNotConnected(Box::new(err)))?;
        let lan_addr = match socket.local_addr().map_err(|err| IgdError::IgdNotConnected(Box::new(err)))?.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => return Err(IgdError::UpnpWithoutIgd),
        };
        self.lan_address = Some(lan_addr);
        Ok(())
    }

    /// Installs a permanent (lease = 0) mapping for the configured WAN/LAN
    /// ports on both TCP and UDP, forwarding to the LAN address
    /// `get_valid_igd` resolved.
    pub fn add_port_mapping(&self) -> Result<()> {
        let gateway = self.gateway.as_ref().ok_or(IgdError::IgdNotFound)?;
        let lan_address = self.lan_address.ok_or(IgdError::IgdNotFound)?;
        for protocol in BOTH_PROTOCOLS {
            gateway
                .add_port(
                    protocol.to_igd(),
                    self.wan_port,
                    SocketAddrV4::new(lan_address, self.lan_port),
                    0,
                    &self.description,
                )
                .map_err(|err| IgdError::PortMapping(Box::new(err)))?;
        }
        Ok(())
    }

    /// Queries the IGD for the router's external address.
    pub fn pull_wan_address(&mut self) -> Result<Ipv4Addr> {
        let gateway = self.gateway.as_ref().ok_or(IgdError::IgdNotFound)?;
        let addr = gateway.get_external_ip().map_err(|err| IgdError::PullWanAddress(Box::new(err)))?;
        self.wan_address = Some(addr);
        Ok(addr)
    }

    /// Iterates the IGD's port mapping table and checks that both the TCP
    /// and the UDP mapping `add_port_mapping` installs are present, matched
    /// by `(wan_port, lan_port, description, protocol)`. Returns `false` on
    /// any lookup error, matching the original's "no more entries" bail-out
    /// for any non-zero status.
    pub fn port_mapping_exists(&self) -> bool {
        let Some(gateway) = self.gateway.as_ref() else { return false };
        let mut seen = [false; BOTH_PROTOCOLS.len()];
        for index in 0.. {
            let Ok(entry) = gateway.get_generic_port_mapping_entry(index) else { break };
            if entry.external_port != self.wan_port
                || entry.internal_port != self.lan_port
                || entry.description != self.description
            {
                continue;
            }
            for (slot, protocol) in seen.iter_mut().zip(BOTH_PROTOCOLS) {
                if entry.protocol == protocol.to_igd() {
                    *slot = true;
                }
            }
        }
        seen.iter().all(|&found| found)
    }
}

fn classify_search_error(err: SearchError) -> IgdError {
    match err {
        SearchError::HttpError(_) | SearchError::InvalidResponse(_) | SearchError::XmlError(_) => {
            IgdError::UpnpWithoutIgd
        }
        other => IgdError::Discover(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_before_discovery_fail_cleanly() {
        let mut helper = NatHelper::new(7777, 7777, "hcnet");
        assert!(matches!(helper.get_valid_igd(), Err(IgdError::IgdNotFound)));
        assert!(matches!(helper.add_port_mapping(), Err(IgdError::IgdNotFound)));
        assert!(matches!(helper.pull_wan_address(), Err(IgdError::IgdNotFound)));
        assert!(!helper.port_mapping_exists());
    }

    #[test]
    fn protocol_maps_to_igd_next_variants() {
        assert_eq!(Protocol::Tcp.to_igd(), PortMappingProtocol::TCP);
        assert_eq!(Protocol::Udp.to_igd(), PortMappingProtocol::UDP);
    }
}
