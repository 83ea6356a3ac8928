//! Daemon configuration, loaded from TOML.
//!
//! ```toml
//! asn = 65000
//! router_id = "10.255.0.1"
//! prefixes = ["10.255.0.1/32"]
//!
//! [[peer]]
//! interface = "swp1"
//! local_address = "10.0.1.0/31"
//! mode = "active"
//! remote_asn = 65001
//! ```

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::Deserialize;

use crate::bgp::fsm::validation::MIN_HOLD_TIME;
use crate::bgp::prefix::Prefix;
use crate::bgp::session::{SessionConfig, DEFAULT_CHANNEL_SIZE, DEFAULT_HOLD_TIME};
use crate::bgp::transport::tcp::BGP_PORT;
use crate::bgp::transport::SessionMode;
use crate::error::ConfigError;

fn default_hold_time() -> u16 {
    DEFAULT_HOLD_TIME
}

fn default_connect_retry_time() -> u64 {
    120
}

fn default_strict_open() -> bool {
    true
}

fn default_port() -> u16 {
    BGP_PORT
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub asn: u16,
    pub router_id: Ipv4Addr,
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    /// Seconds between connection attempts and session restarts.
    #[serde(default = "default_connect_retry_time")]
    pub connect_retry_time: u64,
    #[serde(default = "default_strict_open")]
    pub strict_open: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra locally originated networks, in CIDR form.
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default, rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Interface the peer sits behind; used as the session name.
    pub interface: String,
    /// Our address on the link in CIDR form, e.g. "10.0.1.0/31".
    pub local_address: Option<String>,
    /// Peer address. Derived from `local_address` on /31 and /30 links when omitted.
    pub remote_address: Option<Ipv4Addr>,
    pub mode: Option<SessionMode>,
    /// Expected AS in the peer's OPEN.
    pub remote_asn: Option<u16>,
}

/// This node's identity and the networks it originates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub asn: u16,
    pub router_id: Ipv4Addr,
    /// Connected networks and the local address each is reached through.
    pub connected: Vec<(Prefix, Ipv4Addr)>,
}

/// A peer whose addresses resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    /// Position in the configuration; stable across restarts.
    pub idx: usize,
    pub interface: String,
    pub local_addr: Ipv4Addr,
    pub network: Prefix,
    pub remote_addr: Option<Ipv4Addr>,
    pub mode: SessionMode,
    pub remote_asn: Option<u16>,
}

/// Result of resolving a configuration.
#[derive(Debug)]
pub struct Resolved {
    pub identity: LocalIdentity,
    pub peers: Vec<PeerHandle>,
    /// Peers that were skipped, one error each.
    pub failures: Vec<ConfigError>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.asn == 0 {
            return Err(ConfigError::Invalid {
                field: "asn",
                reason: "must not be 0".to_string(),
            });
        }
        if self.router_id == Ipv4Addr::UNSPECIFIED || self.router_id == Ipv4Addr::BROADCAST {
            return Err(ConfigError::Invalid {
                field: "router_id",
                reason: format!("{} is not a usable identifier", self.router_id),
            });
        }
        if self.hold_time != 0 && self.hold_time < MIN_HOLD_TIME {
            return Err(ConfigError::Invalid {
                field: "hold_time",
                reason: format!("must be 0 or at least {}", MIN_HOLD_TIME),
            });
        }
        for prefix in &self.prefixes {
            prefix.parse::<Prefix>().map_err(|e| ConfigError::Invalid {
                field: "prefixes",
                reason: format!("{}: {}", prefix, e),
            })?;
        }
        Ok(())
    }

    pub fn connect_retry_time(&self) -> Duration {
        Duration::from_secs(self.connect_retry_time)
    }

    /// Resolve every peer. `default_mode` applies to peers without a `mode`;
    /// with neither, peers dial out.
    ///
    /// A peer that fails to resolve is reported in `failures` and skipped.
    /// It is only fatal when nothing is left to originate.
    pub fn resolve(&self, default_mode: Option<SessionMode>) -> Result<Resolved, ConfigError> {
        let mut connected = Vec::new();
        let mut peers = Vec::new();
        let mut failures = Vec::new();

        for (idx, peer) in self.peers.iter().enumerate() {
            match peer.resolve(idx, default_mode) {
                Ok(handle) => {
                    connected.push((handle.network, handle.local_addr));
                    peers.push(handle);
                }
                Err(e) => failures.push(e),
            }
        }

        for prefix in &self.prefixes {
            let prefix = prefix.parse::<Prefix>().map_err(|e| ConfigError::Invalid {
                field: "prefixes",
                reason: format!("{}: {}", prefix, e),
            })?;
            connected.push((prefix, self.router_id));
        }

        if connected.is_empty() {
            return Err(ConfigError::NoLocalAddress);
        }

        Ok(Resolved {
            identity: LocalIdentity {
                asn: self.asn,
                router_id: self.router_id,
                connected,
            },
            peers,
            failures,
        })
    }

    /// Session parameters for one resolved peer.
    pub fn session_config(&self, peer: &PeerHandle) -> SessionConfig {
        let mut config = SessionConfig::new(
            peer.idx,
            peer.interface.clone(),
            peer.mode,
            self.asn,
            self.router_id,
            peer.local_addr,
        );
        config.peer_asn = peer.remote_asn;
        config.hold_time = self.hold_time;
        config.connect_retry_time = self.connect_retry_time();
        config.strict_open = self.strict_open;
        config.channel_size = DEFAULT_CHANNEL_SIZE;
        config
    }
}

impl PeerConfig {
    fn resolve(&self, idx: usize, default_mode: Option<SessionMode>) -> Result<PeerHandle, ConfigError> {
        let fail = |reason: String| ConfigError::Peer {
            peer: self.interface.clone(),
            reason,
        };

        let local = self
            .local_address
            .as_deref()
            .ok_or_else(|| fail("no local_address".to_string()))?;
        let network: Ipv4Network = local
            .parse()
            .map_err(|e| fail(format!("invalid local_address {}: {}", local, e)))?;
        let local_addr = network.ip();
        if local_addr.is_loopback() || local_addr.is_unspecified() {
            return Err(fail(format!("{} is not a usable peering address", local_addr)));
        }

        let mode = self.mode.or(default_mode).unwrap_or(SessionMode::Active);
        let remote_addr = self.remote_address.or_else(|| link_peer(network));
        if mode == SessionMode::Active && remote_addr.is_none() {
            return Err(fail(
                "active peer needs remote_address on links wider than /30".to_string(),
            ));
        }

        Ok(PeerHandle {
            idx,
            interface: self.interface.clone(),
            local_addr,
            network: network.into(),
            remote_addr,
            mode,
            remote_asn: self.remote_asn,
        })
    }
}

/// The other end of a point-to-point link: the sibling address on a /31, the
/// other host address on a /30.
fn link_peer(network: Ipv4Network) -> Option<Ipv4Addr> {
    let addr = u32::from(network.ip());
    match network.prefix() {
        31 => Some(Ipv4Addr::from(addr ^ 1)),
        30 => match addr & 0b11 {
            1 => Some(Ipv4Addr::from(addr + 1)),
            2 => Some(Ipv4Addr::from(addr - 1)),
            _ => None,
        },
        _ => None,
    }
}
