use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};

use serde::{self, Deserialize};
use toml;

pub(super) struct Defaults {}

impl Defaults {
    pub(super) fn hold_time() -> u16 {
        120
    }

    pub(super) fn ls_capability() -> bool {
        true
    }

    pub(super) fn large_as_capability() -> bool {
        false
    }

    pub(super) fn max_sessions() -> usize {
        32
    }

    pub(super) fn max_conn_retry_time() -> u32 {
        120
    }

    pub(super) fn max_conn_retry_count() -> u32 {
        5
    }

    pub(super) fn listen_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub(super) fn bgp_port() -> u16 {
        179
    }

    pub(super) fn dispatch_workers() -> usize {
        32
    }

    pub(super) fn barrier_workers() -> usize {
        4
    }
}

/// Config (toml) representation of a Peer Config
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    pub(super) remote_ip: IpAddr,
    pub(super) remote_as: u32,
    // Will defer to server hold_time if not provided
    pub(super) hold_time: Option<u16>,
    // Initiate the TCP session once the speaker starts
    #[serde(default)]
    pub(super) connect: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Speaker stays unready until both of these are set
    pub(super) router_id: Option<Ipv4Addr>,
    pub(super) local_as: Option<u32>,
    // Will send keepalives every 1/3rd of the negotiated value
    #[serde(default = "Defaults::hold_time")]
    pub(super) hold_time: u16,
    #[serde(default = "Defaults::ls_capability")]
    pub(super) ls_capability: bool,
    // Require 4-octet AS support from peers
    #[serde(default = "Defaults::large_as_capability")]
    pub(super) large_as_capability: bool,
    #[serde(default = "Defaults::max_sessions")]
    pub(super) max_sessions: usize,
    #[serde(default = "Defaults::max_conn_retry_time")]
    pub(super) max_conn_retry_time: u32,
    #[serde(default = "Defaults::max_conn_retry_count")]
    pub(super) max_conn_retry_count: u32,
    #[serde(default = "Defaults::listen_addr")]
    pub(super) listen_addr: IpAddr,
    #[serde(default = "Defaults::bgp_port")]
    pub(super) listen_port: u16,
    #[serde(default = "Defaults::bgp_port")]
    pub(super) peer_port: u16,
    #[serde(default = "Defaults::dispatch_workers")]
    pub(super) dispatch_workers: usize,
    #[serde(default = "Defaults::barrier_workers")]
    pub(super) barrier_workers: usize,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_toml(&contents)
    }

    pub(super) fn from_toml(contents: &str) -> io::Result<Self> {
        let spec: Self = toml::from_str(contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        spec.validate()?;
        Ok(spec)
    }

    // Hold times of 1 or 2 seconds are never valid
    fn validate(&self) -> io::Result<()> {
        let invalid = |hold_time: u16| hold_time == 1 || hold_time == 2;
        if invalid(self.hold_time) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("hold_time {} must be 0 or >= 3", self.hold_time),
            ));
        }
        for peer in self.peers.iter() {
            if peer.hold_time.map_or(false, invalid) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: hold_time must be 0 or >= 3", peer.remote_ip),
                ));
            }
        }
        Ok(())
    }
}
