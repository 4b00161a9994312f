mod file;

use std::collections::HashMap;
use std::fmt;
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, info, warn};

use crate::session::SessionState;
use crate::utils::u32_to_dotted;

/// Readiness of the local speaker, derived from which of AS/router-id are set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigState {
    Init,
    AsOnly,
    IpOnly,
    Ready,
}

impl ConfigState {
    fn from_flags(as_configured: bool, router_id_configured: bool) -> Self {
        match (as_configured, router_id_configured) {
            (false, false) => ConfigState::Init,
            (true, false) => ConfigState::AsOnly,
            (false, true) => ConfigState::IpOnly,
            (true, true) => ConfigState::Ready,
        }
    }
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            ConfigState::Init => "Init",
            ConfigState::AsOnly => "AS configured",
            ConfigState::IpOnly => "Router-ID configured",
            ConfigState::Ready => "Ready",
        };
        write!(f, "{}", word)
    }
}

/// Local speaker parameters
#[derive(Clone, Debug)]
pub struct SpeakerConfig {
    pub local_as: Option<u32>,
    pub router_id: Option<Ipv4Addr>,
    pub max_sessions: usize,
    pub ls_capability: bool,
    pub large_as_capability: bool,
    // Default hold time for peers added without one
    pub hold_time: u16,
    // Seconds an outbound connection keeps retrying before giving up
    pub max_conn_retry_time: u32,
    pub max_conn_retry_count: u32,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    // Destination port for self-initiated connections
    pub peer_port: u16,
    pub dispatch_workers: usize,
    pub barrier_workers: usize,
}

impl SpeakerConfig {
    pub fn state(&self) -> ConfigState {
        ConfigState::from_flags(self.local_as.is_some(), self.router_id.is_some())
    }
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        use file::Defaults;
        Self {
            local_as: None,
            router_id: None,
            max_sessions: Defaults::max_sessions(),
            ls_capability: Defaults::ls_capability(),
            large_as_capability: Defaults::large_as_capability(),
            hold_time: Defaults::hold_time(),
            max_conn_retry_time: Defaults::max_conn_retry_time(),
            max_conn_retry_count: Defaults::max_conn_retry_count(),
            listen_addr: Defaults::listen_addr(),
            listen_port: Defaults::bgp_port(),
            peer_port: Defaults::bgp_port(),
            dispatch_workers: Defaults::dispatch_workers(),
            barrier_workers: Defaults::barrier_workers(),
        }
    }
}

/// In-Memory representation of a configured peer
#[derive(Clone, Debug, PartialEq)]
pub struct PeerConfig {
    pub router_id: IpAddr,
    pub remote_as: u32,
    pub hold_time: u16,
    pub is_ibgp: bool,
    // Local side initiates the TCP connection
    pub self_initiated: bool,
    pub conn_state: SessionState,
}

impl fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Peer {} AS{} {} hold={} state={}>",
            self.router_id,
            u32_to_dotted(self.remote_as, '.'),
            if self.is_ibgp { "iBGP" } else { "eBGP" },
            self.hold_time,
            self.conn_state,
        )
    }
}

/// Speaker configuration and the peer table, shared by sessions and admin callers
#[derive(Debug, Default)]
pub struct BgpConfig {
    speaker: RwLock<SpeakerConfig>,
    peers: Mutex<HashMap<IpAddr, PeerConfig>>,
}

impl BgpConfig {
    pub fn new(speaker: SpeakerConfig) -> Self {
        Self {
            speaker: RwLock::new(speaker),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Parse a TOML config file
    pub fn from_file(path: &str) -> Result<Self> {
        let spec = file::ServerConfigSpec::from_file(path)?;
        Ok(Self::from_spec(spec))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let spec = file::ServerConfigSpec::from_toml(contents)?;
        Ok(Self::from_spec(spec))
    }

    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let speaker = SpeakerConfig {
            local_as: spec.local_as,
            router_id: spec.router_id,
            max_sessions: spec.max_sessions,
            ls_capability: spec.ls_capability,
            large_as_capability: spec.large_as_capability,
            hold_time: spec.hold_time,
            max_conn_retry_time: spec.max_conn_retry_time,
            max_conn_retry_count: spec.max_conn_retry_count,
            listen_addr: spec.listen_addr,
            listen_port: spec.listen_port,
            peer_port: spec.peer_port,
            dispatch_workers: spec.dispatch_workers,
            barrier_workers: spec.barrier_workers,
        };
        let config = Self::new(speaker);
        for peer in spec.peers.iter() {
            if !config.add_peer(peer.remote_ip, peer.remote_as, peer.hold_time) {
                debug!("Skipping duplicate peer {} in config", peer.remote_ip);
                continue;
            }
            if peer.connect {
                config.peers_mut().entry(peer.remote_ip).and_modify(|p| {
                    p.self_initiated = true;
                });
            }
        }
        config
    }

    fn peers_mut(&self) -> MutexGuard<HashMap<IpAddr, PeerConfig>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current speaker parameters
    pub fn speaker(&self) -> SpeakerConfig {
        self.speaker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ConfigState {
        self.speaker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn set_local_as(&self, local_as: u32) {
        {
            let mut speaker = self.speaker.write().unwrap_or_else(PoisonError::into_inner);
            speaker.local_as = Some(local_as);
            info!("Local AS set to {} [{}]", local_as, speaker.state());
        }
        // iBGP/eBGP follows the local AS
        for peer in self.peers_mut().values_mut() {
            peer.is_ibgp = peer.remote_as == local_as;
        }
    }

    pub fn set_router_id(&self, router_id: Ipv4Addr) {
        let mut speaker = self.speaker.write().unwrap_or_else(PoisonError::into_inner);
        speaker.router_id = Some(router_id);
        info!("Router-ID set to {} [{}]", router_id, speaker.state());
    }

    /// Add a peer in Idle state. Returns false (leaving the existing entry as is)
    /// if the router-id is already configured
    pub fn add_peer(&self, router_id: IpAddr, remote_as: u32, hold_time: Option<u16>) -> bool {
        let speaker = self.speaker();
        let mut peers = self.peers_mut();
        if peers.contains_key(&router_id) {
            debug!("Peer {} already configured", router_id);
            return false;
        }
        let hold_time = usable_hold_time(hold_time.unwrap_or(speaker.hold_time));
        let peer = PeerConfig {
            router_id,
            remote_as,
            hold_time,
            is_ibgp: speaker.local_as == Some(remote_as),
            self_initiated: false,
            conn_state: SessionState::Idle,
        };
        info!("Added {}", peer);
        peers.insert(router_id, peer);
        true
    }

    /// Disconnect and delete a peer. Returns false if the peer is unknown
    pub fn remove_peer(&self, router_id: IpAddr) -> bool {
        if !self.disconnect_peer(router_id) {
            return false;
        }
        let removed = self.peers_mut().remove(&router_id).is_some();
        if removed {
            info!("Removed peer {}", router_id);
        }
        removed
    }

    /// Mark a peer as self-initiated and move it to Connect.
    ///   Only Idle peers can be connected; no I/O happens here
    pub fn connect_peer(&self, router_id: IpAddr) -> bool {
        let mut peers = self.peers_mut();
        match peers.get_mut(&router_id) {
            Some(peer) if peer.conn_state == SessionState::Idle => {
                peer.self_initiated = true;
                peer.conn_state = SessionState::Connect;
                true
            }
            Some(peer) => {
                debug!(
                    "Peer {} not connectable in state {}",
                    router_id, peer.conn_state
                );
                false
            }
            None => false,
        }
    }

    /// Clear the self-initiated flag and force the peer back to Idle
    pub fn disconnect_peer(&self, router_id: IpAddr) -> bool {
        let mut peers = self.peers_mut();
        match peers.get_mut(&router_id) {
            Some(peer) => {
                peer.self_initiated = false;
                peer.conn_state = SessionState::Idle;
                true
            }
            None => false,
        }
    }

    pub fn is_peer_configured(&self, router_id: IpAddr) -> bool {
        self.peers_mut().contains_key(&router_id)
    }

    pub fn is_peer_connectable(&self, router_id: IpAddr) -> bool {
        self.get_peer_conn_state(router_id) == SessionState::Idle
    }

    pub fn is_self_initiated(&self, router_id: IpAddr) -> bool {
        self.peers_mut()
            .get(&router_id)
            .map(|peer| peer.self_initiated)
            .unwrap_or(false)
    }

    /// Stored connection state, `Invalid` for an unconfigured peer
    pub fn get_peer_conn_state(&self, router_id: IpAddr) -> SessionState {
        self.peers_mut()
            .get(&router_id)
            .map(|peer| peer.conn_state)
            .unwrap_or(SessionState::Invalid)
    }

    pub fn set_peer_conn_state(&self, router_id: IpAddr, state: SessionState) -> bool {
        match self.peers_mut().get_mut(&router_id) {
            Some(peer) => {
                peer.conn_state = state;
                true
            }
            None => false,
        }
    }

    pub fn peer(&self, router_id: IpAddr) -> Option<PeerConfig> {
        self.peers_mut().get(&router_id).cloned()
    }

    pub fn peers(&self) -> Vec<PeerConfig> {
        self.peers_mut().values().cloned().collect()
    }

    /// Peers currently in `state`
    pub fn count_in_state(&self, state: SessionState) -> usize {
        self.peers_mut()
            .values()
            .filter(|peer| peer.conn_state == state)
            .count()
    }
}

/// Hold time must be zero or at least three seconds (RFC 4271, Section 4.2)
fn usable_hold_time(hold_time: u16) -> u16 {
    match hold_time {
        1 | 2 => {
            warn!("Hold time {}s is not allowed, using 3s", hold_time);
            3
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_config() -> BgpConfig {
        let config = BgpConfig::default();
        config.set_local_as(65000);
        config.set_router_id(Ipv4Addr::new(1, 1, 1, 1));
        config
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_readiness() {
        let config = BgpConfig::default();
        assert_eq!(config.state(), ConfigState::Init);
        config.set_local_as(65000);
        assert_eq!(config.state(), ConfigState::AsOnly);
        config.set_router_id(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(config.state(), ConfigState::Ready);
        // Setting either field again never regresses readiness
        config.set_local_as(65001);
        assert_eq!(config.state(), ConfigState::Ready);
        config.set_router_id(Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(config.state(), ConfigState::Ready);

        let config = BgpConfig::default();
        config.set_router_id(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(config.state(), ConfigState::IpOnly);
        config.set_router_id(Ipv4Addr::new(1, 1, 1, 2));
        assert_eq!(config.state(), ConfigState::IpOnly);
    }

    #[test]
    fn test_add_remove_peers() {
        let config = ready_config();
        let added = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        for peer in added.iter() {
            assert!(config.add_peer(ip(peer), 65001, None));
        }
        assert!(config.remove_peer(ip("10.0.0.2")));
        assert!(config.is_peer_configured(ip("10.0.0.1")));
        assert!(!config.is_peer_configured(ip("10.0.0.2")));
        assert!(config.is_peer_configured(ip("10.0.0.3")));
        assert!(!config.is_peer_configured(ip("10.0.0.4")));
        assert_eq!(config.peers().len(), 2);
        // Unknown peers can't be removed
        assert!(!config.remove_peer(ip("10.0.0.2")));
    }

    #[test]
    fn test_duplicate_peer() {
        let config = ready_config();
        assert!(config.add_peer(ip("10.0.0.1"), 65001, Some(30)));
        assert!(!config.add_peer(ip("10.0.0.1"), 65002, Some(90)));
        let peer = config.peer(ip("10.0.0.1")).unwrap();
        assert_eq!(peer.remote_as, 65001);
        assert_eq!(peer.hold_time, 30);
    }

    #[test]
    fn test_ibgp_peer_lifecycle() {
        let config = ready_config();
        let peer_ip = ip("10.0.0.1");
        assert!(config.add_peer(peer_ip, 65000, None));
        let peer = config.peer(peer_ip).unwrap();
        assert!(peer.is_ibgp);
        assert_eq!(peer.hold_time, 120);
        assert_eq!(peer.conn_state, SessionState::Idle);

        assert!(config.connect_peer(peer_ip));
        assert!(config.is_self_initiated(peer_ip));
        assert!(!config.is_peer_connectable(peer_ip));
        // Already connecting
        assert!(!config.connect_peer(peer_ip));

        assert!(config.disconnect_peer(peer_ip));
        assert!(config.is_peer_connectable(peer_ip));
        assert!(!config.is_self_initiated(peer_ip));

        assert!(config.remove_peer(peer_ip));
        assert!(!config.is_peer_configured(peer_ip));
        assert_eq!(config.get_peer_conn_state(peer_ip), SessionState::Invalid);
    }

    #[test]
    fn test_connectable_follows_state() {
        let config = ready_config();
        let peer_ip = ip("10.0.0.1");
        config.add_peer(peer_ip, 65001, None);
        assert!(!config.peer(peer_ip).unwrap().is_ibgp);
        for state in [
            SessionState::Connect,
            SessionState::Active,
            SessionState::OpenSent,
            SessionState::OpenConfirm,
            SessionState::Established,
        ]
        .iter()
        {
            assert!(config.set_peer_conn_state(peer_ip, *state));
            assert!(!config.is_peer_connectable(peer_ip));
        }
        config.set_peer_conn_state(peer_ip, SessionState::Idle);
        assert!(config.is_peer_connectable(peer_ip));
        assert!(!config.is_peer_connectable(ip("10.9.9.9")));
        assert!(!config.set_peer_conn_state(ip("10.9.9.9"), SessionState::Idle));
    }

    #[test]
    fn test_hold_time_clamped() {
        let config = ready_config();
        config.add_peer(ip("10.0.0.1"), 65001, Some(1));
        config.add_peer(ip("10.0.0.2"), 65001, Some(2));
        config.add_peer(ip("10.0.0.3"), 65001, Some(0));
        config.add_peer(ip("10.0.0.4"), 65001, Some(3));
        assert_eq!(config.peer(ip("10.0.0.1")).unwrap().hold_time, 3);
        assert_eq!(config.peer(ip("10.0.0.2")).unwrap().hold_time, 3);
        assert_eq!(config.peer(ip("10.0.0.3")).unwrap().hold_time, 0);
        assert_eq!(config.peer(ip("10.0.0.4")).unwrap().hold_time, 3);
    }

    #[test]
    fn test_ibgp_follows_local_as() {
        let config = BgpConfig::default();
        config.add_peer(ip("10.0.0.1"), 65000, None);
        assert!(!config.peer(ip("10.0.0.1")).unwrap().is_ibgp);
        config.set_local_as(65000);
        assert!(config.peer(ip("10.0.0.1")).unwrap().is_ibgp);
    }
}
