use std::cmp;
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use bgp_rs::{Message, Open, OpenCapability, OpenParameter, AFI, SAFI};
use log::{debug, info, warn};

use super::codec::Incoming;
use super::decode::LinkStateUpdate;
use super::{SessionError, SessionState, BGP_LS_AFI, BGP_LS_SAFI};
use crate::config::BgpConfig;
use crate::utils::u32_to_dotted;

const BGP_VERSION: u8 = 4;
// RFC 6793
const AS_TRANS: u16 = 23456;

/// AFI/SAFI for BGP-LS (RFC 7752), if bgp-rs can represent it
fn link_state_family() -> Option<(AFI, SAFI)> {
    let afi = AFI::try_from(BGP_LS_AFI).ok()?;
    let safi = SAFI::try_from(BGP_LS_SAFI).ok()?;
    Some((afi, safi))
}

/// Local values a session negotiates with
#[derive(Clone, Debug, PartialEq)]
pub struct SessionParams {
    pub peer: IpAddr,
    pub local_as: u32,
    pub router_id: Ipv4Addr,
    pub remote_as: u32,
    pub hold_time: u16,
    pub is_ibgp: bool,
    pub ls_capability: bool,
    pub large_as_capability: bool,
}

impl SessionParams {
    /// Snapshot for a configured peer, None until the speaker is ready
    pub fn from_config(config: &BgpConfig, peer: IpAddr) -> Option<Self> {
        let speaker = config.speaker();
        let peer_config = config.peer(peer)?;
        Some(Self {
            peer,
            local_as: speaker.local_as?,
            router_id: speaker.router_id?,
            remote_as: peer_config.remote_as,
            hold_time: peer_config.hold_time,
            is_ibgp: peer_config.is_ibgp,
            ls_capability: speaker.ls_capability,
            large_as_capability: speaker.large_as_capability,
        })
    }
}

/// Peer details learned from its OPEN, fixed for the life of a session
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub remote_id: Ipv4Addr,
    pub remote_version: u8,
    pub remote_as: u32,
    pub remote_hold_time: u16,
    // min(local, remote); 0 disables keepalives and hold expiry
    pub negotiated_hold_time: u16,
    pub is_ibgp: bool,
    pub ls_capability: bool,
    pub four_octet_as: bool,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<SessionInfo {} AS{} v{} hold={} ls={} 4-octet={}>",
            self.remote_id,
            u32_to_dotted(self.remote_as, '.'),
            self.remote_version,
            self.negotiated_hold_time,
            self.ls_capability,
            self.four_octet_as,
        )
    }
}

#[derive(Debug)]
pub enum FsmResponse {
    /// Valid OPEN in OpenSent, reply and restart the hold timer
    Opened { reply: Message, hold_time: u16 },
    /// KEEPALIVE in OpenConfirm
    Established,
    /// UPDATE to hand to the link-state decoder
    Update(LinkStateUpdate),
    Empty,
}

/// BGP finite state machine for one peer
///   Every transition is written back to the config store
pub struct Fsm {
    params: SessionParams,
    state: SessionState,
    info: Option<SessionInfo>,
    config: Arc<BgpConfig>,
}

impl Fsm {
    pub fn new(params: SessionParams, config: Arc<BgpConfig>) -> Self {
        Self {
            params,
            state: SessionState::Idle,
            info: None,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    fn update_state(&mut self, new_state: SessionState) {
        if self.state == new_state {
            return;
        }
        debug!(
            "{} went from {} to {}",
            self.params.peer, self.state, new_state
        );
        self.state = new_state;
        if !self.config.set_peer_conn_state(self.params.peer, new_state) {
            debug!("{} no longer configured", self.params.peer);
        }
    }

    fn unexpected(&self) -> SessionError {
        SessionError::FiniteStateMachine(fsm_err_for_state(self.state))
    }

    /// Start (or retry) a connection: Idle/Active -> Connect
    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Active | SessionState::Connect => {
                self.update_state(SessionState::Connect);
                Ok(())
            }
            _ => Err(self.unexpected()),
        }
    }

    /// TCP attempt failed: Connect -> Active
    pub fn connect_failed(&mut self) {
        if self.state == SessionState::Connect {
            self.update_state(SessionState::Active);
        }
    }

    /// TCP is up, returns the OPEN to send: Connect -> OpenSent
    pub fn tcp_established(&mut self) -> Result<Open, SessionError> {
        if self.state != SessionState::Connect {
            return Err(self.unexpected());
        }
        self.update_state(SessionState::OpenSent);
        Ok(self.create_open())
    }

    pub fn receive(&mut self, message: impl Into<Incoming>) -> Result<FsmResponse, SessionError> {
        use Incoming::Message as Msg;
        use SessionState::*;
        match (self.state, message.into()) {
            (_, Msg(Message::Notification(notification))) => {
                warn!("{} NOTIFICATION: {}", self.params.peer, notification);
                Err(SessionError::NotificationReceived(notification))
            }
            (OpenSent, Msg(Message::Open(open))) => {
                let info = validate_open(&self.params, &open)?;
                debug!("[{}] Received OPEN: {}", self.params.peer, info);
                let hold_time = info.negotiated_hold_time;
                self.info = Some(info);
                self.update_state(OpenConfirm);
                Ok(FsmResponse::Opened {
                    reply: Message::KeepAlive,
                    hold_time,
                })
            }
            (OpenConfirm, Msg(Message::KeepAlive)) => {
                self.update_state(Established);
                info!("Session established with {}", self.params.peer);
                Ok(FsmResponse::Established)
            }
            (Established, Msg(Message::KeepAlive)) => Ok(FsmResponse::Empty),
            (Established, Incoming::Update(update)) => Ok(FsmResponse::Update(update)),
            (Established, Msg(Message::Update(update))) => {
                Ok(FsmResponse::Update(LinkStateUpdate::new(update)))
            }
            // Nothing is ever advertised, so there is nothing to refresh
            (Established, Msg(Message::RouteRefresh(_))) => Ok(FsmResponse::Empty),
            _ => Err(self.unexpected()),
        }
    }

    /// Session is over for any reason, back to Idle
    pub fn stop(&mut self) {
        self.info = None;
        self.update_state(SessionState::Idle);
    }

    pub fn create_open(&self) -> Open {
        let mut capabilities = vec![OpenCapability::FourByteASN(self.params.local_as)];
        if self.params.ls_capability {
            match link_state_family() {
                Some(family) => capabilities.push(OpenCapability::MultiProtocol(family)),
                None => warn!("BGP-LS family unavailable, not advertising it"),
            }
        }
        let two_byte_asn = if self.params.local_as < 65535 {
            self.params.local_as as u16
        } else {
            AS_TRANS
        };
        Open {
            version: BGP_VERSION,
            peer_asn: two_byte_asn,
            hold_timer: self.params.hold_time,
            identifier: u32::from(self.params.router_id),
            parameters: vec![OpenParameter::Capabilities(capabilities)],
        }
    }
}

impl fmt::Display for Fsm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Fsm {} state={}>", self.params.peer, self.state)
    }
}

fn fsm_err_for_state(state: SessionState) -> u8 {
    use SessionState::*;
    match state {
        OpenSent => 1,
        OpenConfirm => 2,
        Established => 3,
        _ => 0,
    }
}

fn open_capabilities(open: &Open) -> impl Iterator<Item = &OpenCapability> {
    open.parameters
        .iter()
        .filter_map(|p| match p {
            OpenParameter::Capabilities(caps) => Some(caps.iter()),
            _ => None,
        })
        .flatten()
}

/// 4-octet AS from the capability, if advertised
fn four_octet_asn(open: &Open) -> Option<u32> {
    open_capabilities(open).find_map(|c| match c {
        OpenCapability::FourByteASN(asn) => Some(*asn),
        _ => None,
    })
}

fn has_link_state(open: &Open) -> bool {
    let family = match link_state_family() {
        Some(family) => family,
        None => return false,
    };
    open_capabilities(open).any(|c| match c {
        OpenCapability::MultiProtocol(advertised) => *advertised == family,
        _ => false,
    })
}

/// Check a received OPEN against the peer config
///   Checks run in order: version, identifier, AS, hold time, capabilities
pub fn validate_open(params: &SessionParams, open: &Open) -> Result<SessionInfo, SessionError> {
    if open.version != BGP_VERSION {
        return Err(SessionError::UnsupportedVersion(open.version));
    }

    let remote_id = Ipv4Addr::from(open.identifier);
    if remote_id.is_unspecified() || remote_id.is_multicast() {
        return Err(SessionError::BadBgpIdentifier(remote_id));
    }

    let cap_asn = four_octet_asn(open);
    let remote_as = match cap_asn {
        Some(asn) if asn > u32::from(u16::MAX) => {
            if open.peer_asn != AS_TRANS {
                return Err(SessionError::OpenAsnMismatch(
                    u32::from(open.peer_asn),
                    u32::from(AS_TRANS),
                ));
            }
            asn
        }
        Some(asn) => {
            if asn != u32::from(open.peer_asn) {
                return Err(SessionError::OpenAsnMismatch(u32::from(open.peer_asn), asn));
            }
            asn
        }
        None => u32::from(open.peer_asn),
    };
    if remote_as != params.remote_as {
        return Err(SessionError::OpenAsnMismatch(remote_as, params.remote_as));
    }

    if open.hold_timer == 1 || open.hold_timer == 2 {
        return Err(SessionError::UnacceptableHoldTime(open.hold_timer));
    }

    let peer_ls = has_link_state(open);
    if params.ls_capability && !peer_ls {
        return Err(SessionError::UnsupportedCapability("BGP-LS"));
    }
    if params.large_as_capability && cap_asn.is_none() {
        return Err(SessionError::UnsupportedCapability("4-octet AS"));
    }

    Ok(SessionInfo {
        remote_id,
        remote_version: open.version,
        remote_as,
        remote_hold_time: open.hold_timer,
        negotiated_hold_time: cmp::min(params.hold_time, open.hold_timer),
        is_ibgp: params.is_ibgp,
        ls_capability: params.ls_capability && peer_ls,
        four_octet_as: cap_asn.is_some(),
    })
}
