mod codec;
mod decode;
mod fsm;
mod hold_timer;
mod manager;
mod message_counts;
mod peer;
mod poller;
mod session;

use std::convert::From;
use std::error;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use bgp_rs::Notification;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};

pub use codec::{Incoming, MessageCodec, MessageProtocol};
pub use decode::{
    IgnoreLinkState, LinkStateDecoder, LinkStateUpdate, MpReach, MpUnreach, Rfc7752Decoder,
};
pub use fsm::{Fsm, FsmResponse, SessionInfo, SessionParams};
use hold_timer::HoldTimer;
pub use manager::SessionManager;
pub use message_counts::PacketStats;
pub use session::{Session, SessionEnd};

use crate::rib::SharedRib;

// RFC 7752 address family
pub(crate) const BGP_LS_AFI: u16 = 16388;
pub(crate) const BGP_LS_SAFI: u8 = 71;
pub(crate) const BGP_LS_VPN_SAFI: u8 = 72;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    // Reported for peers that aren't configured
    Invalid,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
            SessionState::Invalid => "Invalid",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer De-configured
    Deconfigured,
    /// Administratively disconnected or speaker shutting down
    AdminShutdown,
    /// Connection refused by the listener (not ready, unknown peer, too many sessions)
    ConnectionRejected,
    /// Closed in favor of the other connection with the same peer
    ConnectionCollision,
    /// Message header failed validation. [minor_err_code, data]
    MessageHeader(u8, Vec<u8>),
    /// OPEN could not be decoded. [reason]
    MalformedOpen(String),
    /// Received an unsupported BGP version. [received]
    UnsupportedVersion(u8),
    /// Received an unusable BGP Identifier. [received]
    BadBgpIdentifier(Ipv4Addr),
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Hold time in OPEN is 1 or 2 seconds. [received]
    UnacceptableHoldTime(u16),
    /// A required capability is missing from the OPEN. [capability]
    UnsupportedCapability(&'static str),
    /// Finite State Machine error, unexpected transition [minor_err_codes]
    FiniteStateMachine(u8),
    /// Hold time expired. [interval]
    HoldTimeExpired(u16),
    /// UPDATE could not be turned into RIB changes. [minor_err_code, reason]
    MalformedUpdate(u8, String),
    /// Peer sent a NOTIFICATION. [notification]
    NotificationReceived(Notification),
    /// Something happened in transport. [reason]
    TransportError(String),
    /// Received bytes could not be decoded as a BGP message. [reason]
    CodecError(String),
    /// Some other issue happened. [reason]
    Other(String),
}

impl SessionError {
    /// NOTIFICATION to send before closing the connection, if any
    pub fn notification(&self) -> Option<Notification> {
        use SessionError::*;
        let (major, minor, data) = match self {
            MessageHeader(minor, data) => (1, *minor, data.clone()),
            MalformedOpen(_) => (2, 0, vec![]),
            UnsupportedVersion(_) => (2, 1, vec![0, 4]),
            OpenAsnMismatch(_, _) => (2, 2, vec![]),
            BadBgpIdentifier(_) => (2, 3, vec![]),
            UnacceptableHoldTime(_) => (2, 6, vec![]),
            UnsupportedCapability(_) => (2, 7, vec![]),
            MalformedUpdate(minor, _) => (3, *minor, vec![]),
            HoldTimeExpired(_) => (4, 0, vec![]),
            FiniteStateMachine(minor) => (5, *minor, vec![]),
            AdminShutdown => (6, 2, vec![]),
            Deconfigured => (6, 3, vec![]),
            ConnectionRejected => (6, 5, vec![]),
            ConnectionCollision => (6, 7, vec![]),
            NotificationReceived(_) | TransportError(_) | CodecError(_) | Other(_) => {
                return None
            }
        };
        Some(Notification {
            major_err_code: major,
            minor_err_code: minor,
            data,
        })
    }

    /// Session was ended on purpose by the local side
    pub fn is_admin(&self) -> bool {
        matches!(self, SessionError::AdminShutdown | SessionError::Deconfigured)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer De-configured")?,
            AdminShutdown => write!(f, "Administrative shutdown")?,
            ConnectionRejected => write!(f, "Connection rejected")?,
            ConnectionCollision => write!(f, "Connection collision resolved")?,
            MessageHeader(minor, data) => write!(f, "Message header err [{}] {:?}", minor, data)?,
            MalformedOpen(r) => write!(f, "Malformed OPEN: {}", r)?,
            UnsupportedVersion(v) => write!(f, "Unsupported BGP version {}", v)?,
            BadBgpIdentifier(id) => write!(f, "Bad BGP Identifier {}", id)?,
            OpenAsnMismatch(r, e) => {
                write!(f, "Open ASN Mismatch (received={}, expected={})", r, e)?;
            }
            UnacceptableHoldTime(h) => write!(f, "Unacceptable hold time {}", h)?,
            UnsupportedCapability(c) => write!(f, "Peer lacks {} capability", c)?,
            HoldTimeExpired(h) => write!(f, "Hold time expired after {} seconds", h)?,
            FiniteStateMachine(minor) => write!(f, "Finite State Machine err [{}]", minor)?,
            MalformedUpdate(minor, r) => write!(f, "Malformed UPDATE [{}]: {}", minor, r)?,
            NotificationReceived(n) => write!(f, "Received NOTIFICATION {}", n)?,
            TransportError(r) => write!(f, "Transport error [{}]", r)?,
            CodecError(r) => write!(f, "Codec error [{}]", r)?,
            Other(r) => write!(f, "{}", r)?,
        }
        Ok(())
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl error::Error for SessionError {}

/// Instructions from the controller to a running peer task
#[derive(Debug)]
pub enum SessionCommand {
    /// Inbound connection from the peer
    Accept(TcpStream),
    /// Start connecting again, for a task waiting on the peer
    Connect,
    /// End the session, telling the peer why
    Stop(SessionError),
}

pub type CommandTx = mpsc::UnboundedSender<SessionCommand>;
pub type CommandRx = mpsc::UnboundedReceiver<SessionCommand>;

/// Per-peer observables that outlive any one session
#[derive(Clone, Debug, Default)]
pub struct PeerContext {
    pub rib: SharedRib,
    pub stats: Arc<PacketStats>,
    info: Arc<RwLock<Option<SessionInfo>>>,
}

impl PeerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_session_info(&self, info: Option<SessionInfo>) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }
}

/// Decodes UPDATEs into RIB changes, bounded by a shared pool of permits
#[derive(Clone)]
pub struct Dispatcher {
    decoder: Arc<dyn LinkStateDecoder>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(decoder: Arc<dyn LinkStateDecoder>, workers: usize) -> Self {
        Self {
            decoder,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("available", &self.permits.available_permits())
            .finish()
    }
}
