mod config;
pub mod rib;
mod session;
mod utils;

pub use config::{BgpConfig, ConfigState, PeerConfig, SpeakerConfig};
pub use session::{
    Fsm, IgnoreLinkState, LinkStateDecoder, LinkStateUpdate, MpReach, MpUnreach, PacketStats,
    Rfc7752Decoder, SessionError, SessionInfo, SessionManager, SessionParams, SessionState,
};
pub use utils::SystemStats;
