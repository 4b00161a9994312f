use std::net::IpAddr;
use std::sync::Arc;

use bgp_rs::{Identifier, PathAttribute, Segment, Update};
use bytes::Bytes;

use super::ProtocolId;
use crate::utils::bytes_to_ipv6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Incomplete
    }
}

impl From<&bgp_rs::Origin> for Origin {
    fn from(origin: &bgp_rs::Origin) -> Self {
        match origin {
            bgp_rs::Origin::IGP => Origin::Igp,
            bgp_rs::Origin::EGP => Origin::Egp,
            bgp_rs::Origin::INCOMPLETE => Origin::Incomplete,
        }
    }
}

/// Well-known path attributes of an UPDATE, plus the BGP-LS attribute
///   (type 29) kept as the raw TLV block for topology consumers
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PathAttributes {
    pub next_hop: Option<IpAddr>,
    pub origin: Origin,
    pub as_path: Vec<u32>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub link_state: Bytes,
}

impl PathAttributes {
    /// Lift the well-known attributes out of a decoded UPDATE
    pub fn from_update(update: &Update) -> Self {
        let origin = match update.get(Identifier::ORIGIN) {
            Some(PathAttribute::ORIGIN(origin)) => origin.into(),
            _ => Origin::Incomplete,
        };
        let next_hop = match update.get(Identifier::NEXT_HOP) {
            Some(PathAttribute::NEXT_HOP(next_hop)) => Some(*next_hop),
            _ => None,
        };
        let as_path = match update.get(Identifier::AS_PATH) {
            Some(PathAttribute::AS_PATH(as_path)) => as_path
                .segments
                .iter()
                .flat_map(|segment| match segment {
                    Segment::AS_SEQUENCE(asns) | Segment::AS_SET(asns) => asns.clone(),
                })
                .collect(),
            _ => vec![],
        };
        let local_pref = match update.get(Identifier::LOCAL_PREF) {
            Some(PathAttribute::LOCAL_PREF(local_pref)) => Some(*local_pref),
            _ => None,
        };
        let multi_exit_disc = match update.get(Identifier::MULTI_EXIT_DISC) {
            Some(PathAttribute::MULTI_EXIT_DISC(metric)) => Some(*metric),
            _ => None,
        };
        PathAttributes {
            next_hop,
            origin,
            as_path,
            local_pref,
            multi_exit_disc,
            link_state: Bytes::new(),
        }
    }

    /// BGP-LS next hops are carried in MP_REACH, length selects the family
    ///   (32 bytes is a global address followed by a link-local one)
    pub fn with_mp_next_hop(mut self, next_hop: &[u8]) -> Self {
        match next_hop.len() {
            4 => self.next_hop = bytes_to_ipv4(next_hop),
            16 | 32 => self.next_hop = Some(bytes_to_ipv6(next_hop)),
            _ => (),
        }
        self
    }

    pub fn with_link_state(mut self, link_state: Bytes) -> Self {
        self.link_state = link_state;
        self
    }
}

fn bytes_to_ipv4(bytes: &[u8]) -> Option<IpAddr> {
    if bytes.len() < 4 {
        return None;
    }
    Some(IpAddr::from([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// What a peer last advertised for one NLRI key
///   Path attributes are shared between every NLRI of the same UPDATE
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NlriAttributes {
    pub protocol_id: ProtocolId,
    pub identifier: u64,
    pub path_attributes: Arc<PathAttributes>,
}

impl NlriAttributes {
    pub fn new(
        protocol_id: ProtocolId,
        identifier: u64,
        path_attributes: Arc<PathAttributes>,
    ) -> Self {
        Self {
            protocol_id,
            identifier,
            path_attributes,
        }
    }
}
