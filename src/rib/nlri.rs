use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

/// Protocol a Link-State NLRI was learned from (RFC 7752, Section 3.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolId {
    IsisL1,
    IsisL2,
    Ospfv2,
    Direct,
    Static,
    Ospfv3,
    Unknown(u8),
}

impl From<u8> for ProtocolId {
    fn from(value: u8) -> Self {
        use ProtocolId::*;
        match value {
            1 => IsisL1,
            2 => IsisL2,
            3 => Ospfv2,
            4 => Direct,
            5 => Static,
            6 => Ospfv3,
            other => Unknown(other),
        }
    }
}

impl From<ProtocolId> for u8 {
    fn from(id: ProtocolId) -> u8 {
        use ProtocolId::*;
        match id {
            IsisL1 => 1,
            IsisL2 => 2,
            Ospfv2 => 3,
            Direct => 4,
            Static => 5,
            Ospfv3 => 6,
            Unknown(other) => other,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ProtocolId::*;
        match self {
            IsisL1 => write!(f, "IS-IS L1"),
            IsisL2 => write!(f, "IS-IS L2"),
            Ospfv2 => write!(f, "OSPFv2"),
            Direct => write!(f, "Direct"),
            Static => write!(f, "Static"),
            Ospfv3 => write!(f, "OSPFv3"),
            Unknown(id) => write!(f, "Unknown({})", id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NlriKind {
    Node,
    Link,
    Prefix,
}

impl NlriKind {
    pub const ALL: [NlriKind; 3] = [NlriKind::Node, NlriKind::Link, NlriKind::Prefix];
}

impl fmt::Display for NlriKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            NlriKind::Node => "Node",
            NlriKind::Link => "Link",
            NlriKind::Prefix => "Prefix",
        };
        write!(f, "{}", word)
    }
}

/// Node Descriptor sub-TLVs (RFC 7752, Section 3.2.1.4)
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeDescriptors {
    pub as_number: Option<u32>,
    pub bgp_ls_id: Option<u32>,
    pub ospf_area_id: Option<u32>,
    // ISO system ID, OSPF router ID or pseudonode variants of either
    pub igp_router_id: Vec<u8>,
}

impl NodeDescriptors {
    pub fn new(as_number: u32, igp_router_id: Vec<u8>) -> Self {
        Self {
            as_number: Some(as_number),
            igp_router_id,
            ..Default::default()
        }
    }
}

impl fmt::Display for NodeDescriptors {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(asn) = self.as_number {
            write!(f, "as={} ", asn)?;
        }
        if let Some(area) = self.ospf_area_id {
            write!(f, "area={} ", area)?;
        }
        f.write_str("router=")?;
        for byte in &self.igp_router_id {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Link Descriptor TLVs (RFC 7752, Section 3.2.2)
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkDescriptors {
    /// (local, remote) link identifiers
    pub link_identifiers: Option<(u32, u32)>,
    pub ipv4_interface: Option<Ipv4Addr>,
    pub ipv4_neighbor: Option<Ipv4Addr>,
    pub ipv6_interface: Option<Ipv6Addr>,
    pub ipv6_neighbor: Option<Ipv6Addr>,
    pub multi_topology_id: Option<u16>,
}

/// Prefix Descriptor TLVs (RFC 7752, Section 3.2.3)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PrefixDescriptors {
    pub multi_topology_id: Option<u16>,
    pub ospf_route_type: Option<u8>,
    pub ip_reachability: IpNetwork,
}

impl PrefixDescriptors {
    pub fn new(ip_reachability: IpNetwork) -> Self {
        Self {
            multi_topology_id: None,
            ospf_route_type: None,
            ip_reachability,
        }
    }

    fn sort_key(&self) -> impl Ord {
        (
            self.multi_topology_id,
            self.ospf_route_type,
            self.ip_reachability.ip(),
            self.ip_reachability.prefix(),
        )
    }
}

impl PartialOrd for PrefixDescriptors {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrefixDescriptors {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeNlri {
    pub protocol_id: ProtocolId,
    pub identifier: u64,
    pub local_node: NodeDescriptors,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkNlri {
    pub protocol_id: ProtocolId,
    pub identifier: u64,
    pub local_node: NodeDescriptors,
    pub remote_node: NodeDescriptors,
    pub link: LinkDescriptors,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrefixNlri {
    pub protocol_id: ProtocolId,
    pub identifier: u64,
    pub local_node: NodeDescriptors,
    pub prefix: PrefixDescriptors,
}

/// Identity of one Link-State object, as carried in MP_REACH/MP_UNREACH
///   Keys compare by kind first, then by descriptor content
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NlriKey {
    Node(NodeNlri),
    Link(LinkNlri),
    Prefix(PrefixNlri),
}

impl NlriKey {
    pub fn kind(&self) -> NlriKind {
        match self {
            NlriKey::Node(_) => NlriKind::Node,
            NlriKey::Link(_) => NlriKind::Link,
            NlriKey::Prefix(_) => NlriKind::Prefix,
        }
    }

    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            NlriKey::Node(n) => n.protocol_id,
            NlriKey::Link(l) => l.protocol_id,
            NlriKey::Prefix(p) => p.protocol_id,
        }
    }

    pub fn identifier(&self) -> u64 {
        match self {
            NlriKey::Node(n) => n.identifier,
            NlriKey::Link(l) => l.identifier,
            NlriKey::Prefix(p) => p.identifier,
        }
    }

    pub fn local_node(&self) -> &NodeDescriptors {
        match self {
            NlriKey::Node(n) => &n.local_node,
            NlriKey::Link(l) => &l.local_node,
            NlriKey::Prefix(p) => &p.local_node,
        }
    }
}

impl From<NodeNlri> for NlriKey {
    fn from(nlri: NodeNlri) -> Self {
        NlriKey::Node(nlri)
    }
}

impl From<LinkNlri> for NlriKey {
    fn from(nlri: LinkNlri) -> Self {
        NlriKey::Link(nlri)
    }
}

impl From<PrefixNlri> for NlriKey {
    fn from(nlri: PrefixNlri) -> Self {
        NlriKey::Prefix(nlri)
    }
}

impl fmt::Display for NlriKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{} {} id={} local[{}]",
            self.kind(),
            self.protocol_id(),
            self.identifier(),
            self.local_node()
        )?;
        match self {
            NlriKey::Node(_) => (),
            NlriKey::Link(link) => write!(f, " remote[{}]", link.remote_node)?,
            NlriKey::Prefix(prefix) => write!(f, " prefix={}", prefix.prefix.ip_reachability)?,
        }
        write!(f, ">")
    }
}
