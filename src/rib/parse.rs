use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{NetworkEndian, ReadBytesExt};
use ipnetwork::IpNetwork;
use log::debug;

use super::{
    LinkDescriptors, LinkNlri, NlriKey, NodeDescriptors, NodeNlri, PrefixDescriptors, PrefixNlri,
    ProtocolId, RouteDistinguisher,
};

// NLRI types (RFC 7752, Section 3.2)
const NODE_NLRI: u16 = 1;
const LINK_NLRI: u16 = 2;
const IPV4_PREFIX_NLRI: u16 = 3;
const IPV6_PREFIX_NLRI: u16 = 4;

// Node, Link and Prefix descriptor TLVs
const LOCAL_NODE_DESCRIPTORS: u16 = 256;
const REMOTE_NODE_DESCRIPTORS: u16 = 257;
const LINK_IDENTIFIERS: u16 = 258;
const IPV4_INTERFACE: u16 = 259;
const IPV4_NEIGHBOR: u16 = 260;
const IPV6_INTERFACE: u16 = 261;
const IPV6_NEIGHBOR: u16 = 262;
const MULTI_TOPOLOGY_ID: u16 = 263;
const OSPF_ROUTE_TYPE: u16 = 264;
const IP_REACHABILITY: u16 = 265;

// Node descriptor sub-TLVs
const AUTONOMOUS_SYSTEM: u16 = 512;
const BGP_LS_IDENTIFIER: u16 = 513;
const OSPF_AREA_ID: u16 = 514;
const IGP_ROUTER_ID: u16 = 515;

/// An NLRI key, with its Route Distinguisher when learned from the VPN family
pub type ScopedKey = (Option<RouteDistinguisher>, NlriKey);

/// Parse the Link-State NLRI carried in one MP_REACH/MP_UNREACH attribute
///   VPN NLRI (SAFI 72) carry a Route Distinguisher ahead of the Protocol-ID.
///   NLRI types other than Node/Link/Prefix are skipped
pub fn parse_link_state_nlri(mut data: &[u8], vpn: bool) -> io::Result<Vec<ScopedKey>> {
    let mut keys = Vec::new();
    while !data.is_empty() {
        let (nlri_type, mut body) = read_tlv(&mut data)?;
        let rd = if vpn {
            let mut rd = [0u8; 8];
            body.read_exact(&mut rd)?;
            Some(RouteDistinguisher::new(rd))
        } else {
            None
        };
        match nlri_type {
            NODE_NLRI | LINK_NLRI | IPV4_PREFIX_NLRI | IPV6_PREFIX_NLRI => {
                keys.push((rd, parse_nlri(nlri_type, body)?));
            }
            other => debug!("Skipping Link-State NLRI type {}", other),
        }
    }
    Ok(keys)
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Split off the next (type, value) TLV
fn read_tlv<'a>(data: &mut &'a [u8]) -> io::Result<(u16, &'a [u8])> {
    let tlv_type = data.read_u16::<NetworkEndian>()?;
    let length = usize::from(data.read_u16::<NetworkEndian>()?);
    if data.len() < length {
        return Err(invalid(format!(
            "TLV {} length {} exceeds the {} bytes left",
            tlv_type,
            length,
            data.len()
        )));
    }
    let (value, rest) = data.split_at(length);
    *data = rest;
    Ok((tlv_type, value))
}

fn expect_tlv<'a>(data: &mut &'a [u8], expected: u16) -> io::Result<&'a [u8]> {
    match read_tlv(data)? {
        (tlv_type, value) if tlv_type == expected => Ok(value),
        (tlv_type, _) => Err(invalid(format!(
            "Expected TLV {}, found {}",
            expected, tlv_type
        ))),
    }
}

fn parse_nlri(nlri_type: u16, mut body: &[u8]) -> io::Result<NlriKey> {
    let protocol_id = ProtocolId::from(body.read_u8()?);
    let identifier = body.read_u64::<NetworkEndian>()?;
    let local_node = parse_node_descriptors(expect_tlv(&mut body, LOCAL_NODE_DESCRIPTORS)?)?;
    let key = match nlri_type {
        NODE_NLRI => NlriKey::Node(NodeNlri {
            protocol_id,
            identifier,
            local_node,
        }),
        LINK_NLRI => {
            let remote_node =
                parse_node_descriptors(expect_tlv(&mut body, REMOTE_NODE_DESCRIPTORS)?)?;
            NlriKey::Link(LinkNlri {
                protocol_id,
                identifier,
                local_node,
                remote_node,
                link: parse_link_descriptors(body)?,
            })
        }
        _ => NlriKey::Prefix(PrefixNlri {
            protocol_id,
            identifier,
            local_node,
            prefix: parse_prefix_descriptors(body, nlri_type == IPV6_PREFIX_NLRI)?,
        }),
    };
    Ok(key)
}

fn parse_node_descriptors(mut data: &[u8]) -> io::Result<NodeDescriptors> {
    let mut node = NodeDescriptors::default();
    while !data.is_empty() {
        let (sub_type, mut value) = read_tlv(&mut data)?;
        match sub_type {
            AUTONOMOUS_SYSTEM => node.as_number = Some(value.read_u32::<NetworkEndian>()?),
            BGP_LS_IDENTIFIER => node.bgp_ls_id = Some(value.read_u32::<NetworkEndian>()?),
            OSPF_AREA_ID => node.ospf_area_id = Some(value.read_u32::<NetworkEndian>()?),
            IGP_ROUTER_ID => node.igp_router_id = value.to_vec(),
            other => debug!("Skipping node descriptor sub-TLV {}", other),
        }
    }
    Ok(node)
}

fn parse_link_descriptors(mut data: &[u8]) -> io::Result<LinkDescriptors> {
    let mut link = LinkDescriptors::default();
    while !data.is_empty() {
        let (tlv_type, mut value) = read_tlv(&mut data)?;
        match tlv_type {
            LINK_IDENTIFIERS => {
                let local = value.read_u32::<NetworkEndian>()?;
                let remote = value.read_u32::<NetworkEndian>()?;
                link.link_identifiers = Some((local, remote));
            }
            IPV4_INTERFACE => link.ipv4_interface = Some(read_ipv4(&mut value)?),
            IPV4_NEIGHBOR => link.ipv4_neighbor = Some(read_ipv4(&mut value)?),
            IPV6_INTERFACE => link.ipv6_interface = Some(read_ipv6(&mut value)?),
            IPV6_NEIGHBOR => link.ipv6_neighbor = Some(read_ipv6(&mut value)?),
            MULTI_TOPOLOGY_ID => link.multi_topology_id = Some(read_mt_id(&mut value)?),
            other => debug!("Skipping link descriptor TLV {}", other),
        }
    }
    Ok(link)
}

fn parse_prefix_descriptors(mut data: &[u8], ipv6: bool) -> io::Result<PrefixDescriptors> {
    let mut multi_topology_id = None;
    let mut ospf_route_type = None;
    let mut ip_reachability = None;
    while !data.is_empty() {
        let (tlv_type, mut value) = read_tlv(&mut data)?;
        match tlv_type {
            MULTI_TOPOLOGY_ID => multi_topology_id = Some(read_mt_id(&mut value)?),
            OSPF_ROUTE_TYPE => ospf_route_type = Some(value.read_u8()?),
            IP_REACHABILITY => ip_reachability = Some(parse_ip_reachability(value, ipv6)?),
            other => debug!("Skipping prefix descriptor TLV {}", other),
        }
    }
    let ip_reachability = ip_reachability
        .ok_or_else(|| invalid("Prefix NLRI without IP Reachability Information".into()))?;
    Ok(PrefixDescriptors {
        multi_topology_id,
        ospf_route_type,
        ip_reachability,
    })
}

/// Prefix length followed by only the significant octets of the prefix
fn parse_ip_reachability(mut value: &[u8], ipv6: bool) -> io::Result<IpNetwork> {
    let prefix_len = value.read_u8()?;
    let max_len = if ipv6 { 128 } else { 32 };
    if prefix_len > max_len {
        return Err(invalid(format!("Prefix length {} > {}", prefix_len, max_len)));
    }
    let octets = (usize::from(prefix_len) + 7) / 8;
    if value.len() < octets {
        return Err(invalid(format!(
            "Prefix needs {} octets, found {}",
            octets,
            value.len()
        )));
    }
    let ip = if ipv6 {
        let mut buffer = [0u8; 16];
        buffer[..octets].copy_from_slice(&value[..octets]);
        IpAddr::from(buffer)
    } else {
        let mut buffer = [0u8; 4];
        buffer[..octets].copy_from_slice(&value[..octets]);
        IpAddr::from(buffer)
    };
    IpNetwork::new(ip, prefix_len).map_err(|err| invalid(err.to_string()))
}

fn read_ipv4(value: &mut &[u8]) -> io::Result<Ipv4Addr> {
    Ok(Ipv4Addr::from(value.read_u32::<NetworkEndian>()?))
}

fn read_ipv6(value: &mut &[u8]) -> io::Result<Ipv6Addr> {
    Ok(Ipv6Addr::from(value.read_u128::<NetworkEndian>()?))
}

// First MT-ID only; the top four bits are reserved
fn read_mt_id(value: &mut &[u8]) -> io::Result<u16> {
    Ok(value.read_u16::<NetworkEndian>()? & 0x0fff)
}
