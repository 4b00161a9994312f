use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use log::trace;

use super::{KindMap, NlriAttributes, NlriKey, NlriKind, NlriTable};

/// 8-byte Route Distinguisher (RFC 4364, Section 4.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteDistinguisher([u8; 8]);

impl RouteDistinguisher {
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Type 0: 2-byte ASN administrator, 4-byte assigned number
    pub fn from_asn(asn: u16, assigned: u32) -> Self {
        let mut bytes = [0u8; 8];
        bytes[2..4].copy_from_slice(&asn.to_be_bytes());
        bytes[4..8].copy_from_slice(&assigned.to_be_bytes());
        Self(bytes)
    }

    /// Type 1: IPv4 administrator, 2-byte assigned number
    pub fn from_ipv4(addr: Ipv4Addr, assigned: u16) -> Self {
        let mut bytes = [0u8; 8];
        bytes[1] = 1;
        bytes[2..6].copy_from_slice(&addr.octets());
        bytes[6..8].copy_from_slice(&assigned.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    fn rd_type(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.0;
        match self.rd_type() {
            0 => write!(
                f,
                "{}:{}",
                u16::from_be_bytes([b[2], b[3]]),
                u32::from_be_bytes([b[4], b[5], b[6], b[7]])
            ),
            1 => write!(
                f,
                "{}:{}",
                Ipv4Addr::new(b[2], b[3], b[4], b[5]),
                u16::from_be_bytes([b[6], b[7]])
            ),
            2 => write!(
                f,
                "{}:{}",
                u32::from_be_bytes([b[2], b[3], b[4], b[5]]),
                u16::from_be_bytes([b[6], b[7]])
            ),
            _ => {
                for byte in b.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Aggregate view entry: how many RDs currently carry the key
#[derive(Clone, Debug, PartialEq)]
struct AggregateEntry {
    refs: usize,
    attributes: NlriAttributes,
}

/// Adj-RIB-In for NLRI received under the BGP-LS-VPN SAFI
///
/// Each RD owns its own table per NLRI kind. The aggregate view flattens all
/// RDs for RD-agnostic queries and is kept consistent by counting, per key,
/// how many RD tables hold it. Withdrawing a key from one RD never touches
/// another RD's table.
#[derive(Clone, Debug, Default)]
pub struct VpnAdjRibIn {
    by_rd: KindMap<BTreeMap<RouteDistinguisher, NlriTable>>,
    aggregate: KindMap<BTreeMap<NlriKey, AggregateEntry>>,
}

impl VpnAdjRibIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key` under `rd`, returning the value it replaced in that RD
    pub fn upsert_vpn(
        &mut self,
        rd: RouteDistinguisher,
        key: NlriKey,
        attributes: NlriAttributes,
    ) -> Option<NlriAttributes> {
        trace!("VPN Adj-RIB-In upsert [{}] {}", rd, key);
        let kind = key.kind();
        let replaced = self
            .by_rd
            .get_mut(kind)
            .entry(rd)
            .or_insert_with(NlriTable::new)
            .insert(key.clone(), attributes.clone());

        let aggregate = self.aggregate.get_mut(kind);
        match aggregate.get_mut(&key) {
            Some(entry) => {
                if replaced.is_none() {
                    entry.refs += 1;
                }
                entry.attributes = attributes;
            }
            None => {
                aggregate.insert(
                    key,
                    AggregateEntry {
                        refs: 1,
                        attributes,
                    },
                );
            }
        }
        replaced
    }

    /// Remove `key` from `rd` only. The aggregate entry goes away once no RD holds the key
    pub fn withdraw_vpn(
        &mut self,
        rd: &RouteDistinguisher,
        key: &NlriKey,
    ) -> Option<NlriAttributes> {
        trace!("VPN Adj-RIB-In withdraw [{}] {}", rd, key);
        let kind = key.kind();
        let tables = self.by_rd.get_mut(kind);
        let table = tables.get_mut(rd)?;
        let removed = table.remove(key)?;
        if table.is_empty() {
            tables.remove(rd);
        }
        let remaining = tables.values().find_map(|table| table.get(key)).cloned();

        let aggregate = self.aggregate.get_mut(kind);
        if let Some(entry) = aggregate.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
            match remaining {
                Some(attributes) if entry.refs > 0 => {
                    // Only re-point when the withdrawn RD supplied the projected value
                    if entry.attributes == removed {
                        entry.attributes = attributes;
                    }
                }
                _ => {
                    aggregate.remove(key);
                }
            }
        }
        Some(removed)
    }

    /// Withdraw everything held under `rd`, returning how many entries went away
    pub fn remove_rd(&mut self, rd: &RouteDistinguisher) -> usize {
        let keys: Vec<NlriKey> = NlriKind::ALL
            .iter()
            .filter_map(|kind| self.by_rd.get(*kind).get(rd))
            .flat_map(|table| table.keys().cloned())
            .collect();
        keys.iter()
            .filter(|key| self.withdraw_vpn(rd, key).is_some())
            .count()
    }

    pub fn get_vpn(&self, rd: &RouteDistinguisher, key: &NlriKey) -> Option<&NlriAttributes> {
        self.by_rd
            .get(key.kind())
            .get(rd)
            .and_then(|table| table.get(key))
    }

    /// RD-agnostic lookup across every RD
    pub fn get_aggregate(&self, key: &NlriKey) -> Option<&NlriAttributes> {
        self.aggregate
            .get(key.kind())
            .get(key)
            .map(|entry| &entry.attributes)
    }

    /// Number of RDs currently advertising `key`
    pub fn aggregate_refs(&self, key: &NlriKey) -> usize {
        self.aggregate
            .get(key.kind())
            .get(key)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    pub fn snapshot_rd(&self, rd: &RouteDistinguisher, kind: NlriKind) -> NlriTable {
        self.by_rd.get(kind).get(rd).cloned().unwrap_or_default()
    }

    pub fn snapshot_aggregate(&self, kind: NlriKind) -> NlriTable {
        self.aggregate
            .get(kind)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.attributes.clone()))
            .collect()
    }

    /// RDs holding at least one NLRI of `kind`
    pub fn route_distinguishers(&self, kind: NlriKind) -> Vec<RouteDistinguisher> {
        self.by_rd.get(kind).keys().copied().collect()
    }

    /// Total (RD, key) entries across all kinds
    pub fn total_len(&self) -> usize {
        self.by_rd
            .iter()
            .flat_map(|(_, tables)| tables.values())
            .map(|table| table.len())
            .sum()
    }

    pub fn aggregate_len(&self, kind: NlriKind) -> usize {
        self.aggregate.get(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    pub fn flush(&mut self) -> usize {
        let count = self.total_len();
        for kind in NlriKind::ALL.iter() {
            self.by_rd.get_mut(*kind).clear();
            self.aggregate.get_mut(*kind).clear();
        }
        count
    }
}
