mod attributes;
mod nlri;
pub(crate) mod parse;
mod vpn;

pub use attributes::{NlriAttributes, Origin, PathAttributes};
pub use nlri::{
    LinkDescriptors, LinkNlri, NlriKey, NlriKind, NodeDescriptors, NodeNlri, PrefixDescriptors,
    PrefixNlri, ProtocolId,
};
pub use parse::{parse_link_state_nlri, ScopedKey};
pub use vpn::{RouteDistinguisher, VpnAdjRibIn};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use log::trace;

pub type NlriTable = BTreeMap<NlriKey, NlriAttributes>;

/// One value per NLRI kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KindMap<V> {
    node: V,
    link: V,
    prefix: V,
}

impl<V> KindMap<V> {
    pub fn get(&self, kind: NlriKind) -> &V {
        match kind {
            NlriKind::Node => &self.node,
            NlriKind::Link => &self.link,
            NlriKind::Prefix => &self.prefix,
        }
    }

    pub fn get_mut(&mut self, kind: NlriKind) -> &mut V {
        match kind {
            NlriKind::Node => &mut self.node,
            NlriKind::Link => &mut self.link,
            NlriKind::Prefix => &mut self.prefix,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NlriKind, &V)> {
        NlriKind::ALL.iter().map(move |kind| (*kind, self.get(*kind)))
    }
}

/// Link-State NLRI received from a single peer, one table per NLRI kind
#[derive(Clone, Debug, Default)]
pub struct AdjRibIn {
    tables: KindMap<NlriTable>,
}

impl AdjRibIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the attributes for `key`, returning what was replaced
    pub fn upsert(&mut self, key: NlriKey, attributes: NlriAttributes) -> Option<NlriAttributes> {
        trace!("Adj-RIB-In upsert {}", key);
        self.tables.get_mut(key.kind()).insert(key, attributes)
    }

    /// Remove `key` if present, a missing key is not an error
    pub fn withdraw(&mut self, key: &NlriKey) -> Option<NlriAttributes> {
        trace!("Adj-RIB-In withdraw {}", key);
        self.tables.get_mut(key.kind()).remove(key)
    }

    pub fn get(&self, key: &NlriKey) -> Option<&NlriAttributes> {
        self.tables.get(key.kind()).get(key)
    }

    pub fn get_by_kind(&self, kind: NlriKind, key: &NlriKey) -> Option<&NlriAttributes> {
        self.tables.get(kind).get(key)
    }

    pub fn table(&self, kind: NlriKind) -> &NlriTable {
        self.tables.get(kind)
    }

    /// Ordered copy of one kind's table for downstream consumers
    pub fn snapshot(&self, kind: NlriKind) -> NlriTable {
        self.tables.get(kind).clone()
    }

    pub fn len(&self, kind: NlriKind) -> usize {
        self.tables.get(kind).len()
    }

    pub fn total_len(&self) -> usize {
        self.tables.iter().map(|(_, table)| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Drop every entry, returning how many were removed
    pub fn flush(&mut self) -> usize {
        let count = self.total_len();
        for kind in NlriKind::ALL.iter() {
            self.tables.get_mut(*kind).clear();
        }
        count
    }
}

/// A single change decoded from an UPDATE
///   `rd` is set for NLRI received under the BGP-LS-VPN SAFI
#[derive(Clone, Debug, PartialEq)]
pub enum RibUpdate {
    Advertise {
        rd: Option<RouteDistinguisher>,
        key: NlriKey,
        attributes: NlriAttributes,
    },
    Withdraw {
        rd: Option<RouteDistinguisher>,
        key: NlriKey,
    },
}

/// Everything a peer has advertised: plain and VPN-scoped Link-State NLRI
#[derive(Clone, Debug, Default)]
pub struct PeerRib {
    pub adj_rib_in: AdjRibIn,
    pub vpn_adj_rib_in: VpnAdjRibIn,
}

impl PeerRib {
    pub fn apply(&mut self, update: RibUpdate) {
        match update {
            RibUpdate::Advertise {
                rd: None,
                key,
                attributes,
            } => {
                self.adj_rib_in.upsert(key, attributes);
            }
            RibUpdate::Advertise {
                rd: Some(rd),
                key,
                attributes,
            } => {
                self.vpn_adj_rib_in.upsert_vpn(rd, key, attributes);
            }
            RibUpdate::Withdraw { rd: None, key } => {
                self.adj_rib_in.withdraw(&key);
            }
            RibUpdate::Withdraw { rd: Some(rd), key } => {
                self.vpn_adj_rib_in.withdraw_vpn(&rd, &key);
            }
        }
    }

    pub fn flush(&mut self) -> usize {
        self.adj_rib_in.flush() + self.vpn_adj_rib_in.flush()
    }

    pub fn len(&self) -> usize {
        self.adj_rib_in.total_len() + self.vpn_adj_rib_in.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PeerRib {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<PeerRib nodes={} links={} prefixes={} vpn={}>",
            self.adj_rib_in.len(NlriKind::Node),
            self.adj_rib_in.len(NlriKind::Link),
            self.adj_rib_in.len(NlriKind::Prefix),
            self.vpn_adj_rib_in.total_len(),
        )
    }
}

/// Written only by the owning session task, readers clone what they need
#[derive(Clone, Debug, Default)]
pub struct SharedRib(Arc<RwLock<PeerRib>>);

impl SharedRib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, updates: Vec<RibUpdate>) {
        let mut rib = self.0.write().unwrap_or_else(PoisonError::into_inner);
        for update in updates {
            rib.apply(update);
        }
    }

    pub fn flush(&self) -> usize {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }

    /// Run `f` against the current contents under a read lock
    pub fn read<T>(&self, f: impl FnOnce(&PeerRib) -> T) -> T {
        let rib = self.0.read().unwrap_or_else(PoisonError::into_inner);
        f(&rib)
    }

    pub fn snapshot(&self) -> PeerRib {
        self.read(|rib| rib.clone())
    }
}
