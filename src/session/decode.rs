use std::io;
use std::sync::Arc;

use bgp_rs::Update;
use bytes::Bytes;
use log::trace;

use super::{SessionError, BGP_LS_VPN_SAFI};
use crate::rib::{parse_link_state_nlri, NlriAttributes, PathAttributes, RibUpdate};

/// Link-State MP_REACH_NLRI (RFC 4760), NLRI left encoded
#[derive(Clone, Debug, PartialEq)]
pub struct MpReach {
    pub safi: u8,
    pub next_hop: Bytes,
    pub nlri: Bytes,
}

/// Link-State MP_UNREACH_NLRI (RFC 4760), withdrawn NLRI left encoded
#[derive(Clone, Debug, PartialEq)]
pub struct MpUnreach {
    pub safi: u8,
    pub nlri: Bytes,
}

impl MpReach {
    pub fn is_vpn(&self) -> bool {
        self.safi == BGP_LS_VPN_SAFI
    }
}

impl MpUnreach {
    pub fn is_vpn(&self) -> bool {
        self.safi == BGP_LS_VPN_SAFI
    }
}

/// A received UPDATE, with the Link-State attributes split off by the codec
///   `update` holds every other attribute as decoded by bgp-rs
#[derive(Clone, Debug)]
pub struct LinkStateUpdate {
    pub update: Update,
    pub reach: Option<MpReach>,
    pub unreach: Option<MpUnreach>,
    /// BGP-LS attribute (type 29), raw TLVs
    pub attribute: Option<Bytes>,
}

impl LinkStateUpdate {
    pub fn new(update: Update) -> Self {
        Self {
            update,
            reach: None,
            unreach: None,
            attribute: None,
        }
    }
}

/// Turns a received UPDATE into Adj-RIB-In changes
///   An error ends the session with the NOTIFICATION it maps to
pub trait LinkStateDecoder: Send + Sync {
    fn decode(&self, update: &LinkStateUpdate) -> Result<Vec<RibUpdate>, SessionError>;
}

/// Accepts every UPDATE without recording anything
#[derive(Debug, Default)]
pub struct IgnoreLinkState;

impl LinkStateDecoder for IgnoreLinkState {
    fn decode(&self, update: &LinkStateUpdate) -> Result<Vec<RibUpdate>, SessionError> {
        trace!(
            "Ignoring UPDATE [{} attributes, reach={} unreach={}]",
            update.update.attributes.len(),
            update.reach.is_some(),
            update.unreach.is_some(),
        );
        Ok(vec![])
    }
}

/// Decodes Node, Link and Prefix NLRI (RFC 7752) for both BGP-LS SAFIs
///   Withdrawals are applied before advertisements from the same UPDATE
#[derive(Debug, Default)]
pub struct Rfc7752Decoder;

fn malformed(err: io::Error) -> SessionError {
    // Optional Attribute Error
    SessionError::MalformedUpdate(9, err.to_string())
}

impl LinkStateDecoder for Rfc7752Decoder {
    fn decode(&self, update: &LinkStateUpdate) -> Result<Vec<RibUpdate>, SessionError> {
        let mut changes = Vec::new();
        if let Some(unreach) = &update.unreach {
            let keys = parse_link_state_nlri(&unreach.nlri, unreach.is_vpn()).map_err(malformed)?;
            changes.extend(keys.into_iter().map(|(rd, key)| RibUpdate::Withdraw { rd, key }));
        }
        if let Some(reach) = &update.reach {
            let keys = parse_link_state_nlri(&reach.nlri, reach.is_vpn()).map_err(malformed)?;
            let path_attributes = Arc::new(
                PathAttributes::from_update(&update.update)
                    .with_mp_next_hop(&reach.next_hop)
                    .with_link_state(update.attribute.clone().unwrap_or_default()),
            );
            changes.extend(keys.into_iter().map(|(rd, key)| {
                let attributes = NlriAttributes::new(
                    key.protocol_id(),
                    key.identifier(),
                    Arc::clone(&path_attributes),
                );
                RibUpdate::Advertise {
                    rd,
                    key,
                    attributes,
                }
            }));
        }
        trace!("Decoded {} Link-State changes", changes.len());
        Ok(changes)
    }
}
