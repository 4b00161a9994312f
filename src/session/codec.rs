use std::io;
use std::panic::{self, AssertUnwindSafe};

use bgp_rs::{Message, Reader};
use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use twoway::find_bytes;

use super::decode::{LinkStateUpdate, MpReach, MpUnreach};
use super::{SessionError, BGP_LS_AFI, BGP_LS_SAFI, BGP_LS_VPN_SAFI};
use crate::utils::get_message_type;

const MARKER: [u8; 16] = [0xff; 16];
const HEADER_LEN: usize = 19;
const MAX_MESSAGE_LEN: usize = 4096;

const OPEN: u8 = 1;
const UPDATE: u8 = 2;
const NOTIFICATION: u8 = 3;
const KEEPALIVE: u8 = 4;
const ROUTE_REFRESH: u8 = 5;

const MP_REACH_NLRI: u8 = 14;
const MP_UNREACH_NLRI: u8 = 15;
const BGP_LS_ATTRIBUTE: u8 = 29;
const EXTENDED_LENGTH: u8 = 0x10;

pub type MessageProtocol<T = TcpStream> = Framed<T, MessageCodec>;

/// A decoded BGP message, UPDATEs carry their Link-State attributes separately
#[derive(Debug)]
pub enum Incoming {
    Message(Message),
    Update(LinkStateUpdate),
}

impl Incoming {
    pub fn message_type(&self) -> &'static str {
        match self {
            Incoming::Message(message) => get_message_type(message),
            Incoming::Update(_) => "UPDATE",
        }
    }
}

impl From<Message> for Incoming {
    fn from(message: Message) -> Self {
        match message {
            Message::Update(update) => Incoming::Update(LinkStateUpdate::new(update)),
            other => Incoming::Message(other),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Incoming;
    type Error = SessionError;

    // Validate the header, then split UPDATEs or hand the frame to bgp-rs
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, SessionError> {
        let length = match find_msg_len(buf)? {
            Some(length) => length,
            None => return Ok(None),
        };
        let frame = buf.split_to(length).freeze();
        let incoming = match frame[HEADER_LEN - 1] {
            UPDATE => Incoming::Update(decode_update(&frame)?),
            OPEN => Incoming::Message(read_message(&frame).map_err(SessionError::MalformedOpen)?),
            _ => Incoming::Message(read_message(&frame).map_err(SessionError::CodecError)?),
        };
        Ok(Some(incoming))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), io::Error> {
        let mut encoded: Vec<u8> = Vec::with_capacity(HEADER_LEN);
        message.encode(&mut encoded)?;
        buf.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Message Header Error (RFC 4271, Section 6.1)
fn header_error(minor: u8, data: &[u8]) -> SessionError {
    SessionError::MessageHeader(minor, data.to_vec())
}

/// Given a stream of bytes, find the length of the BGP message at its start
///   None until the whole message has been buffered
fn find_msg_len(data: &[u8]) -> Result<Option<usize>, SessionError> {
    match find_bytes(data, &MARKER) {
        Some(0) => (),
        // Connection Not Synchronized
        Some(_) => return Err(header_error(1, &[])),
        None if data.len() >= MARKER.len() => return Err(header_error(1, &[])),
        None => return Ok(None),
    }
    if data.len() < HEADER_LEN {
        return Ok(None);
    }
    let length_field = &data[16..18];
    let length = usize::from(u16::from_be_bytes([length_field[0], length_field[1]]));
    let message_type = data[18];
    if length < HEADER_LEN || length > MAX_MESSAGE_LEN {
        return Err(header_error(2, length_field));
    }
    let min_len = match message_type {
        OPEN => 29,
        UPDATE => 23,
        NOTIFICATION => 21,
        KEEPALIVE => HEADER_LEN,
        ROUTE_REFRESH => 23,
        other => return Err(header_error(3, &[other])),
    };
    let exact = message_type == KEEPALIVE || message_type == ROUTE_REFRESH;
    if length < min_len || (exact && length != min_len) {
        return Err(header_error(2, length_field));
    }
    if data.len() < length {
        return Ok(None);
    }
    Ok(Some(length))
}

/// Decode one framed message with bgp-rs
///   bgp-rs panics on encodings it doesn't implement, those become errors
fn read_message(frame: &[u8]) -> Result<Message, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| Reader::new(frame).read())) {
        Ok(Ok((_header, message))) => Ok(message),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!(
            "Unsupported {} encoding",
            frame.get(HEADER_LEN - 1).copied().unwrap_or_default()
        )),
    }
}

fn attribute_list_error(reason: &str) -> SessionError {
    SessionError::MalformedUpdate(1, reason.to_string())
}

fn optional_attribute_error(reason: String) -> SessionError {
    SessionError::MalformedUpdate(9, reason)
}

fn read_u16(data: &[u8], offset: usize) -> usize {
    usize::from(u16::from_be_bytes([data[offset], data[offset + 1]]))
}

fn is_link_state(afi: u16, safi: u8) -> bool {
    afi == BGP_LS_AFI && (safi == BGP_LS_SAFI || safi == BGP_LS_VPN_SAFI)
}

/// MP_REACH_NLRI for a Link-State family, None for any other family
fn parse_mp_reach(value: Bytes) -> Result<Option<MpReach>, SessionError> {
    if value.len() < 5 {
        return Err(optional_attribute_error(format!(
            "MP_REACH_NLRI too short ({} bytes)",
            value.len()
        )));
    }
    let afi = u16::from_be_bytes([value[0], value[1]]);
    let safi = value[2];
    let next_hop_len = usize::from(value[3]);
    // Next hop is followed by one reserved byte
    if value.len() < 5 + next_hop_len {
        return Err(optional_attribute_error(format!(
            "MP_REACH_NLRI next hop length {} exceeds attribute",
            next_hop_len
        )));
    }
    if !is_link_state(afi, safi) {
        debug!("Ignoring MP_REACH_NLRI for AFI {} SAFI {}", afi, safi);
        return Ok(None);
    }
    Ok(Some(MpReach {
        safi,
        next_hop: value.slice(4..4 + next_hop_len),
        nlri: value.slice(5 + next_hop_len..),
    }))
}

fn parse_mp_unreach(value: Bytes) -> Result<Option<MpUnreach>, SessionError> {
    if value.len() < 3 {
        return Err(optional_attribute_error(format!(
            "MP_UNREACH_NLRI too short ({} bytes)",
            value.len()
        )));
    }
    let afi = u16::from_be_bytes([value[0], value[1]]);
    let safi = value[2];
    if !is_link_state(afi, safi) {
        debug!("Ignoring MP_UNREACH_NLRI for AFI {} SAFI {}", afi, safi);
        return Ok(None);
    }
    Ok(Some(MpUnreach {
        safi,
        nlri: value.slice(3..),
    }))
}

/// Split the Link-State attributes out of an UPDATE frame
///   What remains is rebuilt as a plain UPDATE and decoded by bgp-rs
fn decode_update(frame: &Bytes) -> Result<LinkStateUpdate, SessionError> {
    let withdrawn_len = read_u16(frame, HEADER_LEN);
    let attrs_len_at = HEADER_LEN + 2 + withdrawn_len;
    if frame.len() < attrs_len_at + 2 {
        return Err(attribute_list_error("Withdrawn Routes Length too long"));
    }
    let attrs_start = attrs_len_at + 2;
    let attrs_end = attrs_start + read_u16(frame, attrs_len_at);
    if frame.len() < attrs_end {
        return Err(attribute_list_error("Total Path Attribute Length too long"));
    }

    let mut kept: Vec<u8> = Vec::with_capacity(attrs_end - attrs_start);
    let (mut seen_reach, mut seen_unreach) = (false, false);
    let (mut reach, mut unreach, mut attribute) = (None, None, None);
    let mut offset = attrs_start;
    while offset < attrs_end {
        if attrs_end - offset < 3 {
            return Err(attribute_list_error("Truncated path attribute"));
        }
        let (flags, code) = (frame[offset], frame[offset + 1]);
        let (value_start, value_len) = if flags & EXTENDED_LENGTH == 0 {
            (offset + 3, usize::from(frame[offset + 2]))
        } else if attrs_end - offset < 4 {
            return Err(attribute_list_error("Truncated path attribute"));
        } else {
            (offset + 4, read_u16(frame, offset + 2))
        };
        let value_end = value_start + value_len;
        if value_end > attrs_end {
            return Err(attribute_list_error("Path attribute overruns the attribute list"));
        }
        let value = frame.slice(value_start..value_end);
        match code {
            MP_REACH_NLRI if seen_reach => {
                return Err(attribute_list_error("Duplicate MP_REACH_NLRI"))
            }
            MP_REACH_NLRI => {
                seen_reach = true;
                reach = parse_mp_reach(value)?;
            }
            MP_UNREACH_NLRI if seen_unreach => {
                return Err(attribute_list_error("Duplicate MP_UNREACH_NLRI"))
            }
            MP_UNREACH_NLRI => {
                seen_unreach = true;
                unreach = parse_mp_unreach(value)?;
            }
            BGP_LS_ATTRIBUTE if attribute.is_some() => {
                return Err(attribute_list_error("Duplicate BGP-LS attribute"))
            }
            BGP_LS_ATTRIBUTE => attribute = Some(value),
            _ => kept.extend_from_slice(&frame[offset..value_end]),
        }
        offset = value_end;
    }

    let mut rebuilt: Vec<u8> = Vec::with_capacity(frame.len());
    rebuilt.extend_from_slice(&frame[..attrs_len_at]);
    rebuilt.extend_from_slice(&(kept.len() as u16).to_be_bytes());
    rebuilt.extend_from_slice(&kept);
    rebuilt.extend_from_slice(&frame[attrs_end..]);
    let length = (rebuilt.len() as u16).to_be_bytes();
    rebuilt[16..18].copy_from_slice(&length);

    let update = match read_message(&rebuilt) {
        Ok(Message::Update(update)) => update,
        Ok(other) => {
            return Err(SessionError::CodecError(format!(
                "Expected UPDATE, decoded {}",
                get_message_type(&other)
            )))
        }
        Err(reason) => return Err(SessionError::MalformedUpdate(1, reason)),
    };
    Ok(LinkStateUpdate {
        update,
        reach,
        unreach,
        attribute,
    })
}
