//! MQTT 3.1.1 control packets used by this client
//!
//! Builders return complete frames (fixed header + remaining length + body) ready to
//! hand to the transport. Decoders take complete frames as produced by [`PacketReader`].
//!
//! Outbound: CONNECT, PUBLISH, PUBACK, SUBSCRIBE, UNSUBSCRIBE, PINGREQ, DISCONNECT.
//! Inbound: CONNACK, PUBLISH, PUBACK, SUBACK, UNSUBACK, PINGRESP. Anything else is ignored.

use std::collections::HashSet;

use bytes::{Bytes, BytesMut};

use super::codec::{decode_remaining_length, decode_string, write_remaining_length, write_string};
use super::error::{ConnectReturnCode, DecodeError, EncodeError, MqttError};

pub const CONNECT: u8 = 0x10;
pub const CONNACK: u8 = 0x20;
pub const PUBLISH: u8 = 0x30;
pub const PUBACK: u8 = 0x40;
pub const SUBSCRIBE: u8 = 0x82;
pub const SUBACK: u8 = 0x90;
pub const UNSUBSCRIBE: u8 = 0xA2;
pub const UNSUBACK: u8 = 0xB0;
pub const PINGREQ: u8 = 0xC0;
pub const PINGRESP: u8 = 0xD0;
pub const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// SUBACK return code signalling a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Delivery guarantees supported by this client. QoS 2 is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            other => Err(MqttError::UnsupportedQos(other)),
        }
    }
}

/// Allocator for 16-bit packet identifiers.
///
/// Wraps from 65535 back to 1 (0 is not a valid id) and skips ids that are
/// still held by an unacknowledged QoS 1 publish.
#[derive(Debug)]
pub struct PacketIds {
    next: u16,
    held: HashSet<u16>,
}

impl Default for PacketIds {
    fn default() -> Self {
        Self {
            next: 1,
            held: HashSet::new(),
        }
    }
}

impl PacketIds {
    pub fn allocate(&mut self) -> u16 {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if !self.held.contains(&id) {
                return id;
            }
        }
        // Every id is held; reuse the next one rather than stall.
        let id = self.next;
        self.next = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    pub fn hold(&mut self, id: u16) {
        self.held.insert(id);
    }

    pub fn release(&mut self, id: u16) -> bool {
        self.held.remove(&id)
    }

    pub fn is_held(&self, id: u16) -> bool {
        self.held.contains(&id)
    }
}

fn frame(header: u8, body: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    let mut packet = Vec::with_capacity(body.len() + 5);
    packet.push(header);
    write_remaining_length(&mut packet, body.len())?;
    packet.extend(body);
    Ok(packet)
}

/// Builds CONNECT with clean session always set.
pub fn build_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_secs: u16,
) -> Result<Vec<u8>, EncodeError> {
    let mut body = Vec::with_capacity(16 + client_id.len());
    write_string(&mut body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = FLAG_CLEAN_SESSION;
    if username.is_some() {
        flags |= FLAG_USERNAME;
    }
    if password.is_some() {
        flags |= FLAG_PASSWORD;
    }
    body.push(flags);
    body.extend_from_slice(&keep_alive_secs.to_be_bytes());

    write_string(&mut body, client_id)?;
    if let Some(user) = username {
        write_string(&mut body, user)?;
    }
    if let Some(pass) = password {
        write_string(&mut body, pass)?;
    }

    frame(CONNECT, body)
}

/// Builds PUBLISH. A packet id is allocated (and held) only for QoS 1.
pub fn build_publish(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    ids: &mut PacketIds,
) -> Result<(Vec<u8>, Option<u16>), EncodeError> {
    let mut body = Vec::with_capacity(4 + topic.len() + payload.len());
    write_string(&mut body, topic)?;

    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => {
            let id = ids.allocate();
            body.extend_from_slice(&id.to_be_bytes());
            Some(id)
        }
    };
    body.extend_from_slice(payload);

    let packet = frame(PUBLISH | ((qos as u8) << 1), body)?;
    if let Some(id) = packet_id {
        ids.hold(id);
    }
    Ok((packet, packet_id))
}

pub fn build_puback(packet_id: u16) -> Vec<u8> {
    let [hi, lo] = packet_id.to_be_bytes();
    vec![PUBACK, 0x02, hi, lo]
}

pub fn build_subscribe(
    topic: &str,
    qos: QoS,
    ids: &mut PacketIds,
) -> Result<(Vec<u8>, u16), EncodeError> {
    let packet_id = ids.allocate();
    let mut body = Vec::with_capacity(5 + topic.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    write_string(&mut body, topic)?;
    body.push(qos as u8);
    Ok((frame(SUBSCRIBE, body)?, packet_id))
}

pub fn build_unsubscribe(topic: &str, ids: &mut PacketIds) -> Result<(Vec<u8>, u16), EncodeError> {
    let packet_id = ids.allocate();
    let mut body = Vec::with_capacity(4 + topic.len());
    body.extend_from_slice(&packet_id.to_be_bytes());
    write_string(&mut body, topic)?;
    Ok((frame(UNSUBSCRIBE, body)?, packet_id))
}

pub fn build_pingreq() -> Vec<u8> {
    vec![PINGREQ, 0x00]
}

pub fn build_disconnect() -> Vec<u8> {
    vec![DISCONNECT, 0x00]
}

/// An inbound PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Raw QoS bits from the fixed header.
    pub qos: u8,
    pub packet_id: Option<u16>,
    pub retain: bool,
    pub dup: bool,
}

/// Inbound packets this client understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        code: ConnectReturnCode,
    },
    Publish(Publish),
    PubAck {
        packet_id: u16,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingResp,
}

/// Splits a complete frame into its first byte and body.
fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    let first = *frame.first().ok_or(DecodeError::Incomplete)?;
    let (remaining, len_bytes) = decode_remaining_length(&frame[1..])?;
    let start = 1 + len_bytes;
    let body = frame
        .get(start..start + remaining)
        .ok_or(DecodeError::Incomplete)?;
    Ok((first, body))
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, DecodeError> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DecodeError::MalformedPacket("missing packet identifier"))
}

/// Decodes one complete frame. Unrecognized packet types yield `Ok(None)`.
pub fn decode_packet(frame: &[u8]) -> Result<Option<Packet>, DecodeError> {
    let (first, body) = split_frame(frame)?;

    let packet = match first >> 4 {
        2 => Packet::ConnAck {
            session_present: body.first().is_some_and(|b| b & 0x01 != 0),
            code: decode_connack(frame)?,
        },
        3 => Packet::Publish(decode_publish(frame)?),
        4 => Packet::PubAck {
            packet_id: read_u16(body, 0)?,
        },
        9 => Packet::SubAck {
            packet_id: read_u16(body, 0)?,
            return_codes: body[2..].to_vec(),
        },
        11 => Packet::UnsubAck {
            packet_id: read_u16(body, 0)?,
        },
        13 => Packet::PingResp,
        _ => return Ok(None),
    };
    Ok(Some(packet))
}

/// Reads the CONNACK return code at byte index 3.
pub fn decode_connack(frame: &[u8]) -> Result<ConnectReturnCode, DecodeError> {
    if frame.first().map(|b| b >> 4) != Some(CONNACK >> 4) {
        return Err(DecodeError::MalformedPacket("not a CONNACK"));
    }
    let code = *frame
        .get(3)
        .ok_or(DecodeError::MalformedPacket("CONNACK too short"))?;
    Ok(ConnectReturnCode::from(code))
}

pub fn decode_publish(frame: &[u8]) -> Result<Publish, DecodeError> {
    let (first, body) = split_frame(frame)?;
    if first >> 4 != PUBLISH >> 4 {
        return Err(DecodeError::MalformedPacket("not a PUBLISH"));
    }
    let qos = (first >> 1) & 0x03;

    let (topic, mut offset) = decode_string(body)?;
    let packet_id = if qos > 0 {
        let id = read_u16(body, offset)?;
        offset += 2;
        Some(id)
    } else {
        None
    };

    Ok(Publish {
        topic,
        payload: body[offset..].to_vec(),
        qos,
        packet_id,
        retain: first & 0x01 != 0,
        dup: first & 0x08 != 0,
    })
}

/// Largest frame MQTT 3.1.1 can describe: 1 type byte, 4 length bytes, 268435455 body bytes.
const MAX_FRAME_LEN: usize = 1 + 4 + 268_435_455;

/// Reassembles MQTT packets from arbitrarily split transport messages.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    limit: usize,
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }
}

impl PacketReader {
    /// A reader that refuses frames longer than `limit` bytes, header included.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes the next complete frame out of the buffer, if one is available.
    ///
    /// A malformed or oversized length clears the buffer since the stream cannot be
    /// resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        match decode_remaining_length(&self.buf[1..]) {
            Ok((remaining, len_bytes)) => {
                let total = 1 + len_bytes + remaining;
                if total > self.limit {
                    self.buf.clear();
                    return Err(DecodeError::PacketTooLarge {
                        size: total,
                        limit: self.limit,
                    });
                }
                if self.buf.len() < total {
                    self.buf.reserve(total - self.buf.len());
                    return Ok(None);
                }
                Ok(Some(self.buf.split_to(total).freeze()))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
