//! Minimal MQTT 3.1.1 client codec: just the packets a subscribe-only client
//! exchanges with the broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const SUBACK_FAILURE: u8 = 0x80;

/// Packets a client receives from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        qos: u8,
        packet_id: Option<u16>,
        payload: Bytes,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    PingResp,
    /// Anything a subscriber has no use for; carries the packet type nibble
    Ignored(u8),
}

impl Packet {
    pub fn is_subscription_refused(return_codes: &[u8]) -> bool {
        return_codes.iter().any(|&code| code == SUBACK_FAILURE)
    }
}

/// Human-readable CONNACK refusal reason
pub fn connack_reason(return_code: u8) -> &'static str {
    match return_code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

pub fn connect(client_id: &str, keep_alive_secs: u16) -> Result<Bytes, TransportError> {
    let mut body = BytesMut::new();
    put_str(&mut body, "MQTT")?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(CLEAN_SESSION);
    body.put_u16(keep_alive_secs);
    put_str(&mut body, client_id)?;
    Ok(frame(CONNECT, &body))
}

/// SUBSCRIBE for a single topic at QoS 0
pub fn subscribe(packet_id: u16, topic: &str) -> Result<Bytes, TransportError> {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    put_str(&mut body, topic)?;
    body.put_u8(0);
    Ok(frame(SUBSCRIBE, &body))
}

pub fn puback(packet_id: u16) -> Bytes {
    frame(PUBACK, &packet_id.to_be_bytes())
}

pub fn pingreq() -> Bytes {
    frame(PINGREQ, &[])
}

pub fn disconnect() -> Bytes {
    frame(DISCONNECT, &[])
}

/// Decode one packet off the front of `buf`, or `None` if it is still incomplete
pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
    let Some((remaining, header_len)) = remaining_length(buf)? else {
        return Ok(None);
    };
    if buf.len() < header_len + remaining {
        return Ok(None);
    }

    let first = buf[0];
    let mut body = buf.split_to(header_len + remaining).freeze();
    body.advance(header_len);

    let packet = match first & 0xF0 {
        CONNACK => {
            ensure_len(&body, 2, "CONNACK")?;
            Packet::ConnAck {
                session_present: body[0] & 0x01 == 1,
                return_code: body[1],
            }
        }
        PUBLISH => {
            let qos = (first >> 1) & 0x03;
            let topic = take_str(&mut body)?;
            let packet_id = if qos > 0 {
                ensure_len(&body, 2, "PUBLISH")?;
                Some(body.get_u16())
            } else {
                None
            };
            Packet::Publish {
                topic,
                qos,
                packet_id,
                payload: body,
            }
        }
        SUBACK => {
            ensure_len(&body, 2, "SUBACK")?;
            let packet_id = body.get_u16();
            Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }
        }
        PINGRESP => Packet::PingResp,
        other => Packet::Ignored(other >> 4),
    };
    Ok(Some(packet))
}

/// Parse the variable-length "remaining length" field
fn remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, TransportError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().skip(1).take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 2)));
        }
    }
    if buf.len() >= 5 {
        return Err(TransportError::Protocol(
            "malformed remaining length".to_string(),
        ));
    }
    Ok(None)
}

fn frame(packet_type: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(packet_type);
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
    out.put_slice(body);
    out.freeze()
}

/// Length-prefixed UTF-8 string; MQTT caps these at 65535 bytes
fn put_str(buf: &mut BytesMut, value: &str) -> Result<(), TransportError> {
    let len = u16::try_from(value.len()).map_err(|_| {
        TransportError::Protocol(format!("string of {} bytes is too long", value.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_str(body: &mut Bytes) -> Result<String, TransportError> {
    ensure_len(body, 2, "string length")?;
    let len = usize::from(body.get_u16());
    ensure_len(body, len, "string")?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::Protocol("topic is not valid UTF-8".to_string()))
}

fn ensure_len(body: &Bytes, needed: usize, what: &str) -> Result<(), TransportError> {
    if body.len() < needed {
        return Err(TransportError::Protocol(format!("truncated {what}")));
    }
    Ok(())
}
