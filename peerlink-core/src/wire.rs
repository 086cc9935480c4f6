//! Framing: fixed 32-byte layout, sent as-is over the radio.
//!
//! `version(1) | destination(6) | source(6) | type(1) | payload(18)`, little-endian,
//! payload zero padded.

use crate::mac::{MacAddr, MAC_LEN};
use crate::protocol::{
    MessageType, Payload, PeerKind, PeerMessage, PeeringDescriptor, SensorSubtype,
    TelemetrySample, MAX_NAME_LEN, PROTOCOL_VERSION, SENSOR_CHANNELS,
};

const VERSION_OFFSET: usize = 0;
const DEST_OFFSET: usize = 1;
const SOURCE_OFFSET: usize = DEST_OFFSET + MAC_LEN;
const TYPE_OFFSET: usize = SOURCE_OFFSET + MAC_LEN;
const PAYLOAD_OFFSET: usize = TYPE_OFFSET + 1;
const NAME_FIELD_LEN: usize = MAX_NAME_LEN + 1;

/// Payload area size: the larger of the telemetry and descriptor layouts.
pub const PAYLOAD_LEN: usize = 18;

/// Size of every message on the wire.
pub const MESSAGE_LEN: usize = PAYLOAD_OFFSET + PAYLOAD_LEN;

/// Encode a message into its fixed wire layout.
pub fn encode_message(msg: &PeerMessage) -> [u8; MESSAGE_LEN] {
    let mut out = [0u8; MESSAGE_LEN];
    out[VERSION_OFFSET] = msg.version;
    out[DEST_OFFSET..SOURCE_OFFSET].copy_from_slice(msg.destination.as_bytes());
    out[SOURCE_OFFSET..TYPE_OFFSET].copy_from_slice(msg.source.as_bytes());
    out[TYPE_OFFSET] = msg.message_type() as u8;
    let payload = &mut out[PAYLOAD_OFFSET..];
    match &msg.payload {
        Payload::PeerRequest(d) | Payload::PeerAccept(d) | Payload::PeerConfirmed(d) => {
            encode_descriptor(d, payload)
        }
        Payload::PeerAcceptConfirm => {}
        Payload::ChannelChange(channel) => payload[0] = *channel,
        Payload::Data(sample) => encode_sample(sample, payload),
    }
    out
}

fn encode_descriptor(d: &PeeringDescriptor, out: &mut [u8]) {
    let name = crate::protocol::truncate_name(&d.name);
    out[..name.len()].copy_from_slice(name.as_bytes());
    out[NAME_FIELD_LEN] = d.kind.to_wire();
    out[NAME_FIELD_LEN + 1] = d.subtype.to_wire();
}

fn encode_sample(s: &TelemetrySample, out: &mut [u8]) {
    out[0..4].copy_from_slice(&s.timestamp.to_le_bytes());
    for (i, v) in s.sensor_values.iter().enumerate() {
        let at = 4 + i * 4;
        out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
    out[4 + SENSOR_CHANNELS * 4] = s.relay_state as u8;
    out[5 + SENSOR_CHANNELS * 4] = s.switch_state as u8;
}

/// Decode one message received from `sender`.
///
/// The source field is replaced with `sender`. Buffers longer than [`MESSAGE_LEN`]
/// are accepted; the excess is ignored.
pub fn decode_message(bytes: &[u8], sender: MacAddr) -> Result<PeerMessage, FrameDecodeError> {
    if bytes.len() < MESSAGE_LEN {
        return Err(FrameDecodeError::TooShort(bytes.len()));
    }
    let version = bytes[VERSION_OFFSET];
    if version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::UnsupportedVersion(version));
    }
    let tag = bytes[TYPE_OFFSET];
    let kind = MessageType::from_wire(tag).ok_or(FrameDecodeError::UnknownType(tag))?;
    let payload = &bytes[PAYLOAD_OFFSET..MESSAGE_LEN];
    let payload = match kind {
        MessageType::PeerRequest => Payload::PeerRequest(decode_descriptor(payload)),
        MessageType::PeerAccept => Payload::PeerAccept(decode_descriptor(payload)),
        MessageType::PeerAcceptConfirm => Payload::PeerAcceptConfirm,
        MessageType::PeerConfirmed => Payload::PeerConfirmed(decode_descriptor(payload)),
        MessageType::ChannelChange => Payload::ChannelChange(payload[0]),
        MessageType::Data => Payload::Data(decode_sample(payload)),
    };
    Ok(PeerMessage {
        version,
        destination: MacAddr::from_slice(&bytes[DEST_OFFSET..SOURCE_OFFSET]),
        source: sender,
        payload,
    })
}

fn decode_descriptor(p: &[u8]) -> PeeringDescriptor {
    let field = &p[..MAX_NAME_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
    PeeringDescriptor {
        name: String::from_utf8_lossy(&field[..end]).into_owned(),
        kind: PeerKind::from_wire(p[NAME_FIELD_LEN]),
        subtype: SensorSubtype::from_wire(p[NAME_FIELD_LEN + 1]),
    }
}

fn decode_sample(p: &[u8]) -> TelemetrySample {
    let word = |at: usize| [p[at], p[at + 1], p[at + 2], p[at + 3]];
    let mut sensor_values = [0f32; SENSOR_CHANNELS];
    for (i, v) in sensor_values.iter_mut().enumerate() {
        *v = f32::from_le_bytes(word(4 + i * 4));
    }
    TelemetrySample {
        timestamp: u32::from_le_bytes(word(0)),
        sensor_values,
        relay_state: p[4 + SENSOR_CHANNELS * 4] != 0,
        switch_state: p[5 + SENSOR_CHANNELS * 4] != 0,
    }
}

/// Error decoding a received message (too short, wrong version, or unknown type).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownType(u8),
}
