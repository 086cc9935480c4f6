//! Radio peering protocol: message types, payloads and version.

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;

/// Current protocol version. Messages carrying any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Longest display name carried on the wire (a NUL terminator follows it).
pub const MAX_NAME_LEN: usize = 15;

/// Number of sensor channels in a telemetry sample.
pub const SENSOR_CHANNELS: usize = 3;

/// Kind of device on the other end of a link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Sensor,
    Relay,
    Switch,
    Unknown,
}

impl PeerKind {
    pub fn to_wire(self) -> u8 {
        match self {
            PeerKind::Sensor => 0,
            PeerKind::Relay => 1,
            PeerKind::Switch => 2,
            PeerKind::Unknown => 3,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            0 => PeerKind::Sensor,
            1 => PeerKind::Relay,
            2 => PeerKind::Switch,
            _ => PeerKind::Unknown,
        }
    }
}

/// What a sensor peer measures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorSubtype {
    Temperature,
    Humidity,
    Light,
    Unknown,
}

impl SensorSubtype {
    pub fn to_wire(self) -> u8 {
        match self {
            SensorSubtype::Temperature => 0,
            SensorSubtype::Humidity => 1,
            SensorSubtype::Light => 2,
            SensorSubtype::Unknown => 3,
        }
    }

    pub fn from_wire(b: u8) -> Self {
        match b {
            0 => SensorSubtype::Temperature,
            1 => SensorSubtype::Humidity,
            2 => SensorSubtype::Light,
            _ => SensorSubtype::Unknown,
        }
    }
}

/// Timestamped snapshot of a peer's sensor, relay and switch state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Seconds since the Unix epoch, as stamped by the peer.
    pub timestamp: u32,
    pub sensor_values: [f32; SENSOR_CHANNELS],
    pub relay_state: bool,
    pub switch_state: bool,
}

/// Identity a device advertises while peering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringDescriptor {
    pub name: String,
    pub kind: PeerKind,
    /// Only meaningful when `kind` is [`PeerKind::Sensor`].
    pub subtype: SensorSubtype,
}

impl PeeringDescriptor {
    pub fn new(name: &str, kind: PeerKind, subtype: SensorSubtype) -> Self {
        Self {
            name: truncate_name(name),
            kind,
            subtype,
        }
    }
}

/// Message body, one variant per message type. The wire tag selects the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Controller asks nearby devices to identify themselves. Broadcast.
    PeerRequest(PeeringDescriptor),
    /// Device answers a request and advertises itself.
    PeerAccept(PeeringDescriptor),
    /// Controller picked this device; link is now encrypted.
    PeerAcceptConfirm,
    /// Device acknowledges the confirm; controller persists it.
    PeerConfirmed(PeeringDescriptor),
    /// Move to another radio channel.
    ChannelChange(u8),
    /// Telemetry report.
    Data(TelemetrySample),
}

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageType {
    PeerRequest = 0,
    PeerAccept = 1,
    PeerAcceptConfirm = 2,
    PeerConfirmed = 3,
    ChannelChange = 4,
    Data = 5,
}

impl MessageType {
    pub fn from_wire(b: u8) -> Option<Self> {
        Some(match b {
            0 => MessageType::PeerRequest,
            1 => MessageType::PeerAccept,
            2 => MessageType::PeerAcceptConfirm,
            3 => MessageType::PeerConfirmed,
            4 => MessageType::ChannelChange,
            5 => MessageType::Data,
            _ => return None,
        })
    }
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::PeerRequest(_) => MessageType::PeerRequest,
            Payload::PeerAccept(_) => MessageType::PeerAccept,
            Payload::PeerAcceptConfirm => MessageType::PeerAcceptConfirm,
            Payload::PeerConfirmed(_) => MessageType::PeerConfirmed,
            Payload::ChannelChange(_) => MessageType::ChannelChange,
            Payload::Data(_) => MessageType::Data,
        }
    }

    /// Whether this message type may be sent to the broadcast address.
    pub fn allows_broadcast(&self) -> bool {
        matches!(self, Payload::PeerRequest(_) | Payload::ChannelChange(_))
    }
}

/// One protocol message as exchanged over the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    pub version: u8,
    pub destination: MacAddr,
    /// On receive this is always the transport-reported sender, never the payload's claim.
    pub source: MacAddr,
    pub payload: Payload,
}

impl PeerMessage {
    /// Build a message stamped with the current protocol version.
    pub fn new(source: MacAddr, destination: MacAddr, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            destination,
            source,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Clip a display name to [`MAX_NAME_LEN`] bytes without splitting a character.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
