//! PeerLink controller core: radio peering protocol, peer registry and telemetry batching.
//! Host-driven: no I/O; host passes commands, messages and ticks and performs the returned actions.

pub mod error;
pub mod mac;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod wire;

pub use crate::core::{FoundPeer, Notification, OutboundAction, PeeringCore, DEFAULT_PEERING_TIMEOUT};
pub use error::{PeerError, PeerResult};
pub use mac::MacAddr;
pub use protocol::{
    Payload, PeerKind, PeerMessage, PeeringDescriptor, SensorSubtype, TelemetrySample,
    PROTOCOL_VERSION,
};
pub use registry::{PeerRecord, SharedRegistry, TelemetrySink};
pub use store::{BlobStore, MemoryStore, RetryPolicy, StoreError};
pub use telemetry::{LogBatcher, LogWriteError, LogWriter};
pub use wire::{decode_message, encode_message, FrameDecodeError, MESSAGE_LEN};

pub mod core;
