//! Host-driven API: PeeringCore receives commands, radio messages and ticks from the
//! host and returns actions for it to perform.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{PeerError, PeerResult};
use crate::mac::MacAddr;
use crate::protocol::{
    Payload, PeerKind, PeerMessage, PeeringDescriptor, SensorSubtype,
};
use crate::registry::{SharedRegistry, DEFAULT_INTERVAL_SEC, MAX_PEERS};

/// Default discovery window, measured from the request broadcast.
pub const DEFAULT_PEERING_TIMEOUT: Duration = Duration::from_millis(5000);

/// Capacity of the radio link table (peers registered for encrypted unicast).
pub const MAX_LINKS: usize = MAX_PEERS;

/// A device that answered the current discovery round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundPeer {
    pub mac: MacAddr,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PeerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<SensorSubtype>,
}

/// Event pushed to the web collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    FoundPeers { peers: Vec<FoundPeer> },
    PeerFailed { message: String },
    /// The confirmed peer list changed; any discovery view can be retired.
    PeersChanged,
}

impl Notification {
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::FoundPeers { .. } => "found_peers",
            Notification::PeerFailed { .. } => "peer_failed",
            Notification::PeersChanged => "peers_changed",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Action for host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    Broadcast(PeerMessage),
    Unicast(MacAddr, PeerMessage),
    /// Register the address at the radio with the shared link key before unicasting to it.
    RegisterEncryptedPeer(MacAddr),
    Notify(Notification),
}

/// Open discovery round.
struct DiscoverySession {
    started: Instant,
    found: Vec<FoundPeer>,
}

/// Peering state machine. Owned by the peering task; never shared.
pub struct PeeringCore {
    own_mac: MacAddr,
    name: String,
    timeout: Duration,
    session: Option<DiscoverySession>,
    links: Vec<MacAddr>,
}

impl PeeringCore {
    pub fn new(own_mac: MacAddr, name: &str) -> Self {
        Self {
            own_mac,
            name: crate::protocol::truncate_name(name),
            timeout: DEFAULT_PEERING_TIMEOUT,
            session: None,
            links: Vec::with_capacity(MAX_LINKS),
        }
    }

    /// Set a custom discovery window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn own_mac(&self) -> MacAddr {
        self.own_mac
    }

    pub fn is_discovering(&self) -> bool {
        self.session.is_some()
    }

    /// Addresses registered at the radio for encrypted unicast.
    pub fn links(&self) -> &[MacAddr] {
        &self.links
    }

    /// Re-link peers confirmed before a restart. Returns the radio registrations to perform.
    pub fn restore_links(&mut self, macs: &[MacAddr]) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for mac in macs {
            if self.links.contains(mac) {
                continue;
            }
            if self.links.len() >= MAX_LINKS {
                warn!("link table full, not restoring {}", mac);
                break;
            }
            self.links.push(*mac);
            actions.push(OutboundAction::RegisterEncryptedPeer(*mac));
        }
        actions
    }

    /// Broadcast a peering request and open a discovery window starting at `now`.
    /// An open window is replaced and its findings discarded.
    pub fn start_peering(&mut self, now: Instant) -> Vec<OutboundAction> {
        if let Some(old) = self.session.take() {
            info!(
                "discovery restarted, discarding {} unreported peers",
                old.found.len()
            );
        }
        let request = PeerMessage::new(
            self.own_mac,
            MacAddr::BROADCAST,
            Payload::PeerRequest(PeeringDescriptor::new(
                &self.name,
                PeerKind::Unknown,
                SensorSubtype::Unknown,
            )),
        );
        self.session = Some(DiscoverySession {
            started: now,
            found: Vec::new(),
        });
        info!("started peering broadcast");
        vec![OutboundAction::Broadcast(request)]
    }

    /// Drop the open window without reporting (the request never went out).
    pub fn cancel_peering(&mut self) {
        self.session = None;
    }

    /// User picked `mac` from the discovery results: link it and confirm.
    pub fn accept_peer(&mut self, mac: MacAddr) -> PeerResult<Vec<OutboundAction>> {
        if mac.is_broadcast() || mac == self.own_mac {
            return Err(PeerError::InvalidArgument(format!("cannot accept {}", mac)));
        }
        if !self.links.contains(&mac) {
            if self.links.len() >= MAX_LINKS {
                error!("max peer capacity reached");
                return Err(PeerError::CapacityExceeded("radio peer table"));
            }
            self.links.push(mac);
        }
        info!("accepted peer {}", mac);
        Ok(vec![
            OutboundAction::RegisterEncryptedPeer(mac),
            OutboundAction::Unicast(
                mac,
                PeerMessage::new(self.own_mac, mac, Payload::PeerAcceptConfirm),
            ),
        ])
    }

    /// Free the link slot of `mac` after the radio refused to register it.
    pub fn release_link(&mut self, mac: &MacAddr) {
        self.links.retain(|m| m != mac);
    }

    /// Handle one validated inbound message.
    pub fn on_message(
        &mut self,
        msg: PeerMessage,
        registry: &SharedRegistry,
        now: Instant,
    ) -> Vec<OutboundAction> {
        let from = msg.source;
        let to_us = msg.destination == self.own_mac;
        let mut actions = Vec::new();
        match msg.payload {
            Payload::PeerRequest(_) => {
                debug!("ignoring PEER_REQUEST from {}", from);
            }
            Payload::PeerAccept(d) => {
                if to_us {
                    self.on_accept(from, d, registry, now);
                }
            }
            Payload::PeerAcceptConfirm => {
                info!("received PEER_ACCEPT_CONFIRM from {}", from);
            }
            Payload::PeerConfirmed(d) => {
                if to_us {
                    info!("peer {} fully confirmed", from);
                    let subtypes: &[SensorSubtype] = if d.kind == PeerKind::Sensor {
                        std::slice::from_ref(&d.subtype)
                    } else {
                        &[]
                    };
                    match registry.add_peer(from, d.kind, &d.name, subtypes, DEFAULT_INTERVAL_SEC)
                    {
                        Ok(()) => actions.push(OutboundAction::Notify(Notification::PeersChanged)),
                        Err(e) => error!("failed to add peer {}: {}", from, e),
                    }
                }
            }
            Payload::ChannelChange(channel) => {
                info!("received CHANNEL_CHANGE ({}) from {}", channel, from);
            }
            Payload::Data(sample) => {
                debug!("received DATA from {}", from);
                if let Err(e) = registry.update_telemetry(from, sample) {
                    warn!("telemetry from {} dropped: {}", from, e);
                }
            }
        }
        actions
    }

    fn on_accept(
        &mut self,
        from: MacAddr,
        d: PeeringDescriptor,
        registry: &SharedRegistry,
        now: Instant,
    ) {
        let timeout = self.timeout;
        let Some(session) = self.session.as_mut() else {
            debug!("PEER_ACCEPT from {} outside discovery", from);
            return;
        };
        if now.saturating_duration_since(session.started) >= timeout {
            debug!("PEER_ACCEPT from {} after window closed", from);
            return;
        }
        info!("received PEER_ACCEPT from {}", from);
        if registry.is_blacklisted(&from) {
            info!("peer {} is blacklisted, skipping", from);
            return;
        }
        if session.found.iter().any(|p| p.mac == from) {
            return;
        }
        session.found.push(FoundPeer {
            mac: from,
            subtype: (d.kind == PeerKind::Sensor).then_some(d.subtype),
            name: d.name,
            kind: d.kind,
        });
    }

    /// The one place a discovery window closes. Call once per polling tick.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<OutboundAction> {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|s| now.saturating_duration_since(s.started) >= self.timeout);
        if !expired {
            return vec![];
        }
        let Some(session) = self.session.take() else {
            return vec![];
        };
        let note = if session.found.is_empty() {
            info!("peering window closed, no peers responded");
            Notification::PeerFailed {
                message: "No peers responded".to_string(),
            }
        } else {
            info!("peering window closed, {} peers found", session.found.len());
            Notification::FoundPeers {
                peers: session.found,
            }
        };
        vec![OutboundAction::Notify(note)]
    }

    /// One CHANNEL_CHANGE unicast per confirmed peer. Empty when there are none.
    pub fn channel_change(
        &self,
        channel: u8,
        registry: &SharedRegistry,
    ) -> PeerResult<Vec<OutboundAction>> {
        let macs = registry.confirmed_macs()?;
        if macs.is_empty() {
            info!("no peers to send CHANNEL_CHANGE");
        }
        Ok(macs
            .into_iter()
            .map(|mac| {
                OutboundAction::Unicast(
                    mac,
                    PeerMessage::new(self.own_mac, mac, Payload::ChannelChange(channel)),
                )
            })
            .collect())
    }
}
