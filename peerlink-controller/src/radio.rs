//! Emulated radio: UDP multicast medium shared by every node on the LAN segment.
//! Broadcast frames go out in the clear; unicast frames to registered peers are
//! sealed with ChaCha20-Poly1305 under the shared link key.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use peerlink_core::{decode_message, encode_message, MacAddr, PeerMessage};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

/// Radio-level peer table limit.
pub const MAX_RADIO_PEERS: usize = 20;

const HEADER_LEN: usize = 13;
const NONCE_LEN: usize = 12;
const FLAG_SEALED: u8 = 0x01;

/// Outbound half of the radio, as seen by the peering task.
pub trait Radio: Send + Sync {
    fn broadcast(&self, msg: &PeerMessage) -> Result<(), RadioError>;
    fn unicast(&self, dest: MacAddr, msg: &PeerMessage) -> Result<(), RadioError>;
    /// Add `addr` to the peer table with the shared link key. Idempotent.
    fn register_encrypted_peer(&self, addr: MacAddr) -> Result<(), RadioError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer {0} not registered")]
    UnknownPeer(MacAddr),
    #[error("radio peer table full")]
    PeerTableFull,
    #[error("failed to seal frame")]
    Seal,
}

/// Inbound callbacks. Never blocks: frames are decoded and offered to the event queue.
#[derive(Clone)]
pub struct RadioInbox {
    events: mpsc::Sender<PeerMessage>,
}

impl RadioInbox {
    pub fn new(events: mpsc::Sender<PeerMessage>) -> Self {
        Self { events }
    }

    /// Validate `bytes` from `sender` and queue the message for the peering task.
    pub fn on_receive(&self, sender: MacAddr, bytes: &[u8]) {
        let msg = match decode_message(bytes, sender) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping frame from {}: {}", sender, e);
                return;
            }
        };
        match self.events.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("event queue full, dropping message from {}", sender),
            Err(TrySendError::Closed(_)) => debug!("event queue closed"),
        }
    }

    pub fn on_send_complete(&self, addr: MacAddr, ok: bool) {
        if ok {
            debug!("send to {} succeeded", addr);
        } else {
            warn!("send to {} failed", addr);
        }
    }
}

/// Per-link AEAD keyed from the configured link key.
pub struct LinkCipher {
    cipher: ChaCha20Poly1305,
}

impl LinkCipher {
    pub fn new(link_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"peerlink-link-v1");
        hasher.update(link_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// `nonce(12) | ciphertext`, authenticating `header`.
    pub fn seal(&self, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, RadioError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| RadioError::Seal)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn open(&self, header: &[u8], body: &[u8]) -> Option<Vec<u8>> {
        if body.len() < NONCE_LEN {
            return None;
        }
        let (nonce, ct) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), AeadPayload { msg: ct, aad: header })
            .ok()
    }
}

fn frame_header(src: MacAddr, dst: MacAddr, flags: u8) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..6].copy_from_slice(src.as_bytes());
    h[6..12].copy_from_slice(dst.as_bytes());
    h[12] = flags;
    h
}

/// Build a datagram carrying `plaintext` from `src` to `dst`, sealed when `cipher` is given.
pub fn build_frame(
    src: MacAddr,
    dst: MacAddr,
    plaintext: &[u8],
    cipher: Option<&LinkCipher>,
) -> Result<Vec<u8>, RadioError> {
    let flags = if cipher.is_some() { FLAG_SEALED } else { 0 };
    let header = frame_header(src, dst, flags);
    let body = match cipher {
        Some(c) => c.seal(&header, plaintext)?,
        None => plaintext.to_vec(),
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Accept a datagram seen on the medium. Returns the sender and message bytes when the
/// frame is for `own` (or broadcast), not our own echo, and opens cleanly.
///
/// Registered peers must seal their unicast frames; sealed frames are only taken
/// from registered peers.
pub fn accept_frame(
    own: MacAddr,
    cipher: &LinkCipher,
    registered: &[MacAddr],
    datagram: &[u8],
) -> Option<(MacAddr, Vec<u8>)> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let (header, body) = datagram.split_at(HEADER_LEN);
    let mut src = [0u8; 6];
    src.copy_from_slice(&header[0..6]);
    let mut dst = [0u8; 6];
    dst.copy_from_slice(&header[6..12]);
    let (src, dst) = (MacAddr::new(src), MacAddr::new(dst));
    if src == own || (dst != own && !dst.is_broadcast()) {
        return None;
    }
    let known = registered.contains(&src);
    if header[12] & FLAG_SEALED != 0 {
        if !known {
            debug!("sealed frame from unregistered {}", src);
            return None;
        }
        match cipher.open(header, body) {
            Some(pt) => Some((src, pt)),
            None => {
                debug!("sealed frame from {} failed to open", src);
                None
            }
        }
    } else if known && !dst.is_broadcast() {
        warn!("cleartext unicast from encrypted peer {}, dropped", src);
        None
    } else {
        Some((src, body.to_vec()))
    }
}

/// UDP multicast implementation of [`Radio`].
pub struct UdpRadio {
    socket: UdpSocket,
    group: SocketAddr,
    own: MacAddr,
    cipher: LinkCipher,
    peers: Mutex<Vec<MacAddr>>,
    inbox: RadioInbox,
}

impl UdpRadio {
    /// Must be called inside the tokio runtime.
    pub fn bind(port: u16, own: MacAddr, link_key: &str, inbox: RadioInbox) -> std::io::Result<Self> {
        let socket = make_multicast_socket(port)?;
        info!("radio {} on {}:{}", own, MULTICAST_GROUP, port);
        Ok(Self {
            socket,
            group: SocketAddrV4::new(MULTICAST_GROUP, port).into(),
            own,
            cipher: LinkCipher::new(link_key),
            peers: Mutex::new(Vec::new()),
            inbox,
        })
    }

    /// Non-blocking send; callable from blocking threads.
    fn send(&self, dst: MacAddr, msg: &PeerMessage, sealed: bool) -> Result<(), RadioError> {
        let bytes = encode_message(msg);
        let frame = build_frame(self.own, dst, &bytes, sealed.then_some(&self.cipher))?;
        let result = self.socket.try_send_to(&frame, self.group);
        self.inbox.on_send_complete(dst, result.is_ok());
        result?;
        Ok(())
    }

    /// Receive until `shutdown` flips.
    pub async fn run_receiver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => r,
                _ = shutdown.changed() => break,
            };
            match received {
                Ok((n, _)) => {
                    let registered = self.peers.lock().clone();
                    if let Some((src, bytes)) =
                        accept_frame(self.own, &self.cipher, &registered, &buf[..n])
                    {
                        self.inbox.on_receive(src, &bytes);
                    }
                }
                Err(e) => warn!("radio receive error: {}", e),
            }
        }
        debug!("radio receiver stopped");
    }
}

impl Radio for UdpRadio {
    fn broadcast(&self, msg: &PeerMessage) -> Result<(), RadioError> {
        self.send(MacAddr::BROADCAST, msg, false)
    }

    fn unicast(&self, dest: MacAddr, msg: &PeerMessage) -> Result<(), RadioError> {
        if !self.peers.lock().contains(&dest) {
            return Err(RadioError::UnknownPeer(dest));
        }
        self.send(dest, msg, true)
    }

    fn register_encrypted_peer(&self, addr: MacAddr) -> Result<(), RadioError> {
        let mut peers = self.peers.lock();
        if peers.contains(&addr) {
            return Ok(());
        }
        if peers.len() >= MAX_RADIO_PEERS {
            return Err(RadioError::PeerTableFull);
        }
        peers.push(addr);
        debug!("registered encrypted peer {}", addr);
        Ok(())
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{Payload, PeerKind, PeeringDescriptor, SensorSubtype, MESSAGE_LEN};

    const US: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 1]);
    const NODE: MacAddr = MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 7]);

    fn accept_msg() -> PeerMessage {
        PeerMessage::new(
            NODE,
            US,
            Payload::PeerAccept(PeeringDescriptor::new(
                "Attic",
                PeerKind::Sensor,
                SensorSubtype::Humidity,
            )),
        )
    }

    #[test]
    fn unsupported_version_never_queued() {
        let (tx, mut rx) = mpsc::channel(10);
        let inbox = RadioInbox::new(tx);
        let mut bytes = encode_message(&accept_msg());
        bytes[0] = 2;
        inbox.on_receive(NODE, &bytes);
        inbox.on_receive(NODE, &bytes[..10]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn valid_frame_queued_with_sender_as_source() {
        let (tx, mut rx) = mpsc::channel(10);
        let inbox = RadioInbox::new(tx);
        let bytes = encode_message(&accept_msg());
        let other = MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 9]);
        inbox.on_receive(other, &bytes);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.source, other);
        assert_eq!(got.destination, US);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let inbox = RadioInbox::new(tx);
        let bytes = encode_message(&accept_msg());
        inbox.on_receive(NODE, &bytes);
        inbox.on_receive(NODE, &bytes);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sealed_frame_opens_for_addressee() {
        let cipher = LinkCipher::new("lmk1234567890123");
        let bytes = encode_message(&accept_msg());
        let frame = build_frame(NODE, US, &bytes, Some(&cipher)).unwrap();
        assert_ne!(&frame[HEADER_LEN..], &bytes[..]);
        let (src, pt) = accept_frame(US, &cipher, &[NODE], &frame).unwrap();
        assert_eq!(src, NODE);
        assert_eq!(pt.len(), MESSAGE_LEN);
        assert_eq!(&pt[..], &bytes[..]);
    }

    #[test]
    fn wrong_key_or_tampered_header_rejected() {
        let cipher = LinkCipher::new("lmk1234567890123");
        let other = LinkCipher::new("another-key");
        let bytes = encode_message(&accept_msg());
        let frame = build_frame(NODE, US, &bytes, Some(&cipher)).unwrap();
        assert!(accept_frame(US, &other, &[NODE], &frame).is_none());
        let mut redirected = frame.clone();
        redirected[6..12].copy_from_slice(MacAddr::BROADCAST.as_bytes());
        assert!(accept_frame(US, &cipher, &[NODE], &redirected).is_none());
    }

    #[test]
    fn filters_echo_and_foreign_frames() {
        let cipher = LinkCipher::new("k");
        let third = MacAddr::new([0x02, 0, 0, 0, 0, 3]);
        let echo = build_frame(US, MacAddr::BROADCAST, b"x", None).unwrap();
        assert!(accept_frame(US, &cipher, &[], &echo).is_none());
        let foreign = build_frame(NODE, third, b"x", None).unwrap();
        assert!(accept_frame(US, &cipher, &[], &foreign).is_none());
        let bcast = build_frame(NODE, MacAddr::BROADCAST, b"x", None).unwrap();
        assert_eq!(accept_frame(US, &cipher, &[], &bcast), Some((NODE, b"x".to_vec())));
        assert!(accept_frame(US, &cipher, &[], &bcast[..5]).is_none());
    }

    #[test]
    fn cleartext_unicast_from_registered_peer_dropped() {
        let cipher = LinkCipher::new("lmk1234567890123");
        let data = PeerMessage::new(NODE, US, Payload::Data(Default::default()));
        let frame = build_frame(NODE, US, &encode_message(&data), None).unwrap();
        assert!(accept_frame(US, &cipher, &[NODE], &frame).is_none());
        // PEER_ACCEPT arrives in the clear before the sender is linked.
        assert!(accept_frame(US, &cipher, &[], &frame).is_some());
        let bcast = build_frame(NODE, MacAddr::BROADCAST, b"x", None).unwrap();
        assert!(accept_frame(US, &cipher, &[NODE], &bcast).is_some());
    }

    #[test]
    fn sealed_frame_from_unregistered_sender_dropped() {
        let cipher = LinkCipher::new("lmk1234567890123");
        let frame = build_frame(NODE, US, &encode_message(&accept_msg()), Some(&cipher)).unwrap();
        assert!(accept_frame(US, &cipher, &[], &frame).is_none());
        let other = MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 8]);
        assert!(accept_frame(US, &cipher, &[other], &frame).is_none());
    }
}
