//! Local control socket: newline-delimited JSON commands in, replies and
//! notifications out. Stands in for the web UI.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use peerlink_core::Notification;

use crate::tasks::{Command, CommandEnvelope};

/// How long a client waits for the peering task to answer. A command still queued
/// when this passes is dropped by the peering task instead of run.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn run_control(
    listener: TcpListener,
    commands: mpsc::Sender<CommandEnvelope>,
    notes: broadcast::Sender<Notification>,
) -> std::io::Result<()> {
    info!("control socket on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let commands = commands.clone();
        let notes = notes.subscribe();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, addr, commands, notes).await {
                debug!("control client {}: {}", addr, e);
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    commands: mpsc::Sender<CommandEnvelope>,
    mut notes: broadcast::Receiver<Notification>,
) -> std::io::Result<()> {
    debug!("control client {} connected", addr);
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();
    loop {
        let out = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => dispatch(&commands, &line).await,
                None => break,
            },
            note = notes.recv() => match note {
                Ok(note) => note.to_json(),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("control client {} missed {} notifications", addr, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let mut bytes = serde_json::to_vec(&out)?;
        bytes.push(b'\n');
        w.write_all(&bytes).await?;
    }
    debug!("control client {} disconnected", addr);
    Ok(())
}

fn error_reply(kind: &str, error: impl std::fmt::Display) -> Value {
    json!({ "ok": false, "kind": kind, "error": error.to_string() })
}

/// Parse one request line, hand it to the peering task and wait for the reply.
pub async fn dispatch(commands: &mpsc::Sender<CommandEnvelope>, line: &str) -> Value {
    let command: Command = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return error_reply("invalid_argument", e),
    };
    let (env, rx) = CommandEnvelope::new(command);
    match commands.try_send(env) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => return error_reply("capacity_exceeded", "command queue full"),
        Err(TrySendError::Closed(_)) => return error_reply("invalid_state", "controller stopped"),
    }
    match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
        Ok(Ok(Ok(data))) => json!({ "ok": true, "data": data }),
        Ok(Ok(Err(e))) => error_reply(e.kind(), e),
        Ok(Err(_)) => error_reply("invalid_state", "controller stopped"),
        Err(_) => error_reply(
            "timeout",
            "no reply from peering task; the command was not run if it had not started",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::{MacAddr, PeerError};

    /// Answer commands on a plain thread like the peering task would.
    fn responder(mut rx: mpsc::Receiver<CommandEnvelope>) {
        std::thread::spawn(move || {
            while let Some(env) = rx.blocking_recv() {
                let result = match env.command {
                    Command::ListBlacklist => Ok(json!(["24:6f:28:00:00:09"])),
                    Command::AcceptPeer { mac } => Err(PeerError::NotFound(mac)),
                    _ => Ok(Value::Null),
                };
                if let Some(reply) = env.reply {
                    let _ = reply.send(result);
                }
            }
        });
    }

    #[tokio::test]
    async fn malformed_request_is_invalid_argument() {
        let (tx, _rx) = mpsc::channel(1);
        let reply = dispatch(&tx, "{\"cmd\":\"accept_peer\"}").await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn errors_carry_kind() {
        let (tx, rx) = mpsc::channel(5);
        responder(rx);
        let mac = MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 1]);
        let line = format!("{{\"cmd\":\"accept_peer\",\"mac\":\"{}\"}}", mac);
        let reply = dispatch(&tx, &line).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["kind"], "not_found");
    }

    #[tokio::test]
    async fn full_queue_rejected_without_waiting() {
        let (tx, _rx) = mpsc::channel(1);
        let (env, _reply) = CommandEnvelope::new(Command::ListPeers);
        tx.try_send(env).unwrap();
        let reply = dispatch(&tx, "{\"cmd\":\"list_peers\"}").await;
        assert_eq!(reply["kind"], "capacity_exceeded");
    }

    #[tokio::test]
    async fn socket_round_trip_and_notifications() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(5);
        responder(rx);
        let (notes, _) = broadcast::channel(8);
        tokio::spawn(run_control(listener, tx, notes.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, mut w) = stream.into_split();
        let mut lines = BufReader::new(r).lines();

        w.write_all(b"{\"cmd\":\"list_blacklist\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, json!({ "ok": true, "data": ["24:6f:28:00:00:09"] }));

        notes.send(Notification::PeersChanged).unwrap();
        let note: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(note, json!({ "event": "peers_changed" }));
    }
}
