//! The two long-running tasks: peering (commands, radio events, discovery timeout)
//! and logging (telemetry queue to log files). Both are tokio tasks; work that takes
//! the registry lock or touches files runs on the blocking pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use peerlink_core::telemetry::{write_batch, LOG_FLUSH_INTERVAL};
use peerlink_core::{
    LogBatcher, LogWriter, MacAddr, Notification, OutboundAction, Payload, PeerError,
    PeerMessage, PeerRecord, PeerResult, PeeringCore, SharedRegistry, TelemetrySample,
    TelemetrySink,
};

use crate::logwriter::FileLogWriter;
use crate::radio::Radio;

/// Event queue (radio to peering task) capacity.
pub const EVENT_QUEUE_LEN: usize = 10;
/// Command queue (control socket to peering task) capacity.
pub const COMMAND_QUEUE_LEN: usize = 5;
/// Telemetry queue (registry to logging task) capacity.
pub const TELEMETRY_QUEUE_LEN: usize = 10;

pub const PEERING_TICK: Duration = Duration::from_millis(100);

/// Registry side of the telemetry queue. Never blocks.
pub struct TelemetryQueue(mpsc::Sender<TelemetrySample>);

impl TelemetryQueue {
    pub fn new(tx: mpsc::Sender<TelemetrySample>) -> Self {
        Self(tx)
    }
}

impl TelemetrySink for TelemetryQueue {
    fn offer(&self, sample: TelemetrySample) -> Result<(), TelemetrySample> {
        self.0.try_send(sample).map_err(|e| match e {
            TrySendError::Full(s) | TrySendError::Closed(s) => s,
        })
    }
}

/// User command, as received on the control socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    StartPeering,
    AcceptPeer { mac: MacAddr },
    EditName { mac: MacAddr, name: String },
    EditInterval { mac: MacAddr, seconds: u16 },
    AddToBlacklist { mac: MacAddr },
    RemoveFromBlacklist { mac: MacAddr },
    SendChannelChange { channel: u8 },
    ListPeers,
    ListBlacklist,
    FallbackLogs,
}

pub type CommandReply = PeerResult<Value>;

pub struct CommandEnvelope {
    pub command: Command,
    pub reply: Option<oneshot::Sender<CommandReply>>,
}

impl CommandEnvelope {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CommandReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

pub struct PeeringTask {
    core: PeeringCore,
    registry: SharedRegistry,
    radio: Arc<dyn Radio>,
    notify: broadcast::Sender<Notification>,
    commands: mpsc::Receiver<CommandEnvelope>,
    events: mpsc::Receiver<PeerMessage>,
    logs: Option<Arc<FileLogWriter>>,
}

impl PeeringTask {
    pub fn new(
        core: PeeringCore,
        registry: SharedRegistry,
        radio: Arc<dyn Radio>,
        notify: broadcast::Sender<Notification>,
        commands: mpsc::Receiver<CommandEnvelope>,
        events: mpsc::Receiver<PeerMessage>,
    ) -> Self {
        Self {
            core,
            registry,
            radio,
            notify,
            commands,
            events,
            logs: None,
        }
    }

    /// Serve `fallback_logs` from this writer.
    pub fn with_fallback_logs(mut self, logs: Arc<FileLogWriter>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Register every confirmed peer with the radio again after a restart.
    pub fn restore_links(&mut self) -> PeerResult<()> {
        let macs = self.registry.confirmed_macs()?;
        for action in self.core.restore_links(&macs) {
            if let Err(e) = self.execute(vec![action]) {
                warn!("restoring link: {}", e);
            }
        }
        info!("restored {} peer links", self.core.links().len());
        Ok(())
    }

    /// One tick: at most one command, at most one radio event, then the timeout check.
    pub fn step(&mut self, now: Instant) {
        match self.commands.try_recv() {
            Ok(env) if env.reply.as_ref().is_some_and(|r| r.is_closed()) => {
                // The caller already got a timeout reply.
                info!("dropping {:?}, caller stopped waiting", env.command);
            }
            Ok(env) => {
                let result = self.handle_command(env.command, now);
                if let Err(e) = &result {
                    debug!("command failed: {}", e);
                }
                if let Some(reply) = env.reply {
                    let _ = reply.send(result);
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        if let Ok(msg) = self.events.try_recv() {
            let actions = self.core.on_message(msg, &self.registry, now);
            if let Err(e) = self.execute(actions) {
                warn!("handling radio event: {}", e);
            }
        }
        let actions = self.core.poll_timeout(now);
        if let Err(e) = self.execute(actions) {
            warn!("closing discovery window: {}", e);
        }
    }

    fn handle_command(&mut self, command: Command, now: Instant) -> CommandReply {
        match command {
            Command::StartPeering => {
                let actions = self.core.start_peering(now);
                self.execute(actions)?;
                Ok(Value::Null)
            }
            Command::AcceptPeer { mac } => {
                let actions = self.core.accept_peer(mac)?;
                let failed = self.execute(actions)?;
                if failed.contains(&mac) {
                    return Err(PeerError::Transport(format!("confirm to {} not sent", mac)));
                }
                Ok(Value::Null)
            }
            Command::EditName { mac, name } => {
                self.registry.edit_name(mac, &name)?;
                Ok(Value::Null)
            }
            Command::EditInterval { mac, seconds } => {
                self.registry.edit_interval(mac, seconds)?;
                Ok(Value::Null)
            }
            Command::AddToBlacklist { mac } => {
                self.registry.add_to_blacklist(mac)?;
                Ok(Value::Null)
            }
            Command::RemoveFromBlacklist { mac } => {
                self.registry.remove_from_blacklist(mac)?;
                Ok(Value::Null)
            }
            Command::SendChannelChange { channel } => {
                let actions = self.core.channel_change(channel, &self.registry)?;
                let total = actions.len();
                let failed = self.execute(actions)?;
                info!(
                    "CHANNEL_CHANGE ({}) sent to {}/{} peers",
                    channel,
                    total - failed.len(),
                    total
                );
                Ok(Value::Null)
            }
            Command::ListPeers => to_json(&self.registry.peers()?),
            Command::ListBlacklist => to_json(&self.registry.blacklist()?),
            Command::FallbackLogs => match &self.logs {
                Some(logs) => to_json(&logs.fallback_entries()),
                None => Ok(Value::Array(vec![])),
            },
        }
    }

    /// Perform `actions` in order. Returns the unicast destinations that failed; those
    /// are logged and the remaining actions still run. A failed broadcast closes the
    /// discovery window it opened; a failed registration frees its link slot.
    fn execute(&mut self, actions: Vec<OutboundAction>) -> PeerResult<Vec<MacAddr>> {
        let mut failed = Vec::new();
        for action in actions {
            match action {
                OutboundAction::Broadcast(msg) => {
                    if !msg.payload.allows_broadcast() {
                        return Err(PeerError::InvalidArgument(format!(
                            "{:?} cannot be broadcast",
                            msg.message_type()
                        )));
                    }
                    if let Err(e) = self.radio.broadcast(&msg) {
                        if matches!(msg.payload, Payload::PeerRequest(_)) {
                            self.core.cancel_peering();
                        }
                        warn!("broadcast failed: {}", e);
                        return Err(PeerError::Transport(e.to_string()));
                    }
                }
                OutboundAction::RegisterEncryptedPeer(mac) => {
                    if let Err(e) = self.radio.register_encrypted_peer(mac) {
                        self.core.release_link(&mac);
                        warn!("failed to register {}: {}", mac, e);
                        return Err(PeerError::Transport(e.to_string()));
                    }
                }
                OutboundAction::Unicast(mac, msg) => {
                    if let Err(e) = self.radio.unicast(mac, &msg) {
                        warn!("send to {} failed: {}", mac, e);
                        failed.push(mac);
                    }
                }
                OutboundAction::Notify(note) => {
                    debug!("notify {}", note.event_name());
                    if self.notify.send(note).is_err() {
                        debug!("no control clients connected");
                    }
                }
            }
        }
        Ok(failed)
    }

    /// Tick every [`PEERING_TICK`] until `shutdown` flips. Steps run on the blocking
    /// pool: registry calls wait on the lock and on storage retries.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(PEERING_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => break,
            }
            self = match tokio::task::spawn_blocking(move || {
                self.step(Instant::now());
                self
            })
            .await
            {
                Ok(task) => task,
                Err(e) => {
                    error!("peering step failed: {}", e);
                    return;
                }
            };
        }
        debug!("peering task stopped");
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> CommandReply {
    serde_json::to_value(v).map_err(|_| PeerError::InvalidState("reply not serializable"))
}

pub struct LoggingTask {
    samples: mpsc::Receiver<TelemetrySample>,
    registry: SharedRegistry,
    writer: Arc<dyn LogWriter + Sync>,
    batcher: LogBatcher,
    wait: Duration,
}

impl LoggingTask {
    pub fn new(
        samples: mpsc::Receiver<TelemetrySample>,
        registry: SharedRegistry,
        writer: Arc<dyn LogWriter + Sync>,
    ) -> Self {
        Self {
            samples,
            registry,
            writer,
            batcher: LogBatcher::new(Instant::now()),
            wait: LOG_FLUSH_INTERVAL,
        }
    }

    /// Wait for one sample and flush if the batch is due. False once the queue is closed.
    pub async fn step(&mut self) -> bool {
        let open = match tokio::time::timeout(self.wait, self.samples.recv()).await {
            Ok(Some(sample)) => {
                self.batcher.push(sample);
                true
            }
            Ok(None) => false,
            Err(_) => true,
        };
        if self.batcher.is_due(Instant::now()) {
            self.flush().await;
        }
        open
    }

    pub async fn flush(&mut self) {
        if self.batcher.is_empty() {
            return;
        }
        debug!("flushing {} telemetry samples", self.batcher.len());
        let samples = self.batcher.take(Instant::now());
        let registry = self.registry.clone();
        let writer = Arc::clone(&self.writer);
        let done =
            tokio::task::spawn_blocking(move || write_samples(&registry, writer.as_ref(), &samples));
        if let Err(e) = done.await {
            error!("telemetry flush failed: {}", e);
        }
    }

    /// Run until `shutdown` flips or the queue closes, then flush what is buffered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                open = self.step() => if !open { break },
                _ = shutdown.changed() => break,
            }
        }
        self.flush().await;
        debug!("logging task stopped");
    }
}

fn write_samples(registry: &SharedRegistry, writer: &dyn LogWriter, samples: &[TelemetrySample]) {
    // Snapshot so file writes happen outside the registry lock.
    let peers: Vec<PeerRecord> = match registry.peers() {
        Ok(p) => p,
        Err(e) => {
            warn!("dropping {} samples: {}", samples.len(), e);
            return;
        }
    };
    let written = write_batch(writer, samples, &peers);
    debug!("flushed {}/{} telemetry lines", written, samples.len());
}
