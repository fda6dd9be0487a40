//! Device connectivity: the push channel with its reconnect loop, the
//! snapshot poll, and the router that turns both into canonical events.

pub mod push;
pub mod router;
pub mod snapshot;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, future};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConnectionSettings, PollMode};

pub use push::{
    AnyConnector, ChannelError, DbusConnector, PushChannel, PushConnector, PushTarget,
    WebSocketConnector,
};
pub use router::{DeviceDescriptor, DeviceEvent, DeviceEventKind, DeviceEventRouter};
pub use snapshot::{HttpSnapshotSource, SnapshotError, SnapshotSource};
pub use state::{Generation, LinkMachine, LinkState};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub reconnect_interval: Duration,
    pub poll_interval: Duration,
    pub poll_mode: PollMode,
}

impl MonitorConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval,
            poll_interval: config.poll_interval,
            poll_mode: config.poll_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: LinkState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Status(MonitorStatus),
    Device(DeviceEvent),
    /// A push message that matched neither encoding.
    Unrecognized(String),
}

#[derive(Debug, Error)]
#[error("connectivity monitor is no longer running")]
pub struct MonitorClosed;

enum MonitorCommand {
    Connect,
    Disconnect,
    Reconnect,
    Status(oneshot::Sender<MonitorStatus>),
    Devices(oneshot::Sender<Vec<DeviceDescriptor>>),
}

#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<MonitorCommand>,
    events: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self) -> Result<(), MonitorClosed> {
        self.send(MonitorCommand::Connect)
    }

    /// Closes the channel and stops retrying until the next `connect`.
    pub fn disconnect(&self) -> Result<(), MonitorClosed> {
        self.send(MonitorCommand::Disconnect)
    }

    pub fn reconnect(&self) -> Result<(), MonitorClosed> {
        self.send(MonitorCommand::Reconnect)
    }

    pub async fn status(&self) -> Result<MonitorStatus, MonitorClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Status(reply))?;
        rx.await.map_err(|_| MonitorClosed)
    }

    pub async fn devices(&self) -> Result<Vec<DeviceDescriptor>, MonitorClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Devices(reply))?;
        rx.await.map_err(|_| MonitorClosed)
    }

    fn send(&self, command: MonitorCommand) -> Result<(), MonitorClosed> {
        self.commands.send(command).map_err(|_| MonitorClosed)
    }
}

/// Spawns the monitor and makes its first connection attempt.
pub fn spawn_monitor<C, S>(
    config: MonitorConfig,
    connector: C,
    snapshots: S,
    mut settings: watch::Receiver<ConnectionSettings>,
) -> (MonitorHandle, JoinHandle<()>)
where
    C: PushConnector,
    S: SnapshotSource,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (poll_tx, poll_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let current = settings.borrow_and_update().clone();

    let actor = MonitorActor {
        machine: LinkMachine::new(config.reconnect_interval),
        config,
        connector: Arc::new(connector),
        snapshots: Arc::new(snapshots),
        settings: current,
        router: DeviceEventRouter::new(),
        status: MonitorStatus {
            state: LinkState::Disconnected,
            message: "not connected".to_string(),
        },
        events: events.clone(),
        link_tx,
        link_task: None,
        poll_tx,
        poll_in_flight: false,
        poll_epoch: 0,
    };
    let handle = MonitorHandle {
        commands: commands_tx,
        events,
    };
    let channels = ActorChannels {
        commands: commands_rx,
        settings,
        link: link_rx,
        polls: poll_rx,
    };
    (handle, tokio::spawn(actor.run(channels)))
}

type PollResult = Result<Vec<DeviceDescriptor>, SnapshotError>;

/// A poll result tagged with the backend it was fetched from.
struct PollMessage {
    epoch: u64,
    result: PollResult,
}

struct LinkMessage {
    generation: Generation,
    event: LinkEvent,
}

enum LinkEvent {
    Opened { mounted: Vec<String> },
    Message(String),
    Closed(String),
}

struct ActorChannels {
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    settings: watch::Receiver<ConnectionSettings>,
    link: mpsc::UnboundedReceiver<LinkMessage>,
    polls: mpsc::UnboundedReceiver<PollMessage>,
}

struct MonitorActor<C, S> {
    config: MonitorConfig,
    connector: Arc<C>,
    snapshots: Arc<S>,
    settings: ConnectionSettings,
    machine: LinkMachine,
    router: DeviceEventRouter,
    status: MonitorStatus,
    events: broadcast::Sender<MonitorEvent>,
    link_tx: mpsc::UnboundedSender<LinkMessage>,
    link_task: Option<JoinHandle<()>>,
    poll_tx: mpsc::UnboundedSender<PollMessage>,
    poll_in_flight: bool,
    /// Bumped whenever the backend address changes.
    poll_epoch: u64,
}

impl<C: PushConnector, S: SnapshotSource> MonitorActor<C, S> {
    async fn run(mut self, channels: ActorChannels) {
        let ActorChannels {
            mut commands,
            mut settings,
            mut link,
            mut polls,
        } = channels;
        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settings_open = true;

        self.connect();
        loop {
            let reconnect_at = self.machine.next_reconnect();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = link.recv() => self.handle_link(message),
                Some(message) = polls.recv() => self.apply_poll(message),
                _ = poll_tick.tick() => self.poll(),
                changed = settings.changed(), if settings_open => match changed {
                    Ok(()) => {
                        let next = settings.borrow_and_update().clone();
                        self.apply_settings(next);
                    }
                    Err(_) => settings_open = false,
                },
                () = sleep_until(reconnect_at) => self.reconnect_timer(),
            }
        }

        self.close_link();
        debug!("connectivity monitor stopped");
    }

    fn handle_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::Connect => self.connect(),
            MonitorCommand::Disconnect => {
                self.close_link();
                self.machine.suspend();
                info!("push channel disconnected on request");
                self.set_status(LinkState::Disconnected, "disconnected".to_string());
            }
            MonitorCommand::Reconnect => self.force_reconnect("reconnect requested"),
            MonitorCommand::Status(reply) => {
                let _ = reply.send(self.status.clone());
            }
            MonitorCommand::Devices(reply) => {
                let _ = reply.send(self.router.devices());
            }
        }
    }

    fn connect(&mut self) {
        if let Some(generation) = self.machine.connect(Instant::now()) {
            self.open_link(generation);
        }
    }

    fn reconnect_timer(&mut self) {
        if let Some(generation) = self.machine.timer_fired(Instant::now()) {
            debug!("reconnect timer fired");
            self.open_link(generation);
        }
    }

    fn force_reconnect(&mut self, reason: &str) {
        info!("{reason}; reconnecting push channel");
        self.close_link();
        self.machine.reset(Instant::now());
        self.set_status(LinkState::Disconnected, format!("{reason}, reconnecting"));
        self.connect();
    }

    fn open_link(&mut self, generation: Generation) {
        self.close_link();
        let target = PushTarget::from_settings(&self.settings);
        self.set_status(
            LinkState::Connecting,
            format!("connecting to {}", target.describe()),
        );

        let connector = Arc::clone(&self.connector);
        let tx = self.link_tx.clone();
        self.link_task = Some(tokio::spawn(async move {
            let send = |event| tx.send(LinkMessage { generation, event }).is_ok();
            let PushChannel {
                mounted,
                mut messages,
            } = match connector.open(target).await {
                Ok(channel) => channel,
                Err(err) => {
                    send(LinkEvent::Closed(err.to_string()));
                    return;
                }
            };
            if !send(LinkEvent::Opened { mounted }) {
                return;
            }
            while let Some(item) = messages.next().await {
                let event = match item {
                    Ok(text) => LinkEvent::Message(text),
                    Err(err) => {
                        send(LinkEvent::Closed(err.to_string()));
                        return;
                    }
                };
                if !send(event) {
                    return;
                }
            }
            send(LinkEvent::Closed("closed by remote end".to_string()));
        }));
    }

    fn close_link(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
    }

    fn handle_link(&mut self, message: LinkMessage) {
        let LinkMessage { generation, event } = message;
        match event {
            LinkEvent::Opened { mounted } => {
                if !self.machine.opened(generation) {
                    return;
                }
                self.router.seed_present(mounted);
                let target = PushTarget::from_settings(&self.settings).describe();
                info!(%target, "push channel connected");
                self.set_status(LinkState::Connected, format!("connected to {target}"));
            }
            LinkEvent::Message(raw) => {
                if generation != self.machine.generation()
                    || self.machine.state() != LinkState::Connected
                {
                    return;
                }
                self.route(raw);
            }
            LinkEvent::Closed(reason) => {
                let was_connected = self.machine.state() == LinkState::Connected;
                if !self.machine.lost(generation, Instant::now()) {
                    return;
                }
                self.link_task = None;
                if was_connected {
                    warn!(%reason, "push channel lost");
                } else {
                    debug!(%reason, "push channel attempt failed");
                }
                let retry = self.config.reconnect_interval.as_secs_f32();
                self.set_status(
                    LinkState::Disconnected,
                    format!("disconnected ({reason}), retrying in {retry}s"),
                );
            }
        }
    }

    fn route(&mut self, raw: String) {
        match self.router.route_push(&raw) {
            Some(event) => self.device_event(event),
            None => {
                warn!(message = %raw, "unrecognized push message");
                self.set_status(self.machine.state(), format!("unrecognized event: {raw}"));
                self.emit(MonitorEvent::Unrecognized(raw));
            }
        }
    }

    fn poll(&mut self) {
        if self.poll_in_flight || !self.settings.has_token() {
            return;
        }
        if self.config.poll_mode == PollMode::Fallback
            && self.machine.state() == LinkState::Connected
        {
            return;
        }

        self.poll_in_flight = true;
        let source = Arc::clone(&self.snapshots);
        let settings = self.settings.clone();
        let tx = self.poll_tx.clone();
        let epoch = self.poll_epoch;
        tokio::spawn(async move {
            let result = source.fetch(&settings).await;
            let _ = tx.send(PollMessage { epoch, result });
        });
    }

    fn apply_poll(&mut self, message: PollMessage) {
        if message.epoch != self.poll_epoch {
            debug!("dropping snapshot from previous backend");
            return;
        }
        self.poll_in_flight = false;
        match message.result {
            Ok(devices) => {
                for event in self.router.diff_snapshot(devices) {
                    self.device_event(event);
                }
            }
            Err(err @ (SnapshotError::Unauthorized(_) | SnapshotError::NotConfigured)) => {
                debug!(error = %err, "device snapshot skipped");
            }
            Err(SnapshotError::Backend(err)) => {
                warn!(error = %err, retryable = err.is_retryable(), "device snapshot failed");
            }
        }
    }

    fn apply_settings(&mut self, next: ConnectionSettings) {
        let previous = std::mem::replace(&mut self.settings, next);
        if previous.has_token() != self.settings.has_token() {
            info!(
                polling = self.settings.has_token(),
                "credential {}",
                if self.settings.has_token() { "set" } else { "cleared" }
            );
        }
        if previous.base_url != self.settings.base_url {
            info!("backend address changed; restarting device baseline");
            self.poll_epoch += 1;
            self.poll_in_flight = false;
            self.router.reset_baseline();
        }
        if previous.push_endpoint() != self.settings.push_endpoint() {
            self.force_reconnect("push endpoint changed");
        }
    }

    fn device_event(&mut self, event: DeviceEvent) {
        info!(kind = %event.kind, label = %event.label, "device event");
        let message = match event.kind {
            DeviceEventKind::Insert => format!("device inserted: {}", event.label),
            DeviceEventKind::Remove => format!("device removed: {}", event.label),
        };
        self.emit(MonitorEvent::Device(event));
        self.set_status(self.machine.state(), message);
    }

    fn set_status(&mut self, state: LinkState, message: String) {
        self.status = MonitorStatus { state, message };
        self.emit(MonitorEvent::Status(self.status.clone()));
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests;
