use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use filebox_core::FileboxError;
use futures_util::stream;
use reqwest::StatusCode;
use url::Url;

use super::*;
use crate::config::SettingsHandle;

const RECONNECT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_secs(1);

enum Script {
    Fail,
    Open(mpsc::UnboundedReceiver<String>),
}

#[derive(Clone, Default)]
struct ScriptedConnector {
    attempts: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<Script>>>,
    targets: Arc<Mutex<Vec<PushTarget>>>,
}

impl ScriptedConnector {
    /// Queues a successful open and returns the sender feeding its messages.
    fn open_next(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Script::Open(rx));
        tx
    }

    fn fail_next(&self) {
        self.script.lock().unwrap().push_back(Script::Fail);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PushConnector for ScriptedConnector {
    async fn open(&self, target: PushTarget) -> Result<PushChannel, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Open(rx)) => Ok(PushChannel {
                mounted: Vec::new(),
                messages: stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|line| (Ok(line), rx))
                })
                .boxed(),
            }),
            Some(Script::Fail) | None => Err(ChannelError::ServiceUnavailable("test-monitor")),
        }
    }
}

#[derive(Clone, Default)]
struct ScriptedSnapshots {
    calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<(Duration, PollResult)>>>,
}

impl ScriptedSnapshots {
    fn push(&self, result: PollResult) {
        self.push_delayed(Duration::ZERO, result);
    }

    /// Queues a result that is only returned after `delay`.
    fn push_delayed(&self, delay: Duration, result: PollResult) {
        self.script.lock().unwrap().push_back((delay, result));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for ScriptedSnapshots {
    async fn fetch(&self, _settings: &ConnectionSettings) -> PollResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some((delay, result)) => {
                tokio::time::sleep(delay).await;
                result
            }
            None => Err(SnapshotError::NotConfigured),
        }
    }
}

struct Harness {
    handle: MonitorHandle,
    events: broadcast::Receiver<MonitorEvent>,
    settings: SettingsHandle,
    connector: ScriptedConnector,
    snapshots: ScriptedSnapshots,
}

impl Harness {
    fn start(initial: ConnectionSettings, poll_mode: PollMode) -> Self {
        Self::start_with(initial, poll_mode, ScriptedConnector::default())
    }

    fn start_with(
        initial: ConnectionSettings,
        poll_mode: PollMode,
        connector: ScriptedConnector,
    ) -> Self {
        let settings = SettingsHandle::new(initial);
        let snapshots = ScriptedSnapshots::default();
        let config = MonitorConfig {
            reconnect_interval: RECONNECT,
            poll_interval: POLL,
            poll_mode,
        };
        let (handle, _join) = spawn_monitor(
            config,
            connector.clone(),
            snapshots.clone(),
            settings.subscribe(),
        );
        let events = handle.subscribe();
        Self {
            handle,
            events,
            settings,
            connector,
            snapshots,
        }
    }

    async fn next(&mut self) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("timed out waiting for monitor event")
            .expect("monitor event channel closed")
    }

    async fn next_device(&mut self) -> DeviceEvent {
        loop {
            if let MonitorEvent::Device(event) = self.next().await {
                return event;
            }
        }
    }

    async fn until_state(&mut self, state: LinkState) -> MonitorStatus {
        loop {
            if let MonitorEvent::Status(status) = self.next().await {
                if status.state == state {
                    return status;
                }
            }
        }
    }

    fn drain_devices(&mut self) -> Vec<DeviceEvent> {
        let mut devices = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let MonitorEvent::Device(event) = event {
                devices.push(event);
            }
        }
        devices
    }
}

fn with_token(token: Option<&str>) -> ConnectionSettings {
    ConnectionSettings {
        base_url: None,
        push_url: Some(Url::parse("ws://nas.local/ws").unwrap()),
        token: token.map(str::to_string),
    }
}

fn insert(label: &str) -> DeviceEvent {
    DeviceEvent {
        kind: DeviceEventKind::Insert,
        label: label.to_string(),
    }
}

fn remove(label: &str) -> DeviceEvent {
    DeviceEvent {
        kind: DeviceEventKind::Remove,
        label: label.to_string(),
    }
}

async fn advance_to(start: Instant, offset: Duration) {
    tokio::time::sleep_until(start + offset).await;
}

#[tokio::test(start_paused = true)]
async fn retries_once_per_interval_until_connected() {
    let start = Instant::now();
    let mut harness = Harness::start(with_token(None), PollMode::Always);

    advance_to(start, Duration::from_millis(10)).await;
    assert_eq!(harness.connector.attempts(), 1);
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, LinkState::Disconnected);
    assert!(status.message.contains("retrying in 5s"), "{status:?}");

    advance_to(start, Duration::from_millis(4_900)).await;
    assert_eq!(harness.connector.attempts(), 1);
    advance_to(start, Duration::from_millis(5_100)).await;
    assert_eq!(harness.connector.attempts(), 2);
    advance_to(start, Duration::from_millis(10_100)).await;
    assert_eq!(harness.connector.attempts(), 3);

    let _feed = harness.connector.open_next();
    advance_to(start, Duration::from_millis(15_100)).await;
    assert_eq!(harness.connector.attempts(), 4);
    assert_eq!(
        harness.handle.status().await.unwrap().state,
        LinkState::Connected
    );

    advance_to(start, Duration::from_secs(40)).await;
    assert_eq!(harness.connector.attempts(), 4);
    harness.until_state(LinkState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn pushed_free_text_becomes_canonical_insert() {
    let connector = ScriptedConnector::default();
    let feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);

    let connected = harness.until_state(LinkState::Connected).await;
    assert_eq!(connected.message, "connected to ws://nas.local/ws");

    feed.send("📦 插入设备: USB-Drive (16GB)".to_string()).unwrap();
    assert_eq!(harness.next_device().await, insert("USB-Drive"));
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.message, "device inserted: USB-Drive");

    feed.send("❌ 移除设备: USB-Drive".to_string()).unwrap();
    assert_eq!(harness.next_device().await, remove("USB-Drive"));
    assert!(harness.handle.devices().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unrecognized_push_message_keeps_the_link() {
    let connector = ScriptedConnector::default();
    let feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    feed.send("hello there".to_string()).unwrap();
    loop {
        if let MonitorEvent::Unrecognized(raw) = harness.next().await {
            assert_eq!(raw, "hello there");
            break;
        }
    }
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, LinkState::Connected);
    assert_eq!(status.message, "unrecognized event: hello there");
}

#[tokio::test(start_paused = true)]
async fn remote_close_disconnects_and_schedules_a_retry() {
    let start = Instant::now();
    let connector = ScriptedConnector::default();
    let feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    advance_to(start, Duration::from_secs(2)).await;
    drop(feed);
    let status = harness.until_state(LinkState::Disconnected).await;
    assert_eq!(
        status.message,
        "disconnected (closed by remote end), retrying in 5s"
    );

    advance_to(start, Duration::from_millis(6_900)).await;
    assert_eq!(harness.connector.attempts(), 1);
    advance_to(start, Duration::from_millis(7_100)).await;
    assert_eq!(harness.connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn setting_a_token_enables_polling_on_the_next_tick() {
    let start = Instant::now();
    let mut harness = Harness::start(
        ConnectionSettings {
            base_url: None,
            push_url: None,
            token: None,
        },
        PollMode::Fallback,
    );

    advance_to(start, Duration::from_millis(3_500)).await;
    assert_eq!(harness.snapshots.calls(), 0);

    harness.snapshots.push(Ok(vec![
        DeviceDescriptor::new("A", "Alpha"),
        DeviceDescriptor::new("B", "Beta"),
    ]));
    harness.snapshots.push(Ok(vec![
        DeviceDescriptor::new("B", "Beta"),
        DeviceDescriptor::new("C", "Gamma"),
    ]));
    harness.settings.set_token("fresh-token");

    advance_to(start, Duration::from_millis(4_100)).await;
    assert_eq!(harness.snapshots.calls(), 1);
    assert!(harness.drain_devices().is_empty());

    advance_to(start, Duration::from_millis(5_100)).await;
    assert_eq!(harness.snapshots.calls(), 2);
    assert_eq!(harness.drain_devices(), [remove("Alpha"), insert("Gamma")]);
}

#[tokio::test(start_paused = true)]
async fn failed_poll_is_not_a_mass_removal() {
    let start = Instant::now();
    let mut harness = Harness::start(with_token(Some("t")), PollMode::Always);
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("A", "Alpha")]));
    harness.snapshots.push(Err(SnapshotError::Backend(FileboxError::Api {
        status: StatusCode::BAD_GATEWAY,
        message: "upstream down".into(),
    })));
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("A", "Alpha")]));

    advance_to(start, Duration::from_millis(2_500)).await;
    assert_eq!(harness.snapshots.calls(), 3);
    assert!(harness.drain_devices().is_empty());
    assert_eq!(
        harness.handle.devices().await.unwrap(),
        [DeviceDescriptor::new("A", "Alpha")]
    );
}

#[tokio::test(start_paused = true)]
async fn fallback_polling_pauses_while_push_is_connected() {
    let start = Instant::now();
    let connector = ScriptedConnector::default();
    let feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(Some("t")), PollMode::Fallback, connector);
    harness.until_state(LinkState::Connected).await;

    advance_to(start, Duration::from_millis(500)).await;
    let before = harness.snapshots.calls();
    advance_to(start, Duration::from_millis(4_500)).await;
    assert_eq!(harness.snapshots.calls(), before);

    drop(feed);
    harness.until_state(LinkState::Disconnected).await;
    advance_to(start, Duration::from_millis(6_500)).await;
    assert!(harness.snapshots.calls() > before);
}

#[tokio::test(start_paused = true)]
async fn always_polling_continues_while_push_is_connected() {
    let start = Instant::now();
    let connector = ScriptedConnector::default();
    let _feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(Some("t")), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    advance_to(start, Duration::from_millis(3_500)).await;
    assert_eq!(harness.snapshots.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn polling_does_not_repeat_a_pushed_insert() {
    let start = Instant::now();
    let connector = ScriptedConnector::default();
    let feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(Some("t")), PollMode::Always, connector);
    harness.snapshots.push(Ok(Vec::new()));
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("D", "Delta")]));
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("D", "Delta")]));
    harness.until_state(LinkState::Connected).await;

    advance_to(start, Duration::from_millis(500)).await;
    feed.send(r#"{"type": "insert", "device": {"id": "D", "label": "Delta"}}"#.to_string())
        .unwrap();

    advance_to(start, Duration::from_millis(2_500)).await;
    assert_eq!(harness.snapshots.calls(), 3);
    assert_eq!(harness.drain_devices(), [insert("Delta")]);
}

#[tokio::test(start_paused = true)]
async fn backend_change_restarts_the_poll_baseline() {
    let start = Instant::now();
    let mut harness = Harness::start(with_token(Some("t")), PollMode::Always);
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("A", "Alpha")]));
    // Still in flight when the backend changes; reports A as gone.
    harness
        .snapshots
        .push_delayed(Duration::from_secs(2), Ok(Vec::new()));
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("B", "Beta")]));
    harness
        .snapshots
        .push(Ok(vec![DeviceDescriptor::new("B", "Beta")]));
    harness
        .snapshots
        .push(Ok(vec![
            DeviceDescriptor::new("B", "Beta"),
            DeviceDescriptor::new("C", "Gamma"),
        ]));

    advance_to(start, Duration::from_millis(1_500)).await;
    assert_eq!(harness.snapshots.calls(), 2);
    harness
        .settings
        .set_base_url(Some(Url::parse("http://backup.local:8080").unwrap()));

    advance_to(start, Duration::from_millis(3_500)).await;
    assert_eq!(harness.snapshots.calls(), 4);
    assert!(harness.drain_devices().is_empty());
    assert_eq!(
        harness.handle.devices().await.unwrap(),
        [DeviceDescriptor::new("B", "Beta")]
    );

    advance_to(start, Duration::from_millis(4_500)).await;
    assert_eq!(harness.drain_devices(), [insert("Gamma")]);
}

#[tokio::test(start_paused = true)]
async fn push_url_change_forces_a_reconnect() {
    let connector = ScriptedConnector::default();
    let _first = connector.open_next();
    let _second = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    let moved = Url::parse("ws://backup.local:9000/ws").unwrap();
    harness.settings.set_push_url(Some(moved.clone()));
    let status = harness.until_state(LinkState::Connected).await;

    assert_eq!(status.message, "connected to ws://backup.local:9000/ws");
    assert_eq!(harness.connector.attempts(), 2);
    let targets = harness.connector.targets.lock().unwrap().clone();
    assert_eq!(targets[1].endpoint, Some(moved));
}

#[tokio::test(start_paused = true)]
async fn token_change_does_not_reconnect() {
    let start = Instant::now();
    let connector = ScriptedConnector::default();
    let _feed = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    harness.settings.set_token("abc");
    advance_to(start, Duration::from_secs(12)).await;
    assert_eq!(harness.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_retrying_until_connect() {
    let start = Instant::now();
    let harness = Harness::start(with_token(None), PollMode::Always);
    advance_to(start, Duration::from_millis(10)).await;

    harness.handle.disconnect().unwrap();
    advance_to(start, Duration::from_secs(30)).await;
    assert_eq!(harness.connector.attempts(), 1);
    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.state, LinkState::Disconnected);
    assert_eq!(status.message, "disconnected");

    harness.connector.fail_next();
    harness.handle.connect().unwrap();
    advance_to(start, Duration::from_millis(30_010)).await;
    assert_eq!(harness.connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_reconnect_cycles_the_link() {
    let connector = ScriptedConnector::default();
    let _first = connector.open_next();
    let _second = connector.open_next();
    let mut harness = Harness::start_with(with_token(None), PollMode::Always, connector);
    harness.until_state(LinkState::Connected).await;

    harness.handle.reconnect().unwrap();
    harness.until_state(LinkState::Disconnected).await;
    harness.until_state(LinkState::Connected).await;
    assert_eq!(harness.connector.attempts(), 2);
}

#[tokio::test]
async fn handle_reports_stopped_monitor() {
    let settings = SettingsHandle::new(with_token(None));
    let config = MonitorConfig {
        reconnect_interval: RECONNECT,
        poll_interval: POLL,
        poll_mode: PollMode::Always,
    };
    let (handle, join) = spawn_monitor(
        config,
        ScriptedConnector::default(),
        ScriptedSnapshots::default(),
        settings.subscribe(),
    );
    join.abort();
    let _ = join.await;

    assert!(handle.connect().is_err());
    assert!(handle.status().await.is_err());
}
