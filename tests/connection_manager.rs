//! End-to-end tests of the connection manager against a scripted GATT client.
//!
//! The fake answers every request immediately through the session's event
//! sink, so each test reads as a script of what the device does. Tokio time
//! is paused: retry and connect deadlines elapse instantly once every task
//! is idle.

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use btleplug::api::CharPropFlags;
use tds_probe_ble::ble::{
    CharacteristicRef, GattCharacteristic, TDS_CHARACTERISTIC_UUID, TDS_SERVICE_UUID,
};
use tds_probe_ble::{
    BatteryLevels, Command, ConnectionManager, DeviceEvent, Error, EventSink, GattClient,
    GattService, LinkState, ManagerConfig, PlatformEvent, Result, RunState, Subscription,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnectBehavior {
    Succeed,
    Fail,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DiscoverBehavior {
    Answer,
    Silent,
}

struct ScriptState {
    connect: ConnectBehavior,
    discover: DiscoverBehavior,
    services: Vec<GattService>,
    /// Acknowledge the nth write (1-based).
    ack_on_write: Option<usize>,
    /// Frames sent just before the acknowledgment.
    before_ack: Vec<Bytes>,
    writes: Vec<Vec<u8>>,
    sinks: Vec<EventSink>,
    disconnects: usize,
}

#[derive(Clone)]
struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ScriptState {
            connect: ConnectBehavior::Succeed,
            discover: DiscoverBehavior::Answer,
            services: vec![hm10_service()],
            ack_on_write: Some(1),
            before_ack: Vec::new(),
            writes: Vec::new(),
            sinks: Vec::new(),
            disconnects: 0,
        })))
    }

    fn connect(self, behavior: ConnectBehavior) -> Self {
        self.0.lock().connect = behavior;
        self
    }

    fn discover(self, behavior: DiscoverBehavior) -> Self {
        self.0.lock().discover = behavior;
        self
    }

    fn services(self, services: Vec<GattService>) -> Self {
        self.0.lock().services = services;
        self
    }

    fn ack_on_write(self, n: Option<usize>) -> Self {
        self.0.lock().ack_on_write = n;
        self
    }

    fn before_ack(self, frame: &'static [u8]) -> Self {
        self.0.lock().before_ack.push(Bytes::from_static(frame));
        self
    }

    fn writes(&self) -> Vec<Vec<u8>> {
        self.0.lock().writes.clone()
    }

    fn disconnects(&self) -> usize {
        self.0.lock().disconnects
    }

    fn sink(&self, index: usize) -> EventSink {
        self.0.lock().sinks[index].clone()
    }

    fn sink_count(&self) -> usize {
        self.0.lock().sinks.len()
    }

    fn latest_sink(&self) -> EventSink {
        let state = self.0.lock();
        state.sinks.last().cloned().expect("no session started")
    }

    fn client(&self) -> FakeClient {
        FakeClient {
            script: self.clone(),
            sink: None,
        }
    }
}

struct FakeClient {
    script: Script,
    sink: Option<EventSink>,
}

impl FakeClient {
    fn post(&self, event: PlatformEvent) {
        if let Some(sink) = &self.sink {
            sink.post(event);
        }
    }
}

impl GattClient for FakeClient {
    type Device = &'static str;

    fn connect(&mut self, _device: &'static str, events: EventSink) -> Result<()> {
        let behavior = {
            let mut state = self.script.0.lock();
            state.sinks.push(events.clone());
            state.connect
        };
        self.sink = Some(events);

        match behavior {
            ConnectBehavior::Succeed => self.post(PlatformEvent::Connected),
            ConnectBehavior::Fail => self.post(PlatformEvent::ConnectFailed {
                reason: "status 133".to_string(),
            }),
            ConnectBehavior::Silent => {}
        }
        Ok(())
    }

    fn discover_services(&mut self) -> Result<()> {
        let (behavior, services) = {
            let state = self.script.0.lock();
            (state.discover, state.services.clone())
        };
        if behavior == DiscoverBehavior::Answer {
            self.post(PlatformEvent::ServicesDiscovered(services));
        }
        Ok(())
    }

    fn enable_notifications(&mut self, characteristic: CharacteristicRef) -> Result<()> {
        assert_eq!(characteristic.characteristic, TDS_CHARACTERISTIC_UUID);
        self.post(PlatformEvent::NotificationsEnabled);
        Ok(())
    }

    fn write(&mut self, characteristic: CharacteristicRef, payload: &[u8]) -> Result<()> {
        assert_eq!(characteristic.characteristic, TDS_CHARACTERISTIC_UUID);

        let replies = {
            let mut state = self.script.0.lock();
            state.writes.push(payload.to_vec());
            if state.ack_on_write == Some(state.writes.len()) {
                let mut replies = state.before_ack.clone();
                replies.push(Bytes::from_static(b"A"));
                replies
            } else {
                Vec::new()
            }
        };

        for reply in replies {
            self.post(PlatformEvent::Notification(reply));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.script.0.lock().disconnects += 1;
        self.sink = None;
    }
}

fn hm10_service() -> GattService {
    GattService::new(
        TDS_SERVICE_UUID,
        vec![GattCharacteristic::new(
            TDS_CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
        )],
    )
}

fn test_config() -> ManagerConfig {
    ManagerConfig::default().with_retry(10, Duration::from_millis(200))
}

fn manager(script: &Script, config: ManagerConfig) -> ConnectionManager<FakeClient> {
    ConnectionManager::with_config(script.client(), config).unwrap()
}

fn drain(events: &mut Subscription) -> Vec<DeviceEvent> {
    std::iter::from_fn(|| events.try_recv()).collect()
}

/// Collect events until one matches `done`, inclusive.
async fn wait_for(
    events: &mut Subscription,
    done: impl Fn(&DeviceEvent) -> bool,
) -> Vec<DeviceEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    })
    .await
    .expect("event never arrived");
    seen
}

fn count(events: &[DeviceEvent], wanted: &DeviceEvent) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

fn spawn_connect(
    manager: &Arc<ConnectionManager<FakeClient>>,
    device: &'static str,
) -> tokio::task::JoinHandle<Result<()>> {
    let manager = manager.clone();
    tokio::spawn(async move { manager.connect(device).await })
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_ready() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    let mut events = manager.subscribe();

    assert_eq!(manager.link_state(), LinkState::Disconnected);
    manager.connect("hub").await.unwrap();

    assert!(manager.is_connected());
    assert_eq!(manager.run_state(), RunState::Stopped);
    assert_eq!(
        drain(&mut events),
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Connecting),
            DeviceEvent::LinkStateChanged(LinkState::DiscoveringServices),
            DeviceEvent::LinkStateChanged(LinkState::Ready),
            DeviceEvent::ConnectionStateChanged(true),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_acknowledged_on_third_attempt() {
    let script = Script::new().ack_on_write(Some(3));
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();

    let started = Instant::now();
    manager.send_start().await.unwrap();

    assert_eq!(script.writes(), vec![b"S".to_vec(); 3]);
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(started.elapsed() < Duration::from_millis(600));
    assert_eq!(manager.run_state(), RunState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_command_times_out_after_max_attempts() {
    let script = Script::new().ack_on_write(None);
    let config = ManagerConfig::default().with_retry(4, Duration::from_millis(200));
    let manager = manager(&script, config);
    manager.connect("hub").await.unwrap();

    let err = manager.send_start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::CommandTimeout {
            command: Command::Start,
            attempts: 4
        }
    ));
    assert_eq!(script.writes().len(), 4);
    assert_eq!(manager.run_state(), RunState::Stopped);
    // The link survives a command that was never acknowledged.
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_start() {
    let script = Script::new().ack_on_write(Some(1));
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();

    manager.send_start().await.unwrap();
    assert_eq!(manager.run_state(), RunState::Running);

    // The script only acknowledges the first write.
    script.0.lock().ack_on_write = Some(2);
    manager.send_stop().await.unwrap();
    assert_eq!(manager.run_state(), RunState::Stopped);
    assert_eq!(script.writes(), vec![b"S".to_vec(), b"E".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_before_ack_is_delivered_first() {
    let script = Script::new().before_ack(b"12.5:30.25");
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    manager.send_start().await.unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(e, DeviceEvent::RunStateChanged(RunState::Running))
    })
    .await;
    assert_eq!(seen.len(), 2);
    match &seen[0] {
        DeviceEvent::TelemetryReceived { reading, .. } => {
            assert_eq!(reading.probe1, 12.5);
            assert_eq!(reading.probe2, 30.25);
        }
        other => panic!("expected telemetry first, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_service_fails_connect() {
    let script = Script::new().services(vec![]);
    let manager = manager(&script, test_config());
    let mut events = manager.subscribe();

    let err = manager.connect("hub").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert_eq!(manager.link_state(), LinkState::Disconnected);
    assert_eq!(script.disconnects(), 1);

    let seen = drain(&mut events);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(false)), 1);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(true)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reported() {
    let script = Script::new().connect(ConnectBehavior::Fail);
    let manager = manager(&script, test_config());

    let err = manager.connect("hub").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let script = Script::new().connect(ConnectBehavior::Silent);
    let config = test_config().with_connect_timeout(Duration::from_secs(2));
    let manager = manager(&script, config);

    let started = Instant::now();
    let err = manager.connect("hub").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(manager.link_state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    manager.disconnect().await.unwrap();
    manager.disconnect().await.unwrap();

    assert_eq!(script.disconnects(), 1);
    assert_eq!(
        drain(&mut events),
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Disconnecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_abandons_pending_command() {
    let script = Script::new().ack_on_write(None);
    let manager = Arc::new(manager(&script, test_config()));
    manager.connect("hub").await.unwrap();

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send_stop().await });
    wait_until(|| !script.writes().is_empty()).await;

    manager.disconnect().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::CommandAbandoned { command: Command::Stop }));
    assert_eq!(script.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_command_rejected() {
    let script = Script::new().ack_on_write(None);
    let config = ManagerConfig::default().with_retry(3, Duration::from_millis(200));
    let manager = Arc::new(manager(&script, config));
    manager.connect("hub").await.unwrap();

    let sender = manager.clone();
    let first = tokio::spawn(async move { sender.send_start().await });
    wait_until(|| !script.writes().is_empty()).await;

    let err = manager.send_stop().await.unwrap_err();
    assert!(matches!(err, Error::CommandPending { pending: Command::Start }));

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::CommandTimeout { attempts: 3, .. }));
    // The rejected STOP was never written.
    assert_eq!(script.writes(), vec![b"S".to_vec(); 3]);
}

#[tokio::test(start_paused = true)]
async fn test_command_requires_connection() {
    let script = Script::new();
    let manager = manager(&script, test_config());

    let err = manager.send_start().await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert!(script.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_battery_report() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    script.latest_sink().notify(&b"2.28V2.15"[..]);

    let expected = BatteryLevels {
        probe1: 100,
        probe2: 80,
    };
    let seen = wait_for(&mut events, |e| matches!(e, DeviceEvent::BatteryUpdated(_))).await;
    assert_eq!(seen, vec![DeviceEvent::BatteryUpdated(expected)]);
    assert_eq!(manager.battery_levels(), Some(expected));

    manager.disconnect().await.unwrap();
    assert_eq!(manager.battery_levels(), None);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_ignored() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    let sink = script.latest_sink();
    sink.notify(&b"hello"[..]);
    sink.notify(&b"1.0:abc"[..]);
    sink.notify(&b"7:8"[..]);

    let seen = wait_for(&mut events, |e| matches!(e, DeviceEvent::TelemetryReceived { .. })).await;
    assert_eq!(seen.len(), 1);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_link_lost() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    manager.send_start().await.unwrap();
    let mut events = manager.subscribe();

    script.latest_sink().post(PlatformEvent::LinkLost);

    let seen = wait_for(&mut events, |e| {
        matches!(e, DeviceEvent::RunStateChanged(RunState::Stopped))
    })
    .await;
    assert_eq!(
        seen,
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Disconnecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
            DeviceEvent::RunStateChanged(RunState::Stopped),
        ]
    );
    assert!(!manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_gatt_error_skips_disconnecting() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    script.latest_sink().post(PlatformEvent::GattError {
        reason: "status 8".to_string(),
    });

    let seen = wait_for(&mut events, |e| {
        matches!(e, DeviceEvent::ConnectionStateChanged(false))
    })
    .await;
    assert_eq!(
        seen,
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_ignores_stale_session() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("first").await.unwrap();
    let mut events = manager.subscribe();

    manager.connect("second").await.unwrap();
    assert_eq!(script.sink_count(), 2);
    assert_eq!(script.disconnects(), 1);

    let replaced = drain(&mut events);
    assert_eq!(count(&replaced, &DeviceEvent::ConnectionStateChanged(false)), 1);
    assert_eq!(count(&replaced, &DeviceEvent::ConnectionStateChanged(true)), 1);

    // Late callbacks from the first link.
    let stale = script.sink(0);
    stale.notify(&b"1:2"[..]);
    stale.post(PlatformEvent::LinkLost);

    // A marker on the live link, processed after the stale events.
    script.sink(1).notify(&b"2.28V2.28"[..]);

    let seen = wait_for(&mut events, |e| matches!(e, DeviceEvent::BatteryUpdated(_))).await;
    assert_eq!(
        seen,
        vec![DeviceEvent::BatteryUpdated(BatteryLevels {
            probe1: 100,
            probe2: 100
        })]
    );
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_payloads_before_ready_are_discarded() {
    let script = Script::new().connect(ConnectBehavior::Silent);
    let manager = Arc::new(manager(&script, test_config()));
    let mut events = manager.subscribe();

    let connector = manager.clone();
    let connecting = tokio::spawn(async move { connector.connect("hub").await });
    wait_until(|| script.sink_count() == 1).await;

    let sink = script.latest_sink();
    sink.notify(&b"5.0:6.0"[..]);
    sink.notify(&b"2.28V2.28"[..]);
    sink.notify(&b"A"[..]);
    sink.post(PlatformEvent::Connected);

    connecting.await.unwrap().unwrap();
    let seen = drain(&mut events);
    assert!(seen.iter().all(|e| !matches!(
        e,
        DeviceEvent::TelemetryReceived { .. } | DeviceEvent::BatteryUpdated(_)
    )));
    assert_eq!(manager.battery_levels(), None);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_callback() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _handle = manager.on_telemetry(move |reading, _| {
        let _ = tx.send(*reading);
    });

    script.latest_sink().notify(&b"100.5:200.25"[..]);

    let reading = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reading.probe1, 100.5);
    assert_eq!(reading.probe2, 200.25);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_the_manager() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();

    manager.shutdown().await.unwrap();
    assert_eq!(script.disconnects(), 1);
    assert!(matches!(manager.send_start().await, Err(Error::Internal(_))));
    // Shutting down twice is fine.
    manager.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_drop_disconnects_the_link() {
    let script = Script::new();
    let manager = manager(&script, test_config());
    manager.connect("hub").await.unwrap();
    let mut events = manager.subscribe();

    drop(manager);

    let seen = wait_for(&mut events, |e| *e == DeviceEvent::ConnectionStateChanged(false)).await;
    assert_eq!(
        seen,
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Disconnecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
        ]
    );
    assert_eq!(script.disconnects(), 1);
    // The background task is gone once the link is down.
    assert_eq!(events.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting() {
    let script = Script::new().connect(ConnectBehavior::Silent);
    let manager = Arc::new(manager(&script, test_config()));
    let mut events = manager.subscribe();

    let connecting = spawn_connect(&manager, "hub");
    wait_until(|| script.sink_count() == 1).await;

    manager.disconnect().await.unwrap();
    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));

    assert_eq!(
        drain(&mut events),
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Connecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
        ]
    );

    // The device answers after the caller gave up.
    script.sink(0).post(PlatformEvent::Connected);
    manager.disconnect().await.unwrap();

    assert_eq!(manager.link_state(), LinkState::Disconnected);
    assert_eq!(drain(&mut events), vec![]);
    assert_eq!(script.disconnects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_service_discovery() {
    let script = Script::new().discover(DiscoverBehavior::Silent);
    let manager = Arc::new(manager(&script, test_config()));
    let mut events = manager.subscribe();

    let connecting = spawn_connect(&manager, "hub");
    wait_until(|| manager.link_state() == LinkState::DiscoveringServices).await;

    manager.disconnect().await.unwrap();
    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));

    let seen = drain(&mut events);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(false)), 1);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(true)), 0);

    script
        .sink(0)
        .post(PlatformEvent::ServicesDiscovered(vec![hm10_service()]));
    manager.disconnect().await.unwrap();

    assert_eq!(manager.link_state(), LinkState::Disconnected);
    assert_eq!(drain(&mut events), vec![]);
    assert!(manager.send_start().await.is_err());
    assert!(script.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_while_connecting() {
    let script = Script::new().connect(ConnectBehavior::Silent);
    let manager = Arc::new(manager(&script, test_config()));
    let mut events = manager.subscribe();

    let first = spawn_connect(&manager, "first");
    wait_until(|| script.sink_count() == 1).await;

    let script = script.connect(ConnectBehavior::Succeed);
    manager.connect("second").await.unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert_eq!(script.disconnects(), 1);

    let seen = drain(&mut events);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(false)), 1);
    assert_eq!(count(&seen, &DeviceEvent::ConnectionStateChanged(true)), 1);

    // The first device finally answers; the live link is unaffected.
    script.sink(0).post(PlatformEvent::Connected);
    script.sink(1).notify(&b"2.28V2.28"[..]);

    let seen = wait_for(&mut events, |e| matches!(e, DeviceEvent::BatteryUpdated(_))).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(manager.link_state(), LinkState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_during_service_discovery() {
    let script = Script::new().discover(DiscoverBehavior::Silent);
    let manager = Arc::new(manager(&script, test_config()));
    let mut events = manager.subscribe();

    let first = spawn_connect(&manager, "first");
    wait_until(|| manager.link_state() == LinkState::DiscoveringServices).await;

    let script = script.discover(DiscoverBehavior::Answer);
    manager.connect("second").await.unwrap();

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));

    assert_eq!(
        drain(&mut events),
        vec![
            DeviceEvent::LinkStateChanged(LinkState::Connecting),
            DeviceEvent::LinkStateChanged(LinkState::DiscoveringServices),
            DeviceEvent::LinkStateChanged(LinkState::Disconnecting),
            DeviceEvent::LinkStateChanged(LinkState::Disconnected),
            DeviceEvent::ConnectionStateChanged(false),
            DeviceEvent::LinkStateChanged(LinkState::Connecting),
            DeviceEvent::LinkStateChanged(LinkState::DiscoveringServices),
            DeviceEvent::LinkStateChanged(LinkState::Ready),
            DeviceEvent::ConnectionStateChanged(true),
        ]
    );

    // A late discovery result for the first session must not touch the
    // second one.
    script
        .sink(0)
        .post(PlatformEvent::ServicesDiscovered(vec![hm10_service()]));
    script.sink(1).notify(&b"2.28V2.28"[..]);

    let seen = wait_for(&mut events, |e| matches!(e, DeviceEvent::BatteryUpdated(_))).await;
    assert_eq!(
        seen,
        vec![DeviceEvent::BatteryUpdated(BatteryLevels {
            probe1: 100,
            probe2: 100
        })]
    );
    assert_eq!(manager.link_state(), LinkState::Ready);
    assert_eq!(script.disconnects(), 1);
}

#[test]
fn test_invalid_config_rejected() {
    let script = Script::new();
    let config = ManagerConfig::default().with_retry(0, Duration::from_millis(200));
    assert!(matches!(
        ConnectionManager::with_config(script.client(), config),
        Err(Error::InvalidParameter { .. })
    ));
}
