//! BLE link state machine.
//!
//! Owns the lifecycle of one physical link to the probe hub:
//!
//! ```text
//! Disconnected -> Connecting -> DiscoveringServices -> Ready
//!       ^              |                 |              |
//!       +--------------+-----------------+-- Disconnecting
//! ```
//!
//! Every input (a facade request, a platform callback, an expired deadline)
//! is applied by one owner, one at a time; nothing here is shared across
//! threads except the read-only [`LinkStatus`] snapshot.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::gatt::{
    CharacteristicRef, EventSink, GattClient, GattService, PlatformEvent, SessionEvent,
};
use crate::ble::profile::{select_profile, DeviceProfile, ResolvedCharacteristics};
use crate::config::ManagerConfig;
use crate::data::BatteryLevels;
use crate::error::{Error, Result};
use crate::events::{DeviceEvent, EventPublisher, RunState};
use crate::protocol::frame::{decode, encode, Command, Frame};
use crate::protocol::retry::{
    deadline_after, OutcomeSender, RetryEngine, RetryPolicy, RetryStep,
};

/// State of the link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// No link.
    #[default]
    Disconnected,
    /// Waiting for the physical link.
    Connecting,
    /// Link is up; discovering services and enabling notifications.
    DiscoveringServices,
    /// Notifications are live and commands can be sent.
    Ready,
    /// Tearing the link down.
    Disconnecting,
}

impl LinkState {
    /// Check if the link is ready for commands.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Read-only snapshot of the link, updated by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkStatus {
    /// Current link state.
    pub link_state: LinkState,
    /// Whether the device is streaming.
    pub run_state: RunState,
    /// Latest battery levels reported on this link.
    pub battery: Option<BatteryLevels>,
}

/// One physical link, from connect until it goes down.
#[derive(Debug)]
struct Session {
    id: u64,
    /// Profile that matched during discovery.
    profile: Option<&'static str>,
    /// Resolved during discovery, not yet live.
    discovered: Option<ResolvedCharacteristics>,
    /// Present exactly while the link is `Ready`.
    characteristics: Option<ResolvedCharacteristics>,
}

impl Session {
    fn new(id: u64) -> Self {
        Self {
            id,
            profile: None,
            discovered: None,
            characteristics: None,
        }
    }
}

/// Waiter completed when a connect attempt finishes.
pub(crate) type ConnectWaiter = oneshot::Sender<Result<()>>;

/// The link state machine, with its retry engine and platform client.
pub(crate) struct LinkStateMachine<C: GattClient> {
    client: C,
    state: LinkState,
    session: Option<Session>,
    next_session: u64,
    platform_tx: mpsc::UnboundedSender<SessionEvent>,
    publisher: EventPublisher,
    retry: RetryEngine,
    policy: RetryPolicy,
    profiles: Vec<Box<dyn DeviceProfile>>,
    connect_timeout: Duration,
    connect_waiter: Option<ConnectWaiter>,
    connect_deadline: Option<Instant>,
    status: Arc<RwLock<LinkStatus>>,
}

impl<C: GattClient> LinkStateMachine<C> {
    pub(crate) fn new(
        client: C,
        config: &ManagerConfig,
        profiles: Vec<Box<dyn DeviceProfile>>,
        publisher: EventPublisher,
        platform_tx: mpsc::UnboundedSender<SessionEvent>,
        status: Arc<RwLock<LinkStatus>>,
    ) -> Self {
        Self {
            client,
            state: LinkState::Disconnected,
            session: None,
            next_session: 1,
            platform_tx,
            publisher,
            retry: RetryEngine::new(),
            policy: config.retry,
            profiles,
            connect_timeout: config.connect_timeout,
            connect_waiter: None,
            connect_deadline: None,
            status,
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Id of the live session, if any.
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Characteristics of the live session; `Some` only while `Ready`.
    pub fn characteristics(&self) -> Option<ResolvedCharacteristics> {
        self.session.as_ref().and_then(|s| s.characteristics)
    }

    /// Profile that matched the live session's services.
    pub fn profile_name(&self) -> Option<&'static str> {
        self.session.as_ref().and_then(|s| s.profile)
    }

    /// The command waiting for an acknowledgment, if any.
    pub fn pending_command(&self) -> Option<Command> {
        self.retry.pending_command()
    }

    /// Earliest moment something times out.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.connect_deadline, self.retry.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start a new session with `device`, replacing any existing one.
    pub(crate) fn connect(&mut self, device: C::Device, waiter: Option<ConnectWaiter>, now: Instant) {
        if self.state != LinkState::Disconnected {
            info!("New connection requested while {}, closing current link", self.state);
            self.teardown("superseded by a new connection");
        }

        let id = self.next_session;
        self.next_session += 1;
        self.session = Some(Session::new(id));
        self.connect_waiter = waiter;
        self.connect_deadline = Some(deadline_after(now, self.connect_timeout));

        debug!("Starting session {}", id);
        self.set_state(LinkState::Connecting);

        let sink = EventSink::new(id, self.platform_tx.clone());
        if let Err(e) = self.client.connect(device, sink) {
            self.fail_link(format!("connect request failed: {}", e));
        }
    }

    /// Close the link. A no-op when already disconnected.
    pub(crate) fn disconnect(&mut self) {
        if self.state == LinkState::Disconnected {
            debug!("Already disconnected");
            return;
        }

        info!("Disconnecting from device");
        self.teardown("disconnect requested");
    }

    /// Send a command through the retry engine. The outcome goes to `reply`.
    pub(crate) fn send(&mut self, command: Command, reply: OutcomeSender, now: Instant) {
        let Some(write) = self.characteristics().map(|c| c.write) else {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        };

        match self.retry.begin(command, self.policy, now, reply) {
            Ok(command) => {
                info!("Sending {} command", command);
                self.transmit(write, command);
            }
            Err(e) => debug!("Rejected {}: {}", command, e),
        }
    }

    /// Apply a platform callback.
    pub(crate) fn handle_platform(&mut self, event: SessionEvent) {
        if self.session_id() != Some(event.session) {
            debug!(
                "Dropping event from stale session {}: {:?}",
                event.session, event.event
            );
            return;
        }

        match event.event {
            PlatformEvent::Connected => self.on_connected(),
            PlatformEvent::ConnectFailed { reason } => {
                self.fail_link(format!("failed to connect: {}", reason));
            }
            PlatformEvent::ServicesDiscovered(services) => self.on_services_discovered(&services),
            PlatformEvent::NotificationsEnabled => self.on_notifications_enabled(),
            PlatformEvent::Notification(payload) => self.on_notification(&payload),
            PlatformEvent::WriteFailed { reason } => warn!("Write failed: {}", reason),
            PlatformEvent::LinkLost => {
                info!("Device disconnected");
                self.teardown("link lost");
            }
            PlatformEvent::GattError { reason } => {
                self.fail_link(format!("GATT error: {}", reason));
            }
        }
    }

    /// Apply the passage of time.
    pub(crate) fn handle_deadline(&mut self, now: Instant) {
        if self.connect_deadline.map_or(false, |deadline| now >= deadline) {
            self.fail_link(format!("link not ready after {:?}", self.connect_timeout));
            return;
        }

        if let RetryStep::Retransmit(command) = self.retry.on_deadline(now) {
            if let Some(write) = self.characteristics().map(|c| c.write) {
                self.transmit(write, command);
            }
        }
    }

    fn on_connected(&mut self) {
        if self.state != LinkState::Connecting {
            warn!("Connected callback while {}, ignoring", self.state);
            return;
        }

        info!("Device connected, discovering services");
        self.set_state(LinkState::DiscoveringServices);

        if let Err(e) = self.client.discover_services() {
            self.fail_link(format!("service discovery request failed: {}", e));
        }
    }

    fn on_services_discovered(&mut self, services: &[GattService]) {
        if self.state != LinkState::DiscoveringServices {
            warn!("Services discovered while {}, ignoring", self.state);
            return;
        }

        debug!("Discovered {} services", services.len());

        let Some((name, resolved)) =
            select_profile(&self.profiles, services).map(|(p, r)| (p.name(), r))
        else {
            self.fail_link("no supported service/characteristic found".to_string());
            return;
        };

        info!("Service: {}", name);
        if let Some(session) = self.session.as_mut() {
            session.profile = Some(name);
            session.discovered = Some(resolved);
        }

        if let Err(e) = self.client.enable_notifications(resolved.notify) {
            self.fail_link(format!("enabling notifications failed: {}", e));
        }
    }

    fn on_notifications_enabled(&mut self) {
        if self.state != LinkState::DiscoveringServices {
            warn!("Notifications enabled while {}, ignoring", self.state);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(resolved) = session.discovered.take() else {
            warn!("Notifications enabled before a characteristic was resolved");
            return;
        };
        session.characteristics = Some(resolved);

        self.connect_deadline = None;
        info!("Notifications enabled on {}, link ready", resolved.notify);
        self.set_state(LinkState::Ready);

        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_notification(&mut self, payload: &[u8]) {
        if self.state != LinkState::Ready {
            trace!("Discarding {} byte notification while {}", payload.len(), self.state);
            return;
        }

        match decode(payload) {
            Frame::Acknowledgment => {
                debug!("Read acknowledgment");
                self.retry.note_acknowledgment();
                // Status is updated before the caller's future completes.
                match self.retry.pending_command() {
                    Some(Command::Start) => self.set_run_state(RunState::Running),
                    Some(Command::Stop) => self.set_run_state(RunState::Stopped),
                    None => {}
                }
                self.retry.resolve_acknowledged();
            }
            Frame::Telemetry(reading) => {
                trace!("Telemetry: {:?}", reading);
                self.publisher.publish(DeviceEvent::TelemetryReceived {
                    reading,
                    received_at: Utc::now(),
                });
            }
            Frame::BatteryReport(report) => {
                let levels = report.levels();
                debug!(
                    "Battery: {:.2} V ({}%), {:.2} V ({}%)",
                    report.probe1_volts, levels.probe1, report.probe2_volts, levels.probe2
                );
                self.status.write().battery = Some(levels);
                self.publisher.publish(DeviceEvent::BatteryUpdated(levels));
            }
            Frame::Malformed(raw) => {
                debug!("Invalid data received: {:?}", raw);
            }
        }
    }

    fn transmit(&mut self, write: CharacteristicRef, command: Command) {
        let payload = encode(command);
        match self.client.write(write, &payload) {
            Ok(()) => debug!(
                "Writing '{}' to device (attempt {})",
                char::from(command.to_byte()),
                self.retry.attempts()
            ),
            Err(e) => warn!("Failed writing {} to device: {}", command, e),
        }
    }

    /// Orderly shutdown: `Disconnecting`, then `Disconnected`.
    fn teardown(&mut self, reason: &str) {
        self.set_state(LinkState::Disconnecting);
        self.client.disconnect();
        self.close_session(reason);
    }

    /// Error path: straight to `Disconnected`.
    fn fail_link(&mut self, reason: String) {
        error!("Link error: {}", reason);
        if self.state != LinkState::Disconnected {
            self.client.disconnect();
        }
        self.close_session(&reason);
    }

    fn close_session(&mut self, reason: &str) {
        if let Some(command) = self.retry.abandon() {
            warn!("{} command abandoned: {}", command, reason);
        }

        if let Some(session) = self.session.take() {
            debug!("Session {} closed: {}", session.id, reason);
        }

        self.connect_deadline = None;
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(Error::ConnectionFailed {
                reason: reason.to_string(),
            }));
        }

        self.set_state(LinkState::Disconnected);
        self.status.write().battery = None;
        self.set_run_state(RunState::Stopped);
    }

    /// Update the link state and emit events.
    fn set_state(&mut self, new_state: LinkState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }

        self.state = new_state;
        self.status.write().link_state = new_state;
        debug!("Link state changed: {} -> {}", old_state, new_state);

        self.publisher.publish(DeviceEvent::LinkStateChanged(new_state));
        match new_state {
            LinkState::Ready => self.publisher.publish(DeviceEvent::ConnectionStateChanged(true)),
            LinkState::Disconnected => {
                self.publisher.publish(DeviceEvent::ConnectionStateChanged(false));
            }
            _ => {}
        }
    }

    fn set_run_state(&mut self, run_state: RunState) {
        let changed = {
            let mut status = self.status.write();
            let changed = status.run_state != run_state;
            status.run_state = run_state;
            changed
        };

        if changed {
            info!("Device {}", run_state);
            self.publisher.publish(DeviceEvent::RunStateChanged(run_state));
        }
    }
}

impl<C: GattClient> std::fmt::Debug for LinkStateMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkStateMachine")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("retry", &self.retry)
            .finish()
    }
}
