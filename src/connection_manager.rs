//! Connection manager facade.
//!
//! The [`ConnectionManager`] is the public entry point. It owns a single
//! background task that holds the link state machine, the retry engine and
//! the platform client; every request from the facade, every platform
//! callback and every timer expiry is applied by that task, one at a time.
//! Status queries read a snapshot the task keeps up to date.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::ble::btleplug_client::BtleplugClient;
use crate::ble::connection::{ConnectWaiter, LinkState, LinkStateMachine, LinkStatus};
use crate::ble::gatt::{GattClient, SessionEvent};
use crate::ble::profile::{default_profiles, DeviceProfile};
use crate::config::ManagerConfig;
use crate::data::{BatteryLevels, Telemetry};
use crate::error::{Error, Result};
use crate::events::{CallbackHandle, DeviceEvent, EventPublisher, RunState, Subscription};
use crate::protocol::frame::Command;
use crate::protocol::retry::{CommandOutcome, OutcomeSender};

/// Requests queued to buffer before `connect`/`send_*` callers wait.
const REQUEST_QUEUE: usize = 16;

/// Connection manager backed by btleplug.
pub type BleConnectionManager = ConnectionManager<BtleplugClient>;

enum Request<D> {
    Connect { device: D, reply: ConnectWaiter },
    Disconnect { reply: oneshot::Sender<()> },
    Send { command: Command, reply: OutcomeSender },
}

/// Manages the link to one TDS probe hub.
///
/// Dropping the manager closes its request queue; the background task then
/// tears the link down and exits on its own. Call [`shutdown`](Self::shutdown)
/// to wait for the disconnect instead.
pub struct ConnectionManager<C: GattClient> {
    requests: mpsc::Sender<Request<C::Device>>,
    publisher: EventPublisher,
    status: Arc<RwLock<LinkStatus>>,
    config: ManagerConfig,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: GattClient> ConnectionManager<C> {
    /// Create a manager with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(client: C) -> Self {
        Self::start(client, ManagerConfig::default(), default_profiles())
    }

    /// Create a manager with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the configuration is unusable.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn with_config(client: C, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::start(client, config, default_profiles()))
    }

    /// Create a manager that matches devices against `profiles`, in order.
    pub fn with_profiles(
        client: C,
        config: ManagerConfig,
        profiles: Vec<Box<dyn DeviceProfile>>,
    ) -> Result<Self> {
        config.validate()?;
        if profiles.is_empty() {
            return Err(Error::InvalidParameter {
                name: "profiles".to_string(),
                value: "[]".to_string(),
            });
        }
        Ok(Self::start(client, config, profiles))
    }

    fn start(client: C, config: ManagerConfig, profiles: Vec<Box<dyn DeviceProfile>>) -> Self {
        let publisher = EventPublisher::new(config.event_capacity);
        let status = Arc::new(RwLock::new(LinkStatus::default()));
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

        let machine = LinkStateMachine::new(
            client,
            &config,
            profiles,
            publisher.clone(),
            platform_tx,
            status.clone(),
        );
        let actor = tokio::spawn(run_actor(machine, request_rx, platform_rx));

        Self {
            requests: request_tx,
            publisher,
            status,
            config,
            actor: Mutex::new(Some(actor)),
        }
    }

    /// Connect to `device` and wait until the link is ready.
    ///
    /// Any existing link is closed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the link could not be brought up,
    /// including when the connect timeout expires or another `connect` or a
    /// `disconnect` supersedes this one.
    pub async fn connect(&self, device: C::Device) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect { device, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Close the link. Does nothing when already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect { reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Send a command and wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the link is ready and
    /// [`Error::CommandPending`] while another command is in flight.
    pub async fn send_command(&self, command: Command) -> Result<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Send { command, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Tell the device to start streaming.
    pub async fn send_start(&self) -> Result<()> {
        self.send_acknowledged(Command::Start).await
    }

    /// Tell the device to stop streaming.
    pub async fn send_stop(&self) -> Result<()> {
        self.send_acknowledged(Command::Stop).await
    }

    async fn send_acknowledged(&self, command: Command) -> Result<()> {
        match self.send_command(command).await? {
            CommandOutcome::Acknowledged => Ok(()),
            CommandOutcome::TimedOut { attempts } => Err(Error::CommandTimeout { command, attempts }),
            CommandOutcome::Abandoned => Err(Error::CommandAbandoned { command }),
        }
    }

    async fn request(&self, request: Request<C::Device>) -> Result<()> {
        self.requests.send(request).await.map_err(|_| actor_gone())
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Subscribe to all device events.
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Register a callback for every event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.publisher.on_event(callback)
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.publisher.on_connection_changed(callback)
    }

    /// Register a callback for telemetry.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Telemetry, chrono::DateTime<chrono::Utc>) + Send + Sync + 'static,
    {
        self.publisher.on_telemetry(callback)
    }

    /// Register a callback for battery updates.
    pub fn on_battery<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(BatteryLevels) + Send + Sync + 'static,
    {
        self.publisher.on_battery(callback)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        self.status.read().link_state
    }

    /// Check if the link is ready for commands.
    pub fn is_connected(&self) -> bool {
        self.link_state().is_ready()
    }

    /// Whether the device is streaming.
    pub fn run_state(&self) -> RunState {
        self.status.read().run_state
    }

    /// Latest battery levels reported on the current link.
    pub fn battery_levels(&self) -> Option<BatteryLevels> {
        self.status.read().battery
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Disconnect and stop the background task.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down connection manager");

        if self.actor.lock().is_none() {
            return Ok(());
        }

        let result = self.disconnect().await;
        if let Some(actor) = self.actor.lock().take() {
            actor.abort();
        }
        result
    }
}

impl<C: GattClient> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &*self.status.read())
            .field("config", &self.config)
            .finish()
    }
}

fn actor_gone() -> Error {
    Error::Internal("connection manager has shut down".to_string())
}

async fn run_actor<C: GattClient>(
    mut machine: LinkStateMachine<C>,
    mut requests: mpsc::Receiver<Request<C::Device>>,
    mut platform: mpsc::UnboundedReceiver<SessionEvent>,
) {
    debug!("Connection actor started");

    loop {
        let deadline = machine.next_deadline();

        tokio::select! {
            // Platform events first: an acknowledgment already queued must
            // be seen before the deadline it races with.
            biased;

            Some(event) = platform.recv() => machine.handle_platform(event),

            request = requests.recv() => match request {
                Some(Request::Connect { device, reply }) => {
                    machine.connect(device, Some(reply), Instant::now());
                }
                Some(Request::Disconnect { reply }) => {
                    machine.disconnect();
                    let _ = reply.send(());
                }
                Some(Request::Send { command, reply }) => {
                    machine.send(command, reply, Instant::now());
                }
                None => break,
            },

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                machine.handle_deadline(Instant::now());
            }
        }
    }

    machine.disconnect();
    debug!("Connection actor ended");
}
