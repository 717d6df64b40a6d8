//! # Supervisor
//!
//! Keeps one cuff connected: scan until it shows up, connect, subscribe to
//! its measurements and pass every decoded record to the sink. Dropped links
//! and failed attempts are retried after a fixed backoff until the run is
//! stopped.
//!

use futures::stream::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use std::sync::Arc;

use crate::config::Settings;
use crate::gatt::MEASUREMENT_CHARACTERISTIC;
use crate::measurement;
use crate::pairing::{PairingOutcome, PairingStrategy};
use crate::sink::MeasurementSink;
use crate::transport::{DiscoveredDevice, Link, NotificationStream, RawNotification, Transport};
use crate::{BleResult, Error};

/// Where a supervised connection currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    /// Connected with notifications enabled. Records only flow here.
    Subscribed,
    Disconnecting,
}

/// A stopped run has finished its cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Result of a bounded capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Notifications arrived. `rejected` could not be decoded.
    Received { decoded: usize, rejected: usize },
    /// The window passed without a single notification
    NoData,
}

/// How one connection attempt ended
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Retry,
    Cancelled,
}

/// Enabled notifications on a link.
///
/// Call [`Subscription::release`] to unsubscribe. If it is dropped without
/// that, the unsubscribe is sent from a spawned task instead.
struct Subscription<L: Link> {
    link: L,
    characteristic: Uuid,
    active: bool,
}

impl<L: Link> Subscription<L> {
    fn new(link: L, characteristic: Uuid) -> Subscription<L> {
        Subscription {
            link,
            characteristic,
            active: true,
        }
    }

    async fn release(mut self) {
        if let Err(why) = self.link.unsubscribe(self.characteristic).await {
            warn!("Could not unsubscribe: {}", why);
        }
        self.active = false;
    }
}

impl<L: Link> Drop for Subscription<L> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let link = self.link.clone();
            let characteristic = self.characteristic;
            runtime.spawn(async move {
                let _ = link.unsubscribe(characteristic).await;
            });
        }
    }
}

/// Resolves once a stop was requested. A dropped sender counts as one.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *stop.borrow_and_update();
        if stopping {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// True once a stop was requested, without waiting for one
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Owns the connection to one cuff
pub struct ConnectionSupervisor<T: Transport> {
    transport: Arc<T>,
    sink: Arc<dyn MeasurementSink>,
    pairing: Arc<dyn PairingStrategy>,
    settings: Arc<Settings>,
    state: watch::Sender<ConnectionState>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    pub fn new(
        transport: Arc<T>,
        sink: Arc<dyn MeasurementSink>,
        pairing: Arc<dyn PairingStrategy>,
        settings: Arc<Settings>,
    ) -> ConnectionSupervisor<T> {
        let (state, _) = watch::channel(ConnectionState::Idle);

        ConnectionSupervisor {
            transport,
            sink,
            pairing,
            settings,
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("State {:?} -> {:?}", previous, state);
        }
    }

    /// Scan for `timeout` and list what was seen. Nothing seen is an empty
    /// list, not an error.
    pub async fn discover(&self, timeout: Duration) -> BleResult<Vec<DiscoveredDevice>> {
        self.transport.discover(timeout).await
    }

    /// Pair through the strategy chosen for this platform
    pub async fn pair(&self, address: &str, pin: Option<&str>) -> PairingOutcome {
        info!(%address, "Pairing");
        self.pairing.pair(address, pin).await
    }

    /// Run [`ConnectionSupervisor::run`] on its own task
    pub fn start(self: &Arc<Self>, address: &str) -> RunHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = Arc::clone(self);
        let task_address = address.to_string();
        let task = tokio::spawn(async move { supervisor.run(&task_address, stop_rx).await });

        RunHandle {
            address: address.to_string(),
            stop: stop_tx,
            task,
        }
    }

    /// Keep `address` connected and forward its measurements until `stop`
    /// turns true.
    ///
    /// Scan and connection failures and dropped links are logged and retried
    /// after the backoff. Returns only once stopped, after notifications
    /// were unsubscribed.
    pub async fn run(&self, address: &str, mut stop: watch::Receiver<bool>) -> Cancelled {
        info!(%address, "Supervising");

        loop {
            if self.attempt(address, &mut stop).await == Exit::Cancelled {
                break;
            }

            debug!("Retrying in {:?}", self.settings.backoff());
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = time::sleep(self.settings.backoff()) => {}
            }
        }

        self.set_state(ConnectionState::Idle);
        info!(%address, "Supervision stopped");
        Cancelled
    }

    /// Listen to `address` for `window`, then disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the device is not in range, or
    /// the transport error that prevented connecting and subscribing.
    pub async fn capture(&self, address: &str, window: Duration) -> BleResult<CaptureOutcome> {
        let result = self.capture_inner(address, window).await;
        self.set_state(ConnectionState::Idle);
        result
    }

    async fn capture_inner(&self, address: &str, window: Duration) -> BleResult<CaptureOutcome> {
        let link = self.open(address).await?;
        let mut stream = match link.subscribe(MEASUREMENT_CHARACTERISTIC).await {
            Ok(stream) => stream,
            Err(why) => {
                self.close(&link).await;
                return Err(why);
            }
        };
        let subscription = Subscription::new(link.clone(), MEASUREMENT_CHARACTERISTIC);
        self.set_state(ConnectionState::Subscribed);
        info!(%address, "Waiting {:?} for measurements", window);

        let (mut decoded, mut rejected) = (0, 0);
        let deadline = time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                notification = stream.next() => match notification {
                    Some(notification) => {
                        if self.forward(&notification).await {
                            decoded += 1;
                        } else {
                            rejected += 1;
                        }
                    }
                    None => {
                        info!(%address, "Link dropped during capture");
                        break;
                    }
                },
            }
        }

        self.set_state(ConnectionState::Disconnecting);
        subscription.release().await;
        self.close(&link).await;

        if decoded + rejected == 0 {
            info!(%address, "No data received");
            return Ok(CaptureOutcome::NoData);
        }
        Ok(CaptureOutcome::Received { decoded, rejected })
    }

    /// One pass from scanning to a dropped or stopped link
    async fn attempt(&self, address: &str, stop: &mut watch::Receiver<bool>) -> Exit {
        let found = tokio::select! {
            _ = stopped(stop) => return Exit::Cancelled,
            found = self.scan(address) => found,
        };
        // A connect in flight is not interrupted, the link it opens has to
        // be closed again
        let link = match found {
            Ok(()) => self.connect(address).await,
            Err(why) => Err(why),
        };
        let link = match link {
            Ok(link) => link,
            Err(Error::DeviceNotFound(_)) => {
                info!(%address, "Device not in range");
                return Exit::Retry;
            }
            Err(why) => {
                warn!(%address, "Could not connect: {}", why);
                return Exit::Retry;
            }
        };
        if stop_requested(stop) {
            self.set_state(ConnectionState::Disconnecting);
            self.close(&link).await;
            return Exit::Cancelled;
        }

        let subscribed = tokio::select! {
            _ = stopped(stop) => None,
            subscribed = link.subscribe(MEASUREMENT_CHARACTERISTIC) => Some(subscribed),
        };
        let stream = match subscribed {
            Some(Ok(stream)) => stream,
            Some(Err(why)) => {
                warn!(%address, "Could not subscribe to measurements: {}", why);
                self.close(&link).await;
                return Exit::Retry;
            }
            None => {
                self.set_state(ConnectionState::Disconnecting);
                self.close(&link).await;
                return Exit::Cancelled;
            }
        };
        let subscription = Subscription::new(link.clone(), MEASUREMENT_CHARACTERISTIC);
        self.set_state(ConnectionState::Subscribed);
        info!(%address, "Subscribed to measurements");

        let exit = self.pump(&link, stream, stop).await;

        self.set_state(ConnectionState::Disconnecting);
        subscription.release().await;
        self.close(&link).await;
        exit
    }

    /// Scan until the deadline, then connect if `address` was seen
    async fn open(&self, address: &str) -> BleResult<T::Link> {
        self.scan(address).await?;
        self.connect(address).await
    }

    async fn scan(&self, address: &str) -> BleResult<()> {
        self.set_state(ConnectionState::Scanning);
        let devices = self.transport.discover(self.settings.scan_timeout()).await?;
        if !devices.iter().any(|d| d.is(address)) {
            return Err(Error::DeviceNotFound(address.to_string()));
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> BleResult<T::Link> {
        self.set_state(ConnectionState::Connecting);
        let link = self.transport.connect(address).await?;
        if !link.is_connected().await {
            self.close(&link).await;
            return Err(Error::NotConnected);
        }

        Ok(link)
    }

    /// Forward notifications until the link drops or a stop is requested
    async fn pump(
        &self,
        link: &T::Link,
        mut stream: NotificationStream,
        stop: &mut watch::Receiver<bool>,
    ) -> Exit {
        let mut liveness = time::interval(self.settings.liveness_interval());
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        liveness.tick().await;

        loop {
            tokio::select! {
                _ = stopped(stop) => return Exit::Cancelled,
                notification = stream.next() => match notification {
                    Some(notification) => {
                        self.forward(&notification).await;
                    }
                    None => {
                        info!("Link dropped");
                        return Exit::Retry;
                    }
                },
                _ = liveness.tick() => {
                    if !link.is_connected().await {
                        info!("Link no longer connected");
                        return Exit::Retry;
                    }
                }
            }
        }
    }

    /// Decode one notification and hand it to the sink. False if it could
    /// not be decoded.
    async fn forward(&self, notification: &RawNotification) -> bool {
        debug!(sender = %notification.sender, "Raw: {:02x?}", notification.value);

        let record = match measurement::decode(&notification.value) {
            Ok(record) => record,
            Err(why) => {
                warn!("Dropping notification {:02x?}: {}", notification.value, why);
                return false;
            }
        };

        if let Err(why) = self.sink.append(&record).await {
            error!("Could not store measurement: {}", why);
        }
        true
    }

    async fn close(&self, link: &T::Link) {
        if let Err(why) = link.disconnect().await {
            debug!("Could not disconnect: {}", why);
        }
    }
}

/// The running task of [`ConnectionSupervisor::start`].
///
/// Dropping the handle stops the run as well, without waiting for it.
pub struct RunHandle {
    address: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<Cancelled>,
}

impl RunHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the run to stop and wait until it has cleaned up
    pub async fn stop(self) -> Cancelled {
        debug!(address = %self.address, "Stopping");
        // Fails only when the task already ended
        let _ = self.stop.send(true);

        match self.task.await {
            Ok(cancelled) => cancelled,
            Err(why) => {
                error!("Supervisor task failed: {}", why);
                Cancelled
            }
        }
    }
}
