//! # Transport
//!
//! The capability set the rest of the crate needs from a BLE stack. The
//! btleplug backed implementation lives in [`crate::btle`]; anything else
//! offering these operations can stand in for it.
//!

use async_trait::async_trait;
use futures::stream::Stream;
use tokio::time::Duration;
use uuid::Uuid;

use std::fmt;
use std::pin::Pin;

use crate::BleResult;

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Bluetooth address, e.g. `A4:C1:38:A5:20:BB`
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
}

impl DiscoveredDevice {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// Whether this device has the given address, ignoring case
    pub fn is(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name(), self.address)
    }
}

/// Bytes pushed by a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// The characteristic that sent the value
    pub sender: Uuid,
    pub value: Vec<u8>,
}

/// Notifications of one subscription, in the order the peripheral sent them.
///
/// The stream ends when the link to the peripheral drops.
pub type NotificationStream = Pin<Box<dyn Stream<Item = RawNotification> + Send>>;

/// Scanning and connecting
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    /// Scan for `timeout` and report everything seen. Finding nothing is not
    /// an error.
    async fn discover(&self, timeout: Duration) -> BleResult<Vec<DiscoveredDevice>>;

    /// Open a connection to a peripheral found by an earlier scan
    async fn connect(&self, address: &str) -> BleResult<Self::Link>;
}

/// An open connection to one peripheral.
///
/// Links are cheap handles onto the same connection, so cloning one does not
/// open a second connection.
#[async_trait]
pub trait Link: Clone + Send + Sync + 'static {
    async fn is_connected(&self) -> bool;

    /// Enable notifications on `characteristic` and hand back their stream
    async fn subscribe(&self, characteristic: Uuid) -> BleResult<NotificationStream>;

    async fn unsubscribe(&self, characteristic: Uuid) -> BleResult<()>;

    /// Ask the platform to bond with the peripheral
    async fn native_pair(&self) -> BleResult<bool>;

    async fn disconnect(&self) -> BleResult<()>;
}
