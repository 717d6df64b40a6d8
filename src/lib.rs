//! systole is a library for reading bluetooth LE blood pressure monitors.
//! It uses btleplug as the bluetooth backend which supports Windows, Mac, and Linux
//!
//! ## Usage
//!
//! Example of how to use the library to log every reading of a paired cuff
//! until Ctrl-C is pressed
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use systole::{select_strategy, BtleplugTransport, ConnectionSupervisor, CsvSink, Settings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::from_env());
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let sink = Arc::new(CsvSink::new(settings.records_path()));
//!     let pairing = select_strategy(&settings, transport.clone());
//!
//!     let supervisor = Arc::new(ConnectionSupervisor::new(transport, sink, pairing, settings));
//!
//!     // Reconnects on its own until stopped
//!     let handle = supervisor.start("A4:C1:38:A5:20:BB");
//!     tokio::signal::ctrl_c().await?;
//!
//!     // Returns once notifications have been unsubscribed
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod btle;
pub mod config;
pub mod gatt;
pub mod measurement;
pub mod pairing;
pub mod sink;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use btle::{BtleplugLink, BtleplugTransport};
pub use config::{ConfigError, ConfigStore, Settings, StoredConfig};
pub use measurement::{decode, DecodeError, MeasurementRecord};
pub use pairing::{select_strategy, PairingOutcome, PairingStrategy};
pub use sink::{CsvSink, MeasurementSink, SinkError};
pub use supervisor::{Cancelled, CaptureOutcome, ConnectionState, ConnectionSupervisor, RunHandle};
pub use transport::{DiscoveredDevice, Link, RawNotification, Transport};

/// Error type for general errors and Ble errors from btleplug
#[derive(Debug, Error)]
pub enum Error {
    /// No bluetooth adapter found when trying to scan
    #[error("no bluetooth adapter found")]
    NoBleAdapter,
    /// Could not find a device when trying to connect
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// Device is not connected, but function was called that requires it
    #[error("device is not connected")]
    NotConnected,
    /// Device is missing a characteristic that was used
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    /// An error occurred in the underlying BLE library
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Result simplification type
pub type BleResult<T> = std::result::Result<T, Error>;
