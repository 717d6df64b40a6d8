//! # Btle
//!
//! [`Transport`] on top of btleplug, which supports Windows, Mac, and Linux.
//!

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::gatt::MEASUREMENT_CHARACTERISTIC;
use crate::transport::{DiscoveredDevice, Link, NotificationStream, RawNotification, Transport};
use crate::{BleResult, Error};

/// Scans and connects through the first bluetooth adapter of the system
pub struct BtleplugTransport {
    /// Kept alive for as long as the adapter is in use
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Creates a transport on the first bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ble`] if the bluetooth manager could not be created
    /// and [`Error::NoBleAdapter`] if the system has no adapter.
    pub async fn new() -> BleResult<BtleplugTransport> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoBleAdapter)?;

        Ok(BtleplugTransport {
            _manager: manager,
            adapter,
        })
    }

    async fn find_device(&self, address: &str) -> BleResult<Option<Peripheral>> {
        for p in self.adapter.peripherals().await? {
            if p.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(p));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = BtleplugLink;

    async fn discover(&self, timeout: Duration) -> BleResult<Vec<DiscoveredDevice>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        time::sleep(timeout).await;
        if let Err(why) = self.adapter.stop_scan().await {
            debug!("Could not stop scan: {}", why);
        }

        let mut devices = Vec::new();
        for p in self.adapter.peripherals().await? {
            let properties = p.properties().await.ok().flatten();
            match advertised(p.address().to_string(), properties) {
                Some(device) => devices.push(device),
                None => trace!(address = %p.address(), "Known but not advertising"),
            }
        }

        debug!("Scan found {} devices", devices.len());
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> BleResult<BtleplugLink> {
        let device = self
            .find_device(address)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;

        if !device.is_connected().await? {
            device.connect().await?;
        }
        device.discover_services().await?;
        info!(%address, "Connected");

        Ok(BtleplugLink {
            adapter: self.adapter.clone(),
            device,
        })
    }
}

/// An open btleplug connection
#[derive(Clone)]
pub struct BtleplugLink {
    adapter: Adapter,
    device: Peripheral,
}

#[async_trait]
impl Link for BtleplugLink {
    async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn subscribe(&self, characteristic: Uuid) -> BleResult<NotificationStream> {
        if !self.is_connected().await {
            return Err(Error::NotConnected);
        }

        let target = find_characteristic(&self.device, characteristic)?;
        // Open both streams before subscribing so no early value is lost
        let mut values = self.device.notifications().await?;
        let mut events = self.adapter.events().await?;
        self.device.subscribe(&target).await?;

        let id = self.device.id();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    value = values.next() => match value {
                        Some(ValueNotification { uuid, value }) if uuid == characteristic => {
                            trace!("Data: {:02x?}", value);
                            if tx.send(RawNotification { sender: uuid, value }).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            debug!("Peripheral reported disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> BleResult<()> {
        let target = find_characteristic(&self.device, characteristic)?;
        self.device.unsubscribe(&target).await?;
        Ok(())
    }

    /// btleplug has no pairing call. Windows and macOS bond on the first
    /// access to an encrypted characteristic, which on blood pressure cuffs
    /// is the measurement indication, so toggling it drives the OS dialog.
    async fn native_pair(&self) -> BleResult<bool> {
        let target = find_characteristic(&self.device, MEASUREMENT_CHARACTERISTIC)?;
        self.device.subscribe(&target).await?;
        if let Err(why) = self.device.unsubscribe(&target).await {
            warn!("Could not unsubscribe after pairing: {}", why);
        }

        Ok(self.is_connected().await)
    }

    async fn disconnect(&self) -> BleResult<()> {
        self.device.disconnect().await?;
        Ok(())
    }
}

/// BlueZ also lists cached and bonded peripherals. Only those with a signal
/// strength were heard during the scan.
fn advertised(address: String, properties: Option<PeripheralProperties>) -> Option<DiscoveredDevice> {
    let properties = properties?;
    properties.rssi?;

    Some(DiscoveredDevice {
        address,
        name: properties.local_name,
    })
}

/// Private helper to find characteristics from a uuid
fn find_characteristic(device: &Peripheral, uuid: Uuid) -> BleResult<Characteristic> {
    device
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(Error::CharacteristicNotFound(uuid))
}

#[cfg(test)]
mod test {
    use super::*;

    const ADDRESS: &str = "A4:C1:38:A5:20:BB";

    #[test]
    fn cached_peripherals_are_skipped() {
        let heard = PeripheralProperties {
            rssi: Some(-61),
            local_name: Some("BM64".to_string()),
            ..Default::default()
        };
        let cached = PeripheralProperties {
            local_name: Some("BM64".to_string()),
            ..Default::default()
        };

        let device = advertised(ADDRESS.to_string(), Some(heard)).unwrap();
        assert_eq!(device.to_string(), "BM64 [A4:C1:38:A5:20:BB]");
        assert_eq!(advertised(ADDRESS.to_string(), Some(cached)), None);
        assert_eq!(advertised(ADDRESS.to_string(), None), None);
    }
}
