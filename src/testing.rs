//! In-memory transport for tests.

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{self, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use std::sync::{Arc, Mutex};

use crate::transport::{DiscoveredDevice, Link, NotificationStream, RawNotification, Transport};
use crate::{BleResult, Error};

/// Every call the transport and its links received
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub scans: usize,
    pub connects: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub disconnects: usize,
    pub calls: Vec<&'static str>,
}

impl CallLog {
    fn record(&mut self, call: &'static str) {
        match call {
            "discover" => self.scans += 1,
            "connect" => self.connects += 1,
            "subscribe" => self.subscribes += 1,
            "unsubscribe" => self.unsubscribes += 1,
            "disconnect" => self.disconnects += 1,
            _ => {}
        }
        self.calls.push(call);
    }
}

#[derive(Default)]
struct Inner {
    in_range: Vec<DiscoveredDevice>,
    pair_result: Option<bool>,
    failing_connects: usize,
    connect_delay: Duration,
    subscribe_delay: Duration,
    connected: bool,
    notifier: Option<(Uuid, UnboundedSender<RawNotification>)>,
    log: CallLog,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    pub fn with_device(self, address: &str, name: &str) -> MockTransport {
        self.inner.lock().unwrap().in_range.push(DiscoveredDevice {
            address: address.to_string(),
            name: Some(name.to_string()),
        });
        self
    }

    pub fn set_pair_result(&self, result: Option<bool>) {
        self.inner.lock().unwrap().pair_result = result;
    }

    pub fn fail_connects(&self, count: usize) {
        self.inner.lock().unwrap().failing_connects = count;
    }

    /// Connects take `delay` after the peripheral already accepted them
    pub fn delay_connects(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = delay;
    }

    /// Subscribes take `delay` before the stream is handed out
    pub fn delay_subscribes(&self, delay: Duration) {
        self.inner.lock().unwrap().subscribe_delay = delay;
    }

    /// Push a value on the open subscription, false if there is none
    pub fn notify(&self, value: &[u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.notifier {
            Some((sender, tx)) => tx
                .send(RawNotification {
                    sender: *sender,
                    value: value.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// The peripheral goes away: the link reports disconnected and the
    /// notification stream ends
    pub fn drop_link(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.notifier = None;
    }

    /// The link reports disconnected but the notification stream stays
    /// open, as when the peripheral goes silent
    pub fn lose_connection(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    pub fn log(&self) -> CallLog {
        self.inner.lock().unwrap().log.clone()
    }

    fn record(&self, call: &'static str) {
        self.inner.lock().unwrap().log.record(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn discover(&self, timeout: Duration) -> BleResult<Vec<DiscoveredDevice>> {
        self.record("discover");
        time::sleep(timeout).await;
        Ok(self.inner.lock().unwrap().in_range.clone())
    }

    async fn connect(&self, address: &str) -> BleResult<MockLink> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.log.record("connect");

            if inner.failing_connects > 0 {
                inner.failing_connects -= 1;
                return Err(Error::NotConnected);
            }
            if !inner.in_range.iter().any(|d| d.is(address)) {
                return Err(Error::DeviceNotFound(address.to_string()));
            }

            inner.connected = true;
            inner.connect_delay
        };
        time::sleep(delay).await;

        Ok(MockLink {
            transport: self.clone(),
        })
    }
}

#[derive(Clone)]
pub struct MockLink {
    transport: MockTransport,
}

#[async_trait]
impl Link for MockLink {
    async fn is_connected(&self) -> bool {
        self.transport.inner.lock().unwrap().connected
    }

    async fn subscribe(&self, characteristic: Uuid) -> BleResult<NotificationStream> {
        let delay = {
            let mut inner = self.transport.inner.lock().unwrap();
            inner.log.record("subscribe");
            inner.subscribe_delay
        };
        time::sleep(delay).await;

        let mut inner = self.transport.inner.lock().unwrap();
        if !inner.connected {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.notifier = Some((characteristic, tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> BleResult<()> {
        let mut inner = self.transport.inner.lock().unwrap();
        inner.log.record("unsubscribe");
        inner.notifier = None;
        Ok(())
    }

    async fn native_pair(&self) -> BleResult<bool> {
        self.transport.record("native_pair");
        self.transport
            .inner
            .lock()
            .unwrap()
            .pair_result
            .ok_or(Error::NotConnected)
    }

    async fn disconnect(&self) -> BleResult<()> {
        let mut inner = self.transport.inner.lock().unwrap();
        inner.log.record("disconnect");
        inner.connected = false;
        inner.notifier = None;
        Ok(())
    }
}
