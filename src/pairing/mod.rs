//! # Pairing
//!
//! Bonding with a cuff. Linux pairs most reliably through an interactive
//! `bluetoothctl` session, other platforms through the transport itself. The
//! choice is made once by [`select_strategy`].
//!

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use std::fmt;
use std::sync::Arc;

use crate::config::Settings;
use crate::transport::{Link, Transport};
use crate::Error;

pub mod agent;
pub mod shell;

pub use agent::{AgentTimeouts, PairingAgent, ShellLauncher, ShellOutput, ShellSession};
pub use shell::BluetoothctlLauncher;

/// How a pairing attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    /// The device or platform refused, or a needed PIN was not given
    Rejected,
    /// The pairing shell went quiet or exited before an answer
    TimedOut,
    /// The pairing shell could not be started
    AgentUnavailable,
}

impl PairingOutcome {
    pub fn is_paired(&self) -> bool {
        *self == PairingOutcome::Paired
    }
}

impl fmt::Display for PairingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PairingOutcome::Paired => "paired",
            PairingOutcome::Rejected => "rejected",
            PairingOutcome::TimedOut => "timed out",
            PairingOutcome::AgentUnavailable => "pairing agent unavailable",
        };
        f.write_str(text)
    }
}

/// A way of pairing with a device
#[async_trait]
pub trait PairingStrategy: Send + Sync {
    async fn pair(&self, address: &str, pin: Option<&str>) -> PairingOutcome;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Pairs through a [`PairingAgent`] on a blocking thread
pub struct InteractiveAgentStrategy {
    agent: Arc<PairingAgent>,
}

impl InteractiveAgentStrategy {
    pub fn new(agent: PairingAgent) -> InteractiveAgentStrategy {
        InteractiveAgentStrategy {
            agent: Arc::new(agent),
        }
    }
}

#[async_trait]
impl PairingStrategy for InteractiveAgentStrategy {
    async fn pair(&self, address: &str, pin: Option<&str>) -> PairingOutcome {
        let agent = Arc::clone(&self.agent);
        let address = address.to_string();
        let pin = pin.map(str::to_string);

        tokio::task::spawn_blocking(move || agent.pair(&address, pin.as_deref()))
            .await
            .unwrap_or_else(|why| {
                warn!("Pairing thread failed: {}", why);
                PairingOutcome::Rejected
            })
    }

    fn name(&self) -> &'static str {
        "interactive agent"
    }
}

/// Pairs with the bonding primitive of the transport
pub struct NativeTransportStrategy<T: Transport> {
    transport: Arc<T>,
    /// Used to find the device when no earlier scan saw it
    scan_timeout: Duration,
}

impl<T: Transport> NativeTransportStrategy<T> {
    pub fn new(transport: Arc<T>, scan_timeout: Duration) -> NativeTransportStrategy<T> {
        NativeTransportStrategy {
            transport,
            scan_timeout,
        }
    }

    async fn connect(&self, address: &str) -> Result<T::Link, Error> {
        match self.transport.connect(address).await {
            Err(Error::DeviceNotFound(_)) => {
                debug!(%address, "Not seen yet, scanning");
                self.transport.discover(self.scan_timeout).await?;
                self.transport.connect(address).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl<T: Transport> PairingStrategy for NativeTransportStrategy<T> {
    async fn pair(&self, address: &str, _pin: Option<&str>) -> PairingOutcome {
        let link = match self.connect(address).await {
            Ok(link) => link,
            Err(why) => {
                warn!(%address, "Could not connect for pairing: {}", why);
                return PairingOutcome::Rejected;
            }
        };

        let outcome = match link.native_pair().await {
            Ok(true) => PairingOutcome::Paired,
            Ok(false) => PairingOutcome::Rejected,
            Err(why) => {
                warn!(%address, "Pairing failed: {}", why);
                PairingOutcome::Rejected
            }
        };

        if let Err(why) = link.disconnect().await {
            debug!("Could not disconnect after pairing: {}", why);
        }

        info!(%address, "Pairing finished: {}", outcome);
        outcome
    }

    fn name(&self) -> &'static str {
        "native transport"
    }
}

/// Picks the pairing strategy for the platform this runs on
pub fn select_strategy<T: Transport>(
    settings: &Settings,
    transport: Arc<T>,
) -> Arc<dyn PairingStrategy> {
    let strategy: Arc<dyn PairingStrategy> = if cfg!(target_os = "linux") {
        let launcher = BluetoothctlLauncher::new(settings.pairing.program.clone());
        let agent = PairingAgent::new(launcher, settings.pairing.timeouts());
        Arc::new(InteractiveAgentStrategy::new(agent))
    } else {
        Arc::new(NativeTransportStrategy::new(transport, settings.scan_timeout()))
    };

    debug!("Pairing through {}", strategy.name());
    strategy
}
