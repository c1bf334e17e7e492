//! The seam between the launcher and whatever actually runs the guest.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::HypervisorError;
use crate::types::MachineSpec;

/// Whether the hypervisor can provide a NAT network backend on this host.
#[derive(Clone)]
pub enum NatSupport {
    Available,
    Unavailable(String),
    /// Host check that only runs once a NAT device is actually requested.
    Deferred(fn() -> NatSupport),
}

impl NatSupport {
    pub fn resolve(&self) -> NatSupport {
        match self {
            NatSupport::Deferred(probe) => probe(),
            other => other.clone(),
        }
    }
}

impl std::fmt::Debug for NatSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatSupport::Available => write!(f, "Available"),
            NatSupport::Unavailable(reason) => f.debug_tuple("Unavailable").field(reason).finish(),
            NatSupport::Deferred(_) => write!(f, "Deferred"),
        }
    }
}

/// Structural limits a machine description must satisfy.
#[derive(Debug, Clone)]
pub struct Constraints {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_memory_mib: u64,
    pub max_memory_mib: u64,
    pub max_cmdline_len: usize,
    pub nat: NatSupport,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            min_cpus: 1,
            max_cpus: u8::MAX as u32,
            min_memory_mib: 1,
            max_memory_mib: u32::MAX as u64,
            max_cmdline_len: 2048,
            nat: NatSupport::Available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    GuestStopped,
    GuestFailed(String),
}

/// Handed to the hypervisor so it can report how the guest ended.
#[derive(Debug, Clone)]
pub struct LifecycleObserver {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleObserver {
    pub fn channel() -> (LifecycleObserver, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LifecycleObserver { tx }, rx)
    }

    pub fn guest_did_stop(&self) {
        self.send(LifecycleEvent::GuestStopped);
    }

    pub fn did_stop_with_error(&self, message: impl Into<String>) {
        self.send(LifecycleEvent::GuestFailed(message.into()));
    }

    fn send(&self, event: LifecycleEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("lifecycle event dropped, controller is gone");
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;

    fn constraints(&self) -> Constraints;

    /// Instantiates a VM from a validated description. Nothing runs until
    /// [`VirtualMachine::start`] is called.
    async fn create(
        &self,
        spec: MachineSpec,
        observer: LifecycleObserver,
    ) -> Result<Box<dyn VirtualMachine>, HypervisorError>;
}

#[async_trait]
pub trait VirtualMachine: Send {
    /// Resolves once the guest is running, or with the reason it could not
    /// be started. Later outcomes arrive through the observer.
    async fn start(&mut self) -> Result<(), HypervisorError>;

    async fn kill(&mut self) -> Result<(), HypervisorError>;
}
