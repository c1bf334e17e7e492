//! libkrun-backed hypervisor.
//!
//! Boots the guest kernel in a lightweight VM on Hypervisor.framework (macOS)
//! or KVM (Linux).

mod krun;
mod network;

use crate::ShimError;
use ahyve_core::{
    Constraints, Hypervisor, HypervisorError, LifecycleObserver, MachineSpec, NatSupport,
    VirtualMachine,
};
use async_trait::async_trait;
use krun::{ChildExit, KrunConfig};
use network::GvproxyNetwork;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

/// Longest kernel command line libkrun passes through.
const MAX_CMDLINE_LEN: usize = 2048;

pub struct LibkrunHypervisor;

impl LibkrunHypervisor {
    pub fn new() -> Self {
        LibkrunHypervisor
    }
}

impl Default for LibkrunHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for LibkrunHypervisor {
    fn name(&self) -> &'static str {
        "libkrun"
    }

    fn constraints(&self) -> Constraints {
        Constraints {
            min_cpus: 1,
            max_cpus: u8::MAX as u32,
            min_memory_mib: 1,
            max_memory_mib: u32::MAX as u64,
            max_cmdline_len: MAX_CMDLINE_LEN,
            nat: NatSupport::Deferred(nat_support),
        }
    }

    async fn create(
        &self,
        spec: MachineSpec,
        observer: LifecycleObserver,
    ) -> Result<Box<dyn VirtualMachine>, HypervisorError> {
        let config =
            KrunConfig::from_spec(&spec).map_err(|e| HypervisorError::Create(e.to_string()))?;
        tracing::debug!(?config, "libkrun configuration prepared");

        Ok(Box::new(KrunVm {
            spec,
            config,
            observer,
            network: None,
            child: None,
        }))
    }
}

fn nat_support() -> NatSupport {
    if network::gvproxy_available() {
        NatSupport::Available
    } else {
        NatSupport::Unavailable(
            "gvproxy not found (install with: brew install gvisor-tap-vsock)".to_string(),
        )
    }
}

struct KrunVm {
    /// Owns the console descriptors the child inherits.
    spec: MachineSpec,
    config: KrunConfig,
    observer: LifecycleObserver,
    network: Option<GvproxyNetwork>,
    child: Option<libc::pid_t>,
}

impl KrunVm {
    async fn start_network(&mut self) -> Result<Option<CString>, ShimError> {
        if self.config.mac.is_none() {
            return Ok(None);
        }

        let tag = std::process::id().to_string();
        let network = tokio::task::spawn_blocking(move || GvproxyNetwork::start(&tag))
            .await
            .map_err(|e| ShimError::RuntimeError(e.to_string()))??;

        let socket = CString::new(network.socket_path().as_os_str().as_bytes()).map_err(|_| {
            ShimError::RuntimeError("gvproxy socket path contains a NUL byte".to_string())
        })?;
        self.network = Some(network);
        Ok(Some(socket))
    }
}

#[async_trait]
impl VirtualMachine for KrunVm {
    async fn start(&mut self) -> Result<(), HypervisorError> {
        let net_socket = self.start_network().await?;

        let (pid, status_rx) = krun::fork_and_run_vm(&self.config, net_socket.as_deref())?;
        let mac = self.spec.network_devices().first().map(|nic| nic.mac_string());
        tracing::debug!(
            pid,
            cpus = self.spec.cpu_count(),
            memory_mib = self.spec.memory_mib(),
            mac = mac.as_deref().unwrap_or("none"),
            "libkrun child started"
        );

        let started = tokio::task::spawn_blocking(move || krun::read_start_status(status_rx))
            .await
            .map_err(|e| HypervisorError::Start(e.to_string()))?;

        if let Err(message) = started {
            let exit = tokio::task::spawn_blocking(move || krun::wait_for_child(pid)).await;
            tracing::debug!(?exit, "libkrun child failed to start");
            return Err(HypervisorError::Start(message));
        }

        self.child = Some(pid);

        let observer = self.observer.clone();
        tokio::task::spawn_blocking(move || match krun::wait_for_child(pid) {
            ChildExit::Exited(0) => observer.guest_did_stop(),
            ChildExit::Exited(code) => {
                observer.did_stop_with_error(format!("hypervisor exited with status {}", code))
            }
            ChildExit::Signaled(signal) => {
                observer.did_stop_with_error(format!("hypervisor killed by signal {}", signal))
            }
        });

        Ok(())
    }

    async fn kill(&mut self) -> Result<(), HypervisorError> {
        if let Some(pid) = self.child {
            tracing::debug!(pid, "sending SIGTERM to libkrun child");
            kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(ShimError::from)?;
        }
        Ok(())
    }
}
