//! NAT networking for libkrun guests.
//!
//! The NAT backend is gvproxy (gvisor-tap-vsock), a userspace network stack
//! that libkrun talks to over a unix datagram socket using the vfkit
//! protocol. It gives the guest:
//! - Gateway at 192.168.127.1
//! - Host accessible at 192.168.127.254
//! - DHCP for guest IP assignment
//! - DNS forwarding to host resolver

use crate::ShimError;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Network features for virtio-net device.
const NET_FEATURE_CSUM: u32 = 1 << 0;
const NET_FEATURE_GUEST_CSUM: u32 = 1 << 1;
const NET_FEATURE_GUEST_TSO4: u32 = 1 << 7;
const NET_FEATURE_HOST_TSO4: u32 = 1 << 11;
const NET_FEATURE_HOST_UFO: u32 = 1 << 14;
const NET_FEATURE_GUEST_UFO: u32 = 1 << 10;

/// Features gvproxy can handle.
pub const COMPAT_NET_FEATURES: u32 = NET_FEATURE_CSUM
    | NET_FEATURE_GUEST_CSUM
    | NET_FEATURE_GUEST_TSO4
    | NET_FEATURE_GUEST_UFO
    | NET_FEATURE_HOST_TSO4
    | NET_FEATURE_HOST_UFO;

/// Flag to send vfkit magic bytes after connection (required for gvproxy).
pub const NET_FLAG_VFKIT: u32 = 1 << 0;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_POLL_ATTEMPTS: u32 = 50;

/// A running gvproxy process, killed together with its socket on drop.
pub struct GvproxyNetwork {
    child: Child,
    socket_path: PathBuf,
}

impl GvproxyNetwork {
    /// Start gvproxy and wait for it to create its socket.
    pub fn start(tag: &str) -> Result<Self, ShimError> {
        let socket_path = std::env::temp_dir().join(format!("ahyve-gvproxy-{}.sock", tag));

        // Remove old socket if it exists
        let _ = std::fs::remove_file(&socket_path);

        let mut child = Command::new("gvproxy")
            .arg("-listen-vfkit")
            .arg(format!("unixgram://{}", socket_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ShimError::RuntimeError(format!(
                    "Failed to start gvproxy (is it installed?): {}. \
                     Install with: brew install gvisor-tap-vsock",
                    e
                ))
            })?;

        let mut attempts = 0;
        while !socket_path.exists() && attempts < SOCKET_POLL_ATTEMPTS {
            if let Some(status) = child.try_wait()? {
                return Err(ShimError::RuntimeError(format!(
                    "gvproxy exited before creating its socket ({})",
                    status
                )));
            }
            std::thread::sleep(SOCKET_POLL_INTERVAL);
            attempts += 1;
        }

        if !socket_path.exists() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ShimError::RuntimeError(format!(
                "gvproxy socket not created in time (waited {}ms, path: {})",
                attempts as u128 * SOCKET_POLL_INTERVAL.as_millis(),
                socket_path.display()
            )));
        }

        tracing::info!(socket_path = %socket_path.display(), "gvproxy started");

        Ok(Self { child, socket_path })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for GvproxyNetwork {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket_path);

        tracing::debug!("gvproxy process cleaned up");
    }
}

/// Check if gvproxy is available on the system.
pub fn gvproxy_available() -> bool {
    Command::new("gvproxy")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
