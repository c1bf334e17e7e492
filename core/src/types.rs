use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::convert::Infallible;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::str::FromStr;

use crate::kernel::KernelFormat;

pub const MIB: u64 = 1024 * 1024;

/// Locally administered MAC for the guest NIC (02:"ahyve").
pub const DEFAULT_MAC: [u8; 6] = [0x02, 0x61, 0x68, 0x79, 0x76, 0x65];

/// Whether the guest gets a network device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Nat,
    None,
}

impl FromStr for NetworkMode {
    type Err = Infallible;

    /// Only the exact disable sentinels turn networking off. Everything else,
    /// typos included, keeps NAT enabled.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "n" | "no" | "none" => Ok(NetworkMode::None),
            "nat" => Ok(NetworkMode::Nat),
            other => {
                tracing::warn!(value = %other, "unrecognized network mode, enabling NAT");
                Ok(NetworkMode::Nat)
            }
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Nat => write!(f, "nat"),
            NetworkMode::None => write!(f, "none"),
        }
    }
}

/// Typed launch parameters, as handed over by the command line.
#[derive(Debug, Clone)]
pub struct LaunchParameters {
    pub cpus: u32,
    pub memory_mib: u64,
    pub disk: Option<PathBuf>,
    pub network: NetworkMode,
    pub kernel: PathBuf,
    pub kernel_format: Option<KernelFormat>,
    pub initrd: Option<PathBuf>,
    pub cmdline: Option<String>,
}

impl LaunchParameters {
    pub fn new(kernel: impl Into<PathBuf>) -> Self {
        Self {
            cpus: 1,
            memory_mib: 512,
            disk: None,
            network: NetworkMode::Nat,
            kernel: kernel.into(),
            kernel_format: None,
            initrd: None,
            cmdline: None,
        }
    }
}

/// Duplex byte channel backing the guest's serial console.
///
/// Input is expected to already be in raw mode; the descriptors are owned
/// duplicates so the attachment outlives whatever produced them.
#[derive(Debug)]
pub struct ConsoleAttachment {
    input: OwnedFd,
    output: OwnedFd,
}

impl ConsoleAttachment {
    pub fn new(input: OwnedFd, output: OwnedFd) -> Self {
        Self { input, output }
    }

    pub fn input(&self) -> BorrowedFd<'_> {
        self.input.as_fd()
    }

    pub fn output(&self) -> BorrowedFd<'_> {
        self.output.as_fd()
    }
}

impl Serialize for ConsoleAttachment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ConsoleAttachment", 2)?;
        state.serialize_field("input_fd", &self.input.as_raw_fd())?;
        state.serialize_field("output_fd", &self.output.as_raw_fd())?;
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootSource {
    pub kernel: PathBuf,
    pub kernel_format: KernelFormat,
    pub initrd: Option<PathBuf>,
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub read_only: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackend {
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkDevice {
    pub backend: NetworkBackend,
    pub mac: [u8; 6],
}

impl NetworkDevice {
    pub fn nat() -> Self {
        Self {
            backend: NetworkBackend::Nat,
            mac: DEFAULT_MAC,
        }
    }

    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[derive(Debug, Serialize)]
pub struct ConsoleDevice {
    pub attachment: ConsoleAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EntropyDevice;

/// A validated machine description. Only the builder can produce one.
#[derive(Debug, Serialize)]
pub struct MachineSpec {
    pub(crate) cpu_count: u32,
    pub(crate) memory_size: u64,
    pub(crate) boot_source: BootSource,
    pub(crate) storage_devices: Vec<StorageDevice>,
    pub(crate) network_devices: Vec<NetworkDevice>,
    pub(crate) console_devices: Vec<ConsoleDevice>,
    pub(crate) entropy_devices: Vec<EntropyDevice>,
}

impl MachineSpec {
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    /// Memory size in bytes.
    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_size / MIB
    }

    pub fn boot_source(&self) -> &BootSource {
        &self.boot_source
    }

    pub fn storage_devices(&self) -> &[StorageDevice] {
        &self.storage_devices
    }

    pub fn network_devices(&self) -> &[NetworkDevice] {
        &self.network_devices
    }

    pub fn console_devices(&self) -> &[ConsoleDevice] {
        &self.console_devices
    }

    pub fn entropy_devices(&self) -> &[EntropyDevice] {
        &self.entropy_devices
    }

    /// The console attachment. Validation guarantees there is exactly one.
    pub fn console(&self) -> &ConsoleAttachment {
        &self.console_devices[0].attachment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_disable_sentinels() {
        assert_eq!("n".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!("no".parse::<NetworkMode>().unwrap(), NetworkMode::None);
        assert_eq!("none".parse::<NetworkMode>().unwrap(), NetworkMode::None);
    }

    #[test]
    fn test_network_mode_falls_through_to_nat() {
        for value in ["nat", "", "No", "NO", "off", "nO", "yes"] {
            assert_eq!(value.parse::<NetworkMode>().unwrap(), NetworkMode::Nat);
        }
    }

    #[test]
    fn test_mac_string() {
        assert_eq!(NetworkDevice::nat().mac_string(), "02:61:68:79:76:65");
    }
}
