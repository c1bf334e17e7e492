//! Assembly of a [`MachineSpec`] from launch parameters.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::hypervisor::{Constraints, NatSupport};
use crate::kernel::KernelFormat;
use crate::types::*;

/// Accumulates devices and settings; yields a [`MachineSpec`] only once
/// [`MachineSpecBuilder::build`] has validated the whole picture.
#[derive(Debug, Default)]
pub struct MachineSpecBuilder {
    cpu_count: u32,
    memory_size: u64,
    boot_source: Option<BootSource>,
    storage_devices: Vec<StorageDevice>,
    network_devices: Vec<NetworkDevice>,
    console_devices: Vec<ConsoleDevice>,
    entropy_devices: Vec<EntropyDevice>,
}

impl MachineSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn memory_size(mut self, bytes: u64) -> Self {
        self.memory_size = bytes;
        self
    }

    pub fn boot_source(mut self, boot_source: BootSource) -> Self {
        self.boot_source = Some(boot_source);
        self
    }

    pub fn console(mut self, attachment: ConsoleAttachment) -> Self {
        self.console_devices.push(ConsoleDevice { attachment });
        self
    }

    pub fn storage(mut self, device: StorageDevice) -> Self {
        self.storage_devices.push(device);
        self
    }

    pub fn network(mut self, device: NetworkDevice) -> Self {
        self.network_devices.push(device);
        self
    }

    pub fn entropy(mut self) -> Self {
        self.entropy_devices.push(EntropyDevice);
        self
    }

    /// Checks the assembled description against `constraints` and freezes it.
    pub fn build(self, constraints: &Constraints) -> Result<MachineSpec, BuildError> {
        let invalid = |msg: String| Err(BuildError::Validation(msg));

        if self.cpu_count < constraints.min_cpus || self.cpu_count > constraints.max_cpus {
            return invalid(format!(
                "{} vCPUs requested, supported range is {}..={}",
                self.cpu_count, constraints.min_cpus, constraints.max_cpus
            ));
        }

        if self.memory_size % MIB != 0 {
            return invalid(format!(
                "memory size {} is not a whole number of MiB",
                self.memory_size
            ));
        }
        let memory_mib = self.memory_size / MIB;
        if memory_mib < constraints.min_memory_mib || memory_mib > constraints.max_memory_mib {
            return invalid(format!(
                "{} MiB of memory requested, supported range is {}..={} MiB",
                memory_mib, constraints.min_memory_mib, constraints.max_memory_mib
            ));
        }

        let Some(boot_source) = self.boot_source else {
            return invalid("no boot source".to_string());
        };
        if let Some(cmdline) = &boot_source.cmdline
            && cmdline.len() > constraints.max_cmdline_len
        {
            return invalid(format!(
                "kernel command line is {} bytes, limit is {}",
                cmdline.len(),
                constraints.max_cmdline_len
            ));
        }

        if self.console_devices.len() != 1 {
            return invalid(format!(
                "expected exactly one console device, got {}",
                self.console_devices.len()
            ));
        }
        if self.entropy_devices.len() != 1 {
            return invalid(format!(
                "expected exactly one entropy device, got {}",
                self.entropy_devices.len()
            ));
        }
        if self.storage_devices.len() > 1 {
            return invalid(format!(
                "at most one storage device is supported, got {}",
                self.storage_devices.len()
            ));
        }
        if self.network_devices.len() > 1 {
            return invalid(format!(
                "at most one network device is supported, got {}",
                self.network_devices.len()
            ));
        }

        Ok(MachineSpec {
            cpu_count: self.cpu_count,
            memory_size: self.memory_size,
            boot_source,
            storage_devices: self.storage_devices,
            network_devices: self.network_devices,
            console_devices: self.console_devices,
            entropy_devices: self.entropy_devices,
        })
    }
}

/// Turns launch parameters into a validated machine description.
///
/// Steps run in a fixed order and the first failure aborts: sizing, boot
/// source, console, disk, network, entropy, then validation.
pub fn build(
    params: &LaunchParameters,
    console: ConsoleAttachment,
    constraints: &Constraints,
) -> Result<MachineSpec, BuildError> {
    if params.cpus == 0 {
        return Err(BuildError::Configuration(
            "cpu count must be positive".to_string(),
        ));
    }
    if params.memory_mib == 0 {
        return Err(BuildError::Configuration(
            "memory size must be positive".to_string(),
        ));
    }
    let memory_size = params.memory_mib.checked_mul(MIB).ok_or_else(|| {
        BuildError::Configuration(format!("memory size {} MiB is too large", params.memory_mib))
    })?;

    let mut builder = MachineSpecBuilder::new()
        .cpus(params.cpus)
        .memory_size(memory_size)
        .boot_source(boot_source(params)?)
        .console(console);

    if let Some(disk) = non_empty(params.disk.as_deref()) {
        builder = builder.storage(open_disk(disk)?);
    }

    if params.network == NetworkMode::Nat {
        if let NatSupport::Unavailable(reason) = constraints.nat.resolve() {
            return Err(BuildError::DeviceAttachment {
                device: "network",
                target: PathBuf::from("nat"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, reason),
            });
        }
        builder = builder.network(NetworkDevice::nat());
    }

    let spec = builder.entropy().build(constraints)?;

    tracing::debug!(
        cpus = spec.cpu_count(),
        memory = spec.memory_size(),
        disks = spec.storage_devices().len(),
        nics = spec.network_devices().len(),
        "machine description built"
    );

    Ok(spec)
}

/// Empty paths mean "not given".
fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn boot_source(params: &LaunchParameters) -> Result<BootSource, BuildError> {
    if params.kernel.as_os_str().is_empty() {
        return Err(BuildError::Configuration(
            "a kernel image is required".to_string(),
        ));
    }

    let detected = KernelFormat::detect_file(&params.kernel).map_err(|e| {
        BuildError::Configuration(format!(
            "cannot read kernel image {}: {}",
            params.kernel.display(),
            e
        ))
    })?;
    let kernel_format = params.kernel_format.unwrap_or(detected);
    tracing::debug!(kernel = %params.kernel.display(), %kernel_format, "boot source");

    let initrd = match non_empty(params.initrd.as_deref()) {
        Some(initrd) => {
            std::fs::File::open(initrd).map_err(|e| {
                BuildError::Configuration(format!(
                    "cannot read initrd {}: {}",
                    initrd.display(),
                    e
                ))
            })?;
            Some(initrd.to_path_buf())
        }
        None => None,
    };

    if let Some(cmdline) = &params.cmdline {
        CString::new(cmdline.as_bytes()).map_err(|_| {
            BuildError::Configuration("kernel command line contains a NUL byte".to_string())
        })?;
    }

    Ok(BootSource {
        kernel: params.kernel.clone(),
        kernel_format,
        initrd,
        cmdline: params.cmdline.clone(),
    })
}

/// Opens the disk image read-write to make sure the guest will be able to
/// use it. The file is never created.
fn open_disk(path: &Path) -> Result<StorageDevice, BuildError> {
    let attach_err = |source: std::io::Error| BuildError::DeviceAttachment {
        device: "disk",
        target: path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(attach_err)?;
    let metadata = file.metadata().map_err(attach_err)?;
    if metadata.is_dir() {
        return Err(attach_err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "is a directory",
        )));
    }

    tracing::debug!(disk = %path.display(), size = metadata.len(), "disk attached");

    Ok(StorageDevice {
        path: path.to_path_buf(),
        read_only: false,
        size: metadata.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{NamedTempFile, TempDir};

    fn console() -> ConsoleAttachment {
        let input: OwnedFd = File::open("/dev/null").unwrap().into();
        let output: OwnedFd = OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap()
            .into();
        ConsoleAttachment::new(input, output)
    }

    fn kernel() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"\x7fELF kernel").unwrap();
        file
    }

    fn params(kernel: &NamedTempFile) -> LaunchParameters {
        LaunchParameters::new(kernel.path())
    }

    #[test]
    fn test_end_to_end_example() {
        let kernel = kernel();
        let params = LaunchParameters {
            cpus: 2,
            memory_mib: 1024,
            disk: Some(PathBuf::from("")),
            network: "no".parse().unwrap(),
            ..params(&kernel)
        };

        let spec = build(&params, console(), &Constraints::default()).unwrap();

        assert_eq!(spec.cpu_count(), 2);
        assert_eq!(spec.memory_size(), 1_073_741_824);
        assert!(spec.storage_devices().is_empty());
        assert!(spec.network_devices().is_empty());
        assert_eq!(spec.console_devices().len(), 1);
        assert_eq!(spec.entropy_devices().len(), 1);
        assert_eq!(spec.boot_source().kernel_format, KernelFormat::Elf);
    }

    #[test]
    fn test_spec_serializes_for_logging() {
        let kernel = kernel();
        let spec = build(&params(&kernel), console(), &Constraints::default()).unwrap();

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["cpu_count"], 1);
        assert_eq!(value["boot_source"]["kernel_format"], "elf");
        assert_eq!(value["network_devices"][0]["backend"], "nat");
        assert!(value["console_devices"][0]["attachment"]["input_fd"].is_i64());
    }

    #[test]
    fn test_console_and_entropy_always_present() {
        let kernel = kernel();
        let disk = NamedTempFile::new().unwrap();

        for (disk, network) in [
            (None, NetworkMode::Nat),
            (None, NetworkMode::None),
            (Some(disk.path().to_path_buf()), NetworkMode::Nat),
            (Some(disk.path().to_path_buf()), NetworkMode::None),
        ] {
            let params = LaunchParameters {
                disk,
                network,
                ..params(&kernel)
            };
            let spec = build(&params, console(), &Constraints::default()).unwrap();
            assert_eq!(spec.console_devices().len(), 1);
            assert_eq!(spec.entropy_devices().len(), 1);
        }
    }

    #[test]
    fn test_disk_attached() {
        let kernel = kernel();
        let mut disk = NamedTempFile::new().unwrap();
        disk.write_all(&[0u8; 4096]).unwrap();

        let params = LaunchParameters {
            disk: Some(disk.path().to_path_buf()),
            ..params(&kernel)
        };
        let spec = build(&params, console(), &Constraints::default()).unwrap();

        assert_eq!(spec.storage_devices().len(), 1);
        assert_eq!(spec.storage_devices()[0].path, disk.path());
        assert_eq!(spec.storage_devices()[0].size, 4096);
        assert!(!spec.storage_devices()[0].read_only);
    }

    #[test]
    fn test_missing_disk_fails() {
        let kernel = kernel();
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.img");

        let params = LaunchParameters {
            disk: Some(missing.clone()),
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());

        assert!(matches!(
            result,
            Err(BuildError::DeviceAttachment { device: "disk", .. })
        ));
        assert!(!missing.exists());
    }

    #[test]
    fn test_directory_disk_fails() {
        let kernel = kernel();
        let dir = TempDir::new().unwrap();

        let params = LaunchParameters {
            disk: Some(dir.path().to_path_buf()),
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::DeviceAttachment { .. })));
    }

    #[test]
    fn test_network_modes() {
        let kernel = kernel();

        for (value, expected) in [("no", 0), ("n", 0), ("nat", 1), ("", 1), ("nop", 1)] {
            let params = LaunchParameters {
                network: value.parse().unwrap(),
                ..params(&kernel)
            };
            let spec = build(&params, console(), &Constraints::default()).unwrap();
            assert_eq!(spec.network_devices().len(), expected, "network mode {:?}", value);
            if expected == 1 {
                assert_eq!(spec.network_devices()[0].backend, NetworkBackend::Nat);
            }
        }
    }

    #[test]
    fn test_nat_unavailable_fails() {
        let kernel = kernel();
        let constraints = Constraints {
            nat: NatSupport::Unavailable("gvproxy not found".to_string()),
            ..Constraints::default()
        };

        let result = build(&params(&kernel), console(), &constraints);
        assert!(matches!(
            result,
            Err(BuildError::DeviceAttachment { device: "network", .. })
        ));

        let params = LaunchParameters {
            network: NetworkMode::None,
            ..params(&kernel)
        };
        assert!(build(&params, console(), &constraints).is_ok());
    }

    static NAT_PROBED: AtomicBool = AtomicBool::new(false);

    fn probe_nat() -> NatSupport {
        NAT_PROBED.store(true, Ordering::SeqCst);
        NatSupport::Unavailable("gvproxy not found".to_string())
    }

    #[test]
    fn test_nat_check_only_runs_when_requested() {
        let kernel = kernel();
        let constraints = Constraints {
            nat: NatSupport::Deferred(probe_nat),
            ..Constraints::default()
        };

        let no_network = LaunchParameters {
            network: NetworkMode::None,
            ..params(&kernel)
        };
        assert!(build(&no_network, console(), &constraints).is_ok());
        assert!(!NAT_PROBED.load(Ordering::SeqCst));

        let result = build(&params(&kernel), console(), &constraints);
        assert!(matches!(
            result,
            Err(BuildError::DeviceAttachment { device: "network", .. })
        ));
        assert!(NAT_PROBED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_empty_kernel_fails() {
        let params = LaunchParameters::new("");
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_unreadable_kernel_fails() {
        let dir = TempDir::new().unwrap();
        let params = LaunchParameters::new(dir.path().join("vmlinuz"));
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_kernel_format_override() {
        let kernel = kernel();
        let params = LaunchParameters {
            kernel_format: Some(KernelFormat::Raw),
            ..params(&kernel)
        };
        let spec = build(&params, console(), &Constraints::default()).unwrap();
        assert_eq!(spec.boot_source().kernel_format, KernelFormat::Raw);
    }

    #[test]
    fn test_initrd_and_cmdline() {
        let kernel = kernel();
        let initrd = NamedTempFile::new().unwrap();

        let params = LaunchParameters {
            initrd: Some(initrd.path().to_path_buf()),
            cmdline: Some("console=hvc0 root=/dev/vda".to_string()),
            ..params(&kernel)
        };
        let spec = build(&params, console(), &Constraints::default()).unwrap();

        assert_eq!(spec.boot_source().initrd.as_deref(), Some(initrd.path()));
        assert_eq!(
            spec.boot_source().cmdline.as_deref(),
            Some("console=hvc0 root=/dev/vda")
        );
    }

    #[test]
    fn test_missing_initrd_fails() {
        let kernel = kernel();
        let dir = TempDir::new().unwrap();
        let params = LaunchParameters {
            initrd: Some(dir.path().join("initrd.img")),
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_cmdline_with_nul_fails() {
        let kernel = kernel();
        let params = LaunchParameters {
            cmdline: Some("quiet\0init=/bin/sh".to_string()),
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_memory_conversion() {
        let kernel = kernel();
        for mib in [1u64, 512, 65536] {
            let params = LaunchParameters {
                memory_mib: mib,
                ..params(&kernel)
            };
            let spec = build(&params, console(), &Constraints::default()).unwrap();
            assert_eq!(spec.memory_size(), mib * 1024 * 1024);
            assert_eq!(spec.memory_mib(), mib);
        }
    }

    #[test]
    fn test_zero_cpus_fails() {
        let kernel = kernel();
        let params = LaunchParameters {
            cpus: 0,
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_memory_overflow_fails() {
        let kernel = kernel();
        let params = LaunchParameters {
            memory_mib: u64::MAX,
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Configuration(_))));
    }

    #[test]
    fn test_too_many_cpus_fails_validation() {
        let kernel = kernel();
        let params = LaunchParameters {
            cpus: 256,
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }

    #[test]
    fn test_memory_out_of_range_fails_validation() {
        let kernel = kernel();
        let constraints = Constraints {
            min_memory_mib: 128,
            ..Constraints::default()
        };
        let params = LaunchParameters {
            memory_mib: 64,
            ..params(&kernel)
        };
        let result = build(&params, console(), &constraints);
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }

    #[test]
    fn test_long_cmdline_fails_validation() {
        let kernel = kernel();
        let params = LaunchParameters {
            cmdline: Some("x".repeat(4096)),
            ..params(&kernel)
        };
        let result = build(&params, console(), &Constraints::default());
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }

    #[test]
    fn test_builder_rejects_missing_console() {
        let result = MachineSpecBuilder::new()
            .cpus(1)
            .memory_size(512 * MIB)
            .boot_source(BootSource {
                kernel: PathBuf::from("vmlinuz"),
                kernel_format: KernelFormat::Raw,
                initrd: None,
                cmdline: None,
            })
            .entropy()
            .build(&Constraints::default());
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }

    #[test]
    fn test_builder_rejects_second_disk() {
        let disk = StorageDevice {
            path: PathBuf::from("disk.img"),
            read_only: false,
            size: 0,
        };
        let result = MachineSpecBuilder::new()
            .cpus(1)
            .memory_size(512 * MIB)
            .boot_source(BootSource {
                kernel: PathBuf::from("vmlinuz"),
                kernel_format: KernelFormat::Raw,
                initrd: None,
                cmdline: None,
            })
            .console(console())
            .storage(disk.clone())
            .storage(disk)
            .entropy()
            .build(&Constraints::default());
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }

    #[test]
    fn test_builder_rejects_partial_mib() {
        let result = MachineSpecBuilder::new()
            .cpus(1)
            .memory_size(MIB + 1)
            .boot_source(BootSource {
                kernel: PathBuf::from("vmlinuz"),
                kernel_format: KernelFormat::Raw,
                initrd: None,
                cmdline: None,
            })
            .console(console())
            .entropy()
            .build(&Constraints::default());
        assert!(matches!(result, Err(BuildError::Validation(_))));
    }
}
