//! libkrun VM execution.
//!
//! `krun_start_enter` takes over the calling process and exits it when the
//! guest shuts down, so the VM runs in a forked child. The child reports
//! whether configuration succeeded over a status pipe; its exit status is the
//! guest's outcome.

use crate::ShimError;
use ahyve_core::MachineSpec;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::network::{COMPAT_NET_FEATURES, NET_FLAG_VFKIT};

/// Exit status of a child that never reached the guest.
pub const START_FAILED_STATUS: i32 = 125;

const STATUS_READY: u8 = 0;
const STATUS_FAILED: u8 = 1;

const BLOCK_ID: &CStr = c"vda";

/// Everything the child needs, converted before forking.
#[derive(Debug)]
pub struct KrunConfig {
    pub cpus: u8,
    pub ram_mib: u32,
    pub kernel: CString,
    pub kernel_format: u32,
    pub initrd: Option<CString>,
    pub cmdline: Option<CString>,
    pub disk: Option<CString>,
    pub mac: Option<[u8; 6]>,
    pub console_in: RawFd,
    pub console_out: RawFd,
}

impl KrunConfig {
    /// The returned config borrows the console descriptors of `spec` by
    /// number, so `spec` must outlive the child.
    pub fn from_spec(spec: &MachineSpec) -> Result<Self, ShimError> {
        let boot = spec.boot_source();

        let cpus = u8::try_from(spec.cpu_count()).map_err(|_| {
            ShimError::NotSupported(format!(
                "{} vCPUs is more than libkrun supports",
                spec.cpu_count()
            ))
        })?;
        let ram_mib = u32::try_from(spec.memory_mib()).map_err(|_| {
            ShimError::NotSupported(format!(
                "{} MiB is more than libkrun supports",
                spec.memory_mib()
            ))
        })?;

        Ok(KrunConfig {
            cpus,
            ram_mib,
            kernel: path_cstring(&boot.kernel)?,
            kernel_format: boot.kernel_format.code(),
            initrd: boot.initrd.as_deref().map(path_cstring).transpose()?,
            cmdline: boot
                .cmdline
                .as_deref()
                .map(|c| {
                    CString::new(c).map_err(|_| {
                        ShimError::RuntimeError(
                            "kernel command line contains a NUL byte".to_string(),
                        )
                    })
                })
                .transpose()?,
            disk: spec
                .storage_devices()
                .first()
                .map(|d| path_cstring(&d.path))
                .transpose()?,
            mac: spec.network_devices().first().map(|n| n.mac),
            console_in: spec.console().input().as_raw_fd(),
            console_out: spec.console().output().as_raw_fd(),
        })
    }
}

fn path_cstring(path: &Path) -> Result<CString, ShimError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ShimError::RuntimeError(format!("path contains a NUL byte: {}", path.display()))
    })
}

pub fn set_rlimits() {
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) == 0 {
            limit.rlim_cur = limit.rlim_max;
            libc::setrlimit(libc::RLIMIT_NOFILE, &limit);
        }
    }
}

/// How the VM child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

/// Wait for the VM child and report how it ended.
pub fn wait_for_child(pid: libc::pid_t) -> ChildExit {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret >= 0 {
            break;
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return ChildExit::Exited(START_FAILED_STATUS);
        }
    }
    if libc::WIFEXITED(status) {
        ChildExit::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ChildExit::Signaled(libc::WTERMSIG(status))
    } else {
        ChildExit::Exited(1)
    }
}

/// Fork and run the VM in a child process.
///
/// Returns the child pid and the read end of its status pipe.
pub fn fork_and_run_vm(
    config: &KrunConfig,
    net_socket: Option<&CStr>,
) -> Result<(libc::pid_t, OwnedFd), ShimError> {
    let (status_rx, status_tx) = nix::unistd::pipe()?;

    let pid = unsafe { libc::fork() };

    if pid < 0 {
        return Err(ShimError::RuntimeError("Fork failed".to_string()));
    }

    if pid == 0 {
        drop(status_rx);
        run_vm_inner(config, net_socket, status_tx);
    }

    drop(status_tx);
    Ok((pid, status_rx))
}

/// Blocks until the child reports that the guest is about to start.
pub fn read_start_status(status_rx: OwnedFd) -> Result<(), String> {
    let mut status = File::from(status_rx);
    let mut tag = [0u8; 1];
    match status.read(&mut tag) {
        Ok(0) => Err("hypervisor process exited before the guest started".to_string()),
        Ok(_) if tag[0] == STATUS_READY => Ok(()),
        Ok(_) => {
            let mut message = String::new();
            let _ = status.read_to_string(&mut message);
            Err(message)
        }
        Err(e) => Err(format!("cannot read hypervisor status: {}", e)),
    }
}

fn run_vm_inner(config: &KrunConfig, net_socket: Option<&CStr>, status_tx: OwnedFd) -> ! {
    let mut status = File::from(status_tx);

    // Terminal signals belong to the parent, which stops the VM with SIGTERM.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
    }

    match configure(config, net_socket) {
        Ok(ctx_id) => {
            let _ = status.write_all(&[STATUS_READY]);
            drop(status);
            // Only returns if the VM could not be entered.
            unsafe { krun_sys::krun_start_enter(ctx_id) };
        }
        Err(message) => {
            let _ = status.write_all(&[STATUS_FAILED]);
            let _ = status.write_all(message.as_bytes());
            drop(status);
        }
    }

    unsafe { libc::_exit(START_FAILED_STATUS) }
}

fn check(ret: i32, what: &str) -> Result<(), String> {
    if ret < 0 {
        Err(format!(
            "{} failed: {}",
            what,
            std::io::Error::from_raw_os_error(-ret)
        ))
    } else {
        Ok(())
    }
}

fn opt_ptr(value: &Option<CString>) -> *const libc::c_char {
    value.as_ref().map_or(std::ptr::null(), |v| v.as_ptr())
}

fn configure(config: &KrunConfig, net_socket: Option<&CStr>) -> Result<u32, String> {
    if unsafe { libc::dup2(config.console_in, libc::STDIN_FILENO) } < 0
        || unsafe { libc::dup2(config.console_out, libc::STDOUT_FILENO) } < 0
    {
        return Err(format!(
            "cannot attach console: {}",
            std::io::Error::last_os_error()
        ));
    }

    set_rlimits();

    let ctx_id = unsafe { krun_sys::krun_create_ctx() };
    check(ctx_id, "krun_create_ctx")?;
    let ctx_id = ctx_id as u32;

    check(
        unsafe { krun_sys::krun_set_vm_config(ctx_id, config.cpus, config.ram_mib) },
        "krun_set_vm_config",
    )?;

    check(
        unsafe {
            krun_sys::krun_set_kernel(
                ctx_id,
                config.kernel.as_ptr(),
                config.kernel_format,
                opt_ptr(&config.initrd),
                opt_ptr(&config.cmdline),
            )
        },
        "krun_set_kernel",
    )?;

    if let Some(disk) = &config.disk {
        check(
            unsafe { krun_sys::krun_add_disk(ctx_id, BLOCK_ID.as_ptr(), disk.as_ptr(), false) },
            "krun_add_disk",
        )?;
    }

    // A virtio-net device backed by gvproxy; this also disables TSI.
    if let (Some(socket), Some(mac)) = (net_socket, config.mac) {
        let mut mac = mac;
        check(
            unsafe {
                krun_sys::krun_add_net_unixgram(
                    ctx_id,
                    socket.as_ptr(),
                    -1,
                    mac.as_mut_ptr(),
                    COMPAT_NET_FEATURES,
                    NET_FLAG_VFKIT,
                )
            },
            "krun_add_net_unixgram",
        )?;
    }

    // libkrun always exposes a virtio-rng device; nothing to configure.

    Ok(ctx_id)
}
