//! Host-side glue for `ahyve`: the terminal bridge and hypervisor backends.

mod error;
#[cfg(feature = "libkrun")]
mod libkrun;
pub mod tty_host;

use ahyve_core::Hypervisor;

pub use error::ShimError;
#[cfg(feature = "libkrun")]
pub use libkrun::LibkrunHypervisor;
pub use tty_host::{RawTerminal, is_tty, prepare_console};

/// The hypervisor this build was compiled with.
pub fn default_hypervisor() -> Result<Box<dyn Hypervisor>, ShimError> {
    #[cfg(feature = "libkrun")]
    {
        Ok(Box::new(LibkrunHypervisor::new()))
    }

    #[cfg(not(feature = "libkrun"))]
    {
        Err(ShimError::NotSupported(
            "ahyve was built without a hypervisor backend (enable the `libkrun` feature)"
                .to_string(),
        ))
    }
}
