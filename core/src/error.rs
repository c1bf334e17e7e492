use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning launch parameters into a machine description.
///
/// All of them happen before anything has been handed to the hypervisor, so
/// there is never anything to roll back.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot attach {device} device {}: {source}", .target.display())]
    DeviceAttachment {
        device: &'static str,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid machine description: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),

    #[error("failed to create virtual machine: {0}")]
    Create(String),

    #[error("failed to start virtual machine: {0}")]
    Start(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A failure reported after the machine description was handed off.
#[derive(Error, Debug)]
pub enum RuntimeFailure {
    #[error("{0}")]
    Create(#[source] HypervisorError),

    #[error("{0}")]
    Start(#[source] HypervisorError),

    #[error("virtual machine stopped with error: {0}")]
    Guest(String),
}
