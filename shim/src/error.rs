use ahyve_core::HypervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("configuration error: cannot {action} terminal attributes: {source}")]
    Terminal {
        action: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl From<ShimError> for HypervisorError {
    fn from(e: ShimError) -> Self {
        match e {
            ShimError::NotSupported(msg) => HypervisorError::Unavailable(msg),
            ShimError::Io(e) => HypervisorError::Io(e),
            other => HypervisorError::Start(other.to_string()),
        }
    }
}
