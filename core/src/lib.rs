//! Machine description, hypervisor seam and lifecycle control for `ahyve`.

pub mod builder;
mod error;
pub mod hypervisor;
pub mod kernel;
pub mod lifecycle;
mod types;

pub use builder::{MachineSpecBuilder, build};
pub use error::{BuildError, HypervisorError, RuntimeFailure};
pub use hypervisor::{
    Constraints, Hypervisor, LifecycleEvent, LifecycleObserver, NatSupport, VirtualMachine,
};
pub use kernel::KernelFormat;
pub use lifecycle::{LifecycleController, LifecycleOutcome, OutcomeLatch, VmState};
pub use types::*;
