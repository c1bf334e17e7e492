//! Drives a machine description through the hypervisor until the guest ends.

use std::future::Future;
use std::sync::OnceLock;

use crate::error::RuntimeFailure;
use crate::hypervisor::{Hypervisor, LifecycleEvent, LifecycleObserver};
use crate::types::MachineSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Created,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
pub enum LifecycleOutcome {
    /// The guest halted on its own.
    Stopped,
    Failed(RuntimeFailure),
    /// The host process received the given signal and killed the guest.
    Interrupted(i32),
}

impl LifecycleOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            LifecycleOutcome::Stopped => 0,
            LifecycleOutcome::Failed(_) => 1,
            LifecycleOutcome::Interrupted(signal) => 128u8.saturating_add(*signal as u8),
        }
    }
}

impl std::fmt::Display for LifecycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleOutcome::Stopped => write!(f, "guest stopped"),
            LifecycleOutcome::Failed(failure) => write!(f, "{}", failure),
            LifecycleOutcome::Interrupted(signal) => {
                write!(f, "interrupted by signal {}", signal)
            }
        }
    }
}

/// Holds the first outcome reported for a run and ignores the rest.
#[derive(Debug, Default)]
pub struct OutcomeLatch {
    outcome: OnceLock<LifecycleOutcome>,
}

impl OutcomeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an outcome was already recorded.
    pub fn settle(&self, outcome: LifecycleOutcome) -> bool {
        match self.outcome.set(outcome) {
            Ok(()) => true,
            Err(late) => {
                tracing::warn!(outcome = %late, "ignoring outcome reported after termination");
                false
            }
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn get(&self) -> Option<&LifecycleOutcome> {
        self.outcome.get()
    }

    pub fn take(&mut self) -> Option<LifecycleOutcome> {
        self.outcome.take()
    }
}

pub struct LifecycleController<'a> {
    hypervisor: &'a dyn Hypervisor,
    state: VmState,
    latch: OutcomeLatch,
}

impl<'a> LifecycleController<'a> {
    pub fn new(hypervisor: &'a dyn Hypervisor) -> Self {
        Self {
            hypervisor,
            state: VmState::Created,
            latch: OutcomeLatch::new(),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Hands `spec` to the hypervisor, starts the guest and waits until it
    /// stops, fails, or `interrupt` resolves with a host signal number.
    pub async fn run<F>(&mut self, spec: MachineSpec, interrupt: F) -> LifecycleOutcome
    where
        F: Future<Output = i32>,
    {
        let (observer, mut events) = LifecycleObserver::channel();

        let mut vm = match self.hypervisor.create(spec, observer).await {
            Ok(vm) => vm,
            Err(e) => {
                self.settle(LifecycleOutcome::Failed(RuntimeFailure::Create(e)));
                return self.finish();
            }
        };
        self.transition(VmState::Starting);

        match vm.start().await {
            Ok(()) => self.transition(VmState::Running),
            Err(e) => {
                self.settle(LifecycleOutcome::Failed(RuntimeFailure::Start(e)));
                return self.finish();
            }
        }

        tokio::pin!(interrupt);

        while !self.latch.is_settled() {
            tokio::select! {
                // Interrupts take priority over whatever the killed
                // hypervisor reports afterwards.
                biased;

                signal = &mut interrupt => {
                    tracing::debug!(signal, "interrupted, killing guest");
                    if let Err(e) = vm.kill().await {
                        tracing::warn!(error = %e, "failed to kill guest");
                    }
                    self.settle(LifecycleOutcome::Interrupted(signal));
                }
                event = events.recv() => match event {
                    Some(LifecycleEvent::GuestStopped) => {
                        self.settle(LifecycleOutcome::Stopped);
                    }
                    Some(LifecycleEvent::GuestFailed(message)) => {
                        self.settle(LifecycleOutcome::Failed(RuntimeFailure::Guest(message)));
                    }
                    None => {
                        self.settle(LifecycleOutcome::Failed(RuntimeFailure::Guest(
                            "hypervisor went away without reporting an outcome".to_string(),
                        )));
                    }
                },
            }
        }

        self.finish()
    }

    fn transition(&mut self, next: VmState) {
        tracing::debug!(
            from = %self.state,
            to = %next,
            hypervisor = self.hypervisor.name(),
            "vm state"
        );
        self.state = next;
    }

    fn settle(&mut self, outcome: LifecycleOutcome) {
        let next = match outcome {
            LifecycleOutcome::Stopped | LifecycleOutcome::Interrupted(_) => VmState::Stopped,
            LifecycleOutcome::Failed(_) => VmState::Failed,
        };
        if self.latch.settle(outcome) {
            self.transition(next);
        }
    }

    fn finish(&mut self) -> LifecycleOutcome {
        self.latch.take().unwrap_or_else(|| {
            LifecycleOutcome::Failed(RuntimeFailure::Guest("no outcome recorded".to_string()))
        })
    }
}
