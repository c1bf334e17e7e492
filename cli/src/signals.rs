use tokio::signal::unix::{Signal, SignalKind, signal};

/// Host signals that end the run. Installed before the terminal goes raw so
/// none of them can kill the process with the terminal still in raw mode.
pub struct HostSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl HostSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Resolves with the number of the first signal received.
    pub async fn recv(mut self) -> i32 {
        tokio::select! {
            _ = self.interrupt.recv() => libc::SIGINT,
            _ = self.terminate.recv() => libc::SIGTERM,
            _ = self.hangup.recv() => libc::SIGHUP,
        }
    }
}
