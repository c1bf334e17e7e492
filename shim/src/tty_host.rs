//! Host-side terminal handling for the guest's serial console.
//!
//! Stdin is switched to raw mode (no CR-NL mapping, no line buffering, no
//! local echo) and paired with stdout as the console attachment handed to the
//! hypervisor.

use crate::error::ShimError;
use ahyve_core::ConsoleAttachment;
use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, Termios};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

/// RAII guard for raw terminal mode.
/// Restores original terminal settings on drop.
pub struct RawTerminal {
    fd: OwnedFd,
    original: Termios,
}

impl RawTerminal {
    /// Set the terminal behind `fd` to raw mode and return a guard that
    /// restores it on drop.
    pub fn set(fd: impl AsFd) -> Result<RawTerminal, ShimError> {
        let fd = fd.as_fd().try_clone_to_owned()?;

        let original = termios::tcgetattr(&fd).map_err(|source| ShimError::Terminal {
            action: "read",
            source,
        })?;

        let mut raw = original.clone();
        raw.input_flags.remove(InputFlags::ICRNL);
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);

        termios::tcsetattr(&fd, SetArg::TCSANOW, &raw).map_err(|source| ShimError::Terminal {
            action: "set",
            source,
        })?;

        tracing::debug!("terminal switched to raw mode");

        Ok(RawTerminal { fd, original })
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&self.fd, SetArg::TCSADRAIN, &self.original) {
            tracing::warn!(error = %e, "failed to restore terminal attributes");
        } else {
            tracing::debug!("terminal attributes restored");
        }
    }
}

/// Check if `fd` refers to a terminal.
pub fn is_tty(fd: impl AsFd) -> bool {
    unsafe { libc::isatty(fd.as_fd().as_raw_fd()) == 1 }
}

/// Puts `input` into raw mode and binds it with `output` into a console
/// attachment. The returned guard must be kept alive for as long as the
/// guest runs.
pub fn prepare_console(
    input: impl AsFd,
    output: impl AsFd,
) -> Result<(RawTerminal, ConsoleAttachment), ShimError> {
    let terminal = RawTerminal::set(input.as_fd())?;
    let attachment = ConsoleAttachment::new(
        input.as_fd().try_clone_to_owned()?,
        output.as_fd().try_clone_to_owned()?,
    );
    Ok((terminal, attachment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_prepare_console_sets_raw_mode() {
        let pty = openpty(None, None).unwrap();
        let before = termios::tcgetattr(&pty.slave).unwrap();

        let (terminal, attachment) = prepare_console(&pty.slave, &pty.slave).unwrap();
        let raw = termios::tcgetattr(&pty.slave).unwrap();

        assert!(!raw.input_flags.contains(InputFlags::ICRNL));
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        assert_eq!(
            raw.local_flags.contains(LocalFlags::ISIG),
            before.local_flags.contains(LocalFlags::ISIG)
        );
        assert_eq!(raw.output_flags, before.output_flags);
        assert_ne!(attachment.input().as_raw_fd(), pty.slave.as_raw_fd());

        drop(terminal);
        let after = termios::tcgetattr(&pty.slave).unwrap();
        assert_eq!(after.input_flags, before.input_flags);
        assert_eq!(after.local_flags, before.local_flags);
    }

    #[test]
    fn test_attachment_is_duplex() {
        let pty = openpty(None, None).unwrap();
        let (_terminal, attachment) = prepare_console(&pty.slave, &pty.slave).unwrap();

        let mut master = File::from(pty.master);
        master.write_all(b"a\r").unwrap();

        let mut input = File::from(attachment.input().try_clone_to_owned().unwrap());
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf).unwrap();
        // raw mode: no line buffering and CR is passed through untranslated
        assert_eq!(&buf, b"a\r");

        let mut output = File::from(attachment.output().try_clone_to_owned().unwrap());
        output.write_all(b"ok").unwrap();
        let mut echoed = [0u8; 2];
        master.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ok");
    }

    #[test]
    fn test_is_tty() {
        let pty = openpty(None, None).unwrap();
        assert!(is_tty(&pty.slave));

        let null = File::open("/dev/null").unwrap();
        assert!(!is_tty(&null));
    }

    #[test]
    fn test_prepare_console_requires_terminal() {
        let input = File::open("/dev/null").unwrap();
        let output = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();

        let result = prepare_console(&input, &output);
        assert!(matches!(
            result,
            Err(ShimError::Terminal { action: "read", .. })
        ));
    }
}
