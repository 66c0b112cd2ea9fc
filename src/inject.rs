//! Keystroke injection into a session's PTY.
//!
//! Injection types the text, waits for the foreground program to take it in,
//! then presses Enter. It is best-effort: a successful return only means the
//! bytes reached the terminal's input buffer, not that the agent read them.
//! Use inbox delivery when that matters.

use nix::errno::Errno;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The Enter key as a terminal sends it.
pub const ENTER: u8 = b'\r';

/// Pause between the text and the Enter byte.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Pause when the PTY input buffer is full.
const STALL_DELAY: Duration = Duration::from_millis(5);
/// Full-buffer pauses tolerated before giving up (about one second).
const MAX_STALLS: u32 = 200;

/// Errors that can occur while injecting.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to write to PTY: {0}")]
    Io(#[from] io::Error),

    #[error("PTY input buffer stayed full")]
    Stalled,
}

/// Something that accepts terminal input bytes.
pub trait PtyInput: Send {
    /// Write as much of `buf` as can be accepted without blocking.
    ///
    /// Returns `ErrorKind::WouldBlock` when nothing can be written right now.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Write side of a PTY master (a duplicate of the session's master fd).
pub struct PtyMaster {
    fd: OwnedFd,
}

impl PtyMaster {
    #[must_use]
    pub const fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl PtyInput for PtyMaster {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        match nix::unistd::write(&self.fd, buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialised keystroke injector for one session.
///
/// Concurrent `inject` calls are queued on an internal lock, so each message
/// is always followed directly by its own Enter.
pub struct PtyInjector {
    input: Mutex<Box<dyn PtyInput>>,
    settle: Duration,
}

impl PtyInjector {
    pub fn new(input: impl PtyInput + 'static) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            settle: SETTLE_DELAY,
        }
    }

    /// Override the pause between text and Enter.
    #[must_use]
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Type `text` into the terminal and press Enter.
    pub async fn inject(&self, text: &str) -> Result<(), InjectError> {
        let mut input = self.input.lock().await;

        write_all(input.as_mut(), text.as_bytes()).await?;
        tokio::time::sleep(self.settle).await;
        write_all(input.as_mut(), &[ENTER]).await?;

        debug!(bytes = text.len(), "Injected text into PTY");
        Ok(())
    }
}

async fn write_all(input: &mut dyn PtyInput, mut buf: &[u8]) -> Result<(), InjectError> {
    let mut stalls = 0;
    while !buf.is_empty() {
        match input.write_some(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                buf = &buf[n..];
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls > MAX_STALLS {
                    warn!(remaining = buf.len(), "PTY input buffer full, giving up");
                    return Err(InjectError::Stalled);
                }
                tokio::time::sleep(STALL_DELAY).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
