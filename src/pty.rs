//! PTY creation and management.
//!
//! Sessions run their agent in a pseudo-terminal. This module forks the
//! agent onto the slave side and hands back the master.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use crate::inject::PtyMaster;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd};
use thiserror::Error;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("failed to exec: {0}")]
    Exec(#[source] nix::Error),

    #[error("command is empty")]
    EmptyCommand,

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] std::ffi::NulError),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to read PTY: {0}")]
    Read(#[source] nix::Error),

    #[error("failed to duplicate PTY master: {0}")]
    CloneMaster(#[source] std::io::Error),
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Environment variables added for the child.
#[derive(Debug, Default, Clone)]
pub struct SpawnEnv {
    pub vars: Vec<(String, String)>,
}

impl SpawnEnv {
    #[must_use]
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }
}

/// A process running on the slave side of a PTY.
pub struct PtyProcess {
    master: OwnedFd,
    pid: Pid,
}

impl PtyProcess {
    /// The child's process ID.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // PIDs are always positive
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Check if the child process has exited without blocking.
    /// Returns `Some(exit_code)` if exited, None if still running.
    pub fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
            // All other states (StillAlive, Stopped, Continued, etc.) mean not exited yet
            _ => Ok(None),
        }
    }

    /// Wait for the child process to exit (blocking).
    pub fn wait(&self) -> Result<i32, PtyError> {
        match waitpid(self.pid, None).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
            status => {
                tracing::warn!(?status, "unexpected wait status");
                Ok(-1)
            }
        }
    }

    /// Non-blocking read of pending output.
    ///
    /// Returns `Ok(0)` when nothing is available. `EIO` means the slave side
    /// has closed, which usually means the child exited.
    pub fn read_output(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        match nix::unistd::read(&self.master, buf) {
            Ok(n) => Ok(n),
            Err(nix::Error::EAGAIN) => Ok(0),
            Err(e) => Err(PtyError::Read(e)),
        }
    }

    /// Duplicate the master for use as an input writer.
    pub fn master_writer(&self) -> Result<PtyMaster, PtyError> {
        self.master
            .try_clone()
            .map(PtyMaster::new)
            .map_err(PtyError::CloneMaster)
    }
}

/// Spawn a command in a new PTY.
pub fn spawn(cmd: &[String], size: PtySize, env: &SpawnEnv) -> Result<PtyProcess, PtyError> {
    if cmd.is_empty() {
        return Err(PtyError::EmptyCommand);
    }

    // Build everything that allocates before forking
    let prog = CString::new(cmd[0].as_str()).map_err(PtyError::InvalidCommand)?;
    let args: Vec<CString> = cmd
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()
        .map_err(PtyError::InvalidCommand)?;

    let winsize = Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // Open a new PTY pair
    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    // Fork the process
    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            // Parent: close slave, keep master
            drop(slave);

            // Set master to non-blocking mode for async I/O
            let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
            let mut flags = OFlag::from_bits_retain(flags);
            flags.insert(OFlag::O_NONBLOCK);
            fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

            Ok(PtyProcess { master, pid: child })
        }
        ForkResult::Child => {
            drop(master);

            setsid().map_err(PtyError::Setsid)?;

            // Set the slave as the controlling terminal
            unsafe {
                let ret = libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0);
                if ret < 0 {
                    std::process::exit(1);
                }
            }

            // Redirect stdin/stdout/stderr to the slave using libc directly
            // (nix's dup2 API is awkward for this use case)
            let slave_fd = slave.as_raw_fd();
            unsafe {
                if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
                    || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
                    || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
                {
                    std::process::exit(1);
                }
            }

            // Close the original slave fd if it's not one of 0, 1, 2
            if slave_fd > 2 {
                drop(slave);
            }

            // SAFETY: We're in a forked child process before exec, so modifying
            // environment is safe (no other threads exist in this process).
            unsafe {
                for (key, value) in &env.vars {
                    std::env::set_var(key, value);
                }
            }

            execvp(&prog, &args).map_err(PtyError::Exec)?;

            // execvp only returns on error
            unreachable!()
        }
    }
}
