//! A session together with the server-owned resources behind it.

use super::transcript::Transcript;
use crate::pty::PtyProcess;
use crate::session::Session;

/// Process state as last observed by the output drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited { code: i32 },
}

/// A running (or finished) agent session.
pub struct ManagedSession {
    pub session: Session,
    pub process: PtyProcess,
    pub state: ProcessState,
    pub transcript: Transcript,
}

impl ManagedSession {
    #[must_use]
    pub fn new(session: Session, process: PtyProcess) -> Self {
        Self {
            session,
            process,
            state: ProcessState::Running,
            transcript: Transcript::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.session.name
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running)
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self.state {
            ProcessState::Running => None,
            ProcessState::Exited { code } => Some(code),
        }
    }

    /// Read whatever output is pending into the transcript.
    ///
    /// Returns the exit code if the process has finished and was reaped by
    /// this call.
    pub fn drain(&mut self) -> Option<i32> {
        if !self.is_running() {
            return None;
        }
        // Reap first so output written just before exit is still collected
        let exited = self.process.try_wait().ok().flatten();

        let mut buf = [0u8; 4096];
        loop {
            match self.process.read_output(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.transcript.append(&buf[..n]),
                // EIO: the slave side closed, so the child is exiting
                Err(_) => break,
            }
        }

        if let Some(code) = exited {
            self.state = ProcessState::Exited { code };
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentId;
    use crate::config::AgentConfig;
    use crate::pty::{self, PtySize};
    use crate::session::{DeliveryMode, LaunchPlan, SessionPaths};
    use std::time::Duration;

    #[test]
    fn test_drain_collects_output_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::new(dir.path());
        std::fs::create_dir_all(paths.pid_dir()).unwrap();
        let plan = LaunchPlan::new(
            AgentId::Claude,
            Some("echo"),
            &AgentConfig::default(),
            Some("drained"),
        );
        let session = Session::new("t", AgentId::Claude, DeliveryMode::Pty, &plan, &paths).unwrap();
        let process = pty::spawn(&plan.argv(), PtySize::default(), &session.spawn_env(&paths)).unwrap();
        let mut managed = ManagedSession::new(session, process);

        let mut code = None;
        for _ in 0..200 {
            if let Some(c) = managed.drain() {
                code = Some(c);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(code, Some(0));
        assert!(!managed.is_running());
        assert_eq!(managed.exit_code(), Some(0));
        assert!(managed.transcript.tail_lines(5).contains("drained"));
        // Already reaped
        assert_eq!(managed.drain(), None);
    }
}
