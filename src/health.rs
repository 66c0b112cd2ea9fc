//! Process health tracking via PID files.
//!
//! A spawned agent writes its own PID file shortly after it starts, so for a
//! while after spawn the file simply does not exist. [`check_alive`] retries
//! with a fixed delay to ride out that window, and only reports
//! [`ProcessHealth::Crashed`] when there is positive evidence of death.

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How hard to look for a PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of reads. Zero still performs one best-effort read.
    pub max_attempts: u32,
    /// Sleep between reads (never after the last one).
    pub delay: Duration,
}

impl RetryPolicy {
    /// A single read with no sleeping.
    pub const SINGLE: Self = Self {
        max_attempts: 1,
        delay: Duration::ZERO,
    };

    const fn effective_attempts(self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProcessHealth {
    /// A live process matching the agent's patterns owns the PID file.
    Alive { pid: u32 },
    /// No PID file was seen, and nothing says the process is dead.
    Unknown,
    /// The PID file pointed at a dead or foreign process, or vanished.
    Crashed,
}

/// Result of [`check_alive`], including how many reads were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub health: ProcessHealth,
    pub attempts: u32,
}

/// Compiled process-name patterns.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    set: RegexSet,
}

impl ProcessMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            set: RegexSet::new(patterns)?,
        })
    }

    /// Whether any pattern matches the given command line.
    #[must_use]
    pub fn matches(&self, command_line: &str) -> bool {
        self.set.is_match(command_line)
    }
}

/// Access to the host process table.
pub trait ProcessProbe {
    /// Whether a process with this PID exists.
    fn exists(&self, pid: u32) -> bool;
    /// The full command line of the process, if it can be read.
    fn command_line(&self, pid: u32) -> Option<String>;
}

/// Probe backed by the real OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn exists(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // Signal 0 probes existence; EPERM means it exists but is not ours.
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        if let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) {
            let joined = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(String::from_utf8_lossy)
                .collect::<Vec<_>>()
                .join(" ");
            if !joined.is_empty() {
                return Some(joined);
            }
        }

        // No procfs (macOS) or a zombie with an empty cmdline
        let output = std::process::Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "command="])
            .output()
            .ok()?;
        let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if command.is_empty() {
            None
        } else {
            Some(command)
        }
    }
}

/// What a single read of the PID file found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFileState {
    /// No file yet.
    Missing,
    /// The file exists but holds no complete PID (writer mid-write).
    Incomplete,
    /// A parsed PID.
    Pid(u32),
}

/// Read and parse a PID file.
pub fn read_pid_file(path: &Path) -> io::Result<PidFileState> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map_or(PidFileState::Incomplete, PidFileState::Pid)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PidFileState::Missing),
        Err(e) => Err(e),
    }
}

/// Check whether the process tracked by `pid_file` is alive.
///
/// The process-table lookup can shell out to `ps`, so it runs on the
/// blocking pool.
pub async fn check_alive(
    pid_file: &Path,
    matcher: &ProcessMatcher,
    policy: RetryPolicy,
) -> io::Result<HealthReport> {
    match find_pid(|| read_pid_file(pid_file), policy).await? {
        PidLookup::Found { pid, attempt } => {
            let matcher = matcher.clone();
            let health = tokio::task::spawn_blocking(move || classify(pid, &SystemProbe, &matcher))
                .await
                .map_err(io::Error::other)?;
            Ok(found(pid, attempt, health))
        }
        PidLookup::Settled(report) => Ok(report),
    }
}

/// [`check_alive`] with the PID source and process table supplied by the
/// caller.
pub async fn check_alive_with<F, P>(
    read_pid: F,
    probe: &P,
    matcher: &ProcessMatcher,
    policy: RetryPolicy,
) -> io::Result<HealthReport>
where
    F: FnMut() -> io::Result<PidFileState>,
    P: ProcessProbe + ?Sized,
{
    match find_pid(read_pid, policy).await? {
        PidLookup::Found { pid, attempt } => Ok(found(pid, attempt, classify(pid, probe, matcher))),
        PidLookup::Settled(report) => Ok(report),
    }
}

enum PidLookup {
    Found { pid: u32, attempt: u32 },
    /// No PID to classify; the verdict is already known.
    Settled(HealthReport),
}

fn found(pid: u32, attempt: u32, health: ProcessHealth) -> HealthReport {
    info!(%pid, %attempt, ?health, "PID file found");
    HealthReport {
        health,
        attempts: attempt,
    }
}

async fn find_pid<F>(mut read_pid: F, policy: RetryPolicy) -> io::Result<PidLookup>
where
    F: FnMut() -> io::Result<PidFileState>,
{
    if policy.max_attempts == 0 {
        warn!("max_attempts is 0, making a single best-effort attempt");
    }
    let attempts = policy.effective_attempts();
    let mut file_seen = false;

    for attempt in 1..=attempts {
        match read_pid()? {
            PidFileState::Pid(pid) => return Ok(PidLookup::Found { pid, attempt }),
            PidFileState::Incomplete => {
                debug!(%attempt, %attempts, "PID file present but incomplete");
                file_seen = true;
            }
            PidFileState::Missing if file_seen => {
                // Appeared, then vanished before holding a PID
                warn!(%attempt, "PID file disappeared");
                return Ok(PidLookup::Settled(HealthReport {
                    health: ProcessHealth::Crashed,
                    attempts: attempt,
                }));
            }
            PidFileState::Missing => {
                debug!(%attempt, %attempts, "PID file not present yet");
            }
        }

        if attempt < attempts && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }

    warn!(%attempts, "No PID after all attempts");
    Ok(PidLookup::Settled(HealthReport {
        health: ProcessHealth::Unknown,
        attempts,
    }))
}

fn classify<P>(pid: u32, probe: &P, matcher: &ProcessMatcher) -> ProcessHealth
where
    P: ProcessProbe + ?Sized,
{
    if !probe.exists(pid) {
        return ProcessHealth::Crashed;
    }
    match probe.command_line(pid) {
        Some(cmdline) if matcher.matches(&cmdline) => ProcessHealth::Alive { pid },
        Some(cmdline) => {
            // PID was recycled by an unrelated process
            warn!(%pid, %cmdline, "PID file points at a foreign process");
            ProcessHealth::Crashed
        }
        None => {
            // Exists but unreadable (other user); trust the PID file
            debug!(%pid, "Could not read command line");
            ProcessHealth::Alive { pid }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::time::Instant;

    /// In-memory process table.
    #[derive(Default)]
    struct FakeProbe {
        processes: HashMap<u32, Option<String>>,
    }

    impl FakeProbe {
        fn with(pid: u32, cmdline: Option<&str>) -> Self {
            let mut probe = Self::default();
            probe.processes.insert(pid, cmdline.map(str::to_string));
            probe
        }
    }

    impl ProcessProbe for FakeProbe {
        fn exists(&self, pid: u32) -> bool {
            self.processes.contains_key(&pid)
        }

        fn command_line(&self, pid: u32) -> Option<String> {
            self.processes.get(&pid).cloned().flatten()
        }
    }

    fn claude() -> ProcessMatcher {
        ProcessMatcher::new(crate::agents::AgentId::Claude.backend().process_patterns).unwrap()
    }

    const fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(1),
        }
    }

    /// PID source that appears on the `k`th read.
    fn appears_on(k: u32, pid: u32, reads: &Cell<u32>) -> impl FnMut() -> io::Result<PidFileState> + '_ {
        move || {
            reads.set(reads.get() + 1);
            if reads.get() >= k {
                Ok(PidFileState::Pid(pid))
            } else {
                Ok(PidFileState::Missing)
            }
        }
    }

    #[tokio::test]
    async fn test_alive_after_exactly_k_attempts() {
        let probe = FakeProbe::with(42, Some("claude --resume"));
        for max in 1..=6 {
            for k in 1..=max {
                let reads = Cell::new(0);
                let report = check_alive_with(appears_on(k, 42, &reads), &probe, &claude(), policy(max))
                    .await
                    .unwrap();
                assert_eq!(report.health, ProcessHealth::Alive { pid: 42 });
                assert_eq!(report.attempts, k);
                assert_eq!(reads.get(), k);
            }
        }
    }

    #[tokio::test]
    async fn test_exhausted_attempts_is_unknown_not_crashed() {
        let reads = Cell::new(0);
        let report = check_alive_with(appears_on(100, 42, &reads), &FakeProbe::default(), &claude(), policy(5))
            .await
            .unwrap();
        assert_eq!(report.health, ProcessHealth::Unknown);
        assert_eq!(report.attempts, 5);
        assert_eq!(reads.get(), 5);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_reads_once() {
        let probe = FakeProbe::with(7, Some("/usr/bin/claude"));
        let reads = Cell::new(0);
        let report = check_alive_with(appears_on(1, 7, &reads), &probe, &claude(), policy(0))
            .await
            .unwrap();
        assert_eq!(report.health, ProcessHealth::Alive { pid: 7 });
        assert_eq!(reads.get(), 1);
    }

    #[tokio::test]
    async fn test_dead_pid_is_crashed() {
        let reads = Cell::new(0);
        let report = check_alive_with(appears_on(1, 42, &reads), &FakeProbe::default(), &claude(), policy(3))
            .await
            .unwrap();
        assert_eq!(report.health, ProcessHealth::Crashed);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_foreign_process_is_crashed() {
        let probe = FakeProbe::with(42, Some("postgres: writer"));
        let reads = Cell::new(0);
        let report = check_alive_with(appears_on(1, 42, &reads), &probe, &claude(), policy(3))
            .await
            .unwrap();
        assert_eq!(report.health, ProcessHealth::Crashed);
    }

    #[tokio::test]
    async fn test_unreadable_command_line_trusts_pid_file() {
        let probe = FakeProbe::with(42, None);
        let reads = Cell::new(0);
        let report = check_alive_with(appears_on(1, 42, &reads), &probe, &claude(), policy(1))
            .await
            .unwrap();
        assert_eq!(report.health, ProcessHealth::Alive { pid: 42 });
    }

    #[tokio::test]
    async fn test_vanished_pid_file_is_crashed() {
        let states = [PidFileState::Missing, PidFileState::Incomplete, PidFileState::Missing];
        let mut iter = states.into_iter();
        let report = check_alive_with(
            || Ok(iter.next().unwrap_or(PidFileState::Missing)),
            &FakeProbe::default(),
            &claude(),
            policy(5),
        )
        .await
        .unwrap();
        assert_eq!(report.health, ProcessHealth::Crashed);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_read_error_propagates() {
        let result = check_alive_with(
            || Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            &FakeProbe::default(),
            &claude(),
            policy(3),
        )
        .await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_read_pid_file_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        assert_eq!(read_pid_file(&path).unwrap(), PidFileState::Missing);

        std::fs::write(&path, "").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), PidFileState::Incomplete);

        std::fs::write(&path, "12345\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), PidFileState::Pid(12345));

        std::fs::write(&path, "0").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), PidFileState::Incomplete);
    }

    #[tokio::test]
    async fn test_pid_file_written_during_retry_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            std::fs::write(&writer_path, pid.to_string()).unwrap();
        });

        let matcher = ProcessMatcher::new([r"(^|/)sleep(\s|$)"]).unwrap();
        let policy = RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(100),
        };
        let start = Instant::now();
        let report = check_alive(&path, &matcher, policy).await.unwrap();
        let elapsed = start.elapsed();

        writer.await.unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(report.health, ProcessHealth::Alive { pid });
        assert!((3..=5).contains(&report.attempts), "attempts: {}", report.attempts);
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_system_probe_detects_exit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&path, child.id().to_string()).unwrap();
        let matcher = ProcessMatcher::new([r"sleep"]).unwrap();

        let report = check_alive(&path, &matcher, RetryPolicy::SINGLE).await.unwrap();
        assert!(matches!(report.health, ProcessHealth::Alive { .. }));

        child.kill().unwrap();
        child.wait().unwrap();

        let report = check_alive(&path, &matcher, RetryPolicy::SINGLE).await.unwrap();
        assert_eq!(report.health, ProcessHealth::Crashed);
    }

    #[tokio::test]
    async fn test_system_checks_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&path, child.id().to_string()).unwrap();
        let matcher = ProcessMatcher::new([r"sleep"]).unwrap();

        let checks = (0..5).map(|_| check_alive(&path, &matcher, RetryPolicy::SINGLE));
        let reports = futures::future::join_all(checks).await;
        child.kill().unwrap();
        child.wait().unwrap();

        for report in reports {
            assert!(matches!(report.unwrap().health, ProcessHealth::Alive { .. }));
        }
    }

    #[test]
    fn test_health_serialization() {
        let json = serde_json::to_string(&ProcessHealth::Alive { pid: 9 }).unwrap();
        assert_eq!(json, r#"{"status":"alive","pid":9}"#);
        let json = serde_json::to_string(&ProcessHealth::Unknown).unwrap();
        assert_eq!(json, r#"{"status":"unknown"}"#);
    }
}
