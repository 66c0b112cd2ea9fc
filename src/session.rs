//! Sessions: one agent process, its PID file and its inbox.

// Timestamps won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use crate::agents::{AgentBackend, AgentId};
use crate::config::AgentConfig;
use crate::health::{self, HealthReport, ProcessMatcher, RetryPolicy};
use crate::inbox::InboxId;
use crate::inject::PtyInjector;
use crate::pty::SpawnEnv;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Env var holding the session name.
pub const ENV_SESSION: &str = "CORRAL_SESSION";
/// Env var holding the path the agent must write its PID to.
pub const ENV_PID_FILE: &str = "CORRAL_PID_FILE";
/// Env var holding the session's inbox ID.
pub const ENV_INBOX: &str = "CORRAL_INBOX";
/// Env var holding the inbox directory.
pub const ENV_INBOX_DIR: &str = "CORRAL_INBOX_DIR";

/// Errors that can occur while building a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid process pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("launch command is empty")]
    EmptyCommand,
}

/// How messages reach a session.
///
/// Fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Durable inbox polled by the agent (fleet/team sessions).
    Inbox,
    /// Keystrokes typed into the PTY (interactive sessions).
    #[default]
    Pty,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox => f.write_str("inbox"),
            Self::Pty => f.write_str("pty"),
        }
    }
}

/// On-disk layout under the state directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    root: PathBuf,
}

impl SessionPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn pid_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    #[must_use]
    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }

    #[must_use]
    pub fn pid_file(&self, inbox: &InboxId) -> PathBuf {
        self.pid_dir().join(format!("{inbox}.pid"))
    }
}

/// Default state directory: `$XDG_STATE_HOME/corral`, falling back to
/// `/tmp/corral-$UID`.
#[must_use]
#[allow(unsafe_code)] // getuid() call
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = dirs::state_dir().or_else(dirs::data_local_dir) {
        dir.join("corral")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/corral-{uid}"))
    }
}

/// What to run for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// The agent command line, including operator arguments.
    pub command: String,
    /// Extra process patterns for a non-default program.
    pub extra_patterns: Vec<String>,
}

impl LaunchPlan {
    /// Pick the command for `agent`.
    ///
    /// Precedence: explicit override, then `[agent.commands]`, then the
    /// backend default. `args` is appended verbatim as one opaque string.
    #[must_use]
    pub fn new(
        agent: AgentId,
        command_override: Option<&str>,
        config: &AgentConfig,
        args: Option<&str>,
    ) -> Self {
        let backend = agent.backend();
        let custom = command_override
            .or_else(|| config.commands.get(backend.name).map(String::as_str))
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let base = custom.unwrap_or(backend.default_command);

        let command = match args.map(str::trim) {
            Some(args) if !args.is_empty() => format!("{base} {args}"),
            _ => base.to_string(),
        };

        let extra_patterns = custom
            .and_then(program_pattern)
            .into_iter()
            .collect();

        Self {
            command,
            extra_patterns,
        }
    }

    /// The argv that runs the command in a PTY.
    ///
    /// The shell records its own PID and then `exec`s the agent, so the PID
    /// file names the agent process itself.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > \"${ENV_PID_FILE}\" && exec {}", self.command),
        ]
    }
}

/// Pattern matching the basename of a command's program.
fn program_pattern(command: &str) -> Option<String> {
    let program = command.split_whitespace().next()?;
    let name = Path::new(program).file_name()?.to_str()?;
    Some(format!(r"(^|[/\s]){}(\s|$)", regex::escape(name)))
}

/// A supervised agent session.
///
/// Cheap to clone; clones share the PTY injector.
#[derive(Clone)]
pub struct Session {
    pub name: String,
    pub agent: AgentId,
    pub mode: DeliveryMode,
    pub command: String,
    pub pid_file: PathBuf,
    pub inbox: InboxId,
    /// Unix timestamp when the session was created (millis).
    pub started_at: u64,
    matcher: ProcessMatcher,
    injector: Option<Arc<PtyInjector>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("agent", &self.agent)
            .field("mode", &self.mode)
            .field("pid_file", &self.pid_file)
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session record. The PID-file path and inbox are fixed here.
    pub fn new(
        name: impl Into<String>,
        agent: AgentId,
        mode: DeliveryMode,
        plan: &LaunchPlan,
        paths: &SessionPaths,
    ) -> Result<Self, SessionError> {
        if plan.command.trim().is_empty() {
            return Err(SessionError::EmptyCommand);
        }
        let name = name.into();
        let inbox = InboxId::for_name(&name);
        let patterns = agent
            .backend()
            .process_patterns
            .iter()
            .map(|p| (*p).to_string())
            .chain(plan.extra_patterns.iter().cloned());

        Ok(Self {
            pid_file: paths.pid_file(&inbox),
            matcher: ProcessMatcher::new(patterns)?,
            command: plan.command.clone(),
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            name,
            agent,
            mode,
            inbox,
            injector: None,
        })
    }

    /// Attach the injector for this session's PTY.
    #[must_use]
    pub fn with_injector(mut self, injector: PtyInjector) -> Self {
        self.injector = Some(Arc::new(injector));
        self
    }

    #[must_use]
    pub fn backend(&self) -> &'static AgentBackend {
        self.agent.backend()
    }

    #[must_use]
    pub fn injector(&self) -> Option<&PtyInjector> {
        self.injector.as_deref()
    }

    #[cfg(test)]
    const fn matcher(&self) -> &ProcessMatcher {
        &self.matcher
    }

    /// Environment the agent is spawned with.
    #[must_use]
    pub fn spawn_env(&self, paths: &SessionPaths) -> SpawnEnv {
        SpawnEnv::default()
            .var(ENV_SESSION, &self.name)
            .var(ENV_PID_FILE, self.pid_file.display().to_string())
            .var(ENV_INBOX, self.inbox.as_str())
            .var(ENV_INBOX_DIR, paths.inbox_dir().display().to_string())
    }

    /// Fresh health check; nothing is cached between calls.
    pub async fn check_health(&self, policy: RetryPolicy) -> std::io::Result<HealthReport> {
        health::check_alive(&self.pid_file, &self.matcher, policy).await
    }
}
