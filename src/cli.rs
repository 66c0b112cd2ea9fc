//! Command-line interface for corral.

use crate::session::DeliveryMode;
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::str::FromStr;

/// Parse a signal given as a number or a name.
///
/// Accepts `9`, `KILL`, `sigkill` and `SIGKILL`.
pub fn parse_signal(s: &str) -> Result<i32, String> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i32>() {
        return Ok(n);
    }
    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name)
        .map(|sig| sig as i32)
        .map_err(|_| format!("unknown signal: {s}"))
}

/// Supervisor for interactive AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct Cli {
    /// Path to the Unix socket.
    #[arg(long, global = true, env = "CORRAL_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Extra config file, applied over the user and project files.
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for PID files and inboxes.
    #[arg(long, global = true, env = "CORRAL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server in the foreground.
    Server,

    /// Start an agent session.
    Spawn {
        /// Agent backend (claude, codex, gemini, amp, opencode, kiro).
        /// Defaults to `[agent] default` from config.
        agent: Option<String>,

        /// Session name (must be unique, defaults to a generated name).
        #[arg(long, short)]
        name: Option<String>,

        /// How messages reach the session.
        #[arg(long, short, value_enum, default_value = "pty")]
        mode: ModeArg,

        /// Arguments appended verbatim to the agent command.
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,

        /// Run this command instead of the agent's configured one.
        #[arg(long)]
        command: Option<String>,

        /// Terminal rows.
        #[arg(long, default_value = "24")]
        rows: u16,

        /// Terminal columns.
        #[arg(long, default_value = "80")]
        cols: u16,
    },

    /// List sessions.
    List {
        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,
    },

    /// Check whether a session's agent is alive.
    Status {
        name: String,

        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Deliver a message to a session.
    Inject {
        name: String,

        message: String,

        /// Message ID, so that retries are not delivered twice.
        #[arg(long)]
        id: Option<String>,
    },

    /// Send a signal to a session's agent.
    Kill {
        name: String,

        /// Signal number or name.
        #[arg(long, short, default_value = "TERM", value_parser = parse_signal)]
        signal: i32,
    },

    /// Show recent terminal output of a session.
    Tail {
        name: String,

        /// Number of lines.
        #[arg(short = 'n', default_value = "20")]
        lines: usize,
    },

    /// Forget an exited session.
    Remove { name: String },

    /// Stop the server.
    Shutdown,

    /// List the known agent backends.
    Agents {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved configuration.
    Config,

    /// Work with inboxes directly (no server needed).
    Inbox {
        #[command(subcommand)]
        command: InboxCommand,
    },

    /// Check the environment.
    Doctor,
}

#[derive(Debug, Subcommand)]
pub enum InboxCommand {
    /// Enqueue a message.
    Send {
        /// Session name or inbox ID.
        inbox: String,

        message: String,

        #[arg(long)]
        id: Option<String>,

        /// Sender recorded on the message.
        #[arg(long)]
        from: Option<String>,
    },

    /// Print unacknowledged messages, oldest first.
    Poll {
        inbox: String,

        /// One JSON object per line.
        #[arg(long)]
        json: bool,
    },

    /// Acknowledge a message.
    Ack { inbox: String, id: String },

    /// Drop acknowledged and expired messages.
    Prune {
        /// Inbox to prune (default: all).
        inbox: Option<String>,

        /// Age limit in seconds (default: `[inbox] max_age_secs`).
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

/// CLI spelling of [`DeliveryMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    Inbox,
    Pty,
}

impl From<ModeArg> for DeliveryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Inbox => Self::Inbox,
            ModeArg::Pty => Self::Pty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("9"), Ok(9));
        assert_eq!(parse_signal("KILL"), Ok(9));
        assert_eq!(parse_signal("sigterm"), Ok(15));
        assert_eq!(parse_signal(" SIGINT "), Ok(2));
        assert!(parse_signal("nope").is_err());
    }

    #[test]
    fn test_cli_parses_spawn() {
        let cli = Cli::parse_from([
            "corral", "spawn", "codex", "--name", "fleet-1", "--mode", "inbox", "--args", "--full-auto -q",
        ]);
        let Command::Spawn {
            agent,
            name,
            mode,
            args,
            ..
        } = cli.command
        else {
            panic!("expected spawn");
        };
        assert_eq!(agent.as_deref(), Some("codex"));
        assert_eq!(name.as_deref(), Some("fleet-1"));
        assert_eq!(DeliveryMode::from(mode), DeliveryMode::Inbox);
        assert_eq!(args.as_deref(), Some("--full-auto -q"));
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::parse_from(["corral", "list", "--state-dir", "/tmp/x", "-v"]);
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/x")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
