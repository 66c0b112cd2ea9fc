//! Agent backends.
//!
//! Every supported CLI agent is described by a constant [`AgentBackend`]
//! record: how to launch it and how to recognise it in the process table.
//! Callers never branch on the agent type; they look up the backend and use
//! its command and patterns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The identifier was not one of the known agents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown agent: {name} (known agents: {known})")]
pub struct UnknownAgent {
    /// The name that failed to resolve.
    pub name: String,
    /// Comma-separated list of valid names.
    pub known: String,
}

impl UnknownAgent {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            known: names().collect::<Vec<_>>().join(", "),
        }
    }
}

/// Supported agent types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentId {
    Claude,
    Codex,
    Gemini,
    Amp,
    Opencode,
    Kiro,
}

impl AgentId {
    /// All agents, in display order.
    pub const ALL: [Self; 6] = [
        Self::Claude,
        Self::Codex,
        Self::Gemini,
        Self::Amp,
        Self::Opencode,
        Self::Kiro,
    ];

    /// The backend record for this agent.
    #[must_use]
    pub fn backend(self) -> &'static AgentBackend {
        match self {
            Self::Claude => &CLAUDE,
            Self::Codex => &CODEX,
            Self::Gemini => &GEMINI,
            Self::Amp => &AMP,
            Self::Opencode => &OPENCODE,
            Self::Kiro => &KIRO,
        }
    }

    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.backend().name
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| UnknownAgent::new(s))
    }
}

/// Launch and detection knowledge for one agent CLI.
#[derive(Debug, PartialEq, Eq)]
pub struct AgentBackend {
    /// Which agent this describes.
    pub id: AgentId,
    /// Canonical name (unique, lowercase).
    pub name: &'static str,
    /// Human-readable name.
    pub display_name: &'static str,
    /// Command used when neither config nor operator overrides it.
    pub default_command: &'static str,
    /// Regexes matched against a process's full command line.
    pub process_patterns: &'static [&'static str],
}

static CLAUDE: AgentBackend = AgentBackend {
    id: AgentId::Claude,
    name: "claude",
    display_name: "Claude Code",
    default_command: "claude",
    // The npm install runs as `node .../claude-code/cli.js`
    process_patterns: &[r"(^|[/\s])claude(\s|$)", r"claude-code"],
};

static CODEX: AgentBackend = AgentBackend {
    id: AgentId::Codex,
    name: "codex",
    display_name: "Codex CLI",
    default_command: "codex",
    process_patterns: &[r"(^|[/\s])codex(\s|$)", r"@openai/codex"],
};

static GEMINI: AgentBackend = AgentBackend {
    id: AgentId::Gemini,
    name: "gemini",
    display_name: "Gemini CLI",
    default_command: "gemini",
    process_patterns: &[r"(^|[/\s])gemini(\s|$)", r"@google/gemini-cli"],
};

static AMP: AgentBackend = AgentBackend {
    id: AgentId::Amp,
    name: "amp",
    display_name: "Amp",
    default_command: "amp",
    process_patterns: &[r"(^|[/\s])amp(\s|$)", r"@sourcegraph/amp"],
};

static OPENCODE: AgentBackend = AgentBackend {
    id: AgentId::Opencode,
    name: "opencode",
    display_name: "OpenCode",
    default_command: "opencode",
    process_patterns: &[r"(^|[/\s])opencode(\s|$)"],
};

static KIRO: AgentBackend = AgentBackend {
    id: AgentId::Kiro,
    name: "kiro",
    display_name: "Kiro CLI",
    default_command: "kiro-cli chat",
    process_patterns: &[r"(^|[/\s])kiro-cli(\s|$)", r"(^|[/\s])kiro(\s|$)"],
};

/// Resolve an agent name to its backend.
pub fn resolve(name: &str) -> Result<&'static AgentBackend, UnknownAgent> {
    name.parse::<AgentId>().map(AgentId::backend)
}

/// Whether `name` is a known agent.
#[must_use]
pub fn is_valid(name: &str) -> bool {
    name.parse::<AgentId>().is_ok()
}

/// Names of all known agents, in display order.
pub fn names() -> impl Iterator<Item = &'static str> {
    AgentId::ALL.into_iter().map(AgentId::as_str)
}

/// Default launch command for an agent.
pub fn default_command(name: &str) -> Result<&'static str, UnknownAgent> {
    resolve(name).map(|b| b.default_command)
}

/// Process patterns for an agent.
pub fn process_patterns(name: &str) -> Result<&'static [&'static str], UnknownAgent> {
    resolve(name).map(|b| b.process_patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_resolve_known_agent() {
        let backend = resolve("claude").unwrap();
        assert_eq!(backend.id, AgentId::Claude);
        assert_eq!(backend.default_command, "claude");
        assert!(!backend.process_patterns.is_empty());
    }

    #[test]
    fn test_resolve_unknown_agent() {
        let err = resolve("unknown-agent").unwrap_err();
        assert_eq!(err.name, "unknown-agent");
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        assert_eq!(resolve(" Codex ").unwrap().id, AgentId::Codex);
        assert!(is_valid("GEMINI"));
        assert!(!is_valid(""));
    }

    #[test]
    fn test_every_agent_has_one_backend() {
        for id in AgentId::ALL {
            let backend = id.backend();
            assert_eq!(backend.id, id);
            assert!(!backend.process_patterns.is_empty(), "{id} has no patterns");
            assert!(!backend.default_command.is_empty());
            assert_eq!(resolve(backend.name).unwrap().id, id);
        }
    }

    #[test]
    fn test_names_are_unique_and_ordered() {
        let listed: Vec<_> = names().collect();
        assert_eq!(listed, ["claude", "codex", "gemini", "amp", "opencode", "kiro"]);
        let mut deduped = listed.clone();
        deduped.dedup();
        assert_eq!(listed.len(), deduped.len());
    }

    #[test]
    fn test_patterns_compile() {
        for id in AgentId::ALL {
            for pattern in id.backend().process_patterns {
                assert!(Regex::new(pattern).is_ok(), "{id}: bad pattern {pattern}");
            }
        }
    }

    #[test]
    fn test_claude_patterns_match_installs() {
        let patterns: Vec<Regex> = process_patterns("claude")
            .unwrap()
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect();
        let matches = |cmdline: &str| patterns.iter().any(|re| re.is_match(cmdline));

        assert!(matches("claude"));
        assert!(matches("/usr/local/bin/claude --resume"));
        assert!(matches("node /usr/lib/node_modules/@anthropic-ai/claude-code/cli.js"));
        assert!(!matches("vim claude.md"));
        assert!(!matches("sleep 30"));
    }

    #[test]
    fn test_default_command_lookup() {
        assert_eq!(default_command("kiro").unwrap(), "kiro-cli chat");
        assert!(default_command("nope").is_err());
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let json = serde_json::to_string(&AgentId::Opencode).unwrap();
        assert_eq!(json, "\"opencode\"");
        let parsed: AgentId = serde_json::from_str("\"amp\"").unwrap();
        assert_eq!(parsed, AgentId::Amp);
    }
}
