//! corral: supervisor for interactive AI coding agents
//!
//! Runs agent CLIs in pseudo-terminals, tracks whether their processes are
//! alive through a PID-file protocol, and delivers messages to them either
//! through a durable inbox or by typing into the terminal.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod agents;
pub mod cli;
pub mod client;
pub mod config;
pub mod health;
pub mod inbox;
pub mod inject;
pub mod protocol;
pub mod pty;
pub mod router;
pub mod server;
pub mod session;

pub use agents::{AgentBackend, AgentId, UnknownAgent};
pub use cli::{Cli, Command};
pub use client::{default_socket_path, Client, ClientError};
pub use config::{Config, ConfigError};
pub use health::{check_alive, HealthReport, ProcessHealth, RetryPolicy};
pub use inbox::{InboxError, InboxId, InboxMessage, InboxQueue, MessageId};
pub use inject::{InjectError, PtyInjector};
pub use protocol::{Request, Response, SessionInfo};
pub use router::{DeliveryOutcome, DeliveryReceipt, InjectionRouter};
pub use server::{Server, ServerError};
pub use session::{DeliveryMode, LaunchPlan, Session, SessionPaths};
