//! The corral server.
//!
//! Owns the PTYs of every session, drains their output, and answers client
//! requests on a Unix socket.

// Timestamps won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]
// This module has control flow that does not benefit from map_or_else
#![allow(clippy::option_if_let_else)]
// The handle_request function is large but logically coherent
#![allow(clippy::too_many_lines)]
// Dropping mutex guards explicitly adds noise without benefit
#![allow(clippy::significant_drop_tightening)]

mod managed;
mod manager;
mod transcript;

pub use managed::{ManagedSession, ProcessState};
pub use manager::SessionManager;
pub use transcript::Transcript;

use crate::agents::AgentId;
use crate::config::Config;
use crate::health::{ProcessHealth, RetryPolicy};
use crate::inbox::{InboxError, InboxQueue};
use crate::inject::PtyInjector;
use crate::protocol::{Request, Response, SessionInfo, SessionState};
use crate::pty::{self, PtySize};
use crate::router::InjectionRouter;
use crate::session::{DeliveryMode, LaunchPlan, Session, SessionPaths};
use nix::sys::signal::Signal;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// How often session output is drained.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to open inbox directory: {0}")]
    Inbox(#[source] InboxError),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// State shared by every connection.
struct Shared {
    manager: Mutex<SessionManager>,
    config: Config,
    paths: SessionPaths,
    router: InjectionRouter,
}

/// The corral server.
pub struct Server {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server that will listen on `socket_path` and keep its state
    /// under `paths`.
    pub fn new(socket_path: PathBuf, config: Config, paths: SessionPaths) -> Result<Self, ServerError> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let inbox = InboxQueue::open(paths.inbox_dir()).map_err(ServerError::Inbox)?;
        let router = InjectionRouter::new(inbox).with_health_gate(config.terminal.retry_policy());
        Ok(Self {
            socket_path,
            shared: Arc::new(Shared {
                manager: Mutex::new(SessionManager::new()),
                config,
                paths,
                router,
            }),
            shutdown_tx,
        })
    }

    /// Run the server event loop.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Never follow a symlink planted at the socket path
        if let Ok(metadata) = std::fs::symlink_metadata(&self.socket_path) {
            if metadata.file_type().is_symlink() {
                return Err(ServerError::Bind(std::io::Error::other(
                    "socket path is a symlink - possible security attack",
                )));
            }
            if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                std::fs::remove_file(&self.socket_path).ok();
            }
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
        }
        std::fs::create_dir_all(self.shared.paths.pid_dir()).map_err(ServerError::Io)?;

        let listener = UnixListener::bind(&self.socket_path).map_err(ServerError::Bind)?;

        // Owner-only socket
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms).map_err(ServerError::Io)?;
        }

        info!(
            socket = %self.socket_path.display(),
            state = %self.shared.paths.root().display(),
            "Server listening"
        );

        let shared = Arc::clone(&self.shared);
        let mut drain_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = output_drain_task(shared) => {}
                _ = drain_shutdown.recv() => {}
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("Accepted connection");
                            let shared = Arc::clone(&self.shared);
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, shared, shutdown_tx).await {
                                    error!(%e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(%e, "Accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        std::fs::remove_file(&self.socket_path).ok();
        info!("Server shut down");
        Ok(())
    }

    /// Request server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), ServerError> {
    let mut json = serde_json::to_string(response).map_err(ServerError::Encode)?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(ServerError::Io)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: UnixStream,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(ServerError::Io)?;
        if n == 0 {
            debug!("Client disconnected");
            break;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                write_response(&mut writer, &Response::error(format!("invalid request: {e}"))).await?;
                continue;
            }
        };

        debug!(?request, "Received request");

        let is_shutdown = matches!(request, Request::Shutdown);
        let response = handle_request(request, &shared).await;
        write_response(&mut writer, &response).await?;

        // Trigger shutdown after sending response
        if is_shutdown {
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

/// Handle a single request.
async fn handle_request(request: Request, shared: &Shared) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Spawn {
            name,
            agent,
            mode,
            args,
            command,
            rows,
            cols,
        } => {
            let Some(agent_name) = agent.or_else(|| shared.config.agent.default.clone()) else {
                return Response::error("no agent given and no [agent] default configured");
            };
            let agent: AgentId = match agent_name.parse() {
                Ok(agent) => agent,
                Err(e) => return Response::error(format!("{e}")),
            };

            // Spawning is a quick fork, so the lock is held throughout to
            // keep the name checks and the insert atomic
            let mut mgr = shared.manager.lock().await;
            let name = if let Some(custom_name) = name {
                let custom_name = custom_name.trim().to_string();
                if custom_name.is_empty() {
                    return Response::error("session name cannot be empty");
                }
                // Names of exited sessions may be reused
                if mgr.get(&custom_name).is_some_and(ManagedSession::is_running) {
                    return Response::error(format!("session name already in use: {custom_name}"));
                }
                custom_name
            } else {
                mgr.generate_name()
            };

            let plan = LaunchPlan::new(agent, command.as_deref(), &shared.config.agent, args.as_deref());
            let session = match Session::new(name.clone(), agent, mode, &plan, &shared.paths) {
                Ok(session) => session,
                Err(e) => return Response::error(format!("spawn failed: {e}")),
            };

            // Two names can sanitise to the same inbox, and so the same PID file
            if let Some(clash) = mgr
                .list()
                .into_iter()
                .find(|m| m.is_running() && m.session.inbox == session.inbox)
            {
                return Response::error(format!(
                    "session name {name} maps to the same inbox as {}",
                    clash.name()
                ));
            }

            // Exited records this session replaces, dropped once it is running
            let replaced: Vec<String> = mgr
                .list()
                .into_iter()
                .filter(|m| m.name() == name || m.session.inbox == session.inbox)
                .map(|m| m.name().to_string())
                .collect();

            // A stale PID file from an earlier session would look like a crash
            if let Err(e) = std::fs::remove_file(&session.pid_file)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Response::error(format!("failed to clear stale PID file: {e}"));
            }

            let env = session.spawn_env(&shared.paths);
            let process = match pty::spawn(&plan.argv(), PtySize { rows, cols }, &env) {
                Ok(process) => process,
                Err(e) => return Response::error(format!("spawn failed: {e}")),
            };

            let session = if mode == DeliveryMode::Pty {
                match process.master_writer() {
                    Ok(writer) => session.with_injector(PtyInjector::new(writer)),
                    Err(e) => {
                        warn!(%name, %e, "No terminal writer, injection will fail");
                        session
                    }
                }
            } else {
                session
            };

            for old in &replaced {
                mgr.remove(old);
                debug!(%name, replaced = %old, "Dropped exited session record");
            }

            let pid = process.pid();
            info!(%name, %pid, agent = agent.as_str(), %mode, command = %plan.command, "Spawned session");
            mgr.add(ManagedSession::new(session, process));

            Response::Spawned {
                name,
                pid,
                agent: agent.as_str().to_string(),
                mode,
            }
        }

        Request::List => {
            let snapshot: Vec<(Session, u32, Option<i32>)> = {
                let mgr = shared.manager.lock().await;
                mgr.list()
                    .into_iter()
                    .map(|m| (m.session.clone(), m.pid(), m.exit_code()))
                    .collect()
            };

            let mut sessions = Vec::with_capacity(snapshot.len());
            for (session, pid, exit_code) in snapshot {
                let health = match session.check_health(RetryPolicy::SINGLE).await {
                    Ok(report) => settle_health(report.health, exit_code),
                    Err(e) => {
                        warn!(name = %session.name, %e, "Health check failed");
                        ProcessHealth::Unknown
                    }
                };
                sessions.push(SessionInfo {
                    agent: session.agent.as_str().to_string(),
                    mode: session.mode,
                    pid,
                    state: if exit_code.is_some() {
                        SessionState::Exited
                    } else {
                        SessionState::Running
                    },
                    health,
                    command: session.command,
                    inbox: session.inbox,
                    started_at: session.started_at,
                    exit_code,
                    name: session.name,
                });
            }
            Response::Sessions { sessions }
        }

        Request::Status { name } => {
            let Some(session) = clone_session(shared, &name).await else {
                return Response::error(format!("session not found: {name}"));
            };

            // Lock is not held while the check sleeps between attempts
            let report = match session.check_health(shared.config.terminal.retry_policy()).await {
                Ok(report) => report,
                Err(e) => return Response::error(format!("health check failed: {e}")),
            };

            let exit_code = {
                let mgr = shared.manager.lock().await;
                mgr.get(&name).and_then(ManagedSession::exit_code)
            };
            let health = settle_health(report.health, exit_code);
            debug!(%name, ?health, attempts = report.attempts, "Health checked");

            Response::Status {
                name,
                health,
                attempts: report.attempts,
                exit_code,
            }
        }

        Request::Inject { name, message, id } => {
            let Some(session) = clone_session(shared, &name).await else {
                return Response::error(format!("session not found: {name}"));
            };
            let receipt = shared.router.inject_with_id(&session, &message, id).await;
            Response::Receipt { receipt }
        }

        Request::Kill { name, signal } => {
            // Only standard signals (1-31)
            if !(1..=31).contains(&signal) {
                return Response::error(format!("invalid signal number: {signal} (must be 1-31)"));
            }
            let Ok(sig) = Signal::try_from(signal) else {
                return Response::error(format!("invalid signal number: {signal}"));
            };

            let mgr = shared.manager.lock().await;
            let Some(managed) = mgr.get(&name) else {
                return Response::error(format!("session not found: {name}"));
            };
            if !managed.is_running() {
                info!(%name, "Session already exited, nothing to kill");
                return Response::Ok;
            }
            match managed.process.signal(sig) {
                Ok(()) => {
                    info!(%name, ?sig, "Sent signal to session");
                    Response::Ok
                }
                Err(e) => Response::error(format!("failed to signal {name}: {e}")),
            }
        }

        Request::Tail { name, lines } => {
            let mgr = shared.manager.lock().await;
            mgr.get(&name).map_or_else(
                || Response::error(format!("session not found: {name}")),
                |managed| Response::Output {
                    data: managed.transcript.tail_lines(lines),
                },
            )
        }

        Request::Remove { name } => {
            let mut mgr = shared.manager.lock().await;
            match mgr.get(&name) {
                None => return Response::error(format!("session not found: {name}")),
                Some(managed) if managed.is_running() => {
                    return Response::error(format!("session is still running: {name} (kill it first)"));
                }
                Some(_) => {}
            }
            if let Some(managed) = mgr.remove(&name) {
                let shared_file = mgr
                    .list()
                    .into_iter()
                    .any(|m| m.session.pid_file == managed.session.pid_file);
                if shared_file {
                    debug!(%name, "PID file belongs to another session, keeping it");
                } else {
                    match std::fs::remove_file(&managed.session.pid_file) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(%name, %e, "Failed to remove PID file"),
                    }
                }
                info!(%name, "Removed session");
            }
            Response::Ok
        }

        Request::Shutdown => {
            info!("Shutdown requested");
            Response::Ok
        }
    }
}

async fn clone_session(shared: &Shared, name: &str) -> Option<Session> {
    let mgr = shared.manager.lock().await;
    mgr.get(name).map(|m| m.session.clone())
}

/// A child the server has reaped is dead whatever the PID file says.
const fn settle_health(health: ProcessHealth, exit_code: Option<i32>) -> ProcessHealth {
    match (health, exit_code) {
        (_, Some(_)) => ProcessHealth::Crashed,
        (health, None) => health,
    }
}

/// Background task that drains PTY output into transcripts and records exits.
async fn output_drain_task(shared: Arc<Shared>) {
    let mut poll_interval = tokio::time::interval(DRAIN_INTERVAL);

    loop {
        poll_interval.tick().await;

        let mut mgr = shared.manager.lock().await;
        for managed in mgr.iter_mut() {
            if let Some(code) = managed.drain() {
                info!(name = %managed.name(), %code, "Session exited");
            }
        }
    }
}

/// Check if a server is running by trying to connect.
pub async fn is_server_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}
