//! corral: supervisor for interactive AI coding agents

use clap::Parser;
use corral::agents::AgentId;
use corral::cli::{Cli, Command, InboxCommand};
use corral::config::Config;
use corral::health::ProcessHealth;
use corral::inbox::{InboxId, InboxMessage, InboxQueue, MessageId};
use corral::protocol::{Request, Response, SessionInfo};
use corral::pty::{self, PtySize, SpawnEnv};
use corral::router::DeliveryOutcome;
use corral::session::{default_state_dir, SessionPaths};
use corral::{default_socket_path, Client, Server};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let default_filter = if cli.verbose { "corral=debug" } else { "corral=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let socket_path = cli.socket.clone().unwrap_or_else(default_socket_path);
    let paths = SessionPaths::new(cli.state_dir.clone().unwrap_or_else(default_state_dir));

    let result = match cli.command {
        Command::Server => run_server(socket_path, cli.config.as_deref(), paths).await,
        Command::Agents { json } => run_agents(json),
        Command::Config => run_config(cli.config.as_deref()),
        Command::Inbox { command } => run_inbox(command, cli.config.as_deref(), &paths),
        Command::Doctor => run_doctor(socket_path, cli.config.as_deref(), &paths).await,
        command => {
            let client = Client::new(socket_path).with_server_args(server_args(cli.config.as_deref(), cli.state_dir.as_deref()));
            run_client(client, command).await
        }
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Global options an auto-started server must inherit.
fn server_args(config: Option<&Path>, state_dir: Option<&Path>) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(config) = config {
        args.push("--config".into());
        args.push(config.into());
    }
    if let Some(state_dir) = state_dir {
        args.push("--state-dir".into());
        args.push(state_dir.into());
    }
    args
}

async fn run_server(socket_path: PathBuf, config: Option<&Path>, paths: SessionPaths) -> CliResult {
    let config = Config::load(config)?;
    let mut server = Server::new(socket_path, config, paths)?;
    server.run().await?;
    Ok(())
}

fn run_agents(json: bool) -> CliResult {
    if json {
        let agents: Vec<_> = AgentId::ALL
            .iter()
            .map(|id| {
                let backend = id.backend();
                serde_json::json!({
                    "name": backend.name,
                    "display_name": backend.display_name,
                    "command": backend.default_command,
                    "patterns": backend.process_patterns,
                })
            })
            .collect();
        println!("{}", serde_json::to_string(&agents)?);
    } else {
        for id in AgentId::ALL {
            let backend = id.backend();
            println!("{:<10} {:<12} {}", backend.name, backend.display_name, backend.default_command);
        }
    }
    Ok(())
}

fn run_config(config: Option<&Path>) -> CliResult {
    let config = Config::load(config)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn run_inbox(command: InboxCommand, config: Option<&Path>, paths: &SessionPaths) -> CliResult {
    let queue = InboxQueue::open(paths.inbox_dir())?;

    match command {
        InboxCommand::Send {
            inbox,
            message,
            id,
            from,
        } => {
            let mut envelope = InboxMessage::new(InboxId::for_name(&inbox), message);
            if let Some(id) = id {
                envelope.id = MessageId::from(id);
            }
            if let Some(from) = from {
                envelope = envelope.with_sender(from);
            }
            println!("{}", queue.enqueue_message(envelope)?);
        }

        InboxCommand::Poll { inbox, json } => {
            for message in queue.poll(&InboxId::for_name(&inbox))? {
                if json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    println!("{}\t{}", message.id, message.payload);
                }
            }
        }

        InboxCommand::Ack { inbox, id } => {
            queue.ack(&InboxId::for_name(&inbox), &MessageId::from(id))?;
        }

        InboxCommand::Prune { inbox, max_age_secs } => {
            let max_age = match max_age_secs {
                Some(secs) => Duration::from_secs(secs),
                None => Config::load(config)?.inbox.max_age(),
            };
            let inboxes = match inbox {
                Some(inbox) => vec![InboxId::for_name(&inbox)],
                None => queue.list()?,
            };
            let mut pruned = 0;
            for inbox in &inboxes {
                pruned += queue.prune(inbox, max_age)?;
            }
            println!("Pruned {pruned} message(s) from {} inbox(es)", inboxes.len());
        }
    }
    Ok(())
}

fn health_label(health: ProcessHealth) -> String {
    match health {
        ProcessHealth::Alive { pid } => format!("alive (pid {pid})"),
        ProcessHealth::Unknown => "unknown".to_string(),
        ProcessHealth::Crashed => "crashed".to_string(),
    }
}

fn print_sessions(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("(no sessions)");
        return;
    }
    println!(
        "{:<24} {:<9} {:<6} {:<8} {:<8} HEALTH",
        "NAME", "AGENT", "MODE", "PID", "STATE"
    );
    for s in sessions {
        let state = match s.exit_code {
            Some(code) => format!("exit {code}"),
            None => "running".to_string(),
        };
        println!(
            "{:<24} {:<9} {:<6} {:<8} {:<8} {}",
            s.name,
            s.agent,
            s.mode.to_string(),
            s.pid,
            state,
            health_label(s.health)
        );
    }
}

fn unexpected(response: &Response) -> Box<dyn std::error::Error> {
    format!("unexpected response: {response:?}").into()
}

#[allow(clippy::too_many_lines)] // Command dispatch function, splitting would reduce clarity
async fn run_client(mut client: Client, command: Command) -> CliResult {
    let request = match command {
        Command::Spawn {
            ref agent,
            ref name,
            mode,
            ref args,
            command: ref command_override,
            rows,
            cols,
        } => Request::Spawn {
            name: name.clone(),
            agent: agent.clone(),
            mode: mode.into(),
            args: args.clone(),
            command: command_override.clone(),
            rows,
            cols,
        },
        Command::List { .. } => Request::List,
        Command::Status { ref name, .. } => Request::Status { name: name.clone() },
        Command::Inject {
            ref name,
            ref message,
            ref id,
        } => Request::Inject {
            name: name.clone(),
            message: message.clone(),
            id: id.clone().map(MessageId::from),
        },
        Command::Kill { ref name, signal } => Request::Kill {
            name: name.clone(),
            signal,
        },
        Command::Tail { ref name, lines } => Request::Tail {
            name: name.clone(),
            lines,
        },
        Command::Remove { ref name } => Request::Remove { name: name.clone() },
        Command::Shutdown => Request::Shutdown,
        Command::Server
        | Command::Agents { .. }
        | Command::Config
        | Command::Inbox { .. }
        | Command::Doctor => return Err("command does not talk to the server".into()),
    };

    let response = client.request(request).await?;
    if let Response::Error { message } = response {
        return Err(message.into());
    }

    match (command, response) {
        (Command::Spawn { .. }, Response::Spawned { name, pid, agent, mode }) => {
            println!("{name}");
            tracing::debug!(%name, %pid, %agent, %mode, "Spawned session");
        }

        (Command::List { json }, Response::Sessions { sessions }) => {
            if json {
                println!("{}", serde_json::to_string(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
        }

        (
            Command::Status { json, .. },
            Response::Status {
                name,
                health,
                attempts,
                exit_code,
            },
        ) => {
            if json {
                let value = serde_json::json!({
                    "name": name,
                    "health": health,
                    "attempts": attempts,
                    "exit_code": exit_code,
                });
                println!("{value}");
            } else {
                match exit_code {
                    Some(code) => println!("{name}: {} (exit {code})", health_label(health)),
                    None => println!("{name}: {}", health_label(health)),
                }
            }
        }

        (Command::Inject { .. }, Response::Receipt { receipt }) => match receipt.outcome {
            DeliveryOutcome::Queued { message_id } => println!("queued {message_id}"),
            DeliveryOutcome::Typed => println!("typed"),
            DeliveryOutcome::Failed { reason } => {
                return Err(format!("delivery to {} failed: {reason}", receipt.session).into());
            }
        },

        (Command::Kill { .. }, Response::Ok) => println!("Signal sent"),

        (Command::Tail { .. }, Response::Output { data }) => print!("{data}"),

        (Command::Remove { .. } | Command::Shutdown, Response::Ok) => {}

        (_, other) => return Err(unexpected(&other)),
    }
    Ok(())
}

/// Whether `program` resolves to an executable on PATH.
fn on_path(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH").is_some_and(|path| {
        std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
    })
}

#[allow(clippy::too_many_lines)]
async fn run_doctor(socket_path: PathBuf, config: Option<&Path>, paths: &SessionPaths) -> CliResult {
    use std::os::unix::fs::FileTypeExt;

    let mut all_ok = true;

    // 1. Config
    print!("Config: ");
    let config = match Config::load(config) {
        Ok(config) => {
            println!("[OK]");
            config
        }
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
            Config::default()
        }
    };

    // 2. State directory
    print!("State directory: {} ", paths.root().display());
    match std::fs::create_dir_all(paths.pid_dir()).and_then(|()| std::fs::create_dir_all(paths.inbox_dir())) {
        Ok(()) => println!("[OK]"),
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
        }
    }

    // 3. Stale socket
    print!("Socket: {} ", socket_path.display());
    match std::fs::symlink_metadata(&socket_path) {
        Err(_) => println!("[OK] no server running"),
        Ok(metadata) if metadata.file_type().is_socket() => {
            if tokio::net::UnixStream::connect(&socket_path).await.is_ok() {
                println!("[OK] server responding");
            } else {
                println!("[WARN] socket exists but server not responding (stale?)");
            }
        }
        Ok(_) => {
            println!("[FAIL] path exists but is not a socket");
            all_ok = false;
        }
    }

    // 4. PTY allocation
    print!("PTY allocation: ");
    match pty::spawn(&["true".to_string()], PtySize::default(), &SpawnEnv::default()) {
        Ok(process) => {
            let _ = process.wait();
            println!("[OK]");
        }
        Err(e) => {
            println!("[FAIL] {e}");
            all_ok = false;
        }
    }

    // 5. Agent programs (informational)
    for id in AgentId::ALL {
        let backend = id.backend();
        let command = config
            .agent
            .commands
            .get(backend.name)
            .map_or(backend.default_command, String::as_str);
        let program = command.split_whitespace().next().unwrap_or_default();
        if on_path(program) {
            println!("Agent {}: [OK] {program}", backend.name);
        } else {
            println!("Agent {}: [--] {program} not on PATH", backend.name);
        }
    }

    // 6. Retry policy
    let policy = config.terminal.retry_policy();
    if policy.max_attempts == 0 {
        println!("Health checks: [WARN] max_retry_attempts is 0, a single read will be made");
    } else {
        println!(
            "Health checks: [OK] {} attempt(s), {}ms apart",
            policy.max_attempts,
            policy.delay.as_millis()
        );
    }

    println!();
    if all_ok {
        println!("All checks passed!");
        Ok(())
    } else {
        Err("Some checks failed".into())
    }
}
