//! Client for communicating with the corral server.
//!
//! Handles Unix socket connection and auto-starting the server.

#![allow(unsafe_code)] // getuid() call

use crate::protocol::{Request, Response};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Connection attempts after auto-starting the server.
const START_ATTEMPTS: u32 = 50;
const START_POLL: Duration = Duration::from_millis(100);

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to send request: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("failed to start server: {0}")]
    ServerStart(#[source] std::io::Error),

    #[error("server did not start in time")]
    ServerTimeout,

    #[error("connection lost")]
    ConnectionLost,
}

/// Get the default socket path for the corral server.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("corral.sock")
    } else {
        // Fallback to /tmp/corral-$UID.sock
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/corral-{uid}.sock"))
    }
}

/// Client for the corral server.
pub struct Client {
    socket_path: PathBuf,
    server_args: Vec<OsString>,
    stream: Option<BufReader<UnixStream>>,
}

impl Client {
    /// Create a new client that will connect to the given socket path.
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            server_args: Vec::new(),
            stream: None,
        }
    }

    /// Create a client with the default socket path.
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(default_socket_path())
    }

    /// Extra global arguments for an auto-started server (e.g. `--config`).
    #[must_use]
    pub fn with_server_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.server_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Connect to the server, starting it if necessary.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }

        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                debug!("Connected to existing server");
                self.stream = Some(BufReader::new(stream));
                return Ok(());
            }
            Err(e) => {
                debug!(%e, "Could not connect to server");
            }
        }

        self.start_server()?;

        for i in 0..START_ATTEMPTS {
            tokio::time::sleep(START_POLL).await;
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    info!(attempts = i + 1, "Connected to server");
                    self.stream = Some(BufReader::new(stream));
                    return Ok(());
                }
                Err(e) => {
                    if i % 10 == 9 {
                        debug!(attempt = i + 1, %e, "Still waiting for server");
                    }
                }
            }
        }

        Err(ClientError::ServerTimeout)
    }

    /// Start the server as a background process.
    fn start_server(&self) -> Result<(), ClientError> {
        info!(socket = %self.socket_path.display(), "Starting server");

        let exe = std::env::current_exe().map_err(ClientError::ServerStart)?;

        Command::new(&exe)
            .arg("--socket")
            .arg(&self.socket_path)
            .args(&self.server_args)
            .arg("server")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(ClientError::ServerStart)?;

        Ok(())
    }

    /// Send a request to the server and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        self.connect().await?;

        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionLost)?;

        let mut json = serde_json::to_string(&request).map_err(ClientError::Serialize)?;
        json.push('\n');

        stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .map_err(ClientError::Send)?;

        let mut line = String::new();
        let n = stream
            .read_line(&mut line)
            .await
            .map_err(ClientError::Receive)?;

        if n == 0 {
            return Err(ClientError::ConnectionLost);
        }

        let response: Response = serde_json::from_str(&line).map_err(ClientError::Deserialize)?;

        if let Response::Error { message } = &response {
            warn!(%message, "Server returned error");
        }

        Ok(response)
    }

    /// Get the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
