/// GDB adapter for remote QNX targets
///
/// This crate drives GDB over its machine interface (GDB/MI): it correlates
/// tokened requests with their replies, keeps one command in flight at a time
/// and exposes a small typed API for the commands a target session needs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod commands;
pub mod communication;
pub mod instructions;
pub mod parser;
pub mod process;
pub mod request;
pub mod session;
pub mod types;

pub use commands::{Breakpoint, Commands, ProcessInfo};
pub use instructions::{Instruction, InstructionTable, Lookup};
pub use parser::{parse_c_string, parse_response, parse_results};
pub use request::{Completion, Outcome, Request, RequestGroup, RequestIds, Submission};
pub use session::{GdbSender, GdbSession, Subscriber, PROMPT};
pub use types::*;

use communication::{spawn_stderr_reader, spawn_stdout_reader, ChannelSender};
use process::GdbProcess;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("Malformed GDB/MI output: {line}")]
    Format { line: String },
    #[error("GDB session is closed")]
    SessionClosed,
    #[error("Unrecognized command: {0}")]
    UnrecognizedCommand(String),
    #[error("Request group has no members")]
    EmptyGroup,
    #[error("Failed to send to GDB: {0}")]
    Send(String),
    #[error("GDB process error: {0}")]
    Process(#[from] std::io::Error),
    #[error("Timed out waiting for GDB")]
    Timeout,
    #[error("Request dropped before GDB answered it")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GdbError>;

/// How to launch the debugger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GdbConfig {
    pub path: String,
    pub args: Vec<String>,
    pub prompt: String,
    pub response_timeout_ms: u64,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            path: "ntoarmv7-gdb".into(),
            args: Vec::new(),
            prompt: PROMPT.into(),
            response_timeout_ms: 10_000,
        }
    }
}

impl GdbConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Owns a GDB process and the session that talks to it
pub struct GdbAdapter {
    config: GdbConfig,
    process: Option<GdbProcess>,
    session: Option<Arc<GdbSession>>,
}

impl GdbAdapter {
    pub fn new(config: GdbConfig) -> Self {
        GdbAdapter {
            config,
            process: None,
            session: None,
        }
    }

    pub fn config(&self) -> &GdbConfig {
        &self.config
    }

    /// Launch GDB and wire its pipes to a fresh session.
    pub async fn start_session(&mut self) -> Result<Arc<GdbSession>> {
        if self.is_running() {
            return Err(GdbError::Send("GDB session already running".into()));
        }

        let mut process = GdbProcess::start(&self.config.path, &self.config.args)?;
        let missing = |what: &str| GdbError::Send(format!("Failed to get {} handle", what));
        let stdin = process.take_stdin().ok_or_else(|| missing("stdin"))?;
        let stdout = process.take_stdout().ok_or_else(|| missing("stdout"))?;
        let stderr = process.take_stderr().ok_or_else(|| missing("stderr"))?;

        let sender = ChannelSender::spawn(stdin, process.id());
        let session = Arc::new(GdbSession::with_prompt(Box::new(sender), self.config.prompt.clone()));

        spawn_stdout_reader(stdout, session.clone());
        spawn_stderr_reader(stderr);

        self.process = Some(process);
        self.session = Some(session.clone());
        Ok(session)
    }

    pub fn session(&self) -> Option<&Arc<GdbSession>> {
        self.session.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().map_or(false, |s| !s.is_closed())
    }

    /// Submit a command and wait for its final response.
    pub async fn send_command(&self, command: &str) -> Result<Response> {
        let session = self.session.as_ref().ok_or(GdbError::SessionClosed)?;
        let request = Request::new(session.ids(), command);
        self.execute(request).await
    }

    /// Submit a request or group and wait up to the configured timeout.
    pub async fn execute(&self, submission: impl Into<Submission>) -> Result<Response> {
        let session = self.session.as_ref().ok_or(GdbError::SessionClosed)?;
        let completion = session.submit(submission)?;
        let timeout = self.config.response_timeout();

        let waiter = completion.clone();
        let response = tokio::task::spawn_blocking(move || waiter.wait(timeout))
            .await
            .map_err(|e| GdbError::Send(e.to_string()))?;

        match response {
            Some(response) => Ok(response),
            None if completion.is_cancelled() => Err(GdbError::Cancelled),
            None => Err(GdbError::Timeout),
        }
    }

    /// Break the running target.
    pub fn interrupt(&self) -> Result<()> {
        self.session
            .as_ref()
            .ok_or(GdbError::SessionClosed)?
            .interrupt()
    }

    /// Ask GDB to exit, then make sure the process is gone.
    pub async fn stop_session(&mut self) -> Result<()> {
        if self.is_running() {
            let _ = self.send_command("gdb-exit").await;
        }
        self.session = None;

        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
        Ok(())
    }
}

impl Default for GdbAdapter {
    fn default() -> Self {
        Self::new(GdbConfig::default())
    }
}
