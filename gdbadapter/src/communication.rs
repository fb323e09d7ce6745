/// Pipes between the GDB process and a session
///
/// The session is synchronous; these tasks adapt it to tokio's child pipes.
/// Stdout lines are fed to the session as they arrive, outgoing commands are
/// queued on a channel drained by a writer task.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use crate::process::send_interrupt_signal;
use crate::session::{GdbSender, GdbSession};
use crate::{GdbError, Result};

/// Sends command lines to GDB's stdin through a writer task
pub struct ChannelSender {
    lines: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
}

impl ChannelSender {
    /// Spawn the writer task; `pid` is the target of interrupts.
    pub fn spawn(stdin: ChildStdin, pid: Option<u32>) -> Self {
        let (lines, receiver) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(stdin, receiver));
        Self { lines, pid }
    }

    /// Sender whose lines end up in `lines`, for driving a session without a process.
    pub fn from_channel(lines: mpsc::UnboundedSender<String>) -> Self {
        Self { lines, pid: None }
    }
}

impl GdbSender for ChannelSender {
    fn send(&self, line: &str) -> Result<()> {
        self.lines
            .send(line.to_string())
            .map_err(|_| GdbError::Send("GDB stdin writer has stopped".into()))
    }

    fn interrupt(&self) -> Result<()> {
        match self.pid {
            Some(pid) => send_interrupt_signal(pid),
            None => Err(GdbError::Send("GDB process id unknown".into())),
        }
    }
}

async fn write_lines(mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        let framed = format!("{}\n", line);
        if let Err(e) = stdin.write_all(framed.as_bytes()).await {
            log::error!("Failed to write command: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            log::error!("Failed to flush command: {}", e);
            break;
        }
    }
    log::debug!("GDB stdin writer finished");
}

/// Strip the line terminator only; the prompt carries a significant trailing space.
pub fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Feed every stdout line into the session until EOF or the session closes.
pub fn spawn_stdout_reader(stdout: ChildStdout, session: Arc<GdbSession>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("GDB stdout reader started");
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        while !session.is_closed() {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    log::debug!("GDB stdout: EOF reached");
                    break;
                }
                Ok(_) => {
                    let line = strip_line_ending(&line);
                    log::trace!("GDB_OUT: {}", line);
                    // errors are logged by the session; the reader keeps going
                    let _ = session.on_line_received(line);
                }
                Err(e) => {
                    log::error!("GDB stdout read error: {}", e);
                    break;
                }
            }
        }
        log::debug!("GDB stdout reader finished");
    })
}

/// Log GDB's stderr.
pub fn spawn_stderr_reader(stderr: ChildStderr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        log::warn!("GDB stderr: {}", trimmed);
                    }
                }
            }
        }
        log::debug!("GDB stderr reader finished");
    })
}
