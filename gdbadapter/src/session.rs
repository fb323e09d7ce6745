//! Request/response correlation over the MI line protocol
//!
//! The session is fed line by line from the debugger's stdout, assembles
//! messages at every prompt, matches them to the single in-flight request and
//! promotes queued requests once the in-flight one is finally complete.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::parser::parse_response;
use crate::request::{Completion, RequestIds, Submission};
use crate::types::{Response, ResponseEvent};
use crate::{GdbError, Result};

/// Line GDB prints when it is ready for the next command.
pub const PROMPT: &str = "(gdb) ";

/// Outgoing half of the pipe to the debugger.
pub trait GdbSender: Send + Sync {
    /// Write one command line (without terminator).
    fn send(&self, line: &str) -> Result<()>;

    /// Out-of-band break (Ctrl+C) of the running target.
    fn interrupt(&self) -> Result<()> {
        Err(GdbError::Send("interrupt not supported by this sender".into()))
    }
}

/// Receiver of completed messages.
pub enum Subscriber {
    /// Called on the thread feeding lines; returning `true` marks the message
    /// handled. Must not wait on the session, it would block the reader.
    Inline(Box<dyn Fn(&ResponseEvent) -> bool + Send + Sync>),
    /// Events are pushed into a queue the consumer drains on its own task.
    /// Delivered events count as handled.
    Channel(mpsc::UnboundedSender<ResponseEvent>),
}

impl Subscriber {
    fn offer(&self, event: ResponseEvent) -> bool {
        match self {
            Subscriber::Inline(callback) => callback(&event),
            Subscriber::Channel(sender) => sender.send(event).is_ok(),
        }
    }
}

#[derive(Default)]
struct SessionState {
    current: Option<Submission>,
    pending: VecDeque<Submission>,
    partial: Vec<String>,
    responses: VecDeque<Response>,
    closed: bool,
}

/// Protocol engine between a line source and request owners
pub struct GdbSession {
    sender: Box<dyn GdbSender>,
    ids: RequestIds,
    prompt: String,
    state: Mutex<SessionState>,
    available: Condvar,
    subscriber: RwLock<Option<Arc<Subscriber>>>,
}

impl GdbSession {
    pub fn new(sender: Box<dyn GdbSender>) -> Self {
        Self::with_prompt(sender, PROMPT)
    }

    pub fn with_prompt(sender: Box<dyn GdbSender>, prompt: impl Into<String>) -> Self {
        Self {
            sender,
            ids: RequestIds::new(),
            prompt: prompt.into(),
            state: Mutex::new(SessionState::default()),
            available: Condvar::new(),
            subscriber: RwLock::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Id source for requests submitted to this session.
    pub fn ids(&self) -> &RequestIds {
        &self.ids
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Id of the in-flight request, if any.
    pub fn in_flight(&self) -> Option<u32> {
        self.lock().current.as_ref().map(Submission::id)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        *self.subscriber.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(subscriber));
    }

    pub fn unsubscribe(&self) {
        *self.subscriber.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Send now if nothing is in flight, otherwise queue behind it.
    pub fn submit(&self, submission: impl Into<Submission>) -> Result<Completion> {
        let submission = submission.into();
        let completion = submission.completion();

        let to_send = {
            let mut state = self.lock();
            if state.closed {
                return Err(GdbError::SessionClosed);
            }

            if state.current.is_some() {
                log::debug!("QUEUE[{}]: {}", submission.id(), submission.command());
                state.pending.push_back(submission);
                None
            } else {
                let next = (submission.id(), submission.serialize());
                state.current = Some(submission);
                Some(next)
            }
        };

        if let Some((id, line)) = to_send {
            self.send_in_flight(id, line)?;
        }
        Ok(completion)
    }

    /// Forward a break to the debugger, bypassing the request queue.
    pub fn interrupt(&self) -> Result<()> {
        log::debug!("SEND: interrupt");
        self.sender.interrupt()
    }

    fn transmit(&self, line: &str) -> Result<()> {
        log::debug!("SEND: {}", line);
        self.sender.send(line)
    }

    /// Write the text of the in-flight request `id`.
    ///
    /// A request whose text never reached the debugger cannot be answered: it
    /// is cancelled and the next queued request takes its place. The first
    /// write error is returned once the queue is settled.
    fn send_in_flight(&self, id: u32, line: String) -> Result<()> {
        let mut next = Some((id, line));
        let mut first_error = None;

        while let Some((id, line)) = next.take() {
            let err = match self.transmit(&line) {
                Ok(()) => break,
                Err(err) => err,
            };
            log::warn!("SEND[{}]: failed, dropping request -> {}", id, err);

            let mut state = self.lock();
            if state.current.as_ref().map(Submission::id) != Some(id) {
                return Err(first_error.unwrap_or(err));
            }
            if let Some(failed) = state.current.take() {
                failed.completion().cancel();
            }
            if !state.closed {
                state.current = state.pending.pop_front();
            }
            next = state.current.as_ref().map(|s| (s.id(), s.serialize()));
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel everything queued; nothing more will be answered.
    fn drain_pending(state: &mut SessionState) {
        for submission in state.pending.drain(..) {
            log::debug!("DROP[{}]: {} (session closed)", submission.id(), submission.command());
            submission.completion().cancel();
        }
    }

    /// Feed one line of debugger output.
    ///
    /// Returns `true` when the line completed a message. A malformed message is
    /// dropped and reported; the in-flight request and the queue are untouched.
    pub fn on_line_received(&self, line: &str) -> Result<bool> {
        if line.is_empty() {
            return Ok(false);
        }

        let parsed = {
            let mut state = self.lock();
            if line == self.prompt {
                if state.partial.is_empty() {
                    None
                } else {
                    let lines = std::mem::take(&mut state.partial);
                    Some(parse_response(&lines))
                }
            } else if Self::is_exit_line(&state, line) {
                let parsed = parse_response(&[line]);
                if parsed.is_ok() {
                    state.closed = true;
                    log::debug!("RECV: exit record, session closed");
                }
                Some(parsed)
            } else {
                state.partial.push(line.to_string());
                None
            }
        };

        let response = match parsed {
            None => return Ok(false),
            Some(Ok(response)) => response,
            Some(Err(err)) => {
                log::warn!("GDB_PARSE_ERROR: dropping message -> {}", err);
                return Err(err);
            }
        };

        self.dispatch(response)?;
        Ok(true)
    }

    fn is_exit_line(state: &SessionState, line: &str) -> bool {
        let id = state
            .current
            .as_ref()
            .map(|current| current.id().to_string())
            .unwrap_or_default();
        line.strip_prefix(id.as_str()) == Some("^exit")
    }

    fn dispatch(&self, response: Response) -> Result<()> {
        let mut completed = None;
        let mut to_send = None;

        {
            let mut state = self.lock();
            let matches = state
                .current
                .as_ref()
                .map_or(false, |current| current.id() == response.id);

            if matches {
                if let Some(current) = state.current.as_mut() {
                    let outcome = current.complete(response.clone());
                    log::debug!("RECV[{}]: {:?}", response.id, outcome);

                    if outcome.retry {
                        to_send = Some((current.id(), current.serialize()));
                    } else if outcome.is_final {
                        completed = Some((current.id(), current.command().to_string()));
                        if state.closed {
                            state.current = None;
                            Self::drain_pending(&mut state);
                        } else {
                            state.current = state.pending.pop_front();
                            to_send = state.current.as_ref().map(|s| (s.id(), s.serialize()));
                        }
                    }
                }
            } else if response.has_record() {
                log::warn!("RECV[{}]: no matching request in flight", response.id);
            }
        }

        // Cloned out so the callback may subscribe or unsubscribe.
        let subscriber = self.subscriber.read().unwrap_or_else(|e| e.into_inner()).clone();
        let handled = match subscriber {
            Some(subscriber) => subscriber.offer(ResponseEvent {
                request: completed,
                response: response.clone(),
            }),
            None => false,
        };

        if !handled {
            self.lock().responses.push_back(response);
            self.available.notify_one();
        }

        match to_send {
            Some((id, line)) => self.send_in_flight(id, line),
            None => Ok(()),
        }
    }

    /// Take the next unhandled message, blocking up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<Response> {
        let state = self.lock();
        let (mut state, _) = match self
            .available
            .wait_timeout_while(state, timeout, |s| s.responses.is_empty())
        {
            Ok(result) => result,
            Err(e) => e.into_inner(),
        };
        state.responses.pop_front()
    }

    /// Take the next unhandled message without blocking.
    pub fn poll(&self) -> Option<Response> {
        self.lock().responses.pop_front()
    }

    pub fn clear_responses(&self) {
        self.lock().responses.clear();
    }
}
