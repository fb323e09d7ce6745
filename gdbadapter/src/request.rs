//! Requests sent to GDB and their completion signals
//!
//! A [`Submission`] is what the session keeps in flight: either a single
//! [`Request`] or a [`RequestGroup`] that is exposed as one request whose
//! identity follows its currently active member.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::Response;
use crate::{GdbError, Result};

/// Source of request ids, scoped to one session. Ids never repeat.
#[derive(Debug, Clone)]
pub struct RequestIds {
    next: Arc<AtomicU32>,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { next: Arc::new(AtomicU32::new(1)) }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// What the session should do after delivering a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub is_final: bool,
    pub retry: bool,
}

#[derive(Debug, Default)]
struct CompletionState {
    response: Option<Response>,
    cancelled: bool,
}

/// Shared completion signal; clones observe the same request.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<CompletionState>, Condvar)>,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set(&self, response: Response) {
        self.lock().response = Some(response);
        self.inner.1.notify_all();
    }

    /// Give up on a request that will never be answered and wake its waiters.
    pub(crate) fn cancel(&self) {
        self.lock().cancelled = true;
        self.inner.1.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.lock().response.is_some()
    }

    /// The request was dropped unsent or unanswered (write failure, session closed).
    pub fn is_cancelled(&self) -> bool {
        let state = self.lock();
        state.cancelled && state.response.is_none()
    }

    /// Final response, once completed.
    pub fn response(&self) -> Option<Response> {
        self.lock().response.clone()
    }

    /// Block until completed, cancelled or the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while state.response.is_none() && !state.cancelled {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.inner.1.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        state.response.clone()
    }
}

/// A single MI command
#[derive(Debug)]
pub struct Request {
    id: u32,
    command: String,
    retries_left: u32,
    last_response: Option<Response>,
    completion: Completion,
}

impl Request {
    /// Create a request; the command is given without the leading `-`.
    pub fn new(ids: &RequestIds, command: impl Into<String>) -> Self {
        Self {
            id: ids.next_id(),
            command: command.into(),
            retries_left: 0,
            last_response: None,
            completion: Completion::default(),
        }
    }

    /// Re-send the same text on `^error`, at most `retries` times.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Wire form: `{id}-{command}`.
    pub fn serialize(&self) -> String {
        format!("{}-{}", self.id, self.command)
    }

    pub(crate) fn complete(&mut self, response: Response) -> Outcome {
        if response.is_error() && self.retries_left > 0 {
            self.retries_left -= 1;
            log::debug!("RECV[{}]: error, retrying ({} left)", self.id, self.retries_left);
            self.last_response = Some(response);
            return Outcome { is_final: false, retry: true };
        }

        self.last_response = Some(response.clone());
        self.completion.set(response);
        Outcome { is_final: true, retry: false }
    }
}

/// Ordered requests exposed to the session as one.
#[derive(Debug)]
pub struct RequestGroup {
    members: Vec<Request>,
    active: usize,
    completion: Completion,
}

impl RequestGroup {
    pub fn new(members: Vec<Request>) -> Result<Self> {
        if members.is_empty() {
            return Err(GdbError::EmptyGroup);
        }
        Ok(Self {
            members,
            active: 0,
            completion: Completion::default(),
        })
    }

    pub fn active(&self) -> &Request {
        &self.members[self.active]
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Request] {
        &self.members
    }

    /// Signal raised once, after the last member completes.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    fn complete(&mut self, response: Response) -> Outcome {
        let outcome = self.members[self.active].complete(response);
        if !outcome.is_final {
            return outcome;
        }

        if self.active + 1 == self.members.len() {
            if let Some(last) = self.members[self.active].response() {
                self.completion.set(last.clone());
            }
            return Outcome { is_final: true, retry: false };
        }

        self.active += 1;
        log::debug!(
            "Group advanced to member {}/{}: {}",
            self.active + 1,
            self.members.len(),
            self.active().serialize()
        );
        Outcome { is_final: false, retry: true }
    }
}

/// Unit of correlation held by the session
#[derive(Debug)]
pub enum Submission {
    Single(Request),
    Group(RequestGroup),
}

impl Submission {
    fn current(&self) -> &Request {
        match self {
            Submission::Single(request) => request,
            Submission::Group(group) => group.active(),
        }
    }

    /// Id of the request itself or of the group's active member.
    pub fn id(&self) -> u32 {
        self.current().id()
    }

    pub fn command(&self) -> &str {
        self.current().command()
    }

    pub fn serialize(&self) -> String {
        self.current().serialize()
    }

    pub fn response(&self) -> Option<&Response> {
        self.current().response()
    }

    /// The external completion signal.
    pub fn completion(&self) -> Completion {
        match self {
            Submission::Single(request) => request.completion(),
            Submission::Group(group) => group.completion(),
        }
    }

    /// Deliver a response with a matching id.
    pub fn complete(&mut self, response: Response) -> Outcome {
        match self {
            Submission::Single(request) => request.complete(response),
            Submission::Group(group) => group.complete(response),
        }
    }
}

impl From<Request> for Submission {
    fn from(request: Request) -> Self {
        Submission::Single(request)
    }
}

impl From<RequestGroup> for Submission {
    fn from(group: RequestGroup) -> Self {
        Submission::Group(group)
    }
}
