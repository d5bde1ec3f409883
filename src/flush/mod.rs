//! Flush Module
//!
//! State machine that sequences multi-step journal work on behalf of the
//! store: format → initialize → read-back, log → commit, and reset.
//!
//! ## States
//! ```text
//!              init                  NotFormatted
//!   Stopped ──────────► Initializing ◄──────────► Formatting
//!                           │  info (body)
//!                           ▼
//!                        Reading ──── body ────┐
//!                                              ▼
//!   Resetting ◄── reset ── Ready ◄─────────────┘
//!       └────── done ──────►│ ▲
//!                     flush │ │ committed
//!                           ▼ │
//!                     Logging ──► Committing
//! ```
//!
//! Every state's on-entry action issues one journal call. A synchronous
//! answer (`Status::Done`) and a later asynchronous `Completion` are fed
//! through the same handler, so the machine behaves identically with either
//! kind of driver.

use std::fmt;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use tracing::debug;

use crate::error::{NvkvError, Result};
use crate::journal::{
    Completion, Journal, JournalCaps, JournalError, JournalOp, JournalResult, Outcome, Status,
};

/// States of the flush machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Stopped,
    Formatting,
    Initializing,
    Reading,
    Ready,
    Logging,
    Committing,
    Resetting,
}

impl fmt::Display for FlushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushState::Stopped => "stopped",
            FlushState::Formatting => "formatting",
            FlushState::Initializing => "initializing",
            FlushState::Reading => "reading",
            FlushState::Ready => "ready",
            FlushState::Logging => "logging",
            FlushState::Committing => "committing",
            FlushState::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// A client request the machine has finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finished {
    /// Initialize completed; `Some(body)` is the recovered arena image
    Initialized(Result<Option<Vec<u8>>>),
    Flushed(Result<()>),
    Reset(Result<()>),
}

/// A journal call and its immediate answer
type Step = (JournalOp, JournalResult<Status>);

/// How long `wait` blocks before re-checking the state
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Drives the journal through initialize, flush and reset
pub struct FlushMachine<J: Journal> {
    /// Must be dropped before `journal`
    completions: Receiver<Completion>,
    journal: J,
    caps: JournalCaps,
    state: FlushState,
    auto_format: bool,
    /// Arena has mutations not yet committed
    dirty: bool,
    /// Image being logged and how much of it the journal accepted
    blob: Vec<u8>,
    logged: usize,
    finished: Option<Finished>,
}

impl<J: Journal> FlushMachine<J> {
    /// Take ownership of a journal and attach the completion channel
    pub fn new(mut journal: J, auto_format: bool) -> Self {
        // One operation is in flight at a time, so one slot is enough
        let (tx, rx) = channel::bounded(1);
        journal.attach(tx);

        Self {
            caps: journal.capabilities(),
            journal,
            state: FlushState::Stopped,
            completions: rx,
            auto_format,
            dirty: false,
            blob: Vec::new(),
            logged: 0,
            finished: None,
        }
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == FlushState::Ready
    }

    /// An operation is in flight
    pub fn is_busy(&self) -> bool {
        !matches!(self.state, FlushState::Ready | FlushState::Stopped)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn capabilities(&self) -> JournalCaps {
        self.caps
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn into_journal(self) -> J {
        self.journal
    }

    /// Receiver side of the completion channel, for blocking waits
    pub fn completion_receiver(&self) -> Receiver<Completion> {
        self.completions.clone()
    }

    /// Take the result of the most recently finished client request
    pub fn take_finished(&mut self) -> Option<Finished> {
        self.finished.take()
    }

    // =========================================================================
    // Client Requests
    // =========================================================================

    /// Stopped → Initializing
    pub fn request_init(&mut self) -> Result<()> {
        match self.state {
            FlushState::Stopped => {
                self.dirty = false;
                let step = self.enter(FlushState::Initializing);
                self.run(step);
                Ok(())
            }
            FlushState::Ready => Err(NvkvError::Internal("already initialized".to_string())),
            _ => Err(NvkvError::OperationPending),
        }
    }

    /// Ready → Logging; `image` is only built when the arena is dirty
    pub fn request_flush<F>(&mut self, image: F) -> Result<()>
    where
        F: FnOnce() -> Vec<u8>,
    {
        self.ensure_ready()?;

        if self.dirty {
            let blob = image();
            if blob.len() > self.caps.max_body_size {
                return Err(JournalError::BlobTooLarge {
                    len: blob.len(),
                    capacity: self.caps.max_body_size,
                }
                .into());
            }
            self.blob = blob;
        } else {
            self.blob.clear();
        }
        self.logged = 0;

        let step = self.enter(FlushState::Logging);
        self.run(step);
        Ok(())
    }

    /// Ready → Resetting
    pub fn request_reset(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let step = self.enter(FlushState::Resetting);
        self.run(step);
        Ok(())
    }

    /// Ready → Stopped, without touching the journal
    pub fn stop(&mut self) -> Result<()> {
        if self.is_busy() {
            return Err(NvkvError::OperationPending);
        }
        self.transition(FlushState::Stopped);
        self.dirty = false;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            FlushState::Ready => Ok(()),
            FlushState::Stopped => Err(NvkvError::NotInitialized),
            _ => Err(NvkvError::OperationPending),
        }
    }

    // =========================================================================
    // Completion Handling
    // =========================================================================

    /// Feed one asynchronous completion into the machine
    pub fn complete(&mut self, completion: Completion) {
        let step = (completion.op, completion.result.map(Status::Done));
        self.run(Some(step));
    }

    /// Process every completion that has already arrived; returns how many
    pub fn poll(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.complete(completion);
            count += 1;
        }
        count
    }

    /// Block until the machine is idle
    pub fn wait(&mut self) {
        while self.is_busy() {
            match self.completions.recv_timeout(WAIT_SLICE) {
                Ok(completion) => self.complete(completion),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => self.abort(JournalError::Disconnected),
            }
        }
    }

    /// Fail whatever is in flight, e.g. because the driver went away
    pub fn abort(&mut self, err: JournalError) {
        let Some(op) = self.expected_op() else {
            return;
        };
        self.run(Some((op, Err(err))));
    }

    /// The journal call the current state is waiting on
    fn expected_op(&self) -> Option<JournalOp> {
        match self.state {
            FlushState::Formatting => Some(JournalOp::Format),
            FlushState::Initializing => Some(JournalOp::Initialize),
            FlushState::Reading => Some(JournalOp::Read),
            FlushState::Logging => Some(JournalOp::Log),
            FlushState::Committing => Some(JournalOp::Commit),
            FlushState::Resetting => Some(JournalOp::Reset),
            FlushState::Ready | FlushState::Stopped => None,
        }
    }

    /// Route answers through the handler until a call is left pending
    fn run(&mut self, mut step: Option<Step>) {
        while let Some((op, status)) = step.take() {
            let result = match status {
                Ok(Status::Pending) => {
                    debug!(?op, state = %self.state, "journal call pending");
                    return;
                }
                Ok(Status::Done(outcome)) => Ok(outcome),
                Err(e) => Err(e),
            };
            step = self.on_complete(op, result);
        }
    }

    /// The completion handler: apply one result, return the next call
    fn on_complete(&mut self, op: JournalOp, result: JournalResult<Outcome>) -> Option<Step> {
        if self.expected_op() != Some(op) {
            debug!(?op, state = %self.state, "ignoring unexpected completion");
            return None;
        }

        match self.state {
            FlushState::Initializing => match result {
                Ok(Outcome::Info(info)) if info.body_size == 0 => {
                    self.finish_init(Ok(None));
                    None
                }
                Ok(Outcome::Info(_)) => self.enter(FlushState::Reading),
                Err(JournalError::NotFormatted) if self.auto_format => {
                    self.enter(FlushState::Formatting)
                }
                other => {
                    self.finish_init(Err(unexpected(op, other)));
                    None
                }
            },
            FlushState::Formatting => match result {
                Ok(Outcome::Formatted) => self.enter(FlushState::Initializing),
                other => {
                    self.finish_init(Err(unexpected(op, other)));
                    None
                }
            },
            FlushState::Reading => {
                match result {
                    Ok(Outcome::Body(body)) => self.finish_init(Ok(Some(body))),
                    other => self.finish_init(Err(unexpected(op, other))),
                }
                None
            }
            FlushState::Logging => match result {
                Ok(Outcome::Logged(n)) if n > 0 => {
                    self.logged += n;
                    self.enter(FlushState::Logging)
                }
                Err(JournalError::SmallLogRequest { unit, .. }) => {
                    // Pad the remainder up to one program unit and resubmit
                    let padded = self.logged + unit;
                    if self.blob.len() < padded {
                        self.blob.resize(padded, 0);
                    }
                    self.enter(FlushState::Logging)
                }
                other => {
                    self.finish_flush(Err(unexpected(op, other)));
                    None
                }
            },
            FlushState::Committing => {
                match result {
                    Ok(Outcome::Committed(_)) => self.finish_flush(Ok(())),
                    other => self.finish_flush(Err(unexpected(op, other))),
                }
                None
            }
            FlushState::Resetting => {
                match result {
                    Ok(Outcome::Reset) => {
                        self.dirty = false;
                        self.finish(FlushState::Ready, Finished::Reset(Ok(())));
                    }
                    other => {
                        self.finish(FlushState::Ready, Finished::Reset(Err(unexpected(op, other))))
                    }
                }
                None
            }
            FlushState::Ready | FlushState::Stopped => None,
        }
    }

    // =========================================================================
    // State Entry
    // =========================================================================

    fn transition(&mut self, next: FlushState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "flush state transition");
        }
        self.state = next;
    }

    /// Move to `next` and issue its on-entry journal call
    fn enter(&mut self, next: FlushState) -> Option<Step> {
        self.transition(next);

        match next {
            FlushState::Stopped | FlushState::Ready => None,
            FlushState::Formatting => Some((JournalOp::Format, self.journal.format())),
            FlushState::Initializing => Some((JournalOp::Initialize, self.journal.initialize())),
            FlushState::Reading => Some((JournalOp::Read, self.journal.read())),
            FlushState::Logging if !self.dirty => {
                // Nothing changed: skip straight to a no-op commit
                self.transition(FlushState::Committing);
                Some((JournalOp::Commit, Ok(Status::Done(Outcome::Committed(0)))))
            }
            FlushState::Logging if self.logged >= self.blob.len() => {
                self.enter(FlushState::Committing)
            }
            FlushState::Logging => Some((JournalOp::Log, self.journal.log(&self.blob[self.logged..]))),
            FlushState::Committing => Some((JournalOp::Commit, self.journal.commit())),
            FlushState::Resetting => Some((JournalOp::Reset, self.journal.reset())),
        }
    }

    fn finish(&mut self, next: FlushState, finished: Finished) {
        self.transition(next);
        self.finished = Some(finished);
    }

    fn finish_init(&mut self, result: Result<Option<Vec<u8>>>) {
        let next = if result.is_ok() {
            FlushState::Ready
        } else {
            FlushState::Stopped
        };
        self.finish(next, Finished::Initialized(result));
    }

    fn finish_flush(&mut self, result: Result<()>) {
        if result.is_ok() {
            self.dirty = false;
        }
        self.blob = Vec::new();
        self.logged = 0;
        self.finish(FlushState::Ready, Finished::Flushed(result));
    }
}

/// Turn a failed or mismatched journal answer into a store error
fn unexpected(op: JournalOp, result: JournalResult<Outcome>) -> NvkvError {
    match result {
        Err(e) => e.into(),
        Ok(outcome) => NvkvError::Internal(format!("unexpected {outcome:?} for {op:?}")),
    }
}
