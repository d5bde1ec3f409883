//! Async Journal
//!
//! Runs a journal on a worker thread. Every call answers `Status::Pending`
//! and the outcome arrives later on the attached completion channel, the way
//! an interrupt-driven flash driver reports back.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use super::{
    Completion, Journal, JournalCaps, JournalError, JournalOp, JournalResult, Outcome, Status,
};

enum Request {
    Attach(Sender<Completion>),
    Run(JournalOp, Vec<u8>),
}

/// Callback-driven driver wrapping any journal
pub struct AsyncJournal<J: Journal + 'static> {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<J>>,
    caps: JournalCaps,
}

impl<J: Journal + 'static> AsyncJournal<J> {
    /// Move `inner` onto a worker thread
    pub fn new(inner: J) -> Self {
        Self::with_latency(inner, Duration::ZERO)
    }

    /// Like `new`, but every operation is delayed by `latency`
    pub fn with_latency(inner: J, latency: Duration) -> Self {
        let caps = JournalCaps {
            asynchronous: true,
            ..inner.capabilities()
        };
        let (tx, rx) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("nvkv-journal".to_string())
            .spawn(move || run_worker(inner, rx, latency))
            .ok();

        if worker.is_none() {
            warn!("failed to spawn journal worker");
        }

        Self {
            requests: worker.as_ref().map(|_| tx),
            worker,
            caps,
        }
    }

    /// Stop the worker and return the wrapped journal
    pub fn shutdown(mut self) -> Option<J> {
        self.stop()
    }

    fn stop(&mut self) -> Option<J> {
        // Closing the request channel ends the worker loop
        self.requests.take();
        self.worker.take().and_then(|w| w.join().ok())
    }

    fn submit(&self, op: JournalOp, blob: Vec<u8>) -> JournalResult<Status> {
        let requests = self.requests.as_ref().ok_or(JournalError::Disconnected)?;
        requests
            .send(Request::Run(op, blob))
            .map_err(|_| JournalError::Disconnected)?;
        Ok(Status::Pending)
    }
}

impl<J: Journal + 'static> Drop for AsyncJournal<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<J: Journal>(mut inner: J, requests: Receiver<Request>, latency: Duration) -> J {
    let mut sink: Option<Sender<Completion>> = None;

    for request in requests.iter() {
        let (op, blob) = match request {
            Request::Attach(tx) => {
                inner.attach(tx.clone());
                sink = Some(tx);
                continue;
            }
            Request::Run(op, blob) => (op, blob),
        };

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let status = match op {
            JournalOp::Format => inner.format(),
            JournalOp::Initialize => inner.initialize(),
            JournalOp::Read => inner.read(),
            JournalOp::Log => inner.log(&blob),
            JournalOp::Commit => inner.commit(),
            JournalOp::Reset => inner.reset(),
        };

        let result: JournalResult<Outcome> = match status {
            Ok(Status::Done(outcome)) => Ok(outcome),
            // The inner driver reports through the attached channel itself
            Ok(Status::Pending) => continue,
            Err(e) => Err(e),
        };

        debug!(?op, ok = result.is_ok(), "journal worker completed");
        match &sink {
            Some(tx) => {
                if tx.send(Completion { op, result }).is_err() {
                    warn!(?op, "completion receiver dropped");
                }
            }
            None => warn!(?op, "no completion channel attached"),
        }
    }

    inner
}

impl<J: Journal + 'static> Journal for AsyncJournal<J> {
    fn capabilities(&self) -> JournalCaps {
        self.caps
    }

    fn attach(&mut self, completions: Sender<Completion>) {
        if let Some(requests) = &self.requests {
            if requests.send(Request::Attach(completions)).is_err() {
                warn!("journal worker gone, cannot attach");
            }
        }
    }

    fn format(&mut self) -> JournalResult<Status> {
        self.submit(JournalOp::Format, Vec::new())
    }

    fn initialize(&mut self) -> JournalResult<Status> {
        self.submit(JournalOp::Initialize, Vec::new())
    }

    fn read(&mut self) -> JournalResult<Status> {
        self.submit(JournalOp::Read, Vec::new())
    }

    fn log(&mut self, blob: &[u8]) -> JournalResult<Status> {
        self.submit(JournalOp::Log, blob.to_vec())
    }

    fn commit(&mut self) -> JournalResult<Status> {
        self.submit(JournalOp::Commit, Vec::new())
    }

    fn reset(&mut self) -> JournalResult<Status> {
        self.submit(JournalOp::Reset, Vec::new())
    }
}
