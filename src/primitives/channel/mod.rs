//! Request channel between caller threads and the worker thread.
//!
//! Callers push a message carrying its own [`Completion`] and block on it;
//! the worker pops messages strictly in submission order and finishes each
//! completion exactly once. An `eventfd` doorbell makes new messages visible
//! to the worker's readiness wait.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::primitives::poll::EventFd;
use crate::types::{Result, UfoError};

/// One-shot rendezvous slot filled by the worker and awaited by a caller.
#[derive(Debug)]
pub struct Completion<T> {
    result: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    /// Creates an unfinished slot.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    /// Stores `outcome` and wakes the waiter. Later calls are ignored.
    pub fn finish(&self, outcome: T) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Blocks until [`Completion::finish`] has been called.
    pub fn wait(&self) -> T {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.cv.wait(&mut guard);
        }
    }

    /// True once an outcome was stored.
    pub fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }
}

#[derive(Debug)]
struct ChannelState<M> {
    pending: VecDeque<M>,
    closed: bool,
}

/// FIFO of control messages with a write side that can be closed.
#[derive(Debug)]
pub struct ControlChannel<M> {
    state: Mutex<ChannelState<M>>,
    doorbell: EventFd,
}

impl<M> ControlChannel<M> {
    /// Creates an open, empty channel.
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(ChannelState {
                pending: VecDeque::new(),
                closed: false,
            }),
            doorbell: EventFd::new()?,
        })
    }

    /// Queues `msg` for the worker.
    ///
    /// Fails with [`UfoError::ShuttingDown`] once the write side is closed.
    pub fn submit(&self, msg: M) -> Result<()> {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UfoError::ShuttingDown);
            }
            state.pending.push_back(msg);
            state.pending.len()
        };
        trace!(pending, "ufo.channel.submit");
        self.doorbell.notify()?;
        Ok(())
    }

    /// Builds a message around a fresh completion, submits it, and blocks
    /// until the worker answers.
    pub fn request<T>(&self, build: impl FnOnce(Arc<Completion<Result<T>>>) -> M) -> Result<T> {
        let completion = Completion::new();
        self.submit(build(Arc::clone(&completion)))?;
        completion.wait()
    }

    /// Closes the write side. Already queued messages stay queued.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Pops the oldest queued message.
    pub fn next(&self) -> Option<M> {
        self.state.lock().pending.pop_front()
    }

    /// Closes the write side and takes every queued message.
    pub fn close_and_drain(&self) -> VecDeque<M> {
        let mut state = self.state.lock();
        state.closed = true;
        std::mem::take(&mut state.pending)
    }

    /// Doorbell rung on every submission.
    pub fn doorbell(&self) -> &EventFd {
        &self.doorbell
    }
}
