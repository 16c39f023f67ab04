//! Single-threaded task executor for the core context
//!
//! All protocol state is owned by one context value and only touched by
//! tasks running on the executor thread. Other threads hand work over
//! through a cloneable [`Poster`] instead of locking the context.

use log::trace;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, SendError, Sender};
use std::time::Duration;

/// A unit of work run against the context
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Handle used to post tasks onto the executor from any thread
pub struct Poster<C> {
    tx: Sender<Task<C>>,
}

impl<C> Clone for Poster<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> Poster<C> {
    /// Queue a task; fails only once the executor has been dropped
    pub fn post<F>(&self, task: F) -> Result<(), SendError<Task<C>>>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(task))
    }
}

/// FIFO task queue drained on the owning thread
pub struct Executor<C> {
    tx: Sender<Task<C>>,
    rx: Receiver<Task<C>>,
}

impl<C> Default for Executor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Executor<C> {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx }
    }

    pub fn poster(&self) -> Poster<C> {
        Poster {
            tx: self.tx.clone(),
        }
    }

    /// Run queued tasks until the queue is empty; returns how many ran
    pub fn run_until_idle(&self, ctx: &mut C) -> usize {
        let mut count = 0;
        while let Ok(task) = self.rx.try_recv() {
            task(ctx);
            count += 1;
        }
        if count > 0 {
            trace!("executor ran {} tasks", count);
        }
        count
    }

    /// Wait up to `timeout` for one task and run it
    pub fn run_once(&self, ctx: &mut C, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task(ctx);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
