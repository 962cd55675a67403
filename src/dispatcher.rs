//! Commit dispatcher: serializes asynchronous commit execution.
//!
//! Transactions submitted through [`CommitDispatcher::submit`] are
//! committed one at a time on a single consumer thread; the caller gets a
//! [`CommitWaiter`] that resolves to the commit result. `Tx::commit_with`
//! builds on this and delivers the user callback from a separate worker so
//! user code never runs under the caller's locks.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tx::Tx;

struct Request {
    tx: Tx,
    done: Sender<Result<()>>,
}

/// Resolves to the eventual commit result. Safe to await from a different
/// thread than the one that submitted.
pub struct CommitWaiter {
    rx: Receiver<Result<()>>,
}

impl CommitWaiter {
    /// Blocks until the commit finishes and returns its result.
    pub fn wait(self) -> Result<()> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::DbClosed),
        }
    }
}

/// Single-consumer commit queue.
pub struct CommitDispatcher {
    tx: Mutex<Option<Sender<Request>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommitDispatcher {
    /// Starts the consumer thread.
    pub fn start() -> Result<Self> {
        let (tx, rx) = unbounded::<Request>();
        let handle = std::thread::Builder::new()
            .name("emberdb-commit".to_string())
            .spawn(move || worker(rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueues a transaction for commit. Non-blocking; returns a waiter
    /// for the eventual result, or the transaction back if the dispatcher
    /// has shut down.
    pub fn submit(&self, tx: Tx) -> std::result::Result<CommitWaiter, Tx> {
        let (done, rx) = bounded(1);
        let sender = self.tx.lock();
        match sender.as_ref() {
            Some(queue) => match queue.send(Request { tx, done }) {
                Ok(()) => Ok(CommitWaiter { rx }),
                Err(err) => Err(err.into_inner().tx),
            },
            None => Err(tx),
        }
    }

    /// Closes the queue and waits for the consumer to drain in-flight
    /// commits.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker(rx: Receiver<Request>) {
    for Request { tx, done } in rx {
        let result = tx.commit();
        let _ = done.send(result);
    }
}
