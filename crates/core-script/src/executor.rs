//! Single-consumer work queue for session state.
//!
//! The VM state is `!Send` by design, so it is built and consumed on one
//! dedicated worker thread; callers submit boxed jobs over a bounded channel
//! and block on a reply channel. Reentrant work inside the worker calls the
//! state directly and never re-enqueues.
//!
//! Backpressure policy: the queue is bounded and `submit` blocks the caller
//! until space frees, preferring latency over dropped work — a single
//! producer pair (transport + watcher) keeps queues shallow in practice.

use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("session worker is gone")]
    WorkerGone,
    #[error("session job panicked")]
    JobPanicked,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle to a session worker. Cloning shares the queue; the worker exits
/// when every handle (and thus the sender) is dropped.
pub struct Worker<S> {
    tx: Sender<Job<S>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: 'static> Worker<S> {
    /// Spawn the worker thread. `init` builds the (possibly `!Send`) state
    /// on the worker itself.
    pub fn spawn(
        name: impl Into<String>,
        queue_depth: usize,
        init: impl FnOnce() -> S + Send + 'static,
    ) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx): (Sender<Job<S>>, Receiver<Job<S>>) = bounded(queue_depth);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut state = init();
                debug!(target: "script.worker", worker = %thread_name, "worker_started");
                while let Ok(job) = rx.recv() {
                    // A panicking job poisons nothing global: the reply
                    // channel drops (callers see JobPanicked) and the worker
                    // keeps serving. Hot reload depends on this.
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| job(&mut state)));
                    if outcome.is_err() {
                        error!(target: "script.worker", worker = %thread_name, "job_panicked");
                    }
                }
                debug!(target: "script.worker", worker = %thread_name, "worker_stopped");
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Run a job on the worker and wait for its result.
    pub fn submit<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, ExecError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Box::new(move |state: &mut S| {
                let _ = reply_tx.send(job(state));
            }))
            .map_err(|_| ExecError::WorkerGone)?;
        reply_rx.recv().map_err(|_| ExecError::JobPanicked)
    }

    /// Fire-and-forget submission (watcher nudges).
    pub fn post(&self, job: impl FnOnce(&mut S) + Send + 'static) -> Result<(), ExecError> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| ExecError::WorkerGone)
    }

}

impl<S> Worker<S> {
    /// Close the queue and join the worker; in-flight jobs finish first.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        // Replacing the sender with a dropped clone closes the channel.
        let (closed_tx, _) = bounded::<Job<S>>(1);
        self.tx = closed_tx;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
