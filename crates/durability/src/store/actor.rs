//! Serialized execution context of a snapshot store
//!
//! Every mutation of a store runs as a job on one queue. The queue owns the
//! [`StoreState`] and hands it to one job at a time, so jobs never overlap and
//! need no locks around the pending set, the current-snapshot swap, or the
//! reservation files.
//!
//! Jobs do file I/O and may run caller-supplied writers, so each one runs on
//! tokio's blocking pool. The state moves into the blocking task and comes
//! back with the result. A panicking job fails its own call and the context
//! keeps serving the rest of the queue.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use snapstore_core::{Result, SnapshotError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::state::StoreState;

type Job = Box<dyn FnOnce(&mut StoreState) + Send + 'static>;

enum Command {
    Run(Job),
    Close(oneshot::Sender<()>),
}

/// Handle for submitting jobs to a store's serialized context
#[derive(Clone)]
pub(crate) struct StoreActor {
    tx: mpsc::UnboundedSender<Command>,
    partition_id: u32,
}

impl StoreActor {
    /// Start the context on the current tokio runtime
    pub(crate) fn spawn(state: StoreState) -> Self {
        let partition_id = state.config().partition_id;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(state, rx));
        StoreActor { tx, partition_id }
    }

    /// Run `f` on the context and wait for its result
    pub(crate) async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |state| {
            let _ = reply_tx.send(f(state));
        });
        self.tx
            .send(Command::Run(job))
            .map_err(|_| SnapshotError::Closed)?;
        reply_rx.await.map_err(|_| {
            if self.tx.is_closed() {
                SnapshotError::Closed
            } else {
                SnapshotError::Io(io::Error::new(io::ErrorKind::Other, "snapshot store job panicked"))
            }
        })
    }

    /// Like [`StoreActor::call`] for jobs that already return a `Result`
    pub(crate) async fn try_call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.call(f).await?
    }

    /// Stop the context after the jobs queued so far
    pub(crate) async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        debug!(target: "snapstore::actor", partition = self.partition_id, "Snapshot store closed");
    }
}

impl fmt::Debug for StoreActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreActor")
            .field("partition_id", &self.partition_id)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

async fn run(mut state: StoreState, mut rx: mpsc::UnboundedReceiver<Command>) {
    let partition_id = state.config().partition_id;
    while let Some(command) = rx.recv().await {
        match command {
            Command::Run(job) => {
                let result = tokio::task::spawn_blocking(move || {
                    // The reply sender drops during unwinding, so the caller sees the failure.
                    if let Err(e) = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
                        error!(
                            target: "snapstore::actor",
                            partition = partition_id,
                            panic = e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)"),
                            "Snapshot store job panicked"
                        );
                    }
                    state
                })
                .await;
                match result {
                    Ok(returned) => state = returned,
                    Err(e) => {
                        error!(
                            target: "snapstore::actor",
                            partition = partition_id,
                            error = %e,
                            "Snapshot store task failed, stopping store"
                        );
                        return;
                    }
                }
            }
            Command::Close(done) => {
                let _ = done.send(());
                return;
            }
        }
    }
}
