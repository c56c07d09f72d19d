//! Blocking bridge between SQLite callbacks and the async fetch path
//!
//! SQLite calls into the VFS synchronously on its own threads. Each call
//! spawns its async work on a private multi-thread runtime and parks on a
//! channel until the result arrives, so the caller's thread never needs to be
//! inside a tokio context.

use crate::core::error::{Result, VfsError};
use crossbeam::channel;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

pub struct BlockingExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
    workers: usize,
}

impl BlockingExecutor {
    pub fn new(worker_threads: usize) -> Result<Self> {
        let workers = worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("web-vfs-io")
            .enable_all()
            .build()
            .map_err(|e| VfsError::Executor(format!("failed to start runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        debug!("started I/O runtime with {} worker(s)", workers);

        Ok(BlockingExecutor {
            runtime: Some(runtime),
            handle,
            workers,
        })
    }

    /// Handle for spawning background work (prefetch) on the I/O runtime
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` to completion on the I/O runtime, blocking this thread
    pub fn block_on<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        self.handle.spawn(async move {
            // Receiver only goes away if the caller's thread died
            let _ = tx.send(future.await);
        });

        rx.recv()
            .map_err(|_| VfsError::Executor("I/O task panicked or runtime shut down".into()))
    }
}

impl Drop for BlockingExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for BlockingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingExecutor")
            .field("workers", &self.workers)
            .finish()
    }
}
