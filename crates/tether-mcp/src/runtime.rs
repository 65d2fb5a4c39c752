//! Event-loop host: a persistent single-threaded runtime driven from sync code.
//!
//! Tasks spawned during one `run` (transport readers, the session dispatcher)
//! live on the same runtime and resume on the next `run`. Between calls
//! nothing is polled.

use crate::error::McpError;
use std::future::Future;
use std::io;
use std::sync::{Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};

/// Owns the runtime that executes every async operation of a client.
pub struct EventLoopHost {
    runtime: Option<Runtime>,
    busy: Mutex<()>,
}

impl EventLoopHost {
    /// Build a current-thread runtime with IO and timers enabled.
    pub fn new() -> Result<Self, McpError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(McpError::Runtime)?;
        Ok(Self {
            runtime: Some(runtime),
            busy: Mutex::new(()),
        })
    }

    /// Drive `op` to completion, blocking the calling thread.
    ///
    /// Must not be called from inside an async context, including from an
    /// operation already running on this host; such calls return
    /// [`McpError::Reentrant`]. Calls from several threads run one at a time.
    pub fn run<F, T>(&self, op: F) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        if Handle::try_current().is_ok() {
            return Err(McpError::Reentrant);
        }
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| McpError::Runtime(io::Error::other("event loop has shut down")))?;
        let _guard = self.busy.lock().unwrap_or_else(PoisonError::into_inner);

        tracing::trace!("Event loop run start");
        let result = runtime.block_on(op);
        if let Err(e) = &result {
            tracing::debug!("Event loop run failed: {e}");
        }
        tracing::trace!("Event loop run end");
        result
    }
}

impl Drop for EventLoopHost {
    fn drop(&mut self) {
        // A runtime cannot block on its own shutdown inside another runtime
        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            }
        }
    }
}

impl std::fmt::Debug for EventLoopHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHost").finish_non_exhaustive()
    }
}
