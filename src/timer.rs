//! Background timer service.
//!
//! Stages that need delayed work (token renewal, retry, reconnect, operation
//! timeouts) schedule plain closures here. The service owns a small dedicated
//! tokio runtime so timers fire whether or not the caller is inside a runtime,
//! and callbacks never run on the submitting thread.
//!
//! A panic inside a callback is caught and logged; the worker keeps running.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::PipelineError;

/// Cancels one scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Prevents the callback from running if it has not fired yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Owns the timer worker.
pub struct TimerService {
    runtime: Option<Runtime>,
    handle: Handle,
    shutdown: CancellationToken,
}

impl TimerService {
    /// Starts the timer worker thread.
    ///
    /// # Errors
    ///
    /// `Pipeline` when the worker runtime cannot be built.
    pub fn new() -> Result<Self, PipelineError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("devicelink-timer")
            .enable_time()
            .build()
            .map_err(|e| PipelineError::Pipeline(format!("failed to start timer worker: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            shutdown: CancellationToken::new(),
        })
    }

    /// Runs `f` on the timer worker after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let task_token = token.clone();
        trace!(delay_ms = delay.as_millis() as u64, "Timer scheduled");
        self.handle.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {
                    trace!("Timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if catch_unwind(AssertUnwindSafe(f)).is_err() {
                        error!("Timer callback panicked");
                    }
                }
            }
        });
        TimerHandle { token }
    }

    /// Cancels every pending timer.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Shutting down timer service");
            self.shutdown.cancel();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
