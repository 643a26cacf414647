//! Bridges from one-shot, cross-thread completion callbacks to callers.
//!
//! The pipeline completes operations by calling a boxed `FnOnce` on whatever
//! thread finishes the work, often a transport worker. The adapters here turn
//! that into something a particular caller can wait on:
//!
//! - [`AwaitableCallback`]: resolves a future on the tokio runtime that
//!   created it. The callback never touches the result from the foreign
//!   thread; it spawns the resolution onto the captured runtime handle.
//! - [`BlockingCallback`]: parks the calling thread until the callback fires
//!   or an optional timeout elapses.
//! - [`WeakMethod`]: a non-owning `(target, method)` pair. Calling it after
//!   the target is dropped fails with `TargetGone` instead of keeping the
//!   target alive through a callback field.
//!
//! Both waiting facades sit on [`ResultCell`], the single-assignment slot
//! that decides whether a result has already been delivered.
//!
//! # Examples
//!
//! ```ignore
//! let bridge = BlockingCallback::<OpOutput>::new();
//! pipeline.submit(OpKind::Connect, bridge.callback());
//! bridge.wait_for_completion(Some(Duration::from_secs(30)))?;
//!
//! let bridge = AwaitableCallback::<OpOutput>::new()?;
//! pipeline.submit(OpKind::GetTwin, bridge.callback());
//! let twin = bridge.completion().await?;
//! ```

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{runtime::Handle, sync::Notify};
use tracing::{error, warn};

use crate::error::PipelineError;

enum Slot<T> {
    Empty,
    Ready(T),
    Taken,
}

struct CellInner<T> {
    slot: Mutex<Slot<T>>,
    gate: Condvar,
    notify: Notify,
}

/// A value that can be assigned exactly once and waited on.
pub struct ResultCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for ResultCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CellInner {
                slot: Mutex::new(Slot::Empty),
                gate: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` and wakes waiters.
    ///
    /// # Errors
    ///
    /// `AlreadyResolved` if a value was stored before.
    pub fn resolve(&self, value: T) -> Result<(), PipelineError> {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Empty) {
                return Err(PipelineError::AlreadyResolved);
            }
            *slot = Slot::Ready(value);
        }
        self.inner.gate.notify_all();
        // A stored permit covers a waiter that has not started waiting yet.
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.lock(), Slot::Empty)
    }

    fn take(slot: &mut Slot<T>) -> Option<T> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(value) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Blocks until resolved. Returns `None` on timeout or if another waiter
    /// already took the value.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let guard = self.lock();
        let mut guard = match timeout {
            Some(timeout) => {
                self.inner
                    .gate
                    .wait_timeout_while(guard, timeout, |slot| matches!(slot, Slot::Empty))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .inner
                .gate
                .wait_while(guard, |slot| matches!(slot, Slot::Empty))
                .unwrap_or_else(PoisonError::into_inner),
        };
        Self::take(&mut guard)
    }

    /// Suspends the current task until resolved.
    pub async fn wait_async(&self) -> T {
        loop {
            let ready = Self::take(&mut self.lock());
            if let Some(value) = ready {
                return value;
            }
            self.inner.notify.notified().await;
        }
    }
}

/// Completion callback type accepted by the bridges.
pub type Completion<T> = Box<dyn FnOnce(Result<T, PipelineError>) + Send + 'static>;

/// Adapts a completion callback into a future for async callers.
pub struct AwaitableCallback<T> {
    cell: ResultCell<Result<T, PipelineError>>,
    handle: Handle,
}

impl<T: Send + 'static> AwaitableCallback<T> {
    /// Captures the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `NoRuntime` when called outside a runtime context.
    pub fn new() -> Result<Self, PipelineError> {
        let handle = Handle::try_current().map_err(|e| PipelineError::NoRuntime(e.to_string()))?;
        Ok(Self {
            cell: ResultCell::new(),
            handle,
        })
    }

    /// The callback to hand to the pipeline. Safe to call from any thread.
    pub fn callback(&self) -> Completion<T> {
        let cell = self.cell.clone();
        let handle = self.handle.clone();
        Box::new(move |result| {
            handle.spawn(async move {
                if cell.resolve(result).is_err() {
                    warn!("awaitable callback invoked after it was already resolved");
                }
            });
        })
    }

    /// Waits for the callback to fire.
    ///
    /// Dropping this future leaves the cell untouched; a later callback still
    /// resolves it exactly once.
    pub async fn completion(self) -> Result<T, PipelineError> {
        self.cell.wait_async().await
    }
}

/// Checks for a named field in a successful result.
pub trait ResultField {
    fn has_field(&self, name: &str) -> bool;
}

/// Adapts a completion callback into a blocking wait.
pub struct BlockingCallback<T> {
    cell: ResultCell<Result<T, PipelineError>>,
    return_field: Option<(&'static str, fn(&T, &str) -> bool)>,
}

impl<T: Send + 'static> Default for BlockingCallback<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> BlockingCallback<T> {
    pub fn new() -> Self {
        Self {
            cell: ResultCell::new(),
            return_field: None,
        }
    }

    /// Stores the result and releases the gate.
    ///
    /// # Errors
    ///
    /// - `MissingResultField` when a named field was expected and the
    ///   successful result lacks it. The waiter receives the same error.
    /// - `AlreadyResolved` on a second completion.
    pub fn complete(&self, result: Result<T, PipelineError>) -> Result<(), PipelineError> {
        if let (Ok(value), Some((name, has_field))) = (&result, self.return_field) {
            if !has_field(value, name) {
                let err = PipelineError::MissingResultField(name.to_string());
                self.cell.resolve(Err(err.clone()))?;
                return Err(err);
            }
        }
        self.cell.resolve(result)
    }

    /// The callback to hand to the pipeline.
    ///
    /// Errors from [`complete`](Self::complete) are logged here, since the
    /// thread running the callback has nobody to return them to.
    pub fn callback(&self) -> Completion<T> {
        let bridge = Self {
            cell: self.cell.clone(),
            return_field: self.return_field,
        };
        Box::new(move |result| {
            if let Err(e) = bridge.complete(result) {
                error!(error = %e, "blocking callback completion failed");
            }
        })
    }

    /// Blocks until the callback fires.
    ///
    /// # Errors
    ///
    /// The error passed to the callback, or `Timeout` if `timeout` elapsed.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<T, PipelineError> {
        self.cell.wait(timeout).unwrap_or_else(|| {
            Err(PipelineError::Timeout(
                "callback was not invoked before the wait timed out".into(),
            ))
        })
    }
}

impl<T: ResultField + Send + 'static> BlockingCallback<T> {
    /// A bridge whose successful results must carry `name`.
    pub fn expecting(name: &'static str) -> Self {
        Self {
            cell: ResultCell::new(),
            return_field: Some((name, T::has_field)),
        }
    }
}

/// A method bound to a weakly held target.
pub struct WeakMethod<T, A, R = ()> {
    target: Weak<T>,
    method: fn(&T, A) -> R,
    label: &'static str,
}

impl<T, A, R> Clone for WeakMethod<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
            method: self.method,
            label: self.label,
        }
    }
}

impl<T, A, R> WeakMethod<T, A, R> {
    pub fn new(target: &Arc<T>, label: &'static str, method: fn(&T, A) -> R) -> Self {
        Self {
            target: Arc::downgrade(target),
            method,
            label,
        }
    }

    /// Resolves the target and calls the method.
    ///
    /// # Errors
    ///
    /// `TargetGone` when the target has been dropped.
    pub fn call(&self, args: A) -> Result<R, PipelineError> {
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| PipelineError::TargetGone(self.label.to_string()))?;
        Ok((self.method)(&target, args))
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}
