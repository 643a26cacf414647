//! Operation retry and operation timeouts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    backoff::Backoff,
    config::RetryConfig,
    error::PipelineError,
    operation::{OpId, OpKind, Operation},
    pipeline::chain::{Stage, StageContext},
    timer::TimerHandle,
};

type Waiting = Arc<Mutex<HashMap<OpId, (Operation, Backoff, Option<TimerHandle>)>>>;

/// Re-submits operations that fail with a transient error.
///
/// Each operation gets its own backoff schedule; once the elapsed-time
/// ceiling would be passed, the last error is delivered.
pub struct RetryStage {
    config: RetryConfig,
    waiting: Waiting,
}

impl RetryStage {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            waiting: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn send(ctx: &StageContext, waiting: &Waiting, mut op: Operation, mut backoff: Backoff) {
        let retry_ctx = ctx.clone();
        let retry_waiting = Arc::clone(waiting);
        op.add_callback(move |op, result| {
            let err = match result {
                Err(e) if e.is_retryable() => e,
                other => return op.complete(other),
            };
            let delay = match backoff.next_sleep() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    warn!(op = %op.name(), error = %err, reason = %exhausted, "Retries exhausted");
                    return op.fail(err);
                }
            };
            info!(
                op = %op.name(),
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed; retrying"
            );
            let id = op.id();
            let fire_waiting = Arc::clone(&retry_waiting);
            let mut map = retry_waiting.lock().unwrap_or_else(PoisonError::into_inner);
            map.insert(id, (op, backoff, None));
            let timer = retry_ctx.schedule(delay, move |ctx| {
                let entry = fire_waiting
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if let Some((op, backoff, _)) = entry {
                    debug!(op = %op.name(), "Re-submitting operation");
                    Self::send(&ctx, &fire_waiting, op, backoff);
                }
            });
            if let Some(entry) = map.get_mut(&id) {
                entry.2 = timer;
            }
        });
        ctx.send_op_down(op);
    }

    fn cancel_waiting(&self, reason: &str) {
        let entries: Vec<_> = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for (op, _, timer) in entries {
            if let Some(timer) = timer {
                timer.cancel();
            }
            op.fail(PipelineError::OperationCancelled(reason.to_string()));
        }
    }
}

impl Stage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        if matches!(op.kind(), OpKind::Disconnect) {
            self.cancel_waiting("Explicit disconnect invoked");
            return ctx.send_op_down(op);
        }
        if !self.config.enabled || !op.needs_connection() {
            return ctx.send_op_down(op);
        }
        Self::send(ctx, &self.waiting, op, Backoff::from_config(&self.config));
    }

    fn shutdown(&self, _ctx: &StageContext) {
        self.cancel_waiting("pipeline is shut down");
    }
}

type Parked = Arc<Mutex<HashMap<OpId, (Operation, Option<TimerHandle>)>>>;

/// Fails subscribe and unsubscribe operations that take too long.
///
/// The original operation waits here while a copy runs below; whichever of
/// the copy's completion and the timer comes first wins.
pub struct OpTimeoutStage {
    timeout: Duration,
    parked: Parked,
}

impl OpTimeoutStage {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            parked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn take(parked: &Parked, id: OpId) -> Option<Operation> {
        let entry = parked.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        entry.map(|(op, timer)| {
            if let Some(timer) = timer {
                timer.cancel();
            }
            op
        })
    }
}

impl Stage for OpTimeoutStage {
    fn name(&self) -> &'static str {
        "op_timeout"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        if !matches!(op.kind(), OpKind::Subscribe { .. } | OpKind::Unsubscribe { .. }) {
            return ctx.send_op_down(op);
        }
        let id = op.id();
        let kind = op.kind().clone();
        let name = op.name();
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (op, None));

        let on_timeout = Arc::clone(&self.parked);
        let timeout = self.timeout;
        let timer = ctx.schedule(timeout, move |_| {
            if let Some(op) = Self::take(&on_timeout, id) {
                warn!(op = name, timeout_secs = timeout.as_secs(), "Operation timed out");
                op.fail(PipelineError::Timeout(format!(
                    "{name} did not complete within {}s",
                    timeout.as_secs()
                )));
            }
        });
        if let Some(entry) = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            entry.1 = timer;
        }

        let on_done = Arc::clone(&self.parked);
        let worker = Operation::new(
            kind,
            Box::new(move |result| match Self::take(&on_done, id) {
                Some(op) => op.complete(result),
                None => debug!(op = name, "Completion arrived after timeout; ignored"),
            }),
        );
        ctx.send_op_down(worker);
    }

    fn shutdown(&self, _ctx: &StageContext) {
        let entries: Vec<_> = self
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, (op, _))| op)
            .collect();
        for op in entries {
            op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        }
    }
}
