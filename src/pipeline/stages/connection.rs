//! Connection management stages: auto-connect, reconnect, and the
//! connection lock.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    backoff::Backoff,
    error::PipelineError,
    event::Event,
    operation::{OpId, OpKind, Operation},
    pipeline::chain::{Stage, StageContext},
    state::ConnectionState,
    timer::TimerHandle,
};

/// Connects before running an operation that needs a connection.
pub struct AutoConnectStage {
    enabled: bool,
}

impl AutoConnectStage {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Stage for AutoConnectStage {
    fn name(&self) -> &'static str {
        "auto_connect"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        let connected = ctx.nucleus().is_some_and(|n| n.connected());
        if !self.enabled || !op.needs_connection() || connected {
            return ctx.send_op_down(op);
        }
        debug!(op = %op.name(), "Connecting before running operation");
        let next = ctx.clone();
        let connect = Operation::new(
            OpKind::Connect,
            Box::new(move |result| match result {
                Ok(_) => next.send_op_down(op),
                Err(e) => op.fail(e),
            }),
        );
        ctx.send_op_down(connect);
    }
}

struct ReconnectState {
    backoff: Backoff,
    timer: Option<TimerHandle>,
    /// The application wants to be connected.
    wants_connection: bool,
    /// Connect operations waiting for a retry.
    waiting: HashMap<OpId, Operation>,
}

/// Reconnects after an unexpected drop and retries transient connect
/// failures once the pipeline has connected at least once.
pub struct ReconnectStage {
    enabled: bool,
    state: Arc<Mutex<ReconnectState>>,
}

impl ReconnectStage {
    pub fn new(enabled: bool, interval: Duration) -> Self {
        let max = interval.max(Duration::from_secs(60));
        Self {
            enabled,
            state: Arc::new(Mutex::new(ReconnectState {
                backoff: Backoff::new(interval, max, 1.1),
                timer: None,
                wants_connection: false,
                waiting: HashMap::new(),
            })),
        }
    }

    fn lock(state: &Mutex<ReconnectState>) -> std::sync::MutexGuard<'_, ReconnectState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends a connect down with the retry interceptor attached.
    fn send_connect(ctx: &StageContext, state: &Arc<Mutex<ReconnectState>>, enabled: bool, mut op: Operation) {
        let retry_ctx = ctx.clone();
        let retry_state = Arc::clone(state);
        op.add_callback(move |op, result| {
            let err = match result {
                Ok(output) => {
                    Self::lock(&retry_state).backoff.reset();
                    return op.complete(Ok(output));
                }
                Err(e) => e,
            };
            let ever_connected = retry_ctx.nucleus().is_some_and(|n| n.ever_connected());
            let mut state = Self::lock(&retry_state);
            if !enabled || !ever_connected || !err.is_retryable() || !state.wants_connection {
                drop(state);
                if !ever_connected {
                    warn!(error = %err, "Initial connect failed");
                }
                return op.fail(err);
            }
            let delay = match state.backoff.next_sleep() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    drop(state);
                    warn!(error = %err, reason = %exhausted, "Giving up on reconnect");
                    return op.fail(err);
                }
            };
            info!(error = %err, delay_ms = delay.as_millis() as u64, "Connect failed; retrying");
            let id = op.id();
            state.waiting.insert(id, op);
            let waiting = Arc::clone(&retry_state);
            state.timer = retry_ctx.schedule(delay, move |ctx| {
                let op = Self::lock(&waiting).waiting.remove(&id);
                if let Some(op) = op {
                    Self::send_connect(&ctx, &waiting, enabled, op);
                }
            });
        });
        ctx.send_op_down(op);
    }

    fn schedule_reconnect(&self, ctx: &StageContext) {
        let mut state = Self::lock(&self.state);
        if state.timer.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return;
        }
        let delay = match state.backoff.next_sleep() {
            Ok(delay) => delay,
            Err(e) => {
                drop(state);
                ctx.report_background(PipelineError::ConnectionFailed(e.to_string()));
                return;
            }
        };
        info!(delay_ms = delay.as_millis() as u64, "Connection dropped; reconnecting");
        let shared = Arc::clone(&self.state);
        let enabled = self.enabled;
        state.timer = ctx.schedule(delay, move |ctx| {
            let wants = {
                let mut state = Self::lock(&shared);
                state.timer = None;
                state.wants_connection
            };
            if !wants {
                return;
            }
            let report = ctx.clone();
            let connect = Operation::new(
                OpKind::Connect,
                Box::new(move |result| {
                    if let Err(e) = result {
                        report.report_background(e);
                    }
                }),
            );
            Self::send_connect(&ctx, &shared, enabled, connect);
        });
    }

    fn cancel_waiting(&self, reason: &str) {
        let (timer, waiting) = {
            let mut state = Self::lock(&self.state);
            let waiting: Vec<_> = state.waiting.drain().map(|(_, op)| op).collect();
            (state.timer.take(), waiting)
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        for op in waiting {
            op.fail(PipelineError::OperationCancelled(reason.to_string()));
        }
    }
}

impl Stage for ReconnectStage {
    fn name(&self) -> &'static str {
        "reconnect"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        match op.kind() {
            OpKind::Connect => {
                Self::lock(&self.state).wants_connection = true;
                Self::send_connect(ctx, &self.state, self.enabled, op);
            }
            OpKind::Disconnect => {
                Self::lock(&self.state).wants_connection = false;
                self.cancel_waiting("Explicit disconnect invoked");
                ctx.send_op_down(op);
            }
            OpKind::Reconnect => {
                debug!("Reconnect requested");
                let next = ctx.clone();
                let state = Arc::clone(&self.state);
                let enabled = self.enabled;
                let disconnect = Operation::new(
                    OpKind::Disconnect,
                    Box::new(move |result| match result {
                        Ok(_) => {
                            Self::lock(&state).wants_connection = true;
                            let connect = Operation::delegate(op, OpKind::Connect, |r| r);
                            Self::send_connect(&next, &state, enabled, connect);
                        }
                        Err(e) => op.fail(e),
                    }),
                );
                Self::lock(&self.state).wants_connection = false;
                self.cancel_waiting("Explicit disconnect invoked");
                ctx.send_op_down(disconnect);
            }
            _ => ctx.send_op_down(op),
        }
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        match &event {
            Event::Connected => {
                let timer = {
                    let mut state = Self::lock(&self.state);
                    state.backoff.reset();
                    state.timer.take()
                };
                if let Some(timer) = timer {
                    timer.cancel();
                }
            }
            Event::Disconnected { cause: Some(cause) } => {
                let wants = Self::lock(&self.state).wants_connection;
                if self.enabled && wants {
                    debug!(cause = %cause, "Unexpected disconnect");
                    self.schedule_reconnect(ctx);
                }
            }
            _ => {}
        }
        ctx.send_event_up(event);
    }

    fn shutdown(&self, _ctx: &StageContext) {
        Self::lock(&self.state).wants_connection = false;
        self.cancel_waiting("pipeline is shut down");
    }
}

#[derive(Default)]
struct LockState {
    blocked: bool,
    queue: VecDeque<Operation>,
}

/// Serializes connection changes. While one is in flight every other
/// operation waits in arrival order.
pub struct ConnectionLockStage {
    state: Arc<Mutex<LockState>>,
}

impl Default for ConnectionLockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLockStage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState::default())),
        }
    }

    fn lock(state: &Mutex<LockState>) -> std::sync::MutexGuard<'_, LockState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(ctx: &StageContext, shared: &Arc<Mutex<LockState>>, mut op: Operation) {
        {
            let mut state = Self::lock(shared);
            if state.blocked {
                debug!(op = %op.name(), "Queued behind connection change");
                state.queue.push_back(op);
                return;
            }
        }

        let state = ctx.nucleus().map(|n| n.connection_state());
        match op.kind() {
            OpKind::Connect if state.is_some_and(|s| s.is_connected()) => {
                debug!("Already connected");
                return op.complete_ok();
            }
            // Lower stages still cancel their waiting work; the transport
            // completes it without a round trip.
            OpKind::Disconnect if state == Some(ConnectionState::Disconnected) => {
                return ctx.send_op_down(op);
            }
            kind if !kind.is_connection_change() => return ctx.send_op_down(op),
            _ => {}
        }

        Self::lock(shared).blocked = true;
        let release_ctx = ctx.clone();
        let release = Arc::clone(shared);
        op.add_callback(move |op, result| {
            let queued = {
                let mut state = Self::lock(&release);
                state.blocked = false;
                std::mem::take(&mut state.queue)
            };
            let failure = result.as_ref().err().cloned();
            op.complete(result);
            for queued in queued {
                match &failure {
                    Some(e) if !queued.kind().is_connection_change() => queued.fail(e.clone()),
                    _ => Self::run(&release_ctx, &release, queued),
                }
            }
        });
        ctx.send_op_down(op);
    }
}

impl Stage for ConnectionLockStage {
    fn name(&self) -> &'static str {
        "connection_lock"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        Self::run(ctx, &self.state, op);
    }

    fn shutdown(&self, _ctx: &StageContext) {
        let queued = std::mem::take(&mut Self::lock(&self.state).queue);
        for op in queued {
            op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        }
    }
}
