//! The stage chain and the context stages use to talk to their neighbors.
//!
//! Operations enter at the top (index 0) and move down; events enter at the
//! bottom and move up. A stage sees only its [`StageContext`], which knows
//! its position and holds the chain weakly, so timer callbacks and transport
//! completions that outlive the pipeline fail quietly instead of keeping it
//! alive.
//!
//! Stages must not hold their own locks while calling `send_op_down` or
//! `send_event_up`: neighbors may complete operations synchronously and
//! re-enter the stage.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use crate::{
    error::PipelineError,
    event::Event,
    operation::Operation,
    state::Nucleus,
    timer::{TimerHandle, TimerService},
    transport::Transport,
};

use super::handlers::Handlers;

/// One link of the pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once after the chain is assembled.
    fn on_attach(&self, _ctx: &StageContext) {}

    /// Handles an operation travelling down. The default passes it on.
    fn run_op(&self, ctx: &StageContext, op: Operation) {
        ctx.send_op_down(op);
    }

    /// Handles an event travelling up. The default passes it on.
    fn handle_event(&self, ctx: &StageContext, event: Event) {
        ctx.send_event_up(event);
    }

    /// Fails any operations the stage is holding. Called on shutdown.
    fn shutdown(&self, _ctx: &StageContext) {}
}

pub(crate) struct Chain {
    stages: Vec<Box<dyn Stage>>,
    nucleus: Arc<Nucleus>,
    timers: TimerService,
    handlers: RwLock<Handlers>,
    transport: Arc<dyn Transport>,
    shut_down: AtomicBool,
    this: Weak<Chain>,
}

impl Chain {
    pub(crate) fn new(
        stages: Vec<Box<dyn Stage>>,
        nucleus: Arc<Nucleus>,
        timers: TimerService,
        handlers: Handlers,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Chain {
            stages,
            nucleus,
            timers,
            handlers: RwLock::new(handlers),
            transport,
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub(crate) fn context(&self, index: usize) -> StageContext {
        StageContext {
            chain: self.this.clone(),
            index,
        }
    }

    pub(crate) fn attach(&self) {
        for (index, stage) in self.stages.iter().enumerate() {
            stage.on_attach(&self.context(index));
        }
    }

    pub(crate) fn nucleus(&self) -> &Arc<Nucleus> {
        &self.nucleus
    }

    pub(crate) fn handlers(&self) -> &RwLock<Handlers> {
        &self.handlers
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Runs `op` starting at stage `index`.
    pub(crate) fn run_op_at(&self, index: usize, op: Operation) {
        match self.stages.get(index) {
            Some(stage) => {
                trace!(stage = stage.name(), op = %op.name(), id = %op.id(), "run_op");
                stage.run_op(&self.context(index), op);
            }
            None => {
                let name = op.name();
                error!(op = %name, "Operation fell off the bottom of the pipeline");
                op.fail(PipelineError::Pipeline(format!(
                    "{name} was not handled by any stage"
                )));
            }
        }
    }

    pub(crate) fn handle_event_at(&self, index: usize, event: Event) {
        if let Some(stage) = self.stages.get(index) {
            trace!(stage = stage.name(), event = %event.name(), "handle_event");
            stage.handle_event(&self.context(index), event);
        }
    }

    /// Entry point for transport events.
    pub(crate) fn inject_event(&self, event: Event) {
        if self.is_shut_down() {
            debug!(event = %event.name(), "Dropping event after shutdown");
            return;
        }
        if let Some(last) = self.stages.len().checked_sub(1) {
            self.handle_event_at(last, event);
        }
    }

    /// Sends an error nobody is waiting for to the background error handler.
    pub(crate) fn report_background(&self, error: PipelineError) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .on_background_error
            .clone();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                    error!("Background error handler panicked");
                }
            }
            None => error!(error = %error, "Unhandled background error"),
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down pipeline");
        self.timers.shutdown();
        for (index, stage) in self.stages.iter().enumerate() {
            stage.shutdown(&self.context(index));
        }
        self.transport.shutdown();
    }
}

/// A stage's view of the chain.
#[derive(Clone)]
pub struct StageContext {
    chain: Weak<Chain>,
    index: usize,
}

impl StageContext {
    fn chain(&self) -> Option<Arc<Chain>> {
        self.chain.upgrade()
    }

    /// Passes `op` to the next stage down.
    pub fn send_op_down(&self, op: Operation) {
        self.run_op_from(self.index + 1, op);
    }

    /// Re-enters this stage's own `run_op`, for retries.
    pub fn rerun_op(&self, op: Operation) {
        self.run_op_from(self.index, op);
    }

    fn run_op_from(&self, index: usize, op: Operation) {
        match self.chain() {
            Some(chain) if !chain.is_shut_down() => chain.run_op_at(index, op),
            _ => op.fail(PipelineError::OperationCancelled(
                "pipeline is shut down".into(),
            )),
        }
    }

    /// Passes `event` to the next stage up. Events passed up from the top
    /// stage are logged and dropped.
    pub fn send_event_up(&self, event: Event) {
        let Some(chain) = self.chain() else {
            return;
        };
        match self.index.checked_sub(1) {
            Some(above) => chain.handle_event_at(above, event),
            None => warn!(event = %event.name(), "Unhandled event dropped"),
        }
    }

    pub fn nucleus(&self) -> Option<Arc<Nucleus>> {
        self.chain().map(|chain| Arc::clone(chain.nucleus()))
    }

    /// Runs `f` with this context on the timer worker after `delay`.
    ///
    /// The callback is skipped when the pipeline is gone.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Option<TimerHandle>
    where
        F: FnOnce(StageContext) + Send + 'static,
    {
        let chain = self.chain()?;
        let ctx = self.clone();
        Some(chain.timers.schedule(delay, move || {
            if ctx.chain.strong_count() > 0 {
                f(ctx);
            }
        }))
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.chain().map(|chain| Arc::clone(&chain.transport))
    }

    pub fn report_background(&self, error: PipelineError) {
        match self.chain() {
            Some(chain) => chain.report_background(error),
            None => error!(error = %error, "Background error after pipeline was dropped"),
        }
    }

    pub(crate) fn handlers(&self) -> Option<Handlers> {
        self.chain().map(|chain| {
            chain
                .handlers()
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        config::{Credential, PipelineConfig, X509Credential},
        operation::{OpKind, OpResult},
        transport::{EventSink, TransportCallback, TransportRequest},
    };

    struct NullTransport;

    impl Transport for NullTransport {
        fn submit(&self, _request: TransportRequest, _done: TransportCallback) {}

        fn set_event_sink(&self, _sink: EventSink) {}
    }

    fn chain(stages: Vec<Box<dyn Stage>>) -> Arc<Chain> {
        let nucleus = Arc::new(Nucleus::new(
            PipelineConfig::for_device("hub.example.net", "dev1"),
            Credential::X509(X509Credential::new("c", "k")),
        ));
        Chain::new(
            stages,
            nucleus,
            TimerService::new().unwrap(),
            Handlers::default(),
            Arc::new(NullTransport),
        )
    }

    #[test]
    fn test_unhandled_operation_fails_with_its_name() {
        let chain = chain(Vec::new());
        let slot: Arc<Mutex<Option<OpResult>>> = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let op = Operation::new(
            OpKind::Connect,
            Box::new(move |result| *sink.lock().unwrap() = Some(result)),
        );

        chain.run_op_at(0, op);
        let result = slot.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(PipelineError::Pipeline(m)) if m.contains("was not handled")));
    }

    #[test]
    fn test_ops_after_shutdown_are_cancelled() {
        let chain = chain(Vec::new());
        chain.shutdown();
        let slot: Arc<Mutex<Option<OpResult>>> = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let op = Operation::new(
            OpKind::Connect,
            Box::new(move |result| *sink.lock().unwrap() = Some(result)),
        );

        chain.context(0).send_op_down(op);
        assert!(matches!(
            slot.lock().unwrap().take(),
            Some(Err(PipelineError::OperationCancelled(_)))
        ));
    }
}
