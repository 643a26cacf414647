//! SAS token renewal and re-authorization.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{debug, info, instrument, warn};

use crate::{
    error::PipelineError,
    event::Event,
    operation::{OpKind, Operation},
    pipeline::chain::{Stage, StageContext},
    sastoken::SasTokenManager,
    timer::TimerHandle,
};

/// Refreshes the SAS token `margin` before it expires and re-authorizes the
/// connection with the new token.
pub struct SasTokenRenewalStage {
    shared: Arc<RenewalShared>,
}

struct RenewalShared {
    manager: Option<Arc<SasTokenManager>>,
    margin: Duration,
    timer: Mutex<Option<TimerHandle>>,
}

impl SasTokenRenewalStage {
    pub fn new(manager: Option<Arc<SasTokenManager>>, margin: Duration) -> Self {
        Self {
            shared: Arc::new(RenewalShared {
                manager,
                margin,
                timer: Mutex::new(None),
            }),
        }
    }
}

impl RenewalShared {
    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.cancel();
        }
    }

    fn schedule(self: &Arc<Self>, ctx: &StageContext) {
        let Some(manager) = self.manager.as_ref().filter(|m| m.is_renewable()) else {
            return;
        };
        let delay = match manager.renewal_delay(self.margin) {
            Ok(delay) => delay,
            Err(e) => {
                warn!(error = %e, "SAS token renewal cannot be scheduled");
                ctx.report_background(e);
                return;
            }
        };
        debug!(delay_secs = delay.as_secs(), "Scheduling SAS token renewal");
        let shared = Arc::clone(self);
        let handle = ctx.schedule(delay, move |ctx| shared.renew(&ctx));
        self.cancel_timer();
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    #[instrument(skip_all)]
    fn renew(self: &Arc<Self>, ctx: &StageContext) {
        let Some(manager) = &self.manager else {
            return;
        };
        match manager.refresh() {
            Ok(token) => {
                info!(expiry = token.expiry(), "SAS token renewed");
                self.schedule(ctx);
                let connected = ctx.nucleus().is_some_and(|n| n.connected());
                if connected {
                    let mut op = Operation::internal(OpKind::Reauthorize);
                    let report = ctx.clone();
                    op.add_callback(move |op, result| {
                        if let Err(e) = &result {
                            report.report_background(e.clone());
                        }
                        op.complete(result);
                    });
                    ctx.send_op_down(op);
                }
            }
            Err(e) => {
                warn!(error = %e, "SAS token renewal failed");
                ctx.report_background(e);
            }
        }
    }
}

impl Stage for SasTokenRenewalStage {
    fn name(&self) -> &'static str {
        "sastoken_renewal"
    }

    fn on_attach(&self, ctx: &StageContext) {
        self.shared.schedule(ctx);
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        match event {
            Event::CredentialRejected(cause) => match &self.shared.manager {
                Some(manager) if manager.is_renewable() => {
                    info!(cause = %cause, "Credential rejected; refreshing SAS token");
                    match manager.refresh() {
                        Ok(_) => self.shared.schedule(ctx),
                        Err(e) => ctx.report_background(e),
                    }
                }
                _ => ctx.report_background(PipelineError::Credential(format!(
                    "credential rejected and cannot be renewed: {cause}"
                ))),
            },
            other => ctx.send_event_up(other),
        }
    }

    fn shutdown(&self, _ctx: &StageContext) {
        self.shared.cancel_timer();
    }
}
