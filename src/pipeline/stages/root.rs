//! Top of the chain: delivers events to the application's handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::{
    error::PipelineError,
    event::Event,
    pipeline::chain::{Stage, StageContext},
};

/// Top of the chain: hands events to the application's handlers.
///
/// Handler panics are caught and reported to the background error handler.
pub struct RootStage;

impl RootStage {
    fn invoke<F: FnOnce()>(ctx: &StageContext, what: &'static str, f: F) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            ctx.report_background(PipelineError::Pipeline(format!("{what} handler panicked")));
        }
    }
}

impl Stage for RootStage {
    fn name(&self) -> &'static str {
        "root"
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        let Some(handlers) = ctx.handlers() else {
            return;
        };
        let name = event.name();
        match event {
            Event::Connected | Event::Disconnected { .. } => {
                let Some(nucleus) = ctx.nucleus() else {
                    return;
                };
                let state = nucleus.connection_state();
                if let Some(handler) = handlers.on_connection_state_changed {
                    Self::invoke(ctx, "connection state", || handler(state));
                }
            }
            Event::IncomingMessage(message) => match handlers.on_message {
                Some(handler) => Self::invoke(ctx, "message", || handler(message)),
                None => warn!(event = name, "No message handler set; message dropped"),
            },
            Event::IncomingInputMessage {
                input_name,
                message,
            } => match handlers.on_input_message {
                Some(handler) => Self::invoke(ctx, "input message", || handler(input_name, message)),
                None => warn!(event = name, input = %input_name, "No input message handler set; message dropped"),
            },
            Event::IncomingMethodRequest(request) => match handlers.on_method_request {
                Some(handler) => Self::invoke(ctx, "method request", || handler(request)),
                None => warn!(event = name, method = %request.name, "No method request handler set; request dropped"),
            },
            Event::TwinDesiredPropertiesPatch(patch) => match handlers.on_twin_patch {
                Some(handler) => Self::invoke(ctx, "twin patch", || handler(patch)),
                None => warn!(event = name, "No twin patch handler set; patch dropped"),
            },
            Event::RegistrationResponse { request_id, result } => {
                match handlers.on_registration_response {
                    Some(handler) => Self::invoke(ctx, "registration response", || handler(result)),
                    None => debug!(event = name, request_id = %request_id, "Unsolicited registration response dropped"),
                }
            }
            Event::CredentialRejected(e) => {
                ctx.report_background(e);
            }
            other => {
                debug!(event = other.name(), "Unhandled event dropped");
            }
        }
    }
}
