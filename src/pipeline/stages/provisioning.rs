//! Device provisioning: registration and status queries.
//!
//! A registration answered with `assigning` is parked here and re-queried
//! after the service's `retry-after` (or [`DEFAULT_POLLING_INTERVAL`]) until
//! it settles. Parked registrations are cancelled by an explicit disconnect.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::PipelineError,
    message::RegistrationResult,
    operation::{OpId, OpKind, OpOutput, OpResult, Operation, RequestType},
    pipeline::chain::{Stage, StageContext},
    timer::TimerHandle,
};

use super::twin::response_body;

/// Wait between status queries when the service does not send `retry-after`.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);

/// Registrations waiting for their next status query, with the timer that
/// sends it.
type Polling = Arc<Mutex<HashMap<OpId, (Operation, Option<TimerHandle>)>>>;

/// Registers with the provisioning service and polls the operation status
/// until the assignment settles.
pub struct RegistrationStage {
    polling: Polling,
}

impl Default for RegistrationStage {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrationStage {
    pub fn new() -> Self {
        Self {
            polling: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cancel_polling(&self, reason: &str) {
        let parked: Vec<_> = self
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, parked)| parked)
            .collect();
        if !parked.is_empty() {
            debug!(count = parked.len(), reason, "Cancelling registrations waiting to poll");
        }
        for (op, timer) in parked {
            if let Some(timer) = timer {
                timer.cancel();
            }
            op.fail(PipelineError::OperationCancelled(reason.into()));
        }
    }
}

fn registration_result(result: OpResult) -> Result<RegistrationResult, PipelineError> {
    let (status_code, body, retry_after) = response_body(result)?;
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PipelineError::Format(format!("registration response: {e}")))?
    };
    Ok(RegistrationResult {
        status_code,
        body,
        retry_after,
    })
}

fn query_request(operation_id: &str) -> OpKind {
    OpKind::RequestAndResponse {
        request_type: RequestType::Query,
        method: "GET".into(),
        resource_location: operation_id.to_string(),
        body: Bytes::new(),
    }
}

/// Completes `parent`, or parks it and schedules the next status query while
/// the service is still assigning.
fn handle_response(
    ctx: StageContext,
    polling: Polling,
    parent: Operation,
    result: OpResult,
) {
    let result = match registration_result(result) {
        Ok(result) => result,
        Err(e) => return parent.fail(e),
    };
    let operation_id = match (result.status(), result.operation_id()) {
        (Some("assigning"), Some(id)) => id.to_string(),
        _ => {
            info!(status = ?result.status(), "Registration finished");
            return parent.complete(Ok(OpOutput::Registration(result)));
        }
    };

    let delay = result
        .retry_after
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLLING_INTERVAL);
    debug!(operation_id = %operation_id, delay_secs = delay.as_secs(), "Registration still assigning; polling");

    let parent_id = parent.id();
    polling
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(parent_id, (parent, None));

    let waiting = Arc::clone(&polling);
    let timer = ctx.schedule(delay, move |ctx| {
        let parked = waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&parent_id);
        let Some((parent, _)) = parked else {
            return;
        };
        let next = Arc::clone(&waiting);
        let retry_ctx = ctx.clone();
        let query = Operation::new(
            query_request(&operation_id),
            Box::new(move |result| handle_response(retry_ctx, next, parent, result)),
        );
        ctx.send_op_down(query);
    });
    // The entry is gone already if the timer fired or a disconnect drained it.
    if let Some((_, slot)) = polling
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(&parent_id)
    {
        *slot = timer;
    }
}

impl Stage for RegistrationStage {
    fn name(&self) -> &'static str {
        "registration"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        match op.kind() {
            OpKind::Register {
                registration_id,
                payload,
            } => {
                let body = json!({
                    "registrationId": registration_id,
                    "payload": payload,
                });
                let body = match serde_json::to_vec(&body) {
                    Ok(body) => Bytes::from(body),
                    Err(e) => return op.fail(PipelineError::Format(e.to_string())),
                };
                info!(registration_id = %registration_id, "Registering with provisioning service");
                let request = OpKind::RequestAndResponse {
                    request_type: RequestType::Register,
                    method: "PUT".into(),
                    resource_location: "/".into(),
                    body,
                };
                let polling = Arc::clone(&self.polling);
                let response_ctx = ctx.clone();
                let child = Operation::new(
                    request,
                    Box::new(move |result| handle_response(response_ctx, polling, op, result)),
                );
                ctx.send_op_down(child);
            }
            OpKind::QueryRegistration { operation_id } => {
                let request = query_request(operation_id);
                let child = Operation::delegate(op, request, |result| {
                    registration_result(result).map(OpOutput::Registration)
                });
                ctx.send_op_down(child);
            }
            OpKind::Disconnect => {
                self.cancel_polling("Explicit disconnect invoked");
                ctx.send_op_down(op);
            }
            _ => ctx.send_op_down(op),
        }
    }

    fn shutdown(&self, _ctx: &StageContext) {
        self.cancel_polling("pipeline is shut down");
    }
}
