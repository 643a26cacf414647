//! Request/response correlation.
//!
//! Each request gets a fresh request id and waits in a pending map until the
//! matching response event arrives. Requests still pending when the
//! connection comes back are sent again.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::PipelineError,
    event::Event,
    operation::{OpKind, OpOutput, Operation, RequestType},
    pipeline::chain::{Stage, StageContext},
};

struct PendingRequest {
    op: Operation,
    request_type: RequestType,
    method: String,
    resource_location: String,
    body: Bytes,
    /// The request reached the transport on the current connection.
    sent: bool,
}

impl PendingRequest {
    fn request(&self, request_id: &str) -> OpKind {
        OpKind::Request {
            request_type: self.request_type,
            method: self.method.clone(),
            resource_location: self.resource_location.clone(),
            body: self.body.clone(),
            request_id: request_id.to_string(),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Correlates requests with response events by request id.
///
/// A `RequestAndResponse` stays pending until a response with its id
/// arrives. Pending requests survive a dropped connection and are sent
/// again on reconnect; an explicit disconnect cancels them.
pub struct CoordinateRequestAndResponseStage {
    pending: PendingMap,
}

impl Default for CoordinateRequestAndResponseStage {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateRequestAndResponseStage {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn send_request(ctx: &StageContext, pending: &PendingMap, request_id: String, kind: OpKind) {
        let pending = Arc::clone(pending);
        let rid = request_id.clone();
        let request = Operation::new(
            kind,
            Box::new(move |result| {
                let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
                match result {
                    Ok(_) => {
                        if let Some(waiting) = map.get_mut(&rid) {
                            waiting.sent = true;
                        }
                    }
                    Err(e) => {
                        let waiting = map.remove(&rid);
                        drop(map);
                        if let Some(waiting) = waiting {
                            waiting.op.fail(e);
                        }
                    }
                }
            }),
        );
        debug!(request_id = %request_id, "Sending request");
        ctx.send_op_down(request);
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id)
    }

    fn cancel_all(&self, reason: &str) {
        let cancelled: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending.op)
            .collect();
        for op in cancelled {
            op.fail(PipelineError::OperationCancelled(reason.to_string()));
        }
    }
}

impl Stage for CoordinateRequestAndResponseStage {
    fn name(&self) -> &'static str {
        "coordinate_request_and_response"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        match op.kind() {
            OpKind::RequestAndResponse {
                request_type,
                method,
                resource_location,
                body,
            } => {
                let request_id = Uuid::new_v4().to_string();
                let entry = PendingRequest {
                    request_type: *request_type,
                    method: method.clone(),
                    resource_location: resource_location.clone(),
                    body: body.clone(),
                    sent: false,
                    op,
                };
                let kind = entry.request(&request_id);
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(request_id.clone(), entry);
                Self::send_request(ctx, &self.pending, request_id, kind);
            }
            OpKind::Disconnect => {
                self.cancel_all("Explicit disconnect invoked");
                ctx.send_op_down(op);
            }
            _ => ctx.send_op_down(op),
        }
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        match event {
            Event::Response {
                request_id,
                status_code,
                body,
                retry_after,
            } => match self.take_pending(&request_id) {
                Some(pending) => pending.op.complete(Ok(OpOutput::Response {
                    status_code,
                    body,
                    retry_after,
                })),
                None => warn!(request_id = %request_id, "Response does not match any pending request"),
            },
            Event::RegistrationResponse { request_id, result } => {
                match self.take_pending(&request_id) {
                    Some(pending) => pending.op.complete(Ok(OpOutput::Response {
                        status_code: result.status_code,
                        body: Bytes::from(result.body.to_string()),
                        retry_after: result.retry_after,
                    })),
                    None => ctx.send_event_up(Event::RegistrationResponse { request_id, result }),
                }
            }
            Event::Connected => {
                let resend: Vec<_> = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter_mut()
                    .filter(|(_, pending)| pending.sent)
                    .map(|(rid, pending)| {
                        pending.sent = false;
                        (rid.clone(), pending.request(rid))
                    })
                    .collect();
                if !resend.is_empty() {
                    info!(count = resend.len(), "Re-sending pending requests after reconnect");
                }
                ctx.send_event_up(Event::Connected);
                for (request_id, kind) in resend {
                    Self::send_request(ctx, &self.pending, request_id, kind);
                }
            }
            other => ctx.send_event_up(other),
        }
    }

    fn shutdown(&self, _ctx: &StageContext) {
        self.cancel_all("pipeline is shut down");
    }
}

