//! Device twin operations expressed as requests and responses.

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{PipelineError, ServiceError},
    operation::{OpKind, OpOutput, OpResult, Operation, RequestType},
    pipeline::chain::{Stage, StageContext},
};

/// Turns twin operations into request/response exchanges.
pub struct TwinRequestResponseStage;

/// Extracts the body of a successful `Response`, mapping failure statuses
/// to service errors.
pub(crate) fn response_body(result: OpResult) -> Result<(u16, Bytes, Option<u64>), PipelineError> {
    match result? {
        OpOutput::Response {
            status_code,
            body,
            retry_after,
        } => {
            ServiceError::check_status(status_code, String::from_utf8_lossy(&body))?;
            Ok((status_code, body, retry_after))
        }
        other => Err(PipelineError::Pipeline(format!(
            "expected a response, got {other:?}"
        ))),
    }
}

fn parse_twin(body: &[u8]) -> Result<Value, PipelineError> {
    serde_json::from_slice(body).map_err(|e| PipelineError::Format(format!("twin document: {e}")))
}

impl Stage for TwinRequestResponseStage {
    fn name(&self) -> &'static str {
        "twin_request_response"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        match op.kind() {
            OpKind::GetTwin => {
                debug!(op = %op.name(), "Translating GetTwin into a request");
                let child = Operation::delegate(
                    op,
                    OpKind::RequestAndResponse {
                        request_type: RequestType::Twin,
                        method: "GET".into(),
                        resource_location: "/".into(),
                        body: Bytes::new(),
                    },
                    |result| {
                        let (_, body, _) = response_body(result)?;
                        Ok(OpOutput::Twin(parse_twin(&body)?))
                    },
                );
                ctx.send_op_down(child);
            }
            OpKind::PatchTwinReportedProperties(patch) => {
                let body = match serde_json::to_vec(patch) {
                    Ok(body) => Bytes::from(body),
                    Err(e) => return op.fail(PipelineError::Format(e.to_string())),
                };
                let child = Operation::delegate(
                    op,
                    OpKind::RequestAndResponse {
                        request_type: RequestType::Twin,
                        method: "PATCH".into(),
                        resource_location: "/properties/reported/".into(),
                        body,
                    },
                    |result| response_body(result).map(|_| OpOutput::Empty),
                );
                ctx.send_op_down(child);
            }
            _ => ctx.send_op_down(op),
        }
    }
}
