//! Operations served over HTTPS: direct method invocation and file upload
//! bookkeeping.

use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::{
    config::{Credential, PipelineConfig},
    error::{PipelineError, ServiceError},
    message::{MethodResult, StorageInfo},
    operation::{OpKind, OpOutput, OpResult, Operation},
    pipeline::chain::{Stage, StageContext},
};

/// Translates hub HTTP operations into `HttpRequest`s.
pub struct HttpTranslationStage {
    hostname: String,
    device_id: String,
    module_id: Option<String>,
    user_agent: String,
    credential: Credential,
}

impl HttpTranslationStage {
    pub fn new(config: &PipelineConfig, credential: Credential) -> Self {
        Self {
            hostname: config.connect_hostname().to_string(),
            device_id: config.device_id.clone(),
            module_id: config.module_id.clone(),
            user_agent: config.user_agent(),
            credential,
        }
    }

    fn headers(&self, content_type: &str, body: &[u8]) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Host".to_string(), self.hostname.clone()),
            ("Content-Type".to_string(), content_type.to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
            ("User-Agent".to_string(), self.user_agent.clone()),
        ];
        if let Some(token) = self.credential.password() {
            headers.push(("Authorization".to_string(), token));
        }
        headers
    }

    fn request(&self, path: String, headers: Vec<(String, String)>, body: Vec<u8>) -> OpKind {
        OpKind::HttpRequest {
            method: "POST".into(),
            path,
            query: format!("api-version={}", crate::IOTHUB_API_VERSION),
            headers,
            body: Bytes::from(body),
        }
    }

    fn method_invoke(&self, device_id: &str, module_id: Option<&str>, body: Vec<u8>) -> OpKind {
        let path = match module_id {
            Some(module_id) => format!("/twins/{device_id}/modules/{module_id}/methods"),
            None => format!("/twins/{device_id}/methods"),
        };
        let mut headers = self.headers("application/json", &body);
        let caller = match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        };
        headers.push(("x-ms-edge-moduleId".to_string(), caller));
        self.request(path, headers, body)
    }
}

/// Body of a successful HTTP response; failure statuses become service errors.
fn http_body(result: OpResult) -> Result<Bytes, PipelineError> {
    match result? {
        OpOutput::Http { status_code, body } => {
            ServiceError::check_status(status_code, String::from_utf8_lossy(&body))?;
            Ok(body)
        }
        other => Err(PipelineError::Pipeline(format!(
            "expected an HTTP response, got {other:?}"
        ))),
    }
}

fn json_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, PipelineError> {
    serde_json::from_slice(body).map_err(|e| PipelineError::Format(e.to_string()))
}

impl Stage for HttpTranslationStage {
    fn name(&self) -> &'static str {
        "http_translation"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        let encoded = match op.kind() {
            OpKind::InvokeMethod {
                device_id,
                module_id,
                params,
            } => serde_json::to_vec(params)
                .map(|body| self.method_invoke(device_id, module_id.as_deref(), body)),
            OpKind::GetStorageInfo { blob_name } => {
                serde_json::to_vec(&json!({ "blobName": blob_name })).map(|body| {
                    let mut headers = self.headers("application/json", &body);
                    headers.push(("Accept".to_string(), "application/json".to_string()));
                    self.request(format!("/devices/{}/files", self.device_id), headers, body)
                })
            }
            OpKind::NotifyUploadStatus {
                correlation_id,
                is_success,
                status_code,
                description,
            } => serde_json::to_vec(&json!({
                "correlationId": correlation_id,
                "isSuccess": is_success,
                "statusCode": status_code,
                "statusDescription": description,
            }))
            .map(|body| {
                let headers = self.headers("application/json; charset=utf-8", &body);
                self.request(
                    format!("/devices/{}/files/notifications", self.device_id),
                    headers,
                    body,
                )
            }),
            _ => return ctx.send_op_down(op),
        };
        let request = match encoded {
            Ok(request) => request,
            Err(e) => return op.fail(PipelineError::Format(e.to_string())),
        };

        debug!(op = %op.name(), "Translating into an HTTP request");
        let child = match op.kind() {
            OpKind::InvokeMethod { .. } => Operation::delegate(op, request, |result| {
                let body = http_body(result)?;
                Ok(OpOutput::MethodResult(json_body::<MethodResult>(&body)?))
            }),
            OpKind::GetStorageInfo { .. } => Operation::delegate(op, request, |result| {
                let body = http_body(result)?;
                Ok(OpOutput::StorageInfo(json_body::<StorageInfo>(&body)?))
            }),
            _ => Operation::delegate(op, request, |result| http_body(result).map(|_| OpOutput::Empty)),
        };
        ctx.send_op_down(child);
    }
}
