//! Operations: units of work that travel down the pipeline.
//!
//! An [`Operation`] carries an [`OpKind`] (what to do), a stack of
//! interceptors pushed by stages on the way down, and the submitter's
//! completion callback. Completing an operation runs interceptors
//! last-pushed-first; each interceptor receives the operation back and
//! decides whether to pass the result on by calling
//! [`Operation::complete`] again, or to keep the operation (for example to
//! retry it later). Because `complete` consumes the operation, the final
//! callback runs at most once.
//!
//! # Examples
//!
//! ```ignore
//! let mut op = Operation::new(OpKind::GetTwin, Box::new(|result| println!("{result:?}")));
//! op.add_callback(|op, result| {
//!     tracing::debug!(op = %op.name(), ok = result.is_ok(), "completed");
//!     op.complete(result);
//! });
//! ctx.send_op_down(op);
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    bridge::{Completion, ResultField},
    error::PipelineError,
    message::{Message, MethodParams, MethodResponse, MethodResult, RegistrationResult, StorageInfo},
};

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    fn next() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving features that are turned on by subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Cloud-to-device messages.
    C2d,
    /// Messages routed to module inputs.
    Input,
    /// Direct method requests.
    Methods,
    /// Twin get/patch responses.
    Twin,
    /// Desired property patches.
    TwinPatches,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::C2d => "c2d",
            Feature::Input => "input",
            Feature::Methods => "methods",
            Feature::Twin => "twin",
            Feature::TwinPatches => "twin_patches",
        }
    }
}

/// What an operation asks the pipeline to do.
///
/// The first group is the public surface; the rest are produced by stages
/// while translating the public kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Connect,
    Disconnect,
    /// Disconnect, then connect again.
    Reconnect,
    EnableFeature(Feature),
    DisableFeature(Feature),
    SendTelemetry(Message),
    SendOutputEvent {
        output_name: String,
        message: Message,
    },
    SendMethodResponse(MethodResponse),
    GetTwin,
    PatchTwinReportedProperties(Value),
    /// Invoke a direct method on another device or module over HTTP.
    InvokeMethod {
        device_id: String,
        module_id: Option<String>,
        params: MethodParams,
    },
    /// Ask the hub for a blob upload target.
    GetStorageInfo {
        blob_name: String,
    },
    /// Report the outcome of a blob upload.
    NotifyUploadStatus {
        correlation_id: String,
        is_success: bool,
        status_code: u16,
        description: String,
    },
    /// Register with the provisioning service and poll until assigned.
    Register {
        registration_id: String,
        payload: Option<Value>,
    },
    /// Query the status of a registration once.
    QueryRegistration {
        operation_id: String,
    },

    /// Tear down and re-establish the connection with the current credential.
    Reauthorize,
    /// A request answered by a correlated response event.
    RequestAndResponse {
        request_type: RequestType,
        method: String,
        resource_location: String,
        body: Bytes,
    },
    /// One send of a `RequestAndResponse`, tagged with its request id.
    Request {
        request_type: RequestType,
        method: String,
        resource_location: String,
        body: Bytes,
        request_id: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    HttpRequest {
        method: String,
        path: String,
        query: String,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
}

/// Which service a request/response exchange targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Twin,
    Register,
    /// Registration status query; the resource location carries the operation id.
    Query,
}

impl OpKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Connect => "Connect",
            OpKind::Disconnect => "Disconnect",
            OpKind::Reconnect => "Reconnect",
            OpKind::EnableFeature(_) => "EnableFeature",
            OpKind::DisableFeature(_) => "DisableFeature",
            OpKind::SendTelemetry(_) => "SendTelemetry",
            OpKind::SendOutputEvent { .. } => "SendOutputEvent",
            OpKind::SendMethodResponse(_) => "SendMethodResponse",
            OpKind::GetTwin => "GetTwin",
            OpKind::PatchTwinReportedProperties(_) => "PatchTwinReportedProperties",
            OpKind::InvokeMethod { .. } => "InvokeMethod",
            OpKind::GetStorageInfo { .. } => "GetStorageInfo",
            OpKind::NotifyUploadStatus { .. } => "NotifyUploadStatus",
            OpKind::Register { .. } => "Register",
            OpKind::QueryRegistration { .. } => "QueryRegistration",
            OpKind::Reauthorize => "Reauthorize",
            OpKind::RequestAndResponse { .. } => "RequestAndResponse",
            OpKind::Request { .. } => "Request",
            OpKind::Publish { .. } => "Publish",
            OpKind::Subscribe { .. } => "Subscribe",
            OpKind::Unsubscribe { .. } => "Unsubscribe",
            OpKind::HttpRequest { .. } => "HttpRequest",
        }
    }

    /// Whether the operation can only run over an established connection.
    ///
    /// HTTP operations and the connection-management kinds do not.
    pub fn needs_connection(&self) -> bool {
        !matches!(
            self,
            OpKind::Connect
                | OpKind::Disconnect
                | OpKind::Reconnect
                | OpKind::Reauthorize
                | OpKind::InvokeMethod { .. }
                | OpKind::GetStorageInfo { .. }
                | OpKind::NotifyUploadStatus { .. }
                | OpKind::HttpRequest { .. }
        )
    }

    /// Connection-management kinds serialized by the connection lock.
    pub fn is_connection_change(&self) -> bool {
        matches!(
            self,
            OpKind::Connect | OpKind::Disconnect | OpKind::Reauthorize
        )
    }
}

/// The successful result of an operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpOutput {
    #[default]
    Empty,
    Twin(Value),
    MethodResult(MethodResult),
    StorageInfo(StorageInfo),
    Registration(RegistrationResult),
    /// Raw answer to a `RequestAndResponse`.
    Response {
        status_code: u16,
        body: Bytes,
        retry_after: Option<u64>,
    },
    Http {
        status_code: u16,
        body: Bytes,
    },
}

impl OpOutput {
    pub fn field_name(&self) -> &'static str {
        match self {
            OpOutput::Empty => "",
            OpOutput::Twin(_) => "twin",
            OpOutput::MethodResult(_) => "method_result",
            OpOutput::StorageInfo(_) => "storage_info",
            OpOutput::Registration(_) => "registration_result",
            OpOutput::Response { .. } => "response",
            OpOutput::Http { .. } => "http_response",
        }
    }
}

impl ResultField for OpOutput {
    fn has_field(&self, name: &str) -> bool {
        !name.is_empty() && self.field_name() == name
    }
}

pub type OpResult = Result<OpOutput, PipelineError>;

type Interceptor = Box<dyn FnOnce(Operation, OpResult) + Send + 'static>;

/// A unit of work in flight through the pipeline.
pub struct Operation {
    id: OpId,
    kind: OpKind,
    interceptors: Vec<Interceptor>,
    completion: Option<Completion<OpOutput>>,
}

impl Operation {
    pub fn new(kind: OpKind, completion: Completion<OpOutput>) -> Self {
        Self {
            id: OpId::next(),
            kind,
            interceptors: Vec::new(),
            completion: Some(completion),
        }
    }

    /// An operation created by a stage with nobody waiting on it.
    ///
    /// Failures are logged at debug level.
    pub fn internal(kind: OpKind) -> Self {
        Self {
            id: OpId::next(),
            kind,
            interceptors: Vec::new(),
            completion: None,
        }
    }

    /// Creates a child operation that completes `parent` with its
    /// result mapped through `map`.
    pub fn delegate<F>(parent: Operation, kind: OpKind, map: F) -> Self
    where
        F: FnOnce(OpResult) -> OpResult + Send + 'static,
    {
        Self::new(kind, Box::new(move |result| parent.complete(map(result))))
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn needs_connection(&self) -> bool {
        self.kind.needs_connection()
    }

    /// Pushes an interceptor that runs before any previously pushed one.
    pub fn add_callback<F>(&mut self, f: F)
    where
        F: FnOnce(Operation, OpResult) + Send + 'static,
    {
        self.interceptors.push(Box::new(f));
    }

    /// Delivers `result` to the most recent interceptor, or to the
    /// submitter once none remain.
    pub fn complete(mut self, result: OpResult) {
        if let Some(interceptor) = self.interceptors.pop() {
            interceptor(self, result);
            return;
        }
        match self.completion.take() {
            Some(completion) => completion(result),
            None => {
                if let Err(e) = &result {
                    debug!(op = %self.kind.name(), id = %self.id, error = %e, "Internal operation failed");
                }
            }
        }
    }

    pub fn complete_ok(self) {
        self.complete(Ok(OpOutput::Empty))
    }

    pub fn fail(self, error: PipelineError) {
        self.complete(Err(error))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.completion.is_some() && !std::thread::panicking() {
            warn!(op = %self.kind.name(), id = %self.id, "Operation dropped without completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<OpResult>>>, Completion<OpOutput>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (results, Box::new(move |r| sink.lock().unwrap().push(r)))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Operation::internal(OpKind::Connect);
        let b = Operation::internal(OpKind::Connect);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_interceptors_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (results, completion) = recorder();
        let mut op = Operation::new(OpKind::GetTwin, completion);
        for n in 1..=3 {
            let order = order.clone();
            op.add_callback(move |op, r| {
                order.lock().unwrap().push(n);
                op.complete(r);
            });
        }
        op.complete_ok();
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_interceptor_can_halt_and_resume() {
        let (results, completion) = recorder();
        let held = Arc::new(Mutex::new(None));
        let mut op = Operation::new(OpKind::GetTwin, completion);
        let slot = held.clone();
        op.add_callback(move |op, _| {
            *slot.lock().unwrap() = Some(op);
        });
        op.fail(PipelineError::NotConnected);
        assert!(results.lock().unwrap().is_empty());

        let op = held.lock().unwrap().take().unwrap();
        op.complete(Ok(OpOutput::Twin(serde_json::json!({}))));
        let results = results.lock().unwrap();
        assert!(matches!(results[0], Ok(OpOutput::Twin(_))));
    }

    #[test]
    fn test_delegate_maps_result() {
        let (results, completion) = recorder();
        let parent = Operation::new(OpKind::GetTwin, completion);
        let child = Operation::delegate(parent, OpKind::Subscribe { topic: "t".into() }, |r| {
            r.map(|_| OpOutput::Twin(Value::Null))
        });
        child.complete_ok();
        assert_eq!(
            *results.lock().unwrap(),
            vec![Ok(OpOutput::Twin(Value::Null))]
        );
    }

    #[test]
    fn test_needs_connection() {
        assert!(OpKind::GetTwin.needs_connection());
        assert!(OpKind::SendTelemetry(Message::new("x")).needs_connection());
        assert!(!OpKind::Connect.needs_connection());
        assert!(!OpKind::GetStorageInfo { blob_name: "b".into() }.needs_connection());
    }

    #[test]
    fn test_result_field() {
        assert!(OpOutput::Twin(Value::Null).has_field("twin"));
        assert!(!OpOutput::Empty.has_field("twin"));
        assert!(!OpOutput::Empty.has_field(""));
    }
}
