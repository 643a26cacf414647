//! Events: notifications that travel up the pipeline.
//!
//! Events originate at the transport (connection changes, inbound publishes)
//! and are translated by stages on the way up. Whatever reaches the top is
//! dispatched to the application's handlers.

use bytes::Bytes;
use serde_json::Value;

use crate::{
    error::PipelineError,
    message::{Message, MethodRequest, RegistrationResult},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A cloud-to-device message.
    IncomingMessage(Message),
    /// A message delivered to a module input.
    IncomingInputMessage { input_name: String, message: Message },
    IncomingMethodRequest(MethodRequest),
    TwinDesiredPropertiesPatch(Value),
    /// A provisioning response no pending request was waiting for.
    RegistrationResponse {
        request_id: String,
        result: RegistrationResult,
    },

    /// The transport reached `Connected`.
    Connected,
    /// The connection ended. `cause` is `None` for an explicit disconnect.
    Disconnected { cause: Option<PipelineError> },
    /// The transport dropped the connection because the credential was refused.
    CredentialRejected(PipelineError),
    /// A raw publish received by the transport.
    IncomingPublish { topic: String, payload: Bytes },
    /// A twin response correlated by request id.
    Response {
        request_id: String,
        status_code: u16,
        body: Bytes,
        retry_after: Option<u64>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::IncomingMessage(_) => "IncomingMessage",
            Event::IncomingInputMessage { .. } => "IncomingInputMessage",
            Event::IncomingMethodRequest(_) => "IncomingMethodRequest",
            Event::TwinDesiredPropertiesPatch(_) => "TwinDesiredPropertiesPatch",
            Event::RegistrationResponse { .. } => "RegistrationResponse",
            Event::Connected => "Connected",
            Event::Disconnected { .. } => "Disconnected",
            Event::CredentialRejected(_) => "CredentialRejected",
            Event::IncomingPublish { .. } => "IncomingPublish",
            Event::Response { .. } => "Response",
        }
    }
}
