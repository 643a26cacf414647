//! Application callbacks invoked from the top of the pipeline.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    error::PipelineError,
    message::{Message, MethodRequest, RegistrationResult},
    state::ConnectionState,
};

pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub type InputMessageHandler = Arc<dyn Fn(String, Message) + Send + Sync>;
pub type MethodRequestHandler = Arc<dyn Fn(MethodRequest) + Send + Sync>;
pub type TwinPatchHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type RegistrationHandler = Arc<dyn Fn(RegistrationResult) + Send + Sync>;
pub type BackgroundErrorHandler = Arc<dyn Fn(PipelineError) + Send + Sync>;

/// The handler table. Unset handlers mean the event is logged and dropped.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_connection_state_changed: Option<StateHandler>,
    pub on_message: Option<MessageHandler>,
    pub on_input_message: Option<InputMessageHandler>,
    pub on_method_request: Option<MethodRequestHandler>,
    pub on_twin_patch: Option<TwinPatchHandler>,
    pub on_registration_response: Option<RegistrationHandler>,
    /// Receives errors from background work: token renewal, reconnects,
    /// and panicking handlers. Defaults to logging at error level.
    pub on_background_error: Option<BackgroundErrorHandler>,
}
