//! Device provisioning topics.
//!
//! ```text
//! publish   $dps/registrations/PUT/iotdps-register/?$rid=<rid>
//! publish   $dps/registrations/GET/iotdps-get-operationstatus/?$rid=<rid>&operationId=<id>
//! subscribe $dps/registrations/res/#
//! response  $dps/registrations/res/<status>/?$rid=<rid>&retry-after=<seconds>
//! ```

use std::collections::HashMap;

use crate::{
    encoding::{quote, unquote},
    error::PipelineError,
};

const TOPIC_BASE: &str = "$dps/registrations/";
const RESPONSE_PREFIX: &str = "$dps/registrations/res/";

/// Filter that receives every provisioning response.
pub const SUBSCRIBE_FILTER: &str = "$dps/registrations/res/#";

/// Index of the status code after splitting on `$` and then `/`.
const STATUS_CODE_SEGMENT: usize = 3;

/// Topic for a registration request.
pub fn encode_register_topic(request_id: &str) -> String {
    format!("{TOPIC_BASE}PUT/iotdps-register/?$rid={}", quote(request_id))
}

/// Topic for an operation status query.
pub fn encode_query_topic(request_id: &str, operation_id: &str) -> String {
    format!(
        "{TOPIC_BASE}GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        quote(request_id),
        quote(operation_id)
    )
}

pub fn is_response_topic(topic: &str) -> bool {
    topic.contains(RESPONSE_PREFIX)
}

/// Extracts the status code segment of a response topic.
///
/// # Errors
///
/// `MalformedTopic` when the topic has too few segments.
pub fn decode_status_code(topic: &str) -> Result<String, PipelineError> {
    topic
        .split('$')
        .nth(1)
        .and_then(|path| path.split('/').nth(STATUS_CODE_SEGMENT))
        .map(unquote)
        .ok_or_else(|| PipelineError::MalformedTopic(topic.to_string()))
}

/// Extracts the `key=value` pairs after the `?$` of a response topic.
///
/// # Errors
///
/// - `MalformedTopic` when there is no property section or a pair has no `=`
/// - `DuplicateProperty` when a key repeats
pub fn decode_properties(topic: &str) -> Result<HashMap<String, String>, PipelineError> {
    let section = topic
        .split('$')
        .nth(2)
        .ok_or_else(|| PipelineError::MalformedTopic(topic.to_string()))?;
    super::split_properties(section, false, topic)
}

/// A decoded provisioning response topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningResponse {
    pub status_code: u16,
    pub request_id: String,
    pub retry_after: Option<u64>,
    pub properties: HashMap<String, String>,
}

/// Decodes status, request id and `retry-after` in one pass.
pub fn decode_response(topic: &str) -> Result<ProvisioningResponse, PipelineError> {
    let status_code = decode_status_code(topic)?
        .parse::<u16>()
        .map_err(|_| PipelineError::MalformedTopic(topic.to_string()))?;
    let properties = decode_properties(topic)?;
    let request_id = properties
        .get("rid")
        .cloned()
        .ok_or_else(|| PipelineError::MalformedTopic(topic.to_string()))?;
    let retry_after = properties
        .get("retry-after")
        .and_then(|v| v.parse::<u64>().ok());
    Ok(ProvisioningResponse {
        status_code,
        request_id,
        retry_after,
        properties,
    })
}
