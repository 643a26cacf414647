//! Device and module topics.
//!
//! ```text
//! devices/<d>[/modules/<m>]/messages/events/<properties>   telemetry and outputs
//! devices/<d>/messages/devicebound/<properties>           cloud-to-device
//! devices/<d>/modules/<m>/inputs/<input>/<properties>     module input
//! $iothub/methods/POST/<method>/?$rid=<rid>               method request
//! $iothub/methods/res/<status>/?$rid=<rid>                method response
//! $iothub/twin/<METHOD><resource>?$rid=<rid>              twin request
//! $iothub/twin/res/<status>/?$rid=<rid>                   twin response
//! $iothub/twin/PATCH/properties/desired/?$version=<v>     desired property patch
//! ```

use std::collections::HashMap;

use crate::{
    encoding::{quote, unquote},
    error::PipelineError,
    message::Message,
};

pub const METHOD_SUBSCRIBE_FILTER: &str = "$iothub/methods/POST/#";
pub const TWIN_RESPONSE_SUBSCRIBE_FILTER: &str = "$iothub/twin/res/#";
pub const TWIN_PATCH_SUBSCRIBE_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

const METHOD_PREFIX: &str = "$iothub/methods/POST";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired";

/// Property keys that are routing metadata rather than message properties.
const IGNORED_PROPERTIES: [&str; 1] = ["$.to"];

fn topic_base(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}"),
        None => format!("devices/{device_id}"),
    }
}

pub fn c2d_subscribe_filter(device_id: &str) -> String {
    format!("{}/messages/devicebound/#", topic_base(device_id, None))
}

pub fn input_subscribe_filter(device_id: &str, module_id: &str) -> String {
    format!("{}/inputs/#", topic_base(device_id, Some(module_id)))
}

pub fn telemetry_topic(device_id: &str, module_id: Option<&str>) -> String {
    format!("{}/messages/events/", topic_base(device_id, module_id))
}

pub fn method_response_topic(request_id: &str, status: u16) -> String {
    format!(
        "$iothub/methods/res/{}/?$rid={}",
        quote(&status.to_string()),
        quote(request_id)
    )
}

/// `method` is `GET` or `PATCH`; `resource_location` is e.g. `/` or `/properties/reported/`.
pub fn twin_request_topic(method: &str, resource_location: &str, request_id: &str) -> String {
    format!(
        "$iothub/twin/{method}{resource_location}?$rid={}",
        quote(request_id)
    )
}

/// Appends system properties, then sorted custom properties, to `topic`.
pub fn encode_message_properties(message: &Message, topic: &str) -> String {
    let system = [
        ("$.on", &message.output_name),
        ("$.mid", &message.message_id),
        ("$.cid", &message.correlation_id),
        ("$.uid", &message.user_id),
        ("$.ct", &message.content_type),
        ("$.ce", &message.content_encoding),
        ("$.ifid", &message.interface_id),
        ("$.exp", &message.expiry_time_utc),
    ];
    let pairs: Vec<String> = system
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (*key, v.as_str())))
        .chain(
            message
                .custom_properties
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .map(|(key, value)| format!("{}={}", quote(key), quote(value)))
        .collect();
    format!("{topic}{}", pairs.join("&"))
}

pub fn is_c2d_topic(topic: &str, device_id: &str) -> bool {
    topic.contains(&format!("devices/{device_id}/messages/devicebound"))
}

pub fn is_input_topic(topic: &str, device_id: &str, module_id: Option<&str>) -> bool {
    match module_id {
        Some(module_id) if !device_id.is_empty() && !module_id.is_empty() => {
            topic.contains(&format!("devices/{device_id}/modules/{module_id}/inputs/"))
        }
        _ => false,
    }
}

pub fn is_method_topic(topic: &str) -> bool {
    topic.contains(METHOD_PREFIX)
}

pub fn is_twin_response_topic(topic: &str) -> bool {
    topic.starts_with(TWIN_RESPONSE_PREFIX)
}

pub fn is_twin_patch_topic(topic: &str) -> bool {
    topic.starts_with(TWIN_PATCH_PREFIX)
}

fn malformed(topic: &str) -> PipelineError {
    PipelineError::MalformedTopic(topic.to_string())
}

/// Input name from `devices/<d>/modules/<m>/inputs/<input>/...`.
pub fn input_name(topic: &str) -> Result<String, PipelineError> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        [_, _, _, _, "inputs", name, ..] => Ok(unquote(name)),
        _ => Err(malformed(topic)),
    }
}

/// Method name from `$iothub/methods/POST/<method>/?$rid=<rid>`.
pub fn method_name(topic: &str) -> Result<String, PipelineError> {
    if !is_method_topic(topic) {
        return Err(malformed(topic));
    }
    topic
        .split('/')
        .nth(3)
        .map(unquote)
        .ok_or_else(|| malformed(topic))
}

fn query_properties(topic: &str) -> Result<HashMap<String, String>, PipelineError> {
    let (_, query) = topic.split_once('?').ok_or_else(|| malformed(topic))?;
    super::split_properties(query, true, topic)
}

fn request_id(topic: &str) -> Result<String, PipelineError> {
    query_properties(topic)?
        .remove("rid")
        .ok_or_else(|| malformed(topic))
}

pub fn method_request_id(topic: &str) -> Result<String, PipelineError> {
    if !is_method_topic(topic) || topic.split('/').count() < 4 {
        return Err(malformed(topic));
    }
    request_id(topic)
}

pub fn twin_request_id(topic: &str) -> Result<String, PipelineError> {
    if !is_twin_response_topic(topic) || topic.split('/').count() < 4 {
        return Err(malformed(topic));
    }
    request_id(topic)
}

pub fn twin_status_code(topic: &str) -> Result<u16, PipelineError> {
    if !is_twin_response_topic(topic) {
        return Err(malformed(topic));
    }
    topic
        .split('/')
        .nth(3)
        .and_then(|s| unquote(s).parse::<u16>().ok())
        .ok_or_else(|| malformed(topic))
}

/// Copies properties encoded in a received topic onto `message`.
///
/// A key without `=` keeps an empty value; `$.to` is dropped.
pub fn extract_message_properties(topic: &str, message: &mut Message) -> Result<(), PipelineError> {
    let parts: Vec<&str> = topic.split('/').collect();
    let section = match parts.as_slice() {
        [_, _, _, _, "inputs", _, rest @ ..] => rest.first().copied(),
        [_, _, _, "devicebound", rest @ ..] => rest.first().copied(),
        _ => return Err(malformed(topic)),
    };
    let Some(section) = section.filter(|s| !s.is_empty()) else {
        return Ok(());
    };

    for entry in section.split('&') {
        let (key, value) = match entry.split_once('=') {
            Some((k, v)) => (unquote(k), unquote(v)),
            None => (unquote(entry), String::new()),
        };
        if IGNORED_PROPERTIES.contains(&key.as_str()) {
            continue;
        }
        let slot = match key.as_str() {
            "$.mid" => &mut message.message_id,
            "$.cid" => &mut message.correlation_id,
            "$.uid" => &mut message.user_id,
            "$.ct" => &mut message.content_type,
            "$.ce" => &mut message.content_encoding,
            "$.exp" => &mut message.expiry_time_utc,
            "iothub-ack" => &mut message.ack,
            _ => {
                message.custom_properties.insert(key, value);
                continue;
            }
        };
        *slot = Some(value);
    }
    Ok(())
}
