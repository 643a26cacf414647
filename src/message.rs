//! Payload types carried by operations and events.
//!
//! [`Message`] is the telemetry / cloud-to-device / module-input message with
//! its system and custom properties. [`MethodRequest`] and [`MethodResponse`]
//! describe direct method invocations received by the device.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::PipelineError;

/// A device message with system and application properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Bytes,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// ISO 8601 expiry, passed through untouched.
    pub expiry_time_utc: Option<String>,
    /// Set on messages sent to a module output.
    pub output_name: Option<String>,
    /// Set on messages received on a module input.
    pub input_name: Option<String>,
    pub interface_id: Option<String>,
    /// Acknowledgement mode requested by the service for received messages.
    pub ack: Option<String>,
    /// Application properties, kept sorted so encoded topics are stable.
    pub custom_properties: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as a JSON payload and tags the content type.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, PipelineError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| PipelineError::Format(e.to_string()))?;
        Ok(Self {
            payload: payload.into(),
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
            ..Default::default()
        })
    }

    /// Decodes a JSON payload.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, PipelineError> {
        serde_json::from_slice(&self.payload).map_err(|e| PipelineError::Format(e.to_string()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }
}

/// A direct method call received from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub request_id: String,
    pub name: String,
    pub payload: serde_json::Value,
}

/// The device's answer to a [`MethodRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: serde_json::Value,
}

impl MethodResponse {
    pub fn for_request(request: &MethodRequest, status: u16, payload: serde_json::Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            payload,
        }
    }
}

/// Parameters of a method invoked on another device or module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodParams {
    pub method_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout_in_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_in_seconds: Option<u32>,
}

/// Result of a method invoked through the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResult {
    pub status: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Blob upload target returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub correlation_id: String,
    pub host_name: String,
    pub container_name: String,
    pub blob_name: String,
    pub sas_token: String,
}

/// Outcome of a registration request or status query.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    pub status_code: u16,
    pub body: serde_json::Value,
    /// Seconds the service asked the device to wait before polling again.
    pub retry_after: Option<u64>,
}

impl RegistrationResult {
    /// The `operationId` a pending registration is tracked under.
    pub fn operation_id(&self) -> Option<&str> {
        self.body.get("operationId").and_then(|v| v.as_str())
    }

    /// The registration `status` reported by the service (`assigning`, `assigned`, ...).
    pub fn status(&self) -> Option<&str> {
        self.body.get("status").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_json_message() {
        let msg = Message::json(&json!({"temp": 21.5})).unwrap();
        assert_eq!(msg.content_type.as_deref(), Some("application/json"));
        let value: serde_json::Value = msg.parse_json().unwrap();
        assert_eq!(value["temp"], 21.5);
    }

    #[test]
    fn test_custom_properties_sorted() {
        let msg = Message::new("x").with_property("b", "2").with_property("a", "1");
        let keys: Vec<_> = msg.custom_properties.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_storage_info_wire_names() {
        let info: StorageInfo = serde_json::from_value(json!({
            "correlationId": "c",
            "hostName": "h",
            "containerName": "k",
            "blobName": "b",
            "sasToken": "s"
        }))
        .unwrap();
        assert_eq!(info.container_name, "k");
    }

    #[test]
    fn test_registration_result_accessors() {
        let result = RegistrationResult {
            status_code: 202,
            body: json!({"operationId": "op1", "status": "assigning"}),
            retry_after: Some(3),
        };
        assert_eq!(result.operation_id(), Some("op1"));
        assert_eq!(result.status(), Some("assigning"));
    }
}
