//! Translation between device operations and MQTT publishes and
//! subscriptions, and from inbound publishes back to events.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::PipelineError,
    event::Event,
    message::{Message, MethodRequest, RegistrationResult},
    operation::{Feature, OpKind, Operation, RequestType},
    pipeline::chain::{Stage, StageContext},
    topic::{iothub, provisioning},
};

/// Translates device operations into publishes and subscriptions, and raw
/// inbound publishes into typed events.
pub struct MqttTranslationStage {
    device_id: String,
    module_id: Option<String>,
    /// Response filters already subscribed on behalf of requests.
    response_subscriptions: Arc<Mutex<HashSet<&'static str>>>,
}

impl MqttTranslationStage {
    pub fn new(device_id: impl Into<String>, module_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id,
            response_subscriptions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn feature_topic(&self, feature: Feature) -> Result<String, PipelineError> {
        match feature {
            Feature::C2d => Ok(iothub::c2d_subscribe_filter(&self.device_id)),
            Feature::Input => match &self.module_id {
                Some(module_id) => Ok(iothub::input_subscribe_filter(&self.device_id, module_id)),
                None => Err(PipelineError::Pipeline(
                    "input messages are only available to modules".into(),
                )),
            },
            Feature::Methods => Ok(iothub::METHOD_SUBSCRIBE_FILTER.into()),
            Feature::Twin => Ok(iothub::TWIN_RESPONSE_SUBSCRIBE_FILTER.into()),
            Feature::TwinPatches => Ok(iothub::TWIN_PATCH_SUBSCRIBE_FILTER.into()),
        }
    }

    fn telemetry(&self, message: &Message) -> Publish {
        let base = iothub::telemetry_topic(&self.device_id, self.module_id.as_deref());
        Publish {
            topic: iothub::encode_message_properties(message, &base),
            payload: message.payload.clone(),
        }
    }

    fn request_topic(
        request_type: RequestType,
        method: &str,
        resource_location: &str,
        request_id: &str,
    ) -> (String, &'static str) {
        match request_type {
            RequestType::Twin => (
                iothub::twin_request_topic(method, resource_location, request_id),
                iothub::TWIN_RESPONSE_SUBSCRIBE_FILTER,
            ),
            RequestType::Register => (
                provisioning::encode_register_topic(request_id),
                provisioning::SUBSCRIBE_FILTER,
            ),
            RequestType::Query => (
                provisioning::encode_query_topic(request_id, resource_location),
                provisioning::SUBSCRIBE_FILTER,
            ),
        }
    }

    /// Publishes a request, subscribing to its response filter first if needed.
    fn send_request(&self, ctx: &StageContext, op: Operation, publish: Publish, filter: &'static str) {
        let subscribed = self
            .response_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(filter);
        let publish_op = OpKind::Publish {
            topic: publish.topic,
            payload: publish.payload,
        };
        if subscribed {
            ctx.send_op_down(Operation::delegate(op, publish_op, |r| r));
            return;
        }

        debug!(filter, "Subscribing to response topic before first request");
        self.response_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filter);
        let next = ctx.clone();
        let subscriptions = Arc::clone(&self.response_subscriptions);
        let mut subscribe = Operation::internal(OpKind::Subscribe {
            topic: filter.to_string(),
        });
        subscribe.add_callback(move |subscribe, result| {
            match &result {
                Ok(_) => next.send_op_down(Operation::delegate(op, publish_op, |r| r)),
                Err(e) => {
                    subscriptions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(filter);
                    op.fail(e.clone());
                }
            }
            subscribe.complete(result);
        });
        ctx.send_op_down(subscribe);
    }

    fn translate_publish(&self, topic: String, payload: Bytes) -> Result<Option<Event>, PipelineError> {
        if iothub::is_c2d_topic(&topic, &self.device_id) {
            let mut message = Message::new(payload);
            iothub::extract_message_properties(&topic, &mut message)?;
            return Ok(Some(Event::IncomingMessage(message)));
        }
        if iothub::is_input_topic(&topic, &self.device_id, self.module_id.as_deref()) {
            let input_name = iothub::input_name(&topic)?;
            let mut message = Message::new(payload);
            iothub::extract_message_properties(&topic, &mut message)?;
            message.input_name = Some(input_name.clone());
            return Ok(Some(Event::IncomingInputMessage {
                input_name,
                message,
            }));
        }
        if iothub::is_method_topic(&topic) {
            let request = MethodRequest {
                request_id: iothub::method_request_id(&topic)?,
                name: iothub::method_name(&topic)?,
                payload: parse_json_or_null(&payload)?,
            };
            return Ok(Some(Event::IncomingMethodRequest(request)));
        }
        if iothub::is_twin_response_topic(&topic) {
            return Ok(Some(Event::Response {
                request_id: iothub::twin_request_id(&topic)?,
                status_code: iothub::twin_status_code(&topic)?,
                body: payload,
                retry_after: None,
            }));
        }
        if iothub::is_twin_patch_topic(&topic) {
            return Ok(Some(Event::TwinDesiredPropertiesPatch(parse_json_or_null(
                &payload,
            )?)));
        }
        if provisioning::is_response_topic(&topic) {
            let response = provisioning::decode_response(&topic)?;
            return Ok(Some(Event::RegistrationResponse {
                request_id: response.request_id,
                result: RegistrationResult {
                    status_code: response.status_code,
                    body: parse_json_or_null(&payload)?,
                    retry_after: response.retry_after,
                },
            }));
        }
        Ok(None)
    }
}

struct Publish {
    topic: String,
    payload: Bytes,
}

fn parse_json_or_null(payload: &[u8]) -> Result<Value, PipelineError> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| PipelineError::Format(e.to_string()))
}

impl Stage for MqttTranslationStage {
    fn name(&self) -> &'static str {
        "mqtt_translation"
    }

    fn run_op(&self, ctx: &StageContext, op: Operation) {
        let publish = match op.kind() {
            OpKind::SendTelemetry(message) => self.telemetry(message),
            OpKind::SendOutputEvent {
                output_name,
                message,
            } => {
                let mut message = message.clone();
                message.output_name = Some(output_name.clone());
                self.telemetry(&message)
            }
            OpKind::SendMethodResponse(response) => match serde_json::to_vec(&response.payload) {
                Ok(payload) => Publish {
                    topic: iothub::method_response_topic(&response.request_id, response.status),
                    payload: payload.into(),
                },
                Err(e) => return op.fail(PipelineError::Format(e.to_string())),
            },
            OpKind::EnableFeature(feature) | OpKind::DisableFeature(feature) => {
                let enable = matches!(op.kind(), OpKind::EnableFeature(_));
                let topic = match self.feature_topic(*feature) {
                    Ok(topic) => topic,
                    Err(e) => return op.fail(e),
                };
                debug!(feature = feature.as_str(), enable, "Translating feature toggle");
                let kind = if enable {
                    OpKind::Subscribe { topic }
                } else {
                    OpKind::Unsubscribe { topic }
                };
                return ctx.send_op_down(Operation::delegate(op, kind, |r| r));
            }
            OpKind::Request {
                request_type,
                method,
                resource_location,
                request_id,
                body,
            } => {
                let (topic, filter) =
                    Self::request_topic(*request_type, method, resource_location, request_id);
                let publish = Publish {
                    topic,
                    payload: body.clone(),
                };
                return self.send_request(ctx, op, publish, filter);
            }
            _ => return ctx.send_op_down(op),
        };
        let kind = OpKind::Publish {
            topic: publish.topic,
            payload: publish.payload,
        };
        ctx.send_op_down(Operation::delegate(op, kind, |r| r));
    }

    fn handle_event(&self, ctx: &StageContext, event: Event) {
        match event {
            Event::IncomingPublish { topic, payload } => {
                match self.translate_publish(topic.clone(), payload) {
                    Ok(Some(event)) => ctx.send_event_up(event),
                    Ok(None) => warn!(topic = %topic, "Publish on unknown topic dropped"),
                    Err(e) => warn!(topic = %topic, error = %e, "Undecodable publish dropped"),
                }
            }
            other => ctx.send_event_up(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> MqttTranslationStage {
        MqttTranslationStage::new("dev1", Some("mod1".into()))
    }

    #[test]
    fn test_translate_c2d() {
        let event = stage()
            .translate_publish(
                "devices/dev1/messages/devicebound/%24.mid=42&color=blue".into(),
                Bytes::from_static(b"hi"),
            )
            .unwrap()
            .unwrap();
        let Event::IncomingMessage(message) = event else {
            panic!("expected a message");
        };
        assert_eq!(message.message_id.as_deref(), Some("42"));
        assert_eq!(message.custom_properties["color"], "blue");
    }

    #[test]
    fn test_translate_input() {
        let event = stage()
            .translate_publish(
                "devices/dev1/modules/mod1/inputs/in1/".into(),
                Bytes::from_static(b"x"),
            )
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::IncomingInputMessage { ref input_name, .. } if input_name == "in1"
        ));
    }

    #[test]
    fn test_translate_method_request() {
        let event = stage()
            .translate_publish(
                "$iothub/methods/POST/reboot/?$rid=7".into(),
                Bytes::from_static(b"{\"delay\":1}"),
            )
            .unwrap()
            .unwrap();
        let Event::IncomingMethodRequest(request) = event else {
            panic!("expected a method request");
        };
        assert_eq!(request.name, "reboot");
        assert_eq!(request.request_id, "7");
        assert_eq!(request.payload["delay"], 1);
    }

    #[test]
    fn test_translate_twin_response() {
        let event = stage()
            .translate_publish("$iothub/twin/res/204/?$rid=abc".into(), Bytes::new())
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            Event::Response { ref request_id, status_code: 204, .. } if request_id == "abc"
        ));
    }

    #[test]
    fn test_translate_registration_response() {
        let event = stage()
            .translate_publish(
                "$dps/registrations/res/202/?$rid=r1&retry-after=3".into(),
                Bytes::from_static(b"{\"operationId\":\"op\",\"status\":\"assigning\"}"),
            )
            .unwrap()
            .unwrap();
        let Event::RegistrationResponse { request_id, result } = event else {
            panic!("expected a registration response");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(result.retry_after, Some(3));
        assert_eq!(result.operation_id(), Some("op"));
    }

    #[test]
    fn test_unknown_topic() {
        assert_eq!(
            stage()
                .translate_publish("somewhere/else".into(), Bytes::new())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_feature_topics() {
        let stage = stage();
        assert_eq!(
            stage.feature_topic(Feature::C2d).unwrap(),
            "devices/dev1/messages/devicebound/#"
        );
        assert_eq!(
            stage.feature_topic(Feature::Input).unwrap(),
            "devices/dev1/modules/mod1/inputs/#"
        );
        let device_only = MqttTranslationStage::new("dev1", None);
        assert!(device_only.feature_topic(Feature::Input).is_err());
    }
}
