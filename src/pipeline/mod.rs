//! The operation pipeline and its application-facing handle.
//!
//! A [`Pipeline`] owns a chain of stages sitting on top of a [`Transport`].
//! Operations submitted through it travel down the chain and complete
//! through a callback; transport events travel up and end at the handlers
//! registered with the builder.
//!
//! ```ignore
//! let (config, credential) = PipelineConfig::from_descriptor(&descriptor, None)?;
//! let pipeline = Pipeline::builder(config, credential, transport)
//!     .on_message(|message| println!("{:?}", message.payload))
//!     .build()?;
//!
//! pipeline.run_async(OpKind::Connect).await?;
//! pipeline
//!     .run_async(OpKind::SendTelemetry(Message::new("hello")))
//!     .await?;
//! ```

pub mod chain;
pub mod handlers;
pub mod stages;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::{
    bridge::{AwaitableCallback, BlockingCallback, WeakMethod},
    config::{Credential, PipelineConfig},
    error::PipelineError,
    message::{Message, MethodRequest, RegistrationResult},
    operation::{OpKind, OpOutput, OpResult, Operation},
    state::{ConnectionState, Nucleus},
    timer::TimerService,
    transport::{EventSink, Transport},
};

use self::{chain::Chain, handlers::Handlers};

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    credential: Credential,
    transport: Arc<dyn Transport>,
    handlers: Handlers,
}

impl PipelineBuilder {
    pub fn on_connection_state_changed<F>(mut self, f: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.handlers.on_connection_state_changed = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.handlers.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_input_message<F>(mut self, f: F) -> Self
    where
        F: Fn(String, Message) + Send + Sync + 'static,
    {
        self.handlers.on_input_message = Some(Arc::new(f));
        self
    }

    pub fn on_method_request<F>(mut self, f: F) -> Self
    where
        F: Fn(MethodRequest) + Send + Sync + 'static,
    {
        self.handlers.on_method_request = Some(Arc::new(f));
        self
    }

    pub fn on_twin_patch<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers.on_twin_patch = Some(Arc::new(f));
        self
    }

    pub fn on_registration_response<F>(mut self, f: F) -> Self
    where
        F: Fn(RegistrationResult) + Send + Sync + 'static,
    {
        self.handlers.on_registration_response = Some(Arc::new(f));
        self
    }

    /// Replaces the default (log at error level) handling of errors that
    /// no caller is waiting for.
    pub fn on_background_error<F>(mut self, f: F) -> Self
    where
        F: Fn(PipelineError) + Send + Sync + 'static,
    {
        self.handlers.on_background_error = Some(Arc::new(f));
        self
    }

    /// Validates the configuration, assembles the stages and hands the
    /// transport its event sink.
    ///
    /// # Errors
    ///
    /// - `Config` when the configuration fails validation
    /// - `NoRuntime` when the timer worker cannot be started
    #[instrument(skip_all, fields(device_id = %self.config.device_id))]
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.check()?;
        let timers = TimerService::new()?;
        let stages = stages::default_stages(&self.config, &self.credential);
        let nucleus = Arc::new(Nucleus::new(self.config, self.credential));
        let chain = Chain::new(
            stages,
            nucleus,
            timers,
            self.handlers,
            Arc::clone(&self.transport),
        );
        self.transport.set_event_sink(event_sink(&chain));
        chain.attach();
        info!("Pipeline ready");
        Ok(Pipeline { chain })
    }
}

fn event_sink(chain: &Arc<Chain>) -> EventSink {
    EventSink::new(WeakMethod::new(chain, "pipeline", Chain::inject_event))
}

/// Handle to a running pipeline. Dropping it shuts the pipeline down.
pub struct Pipeline {
    chain: Arc<Chain>,
}

impl Pipeline {
    pub fn builder(
        config: PipelineConfig,
        credential: Credential,
        transport: Arc<dyn Transport>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            credential,
            transport,
            handlers: Handlers::default(),
        }
    }

    /// Starts `kind` and calls `callback` with its result, possibly on
    /// another thread.
    ///
    /// A panicking callback is reported to the background error handler.
    pub fn submit<F>(&self, kind: OpKind, callback: F)
    where
        F: FnOnce(OpResult) + Send + 'static,
    {
        let reporter = Arc::downgrade(&self.chain);
        let name = kind.name();
        let op = Operation::new(
            kind,
            Box::new(move |result| {
                if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    let err = PipelineError::Pipeline(format!("{name} completion callback panicked"));
                    match reporter.upgrade() {
                        Some(chain) => chain.report_background(err),
                        None => error!(error = %err, "Completion callback panicked after shutdown"),
                    }
                }
            }),
        );
        if self.chain.is_shut_down() {
            return op.fail(PipelineError::OperationCancelled("pipeline is shut down".into()));
        }
        self.chain.run_op_at(0, op);
    }

    /// Runs `kind` and blocks the calling thread until it completes.
    ///
    /// Must not be called from an async task: completions may need the
    /// thread being blocked.
    ///
    /// # Errors
    ///
    /// The operation's error, or `Timeout` when `timeout` elapses first.
    pub fn run_blocking(&self, kind: OpKind, timeout: Option<Duration>) -> Result<OpOutput, PipelineError> {
        let bridge = BlockingCallback::new();
        self.submit(kind, bridge.callback());
        bridge.wait_for_completion(timeout)
    }

    /// Runs `kind` and waits for it without blocking the runtime.
    ///
    /// # Errors
    ///
    /// The operation's error, or `NoRuntime` outside a tokio runtime.
    pub async fn run_async(&self, kind: OpKind) -> Result<OpOutput, PipelineError> {
        let bridge = AwaitableCallback::new()?;
        self.submit(kind, bridge.callback());
        bridge.completion().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.nucleus().connection_state()
    }

    pub fn connected(&self) -> bool {
        self.nucleus().connected()
    }

    /// A receiver that observes every connection state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.nucleus().subscribe_state()
    }

    pub fn config(&self) -> &PipelineConfig {
        self.nucleus().config()
    }

    /// Changes handlers after the pipeline is built. Takes effect for the
    /// next event.
    pub fn update_handlers<F: FnOnce(&mut Handlers)>(&self, f: F) {
        let mut handlers = self
            .chain
            .handlers()
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut handlers);
    }

    /// A sink feeding this pipeline, for transports that create their
    /// event source after the pipeline is built.
    pub fn event_sink(&self) -> EventSink {
        event_sink(&self.chain)
    }

    pub fn is_shut_down(&self) -> bool {
        self.chain.is_shut_down()
    }

    /// Stops timers, fails every pending operation with
    /// `OperationCancelled` and shuts the transport down. Idempotent.
    pub fn shutdown(&self) {
        self.chain.shutdown();
    }

    fn nucleus(&self) -> &Arc<Nucleus> {
        self.chain.nucleus()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.chain.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use bytes::Bytes;

    use super::*;
    use crate::{
        error::ServiceError,
        message::{MethodParams, MethodResult},
        operation::Feature,
        sastoken::SasTokenManager,
        signer::SymmetricKeySigner,
        transport::{TransportCallback, TransportEvent, TransportReply, TransportRequest},
    };

    /// Records requests and completes them immediately unless their kind is held.
    #[derive(Default)]
    struct FakeTransport {
        requests: Mutex<Vec<TransportRequest>>,
        hold: Mutex<HashSet<&'static str>>,
        held: Mutex<Vec<(TransportRequest, TransportCallback)>>,
        failures: Mutex<Vec<(&'static str, PipelineError)>>,
        replies: Mutex<Vec<(&'static str, TransportReply)>>,
        sink: Mutex<Option<EventSink>>,
        shutdowns: AtomicUsize,
    }

    impl FakeTransport {
        fn hold(&self, name: &'static str) {
            self.hold.lock().unwrap().insert(name);
        }

        fn fail_next(&self, name: &'static str, error: PipelineError) {
            self.failures.lock().unwrap().push((name, error));
        }

        fn reply_next(&self, name: &'static str, reply: TransportReply) {
            self.replies.lock().unwrap().push((name, reply));
        }

        fn release(&self, name: &str, result: Result<TransportReply, PipelineError>) {
            let held: Vec<_> = {
                let mut held = self.held.lock().unwrap();
                let (matching, rest): (Vec<_>, Vec<_>) =
                    held.drain(..).partition(|(r, _)| r.name() == name);
                *held = rest;
                matching
            };
            for (_, done) in held {
                done(result.clone());
            }
        }

        fn requests(&self) -> Vec<TransportRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn count(&self, name: &str) -> usize {
            self.requests().iter().filter(|r| r.name() == name).count()
        }

        /// The most recent publish whose topic starts with `prefix`.
        fn published(&self, prefix: &str) -> Option<String> {
            self.requests().iter().rev().find_map(|r| match r {
                TransportRequest::Publish { topic, .. } if topic.starts_with(prefix) => Some(topic.clone()),
                _ => None,
            })
        }

        fn passwords(&self) -> Vec<Option<String>> {
            self.requests()
                .into_iter()
                .filter_map(|r| match r {
                    TransportRequest::Connect(args) => Some(args.password),
                    _ => None,
                })
                .collect()
        }

        fn deliver(&self, event: TransportEvent) {
            let sink = self.sink.lock().unwrap().clone().unwrap();
            sink.deliver(event).unwrap();
        }
    }

    impl Transport for FakeTransport {
        fn submit(&self, request: TransportRequest, done: TransportCallback) {
            self.requests.lock().unwrap().push(request.clone());
            let name = request.name();
            if self.hold.lock().unwrap().contains(name) {
                self.held.lock().unwrap().push((request, done));
                return;
            }
            let failure = {
                let mut failures = self.failures.lock().unwrap();
                failures
                    .iter()
                    .position(|(n, _)| *n == name)
                    .map(|i| failures.remove(i).1)
            };
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                replies
                    .iter()
                    .position(|(n, _)| *n == name)
                    .map(|i| replies.remove(i).1)
            };
            match (failure, reply) {
                (Some(e), _) => done(Err(e)),
                (None, Some(reply)) => done(Ok(reply)),
                (None, None) => done(Ok(TransportReply::Done)),
            }
        }

        fn set_event_sink(&self, sink: EventSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::for_device("hub.example.net", "dev1")
    }

    fn credential() -> Credential {
        Credential::from_sastoken_string(
            "SharedAccessSignature sr=hub.example.net%2Fdevices%2Fdev1&sig=c2ln&se=4102444800",
        )
        .unwrap()
    }

    fn pipeline_with(config: PipelineConfig) -> (Pipeline, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config, credential(), transport.clone())
            .build()
            .unwrap();
        (pipeline, transport)
    }

    fn recorder() -> (Arc<Mutex<Option<OpResult>>>, impl FnOnce(OpResult) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (slot, move |result| *sink.lock().unwrap() = Some(result))
    }

    fn telemetry() -> OpKind {
        OpKind::SendTelemetry(Message::new("hello"))
    }

    fn signed_credential(ttl: Duration) -> (Credential, Arc<SasTokenManager>) {
        let signer = Arc::new(SymmetricKeySigner::new("c2VjcmV0").unwrap());
        let manager = Arc::new(SasTokenManager::signed("hub.example.net/devices/dev1", signer, None, ttl).unwrap());
        (Credential::SasToken(Arc::clone(&manager)), manager)
    }

    fn request_id(topic: &str) -> String {
        let rid = topic.split("$rid=").nth(1).unwrap();
        rid.split('&').next().unwrap().to_string()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    const REGISTER_PREFIX: &str = "$dps/registrations/PUT/iotdps-register/";
    const QUERY_PREFIX: &str = "$dps/registrations/GET/iotdps-get-operationstatus/";
    const ASSIGNING: &[u8] = br#"{"operationId":"op1","status":"assigning"}"#;

    fn register() -> OpKind {
        OpKind::Register {
            registration_id: "dev1".into(),
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config(), credential(), transport.clone())
            .on_connection_state_changed(move |state| seen.lock().unwrap().push(state))
            .build()
            .unwrap();
        assert_eq!(pipeline.connection_state(), ConnectionState::Disconnected);

        pipeline.run_async(OpKind::Connect).await.unwrap();
        assert!(pipeline.connected());

        let Some(TransportRequest::Connect(args)) = transport.requests().first().cloned() else {
            panic!("expected a connect request");
        };
        assert_eq!(args.client_id, "dev1");
        assert!(args.password.unwrap().starts_with("SharedAccessSignature "));
        assert!(args.username.starts_with("hub.example.net/dev1/?api-version="));

        pipeline.run_async(OpKind::Disconnect).await.unwrap();
        assert!(!pipeline.connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_not_connected_fails_fast() {
        let mut config = config();
        config.auto_connect = false;
        config.retry.enabled = false;
        let (pipeline, transport) = pipeline_with(config);

        let err = pipeline.run_async(telemetry()).await.unwrap_err();
        assert_eq!(err, PipelineError::NotConnected);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_auto_connect_before_telemetry() {
        let (pipeline, transport) = pipeline_with(config());

        pipeline.run_async(telemetry()).await.unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(requests[0], TransportRequest::Connect(_)));
        assert!(matches!(
            &requests[1],
            TransportRequest::Publish { topic, payload }
                if topic == "devices/dev1/messages/events/" && payload == &Bytes::from_static(b"hello")
        ));
    }

    #[tokio::test]
    async fn test_redundant_connect_completes_without_transport() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();
        pipeline.run_async(OpKind::Connect).await.unwrap();
        assert_eq!(transport.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();
        transport.hold("publish");

        let (slot, callback) = recorder();
        pipeline.submit(telemetry(), callback);
        assert!(slot.lock().unwrap().is_none());

        pipeline.run_async(OpKind::Disconnect).await.unwrap();
        let result = slot.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(PipelineError::OperationCancelled(_))));
    }

    #[tokio::test]
    async fn test_get_twin_round_trip() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(OpKind::GetTwin, callback);

        let requests = transport.requests();
        assert!(requests.contains(&TransportRequest::Subscribe {
            topic: "$iothub/twin/res/#".into()
        }));
        let topic = requests
            .iter()
            .find_map(|r| match r {
                TransportRequest::Publish { topic, .. } if topic.starts_with("$iothub/twin/GET/") => {
                    Some(topic.clone())
                }
                _ => None,
            })
            .unwrap();
        let rid = topic.split("$rid=").nth(1).unwrap().to_string();

        transport.deliver(TransportEvent::Message {
            topic: format!("$iothub/twin/res/200/?$rid={rid}"),
            payload: Bytes::from_static(br#"{"desired":{"fan":1},"reported":{}}"#),
        });

        let result = slot.lock().unwrap().take().unwrap();
        let Ok(OpOutput::Twin(twin)) = result else {
            panic!("expected a twin");
        };
        assert_eq!(twin["desired"]["fan"], 1);
    }

    #[tokio::test]
    async fn test_twin_error_status() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(OpKind::PatchTwinReportedProperties(serde_json::json!({"a": 1})), callback);
        let topic = transport
            .requests()
            .iter()
            .find_map(|r| match r {
                TransportRequest::Publish { topic, .. } if topic.starts_with("$iothub/twin/PATCH/") => {
                    Some(topic.clone())
                }
                _ => None,
            })
            .unwrap();
        let rid = topic.split("$rid=").nth(1).unwrap().to_string();
        transport.deliver(TransportEvent::Message {
            topic: format!("$iothub/twin/res/400/?$rid={rid}"),
            payload: Bytes::new(),
        });

        let result = slot.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(PipelineError::Service(_))));
    }

    #[tokio::test]
    async fn test_c2d_message_reaches_handler() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config(), credential(), transport.clone())
            .on_message(move |message| sink.lock().unwrap().push(message))
            .build()
            .unwrap();
        pipeline.run_async(OpKind::Connect).await.unwrap();
        pipeline.run_async(OpKind::EnableFeature(Feature::C2d)).await.unwrap();
        assert!(transport.requests().contains(&TransportRequest::Subscribe {
            topic: "devices/dev1/messages/devicebound/#".into()
        }));

        transport.deliver(TransportEvent::Message {
            topic: "devices/dev1/messages/devicebound/%24.mid=7".into(),
            payload: Bytes::from_static(b"ping"),
        });

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, Bytes::from_static(b"ping"));
        assert_eq!(received[0].message_id.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_handler_panic_goes_to_background_hook() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config(), credential(), transport.clone())
            .on_message(|_| panic!("handler bug"))
            .on_background_error(move |e| sink.lock().unwrap().push(e))
            .build()
            .unwrap();
        pipeline.run_async(OpKind::Connect).await.unwrap();

        transport.deliver(TransportEvent::Message {
            topic: "devices/dev1/messages/devicebound/".into(),
            payload: Bytes::new(),
        });

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], PipelineError::Pipeline(m) if m.contains("panicked")));
        assert!(pipeline.connected());
    }

    #[tokio::test]
    async fn test_retry_after_connection_dropped() {
        let mut config = config();
        config.retry.initial_delay_ms = 10;
        config.retry.max_delay_ms = 10;
        let (pipeline, transport) = pipeline_with(config);
        pipeline.run_async(OpKind::Connect).await.unwrap();

        transport.fail_next("publish", PipelineError::ConnectionDropped("reset".into()));
        let result = tokio::time::timeout(Duration::from_secs(5), pipeline.run_async(telemetry()))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(transport.count("publish"), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        transport.fail_next("publish", PipelineError::Format("bad payload".into()));
        let err = pipeline.run_async(telemetry()).await.unwrap_err();
        assert_eq!(err, PipelineError::Format("bad payload".into()));
        assert_eq!(transport.count("publish"), 1);
    }

    #[tokio::test]
    async fn test_subscribe_timeout() {
        let mut config = config();
        config.operation_timeout = 1;
        config.retry.enabled = false;
        let (pipeline, transport) = pipeline_with(config);
        pipeline.run_async(OpKind::Connect).await.unwrap();
        transport.hold("subscribe");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run_async(OpKind::EnableFeature(Feature::Methods)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(PipelineError::Timeout(_))));

        // The late acknowledgement is ignored.
        transport.release("subscribe", Ok(TransportReply::Done));
    }

    #[tokio::test]
    async fn test_ops_queued_behind_failed_connect_fail_with_its_error() {
        let mut config = config();
        config.auto_connect = false;
        config.retry.enabled = false;
        let (pipeline, transport) = pipeline_with(config);
        transport.hold("connect");

        let (connect_slot, connect_cb) = recorder();
        pipeline.submit(OpKind::Connect, connect_cb);
        assert_eq!(pipeline.connection_state(), ConnectionState::Connecting);

        let (queued_slot, queued_cb) = recorder();
        pipeline.submit(telemetry(), queued_cb);
        assert!(queued_slot.lock().unwrap().is_none());

        let refused = PipelineError::ConnectionFailed("refused".into());
        transport.release("connect", Err(refused.clone()));

        assert_eq!(connect_slot.lock().unwrap().take().unwrap(), Err(refused.clone()));
        assert_eq!(queued_slot.lock().unwrap().take().unwrap(), Err(refused));
        assert_eq!(pipeline.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.count("publish"), 0);
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_lost() {
        let mut config = config();
        config.connection_retry_interval = 1;
        let (pipeline, transport) = pipeline_with(config);
        pipeline.run_async(OpKind::Connect).await.unwrap();

        transport.deliver(TransportEvent::ConnectionLost {
            cause: PipelineError::ConnectionDropped("keep-alive".into()),
        });
        assert_eq!(pipeline.connection_state(), ConnectionState::Disconnected);
        let mut states = pipeline.subscribe_state();

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(transport.count("connect"), 2);
    }

    #[tokio::test]
    async fn test_explicit_reconnect() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();
        pipeline.run_async(OpKind::Reconnect).await.unwrap();
        assert!(pipeline.connected());
        assert_eq!(transport.count("disconnect"), 1);
        assert_eq!(transport.count("connect"), 2);
    }

    #[tokio::test]
    async fn test_register_polls_until_assigned() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(register(), callback);
        assert!(transport.requests().contains(&TransportRequest::Subscribe {
            topic: "$dps/registrations/res/#".into()
        }));
        let rid = request_id(&transport.published(REGISTER_PREFIX).unwrap());
        transport.deliver(TransportEvent::Message {
            topic: format!("$dps/registrations/res/202/?$rid={rid}&retry-after=1"),
            payload: Bytes::from_static(ASSIGNING),
        });
        assert!(slot.lock().unwrap().is_none());

        wait_until(|| transport.published(QUERY_PREFIX).is_some()).await;
        let query = transport.published(QUERY_PREFIX).unwrap();
        assert!(query.ends_with("&operationId=op1"));
        transport.deliver(TransportEvent::Message {
            topic: format!("$dps/registrations/res/200/?$rid={}", request_id(&query)),
            payload: Bytes::from_static(
                br#"{"operationId":"op1","status":"assigned","registrationState":{"assignedHub":"hub2"}}"#,
            ),
        });

        let result = slot.lock().unwrap().take().unwrap();
        let Ok(OpOutput::Registration(registration)) = result else {
            panic!("expected a registration result");
        };
        assert_eq!(registration.status(), Some("assigned"));
        assert_eq!(registration.body["registrationState"]["assignedHub"], "hub2");
    }

    #[tokio::test]
    async fn test_query_registration_once() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(OpKind::QueryRegistration { operation_id: "op7".into() }, callback);
        let query = transport.published(QUERY_PREFIX).unwrap();
        transport.deliver(TransportEvent::Message {
            topic: format!("$dps/registrations/res/202/?$rid={}&retry-after=2", request_id(&query)),
            payload: Bytes::from_static(ASSIGNING),
        });

        let result = slot.lock().unwrap().take().unwrap();
        let Ok(OpOutput::Registration(registration)) = result else {
            panic!("expected a registration result");
        };
        assert_eq!(registration.status(), Some("assigning"));
        assert_eq!(registration.retry_after, Some(2));
        assert_eq!(transport.count("publish"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_registration_waiting_to_poll() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(register(), callback);
        let rid = request_id(&transport.published(REGISTER_PREFIX).unwrap());
        transport.deliver(TransportEvent::Message {
            topic: format!("$dps/registrations/res/202/?$rid={rid}&retry-after=1"),
            payload: Bytes::from_static(ASSIGNING),
        });

        pipeline.run_async(OpKind::Disconnect).await.unwrap();
        assert!(matches!(
            slot.lock().unwrap().take(),
            Some(Err(PipelineError::OperationCancelled(_)))
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(pipeline.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.count("connect"), 1);
        assert!(transport.published(QUERY_PREFIX).is_none());
    }

    #[tokio::test]
    async fn test_sastoken_renewal_reauthorizes() {
        let mut config = config();
        config.sastoken_renewal_margin = 2;
        let (credential, manager) = signed_credential(Duration::from_secs(4));
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config, credential, transport.clone())
            .build()
            .unwrap();
        pipeline.run_async(OpKind::Connect).await.unwrap();
        let first = manager.token_string();

        transport.hold("disconnect");
        let mut states = pipeline.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Reauthorizing),
        )
        .await
        .unwrap()
        .unwrap();
        assert_ne!(manager.token_string(), first);

        transport.release("disconnect", Ok(TransportReply::Done));
        assert_eq!(pipeline.connection_state(), ConnectionState::Connected);
        let passwords = transport.passwords();
        assert_eq!(passwords.len(), 2);
        assert_eq!(passwords[0].as_deref(), Some(first.as_str()));
        assert_ne!(passwords[1], passwords[0]);
    }

    #[tokio::test]
    async fn test_credential_rejected_refreshes_token_before_reconnect() {
        let mut config = config();
        config.connection_retry_interval = 1;
        let (credential, manager) = signed_credential(Duration::from_secs(3600));
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config, credential, transport.clone())
            .build()
            .unwrap();
        pipeline.run_async(OpKind::Connect).await.unwrap();
        let first = manager.token_string();

        transport.deliver(TransportEvent::ConnectionLost {
            cause: PipelineError::Service(ServiceError::Unauthorized("token expired".into())),
        });
        let renewed = manager.token_string();
        assert_ne!(renewed, first);

        wait_until(|| transport.count("connect") == 2).await;
        let passwords = transport.passwords();
        assert_eq!(passwords[1].as_deref(), Some(renewed.as_str()));
    }

    #[tokio::test]
    async fn test_pending_request_resent_after_reconnect() {
        let mut config = config();
        config.connection_retry_interval = 1;
        let (pipeline, transport) = pipeline_with(config);
        pipeline.run_async(OpKind::Connect).await.unwrap();

        let (slot, callback) = recorder();
        pipeline.submit(OpKind::GetTwin, callback);
        let rid = request_id(&transport.published("$iothub/twin/GET/").unwrap());

        transport.deliver(TransportEvent::ConnectionLost {
            cause: PipelineError::ConnectionDropped("keep-alive".into()),
        });
        assert!(slot.lock().unwrap().is_none());

        let twin_gets = || {
            transport
                .requests()
                .iter()
                .filter(|r| matches!(r, TransportRequest::Publish { topic, .. } if topic.starts_with("$iothub/twin/GET/")))
                .count()
        };
        wait_until(|| twin_gets() == 2).await;
        assert_eq!(request_id(&transport.published("$iothub/twin/GET/").unwrap()), rid);

        transport.deliver(TransportEvent::Message {
            topic: format!("$iothub/twin/res/200/?$rid={rid}"),
            payload: Bytes::from_static(br#"{"desired":{},"reported":{}}"#),
        });
        assert!(matches!(
            slot.lock().unwrap().take(),
            Some(Ok(OpOutput::Twin(_)))
        ));
    }

    #[tokio::test]
    async fn test_invoke_method_over_http() {
        let (pipeline, transport) = pipeline_with(config());
        transport.reply_next(
            "http",
            TransportReply::Http {
                status_code: 200,
                body: Bytes::from_static(br#"{"status":201,"payload":{"ok":true}}"#),
            },
        );

        let output = pipeline
            .run_async(OpKind::InvokeMethod {
                device_id: "dev2".into(),
                module_id: None,
                params: MethodParams {
                    method_name: "reboot".into(),
                    payload: serde_json::json!({}),
                    response_timeout_in_seconds: None,
                    connect_timeout_in_seconds: None,
                },
            })
            .await
            .unwrap();
        let OpOutput::MethodResult(MethodResult { status, payload }) = output else {
            panic!("expected a method result");
        };
        assert_eq!(status, 201);
        assert_eq!(payload["ok"], true);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            &requests[0],
            TransportRequest::Http { method, path, .. } if method == "POST" && path == "/twins/dev2/methods"
        ));
    }

    #[tokio::test]
    async fn test_get_storage_info_over_http() {
        let (pipeline, transport) = pipeline_with(config());
        transport.reply_next(
            "http",
            TransportReply::Http {
                status_code: 200,
                body: Bytes::from_static(
                    br#"{"correlationId":"c1","hostName":"blob.net","containerName":"up","blobName":"a.bin","sasToken":"?sig=x"}"#,
                ),
            },
        );

        let output = pipeline
            .run_async(OpKind::GetStorageInfo { blob_name: "a.bin".into() })
            .await
            .unwrap();
        let OpOutput::StorageInfo(info) = output else {
            panic!("expected storage info");
        };
        assert_eq!(info.correlation_id, "c1");
        assert_eq!(info.host_name, "blob.net");
        assert!(matches!(
            &transport.requests()[0],
            TransportRequest::Http { path, .. } if path == "/devices/dev1/files"
        ));
    }

    #[tokio::test]
    async fn test_notify_upload_status_maps_service_error() {
        let (pipeline, transport) = pipeline_with(config());
        transport.reply_next(
            "http",
            TransportReply::Http {
                status_code: 404,
                body: Bytes::from_static(b"no such upload"),
            },
        );

        let err = pipeline
            .run_async(OpKind::NotifyUploadStatus {
                correlation_id: "c1".into(),
                is_success: true,
                status_code: 200,
                description: "done".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Service(ServiceError::NotFound(_))));
        assert_eq!(transport.count("http"), 1);
        assert_eq!(transport.count("connect"), 0);
    }

    #[tokio::test]
    async fn test_ops_queued_behind_connect_run_in_order() {
        let mut config = config();
        config.auto_connect = false;
        let (pipeline, transport) = pipeline_with(config);
        transport.hold("connect");

        let (connect_slot, connect_cb) = recorder();
        pipeline.submit(OpKind::Connect, connect_cb);
        let queued: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|payload| {
                let (slot, callback) = recorder();
                pipeline.submit(OpKind::SendTelemetry(Message::new(payload)), callback);
                slot
            })
            .collect();
        assert_eq!(transport.count("publish"), 0);

        transport.release("connect", Ok(TransportReply::Done));
        assert_eq!(connect_slot.lock().unwrap().take().unwrap(), Ok(OpOutput::Empty));
        for slot in &queued {
            assert_eq!(slot.lock().unwrap().take().unwrap(), Ok(OpOutput::Empty));
        }
        let payloads: Vec<_> = transport
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                TransportRequest::Publish { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_connection_lost_while_connecting_fails_connect() {
        let mut config = config();
        config.connection_retry = false;
        let (pipeline, transport) = pipeline_with(config);
        transport.hold("connect");

        let (slot, callback) = recorder();
        pipeline.submit(OpKind::Connect, callback);
        assert_eq!(pipeline.connection_state(), ConnectionState::Connecting);

        transport.deliver(TransportEvent::ConnectionLost {
            cause: PipelineError::ConnectionDropped("reset".into()),
        });
        transport.release("connect", Ok(TransportReply::Done));

        assert!(matches!(
            slot.lock().unwrap().take(),
            Some(Err(PipelineError::ConnectionDropped(_)))
        ));
        assert!(!pipeline.connected());
        assert_eq!(pipeline.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_run_blocking() {
        let (pipeline, _transport) = pipeline_with(config());
        let output = pipeline
            .run_blocking(OpKind::Connect, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(output, OpOutput::Empty);
        assert_eq!(pipeline.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_run_blocking_times_out() {
        let (pipeline, transport) = pipeline_with(config());
        transport.hold("connect");
        let err = pipeline
            .run_blocking(OpKind::Connect, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_and_rejects_new_work() {
        let (pipeline, transport) = pipeline_with(config());
        pipeline.run_async(OpKind::Connect).await.unwrap();
        transport.hold("publish");

        let (slot, callback) = recorder();
        pipeline.submit(telemetry(), callback);
        pipeline.shutdown();
        pipeline.shutdown();

        assert!(matches!(
            slot.lock().unwrap().take().unwrap(),
            Err(PipelineError::OperationCancelled(_))
        ));
        let err = pipeline.run_async(telemetry()).await.unwrap_err();
        assert!(matches!(err, PipelineError::OperationCancelled(_)));
        assert_eq!(transport.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_panic_goes_to_background_hook() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let transport = Arc::new(FakeTransport::default());
        let pipeline = Pipeline::builder(config(), credential(), transport)
            .on_background_error(move |e| sink.lock().unwrap().push(e))
            .build()
            .unwrap();

        pipeline.submit(OpKind::Connect, |_| panic!("callback bug"));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(pipeline.connected());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = config();
        config.keep_alive = 0;
        let transport = Arc::new(FakeTransport::default());
        let err = Pipeline::builder(config, credential(), transport).build().err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_event_sink_outlived_by_transport() {
        let (pipeline, transport) = pipeline_with(config());
        let sink = pipeline.event_sink();
        assert!(sink.is_alive());
        drop(pipeline);
        assert!(!sink.is_alive());
        let err = sink
            .deliver(TransportEvent::Message {
                topic: "x".into(),
                payload: Bytes::new(),
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::TargetGone(_)));
        drop(transport);
    }
}
