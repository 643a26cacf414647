//! The seam between the pipeline and a concrete network transport.
//!
//! The pipeline never opens sockets itself. It hands [`TransportRequest`]s to
//! a [`Transport`] implementation together with a completion callback, and
//! the transport pushes unsolicited [`TransportEvent`]s back through the
//! [`EventSink`] it was given. Callbacks and events may arrive on any thread.
//!
//! # Examples
//!
//! ```ignore
//! struct MyMqtt { sink: Mutex<Option<EventSink>>, client: AsyncClient }
//!
//! impl Transport for MyMqtt {
//!     fn submit(&self, request: TransportRequest, done: TransportCallback) {
//!         match request {
//!             TransportRequest::Publish { topic, payload } => {
//!                 let client = self.client.clone();
//!                 tokio::spawn(async move {
//!                     let result = client.publish(topic, QoS::AtLeastOnce, false, payload).await;
//!                     done(result.map(|_| TransportReply::Done).map_err(|e| {
//!                         PipelineError::ConnectionDropped(e.to_string())
//!                     }));
//!                 });
//!             }
//!             // ...
//!         }
//!     }
//!
//!     fn set_event_sink(&self, sink: EventSink) {
//!         *self.sink.lock().unwrap() = Some(sink);
//!     }
//! }
//! ```

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::{
    bridge::WeakMethod,
    config::{ProxyOptions, X509Credential},
    error::PipelineError,
    event::Event,
    pipeline::chain::Chain,
};

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectArgs {
    pub hostname: String,
    pub client_id: String,
    pub username: String,
    /// The SAS token, when authenticating with one.
    pub password: Option<String>,
    pub x509: Option<X509Credential>,
    pub keep_alive: Duration,
    pub websockets: bool,
    pub cipher: String,
    pub proxy: Option<ProxyOptions>,
    pub server_verification_cert: Option<String>,
}

/// Work for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportRequest {
    Connect(ConnectArgs),
    Disconnect,
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
    Http {
        hostname: String,
        method: String,
        path: String,
        query: String,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
}

impl TransportRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TransportRequest::Connect(_) => "connect",
            TransportRequest::Disconnect => "disconnect",
            TransportRequest::Publish { .. } => "publish",
            TransportRequest::Subscribe { .. } => "subscribe",
            TransportRequest::Unsubscribe { .. } => "unsubscribe",
            TransportRequest::Http { .. } => "http",
        }
    }
}

/// Successful outcome of a [`TransportRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportReply {
    Done,
    Http { status_code: u16, body: Bytes },
}

pub type TransportCallback = Box<dyn FnOnce(Result<TransportReply, PipelineError>) + Send + 'static>;

/// Unsolicited notifications from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection dropped without a disconnect being requested.
    ///
    /// A `cause` for which [`PipelineError::is_credential`] holds makes the
    /// pipeline refresh its token before reconnecting.
    ConnectionLost { cause: PipelineError },
    Message { topic: String, payload: Bytes },
}

/// A network transport driven by the pipeline.
pub trait Transport: Send + Sync {
    /// Starts `request` and eventually calls `done` exactly once.
    fn submit(&self, request: TransportRequest, done: TransportCallback);

    /// Receives the sink for unsolicited events. Called once when the
    /// pipeline is built.
    fn set_event_sink(&self, sink: EventSink);

    /// Releases transport resources. The pipeline calls this on shutdown.
    fn shutdown(&self) {}
}

/// Delivers transport events into the pipeline without keeping it alive.
#[derive(Clone)]
pub struct EventSink {
    target: WeakMethod<Chain, Event>,
}

impl EventSink {
    pub(crate) fn new(target: WeakMethod<Chain, Event>) -> Self {
        Self { target }
    }

    /// Hands `event` to the bottom of the pipeline.
    ///
    /// # Errors
    ///
    /// `TargetGone` when the pipeline has been dropped.
    pub fn deliver(&self, event: TransportEvent) -> Result<(), PipelineError> {
        let event = match event {
            TransportEvent::ConnectionLost { cause } => Event::Disconnected { cause: Some(cause) },
            TransportEvent::Message { topic, payload } => Event::IncomingPublish { topic, payload },
        };
        debug!(event = %event.name(), "Transport event received");
        self.target.call(event)
    }

    pub fn is_alive(&self) -> bool {
        self.target.is_alive()
    }
}
