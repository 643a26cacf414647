//! devicelink: the core of a device-to-cloud client
//!
//! This crate holds everything between an application and a network
//! transport: credentials, connection state, topic encoding and an ordered
//! pipeline of stages that turns high-level device operations into
//! publishes, subscriptions and HTTP requests. The transport itself is
//! supplied by the caller through the [`Transport`] trait.
//!
//! ## Modules
//!
//! * `signer`, `sastoken`: HMAC-SHA256 signing and the SAS token lifecycle:
//!   signed, externally generated and fixed tokens with background renewal.
//!
//! * `connection_string`: Parsing and rendering of
//!   `HostName=...;DeviceId=...;SharedAccessKey=...` descriptors.
//!
//! * `topic`: Bit-exact codecs for IoT Hub and Device Provisioning topics.
//!
//! * `bridge`: Adapters from completion callbacks to blocking waits and
//!   futures, and weakly bound method handles.
//!
//! * `state`: The connection state machine and the shared `Nucleus`.
//!
//! * `pipeline`: Stages, the chain that links them, and the [`Pipeline`]
//!   facade with its builder.
//!
//! * `config`, `logger`: Validated TOML configuration and `tracing`
//!   subscriber setup.

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod connection_string;
pub mod encoding;
pub mod error;
pub mod event;
pub mod logger;
pub mod message;
pub mod operation;
pub mod pipeline;
pub mod sastoken;
pub mod signer;
pub mod state;
pub mod timer;
pub mod topic;
pub mod transport;

pub use config::{Credential, PipelineConfig, X509Credential};
pub use connection_string::ConnectionDescriptor;
pub use error::{PipelineError, ServiceError};
pub use event::Event;
pub use message::{Message, MethodRequest, MethodResponse};
pub use operation::{Feature, OpKind, OpOutput, OpResult};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use sastoken::{SasToken, SasTokenManager};
pub use state::ConnectionState;
pub use transport::{EventSink, Transport, TransportEvent, TransportReply, TransportRequest};

/// IoT Hub service API version sent in usernames and HTTP queries.
pub const IOTHUB_API_VERSION: &str = "2019-10-01";

/// Product identifier reported to the service.
pub const USER_AGENT: &str = concat!("devicelink/", env!("CARGO_PKG_VERSION"));

pub type Result<T> = std::result::Result<T, PipelineError>;
