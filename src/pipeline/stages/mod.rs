//! The stages that make up the default pipeline, top to bottom.

mod connection;
mod coordinate;
mod http;
mod mqtt;
mod provisioning;
mod retry;
mod root;
mod sas_renewal;
mod transport;
mod twin;

pub use connection::{AutoConnectStage, ConnectionLockStage, ReconnectStage};
pub use coordinate::CoordinateRequestAndResponseStage;
pub use http::HttpTranslationStage;
pub use mqtt::MqttTranslationStage;
pub use provisioning::RegistrationStage;
pub use retry::{OpTimeoutStage, RetryStage};
pub use root::RootStage;
pub use sas_renewal::SasTokenRenewalStage;
pub use transport::TransportStage;
pub use twin::TwinRequestResponseStage;

use std::sync::Arc;

use super::chain::Stage;
use crate::config::{Credential, PipelineConfig};

/// Builds the standard stage list for `config`.
pub(crate) fn default_stages(config: &PipelineConfig, credential: &Credential) -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(RootStage),
        Box::new(SasTokenRenewalStage::new(
            credential.sastoken().map(Arc::clone),
            config.sastoken_renewal_margin(),
        )),
        Box::new(RegistrationStage::new()),
        Box::new(TwinRequestResponseStage),
        Box::new(CoordinateRequestAndResponseStage::new()),
        Box::new(MqttTranslationStage::new(
            config.device_id.clone(),
            config.module_id.clone(),
        )),
        Box::new(HttpTranslationStage::new(config, credential.clone())),
        Box::new(AutoConnectStage::new(config.auto_connect)),
        Box::new(ReconnectStage::new(
            config.connection_retry,
            config.connection_retry_interval(),
        )),
        Box::new(ConnectionLockStage::new()),
        Box::new(RetryStage::new(config.retry.clone())),
        Box::new(OpTimeoutStage::new(config.operation_timeout())),
        Box::new(TransportStage::new()),
    ]
}
