//! Topic string codecs.
//!
//! - [`provisioning`]: device provisioning (`$dps/registrations/...`) topics
//! - [`iothub`]: device/module telemetry, method and twin topics
//!
//! Both use the percent-encoding in [`crate::encoding`]: empty safe set, no
//! `+` for spaces in either direction.

pub mod iothub;
pub mod provisioning;

use std::collections::HashMap;

use crate::{encoding::unquote, error::PipelineError};

/// Splits `k1=v1&k2=v2` into a map, decoding keys and values.
///
/// Leading `$` characters are removed from keys when `strip_dollar` is set.
/// A repeated key is an error rather than a silent overwrite.
pub(crate) fn split_properties(
    section: &str,
    strip_dollar: bool,
    topic: &str,
) -> Result<HashMap<String, String>, PipelineError> {
    let mut properties = HashMap::new();
    if section.is_empty() {
        return Ok(properties);
    }
    for entry in section.split('&') {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| PipelineError::MalformedTopic(topic.to_string()))?;
        let mut key = unquote(key);
        if strip_dollar {
            key = key.trim_start_matches('$').to_string();
        }
        if properties.contains_key(&key) {
            return Err(PipelineError::DuplicateProperty(key));
        }
        properties.insert(key, unquote(value));
    }
    Ok(properties)
}
