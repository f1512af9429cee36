//! Typed configuration for the log shipper.
//!
//! Configuration arrives as a flat list of string key/value pairs, the way log collectors hand plugin settings over.
//! [`Configuration::from_pairs`] turns those into typed settings, applying defaults for everything that is absent and
//! rejecting anything malformed up front.
#![deny(missing_docs)]

use std::collections::BTreeMap;

use logship_core::ClusterState;
use serde::Deserialize as _;
use serde_with::{serde_as, DisplayFromStr};
use snafu::{ResultExt as _, Snafu};
use tracing::level_filters::LevelFilter;

mod client;
pub use self::client::{
    BackoffConfiguration, BufferConfiguration, BufferType, ClientConfiguration, QueueConfiguration, QueueSync,
};

mod controller;
pub use self::controller::ControllerConfiguration;

pub mod de;

mod plugin;
pub use self::plugin::{DynamicHostPath, DynamicTenant, PluginConfiguration};

const REMOVE_TENANT_KEY: &str = "RemoveTenantIdWhenSendingToDefaultURL";

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// One of the values could not be parsed.
    #[snafu(display("Malformed configuration: {}", source))]
    Malformed {
        /// Error source.
        source: serde_json::Error,
    },

    /// A value parsed, but is not acceptable for its key.
    #[snafu(display("Invalid value '{}' for '{}': {}", value, key, reason))]
    InvalidValue {
        /// Configuration key.
        key: String,

        /// Offending value.
        value: String,

        /// Why the value was rejected.
        reason: String,
    },
}

#[serde_as]
#[derive(serde::Deserialize)]
struct Global {
    #[serde(rename = "LogLevel", default = "default_log_level")]
    #[serde_as(as = "DisplayFromStr")]
    log_level: LevelFilter,
}

const fn default_log_level() -> LevelFilter {
    LevelFilter::INFO
}

/// Complete configuration.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Routing and label handling.
    pub plugin: PluginConfiguration,

    /// Delivery clients.
    pub client: ClientConfiguration,

    /// Dynamic client controller.
    pub controller: ControllerConfiguration,

    /// Verbosity of the process logs.
    pub log_level: LevelFilter,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            plugin: PluginConfiguration::default(),
            client: ClientConfiguration::default(),
            controller: ControllerConfiguration::default(),
            log_level: default_log_level(),
        }
    }
}

impl Configuration {
    /// Builds the configuration from flat key/value pairs.
    ///
    /// Keys are matched exactly. Pairs with an empty value are treated as absent, and unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// If any value is malformed, or values are inconsistent with each other, an error is returned.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v): &(String, String)| !v.trim().is_empty())
            .collect::<BTreeMap<_, _>>();

        let value = serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.trim().to_string())))
                .collect(),
        );

        let mut plugin = PluginConfiguration::deserialize(&value).context(Malformed)?;
        let client = ClientConfiguration::deserialize(&value).context(Malformed)?;
        let mut controller = ControllerConfiguration::deserialize(&value).context(Malformed)?;
        let global = Global::deserialize(&value).context(Malformed)?;

        if let Some(value) = pairs.get(REMOVE_TENANT_KEY) {
            let remove = parse_flag(REMOVE_TENANT_KEY, value)?;
            if let Some(tenant) = plugin.dynamic_tenant.as_mut() {
                tenant.remove_tenant_id_when_sending_to_default_url = remove;
            }
        }

        apply_permissions(&pairs, &mut controller)?;

        let config = Self {
            plugin,
            client,
            controller,
            log_level: global.log_level,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let backoff = &self.client.backoff;
        if backoff.min_backoff > backoff.max_backoff {
            return Err(ConfigurationError::InvalidValue {
                key: "MinBackoff".to_string(),
                value: format!("{:?}", backoff.min_backoff),
                reason: format!("must not exceed MaxBackoff ({:?})", backoff.max_backoff),
            });
        }

        if self.client.batch_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                key: "BatchSize".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.client.buffer.queue.segment_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                key: "QueueSegmentSize".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigurationError> {
    de::parse_bool(value).ok_or_else(|| ConfigurationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: "expected a boolean".to_string(),
    })
}

fn apply_permissions(
    pairs: &BTreeMap<String, String>, controller: &mut ControllerConfiguration,
) -> Result<(), ConfigurationError> {
    for state in ClusterState::ALL {
        let main_key = format!("SendLogsToMainClusterWhenIsIn{}State", state);
        let dynamic_key = format!("SendLogsToDefaultClientWhenClusterIsIn{}State", state);

        for (key, matrix) in [
            (main_key, &mut controller.main_permissions),
            (dynamic_key, &mut controller.dynamic_permissions),
        ] {
            if let Some(value) = pairs.get(&key) {
                matrix.set(state, parse_flag(&key, value)?);
            }
        }
    }

    Ok(())
}
