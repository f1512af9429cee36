use std::time::Duration;

use logship_core::SendPermissionMatrix;
use serde::Deserialize;
use serde_with::serde_as;

use crate::de::HumanDuration;

const fn default_ctl_sync_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_deleted_client_time_expiration() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_main_permissions() -> SendPermissionMatrix {
    SendPermissionMatrix::main_defaults()
}

const fn default_dynamic_permissions() -> SendPermissionMatrix {
    SendPermissionMatrix::dynamic_defaults()
}

/// Controller configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ControllerConfiguration {
    /// Interval between reconciliation passes.
    ///
    /// Defaults to 60 seconds.
    #[serde(rename = "CtlSyncTimeout", default = "default_ctl_sync_timeout")]
    #[serde_as(as = "HumanDuration")]
    pub ctl_sync_timeout: Duration,

    /// How long a destination has to stay deleted before its client is torn down.
    ///
    /// Defaults to 1 hour.
    #[serde(
        rename = "DeletedClientTimeExpiration",
        default = "default_deleted_client_time_expiration"
    )]
    #[serde_as(as = "HumanDuration")]
    pub deleted_client_time_expiration: Duration,

    /// Send permissions of the main destination.
    ///
    /// Populated from the `SendLogsToMainClusterWhenIsIn<State>State` keys.
    #[serde(skip_deserializing, default = "default_main_permissions")]
    pub main_permissions: SendPermissionMatrix,

    /// Send permissions of dynamically managed destinations.
    ///
    /// Populated from the `SendLogsToDefaultClientWhenClusterIsIn<State>State` keys.
    #[serde(skip_deserializing, default = "default_dynamic_permissions")]
    pub dynamic_permissions: SendPermissionMatrix,
}

impl Default for ControllerConfiguration {
    fn default() -> Self {
        Self {
            ctl_sync_timeout: default_ctl_sync_timeout(),
            deleted_client_time_expiration: default_deleted_client_time_expiration(),
            main_permissions: default_main_permissions(),
            dynamic_permissions: default_dynamic_permissions(),
        }
    }
}
