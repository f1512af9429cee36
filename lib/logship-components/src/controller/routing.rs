use logship_config::{Configuration, DynamicHostPath, DynamicTenant};
use logship_core::{DestinationKey, LabelSet, TENANT_LABEL};
use logship_error::{ErrorContext as _, GenericError};
use regex::Regex;
use url::Url;

use super::DestinationTarget;

/// Resolves the destination of each entry.
///
/// When a dynamic host path is configured, the label it names holds the destination name. Names matching the dynamic
/// host regex are routed to their own destination, whose push URL is `<prefix><name><suffix>`. Every other entry goes
/// to the main destination.
pub struct Router {
    main: DestinationTarget,
    host_path: Option<DynamicHostPath>,
    host_prefix: String,
    host_suffix: String,
    host_regex: Regex,
    tenant: Option<DynamicTenant>,
}

impl Router {
    /// Creates a new `Router` from the given configuration.
    pub fn from_configuration(config: &Configuration) -> Self {
        let tenant = Some(config.client.tenant_id.clone()).filter(|tenant| !tenant.is_empty());
        Self {
            main: DestinationTarget {
                url: config.client.url.clone(),
                tenant,
            },
            host_path: config.plugin.dynamic_host_path.clone(),
            host_prefix: config.plugin.dynamic_host_prefix.clone(),
            host_suffix: config.plugin.dynamic_host_suffix.clone(),
            host_regex: config.plugin.dynamic_host_regex.clone(),
            tenant: config.plugin.dynamic_tenant.clone(),
        }
    }

    /// Resolves the destination of an entry.
    ///
    /// Assigns the dynamic tenant, if the entry matches it, by setting the reserved tenant label. If the entry then
    /// falls back to the main destination, the tenant label is dropped again when so configured.
    pub fn route(&self, labels: &mut LabelSet) -> DestinationKey {
        if let Some(tenant) = &self.tenant {
            let matches = labels.get(&tenant.field).is_some_and(|value| tenant.regex.is_match(value));
            if matches {
                labels.insert(TENANT_LABEL, tenant.tenant.clone());
            }
        }

        let dynamic_host = self
            .host_path
            .as_ref()
            .and_then(|path| labels.get(&path.label))
            .filter(|name| !name.is_empty() && self.host_regex.is_match(name));
        if let Some(name) = dynamic_host {
            return DestinationKey::named(name);
        }

        if self
            .tenant
            .as_ref()
            .is_some_and(|tenant| tenant.remove_tenant_id_when_sending_to_default_url)
        {
            labels.remove(TENANT_LABEL);
        }

        DestinationKey::Main
    }

    /// Returns where entries for `destination` are pushed to.
    ///
    /// # Errors
    ///
    /// If the push URL of a dynamic destination is not a valid URL, an error is returned.
    pub fn target(&self, destination: &DestinationKey) -> Result<DestinationTarget, GenericError> {
        match destination {
            DestinationKey::Main => Ok(self.main.clone()),
            DestinationKey::Named(name) => {
                let url = format!("{}{}{}", self.host_prefix, name, self.host_suffix);
                let url = Url::parse(&url)
                    .with_error_context(|| format!("Invalid push URL '{}' for destination '{}'.", url, name))?;
                Ok(DestinationTarget {
                    url,
                    tenant: self.main.tenant.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(pairs: &[(&str, &str)]) -> Router {
        Router::from_configuration(&Configuration::from_pairs(pairs.iter().copied()).unwrap())
    }

    fn dynamic() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DynamicHostPath", r#"{"kubernetes": {"namespace_name": "namespace"}}"#),
            ("DynamicHostPrefix", "http://loki."),
            ("DynamicHostSuffix", ".svc:3100/loki/api/v1/push"),
            ("DynamicHostRegex", "^shoot--"),
        ]
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn everything_goes_to_main_without_dynamic_hosts() {
        let router = router(&[]);
        let mut set = labels(&[("namespace", "shoot--dev--a")]);
        assert_eq!(router.route(&mut set), DestinationKey::Main);
        assert_eq!(
            router.target(&DestinationKey::Main).unwrap().url.as_str(),
            "http://localhost:3100/loki/api/v1/push"
        );
    }

    #[test]
    fn matching_names_get_their_own_destination() {
        let router = router(&dynamic());

        let mut set = labels(&[("namespace", "shoot--dev--a")]);
        let key = router.route(&mut set);
        assert_eq!(key, DestinationKey::named("shoot--dev--a"));
        assert_eq!(
            router.target(&key).unwrap().url.as_str(),
            "http://loki.shoot--dev--a.svc:3100/loki/api/v1/push"
        );

        let mut set = labels(&[("namespace", "garden")]);
        assert_eq!(router.route(&mut set), DestinationKey::Main);

        let mut set = labels(&[("pod_name", "shoot--dev--a")]);
        assert_eq!(router.route(&mut set), DestinationKey::Main);
    }

    #[test]
    fn dynamic_tenant_is_dropped_on_fallback_to_main() {
        let mut pairs = dynamic();
        pairs.push(("DynamicTenant", "user tag user-exposed.*"));
        let router = router(&pairs);

        let mut set = labels(&[("namespace", "shoot--dev--a"), ("tag", "user-exposed.kubernetes")]);
        router.route(&mut set);
        assert_eq!(set.get(TENANT_LABEL), Some("user"));

        let mut set = labels(&[("namespace", "garden"), ("tag", "user-exposed.kubernetes")]);
        assert_eq!(router.route(&mut set), DestinationKey::Main);
        assert!(!set.contains_key(TENANT_LABEL));

        let mut set = labels(&[("namespace", "shoot--dev--a"), ("tag", "operator")]);
        router.route(&mut set);
        assert!(!set.contains_key(TENANT_LABEL));
    }

    #[test]
    fn dynamic_tenant_can_be_kept_on_fallback_to_main() {
        let mut pairs = dynamic();
        pairs.push(("DynamicTenant", "user tag user-exposed.*"));
        pairs.push(("RemoveTenantIdWhenSendingToDefaultURL", "false"));
        let router = router(&pairs);

        let mut set = labels(&[("namespace", "garden"), ("tag", "user-exposed.kubernetes")]);
        assert_eq!(router.route(&mut set), DestinationKey::Main);
        assert_eq!(set.get(TENANT_LABEL), Some("user"));
    }
}
