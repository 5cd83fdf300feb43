//! Security group resolution with an in-run cache.

use std::collections::HashMap;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::failure::ProvisionError;
use crate::core::policy::creation_rules;
use crate::core::types::SecurityGroup;
use crate::io::provider::Provider;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOptions {
    /// Open ping, SSH and HTTP on a freshly created group.
    pub default_ports: bool,
}

/// Groups resolved during one run, keyed by name.
#[derive(Debug, Default)]
pub struct GroupCache {
    groups: HashMap<String, SecurityGroup>,
}

impl GroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&SecurityGroup> {
        self.groups.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Return the group called `name`, creating it if the provider has none.
    ///
    /// Existing groups are returned untouched. Ingress rules are only authorized
    /// on creation, and the group is cached only once every rule succeeded.
    #[instrument(skip(self, provider, options), fields(default_ports = options.default_ports))]
    pub fn ensure<P: Provider>(
        &mut self,
        provider: &P,
        name: &str,
        options: EnsureOptions,
    ) -> Result<SecurityGroup> {
        if let Some(group) = self.groups.get(name) {
            debug!(group = name, "security group cached");
            return Ok(group.clone());
        }

        let existing = provider
            .find_security_group(name)
            .map_err(|err| ProvisionError::provider(format!("look up security group {name}: {err:#}")))?;
        if let Some(group) = existing {
            debug!(group = name, id = %group.id, "security group exists");
            self.groups.insert(name.to_string(), group.clone());
            return Ok(group);
        }

        let mut group = provider
            .create_security_group(name, name)
            .map_err(|err| {
                ProvisionError::provider(format!("create security group {name}: {err:#}"))
            })?;
        info!(group = name, id = %group.id, "created security group");

        for rule in creation_rules(name, options.default_ports) {
            provider
                .authorize_ingress(&group, &rule)
                .map_err(|err| ProvisionError::provider(format!("authorize {rule}: {err:#}")))
                .with_context(|| format!("security group {name}"))?;
            debug!(group = name, %rule, "authorized ingress");
            group.rules.push(rule);
        }

        self.groups.insert(name.to_string(), group.clone());
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::{FailureKind, failure_kind};
    use crate::test_support::{ProviderCall, ScriptedProvider};

    const DEFAULT_PORTS: EnsureOptions = EnsureOptions {
        default_ports: true,
    };

    fn authorizations(provider: &ScriptedProvider) -> usize {
        provider.count_calls(|c| matches!(c, ProviderCall::AuthorizeIngress { .. }))
    }

    #[test]
    fn ensure_is_idempotent_within_a_run() {
        let provider = ScriptedProvider::new();
        let mut cache = GroupCache::new();

        let first = cache.ensure(&provider, "maps", DEFAULT_PORTS).expect("first");
        let second = cache.ensure(&provider, "maps", DEFAULT_PORTS).expect("second");

        assert_eq!(first, second);
        assert_eq!(first.rules.len(), 4);
        assert_eq!(
            provider.calls().first(),
            Some(&ProviderCall::FindSecurityGroup("maps".to_string()))
        );
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::FindSecurityGroup(_))),
            1
        );
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::CreateSecurityGroup(_))),
            1
        );
        assert_eq!(authorizations(&provider), 4);
    }

    #[test]
    fn existing_group_is_returned_without_authorizing() {
        let provider = ScriptedProvider::new().with_existing_group("web");
        let mut cache = GroupCache::new();

        let group = cache.ensure(&provider, "web", DEFAULT_PORTS).expect("ensure");

        assert_eq!(group.id, "sg-web");
        assert!(group.rules.is_empty());
        assert_eq!(authorizations(&provider), 0);
        assert!(cache.get("web").is_some());
    }

    #[test]
    fn role_rules_apply_without_default_ports() {
        let provider = ScriptedProvider::new();
        let mut cache = GroupCache::new();

        let group = cache
            .ensure(&provider, "gmond", EnsureOptions::default())
            .expect("ensure");

        let ports: Vec<i32> = group.rules.iter().map(|r| r.from_port).collect();
        assert_eq!(ports, vec![8649, 8651]);
    }

    #[test]
    fn failed_create_is_not_cached() {
        let provider = ScriptedProvider::new().failing_group_create();
        let mut cache = GroupCache::new();

        let err = cache.ensure(&provider, "maps", DEFAULT_PORTS).unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Provider);
        assert!(cache.is_empty());
    }
}
