use super::types::{PolicyClass, RateLimitPolicy};
use crate::config::RateLimitingConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The policies for every predefined class, built once at startup
#[derive(Debug, Clone)]
pub struct PolicySet {
    policies: HashMap<PolicyClass, Arc<RateLimitPolicy>>,
}

impl PolicySet {
    /// Defaults for every class, with config overrides applied
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let mut policies = HashMap::new();

        for class in PolicyClass::ALL {
            let policy = match config.policies.get(&class) {
                Some(overridden) => {
                    let mut overridden = overridden.clone();
                    if overridden.message.is_none() {
                        overridden.message = class.default_config().message;
                    }
                    overridden.into_policy(class.name())?
                }
                None => RateLimitPolicy::for_class(class),
            };

            info!(
                policy = class.name(),
                requests = policy.max_requests(),
                window_secs = policy.window_secs(),
                "Loaded rate limit policy"
            );
            policies.insert(class, Arc::new(policy));
        }

        Ok(Self { policies })
    }

    pub fn get(&self, class: PolicyClass) -> Arc<RateLimitPolicy> {
        self.policies
            .get(&class)
            .cloned()
            .unwrap_or_else(|| Arc::new(RateLimitPolicy::for_class(class)))
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: PolicyClass::ALL
                .into_iter()
                .map(|class| (class, Arc::new(RateLimitPolicy::for_class(class))))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::{RateLimitConfig, RateLimitDimension};

    #[test]
    fn test_defaults_for_every_class() {
        let set = PolicySet::from_config(&RateLimitingConfig::default()).unwrap();
        assert_eq!(set.get(PolicyClass::Generation).max_requests(), 10);
        assert_eq!(set.get(PolicyClass::Auth).window_secs(), 300);
        assert_eq!(set.get(PolicyClass::ReadOnly).name(), "read_only");
    }

    #[test]
    fn test_override_keeps_default_message() {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(
            PolicyClass::Search,
            RateLimitConfig {
                dimension: RateLimitDimension::User,
                requests: 99,
                window_secs: 10,
                message: None,
            },
        );

        let set = PolicySet::from_config(&config).unwrap();
        let search = set.get(PolicyClass::Search);
        assert_eq!(search.max_requests(), 99);
        assert_eq!(search.window_secs(), 10);
        assert_eq!(search.dimension(), RateLimitDimension::User);
        assert_eq!(
            search.message(),
            PolicyClass::Search.default_config().message.unwrap()
        );
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = RateLimitingConfig::default();
        config.policies.insert(
            PolicyClass::Export,
            RateLimitConfig {
                dimension: RateLimitDimension::Ip,
                requests: 0,
                window_secs: 60,
                message: None,
            },
        );

        assert!(PolicySet::from_config(&config).is_err());
    }
}
