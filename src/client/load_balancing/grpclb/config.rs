//! The grpclb JSON configuration.

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Deserialize;

use crate::client::load_balancing::{LbPolicyBuilder, GLOBAL_LB_REGISTRY};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};

/// The name of the child policy used when the config does not specify one.
pub(crate) const DEFAULT_CHILD_POLICY: &str = "round_robin";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrpclbJsonConfig {
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    child_policy: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
}

/// The parsed grpclb configuration: the service name to claim in the
/// initial balancer request (the channel authority when empty) and the
/// child policy to delegate picks to.
#[derive(Clone)]
pub(crate) struct GrpclbConfig {
    pub service_name: String,
    pub child_policy_builder: Arc<dyn LbPolicyBuilder>,
    pub child_policy_config: Option<LbConfig>,
}

impl Debug for GrpclbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpclbConfig")
            .field("service_name", &self.service_name)
            .field("child_policy", &self.child_policy_builder.name())
            .finish()
    }
}

impl GrpclbConfig {
    pub fn parse(config: &ParsedJsonLbConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let json: GrpclbJsonConfig = config
            .convert_to()
            .map_err(|e| format!("errors validating grpclb LB policy config: {e}"))?;
        let (child_policy_builder, child_policy_config) = match &json.child_policy {
            None => (default_child_policy_builder()?, None),
            Some(candidates) => parse_child_policy(candidates)?,
        };
        Ok(GrpclbConfig {
            service_name: json.service_name.unwrap_or_default(),
            child_policy_builder,
            child_policy_config,
        })
    }

    /// The configuration used when the service config carries no grpclb
    /// entry at all.
    pub fn default_config() -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(GrpclbConfig {
            service_name: String::new(),
            child_policy_builder: default_child_policy_builder()?,
            child_policy_config: None,
        })
    }
}

fn default_child_policy_builder() -> Result<Arc<dyn LbPolicyBuilder>, Box<dyn Error + Send + Sync>>
{
    GLOBAL_LB_REGISTRY
        .get_policy(DEFAULT_CHILD_POLICY)
        .ok_or_else(|| format!("default child policy {DEFAULT_CHILD_POLICY} not registered").into())
}

// Selects the first candidate whose policy name is registered, per the
// service config's list-of-alternatives semantics.  A recognized candidate
// whose configuration fails validation rejects the whole config.
fn parse_child_policy(
    candidates: &[serde_json::Map<String, serde_json::Value>],
) -> Result<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>), Box<dyn Error + Send + Sync>> {
    for candidate in candidates {
        if candidate.len() != 1 {
            return Err(format!(
                "childPolicy entries must contain exactly one policy, found {}",
                candidate.len()
            )
            .into());
        }
        let (name, value) = candidate.iter().next().unwrap();
        let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(name) else {
            continue;
        };
        let config = builder
            .parse_config(&ParsedJsonLbConfig::from_value(value.clone()))
            .map_err(|e| format!("errors validating {name} config: {e}"))?;
        return Ok((builder, config));
    }
    Err("no known policy in childPolicy list".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::test_utils::{self, StubPolicyFuncs};
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<GrpclbConfig, Box<dyn Error + Send + Sync>> {
        GrpclbConfig::parse(&ParsedJsonLbConfig::from_value(value))
    }

    #[test]
    fn empty_config_defaults_to_round_robin() {
        test_utils::reg_stub_policy(DEFAULT_CHILD_POLICY, StubPolicyFuncs::default());

        let config = parse(json!({})).unwrap();
        assert_eq!(config.service_name, "");
        assert_eq!(config.child_policy_builder.name(), DEFAULT_CHILD_POLICY);
        assert!(config.child_policy_config.is_none());
    }

    #[test]
    fn service_name_is_parsed() {
        test_utils::reg_stub_policy(DEFAULT_CHILD_POLICY, StubPolicyFuncs::default());

        let config = parse(json!({"serviceName": "lb.test.example.com"})).unwrap();
        assert_eq!(config.service_name, "lb.test.example.com");
    }

    #[test]
    fn first_known_child_policy_wins() {
        test_utils::reg_stub_policy("stub-known-child", StubPolicyFuncs::default());

        let config = parse(json!({
            "childPolicy": [
                {"totally_unknown_policy": {}},
                {"stub-known-child": {}},
                {"another_unknown": {}},
            ]
        }))
        .unwrap();
        assert_eq!(config.child_policy_builder.name(), "stub-known-child");
    }

    #[test]
    fn unknown_child_policies_are_rejected() {
        assert!(parse(json!({"childPolicy": [{"totally_unknown_policy": {}}]})).is_err());
        assert!(parse(json!({"childPolicy": []})).is_err());
    }

    #[test]
    fn invalid_child_policy_config_rejects_update() {
        test_utils::reg_stub_policy(
            "stub-rejects-config",
            StubPolicyFuncs {
                parse_config: Some(Arc::new(|_| Err("bad config".into()))),
                ..Default::default()
            },
        );

        let err = parse(json!({"childPolicy": [{"stub-rejects-config": {}}]})).unwrap_err();
        assert!(err.to_string().contains("bad config"));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(parse(json!({"childPolicy": [{}]})).is_err());
        assert!(parse(json!({"childPolicy": "round_robin"})).is_err());
    }
}
