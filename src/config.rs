//! Parsed configuration handed over by the host. The host is responsible
//! for reading these out of whatever document format it uses; this crate
//! consumes the deserialized form only.

use serde::{Deserialize, Serialize};

use crate::runtime::FractionalPercent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteConfiguration {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    #[serde(default)]
    pub headers: Vec<HeaderMatchConfig>,
    pub action: RouteActionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub kind: HeaderMatchKind,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderMatchKind {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(String),
    Range { start: i64, end: i64 },
    Present,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouteActionConfig {
    /// Primary cluster, used when no weighted clusters are configured.
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub weighted_clusters: Vec<WeightedClusterConfig>,
    /// Declared sum of the weighted-cluster weights.
    #[serde(default)]
    pub total_weight: u64,
    /// Header keys hashed into the load-balancer hash key.
    #[serde(default)]
    pub hash_policy: Vec<String>,
    #[serde(default)]
    pub request_mutation: Vec<KeyValueConfig>,
    #[serde(default)]
    pub response_mutation: Vec<KeyValueConfig>,
    #[serde(default)]
    pub request_mirror_policies: Vec<MirrorPolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedClusterConfig {
    pub name: String,
    pub weight: u64,
    /// Opaque subset-load-balancing keys forwarded to the host.
    #[serde(default)]
    pub metadata_match: Vec<KeyValueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorPolicyConfig {
    pub cluster: String,
    #[serde(default)]
    pub runtime_key: String,
    pub default_fraction: FractionalPercent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDescriptorConfig {
    pub entries: Vec<KeyValueConfig>,
    pub token_bucket: TokenBucketConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRateLimitConfig {
    pub token_bucket: TokenBucketConfig,
    #[serde(default)]
    pub descriptors: Vec<RateLimitDescriptorConfig>,
    #[serde(default = "default_rate_limit_message")]
    pub error_message: String,
}

fn default_rate_limit_message() -> String {
    "local rate limit exceeded".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FractionDenominator;

    #[test]
    fn test_route_configuration_roundtrip() {
        let config = RouteConfiguration {
            name: "ingress".to_string(),
            routes: vec![RouteConfig {
                name: "svc-a".to_string(),
                headers: vec![HeaderMatchConfig {
                    name: "x-env".to_string(),
                    kind: HeaderMatchKind::Exact("prod".to_string()),
                    invert: false,
                }],
                action: RouteActionConfig {
                    cluster: "c1".to_string(),
                    request_mirror_policies: vec![MirrorPolicyConfig {
                        cluster: "c1-shadow".to_string(),
                        runtime_key: "mirror.svc-a".to_string(),
                        default_fraction: FractionalPercent::new(50, FractionDenominator::Hundred),
                    }],
                    ..Default::default()
                },
            }],
        };

        let encoded = bincode::serialize(&config).unwrap();
        let decoded: RouteConfiguration = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded.routes.len(), 1);
        assert_eq!(decoded.routes[0].action.cluster, "c1");
        assert_eq!(
            decoded.routes[0].action.request_mirror_policies[0].cluster,
            "c1-shadow"
        );
    }

    #[test]
    fn test_rate_limit_config_default_message() {
        let config = LocalRateLimitConfig {
            token_bucket: TokenBucketConfig {
                max_tokens: 5,
                tokens_per_fill: 5,
                fill_interval_ms: 1000,
            },
            descriptors: Vec::new(),
            error_message: default_rate_limit_message(),
        };
        assert_eq!(config.error_message, "local rate limit exceeded");
    }
}
