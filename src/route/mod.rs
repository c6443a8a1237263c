//! Route table model: immutable after config load, shared by reference
//! across workers.

pub mod matcher;

pub use matcher::RouteMatcher;

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::config::{HeaderMatchConfig, HeaderMatchKind, RouteConfig};
use crate::metadata::Metadata;
use crate::runtime::{FractionalPercent, RuntimeLoader};

/// One compiled header predicate. All predicates on a route must hold
/// for the route to match; `invert` flips an individual predicate.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: String,
    kind: HeaderPredicate,
    invert: bool,
}

#[derive(Debug, Clone)]
enum HeaderPredicate {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    Range { start: i64, end: i64 },
    Present,
}

impl HeaderMatcher {
    pub fn from_config(config: &HeaderMatchConfig) -> Result<Self> {
        let kind = match &config.kind {
            HeaderMatchKind::Exact(v) => HeaderPredicate::Exact(v.clone()),
            HeaderMatchKind::Prefix(v) => HeaderPredicate::Prefix(v.clone()),
            HeaderMatchKind::Suffix(v) => HeaderPredicate::Suffix(v.clone()),
            HeaderMatchKind::Regex(v) => HeaderPredicate::Regex(
                Regex::new(v).with_context(|| format!("invalid regex for header '{}'", config.name))?,
            ),
            HeaderMatchKind::Range { start, end } => HeaderPredicate::Range {
                start: *start,
                end: *end,
            },
            HeaderMatchKind::Present => HeaderPredicate::Present,
        };
        Ok(Self {
            name: config.name.clone(),
            kind,
            invert: config.invert,
        })
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        let value = metadata.get_string(&self.name);
        let result = match (&self.kind, value) {
            (HeaderPredicate::Present, v) => v.is_some(),
            (_, None) => false,
            (HeaderPredicate::Exact(want), Some(v)) => v == want,
            (HeaderPredicate::Prefix(want), Some(v)) => v.starts_with(want.as_str()),
            (HeaderPredicate::Suffix(want), Some(v)) => v.ends_with(want.as_str()),
            (HeaderPredicate::Regex(re), Some(v)) => re.is_match(v),
            (HeaderPredicate::Range { start, end }, Some(v)) => match v.parse::<i64>() {
                Ok(n) => n >= *start && n < *end,
                Err(_) => false,
            },
        };
        result != self.invert
    }
}

/// Hash policy: header values folded into a consistent-hash key for the
/// host load balancer.
#[derive(Debug, Clone, Default)]
pub struct HashPolicy {
    header_keys: Vec<String>,
}

impl HashPolicy {
    pub fn new(header_keys: Vec<String>) -> Self {
        Self { header_keys }
    }

    pub fn is_empty(&self) -> bool {
        self.header_keys.is_empty()
    }

    pub fn hash_key(&self, metadata: &Metadata) -> Option<u64> {
        if self.header_keys.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        let mut any = false;
        for key in &self.header_keys {
            if let Some(value) = metadata.get_string(key) {
                key.hash(&mut hasher);
                value.hash(&mut hasher);
                any = true;
            }
        }
        any.then(|| hasher.finish())
    }
}

/// Probabilistic request duplication to a secondary cluster.
#[derive(Debug, Clone)]
pub struct MirrorPolicy {
    cluster_name: String,
    runtime_key: String,
    default_fraction: FractionalPercent,
}

impl MirrorPolicy {
    pub fn new(
        cluster_name: impl Into<String>,
        runtime_key: impl Into<String>,
        default_fraction: FractionalPercent,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            runtime_key: runtime_key.into(),
            default_fraction,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn should_shadow(&self, runtime: &dyn RuntimeLoader, stable_random: u64) -> bool {
        let fraction = runtime.fractional_percent(&self.runtime_key, self.default_fraction);
        fraction.enabled(stable_random)
    }
}

#[derive(Debug, Clone)]
struct WeightedClusterEntry {
    name: String,
    weight: u64,
    metadata_match: Vec<(String, String)>,
}

/// Cluster picked for one request by a matched route.
#[derive(Debug, Clone)]
pub struct ClusterChoice {
    pub cluster_name: String,
    /// Subset-selection override from a weighted entry, if any.
    pub metadata_match: Option<Vec<(String, String)>>,
}

/// The outcome of a successful route match: the route plus the cluster
/// choice made for this request.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    pub route: Arc<RouteEntry>,
    pub cluster_name: String,
    pub metadata_match: Option<Vec<(String, String)>>,
}

/// One route: header predicates plus the action taken on match.
#[derive(Debug)]
pub struct RouteEntry {
    route_name: String,
    cluster_name: String,
    headers: Vec<HeaderMatcher>,
    weighted_clusters: Vec<WeightedClusterEntry>,
    total_cluster_weight: u64,
    request_mutation: Vec<(String, String)>,
    response_mutation: Vec<(String, String)>,
    hash_policy: HashPolicy,
    mirror_policies: Vec<MirrorPolicy>,
}

impl RouteEntry {
    pub fn from_config(config: &RouteConfig) -> Result<Arc<Self>> {
        let headers = config
            .headers
            .iter()
            .map(HeaderMatcher::from_config)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("route '{}'", config.name))?;

        let action = &config.action;
        let weighted_clusters: Vec<WeightedClusterEntry> = action
            .weighted_clusters
            .iter()
            .map(|w| WeightedClusterEntry {
                name: w.name.clone(),
                weight: w.weight,
                metadata_match: w
                    .metadata_match
                    .iter()
                    .map(|kv| (kv.key.clone(), kv.value.clone()))
                    .collect(),
            })
            .collect();

        let weight_sum: u64 = weighted_clusters.iter().map(|w| w.weight).sum();
        let total_cluster_weight = if action.total_weight > 0 {
            action.total_weight
        } else {
            weight_sum
        };
        if !weighted_clusters.is_empty() {
            if weight_sum != total_cluster_weight {
                bail!(
                    "route '{}': weighted cluster weights sum to {}, declared total is {}",
                    config.name,
                    weight_sum,
                    total_cluster_weight
                );
            }
            if total_cluster_weight == 0 {
                bail!("route '{}': total cluster weight must be non-zero", config.name);
            }
        } else if action.cluster.is_empty() {
            bail!("route '{}': no cluster or weighted clusters configured", config.name);
        }

        let mirror_policies = action
            .request_mirror_policies
            .iter()
            .map(|m| MirrorPolicy::new(m.cluster.clone(), m.runtime_key.clone(), m.default_fraction))
            .collect();

        Ok(Arc::new(Self {
            route_name: config.name.clone(),
            cluster_name: action.cluster.clone(),
            headers,
            weighted_clusters,
            total_cluster_weight,
            request_mutation: action
                .request_mutation
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
            response_mutation: action
                .response_mutation
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
            hash_policy: HashPolicy::new(action.hash_policy.clone()),
            mirror_policies,
        }))
    }

    pub fn route_name(&self) -> &str {
        &self.route_name
    }

    pub fn request_mutation(&self) -> &[(String, String)] {
        &self.request_mutation
    }

    pub fn response_mutation(&self) -> &[(String, String)] {
        &self.response_mutation
    }

    pub fn hash_policy(&self) -> &HashPolicy {
        &self.hash_policy
    }

    pub fn mirror_policies(&self) -> &[MirrorPolicy] {
        &self.mirror_policies
    }

    pub fn headers_match(&self, metadata: &Metadata) -> bool {
        self.headers.iter().all(|h| h.matches(metadata))
    }

    /// Select the cluster for a matched route. With weighted clusters the
    /// pick walks the declaration order accumulating weight until the
    /// running sum exceeds `random_value % total`; zero-weight entries can
    /// never win.
    pub fn cluster_entry(&self, random_value: u64) -> ClusterChoice {
        if self.weighted_clusters.is_empty() {
            return ClusterChoice {
                cluster_name: self.cluster_name.clone(),
                metadata_match: None,
            };
        }

        let r = random_value % self.total_cluster_weight;
        let mut running = 0u64;
        for entry in &self.weighted_clusters {
            running += entry.weight;
            if running > r {
                return ClusterChoice {
                    cluster_name: entry.name.clone(),
                    metadata_match: (!entry.metadata_match.is_empty())
                        .then(|| entry.metadata_match.clone()),
                };
            }
        }

        // Unreachable while the sum invariant holds; fall back to the last
        // entry rather than panic on a bad table.
        let last = self.weighted_clusters.last().expect("non-empty weighted clusters");
        ClusterChoice {
            cluster_name: last.name.clone(),
            metadata_match: None,
        }
    }

    pub fn matches(&self, metadata: &Metadata, random_value: u64) -> Option<ClusterChoice> {
        if self.headers_match(metadata) {
            Some(self.cluster_entry(random_value))
        } else {
            None
        }
    }
}
