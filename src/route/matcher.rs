use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::config::RouteConfiguration;
use crate::metadata::Metadata;
use crate::route::{RouteEntry, RouteSelection};

/// Ordered route table. Routes are tried in declaration order; the first
/// route whose header predicates all hold wins.
#[derive(Debug, Default)]
pub struct RouteMatcher {
    routes: Vec<Arc<RouteEntry>>,
}

impl RouteMatcher {
    pub fn from_config(config: &RouteConfiguration) -> Result<Self> {
        let routes = config
            .routes
            .iter()
            .map(RouteEntry::from_config)
            .collect::<Result<Vec<_>>>()?;
        debug!(table = %config.name, routes = routes.len(), "route table loaded");
        Ok(Self { routes })
    }

    /// Find the route and cluster for a decoded request. `random_value`
    /// drives weighted-cluster selection. Returns `None` when no route
    /// matches.
    pub fn route(&self, metadata: &Metadata, random_value: u64) -> Option<RouteSelection> {
        for route in &self.routes {
            if let Some(choice) = route.matches(metadata, random_value) {
                debug!(
                    route = route.route_name(),
                    cluster = %choice.cluster_name,
                    request_id = metadata.request_id(),
                    "route matched"
                );
                return Some(RouteSelection {
                    route: route.clone(),
                    cluster_name: choice.cluster_name,
                    metadata_match: choice.metadata_match,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        HeaderMatchConfig, HeaderMatchKind, RouteActionConfig, RouteConfig, WeightedClusterConfig,
    };
    use crate::metadata::MessageType;

    fn metadata_with(headers: &[(&str, &str)]) -> Metadata {
        let mut md = Metadata::new(MessageType::Request);
        for (k, v) in headers {
            md.put_string(*k, *v);
        }
        md
    }

    fn table() -> RouteMatcher {
        RouteMatcher::from_config(&RouteConfiguration {
            name: "ingress".to_string(),
            routes: vec![
                RouteConfig {
                    name: "svc-a".to_string(),
                    headers: vec![HeaderMatchConfig {
                        name: "svc".to_string(),
                        kind: HeaderMatchKind::Exact("a".to_string()),
                        invert: false,
                    }],
                    action: RouteActionConfig {
                        cluster: "c1".to_string(),
                        weighted_clusters: vec![
                            WeightedClusterConfig {
                                name: "c2".to_string(),
                                weight: 75,
                                metadata_match: Vec::new(),
                            },
                            WeightedClusterConfig {
                                name: "c3".to_string(),
                                weight: 25,
                                metadata_match: Vec::new(),
                            },
                        ],
                        total_weight: 100,
                        ..Default::default()
                    },
                },
                RouteConfig {
                    name: "catch-all".to_string(),
                    headers: Vec::new(),
                    action: RouteActionConfig {
                        cluster: "fallback".to_string(),
                        ..Default::default()
                    },
                },
            ],
        })
        .unwrap()
    }

    #[test]
    fn test_first_matching_route_wins() {
        let matcher = table();
        let selection = matcher.route(&metadata_with(&[("svc", "a")]), 10).unwrap();
        assert_eq!(selection.route.route_name(), "svc-a");
        assert_eq!(selection.cluster_name, "c2");
    }

    #[test]
    fn test_weighted_pick_by_random_value() {
        let matcher = table();
        let md = metadata_with(&[("svc", "a")]);
        assert_eq!(matcher.route(&md, 10).unwrap().cluster_name, "c2");
        assert_eq!(matcher.route(&md, 80).unwrap().cluster_name, "c3");
    }

    #[test]
    fn test_fallthrough_to_later_route() {
        let matcher = table();
        let selection = matcher.route(&metadata_with(&[("svc", "b")]), 0).unwrap();
        assert_eq!(selection.route.route_name(), "catch-all");
        assert_eq!(selection.cluster_name, "fallback");
    }

    #[test]
    fn test_no_route_returns_none() {
        let matcher = RouteMatcher::from_config(&RouteConfiguration {
            name: "empty".to_string(),
            routes: vec![RouteConfig {
                name: "strict".to_string(),
                headers: vec![HeaderMatchConfig {
                    name: "svc".to_string(),
                    kind: HeaderMatchKind::Exact("a".to_string()),
                    invert: false,
                }],
                action: RouteActionConfig {
                    cluster: "c1".to_string(),
                    ..Default::default()
                },
            }],
        })
        .unwrap();
        assert!(matcher.route(&metadata_with(&[("svc", "b")]), 0).is_none());
    }

    #[test]
    fn test_all_predicates_must_hold() {
        let matcher = RouteMatcher::from_config(&RouteConfiguration {
            name: "multi".to_string(),
            routes: vec![RouteConfig {
                name: "strict".to_string(),
                headers: vec![
                    HeaderMatchConfig {
                        name: "svc".to_string(),
                        kind: HeaderMatchKind::Exact("a".to_string()),
                        invert: false,
                    },
                    HeaderMatchConfig {
                        name: "x-env".to_string(),
                        kind: HeaderMatchKind::Exact("prod".to_string()),
                        invert: false,
                    },
                ],
                action: RouteActionConfig {
                    cluster: "c1".to_string(),
                    ..Default::default()
                },
            }],
        })
        .unwrap();
        assert!(matcher
            .route(&metadata_with(&[("svc", "a"), ("x-env", "prod")]), 0)
            .is_some());
        assert!(matcher.route(&metadata_with(&[("svc", "a")]), 0).is_none());
    }
}
