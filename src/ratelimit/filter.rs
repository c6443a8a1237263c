//! Decoder filter enforcing the local rate limit before routing.

use std::sync::Arc;
use tracing::debug;

use crate::codec::AppException;
use crate::config::LocalRateLimitConfig;
use crate::error::{Error, ErrorType};
use crate::filter::{DecoderFilter, FilterStatus};
use crate::metadata::{Metadata, SharedMetadata, SharedMutation};
use crate::ratelimit::{DescriptorEntry, LocalDescriptor, LocalRateLimiter};
use crate::stream::StreamHandle;

pub struct LocalRateLimitFilter {
    limiter: Arc<LocalRateLimiter>,
    /// Configured descriptor shapes; request descriptors are built from
    /// the matching header values.
    descriptor_keys: Vec<Vec<String>>,
    error_message: String,
    callbacks: Option<StreamHandle>,
}

impl LocalRateLimitFilter {
    pub fn new(config: &LocalRateLimitConfig, limiter: Arc<LocalRateLimiter>) -> Self {
        Self {
            limiter,
            descriptor_keys: config
                .descriptors
                .iter()
                .map(|d| d.entries.iter().map(|kv| kv.key.clone()).collect())
                .collect(),
            error_message: config.error_message.clone(),
            callbacks: None,
        }
    }

    /// Build one candidate descriptor per configured shape, skipping
    /// shapes whose headers are absent from the request.
    fn build_descriptors(&self, metadata: &Metadata) -> Vec<LocalDescriptor> {
        let mut descriptors = Vec::new();
        for keys in &self.descriptor_keys {
            let mut entries = Vec::with_capacity(keys.len());
            for key in keys {
                match metadata.get_string(key) {
                    Some(value) => entries.push(DescriptorEntry::new(key.clone(), value)),
                    None => {
                        entries.clear();
                        break;
                    }
                }
            }
            if !entries.is_empty() {
                descriptors.push(LocalDescriptor::new(entries));
            }
        }
        descriptors
    }
}

impl DecoderFilter for LocalRateLimitFilter {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.callbacks = Some(callbacks);
    }

    fn on_message_decoded(
        &mut self,
        metadata: &SharedMetadata,
        _mutation: &SharedMutation,
    ) -> FilterStatus {
        let descriptors = {
            let md = metadata.lock().expect("metadata mutex poisoned");
            self.build_descriptors(&md)
        };
        if self.limiter.request_allowed(&descriptors) {
            return FilterStatus::ContinueIteration;
        }

        let handle = self.callbacks.clone().expect("decoder callbacks not set");
        debug!(
            request_id = handle.request_id(),
            "request over local rate limit"
        );
        handle.set_response_code_detail("request_rate_limited");
        handle.send_local_reply(
            Box::new(AppException::new(Error::new(
                ErrorType::OverLimit,
                self.error_message.clone(),
            ))),
            false,
        );
        FilterStatus::StopIteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        KeyValueConfig, RateLimitDescriptorConfig, RouteActionConfig, RouteConfig,
        RouteConfiguration, TokenBucketConfig,
    };
    use crate::filter::{FilterChainFactory, FilterChainFactoryCallbacks};
    use crate::frame::RpcFrame;
    use crate::metadata::MessageType;
    use crate::route::RouteMatcher;
    use crate::stream::testing::{proxy_context, MockDownstream};
    use crate::stream::MessageStream;
    use crate::upstream::testing::{single_cluster_manager, MockPool, MockPoolMode};
    use bytes::BytesMut;

    fn limit_config(max: u32, descriptors: Vec<RateLimitDescriptorConfig>) -> LocalRateLimitConfig {
        LocalRateLimitConfig {
            token_bucket: TokenBucketConfig {
                max_tokens: max,
                tokens_per_fill: max,
                fill_interval_ms: 1000,
            },
            descriptors,
            error_message: "local rate limit exceeded".to_string(),
        }
    }

    struct RateLimitChainFactory {
        config: LocalRateLimitConfig,
        limiter: Arc<LocalRateLimiter>,
    }

    impl FilterChainFactory for RateLimitChainFactory {
        fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks) {
            callbacks.add_decoder_filter(Box::new(LocalRateLimitFilter::new(
                &self.config,
                self.limiter.clone(),
            )));
        }
    }

    fn oneway_bytes(request_id: u64) -> BytesMut {
        RpcFrame::new(MessageType::Oneway, request_id, 1)
            .with_header("client", "gold")
            .with_payload(b"fire".to_vec())
            .encode()
            .unwrap()
    }

    fn stream_with_limit(
        config: LocalRateLimitConfig,
    ) -> (
        MessageStream,
        Arc<LocalRateLimiter>,
        Arc<MockPool>,
        Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    ) {
        let pool = MockPool::new(MockPoolMode::SyncReady, "10.0.0.9:8000");
        let manager = single_cluster_manager("c1", false, Some(pool.clone()));
        let context = proxy_context(
            RouteMatcher::from_config(&RouteConfiguration {
                name: "test".to_string(),
                routes: vec![RouteConfig {
                    name: "all".to_string(),
                    headers: Vec::new(),
                    action: RouteActionConfig {
                        cluster: "c1".to_string(),
                        ..Default::default()
                    },
                }],
            })
            .unwrap(),
            manager,
        );
        let limiter = Arc::new(LocalRateLimiter::new(&config));
        let factory = RateLimitChainFactory {
            config,
            limiter: limiter.clone(),
        };
        let (downstream, written, _closed) = MockDownstream::new();
        let stream = MessageStream::new(context, &factory, Box::new(downstream), None);
        (stream, limiter, pool, written)
    }

    #[test]
    fn test_burst_admits_max_then_denies() {
        let (mut stream, limiter, _pool, written) = stream_with_limit(limit_config(5, Vec::new()));

        for i in 0..7u64 {
            stream.on_downstream_data(&mut oneway_bytes(i + 1));
        }
        // 5 forwarded, 2 denied with a local error reply.
        let replies = written.lock().unwrap();
        assert_eq!(replies.len(), 2);
        for reply in replies.iter() {
            let frame = RpcFrame::decode(reply).unwrap();
            assert!(frame
                .headers
                .iter()
                .any(|(k, v)| k == "error-type" && v == "over_limit"));
            assert_eq!(frame.payload, b"local rate limit exceeded");
        }
        drop(replies);

        // After one fill tick the allowance returns.
        limiter.on_fill_timer();
        stream.on_downstream_data(&mut oneway_bytes(100));
        assert_eq!(written.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_forwarded_requests_reach_upstream() {
        let (mut stream, _limiter, pool, _written) = stream_with_limit(limit_config(2, Vec::new()));
        stream.on_downstream_data(&mut oneway_bytes(1));
        assert!(!pool.handles().written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_bucket_denies_before_global() {
        let config = limit_config(
            10,
            vec![RateLimitDescriptorConfig {
                entries: vec![KeyValueConfig {
                    key: "client".to_string(),
                    value: "gold".to_string(),
                }],
                token_bucket: TokenBucketConfig {
                    max_tokens: 1,
                    tokens_per_fill: 1,
                    fill_interval_ms: 1000,
                },
            }],
        );
        let (mut stream, _limiter, _pool, written) = stream_with_limit(config);

        stream.on_downstream_data(&mut oneway_bytes(1));
        assert!(written.lock().unwrap().is_empty());

        // Second request exhausts the per-client bucket even though the
        // global bucket still has tokens.
        stream.on_downstream_data(&mut oneway_bytes(2));
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_detail_recorded_on_denial() {
        let (mut stream, _limiter, _pool, _written) = stream_with_limit(limit_config(0, Vec::new()));
        stream.on_downstream_data(&mut oneway_bytes(1));
        assert_eq!(
            stream.handle().response_code_detail().unwrap(),
            "request_rate_limited"
        );
    }
}
