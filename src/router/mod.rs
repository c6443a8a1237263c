//! The router: terminal decoder filter that resolves the cluster for a
//! decoded request, drives the upstream request attempt, and mediates
//! between upstream events and the downstream encoder chain.

pub mod shadow;
pub mod upstream_request;

pub use shadow::{ShadowWriter, ShadowWriterImpl};
pub use upstream_request::{UpstreamRequest, UpstreamRequestState};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::AppException;
use crate::error::{Error, ErrorType};
use crate::filter::{DecoderFilter, FilterStatus};
use crate::metadata::{MessageType, SharedMetadata, SharedMutation};
use crate::route::RouteSelection;
use crate::stream::{ProxyContext, StreamHandle};
use crate::upstream::{
    ConnectionData, ConnectionEvent, HostDescription, LoadBalancerContext, PoolFailureReason,
    ResourcePriority, TcpPoolData,
};

/// Load-balancer hints computed from the matched route.
struct RouteLbContext {
    hash: Option<u64>,
    metadata_match: Option<Vec<(String, String)>>,
}

impl LoadBalancerContext for RouteLbContext {
    fn hash_key(&self) -> Option<u64> {
        self.hash
    }

    fn metadata_match(&self) -> Option<&[(String, String)]> {
        self.metadata_match.as_deref()
    }
}

pub struct Router {
    context: Arc<ProxyContext>,
    handle: Option<StreamHandle>,
    metadata: Option<SharedMetadata>,
    route: Option<RouteSelection>,
    upstream_request: Option<UpstreamRequest>,
}

impl Router {
    pub fn new(context: Arc<ProxyContext>) -> Self {
        Self {
            context,
            handle: None,
            metadata: None,
            route: None,
            upstream_request: None,
        }
    }

    pub fn route_selection(&self) -> Option<&RouteSelection> {
        self.route.as_ref()
    }

    /// True once a oneway request has been written upstream; the message
    /// is finished without a response.
    pub(crate) fn oneway_finished(&self) -> bool {
        let (Some(upstream_request), Some(metadata)) = (&self.upstream_request, &self.metadata)
        else {
            return false;
        };
        upstream_request.state() == UpstreamRequestState::Completed
            && metadata
                .lock()
                .expect("metadata mutex poisoned")
                .message_type()
                == MessageType::Oneway
    }

    pub(crate) fn on_pool_ready(&mut self, conn: Box<dyn ConnectionData>, host: Arc<HostDescription>) {
        match &mut self.upstream_request {
            Some(upstream_request) => upstream_request.on_pool_ready(conn, host),
            None => warn!("pool ready with no upstream request in flight, returning connection"),
        }
    }

    pub(crate) fn on_pool_failure(
        &mut self,
        reason: PoolFailureReason,
        host: Option<Arc<HostDescription>>,
    ) {
        if let Some(upstream_request) = &mut self.upstream_request {
            upstream_request.on_pool_failure(reason, host);
        }
    }

    pub(crate) fn on_upstream_connection_event(&mut self, event: ConnectionEvent) {
        if let Some(upstream_request) = &mut self.upstream_request {
            upstream_request.on_upstream_connection_event(event);
        }
    }

    pub(crate) fn on_response_started(&mut self) {
        if let Some(upstream_request) = &mut self.upstream_request {
            upstream_request.set_response_started();
        }
    }

    pub(crate) fn on_response_complete(&mut self) {
        if let Some(upstream_request) = &mut self.upstream_request {
            upstream_request.on_response_complete();
        }
    }

    pub(crate) fn release_upstream_connection(&mut self, close: bool) {
        if let Some(upstream_request) = &mut self.upstream_request {
            upstream_request.release_upstream_connection(close);
        }
    }

    /// Resolve the cluster and pick a pool, mapping each failure to its
    /// response-code detail.
    fn prepare_upstream_request(
        &self,
        cluster_name: &str,
        request_id: u64,
        lb_context: &dyn LoadBalancerContext,
    ) -> Result<TcpPoolData, (Error, &'static str)> {
        let cluster = match self.context.cluster_manager.get_thread_local_cluster(cluster_name) {
            Some(cluster) => cluster,
            None => {
                warn!(cluster = cluster_name, "unknown cluster");
                return Err((
                    Error::new(
                        ErrorType::ClusterNotFound,
                        format!("unknown cluster '{}'", cluster_name),
                    ),
                    "unknown_cluster",
                ));
            }
        };

        let info = cluster.info();
        debug!(cluster = info.name(), request_id, "cluster matched for request");

        if info.maintenance_mode() {
            warn!(cluster = cluster_name, "cluster in maintenance mode");
            return Err((
                Error::new(
                    ErrorType::ClusterMaintenance,
                    format!("maintenance mode for cluster '{}'", cluster_name),
                ),
                "cluster_in_maintenance_mode",
            ));
        }

        match cluster.tcp_conn_pool(ResourcePriority::Default, lb_context) {
            Some(pool) => Ok(pool),
            None => {
                warn!(cluster = cluster_name, "no healthy upstream");
                Err((
                    Error::new(
                        ErrorType::NoHealthyUpstream,
                        format!("no healthy upstream for '{}'", cluster_name),
                    ),
                    "no_healthy_upstream",
                ))
            }
        }
    }

    /// Fail a request at routing time. Oneway messages never see a
    /// reply; the stream is reset instead.
    fn fail_request(&self, handle: &StreamHandle, message_type: MessageType, error: Error) {
        if message_type == MessageType::Oneway {
            handle.reset_stream();
        } else {
            handle.send_local_reply(Box::new(AppException::new(error)), false);
        }
    }

    fn submit_mirrors(&self, metadata: &SharedMetadata, mutation: &SharedMutation, random: u64) {
        let Some(selection) = &self.route else { return };
        for policy in selection.route.mirror_policies() {
            if !policy.should_shadow(self.context.runtime.as_ref(), random) {
                continue;
            }
            let metadata_copy = metadata.lock().expect("metadata mutex poisoned").clone();
            let mutation_copy = mutation.lock().expect("mutation mutex poisoned").clone();
            self.context.shadow_writer.submit(
                policy.cluster_name(),
                metadata_copy,
                mutation_copy,
                self.context.codec_factory.clone(),
            );
        }
    }
}

impl DecoderFilter for Router {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.handle = Some(callbacks);
    }

    fn on_message_decoded(
        &mut self,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> FilterStatus {
        let handle = self.handle.clone().expect("decoder callbacks not set");
        self.metadata = Some(metadata.clone());

        let random_value = rand::random::<u64>();
        let (selection, request_id, message_type) = {
            let md = metadata.lock().expect("metadata mutex poisoned");
            let request_id = md.request_id();
            let message_type = md.message_type();
            match self.context.route_matcher.route(&md, random_value) {
                Some(selection) => (selection, request_id, message_type),
                None => {
                    warn!(request_id, "no route matched");
                    handle.set_response_code_detail("route_not_found");
                    drop(md);
                    self.fail_request(
                        &handle,
                        message_type,
                        Error::new(
                            ErrorType::RouteNotFound,
                            format!("no route for request '{}'", request_id),
                        ),
                    );
                    return FilterStatus::StopIteration;
                }
            }
        };

        mutation
            .lock()
            .expect("mutation mutex poisoned")
            .extend_from(selection.route.request_mutation());

        let lb_context = RouteLbContext {
            hash: selection
                .route
                .hash_policy()
                .hash_key(&metadata.lock().expect("metadata mutex poisoned")),
            metadata_match: selection.metadata_match.clone(),
        };
        let cluster_name = selection.cluster_name.clone();
        self.route = Some(selection);

        // Mirrors duplicate the original frame, so they fire before the
        // upstream request takes ownership of it.
        self.submit_mirrors(metadata, mutation, random_value);

        let pool = match self.prepare_upstream_request(&cluster_name, request_id, &lb_context) {
            Ok(pool) => pool,
            Err((error, detail)) => {
                handle.set_response_code_detail(detail);
                self.fail_request(&handle, message_type, error);
                return FilterStatus::StopIteration;
            }
        };

        let mut upstream_request = UpstreamRequest::new(
            handle,
            self.context.codec_factory.clone(),
            metadata.clone(),
            mutation.clone(),
            pool,
        );
        let status = upstream_request.start();
        self.upstream_request = Some(upstream_request);
        status
    }

    fn on_destroy(&mut self) {
        if let Some(upstream_request) = &mut self.upstream_request {
            let close = !upstream_request.response_complete();
            upstream_request.release_upstream_connection(close);
        }
    }
}
