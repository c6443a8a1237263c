//! Shadow (mirror) request submission: a duplicated request is pushed
//! through the normal pool-acquisition protocol, every response is
//! discarded, and no failure ever reaches the primary path.

use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

use crate::codec::CodecFactory;
use crate::metadata::{Metadata, Mutation};
use crate::upstream::{
    Cancellable, ClusterManager, ConnectionData, HostDescription, NullLbContext, PoolCallbacks,
    PoolFailureReason, ResourcePriority,
};

pub trait ShadowWriter: Send + Sync {
    /// Fire-and-forget a copy of the request at `cluster_name`.
    fn submit(
        &self,
        cluster_name: &str,
        metadata: Metadata,
        mutation: Mutation,
        codec_factory: Arc<dyn CodecFactory>,
    );
}

pub struct ShadowWriterImpl {
    cluster_manager: Arc<dyn ClusterManager>,
}

impl ShadowWriterImpl {
    pub fn new(cluster_manager: Arc<dyn ClusterManager>) -> Self {
        Self { cluster_manager }
    }
}

impl ShadowWriter for ShadowWriterImpl {
    fn submit(
        &self,
        cluster_name: &str,
        metadata: Metadata,
        mutation: Mutation,
        codec_factory: Arc<dyn CodecFactory>,
    ) {
        debug!(
            cluster = cluster_name,
            request_id = metadata.request_id(),
            "submitting shadow request"
        );
        let cluster = match self.cluster_manager.get_thread_local_cluster(cluster_name) {
            Some(cluster) => cluster,
            None => {
                debug!(cluster = cluster_name, "shadow cluster not found, dropping");
                return;
            }
        };
        if cluster.info().maintenance_mode() {
            debug!(cluster = cluster_name, "shadow cluster in maintenance, dropping");
            return;
        }
        let pool = match cluster.tcp_conn_pool(ResourcePriority::Default, &NullLbContext) {
            Some(pool) => pool,
            None => {
                debug!(cluster = cluster_name, "no healthy shadow upstream, dropping");
                return;
            }
        };

        let shadow = Arc::new(ShadowRouter::new(metadata, mutation, codec_factory));
        let handle = pool.new_connection(shadow.clone());
        shadow.set_pool_handle(handle);
    }
}

struct ShadowState {
    metadata: Metadata,
    mutation: Mutation,
    request_buffer: BytesMut,
    pool_handle: Option<Box<dyn Cancellable>>,
    // Held until the shadow is dropped so the pool does not hand the
    // connection out again while the mirrored response is in flight.
    conn_data: Option<Box<dyn ConnectionData>>,
}

/// Request owner for one shadow attempt. Responses and failures are
/// logged and dropped.
struct ShadowRouter {
    codec_factory: Arc<dyn CodecFactory>,
    state: Mutex<ShadowState>,
}

impl ShadowRouter {
    fn new(mut metadata: Metadata, mutation: Mutation, codec_factory: Arc<dyn CodecFactory>) -> Self {
        let request_buffer = metadata.take_origin_message();
        Self {
            codec_factory,
            state: Mutex::new(ShadowState {
                metadata,
                mutation,
                request_buffer,
                pool_handle: None,
                conn_data: None,
            }),
        }
    }

    fn set_pool_handle(&self, handle: Option<Box<dyn Cancellable>>) {
        self.state.lock().expect("shadow state mutex poisoned").pool_handle = handle;
    }
}

impl PoolCallbacks for ShadowRouter {
    fn on_pool_ready(&self, mut conn: Box<dyn ConnectionData>, host: Arc<HostDescription>) {
        let mut state = self.state.lock().expect("shadow state mutex poisoned");
        state.pool_handle = None;
        trace!(host = host.address(), "shadow connection ready");

        let mut codec = self.codec_factory.create_codec();
        let mut buffer = std::mem::take(&mut state.request_buffer);
        if let Err(e) = codec.encode(&state.metadata, &state.mutation, &mut buffer) {
            warn!(error = %e, "shadow request encode failure, dropping");
            return;
        }
        conn.connection().write(&mut buffer, false);
        state.conn_data = Some(conn);
    }

    fn on_pool_failure(&self, reason: PoolFailureReason, _host: Option<Arc<HostDescription>>) {
        let mut state = self.state.lock().expect("shadow state mutex poisoned");
        state.pool_handle = None;
        debug!(?reason, "shadow connection failure, dropping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RpcFrame, RpcFrameCodecFactory};
    use crate::metadata::MessageType;
    use crate::upstream::testing::{single_cluster_manager, MockPool, MockPoolMode};
    use crate::upstream::StaticClusterManager;

    fn shadow_metadata() -> Metadata {
        let frame = RpcFrame::new(MessageType::Request, 21, 4).with_payload(b"dup".to_vec());
        let encoded = frame.encode().unwrap();
        let mut md = Metadata::new(MessageType::Request);
        md.set_request_id(21);
        md.set_origin_message(encoded);
        md
    }

    #[test]
    fn test_shadow_submission_writes_duplicated_request() {
        let pool = MockPool::new(MockPoolMode::SyncReady, "10.1.0.1:9000");
        let manager = single_cluster_manager("shadow-c", false, Some(pool.clone()));
        let writer = ShadowWriterImpl::new(manager);

        let mut mutation = Mutation::new();
        mutation.put("x-mirrored", "true");
        writer.submit(
            "shadow-c",
            shadow_metadata(),
            mutation,
            Arc::new(RpcFrameCodecFactory),
        );

        let written = pool.handles().written.lock().unwrap().clone();
        let frame = RpcFrame::decode(&written).unwrap();
        assert_eq!(frame.request_id, 21);
        assert_eq!(frame.payload, b"dup");
        assert!(frame.headers.iter().any(|(k, v)| k == "x-mirrored" && v == "true"));
    }

    #[test]
    fn test_shadow_missing_cluster_is_dropped_silently() {
        let manager = Arc::new(StaticClusterManager::new());
        let writer = ShadowWriterImpl::new(manager);
        writer.submit(
            "nowhere",
            shadow_metadata(),
            Mutation::new(),
            Arc::new(RpcFrameCodecFactory),
        );
    }

    #[test]
    fn test_shadow_pool_failure_never_surfaces() {
        let pool = MockPool::new(
            MockPoolMode::SyncFailure(PoolFailureReason::RemoteConnectionFailure),
            "10.1.0.1:9000",
        );
        let manager = single_cluster_manager("shadow-c", false, Some(pool));
        let writer = ShadowWriterImpl::new(manager);
        writer.submit(
            "shadow-c",
            shadow_metadata(),
            Mutation::new(),
            Arc::new(RpcFrameCodecFactory),
        );
    }
}
