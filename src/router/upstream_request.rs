//! Per-attempt upstream request: owns the encoded request bytes and the
//! connection-pool interaction for one routed message.

use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::codec::{AppException, CodecFactory};
use crate::error::{Error, ErrorType};
use crate::filter::FilterStatus;
use crate::metadata::{reserved, MessageType, SharedMetadata, SharedMutation};
use crate::stream::{StreamEvent, StreamHandle};
use crate::upstream::{
    CancelPolicy, Cancellable, CloseType, ConnectionData, ConnectionEvent, HostDescription,
    OutlierResult, PoolCallbacks, PoolFailureReason, TcpPoolData, UpstreamCallbacks,
};

/// Lifecycle of an upstream request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamRequestState {
    Init,
    PoolAcquiring,
    AwaitingResponse,
    /// Connection transferred to the connection-scoped owner; terminal
    /// for this attempt.
    StreamOpen,
    Completed,
    Failed,
}

/// Forwards pool outcomes into the stream's event queue so they are
/// processed on the owning worker, in order.
pub(crate) struct StreamPoolCallbacks {
    pub handle: StreamHandle,
}

impl PoolCallbacks for StreamPoolCallbacks {
    fn on_pool_ready(&self, conn: Box<dyn ConnectionData>, host: Arc<HostDescription>) {
        self.handle.send(StreamEvent::PoolReady { conn, host });
    }

    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<HostDescription>>) {
        self.handle.send(StreamEvent::PoolFailure { reason, host });
    }
}

/// Forwards upstream connection data and events into the stream's queue.
pub(crate) struct StreamUpstreamCallbacks {
    pub handle: StreamHandle,
}

impl UpstreamCallbacks for StreamUpstreamCallbacks {
    fn on_upstream_data(&self, data: BytesMut, end_stream: bool) {
        self.handle.send(StreamEvent::UpstreamData { data, end_stream });
    }

    fn on_event(&self, event: ConnectionEvent) {
        self.handle.send(StreamEvent::UpstreamEvent { event });
    }
}

pub struct UpstreamRequest {
    handle: StreamHandle,
    codec_factory: Arc<dyn CodecFactory>,
    metadata: SharedMetadata,
    mutation: SharedMutation,
    /// The encoded request, moved out of the metadata at construction.
    request_buffer: BytesMut,
    conn_pool: TcpPoolData,
    pool_handle: Option<Box<dyn Cancellable>>,
    conn_data: Option<Box<dyn ConnectionData>>,
    upstream_host: Option<Arc<HostDescription>>,
    state: UpstreamRequestState,

    request_complete: bool,
    response_started: bool,
    response_complete: bool,
    stream_reset: bool,
    /// Set when the connection moved to the connection-scoped owner;
    /// any later `conn_data` access is a bug.
    conn_transferred: bool,
}

impl UpstreamRequest {
    pub fn new(
        handle: StreamHandle,
        codec_factory: Arc<dyn CodecFactory>,
        metadata: SharedMetadata,
        mutation: SharedMutation,
        conn_pool: TcpPoolData,
    ) -> Self {
        let request_buffer = metadata
            .lock()
            .expect("metadata mutex poisoned")
            .take_origin_message();
        Self {
            handle,
            codec_factory,
            metadata,
            mutation,
            request_buffer,
            conn_pool,
            pool_handle: None,
            conn_data: None,
            upstream_host: None,
            state: UpstreamRequestState::Init,
            request_complete: false,
            response_started: false,
            response_complete: false,
            stream_reset: false,
            conn_transferred: false,
        }
    }

    pub fn state(&self) -> UpstreamRequestState {
        self.state
    }

    pub fn request_complete(&self) -> bool {
        self.request_complete
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete
    }

    pub fn set_response_started(&mut self) {
        self.response_started = true;
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    /// Kick off connection acquisition. Pauses the chain when the pool
    /// answers asynchronously.
    pub fn start(&mut self) -> FilterStatus {
        let callbacks = Arc::new(StreamPoolCallbacks {
            handle: self.handle.clone(),
        });
        if let Some(handle) = self.conn_pool.new_connection(callbacks) {
            trace!("waiting for upstream connection");
            self.pool_handle = Some(handle);
            self.state = UpstreamRequestState::PoolAcquiring;
            return FilterStatus::PauseIteration;
        }
        FilterStatus::ContinueIteration
    }

    pub fn on_pool_ready(&mut self, conn: Box<dyn ConnectionData>, host: Arc<HostDescription>) {
        if self.stream_reset {
            // Raced with a reset; the dropped conn goes back to the pool.
            return;
        }
        debug!(host = host.address(), "upstream connection ready");
        self.handle.set_upstream_host(host.clone());

        // Only resume the chain if acquisition had paused it.
        let continue_decoding = self.pool_handle.is_some();
        self.pool_handle = None;

        host.outlier_detector()
            .put_result(OutlierResult::LocalOriginConnectSuccess);
        self.upstream_host = Some(host);
        self.conn_data = Some(conn);

        let message_type = self
            .metadata
            .lock()
            .expect("metadata mutex poisoned")
            .message_type();

        if message_type == MessageType::Request {
            let callbacks = Arc::new(StreamUpstreamCallbacks {
                handle: self.handle.clone(),
            });
            self.conn_data
                .as_mut()
                .expect("conn_data just stored")
                .set_upstream_callbacks(callbacks);
        }

        let remote_address = self
            .conn_data
            .as_mut()
            .expect("conn_data just stored")
            .connection()
            .remote_address();
        self.metadata
            .lock()
            .expect("metadata mutex poisoned")
            .put_string(reserved::REAL_SERVER_ADDRESS, remote_address);

        if continue_decoding {
            self.handle.continue_decoding();
        }
        if !self.encode_and_write() {
            return;
        }
        self.request_complete = true;

        match message_type {
            MessageType::StreamInit => {
                // The stream owns the connection from here on; later
                // responses flow through the connection-scoped owner.
                debug!("stream init request, promoting upstream connection to parent scope");
                let conn = self.conn_data.take().expect("conn_data present");
                self.conn_transferred = true;
                self.state = UpstreamRequestState::StreamOpen;
                self.handle
                    .send(StreamEvent::TransferUpstreamConnection { conn });
                self.handle.reset_stream();
            }
            MessageType::Oneway => {
                // No response expected; return the connection now.
                self.response_complete = true;
                self.conn_data = None;
                self.state = UpstreamRequestState::Completed;
            }
            _ => {
                self.state = UpstreamRequestState::AwaitingResponse;
            }
        }
    }

    pub fn on_pool_failure(
        &mut self,
        reason: PoolFailureReason,
        host: Option<Arc<HostDescription>>,
    ) {
        if self.stream_reset {
            return;
        }
        warn!(?reason, "upstream connection failure");
        self.pool_handle = None;
        if let Some(host) = host {
            self.handle.set_upstream_host(host.clone());
            self.upstream_host = Some(host);
        }

        self.request_buffer.clear();
        self.state = UpstreamRequestState::Failed;
        self.stream_reset = true;

        // Timeouts and connection failures arrive asynchronously while
        // the chain is paused; resume it before replying so downstream
        // bookkeeping drains. Overflow is reported synchronously from
        // inside `new_connection` and must not resume.
        match reason {
            PoolFailureReason::Timeout => {
                if let Some(host) = &self.upstream_host {
                    host.outlier_detector()
                        .put_result(OutlierResult::LocalOriginTimeout);
                }
                self.handle.continue_decoding();
            }
            PoolFailureReason::RemoteConnectionFailure => {
                if let Some(host) = &self.upstream_host {
                    host.outlier_detector()
                        .put_result(OutlierResult::LocalOriginConnectFailed);
                }
                self.handle.continue_decoding();
            }
            PoolFailureReason::LocalConnectionFailure => {
                self.handle.continue_decoding();
            }
            PoolFailureReason::Overflow => {}
        }

        self.on_upstream_connection_reset(reason);
    }

    pub fn on_upstream_connection_event(&mut self, event: ConnectionEvent) {
        if self.response_complete || self.stream_reset {
            return;
        }
        match event {
            ConnectionEvent::RemoteClose => {
                debug!("upstream remote close");
                self.on_upstream_connection_reset(PoolFailureReason::RemoteConnectionFailure);
                if let Some(host) = &self.upstream_host {
                    host.outlier_detector()
                        .put_result(OutlierResult::LocalOriginConnectFailed);
                }
            }
            ConnectionEvent::LocalClose => {
                debug!("upstream local close");
                self.on_upstream_connection_reset(PoolFailureReason::LocalConnectionFailure);
            }
            ConnectionEvent::Connected => {
                // Consumed by the connection pool.
            }
        }
    }

    pub fn on_response_complete(&mut self) {
        self.response_complete = true;
        self.state = UpstreamRequestState::Completed;
        self.conn_data = None;
    }

    /// Cancel a pending acquisition and hand the connection back to the
    /// pool, optionally closing it first. The conn data is moved to the
    /// local stack before closing so a close event can never observe a
    /// half-released handle.
    pub fn release_upstream_connection(&mut self, close: bool) {
        self.stream_reset = true;

        if let Some(handle) = self.pool_handle.take() {
            debug_assert!(self.conn_data.is_none());
            handle.cancel(CancelPolicy::Default);
            debug!("cancelled pending upstream connection");
        }

        let conn_data = self.conn_data.take();
        debug!("releasing upstream connection");
        if close {
            if let Some(mut conn) = conn_data {
                conn.connection().close(CloseType::NoFlush);
                warn!("closed upstream connection");
            }
        }
    }

    /// Encode the request with the route mutation applied and write it to
    /// the upstream connection. Returns false when encoding failed and
    /// the stream is being torn down.
    fn encode_and_write(&mut self) -> bool {
        debug_assert!(!self.conn_transferred, "conn_data accessed after transfer");
        if self.conn_transferred {
            return false;
        }
        let mut codec = self.codec_factory.create_codec();
        let metadata = self.metadata.lock().expect("metadata mutex poisoned");
        let mutation = self.mutation.lock().expect("mutation mutex poisoned");
        trace!(bytes = self.request_buffer.len(), "proxying request upstream");
        if let Err(e) = codec.encode(&metadata, &mutation, &mut self.request_buffer) {
            drop(metadata);
            drop(mutation);
            warn!(error = %e, "request encode failure");
            self.handle.send_local_reply(
                Box::new(AppException::new(Error::new(
                    ErrorType::CodecError,
                    format!("request encode error: {}", e),
                ))),
                false,
            );
            self.handle.reset_stream();
            return false;
        }
        drop(metadata);
        drop(mutation);
        self.conn_data
            .as_mut()
            .expect("conn_data present for write")
            .connection()
            .write(&mut self.request_buffer, false);
        true
    }

    /// Mimic an upstream reset towards the downstream: oneway requests
    /// are silently reset, everything else gets an exception reply.
    fn on_upstream_connection_reset(&mut self, reason: PoolFailureReason) {
        let message_type = self
            .metadata
            .lock()
            .expect("metadata mutex poisoned")
            .message_type();
        if message_type == MessageType::Oneway {
            debug!("oneway request, resetting stream without a reply");
            self.handle.reset_stream();
            return;
        }

        let address = self
            .upstream_host
            .as_ref()
            .map(|h| h.address().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let message = match reason {
            PoolFailureReason::Overflow => {
                "upstream request: too many connections".to_string()
            }
            PoolFailureReason::LocalConnectionFailure => {
                format!("upstream request: local connection failure '{}'", address)
            }
            PoolFailureReason::RemoteConnectionFailure => {
                format!("upstream request: remote connection failure '{}'", address)
            }
            PoolFailureReason::Timeout => {
                format!("upstream request: connection failure '{}' due to timeout", address)
            }
        };
        self.handle.send_local_reply(
            Box::new(AppException::new(Error::new(ErrorType::Unspecified, message))),
            false,
        );
        if !self.response_complete {
            self.handle.reset_stream();
        }
    }
}
