//! Per-request stream driver. Owns the filter chain, the downstream
//! codec and the router, and serializes everything that happens to one
//! request stream through a single event queue so state is only ever
//! touched from the owning worker.

use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::{AppException, Codec, CodecFactory, DecodeStatus, DirectResponse, UpstreamResponseStatus};
use crate::error::{Error, ErrorType};
use crate::filter::{DecoderFilter, EncoderFilter, FilterChainBuilder, FilterChainFactory, FilterStatus};
use crate::metadata::{shared_metadata, shared_mutation, Metadata, MessageType, Mutation, SharedMetadata, SharedMutation};
use crate::request_id;
use crate::route::RouteMatcher;
use crate::router::{Router, ShadowWriter};
use crate::runtime::RuntimeLoader;
use crate::upstream::{ClusterManager, ConnectionData, ConnectionEvent, HostDescription, PoolFailureReason};

/// Everything a stream needs from its host, shared across all streams of
/// a listener.
pub struct ProxyContext {
    pub codec_factory: Arc<dyn CodecFactory>,
    pub route_matcher: Arc<RouteMatcher>,
    pub cluster_manager: Arc<dyn ClusterManager>,
    pub runtime: Arc<dyn RuntimeLoader>,
    pub shadow_writer: Arc<dyn ShadowWriter>,
}

/// Write side of the downstream connection, supplied by the host.
pub trait DownstreamConnection: Send {
    fn write(&mut self, data: &mut BytesMut, end_stream: bool);
    fn close(&mut self);
}

/// Connection-scoped owner that outlives individual request streams.
/// Receives the upstream connection when a stream-init request promotes
/// it out of the request scope.
pub trait UpstreamConnectionOwner: Send + Sync {
    fn set_upstream_connection(&self, conn: Box<dyn ConnectionData>);
}

/// Events delivered to the stream's queue. Everything asynchronous
/// (filter continuations, pool outcomes, upstream bytes) arrives here
/// and is processed strictly in order.
pub enum StreamEvent {
    ContinueDecoding,
    ContinueEncoding,
    LocalReply {
        response: Box<dyn DirectResponse>,
        end_stream: bool,
    },
    ResetStream,
    PoolReady {
        conn: Box<dyn ConnectionData>,
        host: Arc<HostDescription>,
    },
    PoolFailure {
        reason: PoolFailureReason,
        host: Option<Arc<HostDescription>>,
    },
    UpstreamData {
        data: BytesMut,
        end_stream: bool,
    },
    UpstreamEvent {
        event: ConnectionEvent,
    },
    TransferUpstreamConnection {
        conn: Box<dyn ConnectionData>,
    },
}

/// Identity and bookkeeping shared between the stream and its filters.
pub struct StreamInfo {
    stream_id: u64,
    request_id: AtomicU64,
    response_code_detail: Mutex<Option<String>>,
    upstream_host: Mutex<Option<Arc<HostDescription>>>,
}

struct StreamFlags {
    local_reply: AtomicBool,
    reset: AtomicBool,
}

/// Cloneable callback handle given to filters and the router. All
/// mutations of stream state go through the event queue; the handle only
/// records bookkeeping directly.
#[derive(Clone)]
pub struct StreamHandle {
    tx: mpsc::UnboundedSender<StreamEvent>,
    info: Arc<StreamInfo>,
    flags: Arc<StreamFlags>,
}

impl StreamHandle {
    pub fn request_id(&self) -> u64 {
        self.info.request_id.load(Ordering::Relaxed)
    }

    pub fn stream_id(&self) -> u64 {
        self.info.stream_id
    }

    /// Resume a previously paused decoder chain. A no-op when nothing is
    /// paused.
    pub fn continue_decoding(&self) {
        let _ = self.tx.send(StreamEvent::ContinueDecoding);
    }

    /// Resume a previously paused encoder chain.
    pub fn continue_encoding(&self) {
        let _ = self.tx.send(StreamEvent::ContinueEncoding);
    }

    /// Send a locally generated reply. Terminal for decoding: remaining
    /// decoder filters will not observe the request.
    pub fn send_local_reply(&self, response: Box<dyn DirectResponse>, end_stream: bool) {
        self.flags.local_reply.store(true, Ordering::SeqCst);
        let _ = self.tx.send(StreamEvent::LocalReply {
            response,
            end_stream,
        });
    }

    /// Tear the stream down and reclaim upstream resources.
    pub fn reset_stream(&self) {
        self.flags.reset.store(true, Ordering::SeqCst);
        let _ = self.tx.send(StreamEvent::ResetStream);
    }

    pub fn set_response_code_detail(&self, detail: impl Into<String>) {
        *self
            .info
            .response_code_detail
            .lock()
            .expect("stream info mutex poisoned") = Some(detail.into());
    }

    pub fn response_code_detail(&self) -> Option<String> {
        self.info
            .response_code_detail
            .lock()
            .expect("stream info mutex poisoned")
            .clone()
    }

    pub fn set_upstream_host(&self, host: Arc<HostDescription>) {
        *self
            .info
            .upstream_host
            .lock()
            .expect("stream info mutex poisoned") = Some(host);
    }

    pub fn upstream_host(&self) -> Option<Arc<HostDescription>> {
        self.info
            .upstream_host
            .lock()
            .expect("stream info mutex poisoned")
            .clone()
    }

    pub(crate) fn send(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    fn set_request_id(&self, request_id: u64) {
        self.info.request_id.store(request_id, Ordering::Relaxed);
    }

    fn local_reply_requested(&self) -> bool {
        self.flags.local_reply.load(Ordering::SeqCst)
    }

    fn reset_requested(&self) -> bool {
        self.flags.reset.load(Ordering::SeqCst)
    }

    fn clear_message_flags(&self) {
        self.flags.local_reply.store(false, Ordering::SeqCst);
        self.flags.reset.store(false, Ordering::SeqCst);
    }
}

enum PendingEncodeKind {
    LocalReply {
        response: Box<dyn DirectResponse>,
        end_stream: bool,
    },
    Response,
}

struct PendingEncode {
    metadata: SharedMetadata,
    mutation: SharedMutation,
    kind: PendingEncodeKind,
}

enum EncodeChainResult {
    Complete,
    Paused,
    Stopped,
}

/// Driver for one downstream request stream.
pub struct MessageStream {
    context: Arc<ProxyContext>,
    handle: StreamHandle,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    codec: Box<dyn Codec>,
    decoder_filters: Vec<Box<dyn DecoderFilter>>,
    encoder_filters: Vec<Box<dyn EncoderFilter>>,
    router: Router,
    downstream: Box<dyn DownstreamConnection>,
    parent: Option<Arc<dyn UpstreamConnectionOwner>>,

    read_buffer: BytesMut,
    upstream_buffer: BytesMut,

    metadata: Option<SharedMetadata>,
    mutation: Option<SharedMutation>,
    message_active: bool,
    decode_cursor: usize,
    decoder_paused: bool,
    decode_complete: bool,
    local_reply_sent: bool,

    encode_cursor: usize,
    pending_encode: Option<PendingEncode>,

    response_codec: Option<Box<dyn Codec>>,
    response_metadata: Option<SharedMetadata>,
    response_mutation: Option<SharedMutation>,
    response_started: bool,

    destroyed: bool,

    #[cfg(test)]
    pub(crate) resumes: usize,
}

impl MessageStream {
    pub fn new(
        context: Arc<ProxyContext>,
        filter_chain_factory: &dyn FilterChainFactory,
        downstream: Box<dyn DownstreamConnection>,
        parent: Option<Arc<dyn UpstreamConnectionOwner>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = StreamHandle {
            tx,
            info: Arc::new(StreamInfo {
                stream_id: request_id::generate(),
                request_id: AtomicU64::new(0),
                response_code_detail: Mutex::new(None),
                upstream_host: Mutex::new(None),
            }),
            flags: Arc::new(StreamFlags {
                local_reply: AtomicBool::new(false),
                reset: AtomicBool::new(false),
            }),
        };

        let mut builder = FilterChainBuilder::default();
        filter_chain_factory.create_filter_chain(&mut builder);
        let FilterChainBuilder {
            mut decoders,
            mut encoders,
        } = builder;
        for filter in decoders.iter_mut() {
            filter.set_decoder_callbacks(handle.clone());
        }
        for filter in encoders.iter_mut() {
            filter.set_encoder_callbacks(handle.clone());
        }

        let mut router = Router::new(context.clone());
        router.set_decoder_callbacks(handle.clone());

        let codec = context.codec_factory.create_codec();

        Self {
            context,
            handle,
            rx,
            codec,
            decoder_filters: decoders,
            encoder_filters: encoders,
            router,
            downstream,
            parent,
            read_buffer: BytesMut::new(),
            upstream_buffer: BytesMut::new(),
            metadata: None,
            mutation: None,
            message_active: false,
            decode_cursor: 0,
            decoder_paused: false,
            decode_complete: false,
            local_reply_sent: false,
            encode_cursor: 0,
            pending_encode: None,
            response_codec: None,
            response_metadata: None,
            response_mutation: None,
            response_started: false,
            destroyed: false,
            #[cfg(test)]
            resumes: 0,
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn decoding_complete(&self) -> bool {
        self.decode_complete
    }

    /// Feed bytes read from the downstream connection.
    pub fn on_downstream_data(&mut self, data: &mut BytesMut) {
        if self.destroyed {
            return;
        }
        self.read_buffer.extend_from_slice(data);
        data.clear();
        self.try_decode_messages();
        self.pump();
    }

    /// Drain and process every queued event.
    pub fn pump(&mut self) {
        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.handle_event(event);
            }
            if !self.maybe_end_message() {
                break;
            }
        }
    }

    /// Run the stream off its event queue until it is torn down.
    pub async fn drive(&mut self) {
        while !self.destroyed {
            match self.rx.recv().await {
                Some(event) => {
                    self.handle_event(event);
                    self.pump();
                }
                None => break,
            }
        }
    }

    /// Destroy fence: after this returns, no filter callback fires and
    /// any still-queued asynchronous completion is dropped.
    pub fn on_destroy(&mut self) {
        self.do_destroy();
    }

    fn try_decode_messages(&mut self) {
        while !self.destroyed && !self.message_active && !self.read_buffer.is_empty() {
            let mut metadata = Metadata::new(MessageType::Request);
            metadata.set_stream_id(self.handle.stream_id());
            match self.codec.decode(&mut self.read_buffer, &mut metadata) {
                Ok(DecodeStatus::Waiting) => break,
                Ok(DecodeStatus::Done) => {
                    self.handle.set_request_id(metadata.request_id());
                    self.begin_message(metadata);
                }
                Err(e) => {
                    warn!(error = %e, "request decode failure, closing stream");
                    self.message_active = true;
                    self.local_reply_sent = false;
                    self.handle.clear_message_flags();
                    self.metadata = Some(shared_metadata(metadata));
                    self.mutation = Some(shared_mutation(Mutation::new()));
                    self.send_local_reply_now(
                        Box::new(AppException::new(Error::new(
                            ErrorType::CodecError,
                            format!("request decode error: {}", e),
                        ))),
                        true,
                    );
                    break;
                }
            }
        }
    }

    fn begin_message(&mut self, metadata: Metadata) {
        trace!(
            request_id = metadata.request_id(),
            message_type = ?metadata.message_type(),
            "message decoded"
        );
        self.handle.clear_message_flags();
        self.message_active = true;
        self.upstream_buffer.clear();
        self.decode_cursor = 0;
        self.decoder_paused = false;
        self.decode_complete = false;
        self.local_reply_sent = false;
        self.pending_encode = None;
        self.response_codec = None;
        self.response_metadata = None;
        self.response_mutation = None;
        self.response_started = false;

        if metadata.message_type() == MessageType::Heartbeat {
            self.answer_heartbeat(metadata);
            return;
        }

        self.metadata = Some(shared_metadata(metadata));
        self.mutation = Some(shared_mutation(Mutation::new()));
        self.run_decoder_chain(0);
    }

    /// Heartbeats are answered in place and never enter the filter chain.
    fn answer_heartbeat(&mut self, mut metadata: Metadata) {
        let mut buffer = metadata.take_origin_message();
        match self.codec.encode(&metadata, &Mutation::new(), &mut buffer) {
            Ok(()) => self.downstream.write(&mut buffer, false),
            Err(e) => warn!(error = %e, "failed to encode heartbeat reply"),
        }
        self.message_active = false;
    }

    fn run_decoder_chain(&mut self, start: usize) {
        let (metadata, mutation) = match (self.metadata.clone(), self.mutation.clone()) {
            (Some(md), Some(mu)) => (md, mu),
            _ => return,
        };

        let terminal = self.decoder_filters.len();
        let mut idx = start;
        loop {
            if self.destroyed {
                return;
            }
            // A local reply ends decoding: remaining filters never
            // observe the request, but the chain counts as drained.
            if self.handle.local_reply_requested() {
                self.decode_complete = true;
                return;
            }
            if self.handle.reset_requested() {
                return;
            }
            if idx > terminal {
                self.decode_complete = true;
                return;
            }
            let status = if idx < terminal {
                self.decoder_filters[idx].on_message_decoded(&metadata, &mutation)
            } else {
                self.router.on_message_decoded(&metadata, &mutation)
            };
            match status {
                FilterStatus::ContinueIteration => idx += 1,
                FilterStatus::PauseIteration => {
                    self.decode_cursor = idx;
                    self.decoder_paused = true;
                    return;
                }
                FilterStatus::StopIteration => {
                    self.decode_complete = true;
                    return;
                }
                FilterStatus::Retry => idx = 0,
            }
        }
    }

    fn handle_event(&mut self, event: StreamEvent) {
        if self.destroyed {
            // Everything after the destroy fence is dropped on the floor.
            return;
        }
        match event {
            StreamEvent::ContinueDecoding => {
                if !self.decoder_paused {
                    trace!("continue_decoding without a paused chain, ignoring");
                    return;
                }
                self.decoder_paused = false;
                #[cfg(test)]
                {
                    self.resumes += 1;
                }
                let next = self.decode_cursor + 1;
                self.run_decoder_chain(next);
            }
            StreamEvent::ContinueEncoding => self.resume_encoding(),
            StreamEvent::LocalReply {
                response,
                end_stream,
            } => self.send_local_reply_now(response, end_stream),
            StreamEvent::ResetStream => self.reset_stream_now(),
            StreamEvent::PoolReady { conn, host } => self.router.on_pool_ready(conn, host),
            StreamEvent::PoolFailure { reason, host } => self.router.on_pool_failure(reason, host),
            StreamEvent::UpstreamData { data, end_stream } => {
                self.on_upstream_data(data, end_stream)
            }
            StreamEvent::UpstreamEvent { event } => {
                self.router.on_upstream_connection_event(event)
            }
            StreamEvent::TransferUpstreamConnection { conn } => match &self.parent {
                Some(parent) => parent.set_upstream_connection(conn),
                None => {
                    warn!("no connection-scoped owner for streaming transfer, dropping connection")
                }
            },
        }
    }

    fn maybe_end_message(&mut self) -> bool {
        if self.destroyed || !self.message_active {
            return false;
        }
        if self.decode_complete && self.router.oneway_finished() {
            self.message_active = false;
            self.try_decode_messages();
            return true;
        }
        false
    }

    fn send_local_reply_now(&mut self, response: Box<dyn DirectResponse>, end_stream: bool) {
        if self.destroyed || self.local_reply_sent {
            return;
        }
        self.local_reply_sent = true;
        self.decode_complete = true;

        let response_metadata = match &self.metadata {
            Some(md) => Metadata::response_for(&md.lock().expect("metadata mutex poisoned")),
            None => Metadata::new(MessageType::Response),
        };
        let metadata = shared_metadata(response_metadata);
        let mutation = shared_mutation(Mutation::new());

        match self.run_encoder_filters(self.encoder_filters.len() as isize - 1, &metadata, &mutation)
        {
            EncodeChainResult::Complete => {
                self.write_local_reply(response, &metadata, &mutation, end_stream)
            }
            EncodeChainResult::Paused => {
                self.pending_encode = Some(PendingEncode {
                    metadata,
                    mutation,
                    kind: PendingEncodeKind::LocalReply {
                        response,
                        end_stream,
                    },
                });
            }
            EncodeChainResult::Stopped => {}
        }
    }

    fn write_local_reply(
        &mut self,
        response: Box<dyn DirectResponse>,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
        end_stream: bool,
    ) {
        let mut md = metadata.lock().expect("metadata mutex poisoned");
        for (key, value) in mutation.lock().expect("mutation mutex poisoned").entries() {
            md.put_string(key.clone(), value.clone());
        }
        let mut buffer = BytesMut::new();
        match response.encode(&mut md, self.codec.as_mut(), &mut buffer) {
            Ok(response_type) => {
                debug!(
                    request_id = md.request_id(),
                    ?response_type,
                    bytes = buffer.len(),
                    "writing local reply"
                );
                drop(md);
                self.downstream.write(&mut buffer, end_stream);
                self.message_active = false;
                if end_stream {
                    self.reset_stream_now();
                } else {
                    self.try_decode_messages();
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to encode local reply, resetting stream");
                drop(md);
                self.reset_stream_now();
            }
        }
    }

    /// Walk encoder filters downward from `idx` (reverse of installation
    /// order).
    fn run_encoder_filters(
        &mut self,
        mut idx: isize,
        metadata: &SharedMetadata,
        mutation: &SharedMutation,
    ) -> EncodeChainResult {
        while idx >= 0 {
            if self.destroyed || self.handle.reset_requested() {
                return EncodeChainResult::Stopped;
            }
            let status = self.encoder_filters[idx as usize].on_message_encoded(metadata, mutation);
            match status {
                FilterStatus::ContinueIteration => idx -= 1,
                FilterStatus::PauseIteration => {
                    self.encode_cursor = idx as usize;
                    return EncodeChainResult::Paused;
                }
                FilterStatus::StopIteration => return EncodeChainResult::Stopped,
                FilterStatus::Retry => idx = self.encoder_filters.len() as isize - 1,
            }
        }
        EncodeChainResult::Complete
    }

    fn resume_encoding(&mut self) {
        let pending = match self.pending_encode.take() {
            Some(pending) => pending,
            None => {
                trace!("continue_encoding without a paused chain, ignoring");
                return;
            }
        };
        let next = self.encode_cursor as isize - 1;
        match self.run_encoder_filters(next, &pending.metadata, &pending.mutation) {
            EncodeChainResult::Complete => match pending.kind {
                PendingEncodeKind::LocalReply {
                    response,
                    end_stream,
                } => self.write_local_reply(response, &pending.metadata, &pending.mutation, end_stream),
                PendingEncodeKind::Response => {
                    self.write_response(&pending.metadata, &pending.mutation)
                }
            },
            EncodeChainResult::Paused => self.pending_encode = Some(pending),
            EncodeChainResult::Stopped => {}
        }
    }

    /// Initialize the response decode path. Called exactly once per
    /// request, on the first upstream data event.
    fn start_upstream_response(&mut self) {
        debug_assert!(!self.response_started);
        self.response_started = true;
        self.router.on_response_started();
        self.response_codec = Some(self.context.codec_factory.create_codec());

        let mut metadata = Metadata::new(MessageType::Response);
        metadata.set_stream_id(self.handle.stream_id());
        if let Some(request_md) = &self.metadata {
            let request_md = request_md.lock().expect("metadata mutex poisoned");
            metadata.set_request_id(request_md.request_id());
            if let Some(addr) = request_md.get_string(crate::metadata::reserved::REAL_SERVER_ADDRESS)
            {
                metadata.put_string(crate::metadata::reserved::REAL_SERVER_ADDRESS, addr);
            }
        }
        self.response_metadata = Some(shared_metadata(metadata));
        self.response_mutation = Some(shared_mutation(Mutation::new()));
    }

    fn on_upstream_data(&mut self, data: BytesMut, _end_stream: bool) {
        self.upstream_buffer.extend_from_slice(&data);
        if !self.response_started {
            self.start_upstream_response();
        }
        match self.upstream_data() {
            UpstreamResponseStatus::MoreDataRequired => {}
            UpstreamResponseStatus::Complete => {
                self.router.on_response_complete();
                self.finish_response();
            }
            UpstreamResponseStatus::Reset => {
                warn!("upstream response decode failure, resetting upstream connection");
                self.router.release_upstream_connection(true);
                self.send_local_reply_now(
                    Box::new(AppException::new(Error::new(
                        ErrorType::BadResponse,
                        "upstream response could not be decoded",
                    ))),
                    true,
                );
            }
            UpstreamResponseStatus::Retry => {
                // Drop the partial response state; the next data event
                // starts decoding from scratch.
                self.response_started = false;
                self.response_codec = None;
                self.response_metadata = None;
                self.response_mutation = None;
            }
        }
    }

    /// Feed buffered upstream bytes to the response decoder.
    fn upstream_data(&mut self) -> UpstreamResponseStatus {
        let codec = match self.response_codec.as_mut() {
            Some(codec) => codec,
            None => return UpstreamResponseStatus::Reset,
        };
        let metadata = match &self.response_metadata {
            Some(md) => md.clone(),
            None => return UpstreamResponseStatus::Reset,
        };
        let mut md = metadata.lock().expect("metadata mutex poisoned");
        match codec.decode(&mut self.upstream_buffer, &mut md) {
            Ok(DecodeStatus::Waiting) => UpstreamResponseStatus::MoreDataRequired,
            Ok(DecodeStatus::Done) => UpstreamResponseStatus::Complete,
            Err(e) => {
                warn!(error = %e, "response decode error");
                UpstreamResponseStatus::Reset
            }
        }
    }

    fn finish_response(&mut self) {
        let (metadata, mutation) = match (self.response_metadata.clone(), self.response_mutation.clone()) {
            (Some(md), Some(mu)) => (md, mu),
            _ => return,
        };

        if let Some(selection) = self.router.route_selection() {
            mutation
                .lock()
                .expect("mutation mutex poisoned")
                .extend_from(selection.route.response_mutation());
        }

        match self.run_encoder_filters(self.encoder_filters.len() as isize - 1, &metadata, &mutation)
        {
            EncodeChainResult::Complete => self.write_response(&metadata, &mutation),
            EncodeChainResult::Paused => {
                self.pending_encode = Some(PendingEncode {
                    metadata,
                    mutation,
                    kind: PendingEncodeKind::Response,
                });
            }
            EncodeChainResult::Stopped => {}
        }
    }

    fn write_response(&mut self, metadata: &SharedMetadata, mutation: &SharedMutation) {
        let mut md = metadata.lock().expect("metadata mutex poisoned");
        let mut buffer = md.take_origin_message();
        let mutation = mutation.lock().expect("mutation mutex poisoned");
        match self.codec.encode(&md, &mutation, &mut buffer) {
            Ok(()) => {
                debug!(
                    request_id = md.request_id(),
                    bytes = buffer.len(),
                    "relaying upstream response downstream"
                );
                drop(md);
                self.downstream.write(&mut buffer, false);
                self.message_active = false;
                self.try_decode_messages();
            }
            Err(e) => {
                warn!(error = %e, "failed to encode response, resetting stream");
                drop(md);
                self.reset_stream_now();
            }
        }
    }

    fn reset_stream_now(&mut self) {
        if self.destroyed {
            return;
        }
        debug!(stream_id = self.handle.stream_id(), "resetting stream");
        self.do_destroy();
        self.downstream.close();
    }

    fn do_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for filter in self.decoder_filters.iter_mut() {
            filter.on_destroy();
        }
        for filter in self.encoder_filters.iter_mut() {
            filter.on_destroy();
        }
        self.router.on_destroy();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stream fixtures shared by the chain and router tests.

    use super::*;
    use crate::filter::FilterChainFactoryCallbacks;
    use crate::frame::RpcFrameCodecFactory;
    use crate::router::ShadowWriterImpl;
    use crate::runtime::StaticRuntime;
    use crate::upstream::StaticClusterManager;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Decoder/encoder spy appending its name to a shared call log and
    /// replaying a programmed status sequence (default Continue).
    pub struct SpyFilter {
        pub name: String,
        pub log: Arc<Mutex<Vec<String>>>,
        pub statuses: Arc<Mutex<VecDeque<FilterStatus>>>,
        pub callbacks: Option<StreamHandle>,
        pub destroyed: Arc<AtomicBool>,
    }

    impl SpyFilter {
        pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log,
                statuses: Arc::new(Mutex::new(VecDeque::new())),
                callbacks: None,
                destroyed: Arc::new(AtomicBool::new(false)),
            }
        }

        pub fn with_statuses(mut self, statuses: &[FilterStatus]) -> Self {
            self.statuses = Arc::new(Mutex::new(statuses.iter().copied().collect()));
            self
        }

        fn next_status(&self) -> FilterStatus {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(FilterStatus::ContinueIteration)
        }
    }

    impl DecoderFilter for SpyFilter {
        fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
            self.callbacks = Some(callbacks);
        }

        fn on_message_decoded(
            &mut self,
            _metadata: &SharedMetadata,
            _mutation: &SharedMutation,
        ) -> FilterStatus {
            self.log.lock().unwrap().push(self.name.clone());
            self.next_status()
        }

        fn on_destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    impl EncoderFilter for SpyFilter {
        fn set_encoder_callbacks(&mut self, callbacks: StreamHandle) {
            self.callbacks = Some(callbacks);
        }

        fn on_message_encoded(
            &mut self,
            _metadata: &SharedMetadata,
            _mutation: &SharedMutation,
        ) -> FilterStatus {
            self.log.lock().unwrap().push(self.name.clone());
            self.next_status()
        }

        fn on_destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    /// Downstream sink recording every write.
    pub struct MockDownstream {
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
        pub closed: Arc<AtomicBool>,
    }

    impl MockDownstream {
        pub fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicBool>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    written: written.clone(),
                    closed: closed.clone(),
                },
                written,
                closed,
            )
        }
    }

    impl DownstreamConnection for MockDownstream {
        fn write(&mut self, data: &mut BytesMut, _end_stream: bool) {
            self.written.lock().unwrap().push(data.to_vec());
            data.clear();
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connection-scoped owner recording transferred connections.
    #[derive(Default)]
    pub struct MockConnectionOwner {
        pub received: Mutex<Vec<Box<dyn ConnectionData>>>,
    }

    impl UpstreamConnectionOwner for MockConnectionOwner {
        fn set_upstream_connection(&self, conn: Box<dyn ConnectionData>) {
            self.received.lock().unwrap().push(conn);
        }
    }

    pub fn proxy_context(
        route_matcher: RouteMatcher,
        cluster_manager: Arc<StaticClusterManager>,
    ) -> Arc<ProxyContext> {
        let cluster_manager: Arc<dyn ClusterManager> = cluster_manager;
        Arc::new(ProxyContext {
            codec_factory: Arc::new(RpcFrameCodecFactory),
            route_matcher: Arc::new(route_matcher),
            cluster_manager: cluster_manager.clone(),
            runtime: Arc::new(StaticRuntime::new()),
            shadow_writer: Arc::new(ShadowWriterImpl::new(cluster_manager)),
        })
    }

    /// Chain factory cloning pre-built spy filters into the stream.
    pub struct SpyChainFactory {
        pub log: Arc<Mutex<Vec<String>>>,
        pub decoder_specs: Vec<(String, Vec<FilterStatus>)>,
        pub encoder_specs: Vec<(String, Vec<FilterStatus>)>,
    }

    impl FilterChainFactory for SpyChainFactory {
        fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks) {
            for (name, statuses) in &self.decoder_specs {
                callbacks.add_decoder_filter(Box::new(
                    SpyFilter::new(name, self.log.clone()).with_statuses(statuses),
                ));
            }
            for (name, statuses) in &self.encoder_specs {
                callbacks.add_encoder_filter(Box::new(
                    SpyFilter::new(name, self.log.clone()).with_statuses(statuses),
                ));
            }
        }
    }
}
