pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod metadata;
pub mod ratelimit;
pub mod request_id;
pub mod route;
pub mod router;
pub mod runtime;
pub mod stream;
pub mod upstream;

// Re-exports
pub use codec::{
    AppException, Codec, CodecFactory, DecodeStatus, DirectResponse, ResponseType,
    UpstreamResponseStatus,
};
pub use error::{Error, ErrorType};
pub use filter::{
    CodecFilter, DecoderFilter, EmptyFilterChainFactory, EncoderFilter, FilterChainFactory,
    FilterChainFactoryCallbacks, FilterStatus,
};
pub use frame::{RpcFrame, RpcFrameCodec, RpcFrameCodecFactory};
pub use metadata::{
    shared_metadata, shared_mutation, MessageType, Metadata, Mutation, SharedMetadata,
    SharedMutation,
};
pub use ratelimit::{DescriptorEntry, LocalDescriptor, LocalRateLimitFilter, LocalRateLimiter};
pub use route::{ClusterChoice, HashPolicy, MirrorPolicy, RouteEntry, RouteMatcher, RouteSelection};
pub use router::{Router, ShadowWriter, ShadowWriterImpl, UpstreamRequest, UpstreamRequestState};
pub use runtime::{FractionDenominator, FractionalPercent, RuntimeLoader, StaticRuntime};
pub use stream::{
    DownstreamConnection, MessageStream, ProxyContext, StreamEvent, StreamHandle,
    UpstreamConnectionOwner,
};
pub use upstream::{
    CancelPolicy, Cancellable, CloseType, ClusterInfo, ClusterManager, ConnectionData,
    ConnectionEvent, ConnectionPool, HostDescription, LoadBalancerContext, NullLbContext,
    NullOutlierDetector, OutlierDetector, OutlierResult, PoolCallbacks, PoolFailureReason,
    ResourcePriority, StaticCluster, StaticClusterManager, TcpPoolData, ThreadLocalCluster,
    UpstreamCallbacks, UpstreamConnection,
};
