//! Host-side upstream abstractions consumed by the router: connection
//! pools, cluster lookup, host descriptions and outlier reporting. The
//! host wires real network plumbing behind these traits; this crate only
//! drives them.

use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// Too many pending connections; reported synchronously from
    /// `new_connection`.
    Overflow,
    Timeout,
    LocalConnectionFailure,
    RemoteConnectionFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    Default,
    CloseExcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    NoFlush,
    FlushWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    RemoteClose,
    LocalClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePriority {
    Default,
    High,
}

/// Per-host health signal reported to the host's outlier detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierResult {
    LocalOriginConnectSuccess,
    LocalOriginConnectFailed,
    LocalOriginTimeout,
}

pub trait OutlierDetector: Send + Sync {
    fn put_result(&self, result: OutlierResult);
}

/// Detector that discards every signal.
#[derive(Debug, Default)]
pub struct NullOutlierDetector;

impl OutlierDetector for NullOutlierDetector {
    fn put_result(&self, _result: OutlierResult) {}
}

/// Immutable description of one upstream endpoint.
pub struct HostDescription {
    address: String,
    outlier: Arc<dyn OutlierDetector>,
}

impl HostDescription {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            outlier: Arc::new(NullOutlierDetector),
        }
    }

    pub fn with_outlier(address: impl Into<String>, outlier: Arc<dyn OutlierDetector>) -> Self {
        Self {
            address: address.into(),
            outlier,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn outlier_detector(&self) -> &dyn OutlierDetector {
        self.outlier.as_ref()
    }
}

impl std::fmt::Debug for HostDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDescription")
            .field("address", &self.address)
            .finish()
    }
}

/// A live upstream connection checked out of the pool.
pub trait UpstreamConnection: Send {
    fn write(&mut self, data: &mut BytesMut, end_stream: bool);
    fn close(&mut self, close_type: CloseType);
    fn remote_address(&self) -> String;
}

/// Events and data flowing back from an upstream connection.
pub trait UpstreamCallbacks: Send + Sync {
    fn on_upstream_data(&self, data: BytesMut, end_stream: bool);
    fn on_event(&self, event: ConnectionEvent);
}

/// Pool-owned wrapper around a checked-out connection. Dropping it
/// returns the connection to the pool for reuse.
pub trait ConnectionData: Send {
    fn connection(&mut self) -> &mut dyn UpstreamConnection;
    fn set_upstream_callbacks(&mut self, callbacks: Arc<dyn UpstreamCallbacks>);
}

/// Receiver side of an asynchronous connection acquisition.
pub trait PoolCallbacks: Send + Sync {
    fn on_pool_ready(&self, conn: Box<dyn ConnectionData>, host: Arc<HostDescription>);
    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<HostDescription>>);
}

/// Cancellation token for a pending acquisition.
pub trait Cancellable: Send {
    fn cancel(&self, policy: CancelPolicy);
}

pub trait ConnectionPool: Send + Sync {
    /// Request a connection. Returns a cancellable handle when the
    /// acquisition completes asynchronously; otherwise the callbacks have
    /// already fired by the time this returns `None`.
    fn new_connection(&self, callbacks: Arc<dyn PoolCallbacks>) -> Option<Box<dyn Cancellable>>;
}

/// Pool selected for a specific cluster and load-balancer context.
#[derive(Clone)]
pub struct TcpPoolData {
    pool: Arc<dyn ConnectionPool>,
}

impl TcpPoolData {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn new_connection(&self, callbacks: Arc<dyn PoolCallbacks>) -> Option<Box<dyn Cancellable>> {
        self.pool.new_connection(callbacks)
    }
}

/// Static facts about a cluster.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    name: String,
    maintenance_mode: bool,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            maintenance_mode: false,
        }
    }

    pub fn with_maintenance(name: impl Into<String>, maintenance_mode: bool) -> Self {
        Self {
            name: name.into(),
            maintenance_mode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn maintenance_mode(&self) -> bool {
        self.maintenance_mode
    }
}

/// Hints the router hands to the host load balancer.
pub trait LoadBalancerContext {
    /// Consistent-hash key derived from the route's hash policy.
    fn hash_key(&self) -> Option<u64>;

    /// Subset-selection keys from a weighted-cluster override.
    fn metadata_match(&self) -> Option<&[(String, String)]>;
}

/// Context with no hints, used by shadow submissions.
#[derive(Debug, Default)]
pub struct NullLbContext;

impl LoadBalancerContext for NullLbContext {
    fn hash_key(&self) -> Option<u64> {
        None
    }

    fn metadata_match(&self) -> Option<&[(String, String)]> {
        None
    }
}

pub trait ThreadLocalCluster: Send + Sync {
    fn info(&self) -> Arc<ClusterInfo>;

    /// Pick a pool for this request. `None` means no healthy host.
    fn tcp_conn_pool(
        &self,
        priority: ResourcePriority,
        context: &dyn LoadBalancerContext,
    ) -> Option<TcpPoolData>;
}

pub trait ClusterManager: Send + Sync {
    fn get_thread_local_cluster(&self, name: &str) -> Option<Arc<dyn ThreadLocalCluster>>;
}

/// Simple cluster backed by a single pool.
pub struct StaticCluster {
    info: Arc<ClusterInfo>,
    pool: Option<Arc<dyn ConnectionPool>>,
}

impl StaticCluster {
    pub fn new(info: ClusterInfo, pool: Option<Arc<dyn ConnectionPool>>) -> Self {
        Self {
            info: Arc::new(info),
            pool,
        }
    }
}

impl ThreadLocalCluster for StaticCluster {
    fn info(&self) -> Arc<ClusterInfo> {
        self.info.clone()
    }

    fn tcp_conn_pool(
        &self,
        _priority: ResourcePriority,
        _context: &dyn LoadBalancerContext,
    ) -> Option<TcpPoolData> {
        self.pool.as_ref().map(|p| TcpPoolData::new(p.clone()))
    }
}

/// In-memory cluster registry shared across workers.
#[derive(Default)]
pub struct StaticClusterManager {
    clusters: DashMap<String, Arc<dyn ThreadLocalCluster>>,
}

impl StaticClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cluster(&self, name: impl Into<String>, cluster: Arc<dyn ThreadLocalCluster>) {
        self.clusters.insert(name.into(), cluster);
    }
}

impl ClusterManager for StaticClusterManager {
    fn get_thread_local_cluster(&self, name: &str) -> Option<Arc<dyn ThreadLocalCluster>> {
        self.clusters.get(name).map(|c| c.value().clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared mock upstream plumbing for router and stream tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingOutlier {
        pub results: Mutex<Vec<OutlierResult>>,
    }

    impl OutlierDetector for RecordingOutlier {
        fn put_result(&self, result: OutlierResult) {
            self.results.lock().unwrap().push(result);
        }
    }

    /// Connection that records everything written to it.
    pub struct MockConnection {
        pub address: String,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub closed: Arc<AtomicBool>,
    }

    impl UpstreamConnection for MockConnection {
        fn write(&mut self, data: &mut BytesMut, _end_stream: bool) {
            self.written.lock().unwrap().extend_from_slice(data);
            data.clear();
        }

        fn close(&mut self, _close_type: CloseType) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn remote_address(&self) -> String {
            self.address.clone()
        }
    }

    pub struct MockConnData {
        conn: MockConnection,
        pub callbacks: Arc<Mutex<Option<Arc<dyn UpstreamCallbacks>>>>,
        pub released: Arc<AtomicBool>,
    }

    impl MockConnData {
        pub fn new(address: &str) -> (Self, MockConnHandles) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let released = Arc::new(AtomicBool::new(false));
            let callbacks = Arc::new(Mutex::new(None));
            let data = Self {
                conn: MockConnection {
                    address: address.to_string(),
                    written: written.clone(),
                    closed: closed.clone(),
                },
                callbacks: callbacks.clone(),
                released: released.clone(),
            };
            (
                data,
                MockConnHandles {
                    written,
                    closed,
                    released,
                    callbacks,
                },
            )
        }
    }

    impl ConnectionData for MockConnData {
        fn connection(&mut self) -> &mut dyn UpstreamConnection {
            &mut self.conn
        }

        fn set_upstream_callbacks(&mut self, callbacks: Arc<dyn UpstreamCallbacks>) {
            *self.callbacks.lock().unwrap() = Some(callbacks);
        }
    }

    impl Drop for MockConnData {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Observation handles for a [`MockConnData`] given out to the pool.
    #[derive(Clone)]
    pub struct MockConnHandles {
        pub written: Arc<Mutex<Vec<u8>>>,
        pub closed: Arc<AtomicBool>,
        pub released: Arc<AtomicBool>,
        pub callbacks: Arc<Mutex<Option<Arc<dyn UpstreamCallbacks>>>>,
    }

    pub enum MockPoolMode {
        /// Fire `on_pool_ready` from inside `new_connection`.
        SyncReady,
        /// Fire `on_pool_failure` from inside `new_connection`.
        SyncFailure(PoolFailureReason),
        /// Return a handle; the test delivers the outcome later.
        Pending,
    }

    pub struct MockPool {
        pub mode: Mutex<MockPoolMode>,
        pub address: String,
        pub outlier: Arc<RecordingOutlier>,
        pub callbacks: Mutex<Option<Arc<dyn PoolCallbacks>>>,
        pub cancelled: Arc<AtomicUsize>,
        pub conn_handles: Mutex<Option<MockConnHandles>>,
    }

    impl MockPool {
        pub fn new(mode: MockPoolMode, address: &str) -> Arc<Self> {
            Arc::new(Self {
                mode: Mutex::new(mode),
                address: address.to_string(),
                outlier: Arc::new(RecordingOutlier::default()),
                callbacks: Mutex::new(None),
                cancelled: Arc::new(AtomicUsize::new(0)),
                conn_handles: Mutex::new(None),
            })
        }

        pub fn host(&self) -> Arc<HostDescription> {
            Arc::new(HostDescription::with_outlier(
                self.address.clone(),
                self.outlier.clone(),
            ))
        }

        fn ready(&self, callbacks: &Arc<dyn PoolCallbacks>) {
            let (conn, handles) = MockConnData::new(&self.address);
            *self.conn_handles.lock().unwrap() = Some(handles);
            callbacks.on_pool_ready(Box::new(conn), self.host());
        }

        /// Deliver a ready outcome for a pending acquisition.
        pub fn deliver_ready(&self) {
            let callbacks = self
                .callbacks
                .lock()
                .unwrap()
                .clone()
                .expect("no pending acquisition");
            self.ready(&callbacks);
        }

        /// Deliver a failure outcome for a pending acquisition.
        pub fn deliver_failure(&self, reason: PoolFailureReason) {
            let callbacks = self
                .callbacks
                .lock()
                .unwrap()
                .clone()
                .expect("no pending acquisition");
            callbacks.on_pool_failure(reason, Some(self.host()));
        }

        pub fn handles(&self) -> MockConnHandles {
            self.conn_handles
                .lock()
                .unwrap()
                .clone()
                .expect("no connection handed out")
        }
    }

    impl ConnectionPool for MockPool {
        fn new_connection(&self, callbacks: Arc<dyn PoolCallbacks>) -> Option<Box<dyn Cancellable>> {
            match &*self.mode.lock().unwrap() {
                MockPoolMode::SyncReady => {
                    self.ready(&callbacks);
                    None
                }
                MockPoolMode::SyncFailure(reason) => {
                    callbacks.on_pool_failure(*reason, Some(self.host()));
                    None
                }
                MockPoolMode::Pending => {
                    *self.callbacks.lock().unwrap() = Some(callbacks);
                    Some(Box::new(MockCancellable {
                        cancelled: self.cancelled.clone(),
                    }))
                }
            }
        }
    }

    pub struct MockCancellable {
        cancelled: Arc<AtomicUsize>,
    }

    impl Cancellable for MockCancellable {
        fn cancel(&self, _policy: CancelPolicy) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Cluster manager preloaded with one cluster per call.
    pub fn single_cluster_manager(
        name: &str,
        maintenance: bool,
        pool: Option<Arc<dyn ConnectionPool>>,
    ) -> Arc<StaticClusterManager> {
        let manager = Arc::new(StaticClusterManager::new());
        manager.add_cluster(
            name,
            Arc::new(StaticCluster::new(
                ClusterInfo::with_maintenance(name, maintenance),
                pool,
            )),
        );
        manager
    }
}
