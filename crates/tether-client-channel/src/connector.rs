use crate::transport::{TransportFactory, TransportRef};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tether_core::{
    ChannelArgs, CoreError, Dialer, EndpointRef, IntegerOptions, ShutdownSignal, SliceBuffer,
    codes, keys,
};
use tether_handshake::{HandshakeManager, HandshakerRegistry, HandshakerRole};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 握手截止时间的上限。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// 一次连接尝试的输入。
#[derive(Clone, Debug)]
pub struct ConnectArgs {
    /// 通道参数，必须携带 `grpc.subchannel_address`。
    pub channel_args: ChannelArgs,
    /// 拨号与握手共同的截止时间。
    pub deadline: Instant,
}

/// 一次成功连接的产出。
#[derive(Debug)]
pub struct ConnectResult {
    pub transport: TransportRef,
    /// 握手链修改后的通道参数（例如附加了认证上下文）。
    pub channel_args: ChannelArgs,
}

/// 连接器：完成一次“拨号 + 握手 + 构造传输”。
///
/// # 契约（What）
/// - 同一连接器同时至多一次 `connect`，重叠的调用以 [`codes::CONNECTOR_BUSY`] 失败；
/// - `shutdown` 幂等且不可逆，挂起的 `connect` 以错误返回，之后的 `connect` 立即失败。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, args: ConnectArgs) -> Result<ConnectResult, CoreError>;

    fn shutdown(&self, why: CoreError);
}

/// 为每个子通道产出独立的连接器。
///
/// 连接器的 `shutdown` 不可逆，且同一时刻只允许一次连接；
/// 需要在多个地址间共享配置时共享工厂，而不是共享连接器。
pub trait ConnectorFactory: Send + Sync + 'static {
    fn create_connector(&self) -> Arc<dyn Connector>;
}

impl<F> ConnectorFactory for F
where
    F: Fn() -> Arc<dyn Connector> + Send + Sync + 'static,
{
    fn create_connector(&self) -> Arc<dyn Connector> {
        self()
    }
}

#[derive(Default)]
struct ConnectorState {
    shutdown: Option<CoreError>,
    connecting: bool,
    endpoint: Option<EndpointRef>,
    manager: Option<Arc<HandshakeManager>>,
}

/// 拨号后驱动握手链的连接器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把“拨号、可选前导串、握手链、构造传输”四步收在一个对象里，
///   子通道只面对 [`Connector`] 一个接口。
///
/// ## 逻辑（How）
/// 1. 从通道参数取出子通道地址，经 [`Dialer`] 拨号；
/// 2. 若配置了 `grpc.initial_connect_string`，先原样写出；
/// 3. 按角色从 [`HandshakerRegistry`] 组装 [`HandshakeManager`] 并执行；
///    握手截止时间取连接截止时间与 `grpc.handshake_timeout_ms`（默认 120 秒）中较早者；
/// 4. 成功后经 [`TransportFactory`] 构造传输，并以握手残留字节启动读取。
///
/// ## 契约（What）
/// - `shutdown` 在握手开始前直接关闭原始端点，握手开始后转交管理器；
/// - 所有失败路径都会关闭已拨通的端点。
///
/// ## 风险（Trade-offs）
/// - 连接器与子通道一一对应；经 [`SubchannelIndex`](crate::SubchannelIndex) 创建子通道时
///   传入 [`HandshakingConnectorFactory`]，每个子通道各得一个连接器。
pub struct HandshakingConnector {
    dialer: Arc<dyn Dialer>,
    registry: Arc<HandshakerRegistry>,
    factory: Arc<dyn TransportFactory>,
    role: HandshakerRole,
    state: Mutex<ConnectorState>,
    signal: ShutdownSignal,
}

/// 连接结束时复位 `connecting` 与挂起的资源，包括 future 被中途丢弃的情形。
struct ConnectingGuard<'a> {
    state: &'a Mutex<ConnectorState>,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.connecting = false;
        state.endpoint = None;
        state.manager = None;
    }
}

impl HandshakingConnector {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        registry: Arc<HandshakerRegistry>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            registry,
            factory,
            role: HandshakerRole::Client,
            state: Mutex::new(ConnectorState::default()),
            signal: ShutdownSignal::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_error(why: &CoreError) -> CoreError {
        CoreError::wrap(codes::CONNECTOR_SHUTDOWN, "Connector shutdown", why.clone())
    }

    fn handshake_deadline(args: &ChannelArgs, connect_deadline: Instant) -> Instant {
        let cap_ms = DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as i64;
        let timeout_ms = args.get_int(
            keys::HANDSHAKE_TIMEOUT_MS,
            IntegerOptions::new(cap_ms, 1, i64::from(i32::MAX)),
        );
        let timeout = Duration::from_millis(timeout_ms as u64);
        connect_deadline.min(Instant::now() + timeout)
    }

    /// 拨号，期间响应关闭。
    async fn dial(&self, address: &str, args: &ConnectArgs) -> Result<EndpointRef, CoreError> {
        let endpoint = tokio::select! {
            biased;
            why = self.signal.triggered() => return Err(Self::shutdown_error(&why)),
            dialed = self.dialer.dial(address, &args.channel_args, args.deadline) => dialed?,
        };
        let mut state = self.lock();
        if let Some(why) = state.shutdown.clone() {
            drop(state);
            let err = Self::shutdown_error(&why);
            endpoint.shutdown(err.clone());
            return Err(err);
        }
        state.endpoint = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    async fn write_initial_connect_string(
        &self,
        endpoint: &EndpointRef,
        args: &ChannelArgs,
    ) -> Result<(), CoreError> {
        let Some(preamble) = args.get_string(keys::INITIAL_CONNECT_STRING) else {
            return Ok(());
        };
        if preamble.is_empty() {
            return Ok(());
        }
        debug!(peer = %endpoint.peer(), bytes = preamble.len(), "writing initial connect string");
        let preamble = SliceBuffer::from(preamble.as_bytes().to_vec());
        tokio::select! {
            biased;
            why = self.signal.triggered() => Err(Self::shutdown_error(&why)),
            written = endpoint.write(preamble) => written,
        }
    }

    async fn handshake(
        &self,
        endpoint: EndpointRef,
        args: &ConnectArgs,
    ) -> Result<ConnectResult, CoreError> {
        let manager = HandshakeManager::new();
        self.registry
            .add_handshakers(self.role, &args.channel_args, &manager);
        {
            let mut state = self.lock();
            if let Some(why) = state.shutdown.clone() {
                drop(state);
                let err = Self::shutdown_error(&why);
                endpoint.shutdown(err.clone());
                return Err(err);
            }
            state.endpoint = None;
            state.manager = Some(Arc::clone(&manager));
        }

        let deadline = Self::handshake_deadline(&args.channel_args, args.deadline);
        debug!(peer = %endpoint.peer(), handshakers = ?manager.handshaker_names(), "starting handshake");
        let done = manager
            .do_handshake(endpoint, &args.channel_args, deadline, None)
            .await?;

        let shutdown = {
            let mut state = self.lock();
            state.manager = None;
            state.shutdown.clone()
        };
        if let Some(why) = shutdown {
            let err = Self::shutdown_error(&why);
            done.endpoint.shutdown(err.clone());
            return Err(err);
        }

        let peer = done.endpoint.peer();
        let transport = match self
            .factory
            .create_transport(Arc::clone(&done.endpoint), &done.args)
        {
            Ok(transport) => transport,
            Err(err) => {
                done.endpoint.shutdown(err.clone());
                return Err(err);
            }
        };
        transport.start_reading(done.read_buffer);
        info!(%peer, transport = transport.name(), "connection established");
        Ok(ConnectResult {
            transport,
            channel_args: done.args,
        })
    }
}

/// 以共享的拨号器、握手注册表与传输工厂构造 [`HandshakingConnector`]。
#[derive(Clone)]
pub struct HandshakingConnectorFactory {
    dialer: Arc<dyn Dialer>,
    registry: Arc<HandshakerRegistry>,
    factory: Arc<dyn TransportFactory>,
}

impl HandshakingConnectorFactory {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        registry: Arc<HandshakerRegistry>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            registry,
            factory,
        })
    }
}

impl ConnectorFactory for HandshakingConnectorFactory {
    fn create_connector(&self) -> Arc<dyn Connector> {
        HandshakingConnector::new(
            Arc::clone(&self.dialer),
            Arc::clone(&self.registry),
            Arc::clone(&self.factory),
        )
    }
}

impl fmt::Debug for HandshakingConnectorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakingConnectorFactory")
            .field("registry", &self.registry)
            .finish()
    }
}

#[async_trait]
impl Connector for HandshakingConnector {
    async fn connect(&self, args: ConnectArgs) -> Result<ConnectResult, CoreError> {
        {
            let mut state = self.lock();
            if let Some(why) = state.shutdown.as_ref() {
                return Err(Self::shutdown_error(why));
            }
            if state.connecting {
                warn!("connect requested while another attempt is in flight");
                return Err(CoreError::new(
                    codes::CONNECTOR_BUSY,
                    "connector already has a connect in flight",
                ));
            }
            state.connecting = true;
        }
        let _guard = ConnectingGuard { state: &self.state };

        let Some(address) = args
            .channel_args
            .get_string(keys::SUBCHANNEL_ADDRESS)
            .map(str::to_owned)
        else {
            return Err(CoreError::new(
                codes::ARGS_INVALID,
                "connect args carry no grpc.subchannel_address",
            ));
        };

        let endpoint = self.dial(&address, &args).await?;
        if let Err(err) = self.write_initial_connect_string(&endpoint, &args.channel_args).await {
            warn!(%address, error = %err, "failed to write initial connect string");
            endpoint.shutdown(err.clone());
            return Err(err);
        }
        self.handshake(endpoint, &args).await.inspect_err(|err| {
            debug!(%address, error = %err, "connect attempt failed");
        })
    }

    fn shutdown(&self, why: CoreError) {
        let (endpoint, manager) = {
            let mut state = self.lock();
            if state.shutdown.is_some() {
                return;
            }
            state.shutdown = Some(why.clone());
            (state.endpoint.take(), state.manager.take())
        };
        debug!(reason = %why, "connector shutdown");
        self.signal.trigger(why.clone());
        let err = Self::shutdown_error(&why);
        if let Some(manager) = manager {
            manager.shutdown(err);
        } else if let Some(endpoint) = endpoint {
            endpoint.shutdown(err);
        }
    }
}

impl fmt::Debug for HandshakingConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("HandshakingConnector")
            .field("role", &self.role)
            .field("registry", &self.registry)
            .field("connecting", &state.connecting)
            .field("shutdown", &state.shutdown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::EndpointTransportFactory;
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };
    use tether_core::{Endpoint, ErrorCategory, endpoint::testing::MemoryEndpoint};
    use tether_handshake::{Acceptor, Handshaker, HandshakerArgs, HandshakerFactory};
    use tokio::sync::{Notify, mpsc};

    /// 每次拨号返回内存端点对的一端，另一端交给测试。
    struct MemoryDialer {
        peers: mpsc::UnboundedSender<Arc<MemoryEndpoint>>,
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(
            &self,
            address: &str,
            _args: &ChannelArgs,
            _deadline: Instant,
        ) -> Result<EndpointRef, CoreError> {
            let (client, server) = MemoryEndpoint::pair("client", address);
            let _ = self.peers.send(server);
            Ok(client)
        }
    }

    /// 永不完成的拨号。
    struct StalledDialer;

    #[async_trait]
    impl Dialer for StalledDialer {
        async fn dial(
            &self,
            _address: &str,
            _args: &ChannelArgs,
            _deadline: Instant,
        ) -> Result<EndpointRef, CoreError> {
            std::future::pending().await
        }
    }

    /// 挂起直到被关闭的握手器，记录收到的关闭次数。
    struct StallingHandshaker {
        shutdowns: Arc<AtomicUsize>,
        started: Arc<Notify>,
        signal: ShutdownSignal,
    }

    #[async_trait]
    impl Handshaker for StallingHandshaker {
        fn name(&self) -> &'static str {
            "stalling"
        }

        async fn do_handshake(
            self: Arc<Self>,
            _acceptor: Option<Acceptor>,
            args: HandshakerArgs,
        ) -> Result<HandshakerArgs, CoreError> {
            self.started.notify_one();
            let why = self.signal.triggered().await;
            Err(args.abandon(why))
        }

        fn shutdown(&self, why: CoreError) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.signal.trigger(why);
        }
    }

    struct StallingFactory {
        shutdowns: Arc<AtomicUsize>,
        started: Arc<Notify>,
    }

    impl HandshakerFactory for StallingFactory {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn add_handshakers(&self, _args: &ChannelArgs, manager: &HandshakeManager) {
            manager.add(Arc::new(StallingHandshaker {
                shutdowns: Arc::clone(&self.shutdowns),
                started: Arc::clone(&self.started),
                signal: ShutdownSignal::new(),
            }));
        }
    }

    fn connector_with(dialer: Arc<dyn Dialer>) -> Arc<HandshakingConnector> {
        HandshakingConnector::new(
            dialer,
            Arc::new(HandshakerRegistry::with_defaults()),
            Arc::new(EndpointTransportFactory),
        )
    }

    fn connect_args(args: ChannelArgs) -> ConnectArgs {
        ConnectArgs {
            channel_args: args.with_string(keys::SUBCHANNEL_ADDRESS, "backend:443"),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn plain_connect_writes_preamble_and_yields_transport() {
        let (tx, mut peers) = mpsc::unbounded_channel();
        let connector = connector_with(Arc::new(MemoryDialer { peers: tx }));
        let args = ChannelArgs::new().with_string(keys::INITIAL_CONNECT_STRING, "PRE");

        let result = connector.connect(connect_args(args)).await.expect("connect");
        assert_eq!(result.transport.peer(), "backend:443");
        assert_eq!(result.transport.name(), "endpoint");

        let server = peers.recv().await.expect("dialed");
        let mut slices = SliceBuffer::new();
        server.read(&mut slices, false).await.expect("preamble");
        assert_eq!(slices.to_vec(), b"PRE");
    }

    #[tokio::test]
    async fn factory_connectors_are_independent() {
        let (tx, _peers) = mpsc::unbounded_channel();
        let factory = HandshakingConnectorFactory::new(
            Arc::new(MemoryDialer { peers: tx }),
            Arc::new(HandshakerRegistry::with_defaults()),
            Arc::new(EndpointTransportFactory),
        );
        let first = factory.create_connector();
        let second = factory.create_connector();
        first.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "bye"));

        let err = first
            .connect(connect_args(ChannelArgs::new()))
            .await
            .expect_err("shut down");
        assert_eq!(err.code(), codes::CONNECTOR_SHUTDOWN);
        let result = second
            .connect(connect_args(ChannelArgs::new()))
            .await
            .expect("second connector unaffected");
        assert_eq!(result.transport.peer(), "backend:443");
    }

    #[tokio::test]
    async fn missing_address_is_rejected() {
        let (tx, _peers) = mpsc::unbounded_channel();
        let connector = connector_with(Arc::new(MemoryDialer { peers: tx }));
        let err = connector
            .connect(ConnectArgs {
                channel_args: ChannelArgs::new(),
                deadline: Instant::now() + Duration::from_secs(1),
            })
            .await
            .expect_err("no address");
        assert_eq!(err.code(), codes::ARGS_INVALID);
    }

    #[tokio::test]
    async fn shutdown_interrupts_dial_and_rejects_later_connects() {
        let connector = connector_with(Arc::new(StalledDialer));
        let pending = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect(connect_args(ChannelArgs::new())).await })
        };
        tokio::task::yield_now().await;
        connector.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "bye"));
        connector.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "again"));

        let err = pending.await.expect("join").expect_err("interrupted");
        assert_eq!(err.code(), codes::CONNECTOR_SHUTDOWN);
        assert_eq!(
            err.find_code(codes::SUBCHANNEL_DISCONNECTED).map(|e| e.message().to_owned()),
            Some("bye".to_owned())
        );

        let err = connector
            .connect(connect_args(ChannelArgs::new()))
            .await
            .expect_err("after shutdown");
        assert_eq!(err.code(), codes::CONNECTOR_SHUTDOWN);
    }

    #[tokio::test]
    async fn shutdown_during_handshake_goes_through_manager() {
        let (tx, mut peers) = mpsc::unbounded_channel();
        let connector = connector_with(Arc::new(MemoryDialer { peers: tx }));
        let args = ChannelArgs::new().with_string(keys::HTTP_CONNECT_SERVER, "target:1");
        let pending = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect(connect_args(args)).await })
        };
        let proxy = peers.recv().await.expect("dialed");
        let mut slices = SliceBuffer::new();
        proxy.read(&mut slices, false).await.expect("CONNECT request");
        assert!(slices.to_vec().starts_with(b"CONNECT target:1 HTTP/1.0\r\n"));

        connector.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "bye"));
        let err = pending.await.expect("join").expect_err("interrupted");
        assert!(err.find_code(codes::CONNECTOR_SHUTDOWN).is_some(), "{err}");
        proxy
            .read(&mut slices, false)
            .await
            .expect_err("client endpoint closed");
    }

    #[tokio::test]
    async fn overlapping_connect_is_refused_without_disturbing_the_first() {
        let connector = connector_with(Arc::new(StalledDialer));
        let first = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect(connect_args(ChannelArgs::new())).await })
        };
        tokio::task::yield_now().await;

        let err = connector
            .connect(connect_args(ChannelArgs::new()))
            .await
            .expect_err("second connect while the first is dialing");
        assert_eq!(err.code(), codes::CONNECTOR_BUSY);
        assert_eq!(err.category(), ErrorCategory::Unavailable);
        assert!(!first.is_finished());

        connector.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "bye"));
        let err = first.await.expect("join").expect_err("interrupted");
        assert_eq!(err.code(), codes::CONNECTOR_SHUTDOWN);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_shutdowns_reach_the_handshaker_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let mut registry = HandshakerRegistry::new();
        registry.register(
            false,
            HandshakerRole::Client,
            Arc::new(StallingFactory {
                shutdowns: Arc::clone(&shutdowns),
                started: Arc::clone(&started),
            }),
        );
        let (tx, mut peers) = mpsc::unbounded_channel();
        let connector = HandshakingConnector::new(
            Arc::new(MemoryDialer { peers: tx }),
            Arc::new(registry),
            Arc::new(EndpointTransportFactory),
        );
        let pending = {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.connect(connect_args(ChannelArgs::new())).await })
        };
        started.notified().await;

        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|reason| {
                let connector = Arc::clone(&connector);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    connector.shutdown(CoreError::new(codes::SUBCHANNEL_DISCONNECTED, reason));
                })
            })
            .collect();
        for racer in racers {
            racer.join().expect("racer thread");
        }

        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("connect resolves")
            .expect("join")
            .expect_err("shut down");
        let reason = err
            .find_code(codes::SUBCHANNEL_DISCONNECTED)
            .map(|cause| cause.message().to_owned())
            .expect("shutdown reason in cause chain");
        assert!(reason == "first" || reason == "second", "{reason}");
        assert!(err.find_code(codes::CONNECTOR_SHUTDOWN).is_some(), "{err}");
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let server = peers.recv().await.expect("dialed");
        let mut slices = SliceBuffer::new();
        server
            .read(&mut slices, false)
            .await
            .expect_err("client endpoint closed");
    }

    #[test]
    fn handshake_deadline_is_capped_by_arg() {
        let now = Instant::now();
        let far = now + Duration::from_secs(3600);
        let args = ChannelArgs::new().with_int(keys::HANDSHAKE_TIMEOUT_MS, 500);
        let capped = HandshakingConnector::handshake_deadline(&args, far);
        assert!(capped <= Instant::now() + Duration::from_millis(500));

        let near = now + Duration::from_millis(10);
        assert_eq!(HandshakingConnector::handshake_deadline(&ChannelArgs::new(), near), near);
    }
}
