use crate::{
    connected::ConnectedSubchannel,
    connector::{ConnectArgs, ConnectResult, Connector},
    index::Registration,
    proxy::ProxyMapper,
};
use arc_swap::ArcSwapOption;
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};
use tether_core::{
    Backoff, BackoffConfig, ChannelArgs, ConnectivityState, ConnectivityStateTracker, CoreError,
    ErrorCategory, ShutdownSignal, StateCallback, WatcherId, codes, keys,
};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

/// 重连节奏相关的可变状态，由子通道的唯一一把锁保护。
struct AttemptState {
    disconnected: bool,
    connecting: bool,
    backoff: Backoff,
    backoff_begun: bool,
    next_attempt: Instant,
    /// 每次发布新连接递增，用于识别过期的传输观察者。
    generation: u64,
}

pub(crate) struct SubchannelInner {
    address: String,
    args: ChannelArgs,
    connector: Arc<dyn Connector>,
    tracker: ConnectivityStateTracker,
    connected: ArcSwapOption<ConnectedSubchannel>,
    strong: AtomicUsize,
    state: Mutex<AttemptState>,
    disconnect_signal: ShutdownSignal,
    registration: OnceLock<Registration>,
}

/// 子通道的强引用句柄。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 子通道是“某个地址的长期连接管理者”：按需拨号、失败后退避重连、
///   连接丢失后重新建立，并通过连通性状态向外汇报。
///
/// ## 逻辑（How）
/// - 强引用计数与内部 `Arc` 分离：`Subchannel` 计入强引用，[`WeakSubchannel`] 与内部任务只持有 `Arc`；
///   最后一个强引用释放时执行断开，状态转为终态 `SHUTDOWN`；
/// - 连接尝试串行化：`connecting` 标志保证同一时刻至多一次 [`Connector::connect`]；
/// - 首次尝试立即开始；之后每次尝试在上一次给出的 `next_attempt` 处触发，再由退避推进下一时刻；
/// - 连接成功后在传输的追踪器上登记观察者，传输失效时丢弃 [`ConnectedSubchannel`]，
///   转入 `TRANSIENT_FAILURE` 并立即重新进入连接循环（退避已在连接成功时复位）。
///
/// ## 契约（What）
/// - 惰性连接：没有观察者的子通道从不拨号；
/// - 观察者回调总在锁外投递，可以安全地重入子通道；
/// - 内部闭包只持有弱引用，不会形成“子通道 → 传输 → 观察者 → 子通道”的环。
///
/// ## 风险（Trade-offs）
/// - 所有后台步骤都是 `tokio::spawn` 的任务，创建子通道的代码必须运行在 Tokio 运行时内。
pub struct Subchannel {
    inner: Arc<SubchannelInner>,
}

/// 不计入强引用的句柄；[`upgrade`](Self::upgrade) 在强引用归零后失败。
#[derive(Clone)]
pub struct WeakSubchannel {
    inner: Arc<SubchannelInner>,
}

impl Subchannel {
    /// 为 `address` 创建子通道。
    pub fn create(connector: Arc<dyn Connector>, address: &str, args: &ChannelArgs) -> Subchannel {
        Self::create_with_proxy_mapper(connector, address, args, None)
    }

    /// 同 [`create`](Self::create)，创建前先咨询代理映射器。
    pub fn create_with_proxy_mapper(
        connector: Arc<dyn Connector>,
        address: &str,
        args: &ChannelArgs,
        mapper: Option<&dyn ProxyMapper>,
    ) -> Subchannel {
        let (address, args) = match mapper.and_then(|mapper| mapper.map_address(address, args)) {
            Some((mapped, args)) => (mapped, args),
            None => (address.to_owned(), args.clone()),
        };
        let args = args
            .without(keys::SUBCHANNEL_ADDRESS)
            .with_string(keys::SUBCHANNEL_ADDRESS, &address);
        let backoff = Backoff::new(BackoffConfig::from_channel_args(&args));
        debug!(%address, backoff = ?backoff.config(), "subchannel created");
        Subchannel {
            inner: Arc::new(SubchannelInner {
                address,
                args,
                connector,
                tracker: ConnectivityStateTracker::new("subchannel", ConnectivityState::Idle),
                connected: ArcSwapOption::empty(),
                strong: AtomicUsize::new(1),
                state: Mutex::new(AttemptState {
                    disconnected: false,
                    connecting: false,
                    backoff,
                    backoff_begun: false,
                    next_attempt: Instant::now(),
                    generation: 0,
                }),
                disconnect_signal: ShutdownSignal::new(),
                registration: OnceLock::new(),
            }),
        }
    }

    /// 实际拨号的地址（经代理映射后）。
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// 传给连接器的通道参数，含 `grpc.subchannel_address`。
    pub fn channel_args(&self) -> &ChannelArgs {
        &self.inner.args
    }

    pub fn check_connectivity(&self) -> ConnectivityState {
        self.inner.tracker.check()
    }

    /// 当前状态及其附带的错误。
    pub fn connectivity(&self) -> (ConnectivityState, Option<CoreError>) {
        self.inner.tracker.state()
    }

    /// 登记一次性观察者，并在需要时开始连接。
    ///
    /// 状态已不同于 `current` 时回调立即投递，返回 `None`；
    /// 否则返回可用于 [`cancel_watch`](Self::cancel_watch) 的句柄。
    pub fn notify_on_state_change(
        &self,
        current: ConnectivityState,
        callback: StateCallback,
    ) -> Option<WatcherId> {
        let (id, immediate) = self.inner.tracker.notify_on_state_change(current, callback);
        self.inner.maybe_start_connecting(true);
        immediate.deliver();
        id
    }

    /// 撤销观察者，回调以 [`codes::WATCH_CANCELLED`] 投递一次。
    pub fn cancel_watch(&self, id: WatcherId) {
        self.inner.tracker.cancel_watch(id).deliver();
    }

    /// 持续观察状态：先送出当前状态，之后每次变化送出一次，直到 `SHUTDOWN` 或接收端关闭。
    ///
    /// 订阅本身即表示对连接感兴趣。
    pub fn watch_states(&self) -> mpsc::UnboundedReceiver<(ConnectivityState, Option<CoreError>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, error) = self.inner.tracker.state();
        if tx.send((state, error)).is_ok() && state != ConnectivityState::Shutdown {
            SubchannelInner::forward_states(&self.inner, state, tx);
        }
        rx
    }

    /// 当前连接；未就绪时为 `None`。
    pub fn connected_subchannel(&self) -> Option<Arc<ConnectedSubchannel>> {
        self.inner.connected.load_full()
    }

    pub fn downgrade(&self) -> WeakSubchannel {
        WeakSubchannel {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn set_registration(&self, registration: Registration) {
        if self.inner.registration.set(registration).is_err() {
            warn!(address = %self.inner.address, "subchannel already registered in an index");
        }
    }
}

impl Clone for Subchannel {
    fn clone(&self) -> Self {
        let previous = self.inner.strong.fetch_add(1, Ordering::Relaxed);
        assert!(
            previous > 0,
            "Subchannel cloned after its last strong ref was dropped"
        );
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Subchannel {
    fn drop(&mut self) {
        if self.inner.strong.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.disconnect();
        }
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl WeakSubchannel {
    /// 强引用仍大于零时取得新的强引用。
    pub fn upgrade(&self) -> Option<Subchannel> {
        let mut current = self.inner.strong.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.inner.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Subchannel {
                        inner: Arc::clone(&self.inner),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn check_connectivity(&self) -> ConnectivityState {
        self.inner.tracker.check()
    }

    pub(crate) fn ptr_eq(&self, other: &WeakSubchannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WeakSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl SubchannelInner {
    fn lock(&self) -> MutexGuard<'_, AttemptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `requested` 为真表示调用方刚刚表达了兴趣，跳过观察者检查。
    fn maybe_start_connecting(self: &Arc<Self>, requested: bool) {
        let now = Instant::now();
        let retry_at = {
            let mut state = self.lock();
            if state.disconnected || state.connecting || self.connected.load().is_some() {
                return;
            }
            if !requested && !self.tracker.has_watchers() {
                return;
            }
            state.connecting = true;
            if !state.backoff_begun {
                state.backoff_begun = true;
                state.next_attempt = state.backoff.begin(now);
                None
            } else {
                let at = state.next_attempt;
                if at <= now {
                    info!(address = %self.address, "Retry immediately");
                } else {
                    info!(
                        address = %self.address,
                        delay_ms = (at - now).as_millis() as u64,
                        "Retry in"
                    );
                }
                Some(at)
            }
        };
        tokio::spawn(Arc::clone(self).run_attempt(retry_at));
    }

    async fn run_attempt(self: Arc<Self>, retry_at: Option<Instant>) {
        if let Some(at) = retry_at {
            tokio::select! {
                biased;
                _ = self.disconnect_signal.triggered() => {
                    self.lock().connecting = false;
                    return;
                }
                _ = sleep_until(at) => {}
            }
            let now = Instant::now();
            let mut state = self.lock();
            if state.disconnected {
                state.connecting = false;
                return;
            }
            info!(address = %self.address, "Failed to connect to channel, retrying");
            state.next_attempt = state.backoff.step(now);
        }
        self.continue_connect().await;
    }

    async fn continue_connect(self: Arc<Self>) {
        let now = Instant::now();
        let (deadline, notes) = {
            let mut state = self.lock();
            if state.disconnected {
                state.connecting = false;
                return;
            }
            let deadline = state.next_attempt.max(now + state.backoff.config().min());
            let notes = self
                .tracker
                .set(ConnectivityState::Connecting, None, "state_change");
            (deadline, notes)
        };
        notes.deliver();
        debug!(address = %self.address, "starting connect attempt");
        let result = self
            .connector
            .connect(ConnectArgs {
                channel_args: self.args.clone(),
                deadline,
            })
            .await;
        match result {
            Ok(result) => self.publish(result),
            Err(err) => self.connect_failed(err),
        }
    }

    fn connect_failed(self: &Arc<Self>, err: CoreError) {
        let notes = {
            let mut state = self.lock();
            state.connecting = false;
            if state.disconnected {
                return;
            }
            warn!(address = %self.address, error = %err, "Connect failed");
            let status = CoreError::wrap(codes::SUBCHANNEL_CONNECT_FAILED, "Connect Failed", err)
                .with_category(ErrorCategory::Unavailable);
            self.tracker
                .set(ConnectivityState::TransientFailure, Some(status), "connect_failed")
        };
        notes.deliver();
        self.maybe_start_connecting(false);
    }

    fn publish(self: &Arc<Self>, result: ConnectResult) {
        let ConnectResult {
            transport,
            channel_args,
        } = result;
        let connected = match ConnectedSubchannel::new(transport, channel_args) {
            Ok(connected) => connected,
            Err(err) => return self.connect_failed(err),
        };
        let (generation, notes) = {
            let mut state = self.lock();
            state.connecting = false;
            if state.disconnected {
                drop(state);
                debug!(address = %self.address, "dropping connection established after disconnect");
                return;
            }
            self.connected.store(Some(Arc::clone(&connected)));
            state.backoff_begun = false;
            state.backoff.reset();
            state.generation += 1;
            info!(address = %self.address, peer = %connected.transport().peer(), "Connected");
            let notes = self
                .tracker
                .set(ConnectivityState::Ready, None, "connected");
            (state.generation, notes)
        };
        notes.deliver();
        self.watch_transport(&connected, ConnectivityState::Ready, generation);
    }

    fn watch_transport(
        self: &Arc<Self>,
        connected: &ConnectedSubchannel,
        current: ConnectivityState,
        generation: u64,
    ) {
        let weak = Arc::downgrade(self);
        connected.notify_on_state_change(
            current,
            Box::new(move |state, error| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_transport_state(state, error, generation);
                }
            }),
        );
    }

    fn on_transport_state(
        self: &Arc<Self>,
        state: ConnectivityState,
        error: Option<CoreError>,
        generation: u64,
    ) {
        let lost = matches!(
            state,
            ConnectivityState::TransientFailure | ConnectivityState::Shutdown
        );
        let (connected, notes) = {
            let guard = self.lock();
            if guard.disconnected || guard.generation != generation {
                return;
            }
            if lost {
                let status = CoreError::new(codes::TRANSPORT_LOST, "Transport lost")
                    .with_category(ErrorCategory::Unavailable);
                let status = match error {
                    Some(cause) => status.with_cause(cause),
                    None => status,
                };
                warn!(address = %self.address, transport_state = %state, "Transport lost");
                (
                    self.connected.swap(None),
                    self.tracker.set(
                        ConnectivityState::TransientFailure,
                        Some(status),
                        "transport_lost",
                    ),
                )
            } else {
                (
                    self.connected.load_full(),
                    self.tracker.set(state, error, "transport_state"),
                )
            }
        };
        notes.deliver();
        if lost {
            drop(connected);
            self.maybe_start_connecting(false);
        } else if let Some(connected) = connected {
            self.watch_transport(&connected, state, generation);
        }
    }

    /// 为 `tx` 转发下一次状态变化，并在回调中重新登记自身。
    fn forward_states(
        this: &Arc<Self>,
        current: ConnectivityState,
        tx: mpsc::UnboundedSender<(ConnectivityState, Option<CoreError>)>,
    ) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let (_, immediate) = this.tracker.notify_on_state_change(
            current,
            Box::new(move |state, error| {
                if tx.send((state, error)).is_err() || state == ConnectivityState::Shutdown {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    SubchannelInner::forward_states(&inner, state, tx);
                }
            }),
        );
        this.maybe_start_connecting(true);
        immediate.deliver();
    }

    fn disconnect(self: &Arc<Self>) {
        let why = CoreError::new(codes::SUBCHANNEL_DISCONNECTED, "Subchannel disconnected")
            .with_category(ErrorCategory::Cancelled);
        let (connected, notes) = {
            let mut state = self.lock();
            assert!(
                !state.disconnected,
                "Subchannel disconnected twice: last strong ref released more than once"
            );
            state.disconnected = true;
            let notes = self.tracker.set(
                ConnectivityState::Shutdown,
                Some(why.clone()),
                "subchannel_disconnected",
            );
            (self.connected.swap(None), notes)
        };
        if let Some(registration) = self.registration.get() {
            registration.unregister(&WeakSubchannel {
                inner: Arc::clone(self),
            });
        }
        self.disconnect_signal.trigger(why.clone());
        self.connector.shutdown(why);
        drop(connected);
        info!(address = %self.address, "subchannel disconnected");
        notes.deliver();
    }
}

impl fmt::Debug for SubchannelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("address", &self.address)
            .field("state", &self.tracker.check())
            .field("strong", &self.strong.load(Ordering::Relaxed))
            .field("connected", &self.connected.load().is_some())
            .finish()
    }
}
