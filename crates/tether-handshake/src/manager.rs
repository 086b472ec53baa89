use crate::handshaker::{Acceptor, Handshaker, HandshakerArgs};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};
use tether_core::{ChannelArgs, CoreError, EndpointRef, ErrorCategory, codes};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

struct ManagerState {
    handshakers: Vec<Arc<dyn Handshaker>>,
    /// 下一个要启动的握手器下标；`index - 1` 即当前（或最近完成的）握手器。
    index: usize,
    started: bool,
    shutdown: Option<CoreError>,
}

/// 按序驱动握手器的管理器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 连接器拿到原始端点后，需要依次跑完代理握手、安全握手等阶段；
///   管理器负责顺序推进、截止时间与外部关闭。
///
/// ## 逻辑（How）
/// - 一把互斥锁保护“握手器列表 / 下标 / 关闭标记”；
///   每推进一步都在锁内取出下一个握手器、在锁外执行它；
/// - 截止时间由一个持有管理器 `Arc` 的定时任务实现：到期时调用
///   [`shutdown`](Self::shutdown)，链路完成时定时任务被中止；
/// - `shutdown` 只转发给当前握手器（`index - 1`），且只转发一次。
///
/// ## 契约（What）
/// - `add` 只能在 `do_handshake` 之前调用；
/// - `do_handshake` 每个管理器只能调用一次；
/// - 成功时返回最后一个握手器交还的参数；任何失败、超时或关闭都以错误返回，
///   端点已被关闭。
///
/// ## 风险（Trade-offs）
/// - 关闭标记在握手器成功返回之后才被观察到时，端点由管理器负责关闭，
///   成功结果被丢弃。
pub struct HandshakeManager {
    state: Mutex<ManagerState>,
}

impl HandshakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                handshakers: Vec::new(),
                index: 0,
                started: false,
                shutdown: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 追加握手器。
    ///
    /// # Panics
    /// 握手已经开始时 panic。
    pub fn add(&self, handshaker: Arc<dyn Handshaker>) {
        let mut state = self.lock();
        assert!(!state.started, "handshakers must be added before do_handshake");
        debug!(handshaker = handshaker.name(), position = state.handshakers.len(), "handshaker added");
        state.handshakers.push(handshaker);
    }

    pub fn len(&self) -> usize {
        self.lock().handshakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已登记握手器的名称，按执行顺序排列。
    pub fn handshaker_names(&self) -> Vec<&'static str> {
        self.lock().handshakers.iter().map(|h| h.name()).collect()
    }

    /// 关闭管理器。
    ///
    /// 首次调用时记录原因并转发给当前握手器；此后的调用无效。
    pub fn shutdown(&self, why: CoreError) {
        let current = {
            let mut state = self.lock();
            if state.shutdown.is_some() {
                return;
            }
            state.shutdown = Some(why.clone());
            state
                .index
                .checked_sub(1)
                .and_then(|i| state.handshakers.get(i).cloned())
        };
        if let Some(handshaker) = current {
            debug!(handshaker = handshaker.name(), reason = %why, "forwarding shutdown to handshaker");
            handshaker.shutdown(why);
        }
    }

    /// 执行握手链。
    ///
    /// # Panics
    /// 同一管理器第二次调用时 panic。
    pub async fn do_handshake(
        self: &Arc<Self>,
        endpoint: EndpointRef,
        channel_args: &ChannelArgs,
        deadline: Instant,
        acceptor: Option<Acceptor>,
    ) -> Result<HandshakerArgs, CoreError> {
        {
            let mut state = self.lock();
            assert!(!state.started, "do_handshake may only be called once");
            state.started = true;
        }
        let mut args = HandshakerArgs::new(endpoint, channel_args.clone(), deadline);
        if let Some(pending) = acceptor.as_ref().and_then(|a| a.pending_data.clone()) {
            args.read_buffer.push(pending);
        }
        let _timer = DeadlineTimer::arm(Arc::clone(self), deadline);
        self.run_chain(args, acceptor).await
    }

    /// 与 [`do_handshake`](Self::do_handshake) 相同，但在后台任务中执行，结果交给 `on_done`。
    pub fn spawn_handshake<F>(
        self: &Arc<Self>,
        endpoint: EndpointRef,
        channel_args: ChannelArgs,
        deadline: Instant,
        acceptor: Option<Acceptor>,
        on_done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<HandshakerArgs, CoreError>) + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager
                .do_handshake(endpoint, &channel_args, deadline, acceptor)
                .await;
            on_done(result);
        })
    }

    async fn run_chain(
        &self,
        mut args: HandshakerArgs,
        acceptor: Option<Acceptor>,
    ) -> Result<HandshakerArgs, CoreError> {
        loop {
            let next = {
                let mut state = self.lock();
                if let Some(why) = state.shutdown.clone() {
                    Err(why)
                } else if args.exit_early || state.index == state.handshakers.len() {
                    Ok(None)
                } else {
                    let handshaker = Arc::clone(&state.handshakers[state.index]);
                    state.index += 1;
                    Ok(Some((state.index - 1, handshaker)))
                }
            };
            match next {
                Err(why) => {
                    let err = shutdown_error(why);
                    warn!(error = %err, "handshake manager shut down between handshakers");
                    return Err(args.abandon(err));
                }
                Ok(None) => {
                    debug!(peer = %args.endpoint.peer(), exit_early = args.exit_early, "handshake chain complete");
                    return Ok(args);
                }
                Ok(Some((index, handshaker))) => {
                    debug!(handshaker = handshaker.name(), index, "starting handshaker");
                    args = handshaker.do_handshake(acceptor.clone(), args).await?;
                }
            }
        }
    }
}

fn shutdown_error(why: CoreError) -> CoreError {
    if why.code() == codes::HANDSHAKE_SHUTDOWN || why.code() == codes::HANDSHAKE_TIMEOUT {
        why
    } else {
        CoreError::wrap(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown", why)
    }
}

impl fmt::Debug for HandshakeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("HandshakeManager")
            .field("handshakers", &state.handshakers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("index", &state.index)
            .field("shutdown", &state.shutdown.is_some())
            .finish()
    }
}

/// 握手截止定时器；析构时中止。
struct DeadlineTimer(JoinHandle<()>);

impl DeadlineTimer {
    fn arm(manager: Arc<HandshakeManager>, deadline: Instant) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("handshake deadline reached");
            manager.shutdown(
                CoreError::new(codes::HANDSHAKE_TIMEOUT, "Handshake timed out")
                    .with_category(ErrorCategory::Timeout),
            );
        }))
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}
