use crate::error::{CoreError, codes};
use std::{collections::BTreeMap, fmt, sync::Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// 连通性状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    pub const fn name(self) -> &'static str {
        match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 一次性状态回调：收到新状态与（可能的）错误。
pub type StateCallback = Box<dyn FnOnce(ConnectivityState, Option<CoreError>) + Send + 'static>;

/// 观察者句柄，用于撤销。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

/// 待投递的回调批次。
///
/// 追踪器只在锁内收集回调，由调用方在释放**所有**锁之后调用
/// [`deliver`](Self::deliver)，回调因此可以安全地重入追踪器或其宿主对象。
#[must_use = "回调必须在释放锁之后投递"]
#[derive(Default)]
pub struct Notifications {
    pending: Vec<(StateCallback, ConnectivityState, Option<CoreError>)>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, callback: StateCallback, state: ConnectivityState, error: Option<CoreError>) {
        self.pending.push((callback, state, error));
    }

    pub fn extend(&mut self, other: Notifications) {
        self.pending.extend(other.pending);
    }

    /// 依登记顺序逐个调用回调。
    pub fn deliver(self) {
        for (callback, state, error) in self.pending {
            callback(state, error);
        }
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("pending", &self.pending.len())
            .finish()
    }
}

struct TrackerInner {
    state: ConnectivityState,
    error: Option<CoreError>,
    watchers: BTreeMap<WatcherId, StateCallback>,
    next_id: u64,
}

/// 连通性状态追踪器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 子通道与传输都要向外发布“状态变化”，观察者只关心“下一次变化”；
///   追踪器把状态、最近错误与一次性观察者表放在同一把锁下。
///
/// ## 逻辑（How）
/// - 观察者存放在以 [`WatcherId`] 为键的 `BTreeMap` 中，撤销为 O(log n) 的删除；
/// - 状态变化时整表取出，回调打包成 [`Notifications`] 返回，锁外投递。
///
/// ## 契约（What）
/// - 状态相同的 `set` 不通知也不更新错误；
/// - `SHUTDOWN` 为终态，之后的 `set` 被忽略；
/// - 追踪器析构时，残余观察者收到 `SHUTDOWN`。
pub struct ConnectivityStateTracker {
    name: &'static str,
    inner: Mutex<TrackerInner>,
}

impl ConnectivityStateTracker {
    pub fn new(name: &'static str, initial: ConnectivityState) -> Self {
        Self {
            name,
            inner: Mutex::new(TrackerInner {
                state: initial,
                error: None,
                watchers: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn check(&self) -> ConnectivityState {
        self.lock().state
    }

    /// 当前状态与最近一次错误。
    pub fn state(&self) -> (ConnectivityState, Option<CoreError>) {
        let inner = self.lock();
        (inner.state, inner.error.clone())
    }

    pub fn has_watchers(&self) -> bool {
        !self.lock().watchers.is_empty()
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    /// 登记观察者：状态离开 `current` 时回调一次。
    ///
    /// 若当前状态已不同于 `current`，不登记，回调随返回的批次立即投递。
    pub fn notify_on_state_change(
        &self,
        current: ConnectivityState,
        callback: StateCallback,
    ) -> (Option<WatcherId>, Notifications) {
        let mut inner = self.lock();
        let mut batch = Notifications::new();
        if inner.state != current {
            batch.push(callback, inner.state, inner.error.clone());
            return (None, batch);
        }
        let id = WatcherId(inner.next_id);
        inner.next_id += 1;
        inner.watchers.insert(id, callback);
        (Some(id), batch)
    }

    /// 撤销观察者；回调以当前状态与 [`codes::WATCH_CANCELLED`] 错误投递。
    pub fn cancel_watch(&self, id: WatcherId) -> Notifications {
        let mut inner = self.lock();
        let mut batch = Notifications::new();
        if let Some(callback) = inner.watchers.remove(&id) {
            batch.push(
                callback,
                inner.state,
                Some(CoreError::new(codes::WATCH_CANCELLED, "Watch cancelled")),
            );
        }
        batch
    }

    /// 设置新状态并取出全部观察者。
    pub fn set(
        &self,
        state: ConnectivityState,
        error: Option<CoreError>,
        reason: &'static str,
    ) -> Notifications {
        let mut inner = self.lock();
        let mut batch = Notifications::new();
        if inner.state == state {
            return batch;
        }
        if inner.state == ConnectivityState::Shutdown {
            debug!(tracker = self.name, to = %state, reason, "ignoring transition out of SHUTDOWN");
            return batch;
        }
        debug!(tracker = self.name, from = %inner.state, to = %state, reason, "connectivity state change");
        inner.state = state;
        inner.error = error;
        let watchers = std::mem::take(&mut inner.watchers);
        for callback in watchers.into_values() {
            batch.push(callback, state, inner.error.clone());
        }
        batch
    }

    /// 等待状态离开 `current`。
    pub async fn wait_for_change(
        &self,
        current: ConnectivityState,
    ) -> (ConnectivityState, Option<CoreError>) {
        let (tx, rx) = oneshot::channel();
        let (_, immediate) = self.notify_on_state_change(
            current,
            Box::new(move |state, error| {
                let _ = tx.send((state, error));
            }),
        );
        immediate.deliver();
        rx.await.unwrap_or((ConnectivityState::Shutdown, None))
    }
}

impl fmt::Debug for ConnectivityStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectivityStateTracker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

impl Drop for ConnectivityStateTracker {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let watchers = std::mem::take(&mut inner.watchers);
        for callback in watchers.into_values() {
            callback(
                ConnectivityState::Shutdown,
                Some(CoreError::new(
                    codes::WATCH_CANCELLED,
                    "Shutdown connectivity tracker",
                )),
            );
        }
    }
}
