use crate::{
    args::ChannelArgs,
    buffer::SliceBuffer,
    error::{CoreError, codes},
};
use async_trait::async_trait;
use std::{
    pin::pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::Notify, time::Instant};

/// 双向字节流端点。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 握手器逐层替换端点（原始 TCP → 代理隧道 → 加密端点），
///   每一层都只依赖这一抽象，不关心下层具体实现。
///
/// ## 契约（What）
/// - `read`：清空 `slices` 后填入至少一个字节；对端关闭返回 [`codes::ENDPOINT_CLOSED`]；
///   同一端点同时至多一个读；
/// - `write`：写完整个 `slices` 才返回；同时至多一个写；
/// - `shutdown`：幂等；此后挂起与新发起的读写都以 `why` 失败；
/// - `peer`：对端地址的字符串形式，在端点生命周期内不变。
///
/// ## 风险（Trade-offs）
/// - `urgent` 只是调度提示，实现可以忽略。
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    async fn read(&self, slices: &mut SliceBuffer, urgent: bool) -> Result<(), CoreError>;

    async fn write(&self, slices: SliceBuffer) -> Result<(), CoreError>;

    fn shutdown(&self, why: CoreError);

    fn peer(&self) -> String;

    fn local_address(&self) -> String {
        String::new()
    }
}

/// 共享端点句柄。
pub type EndpointRef = Arc<dyn Endpoint>;

/// 拨号器：把地址变成端点。
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(
        &self,
        address: &str,
        args: &ChannelArgs,
        deadline: Instant,
    ) -> Result<EndpointRef, CoreError>;
}

/// 一次性关闭信号。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 端点、握手器与连接器都需要“关闭后让挂起的异步操作立即失败”；
///   该类型在 `AtomicBool` 之外叠加 `Notify`，让等待方可以 `select!`。
///
/// ## 逻辑（How）
/// - [`trigger`](Self::trigger) 只在首次调用时记录原因并唤醒全部等待者；
/// - [`triggered`](Self::triggered) 先登记唤醒再检查标志，不会漏掉并发触发。
///
/// ## 契约（What）
/// - 克隆共享同一状态；
/// - 触发不可逆。
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    flag: AtomicBool,
    reason: Mutex<Option<CoreError>>,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发信号；返回是否为首次触发。
    pub fn trigger(&self, why: CoreError) -> bool {
        {
            let mut reason = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if reason.is_some() {
                return false;
            }
            *reason = Some(why);
        }
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 触发原因。
    pub fn reason(&self) -> Option<CoreError> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 等待信号触发并返回原因。
    pub async fn triggered(&self) -> CoreError {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

/// 以关闭原因构造端点错误。
pub fn shutdown_error(reason: Option<CoreError>) -> CoreError {
    match reason {
        Some(why) => CoreError::wrap(codes::ENDPOINT_SHUTDOWN, "Endpoint shutdown", why),
        None => CoreError::new(codes::ENDPOINT_SHUTDOWN, "Endpoint shutdown"),
    }
}

/// 内存端点，供本 crate 与下游 crate 的测试使用。
pub mod testing {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::{Mutex as AsyncMutex, mpsc};

    struct ReadSide {
        rx: mpsc::UnboundedReceiver<Bytes>,
        pending: SliceBuffer,
    }

    /// 基于无界通道的内存端点。
    ///
    /// - 写入的每个切片原样投递给对端；
    /// - `read_chunk` 限制单次读取返回的字节数，用于模拟分片到达；
    /// - `shutdown` 会丢弃发送端，对端随后读到 EOF。
    pub struct MemoryEndpoint {
        peer: String,
        local: String,
        tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
        read: AsyncMutex<ReadSide>,
        read_chunk: usize,
        signal: ShutdownSignal,
    }

    impl MemoryEndpoint {
        /// 创建一对互联端点；`a` 的 `peer()` 为 `b_name`，反之亦然。
        pub fn pair(a_name: &str, b_name: &str) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
            Self::pair_with_chunk(a_name, b_name, usize::MAX)
        }

        /// 同 [`pair`](Self::pair)，但每次读取至多返回 `read_chunk` 字节。
        pub fn pair_with_chunk(
            a_name: &str,
            b_name: &str,
            read_chunk: usize,
        ) -> (Arc<MemoryEndpoint>, Arc<MemoryEndpoint>) {
            let (a_tx, b_rx) = mpsc::unbounded_channel();
            let (b_tx, a_rx) = mpsc::unbounded_channel();
            let a = Arc::new(MemoryEndpoint::new(a_name, b_name, a_tx, a_rx, read_chunk));
            let b = Arc::new(MemoryEndpoint::new(b_name, a_name, b_tx, b_rx, read_chunk));
            (a, b)
        }

        fn new(
            local: &str,
            peer: &str,
            tx: mpsc::UnboundedSender<Bytes>,
            rx: mpsc::UnboundedReceiver<Bytes>,
            read_chunk: usize,
        ) -> Self {
            Self {
                peer: peer.to_owned(),
                local: local.to_owned(),
                tx: Mutex::new(Some(tx)),
                read: AsyncMutex::new(ReadSide {
                    rx,
                    pending: SliceBuffer::new(),
                }),
                read_chunk: read_chunk.max(1),
                signal: ShutdownSignal::new(),
            }
        }

        pub fn is_shutdown(&self) -> bool {
            self.signal.is_triggered()
        }
    }

    #[async_trait]
    impl Endpoint for MemoryEndpoint {
        async fn read(&self, slices: &mut SliceBuffer, _urgent: bool) -> Result<(), CoreError> {
            slices.clear();
            if self.signal.is_triggered() {
                return Err(shutdown_error(self.signal.reason()));
            }
            let mut side = self.read.lock().await;
            if side.pending.is_empty() {
                let received = tokio::select! {
                    biased;
                    why = self.signal.triggered() => return Err(shutdown_error(Some(why))),
                    received = side.rx.recv() => received,
                };
                match received {
                    Some(bytes) => side.pending.push(bytes),
                    None => {
                        return Err(CoreError::new(codes::ENDPOINT_CLOSED, "Endpoint closed"));
                    }
                }
            }
            let take = side.pending.len().min(self.read_chunk);
            side.pending.move_first(take, slices);
            Ok(())
        }

        async fn write(&self, slices: SliceBuffer) -> Result<(), CoreError> {
            if self.signal.is_triggered() {
                return Err(shutdown_error(self.signal.reason()));
            }
            let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(tx) = guard.as_ref() else {
                return Err(shutdown_error(self.signal.reason()));
            };
            for slice in slices {
                tx.send(slice).map_err(|_| {
                    CoreError::new(codes::ENDPOINT_WRITE_FAILED, "peer endpoint dropped")
                })?;
            }
            Ok(())
        }

        fn shutdown(&self, why: CoreError) {
            if self.signal.trigger(why) {
                self.tx
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
            }
        }

        fn peer(&self) -> String {
            self.peer.clone()
        }

        fn local_address(&self) -> String {
            self.local.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryEndpoint;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters_once() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        tokio::task::yield_now().await;
        assert!(signal.trigger(CoreError::new(codes::HANDSHAKE_SHUTDOWN, "first")));
        assert!(!signal.trigger(CoreError::new(codes::HANDSHAKE_SHUTDOWN, "second")));
        let why = waiter.await.expect("waiter task");
        assert_eq!(why.message(), "first");
    }

    #[tokio::test]
    async fn memory_pair_delivers_in_order_and_respects_chunking() {
        let (a, b) = MemoryEndpoint::pair_with_chunk("a", "b", 3);
        a.write(SliceBuffer::from(&b"hello"[..])).await.expect("write");

        let mut buf = SliceBuffer::new();
        b.read(&mut buf, false).await.expect("read 1");
        assert_eq!(buf.to_vec(), b"hel");
        b.read(&mut buf, false).await.expect("read 2");
        assert_eq!(buf.to_vec(), b"lo");
        assert_eq!(a.peer(), "b");
    }

    #[tokio::test]
    async fn shutdown_fails_pending_read_and_peer_sees_eof() {
        let (a, b) = MemoryEndpoint::pair("a", "b");
        let reader = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = SliceBuffer::new();
                a.read(&mut buf, false).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.shutdown(CoreError::new(codes::HANDSHAKE_SHUTDOWN, "bye"));

        let err = reader.await.expect("join").expect_err("pending read must fail");
        assert_eq!(err.code(), codes::ENDPOINT_SHUTDOWN);

        let mut buf = SliceBuffer::new();
        let eof = b.read(&mut buf, false).await.expect_err("peer sees EOF");
        assert_eq!(eof.code(), codes::ENDPOINT_CLOSED);
    }
}
