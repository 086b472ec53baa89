//! 传输层契约。
//!
//! 连接器在握手完成后把端点交给 [`TransportFactory`]，得到一个 [`Transport`]；
//! 子通道只通过连通性追踪器观察它，调用只通过 [`TransportStream`] 使用它。
//! HTTP/2 分帧、流控等细节都在实现内部。

use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tether_core::{
    ChannelArgs, ConnectivityStateTracker, CoreError, EndpointRef, SliceBuffer,
};
use tokio::time::Instant;

/// 单次调用的参数。
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    /// 方法路径，例如 `/pkg.Service/Method`。
    pub path: String,
    pub deadline: Option<Instant>,
}

/// 调用对传输流下发的操作。
#[derive(Debug)]
pub enum StreamOp {
    SendMessage(SliceBuffer),
    SendClose,
    Cancel(CoreError),
}

/// 传输上的一条流，生命周期等于一次调用尝试。
#[async_trait]
pub trait TransportStream: Send + 'static {
    async fn process_op(&mut self, op: StreamOp) -> Result<(), CoreError>;

    fn peer(&self) -> String;
}

/// 已建立连接上的传输。
///
/// # 契约（What）
/// - `start_reading` 在构造后恰好调用一次，`leftover` 为握手阶段多读出的字节；
/// - `connectivity` 反映传输自身的健康状态；连接断开时转入
///   `TRANSIENT_FAILURE` 或 `SHUTDOWN`；
/// - `shutdown` 幂等。
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn peer(&self) -> String;

    fn start_reading(&self, leftover: SliceBuffer);

    fn connectivity(&self) -> &ConnectivityStateTracker;

    fn init_stream(&self, args: &CallArgs) -> Result<Box<dyn TransportStream>, CoreError>;

    /// 发送 ping，对端确认后返回。
    async fn ping(&self) -> Result<(), CoreError>;

    fn shutdown(&self, why: CoreError);
}

pub type TransportRef = Arc<dyn Transport>;

/// 由握手后的端点构造传输。
pub trait TransportFactory: Send + Sync + 'static {
    fn create_transport(
        &self,
        endpoint: EndpointRef,
        args: &ChannelArgs,
    ) -> Result<TransportRef, CoreError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name())
            .field("peer", &self.peer())
            .finish()
    }
}

/// 直接在端点上收发字节的传输，供测试与演示使用。
pub mod testing {
    use super::*;
    use std::sync::Mutex;
    use tether_core::{ConnectivityState, Endpoint, codes};
    use tokio::{sync::Notify, task::JoinHandle};
    use tracing::debug;

    struct Shared {
        endpoint: EndpointRef,
        tracker: ConnectivityStateTracker,
        received: Mutex<SliceBuffer>,
        arrived: Notify,
    }

    /// 把端点读到的字节累积在内存中；读失败时转入 `TRANSIENT_FAILURE`。
    pub struct EndpointTransport {
        shared: Arc<Shared>,
        reader: Mutex<Option<JoinHandle<()>>>,
    }

    impl EndpointTransport {
        pub fn new(endpoint: EndpointRef) -> Arc<Self> {
            Arc::new(Self {
                shared: Arc::new(Shared {
                    endpoint,
                    tracker: ConnectivityStateTracker::new("endpoint_transport", ConnectivityState::Ready),
                    received: Mutex::new(SliceBuffer::new()),
                    arrived: Notify::new(),
                }),
                reader: Mutex::new(None),
            })
        }

        /// 至今收到的全部字节。
        pub fn received(&self) -> Vec<u8> {
            self.shared
                .received
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .to_vec()
        }

        /// 等待累计收到至少 `len` 个字节。
        pub async fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
            loop {
                let notified = self.shared.arrived.notified();
                let received = self.received();
                if received.len() >= len {
                    return received;
                }
                notified.await;
            }
        }

        pub fn endpoint(&self) -> &EndpointRef {
            &self.shared.endpoint
        }
    }

    impl Shared {
        fn absorb(&self, mut slices: SliceBuffer) {
            self.received
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .append(&mut slices);
            self.arrived.notify_waiters();
        }

        async fn read_loop(self: Arc<Self>) {
            let mut slices = SliceBuffer::new();
            loop {
                if let Err(err) = self.endpoint.read(&mut slices, false).await {
                    debug!(peer = %self.endpoint.peer(), error = %err, "endpoint transport read failed");
                    self.tracker
                        .set(ConnectivityState::TransientFailure, Some(err), "read_failed")
                        .deliver();
                    return;
                }
                self.absorb(slices.take());
            }
        }
    }

    #[async_trait]
    impl Transport for EndpointTransport {
        fn name(&self) -> &'static str {
            "endpoint"
        }

        fn peer(&self) -> String {
            self.shared.endpoint.peer()
        }

        fn start_reading(&self, leftover: SliceBuffer) {
            if !leftover.is_empty() {
                self.shared.absorb(leftover);
            }
            let handle = tokio::spawn(Arc::clone(&self.shared).read_loop());
            let mut reader = self
                .reader
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            assert!(reader.is_none(), "start_reading may only be called once");
            *reader = Some(handle);
        }

        fn connectivity(&self) -> &ConnectivityStateTracker {
            &self.shared.tracker
        }

        fn init_stream(&self, _args: &CallArgs) -> Result<Box<dyn TransportStream>, CoreError> {
            match self.shared.tracker.check() {
                ConnectivityState::Ready => Ok(Box::new(EndpointStream {
                    endpoint: Arc::clone(&self.shared.endpoint),
                })),
                state => Err(CoreError::new(
                    codes::TRANSPORT_LOST,
                    format!("transport is {state}"),
                )),
            }
        }

        async fn ping(&self) -> Result<(), CoreError> {
            match self.shared.tracker.state() {
                (ConnectivityState::Ready, _) => Ok(()),
                (state, error) => {
                    let err = CoreError::new(codes::TRANSPORT_LOST, format!("ping on {state} transport"));
                    Err(match error {
                        Some(cause) => err.with_cause(cause),
                        None => err,
                    })
                }
            }
        }

        fn shutdown(&self, why: CoreError) {
            if let Some(reader) = self
                .reader
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                reader.abort();
            }
            self.shared.endpoint.shutdown(why.clone());
            self.shared
                .tracker
                .set(ConnectivityState::Shutdown, Some(why), "transport_shutdown")
                .deliver();
        }
    }

    impl Drop for EndpointTransport {
        fn drop(&mut self) {
            if let Some(reader) = self
                .reader
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                reader.abort();
            }
        }
    }

    struct EndpointStream {
        endpoint: EndpointRef,
    }

    #[async_trait]
    impl TransportStream for EndpointStream {
        async fn process_op(&mut self, op: StreamOp) -> Result<(), CoreError> {
            match op {
                StreamOp::SendMessage(message) => self.endpoint.write(message).await,
                StreamOp::SendClose => Ok(()),
                StreamOp::Cancel(why) => {
                    debug!(peer = %self.endpoint.peer(), reason = %why, "stream cancelled");
                    Ok(())
                }
            }
        }

        fn peer(&self) -> String {
            self.endpoint.peer()
        }
    }

    /// 为每个端点创建一个 [`EndpointTransport`]。
    #[derive(Debug, Default)]
    pub struct EndpointTransportFactory;

    impl TransportFactory for EndpointTransportFactory {
        fn create_transport(
            &self,
            endpoint: EndpointRef,
            _args: &ChannelArgs,
        ) -> Result<TransportRef, CoreError> {
            Ok(EndpointTransport::new(endpoint))
        }
    }
}
