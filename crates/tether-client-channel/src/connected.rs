use crate::transport::{CallArgs, StreamOp, TransportRef, TransportStream};
use std::{fmt, sync::Arc};
use tether_core::{
    ChannelArgs, ConnectivityState, CoreError, StateCallback, WatcherId, codes,
};
use tracing::{debug, trace};

/// 已连接的子通道：持有一个就绪传输及其通道参数。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 子通道每次连接成功都得到一个新的 `ConnectedSubchannel`；
///   调用通过它在传输上开流，子通道通过它观察传输健康状态。
///
/// ## 契约（What）
/// - 构造时传输已经是 `SHUTDOWN` 则失败（[`codes::SUBCHANNEL_STACK_INIT_FAILED`]）；
/// - 最后一个引用释放时关闭传输；进行中的 [`SubchannelCall`] 持有引用，
///   因此调用结束前传输不会被关闭。
pub struct ConnectedSubchannel {
    transport: TransportRef,
    args: ChannelArgs,
}

impl ConnectedSubchannel {
    pub fn new(transport: TransportRef, args: ChannelArgs) -> Result<Arc<Self>, CoreError> {
        if transport.connectivity().check() == ConnectivityState::Shutdown {
            let err = CoreError::new(
                codes::SUBCHANNEL_STACK_INIT_FAILED,
                "transport shut down before the subchannel stack was built",
            );
            transport.shutdown(err.clone());
            return Err(err);
        }
        Ok(Arc::new(Self { transport, args }))
    }

    pub fn transport(&self) -> &TransportRef {
        &self.transport
    }

    pub fn channel_args(&self) -> &ChannelArgs {
        &self.args
    }

    /// 观察传输连通性；语义同 [`tether_core::ConnectivityStateTracker::notify_on_state_change`]。
    pub fn notify_on_state_change(
        &self,
        current: ConnectivityState,
        callback: StateCallback,
    ) -> Option<WatcherId> {
        let (id, immediate) = self
            .transport
            .connectivity()
            .notify_on_state_change(current, callback);
        immediate.deliver();
        id
    }

    pub fn cancel_watch(&self, id: WatcherId) {
        self.transport.connectivity().cancel_watch(id).deliver();
    }

    pub fn check_connectivity(&self) -> ConnectivityState {
        self.transport.connectivity().check()
    }

    pub async fn ping(&self) -> Result<(), CoreError> {
        self.transport.ping().await
    }

    /// 在传输上开一条流。
    pub fn create_call(self: &Arc<Self>, args: &CallArgs) -> Result<SubchannelCall, CoreError> {
        let stream = self.transport.init_stream(args)?;
        trace!(path = %args.path, peer = %self.transport.peer(), "subchannel call created");
        Ok(SubchannelCall {
            stream: Some(stream),
            connected: Arc::clone(self),
            cleanup: None,
        })
    }
}

impl Drop for ConnectedSubchannel {
    fn drop(&mut self) {
        debug!(peer = %self.transport.peer(), "releasing connected subchannel");
        self.transport.shutdown(CoreError::new(
            codes::SUBCHANNEL_DISCONNECTED,
            "Subchannel disconnected",
        ));
    }
}

impl fmt::Debug for ConnectedSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedSubchannel")
            .field("transport", &self.transport)
            .field("args", &self.args.len())
            .finish()
    }
}

type CleanupClosure = Box<dyn FnOnce() + Send + 'static>;

/// 子通道上的一次调用。
///
/// 析构顺序固定：先释放传输流，再运行清理闭包，最后释放对
/// [`ConnectedSubchannel`] 的引用。
pub struct SubchannelCall {
    stream: Option<Box<dyn TransportStream>>,
    connected: Arc<ConnectedSubchannel>,
    cleanup: Option<CleanupClosure>,
}

impl SubchannelCall {
    pub async fn process_op(&mut self, op: StreamOp) -> Result<(), CoreError> {
        match self.stream.as_mut() {
            Some(stream) => stream.process_op(op).await,
            None => Err(CoreError::new(codes::TRANSPORT_LOST, "call stream released")),
        }
    }

    pub fn peer(&self) -> String {
        self.stream
            .as_ref()
            .map(|stream| stream.peer())
            .unwrap_or_else(|| self.connected.transport.peer())
    }

    /// 登记调用销毁后运行的闭包；至多一次。
    pub fn set_cleanup_closure(&mut self, closure: impl FnOnce() + Send + 'static) {
        assert!(
            self.cleanup.is_none(),
            "subchannel call cleanup closure already set"
        );
        self.cleanup = Some(Box::new(closure));
    }

    pub fn connected_subchannel(&self) -> &Arc<ConnectedSubchannel> {
        &self.connected
    }
}

impl Drop for SubchannelCall {
    fn drop(&mut self) {
        drop(self.stream.take());
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl fmt::Debug for SubchannelCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubchannelCall")
            .field("peer", &self.peer())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}
