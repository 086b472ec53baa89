use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, sync::Arc};
use tether_core::{ChannelArgs, CoreError, EndpointRef, SliceBuffer, codes};
use tokio::time::Instant;

/// 握手发起方角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandshakerRole {
    Client,
    Server,
}

/// 服务端接入时携带的上下文。
#[derive(Clone, Debug, Default)]
pub struct Acceptor {
    /// 监听器在判定协议时已经读出的字节。
    pub pending_data: Option<Bytes>,
    /// 监听器名称，仅用于日志。
    pub listener: Option<String>,
}

/// 沿握手链传递的可变状态。
///
/// # 契约（What）
/// - 每个握手器“取得”参数、完成后原样或替换后“交还”；失败时由失败的握手器负责关闭端点；
/// - `read_buffer` 存放已从端点读出但尚未被消费的字节，下一个握手器必须先消费它；
/// - `exit_early` 置位后，管理器跳过剩余握手器直接成功返回。
pub struct HandshakerArgs {
    pub endpoint: EndpointRef,
    pub read_buffer: SliceBuffer,
    pub args: ChannelArgs,
    pub exit_early: bool,
    pub deadline: Instant,
}

impl HandshakerArgs {
    pub fn new(endpoint: EndpointRef, args: ChannelArgs, deadline: Instant) -> Self {
        Self {
            endpoint,
            read_buffer: SliceBuffer::new(),
            args,
            exit_early: false,
            deadline,
        }
    }

    /// 关闭端点并丢弃全部状态，返回 `why` 以便直接作为错误传播。
    pub fn abandon(self, why: CoreError) -> CoreError {
        self.endpoint.shutdown(why.clone());
        why
    }
}

impl fmt::Debug for HandshakerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakerArgs")
            .field("peer", &self.endpoint.peer())
            .field("read_buffer", &self.read_buffer.len())
            .field("args", &self.args)
            .field("exit_early", &self.exit_early)
            .finish()
    }
}

/// 握手链中的一个阶段。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 代理隧道、安全协商等阶段都要“接过端点，做若干往返，再把（可能替换过的）端点交出去”；
///   统一成一个 trait 后，管理器只负责按序驱动。
///
/// ## 契约（What）
/// - `do_handshake`：每个实例至多调用一次；成功返回交还的参数，失败时已自行关闭端点；
/// - `shutdown`：可在任意时刻、任意线程调用，幂等；挂起的 `do_handshake` 须尽快以错误返回。
#[async_trait]
pub trait Handshaker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn do_handshake(
        self: Arc<Self>,
        acceptor: Option<Acceptor>,
        args: HandshakerArgs,
    ) -> Result<HandshakerArgs, CoreError>;

    fn shutdown(&self, why: CoreError);
}

/// 始终失败的握手器。
///
/// 安全握手器构造失败时以它占位，让连接尝试以明确的错误结束。
#[derive(Debug)]
pub struct FailHandshaker {
    reason: CoreError,
}

impl FailHandshaker {
    pub fn new() -> Arc<Self> {
        Self::with_reason(CoreError::new(codes::HANDSHAKE_FAILED, "Failed handshake"))
    }

    pub fn with_reason(reason: CoreError) -> Arc<Self> {
        Arc::new(Self { reason })
    }
}

#[async_trait]
impl Handshaker for FailHandshaker {
    fn name(&self) -> &'static str {
        "fail"
    }

    async fn do_handshake(
        self: Arc<Self>,
        _acceptor: Option<Acceptor>,
        args: HandshakerArgs,
    ) -> Result<HandshakerArgs, CoreError> {
        Err(args.abandon(self.reason.clone()))
    }

    fn shutdown(&self, _why: CoreError) {}
}
