use crate::{
    handshaker::{Acceptor, FailHandshaker, Handshaker, HandshakerArgs, HandshakerRole},
    manager::HandshakeManager,
    registry::HandshakerFactory,
    secure_endpoint::{Protector, SecureEndpoint},
    tsi::{TsiError, TsiHandshaker, TsiHandshakerResult, TsiPeer},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};
use tether_core::{
    ChannelArgs, CoreError, EndpointRef, IntegerOptions, PointerArg, ShutdownSignal, SliceBuffer,
    codes, keys,
};
use tracing::{debug, warn};

/// 未配置 `grpc.max_frame_size` 时的帧上限。
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// 握手后得到的认证上下文。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthContext {
    properties: Vec<(String, Bytes)>,
    peer_identity_property: Option<String>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以对端属性填充。
    pub fn from_peer(peer: &TsiPeer) -> Self {
        Self {
            properties: peer
                .properties
                .iter()
                .map(|property| (property.name.clone(), property.value.clone()))
                .collect(),
            peer_identity_property: None,
        }
    }

    pub fn add_property(&mut self, name: &str, value: impl Into<Bytes>) {
        self.properties.push((name.to_owned(), value.into()));
    }

    pub fn find(&self, name: &str) -> impl Iterator<Item = &Bytes> {
        self.properties
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn set_peer_identity_property(&mut self, name: &str) {
        self.peer_identity_property = Some(name.to_owned());
    }

    /// 对端身份：`peer_identity_property` 指向的全部属性值。
    pub fn peer_identity(&self) -> Vec<&Bytes> {
        match &self.peer_identity_property {
            Some(name) => self.find(name).collect(),
            None => Vec::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.peer_identity().is_empty()
    }
}

/// 安全连接器：为某种安全机制创建 TSI 握手器并校验对端。
#[async_trait]
pub trait SecurityConnector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create_tsi_handshaker(
        &self,
        role: HandshakerRole,
        args: &ChannelArgs,
    ) -> Result<Arc<dyn TsiHandshaker>, CoreError>;

    /// 校验对端；成功返回认证上下文。
    async fn check_peer(&self, peer: TsiPeer) -> Result<AuthContext, CoreError>;
}

/// 把安全连接器放入通道参数。
pub fn security_connector_arg(connector: Arc<dyn SecurityConnector>) -> PointerArg {
    PointerArg::from_arc(connector)
}

/// 从通道参数取出安全连接器。
pub fn find_security_connector(args: &ChannelArgs) -> Option<Arc<dyn SecurityConnector>> {
    args.get_pointer::<Arc<dyn SecurityConnector>>(keys::SECURITY_CONNECTOR)
        .cloned()
}

/// 从通道参数取出认证上下文。
pub fn find_auth_context(args: &ChannelArgs) -> Option<&AuthContext> {
    args.get_pointer::<AuthContext>(keys::AUTH_CONTEXT)
}

fn max_frame_size(args: &ChannelArgs) -> Option<usize> {
    let value = args.get_int(
        keys::MAX_FRAME_SIZE,
        IntegerOptions::new(0, 0, i64::from(i32::MAX)),
    );
    (value > 0).then_some(value as usize)
}

struct SecurityState {
    shutdown: bool,
    endpoint: Option<EndpointRef>,
}

/// 基于 TSI 的安全握手器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把任意安全机制（TLS、ALTS、测试用 fake）统一成“TSI 往返 + 对端校验 + 帧保护”三步，
///   握手链无需了解具体协议。
///
/// ## 逻辑（How）
/// 1. 以 `read_buffer` 中已有字节作为首轮输入调用 `tsi.next`；
/// 2. 有待发字节则写出；`IncompleteData` 或尚未完成时读取更多字节（urgent 读）再次调用；
/// 3. 完成后提取对端并交给连接器 `check_peer`；
/// 4. 优先创建零拷贝保护器，不支持时退回帧保护器，以 TSI 报告的未用字节作为残留，
///    构造 [`SecureEndpoint`] 替换参数中的端点，清空 `read_buffer`，写入认证上下文。
///
/// ## 契约（What）
/// - 任一步失败：关闭 TSI 握手器与端点，返回错误；
/// - `shutdown` 幂等：首次调用关闭 TSI 握手器与端点，挂起的 IO 与对端校验立即失败。
pub struct SecurityHandshaker {
    tsi: Arc<dyn TsiHandshaker>,
    connector: Arc<dyn SecurityConnector>,
    state: Mutex<SecurityState>,
    signal: ShutdownSignal,
}

impl SecurityHandshaker {
    pub fn new(tsi: Arc<dyn TsiHandshaker>, connector: Arc<dyn SecurityConnector>) -> Arc<Self> {
        Arc::new(Self {
            tsi,
            connector,
            state: Mutex::new(SecurityState {
                shutdown: false,
                endpoint: None,
            }),
            signal: ShutdownSignal::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SecurityState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shutdown_error(&self) -> CoreError {
        match self.signal.reason() {
            Some(why) => CoreError::wrap(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown", why),
            None => CoreError::new(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown"),
        }
    }

    async fn guarded<T, E: Into<CoreError>>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, CoreError> {
        tokio::select! {
            biased;
            _ = self.signal.triggered() => Err(self.shutdown_error()),
            result = fut => result.map_err(Into::into),
        }
    }

    async fn read_more(&self, endpoint: &EndpointRef) -> Result<Bytes, CoreError> {
        let mut incoming = SliceBuffer::new();
        self.guarded(endpoint.read(&mut incoming, true)).await?;
        Ok(incoming.to_bytes())
    }

    /// TSI 往返直到握手完成。
    async fn negotiate(
        &self,
        endpoint: &EndpointRef,
        first: Bytes,
    ) -> Result<Box<dyn TsiHandshakerResult>, CoreError> {
        let mut received = first;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.signal.triggered() => return Err(self.shutdown_error()),
                next = self.tsi.next(received) => next,
            };
            let output = match next {
                Ok(output) => output,
                Err(TsiError::IncompleteData) => {
                    received = self.read_more(endpoint).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if !output.bytes_to_send.is_empty() {
                self.guarded(endpoint.write(SliceBuffer::from(output.bytes_to_send)))
                    .await?;
            }
            match output.result {
                Some(result) => return Ok(result),
                None => received = self.read_more(endpoint).await?,
            }
        }
    }

    async fn finish(
        &self,
        mut args: HandshakerArgs,
        result: Box<dyn TsiHandshakerResult>,
    ) -> Result<HandshakerArgs, (HandshakerArgs, CoreError)> {
        let peer = match result.extract_peer() {
            Ok(peer) => peer,
            Err(err) => return Err((args, CoreError::from(err))),
        };
        let auth = match self.guarded(self.connector.check_peer(peer)).await {
            Ok(auth) => auth,
            Err(err) => return Err((args, err)),
        };

        let max_frame = max_frame_size(&args.args);
        let protector = match result.create_zero_copy_protector(max_frame) {
            Ok(zero_copy) => Protector::ZeroCopy(zero_copy),
            Err(TsiError::Unimplemented) => match result.create_frame_protector(max_frame) {
                Ok(frame) => Protector::Frame(frame),
                Err(err) => return Err((args, CoreError::from(err))),
            },
            Err(err) => return Err((args, CoreError::from(err))),
        };

        if self.lock().shutdown {
            let err = self.shutdown_error();
            return Err((args, err));
        }

        let leftover = SliceBuffer::from(result.unused_bytes());
        debug!(peer = %args.endpoint.peer(), leftover = leftover.len(), zero_copy = protector.is_zero_copy(), "security handshake complete");
        let secure = SecureEndpoint::new(
            args.endpoint.clone(),
            protector,
            leftover,
            max_frame.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
        );
        args.endpoint = Arc::new(secure);
        args.read_buffer.clear();
        args.args = args
            .args
            .with_pointer(keys::AUTH_CONTEXT, PointerArg::new(auth));
        Ok(args)
    }

    /// 失败路径：首次失败时关闭 TSI 与端点。
    fn fail(&self, args: HandshakerArgs, err: CoreError) -> CoreError {
        let first = {
            let mut state = self.lock();
            let first = !state.shutdown;
            state.shutdown = true;
            state.endpoint = None;
            first
        };
        if first {
            self.tsi.shutdown();
            args.endpoint.shutdown(err.clone());
        }
        err
    }
}

#[async_trait]
impl Handshaker for SecurityHandshaker {
    fn name(&self) -> &'static str {
        "security"
    }

    async fn do_handshake(
        self: Arc<Self>,
        _acceptor: Option<Acceptor>,
        mut args: HandshakerArgs,
    ) -> Result<HandshakerArgs, CoreError> {
        {
            let mut state = self.lock();
            if state.shutdown {
                drop(state);
                return Err(args.abandon(self.shutdown_error()));
            }
            state.endpoint = Some(args.endpoint.clone());
        }

        let first = args.read_buffer.take().to_bytes();
        let endpoint = args.endpoint.clone();
        let result = match self.negotiate(&endpoint, first).await {
            Ok(result) => result,
            Err(err) => {
                warn!(peer = %endpoint.peer(), error = %err, "security handshake failed");
                return Err(self.fail(args, err));
            }
        };
        match self.finish(args, result).await {
            Ok(args) => {
                let mut state = self.lock();
                state.shutdown = true;
                state.endpoint = None;
                drop(state);
                Ok(args)
            }
            Err((args, err)) => {
                warn!(peer = %endpoint.peer(), error = %err, "security handshake rejected");
                Err(self.fail(args, err))
            }
        }
    }

    fn shutdown(&self, why: CoreError) {
        let endpoint = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.endpoint.take()
        };
        self.signal.trigger(why.clone());
        self.tsi.shutdown();
        if let Some(endpoint) = endpoint {
            endpoint.shutdown(why);
        }
    }
}

/// 通道参数携带安全连接器时追加 [`SecurityHandshaker`]。
///
/// 连接器创建 TSI 握手器失败时追加 [`FailHandshaker`]，连接以明确错误结束。
#[derive(Debug)]
pub struct SecurityHandshakerFactory {
    role: HandshakerRole,
}

impl SecurityHandshakerFactory {
    pub fn new(role: HandshakerRole) -> Self {
        Self { role }
    }
}

impl HandshakerFactory for SecurityHandshakerFactory {
    fn name(&self) -> &'static str {
        "security"
    }

    fn add_handshakers(&self, args: &ChannelArgs, manager: &HandshakeManager) {
        let Some(connector) = find_security_connector(args) else {
            return;
        };
        match connector.create_tsi_handshaker(self.role, args) {
            Ok(tsi) => manager.add(SecurityHandshaker::new(tsi, connector)),
            Err(err) => {
                warn!(connector = connector.name(), error = %err, "Failed to create security handshaker");
                manager.add(FailHandshaker::with_reason(CoreError::wrap(
                    codes::HANDSHAKE_FAILED,
                    "Failed to create security handshaker",
                    err,
                )));
            }
        }
    }
}
