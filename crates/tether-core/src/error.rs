use std::{borrow::Cow, error::Error, fmt, sync::Arc, time::Duration};

/// 错误链路中附带的底层原因。
///
/// 使用 `Arc` 而非 `Box`：同一个错误常需同时交给多个连通性观察者，
/// 共享底层原因可让 [`CoreError`] 廉价地 `Clone`。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// 稳定错误码集合。
///
/// 命名遵循 `<域>.<语义>`；日志与测试只对码值做匹配，消息文本可随时调整。
pub mod codes {
    /// 端点已被显式关闭，后续读写全部失败。
    pub const ENDPOINT_SHUTDOWN: &str = "tether.endpoint.shutdown";
    /// 对端关闭连接（读到 EOF）。
    pub const ENDPOINT_CLOSED: &str = "tether.endpoint.closed";
    /// 端点读操作失败。
    pub const ENDPOINT_READ_FAILED: &str = "tether.endpoint.read_failed";
    /// 端点写操作失败。
    pub const ENDPOINT_WRITE_FAILED: &str = "tether.endpoint.write_failed";
    /// 拨号阶段失败（地址非法、拒绝连接、超时等）。
    pub const TRANSPORT_CONNECT_FAILED: &str = "tether.transport.connect_failed";
    /// 监听或接入阶段失败。
    pub const TRANSPORT_ACCEPT_FAILED: &str = "tether.transport.accept_failed";
    /// 握手管理器或某个握手器被关闭。
    pub const HANDSHAKE_SHUTDOWN: &str = "tether.handshake.shutdown";
    /// 握手整体超过截止时间。
    pub const HANDSHAKE_TIMEOUT: &str = "tether.handshake.timeout";
    /// 握手器构造失败时占位的失败握手器。
    pub const HANDSHAKE_FAILED: &str = "tether.handshake.failed";
    /// HTTP CONNECT 代理返回非 2xx 状态。
    pub const HTTP_CONNECT_REJECTED: &str = "tether.handshake.http_connect.rejected";
    /// HTTP CONNECT 响应无法解析。
    pub const HTTP_CONNECT_MALFORMED: &str = "tether.handshake.http_connect.malformed";
    /// 安全握手（TSI）失败。
    pub const SECURITY_HANDSHAKE_FAILED: &str = "tether.handshake.security.failed";
    /// 对端身份校验失败。
    pub const SECURITY_PEER_CHECK_FAILED: &str = "tether.handshake.security.peer_check_failed";
    /// 加密端点写路径的帧保护失败。
    pub const SECURE_ENDPOINT_PROTECT_FAILED: &str = "tether.secure_endpoint.protect_failed";
    /// 加密端点读路径的帧解保护失败。
    pub const SECURE_ENDPOINT_UNPROTECT_FAILED: &str = "tether.secure_endpoint.unprotect_failed";
    /// 连接器已被关闭。
    pub const CONNECTOR_SHUTDOWN: &str = "tether.connector.shutdown";
    /// 连接器已有一次连接在进行中。
    pub const CONNECTOR_BUSY: &str = "tether.connector.busy";
    /// 子通道的一次连接尝试失败。
    pub const SUBCHANNEL_CONNECT_FAILED: &str = "tether.subchannel.connect_failed";
    /// 子通道已被断开（强引用归零）。
    pub const SUBCHANNEL_DISCONNECTED: &str = "tether.subchannel.disconnected";
    /// 为新传输构建子通道栈失败。
    pub const SUBCHANNEL_STACK_INIT_FAILED: &str = "tether.subchannel.stack_init_failed";
    /// 已建立的传输失效。
    pub const TRANSPORT_LOST: &str = "tether.transport.lost";
    /// 连通性观察者被撤销。
    pub const WATCH_CANCELLED: &str = "tether.connectivity.watch_cancelled";
    /// 通道参数非法或配置文件无法解析。
    pub const ARGS_INVALID: &str = "tether.args.invalid";
}

/// 建议的重试节奏。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    pub wait: Duration,
}

impl RetryAdvice {
    pub const fn after(wait: Duration) -> Self {
        Self { wait }
    }
}

/// 错误的主要处置策略。
///
/// 调用方依据分类而非消息文本决定“重试 / 放弃 / 上报安全事件”。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 可在退避后重试。
    Retryable(RetryAdvice),
    /// 不可重试。
    NonRetryable,
    /// 对端不可达，连通性状态应转为 TRANSIENT_FAILURE。
    Unavailable,
    /// 安全相关失败（TSI、身份校验）。
    Security,
    /// 对端违反协议（代理响应、帧格式）。
    ProtocolViolation,
    /// 操作因关闭或撤销而中止。
    Cancelled,
    /// 截止时间到期。
    Timeout,
}

/// `CoreError` 是 tether 各 crate 共享的错误形态。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 连接建立链路上的失败需要在握手器、连接器与子通道之间层层传递，
///   并最终交给连通性观察者；统一的错误码让每一层都能做机读判定。
///
/// ## 逻辑（How）
/// - `code` 为 `'static` 稳定码值，`message` 面向排障人员；
/// - `cause` 以 `Arc` 共享，整个错误可 `Clone`，同一失败可以同时投递给多个观察者；
/// - [`wrap`](Self::wrap) 用于“引用式”错误：新错误以旧错误为因，保留完整链路。
///
/// ## 契约（What）
/// - 所有构造方法返回拥有所有权的值，`Send + Sync + 'static`；
/// - 未显式标记分类时，[`category`](Self::category) 按错误码给出默认分类。
///
/// ## 风险（Trade-offs）
/// - 消息使用 `Cow`，静态文本零分配；动态文本会触发一次堆分配。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 以另一个核心错误为因构造新错误。
    pub fn wrap(code: &'static str, message: impl Into<Cow<'static, str>>, cause: CoreError) -> Self {
        Self::new(code, message).with_cause(cause)
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 为现有错误设置底层原因。
    pub fn set_cause(&mut self, cause: impl Error + Send + Sync + 'static) {
        self.cause = Some(Arc::new(cause));
    }

    /// 显式标记分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 获取结构化错误分类。
    ///
    /// # 契约说明（What）
    /// - 显式标记优先；
    /// - 否则按错误码查默认表，未登记的码值回退为 [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or_else(|| default_category(self.code))
    }

    /// 是否因关闭或撤销而中止。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.category(), ErrorCategory::Cancelled)
    }

    /// 沿 `cause` 链查找首个匹配 `code` 的核心错误。
    pub fn find_code(&self, code: &str) -> Option<&CoreError> {
        if self.code == code {
            return Some(self);
        }
        let mut current: Option<&(dyn Error + 'static)> = self.source();
        while let Some(err) = current {
            if let Some(core) = err.downcast_ref::<CoreError>()
                && core.code == code
            {
                return Some(core);
            }
            current = err.source();
        }
        None
    }
}

fn default_category(code: &str) -> ErrorCategory {
    match code {
        codes::ENDPOINT_SHUTDOWN
        | codes::HANDSHAKE_SHUTDOWN
        | codes::CONNECTOR_SHUTDOWN
        | codes::SUBCHANNEL_DISCONNECTED
        | codes::WATCH_CANCELLED => ErrorCategory::Cancelled,
        codes::HANDSHAKE_TIMEOUT => ErrorCategory::Timeout,
        codes::SECURITY_HANDSHAKE_FAILED | codes::SECURITY_PEER_CHECK_FAILED => {
            ErrorCategory::Security
        }
        codes::HTTP_CONNECT_REJECTED
        | codes::HTTP_CONNECT_MALFORMED
        | codes::SECURE_ENDPOINT_UNPROTECT_FAILED => ErrorCategory::ProtocolViolation,
        codes::TRANSPORT_CONNECT_FAILED
        | codes::SUBCHANNEL_CONNECT_FAILED
        | codes::TRANSPORT_LOST
        | codes::CONNECTOR_BUSY
        | codes::ENDPOINT_CLOSED => ErrorCategory::Unavailable,
        _ => ErrorCategory::NonRetryable,
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("CoreError");
        dbg.field("code", &self.code).field("message", &self.message);
        if let Some(cause) = &self.cause {
            dbg.field("cause", &format_args!("{cause}"));
        }
        if let Some(category) = &self.category {
            dbg.field("category", category);
        }
        dbg.finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 便捷别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn default_category_follows_code_table() {
        let shutdown = CoreError::new(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown");
        assert!(shutdown.is_cancelled());

        let timeout = CoreError::new(codes::HANDSHAKE_TIMEOUT, "Handshake timed out");
        assert_eq!(timeout.category(), ErrorCategory::Timeout);

        let unknown = CoreError::new("tether.test.unknown", "?");
        assert_eq!(unknown.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn explicit_category_overrides_table() {
        let err = CoreError::new(codes::HANDSHAKE_SHUTDOWN, "x").with_category(
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(5))),
        );
        assert!(!err.is_cancelled());
    }

    #[test]
    fn wrap_keeps_chain_and_is_searchable() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let root = CoreError::new(codes::TRANSPORT_CONNECT_FAILED, "dial failed").with_cause(io);
        let outer = CoreError::wrap(codes::SUBCHANNEL_CONNECT_FAILED, "Connect Failed", root);

        assert_eq!(outer.code(), codes::SUBCHANNEL_CONNECT_FAILED);
        let found = outer
            .find_code(codes::TRANSPORT_CONNECT_FAILED)
            .expect("链路中应能找到拨号错误");
        assert_eq!(found.message(), "dial failed");
        assert!(outer.to_string().contains("refused"));
    }

    #[test]
    fn clone_shares_cause() {
        let err = CoreError::new(codes::ENDPOINT_READ_FAILED, "read")
            .with_cause(io::Error::other("boom"));
        let copy = err.clone();
        assert!(Arc::ptr_eq(
            err.cause().expect("cause"),
            copy.cause().expect("cause")
        ));
    }
}
