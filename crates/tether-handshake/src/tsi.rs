//! 传输安全接口（TSI）抽象。
//!
//! 安全握手器只通过这里的 trait 与具体安全实现交互：握手消息的生成与消费、
//! 对端身份的提取以及握手完成后的帧保护。

use async_trait::async_trait;
use bytes::Bytes;
use tether_core::{CoreError, SliceBuffer, codes};

/// 对端属性名：证书类型。
pub const CERTIFICATE_TYPE_PEER_PROPERTY: &str = "certificate_type";
/// 对端属性名：安全等级。
pub const SECURITY_LEVEL_PEER_PROPERTY: &str = "security_level";

/// TSI 失败。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TsiError {
    /// 当前字节不足以推进，需要更多输入。
    #[error("incomplete data")]
    IncompleteData,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),
    #[error("data corrupted: {0}")]
    DataCorrupted(String),
    #[error("unimplemented")]
    Unimplemented,
    #[error("handshake shut down")]
    HandshakeShutdown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TsiError> for CoreError {
    fn from(err: TsiError) -> Self {
        CoreError::new(codes::SECURITY_HANDSHAKE_FAILED, "Handshake failed").with_cause(err)
    }
}

/// 对端属性。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TsiPeerProperty {
    pub name: String,
    pub value: Bytes,
}

/// 握手得到的对端描述。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TsiPeer {
    pub properties: Vec<TsiPeerProperty>,
}

impl TsiPeer {
    pub fn with_property(mut self, name: &str, value: impl Into<Bytes>) -> Self {
        self.properties.push(TsiPeerProperty {
            name: name.to_owned(),
            value: value.into(),
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.properties
            .iter()
            .find(|property| property.name == name)
            .map(|property| &property.value)
    }
}

/// 一次 `next` 调用的产出。
pub struct TsiNextOutput {
    /// 需要写给对端的握手字节，可能为空。
    pub bytes_to_send: Bytes,
    /// 握手完成时给出结果。
    pub result: Option<Box<dyn TsiHandshakerResult>>,
}

/// 安全握手状态机。
///
/// # 契约（What）
/// - `next(received)`：消费 `received`（可为空）并产出待发送字节与可选的完成结果；
///   输入不足时返回 [`TsiError::IncompleteData`]，调用方读取更多字节后再调用；
/// - 实现可以在内部挂起（例如等待远端握手服务），调用方在等待期间仍可 `shutdown`；
/// - `shutdown` 幂等，之后的 `next` 返回 [`TsiError::HandshakeShutdown`]。
#[async_trait]
pub trait TsiHandshaker: Send + Sync + 'static {
    async fn next(&self, received: Bytes) -> Result<TsiNextOutput, TsiError>;

    fn shutdown(&self);
}

/// 握手结果。
pub trait TsiHandshakerResult: Send + Sync {
    fn extract_peer(&self) -> Result<TsiPeer, TsiError>;

    /// 零拷贝保护器；不支持时返回 [`TsiError::Unimplemented`]。
    fn create_zero_copy_protector(
        &self,
        _max_output_protected_frame_size: Option<usize>,
    ) -> Result<Box<dyn ZeroCopyProtector>, TsiError> {
        Err(TsiError::Unimplemented)
    }

    fn create_frame_protector(
        &self,
        max_output_protected_frame_size: Option<usize>,
    ) -> Result<Box<dyn FrameProtector>, TsiError>;

    /// 握手消息之后、已被读取但不属于握手的字节。
    fn unused_bytes(&self) -> Bytes;
}

/// 基于连续缓冲的帧保护器。
///
/// 三个方法都返回 `(consumed, written)` 或 `(written, still_pending)`，
/// 由调用方循环推进。
pub trait FrameProtector: Send {
    /// 消费 `unprotected` 的一部分，把密文写入 `protected_out`；返回 `(consumed, written)`。
    fn protect(
        &mut self,
        unprotected: &[u8],
        protected_out: &mut [u8],
    ) -> Result<(usize, usize), TsiError>;

    /// 冲刷内部缓存的密文；返回 `(written, still_pending)`。
    fn protect_flush(&mut self, protected_out: &mut [u8]) -> Result<(usize, usize), TsiError>;

    /// 消费 `protected` 的一部分，把明文写入 `unprotected_out`；返回 `(consumed, written)`。
    fn unprotect(
        &mut self,
        protected: &[u8],
        unprotected_out: &mut [u8],
    ) -> Result<(usize, usize), TsiError>;
}

/// 基于切片序列的零拷贝帧保护器。
pub trait ZeroCopyProtector: Send {
    /// 消费全部 `unprotected`，把完整帧追加到 `protected`。
    fn protect(
        &mut self,
        unprotected: &mut SliceBuffer,
        protected: &mut SliceBuffer,
    ) -> Result<(), TsiError>;

    /// 消费全部 `protected`，把已完整到达的帧解出并追加到 `unprotected`；
    /// 不完整的帧留在内部等待后续输入。
    fn unprotect(
        &mut self,
        protected: &mut SliceBuffer,
        unprotected: &mut SliceBuffer,
    ) -> Result<(), TsiError>;
}
