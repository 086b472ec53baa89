//! tether-handshake：连接建立后、交给传输之前的握手链。
//!
//! # 教案式导读
//!
//! - **意图（Why）**：原始字节流在承载 HTTP/2 之前，可能要先穿过 HTTP 代理、再完成安全握手。
//!   每一步都是可插拔的 [`Handshaker`]，由 [`HandshakeManager`] 串成一条链。
//! - **结构（How）**：
//!   - [`handshaker`]：握手器 trait 与在链上流转的 [`HandshakerArgs`]；
//!   - [`manager`]：顺序执行、统一截止时间与关闭转发；
//!   - [`registry`]：按角色登记的 [`HandshakerFactory`] 表；
//!   - [`http_connect`]：HTTP CONNECT 隧道；
//!   - [`tsi`]、[`security`]、[`secure_endpoint`]：TSI 抽象、安全握手器与加密端点；
//!   - [`fake`]：不加密、只分帧的安全实现，用于端到端验证。
//! - **约束（What）**：握手器只通过参数对象交接端点与残留字节；
//!   链上任何一步失败都必须关闭端点后再返回错误。

pub mod fake;
pub mod handshaker;
pub mod http_connect;
pub mod manager;
pub mod registry;
pub mod secure_endpoint;
pub mod security;
pub mod tsi;

pub use handshaker::{Acceptor, FailHandshaker, Handshaker, HandshakerArgs, HandshakerRole};
pub use http_connect::{HttpConnectHandshaker, HttpConnectHandshakerFactory};
pub use manager::HandshakeManager;
pub use registry::{HandshakerFactory, HandshakerRegistry};
pub use secure_endpoint::{Protector, SecureEndpoint};
pub use security::{
    AuthContext, SecurityConnector, SecurityHandshaker, SecurityHandshakerFactory,
    find_auth_context, find_security_connector, security_connector_arg,
};
pub use tsi::{
    FrameProtector, TsiError, TsiHandshaker, TsiHandshakerResult, TsiNextOutput, TsiPeer,
    ZeroCopyProtector,
};
