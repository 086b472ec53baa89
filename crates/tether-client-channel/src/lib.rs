//! tether-client-channel：从“一个地址”到“一条可用连接”。
//!
//! # 设计动机（Why）
//! - 上层负载均衡只想拿到“某地址当前是否可用、可用时在哪条连接上开流”；
//!   拨号、握手、失败退避、连接丢失后的重建都应当对它透明。
//!
//! # 核心契约（What）
//! - [`Connector`]：一次“拨号 + 握手 + 构造传输”，[`HandshakingConnector`] 是通用实现；
//! - [`Subchannel`]：按地址管理连接的状态机，惰性连接、串行重连、带抖动的指数退避；
//! - [`ConnectedSubchannel`] / [`SubchannelCall`]：就绪连接及其上的单次调用；
//! - [`SubchannelIndex`]：按（连接器工厂、地址、参数）去重，每个新子通道从 [`ConnectorFactory`] 取得自己的连接器；
//! - [`ProxyMapper`] / [`HttpProxyMapper`]：创建子通道前的代理改道；
//! - [`Transport`] / [`TransportFactory`]：由外部提供的传输实现接入点。
//!
//! # 实现策略（How）
//! - 子通道状态由一把互斥锁保护，回调收集后在锁外投递；
//! - 所有等待（退避定时、连接）都在 Tokio 任务中进行，关闭通过 [`tether_core::ShutdownSignal`] 广播。
//!
//! # 风险与考量（Trade-offs）
//! - 传输层（HTTP/2 分帧、流控）不在本 crate 内，[`transport::testing`] 只提供直通端点的简易实现。

pub mod connected;
pub mod connector;
pub mod index;
pub mod proxy;
pub mod subchannel;
pub mod transport;

pub use connected::{ConnectedSubchannel, SubchannelCall};
pub use connector::{
    ConnectArgs, ConnectResult, Connector, ConnectorFactory, DEFAULT_HANDSHAKE_TIMEOUT,
    HandshakingConnector, HandshakingConnectorFactory,
};
pub use index::{SubchannelIndex, SubchannelKey};
pub use proxy::{HttpProxyMapper, ProxyMapper};
pub use subchannel::{Subchannel, WeakSubchannel};
pub use transport::{CallArgs, StreamOp, Transport, TransportFactory, TransportRef, TransportStream};
