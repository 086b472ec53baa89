//! tether-core：连接建立链路共享的基础契约。
//!
//! # 教案式导读
//!
//! - **意图（Why）**：子通道、连接器与握手器分属不同 crate，却要交换同一批概念：
//!   错误、切片缓冲、通道参数、字节流端点、连通性状态与重连退避。
//!   这些概念集中在本 crate，避免下游 crate 之间出现环状依赖。
//! - **结构（How）**：
//!   - [`error`]：稳定错误码与 [`CoreError`]；
//!   - [`buffer`]：零拷贝切片序列 [`SliceBuffer`]；
//!   - [`args`]：写时复制的 [`ChannelArgs`] 与参数键；
//!   - [`endpoint`]：[`Endpoint`] / [`Dialer`] 抽象、关闭信号与内存端点；
//!   - [`connectivity`]：连通性状态与一次性观察者表；
//!   - [`backoff`]：带抖动的指数退避；
//!   - [`observability`]：进程级日志安装。
//! - **约束（What）**：本 crate 不创建任何后台任务；需要定时器的逻辑只接收 `Instant`，
//!   由调用方的 Tokio 运行时驱动。

pub mod args;
pub mod backoff;
pub mod buffer;
pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod observability;

pub use args::{ArgValue, ChannelArg, ChannelArgs, IntegerOptions, PointerArg, keys};
pub use backoff::{Backoff, BackoffConfig};
pub use buffer::SliceBuffer;
pub use connectivity::{
    ConnectivityState, ConnectivityStateTracker, Notifications, StateCallback, WatcherId,
};
pub use endpoint::{Dialer, Endpoint, EndpointRef, ShutdownSignal};
pub use error::{CoreError, ErrorCategory, Result, RetryAdvice, codes};
