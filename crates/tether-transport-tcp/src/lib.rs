#![doc = r#"
# tether-transport-tcp

## 设计动机（Why）
- **定位**：为连接器提供基于 Tokio 的 TCP [`Dialer`](tether_core::Dialer)，
  为服务端与测试提供监听器，两者产出同一种 [`TcpEndpoint`]。
- **架构角色**：位于握手链之下，只负责字节流；代理与安全握手都叠加在它产出的端点之上。

## 核心契约（What）
- 拨号受调用方给出的截止时间约束，超时返回带 `Timeout` 分类的
  [`CoreError`](tether_core::CoreError)；
- 所有 IO 错误映射为稳定错误码：拨号与解析为 `tether.transport.connect_failed`，
  读写为 `tether.endpoint.read_failed` / `tether.endpoint.write_failed`；
- 端点关闭后挂起的读写立即失败，对端读到 EOF。

## 实现策略（How）
- 建立连接后把 `TcpStream` 拆成读写两个半部，各自加一把 `tokio::sync::Mutex`；
- 关闭时通过 `socket2::SockRef` 同步执行双向 `shutdown`。

## 风险与考量（Trade-offs）
- 地址解析使用 `tokio::net::lookup_host`，解析本身也计入截止时间；
- 不支持 Unix 域套接字地址。
"#]

mod dialer;
mod endpoint;
mod error;
mod listener;

pub use dialer::{TcpDialer, parse_target};
pub use endpoint::{READ_CHUNK_SIZE, TcpEndpoint};
pub use error::AddressError;
pub use listener::TcpListener;
