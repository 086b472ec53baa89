use crate::{
    endpoint::TcpEndpoint,
    error::{self, map_io_error},
};
use std::net::SocketAddr;
use tether_core::CoreError;
use tokio::net::TcpListener as TokioTcpListener;
use tracing::debug;

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端接入与测试中的代理、后端都需要“监听 → 接受 → 得到端点”的最小能力，
///   且错误要落在统一的 [`CoreError`] 上。
///
/// ## 契约 (What)
/// - `bind` 接受 `ip:port` 或 `host:port`，端口可为 0；
/// - `accept` 成功返回的 [`TcpEndpoint`] 已记录本地与对端地址。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// 绑定到指定地址并返回监听器。
    pub async fn bind(addr: &str) -> Result<Self, CoreError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        debug!(%local_addr, "tcp listener bound");
        Ok(Self {
            inner: listener,
            local_addr,
        })
    }

    /// 返回监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受一个入站连接。
    pub async fn accept(&self) -> Result<TcpEndpoint, CoreError> {
        let (stream, remote) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%remote, error = %err, "failed to configure TCP_NODELAY");
        }
        TcpEndpoint::from_stream(stream)
    }
}
