use crate::{
    endpoint::TcpEndpoint,
    error::{self, AddressError, map_io_error, timeout_error},
};
use async_trait::async_trait;
use std::sync::Arc;
use tether_core::{ChannelArgs, CoreError, Dialer, EndpointRef};
use tokio::{
    net::{TcpStream as TokioTcpStream, lookup_host},
    time::{Instant, timeout_at},
};
use tracing::{debug, warn};

/// 把子通道地址转换为 `host:port`。
///
/// 接受 `ipv4:1.2.3.4:80`、`ipv6:[::1]:80` 与裸 `host:port` 三种写法；
/// 其他带 scheme 的地址返回 [`AddressError::UnsupportedScheme`]。
pub fn parse_target(address: &str) -> Result<&str, AddressError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AddressError::Empty);
    }
    if let Some(rest) = address
        .strip_prefix("ipv4:")
        .or_else(|| address.strip_prefix("ipv6:"))
    {
        return Ok(rest);
    }
    if let Some((scheme, _)) = address.split_once("://") {
        return Err(AddressError::UnsupportedScheme(scheme.to_owned()));
    }
    if address.starts_with("unix:") {
        return Err(AddressError::UnsupportedScheme("unix".to_owned()));
    }
    Ok(address)
}

/// TCP 拨号器。
///
/// 依次尝试解析出的每个地址，整个过程受 `deadline` 约束；
/// 全部失败时返回最后一个错误。
#[derive(Clone, Debug)]
pub struct TcpDialer {
    nodelay: bool,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 直接返回具体类型，便于测试读取地址。
    pub async fn connect(&self, address: &str, deadline: Instant) -> Result<TcpEndpoint, CoreError> {
        let target = parse_target(address)?;
        let resolved = match timeout_at(deadline, lookup_host(target)).await {
            Ok(Ok(resolved)) => resolved.collect::<Vec<_>>(),
            Ok(Err(err)) => return Err(map_io_error(error::RESOLVE, err)),
            Err(_) => return Err(timeout_error(error::RESOLVE)),
        };
        if resolved.is_empty() {
            return Err(AddressError::NoAddresses(target.to_owned()).into());
        }

        let mut last_error = None;
        for addr in resolved {
            match timeout_at(deadline, TokioTcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(self.nodelay) {
                        warn!(%addr, error = %err, "failed to configure TCP_NODELAY");
                    }
                    debug!(%addr, "tcp connected");
                    return TcpEndpoint::from_stream(stream);
                }
                Ok(Err(err)) => {
                    debug!(%addr, error = %err, "tcp connect attempt failed");
                    last_error = Some(map_io_error(error::CONNECT, err));
                }
                Err(_) => return Err(timeout_error(error::CONNECT)),
            }
        }
        Err(last_error.unwrap_or_else(|| AddressError::NoAddresses(target.to_owned()).into()))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        address: &str,
        _args: &ChannelArgs,
        deadline: Instant,
    ) -> Result<EndpointRef, CoreError> {
        let endpoint = self.connect(address, deadline).await?;
        Ok(Arc::new(endpoint))
    }
}
