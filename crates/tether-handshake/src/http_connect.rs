use crate::{
    handshaker::{Acceptor, Handshaker, HandshakerArgs},
    manager::HandshakeManager,
    registry::HandshakerFactory,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};
use tether_core::{
    ChannelArgs, CoreError, EndpointRef, ShutdownSignal, SliceBuffer, codes, keys,
};
use tracing::{debug, info, warn};

/// 响应头数量上限。
const MAX_RESPONSE_HEADERS: usize = 64;

/// 解析 `key:value` 行列表；缺少 `:` 的行被跳过并记录告警。
pub fn parse_connect_headers(raw: &str) -> Vec<(String, String)> {
    raw.split('\n')
        .filter_map(|line| match line.split_once(':') {
            Some((key, value)) => Some((key.to_owned(), value.to_owned())),
            None => {
                warn!(header = line, "skipping unparseable HTTP CONNECT header");
                None
            }
        })
        .collect()
}

/// 生成 CONNECT 请求。
pub fn format_connect_request(server: &str, headers: &[(String, String)]) -> Bytes {
    let mut request = format!("CONNECT {server} HTTP/1.0\r\nHost: {server}\r\n");
    for (key, value) in headers {
        request.push_str(key);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    Bytes::from(request)
}

struct HttpConnectState {
    shutdown: bool,
    endpoint: Option<EndpointRef>,
}

/// HTTP CONNECT 代理握手器。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 子通道地址已被代理映射改写为代理地址时，需要先让代理建立到真实目标的隧道，
///   后续握手（以及应用数据）才能透明地走这条隧道。
///
/// ## 逻辑（How）
/// 1. 通道参数没有 `grpc.http_connect_server` 时直接放行，并把自身标记为已关闭；
/// 2. 写出 `CONNECT host:port HTTP/1.0` 请求（附带可选头部）；
/// 3. 反复读取并以 `httparse` 增量解析响应，直到头部完整；
/// 4. 响应头之后的多余字节放回 `read_buffer`，交给下一个握手器；
/// 5. 状态码不在 `[200, 300)` 时失败。
///
/// ## 契约（What）
/// - 失败时关闭端点并返回错误；
/// - `shutdown` 幂等：首次调用关闭端点并让挂起的读写立即失败。
pub struct HttpConnectHandshaker {
    state: Mutex<HttpConnectState>,
    signal: ShutdownSignal,
}

impl HttpConnectHandshaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HttpConnectState {
                shutdown: false,
                endpoint: None,
            }),
            signal: ShutdownSignal::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HttpConnectState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 失败路径：首次失败时关闭端点；随后丢弃参数。
    fn fail(&self, args: HandshakerArgs, err: CoreError) -> CoreError {
        let first = {
            let mut state = self.lock();
            let first = !state.shutdown;
            state.shutdown = true;
            state.endpoint = None;
            first
        };
        if first {
            args.endpoint.shutdown(err.clone());
        }
        err
    }

    /// 在关闭信号与 IO 之间竞争。
    async fn guarded<T>(
        &self,
        io: impl Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        tokio::select! {
            biased;
            why = self.signal.triggered() => Err(shutdown_error(why)),
            result = io => result,
        }
    }

    async fn exchange(&self, args: &mut HandshakerArgs, server: &str) -> Result<(), CoreError> {
        let headers = args
            .args
            .get_string(keys::HTTP_CONNECT_HEADERS)
            .map(parse_connect_headers)
            .unwrap_or_default();
        info!(server, proxy = %args.endpoint.peer(), "Connecting to server via HTTP proxy");

        let request = format_connect_request(server, &headers);
        self.guarded(args.endpoint.write(SliceBuffer::from(request)))
            .await?;

        let mut response = BytesMut::from(args.read_buffer.take().to_bytes().as_ref());
        let mut incoming = SliceBuffer::new();
        loop {
            if !response.is_empty() {
                let mut storage = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
                let mut parsed = httparse::Response::new(&mut storage);
                match parsed.parse(&response) {
                    Ok(httparse::Status::Complete(consumed)) => {
                        let status = parsed.code.unwrap_or_default();
                        let reason = parsed.reason.unwrap_or_default().to_owned();
                        let leftover = response.split_off(consumed);
                        if !(200..300).contains(&status) {
                            return Err(CoreError::new(
                                codes::HTTP_CONNECT_REJECTED,
                                format!("HTTP proxy returned response code {status} ({reason})"),
                            ));
                        }
                        debug!(status, leftover = leftover.len(), "HTTP CONNECT tunnel established");
                        args.read_buffer.push(leftover.freeze());
                        return Ok(());
                    }
                    Ok(httparse::Status::Partial) => {}
                    Err(err) => {
                        return Err(CoreError::new(
                            codes::HTTP_CONNECT_MALFORMED,
                            "Failed to parse HTTP CONNECT response",
                        )
                        .with_cause(err));
                    }
                }
            }
            self.guarded(args.endpoint.read(&mut incoming, false)).await?;
            for slice in incoming.iter() {
                response.extend_from_slice(slice);
            }
        }
    }
}

fn shutdown_error(why: CoreError) -> CoreError {
    CoreError::wrap(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown", why)
}

#[async_trait]
impl Handshaker for HttpConnectHandshaker {
    fn name(&self) -> &'static str {
        "http_connect"
    }

    async fn do_handshake(
        self: Arc<Self>,
        _acceptor: Option<Acceptor>,
        mut args: HandshakerArgs,
    ) -> Result<HandshakerArgs, CoreError> {
        let Some(server) = args
            .args
            .get_string(keys::HTTP_CONNECT_SERVER)
            .map(str::to_owned)
        else {
            // 无代理目标：放行，并把自身视为已关闭。
            self.lock().shutdown = true;
            return Ok(args);
        };

        {
            let mut state = self.lock();
            if state.shutdown {
                drop(state);
                let why = self
                    .signal
                    .reason()
                    .map(shutdown_error)
                    .unwrap_or_else(|| CoreError::new(codes::HANDSHAKE_SHUTDOWN, "Handshaker shutdown"));
                return Err(args.abandon(why));
            }
            state.endpoint = Some(args.endpoint.clone());
        }

        match self.exchange(&mut args, &server).await {
            Ok(()) => {
                let mut state = self.lock();
                state.shutdown = true;
                state.endpoint = None;
                drop(state);
                Ok(args)
            }
            Err(err) => {
                warn!(server, error = %err, "HTTP CONNECT handshake failed");
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
        if let Some(endpoint) = endpoint {
            endpoint.shutdown(why);
        }
    }
}

/// 为每次连接追加一个 [`HttpConnectHandshaker`]。
#[derive(Debug, Default)]
pub struct HttpConnectHandshakerFactory;

impl HandshakerFactory for HttpConnectHandshakerFactory {
    fn name(&self) -> &'static str {
        "http_connect"
    }

    fn add_handshakers(&self, _args: &ChannelArgs, manager: &HandshakeManager) {
        manager.add(HttpConnectHandshaker::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::{Endpoint, endpoint::testing::MemoryEndpoint};
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn args_for(endpoint: EndpointRef, channel_args: ChannelArgs) -> HandshakerArgs {
        HandshakerArgs::new(endpoint, channel_args, Instant::now() + Duration::from_secs(60))
    }

    async fn read_request(proxy: &MemoryEndpoint) -> String {
        let mut collected = Vec::new();
        let mut buf = SliceBuffer::new();
        while !collected.ends_with(b"\r\n\r\n") {
            proxy.read(&mut buf, false).await.expect("proxy read");
            collected.extend(buf.to_vec());
        }
        String::from_utf8(collected).expect("utf8")
    }

    #[traced_test]
    #[test]
    fn malformed_header_lines_are_skipped() {
        let headers = parse_connect_headers("a:b\nmalformed\nc:d");
        assert_eq!(
            headers,
            vec![("a".to_owned(), "b".to_owned()), ("c".to_owned(), "d".to_owned())]
        );
        assert!(logs_contain("skipping unparseable HTTP CONNECT header"));
    }

    #[test]
    fn request_carries_host_and_extra_headers() {
        let request = format_connect_request(
            "backend:443",
            &[("Proxy-Authorization".to_owned(), "Basic abc".to_owned())],
        );
        assert_eq!(
            &request[..],
            b"CONNECT backend:443 HTTP/1.0\r\nHost: backend:443\r\nProxy-Authorization: Basic abc\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn passes_through_without_target() {
        let (client, _proxy) = MemoryEndpoint::pair("client", "proxy");
        let handshaker = HttpConnectHandshaker::new();
        let args = handshaker
            .do_handshake(None, args_for(client.clone(), ChannelArgs::new()))
            .await
            .expect("pass through");
        assert!(args.read_buffer.is_empty());
        assert!(!client.is_shutdown());
    }

    #[tokio::test]
    async fn tunnel_established_preserves_leftover_bytes() {
        let (client, proxy) = MemoryEndpoint::pair_with_chunk("client", "proxy", 7);
        let channel_args = ChannelArgs::new()
            .with_string(keys::HTTP_CONNECT_SERVER, "backend:443")
            .with_string(keys::HTTP_CONNECT_HEADERS, "x-a:1\nbogus");
        let handshaker = HttpConnectHandshaker::new();
        let task = tokio::spawn(handshaker.do_handshake(None, args_for(client, channel_args)));

        let request = read_request(&proxy).await;
        assert!(request.starts_with("CONNECT backend:443 HTTP/1.0\r\n"));
        assert!(request.contains("x-a: 1\r\n"));
        assert!(!request.contains("bogus"));

        proxy
            .write(SliceBuffer::from(&b"HTTP/1.0 200 Connected\r\n\r\nEXTRA"[..]))
            .await
            .expect("proxy write");

        let args = task.await.expect("join").expect("tunnel up");
        assert_eq!(args.read_buffer.to_vec(), b"EXTRA");
    }

    #[tokio::test]
    async fn non_2xx_status_fails_and_closes_endpoint() {
        let (client, proxy) = MemoryEndpoint::pair("client", "proxy");
        let channel_args = ChannelArgs::new().with_string(keys::HTTP_CONNECT_SERVER, "backend:443");
        let handshaker = HttpConnectHandshaker::new();
        let task = tokio::spawn(handshaker.do_handshake(None, args_for(client.clone(), channel_args)));

        read_request(&proxy).await;
        proxy
            .write(SliceBuffer::from(&b"HTTP/1.0 403 Forbidden\r\n\r\n"[..]))
            .await
            .expect("proxy write");

        let err = task.await.expect("join").expect_err("403 must fail");
        assert_eq!(err.code(), codes::HTTP_CONNECT_REJECTED);
        assert!(err.message().contains("403"));
        assert!(client.is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_read() {
        let (client, proxy) = MemoryEndpoint::pair("client", "proxy");
        let channel_args = ChannelArgs::new().with_string(keys::HTTP_CONNECT_SERVER, "backend:443");
        let handshaker = HttpConnectHandshaker::new();
        let task = tokio::spawn(handshaker.clone().do_handshake(None, args_for(client.clone(), channel_args)));

        read_request(&proxy).await;
        handshaker.shutdown(CoreError::new(codes::HANDSHAKE_SHUTDOWN, "stop"));
        handshaker.shutdown(CoreError::new(codes::HANDSHAKE_SHUTDOWN, "again"));

        let err = task.await.expect("join").expect_err("shut down");
        assert_eq!(err.code(), codes::HANDSHAKE_SHUTDOWN);
        assert!(client.is_shutdown());
    }
}
