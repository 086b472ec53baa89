use crate::error::{self, map_io_error};
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::SockRef;
use std::net::{Shutdown as StdShutdown, SocketAddr};
use tether_core::{
    CoreError, Endpoint, ShutdownSignal, SliceBuffer, codes, endpoint::shutdown_error,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream as TokioTcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, trace};

/// 单次读取的缓冲区大小。
pub const READ_CHUNK_SIZE: usize = 8192;

/// TCP 字节流端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 握手链与传输只认 [`Endpoint`]；TCP 实现负责把 Tokio 的流读写、关闭语义
///   转成统一的 [`CoreError`]。
///
/// ## 逻辑 (How)
/// - 建立后立即 `into_split`，读写两个半部各有一把异步锁，读写可以并行；
/// - 关闭以 [`ShutdownSignal`] 广播：挂起的读写在 `select!` 中立即返回；
///   套接字的双向关闭通过 `socket2::SockRef` 同步执行。写半部锁被占用时
///   由持锁的写操作在退出前补做关闭。
///
/// ## 契约 (What)
/// - `read` 至少返回一个字节；对端关闭返回 [`codes::ENDPOINT_CLOSED`]；
/// - `shutdown` 幂等；
/// - `peer`/`local_address` 为 `ip:port` 形式，建立后不变。
///
/// ## 注意事项 (Trade-offs)
/// - 每次读分配一个 8 KiB 的 `BytesMut`，读出的切片直接冻结交出，不做二次拷贝。
#[derive(Debug)]
pub struct TcpEndpoint {
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    signal: ShutdownSignal,
    peer: SocketAddr,
    local: SocketAddr,
}

impl TcpEndpoint {
    pub(crate) fn from_stream(stream: TokioTcpStream) -> Result<Self, CoreError> {
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            signal: ShutdownSignal::new(),
            peer,
            local,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_shutdown(&self) -> bool {
        self.signal.is_triggered()
    }
}

fn close_socket(writer: &OwnedWriteHalf) {
    let stream: &TokioTcpStream = writer.as_ref();
    if let Err(err) = SockRef::from(stream).shutdown(StdShutdown::Both) {
        trace!(error = %err, "tcp socket shutdown failed");
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn read(&self, slices: &mut SliceBuffer, _urgent: bool) -> Result<(), CoreError> {
        slices.clear();
        if self.signal.is_triggered() {
            return Err(shutdown_error(self.signal.reason()));
        }
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let read = tokio::select! {
            biased;
            why = self.signal.triggered() => return Err(shutdown_error(Some(why))),
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(peer = %self.peer, "tcp peer closed connection");
                Err(CoreError::new(codes::ENDPOINT_CLOSED, "Endpoint closed"))
            }
            Ok(n) => {
                trace!(peer = %self.peer, bytes = n, "tcp read");
                slices.push(buf.freeze());
                Ok(())
            }
            Err(err) => Err(map_io_error(error::READ, err)),
        }
    }

    async fn write(&self, slices: SliceBuffer) -> Result<(), CoreError> {
        if self.signal.is_triggered() {
            return Err(shutdown_error(self.signal.reason()));
        }
        let mut writer = self.writer.lock().await;
        let total = slices.len();
        let result = tokio::select! {
            biased;
            why = self.signal.triggered() => Err(shutdown_error(Some(why))),
            written = async {
                for slice in slices {
                    writer.write_all(&slice).await?;
                }
                Ok::<_, std::io::Error>(())
            } => written.map_err(|err| map_io_error(error::WRITE, err)),
        };
        if self.signal.is_triggered() {
            close_socket(&writer);
        } else if result.is_ok() {
            trace!(peer = %self.peer, bytes = total, "tcp write");
        }
        result
    }

    fn shutdown(&self, why: CoreError) {
        if !self.signal.trigger(why) {
            return;
        }
        debug!(peer = %self.peer, "tcp endpoint shutdown");
        if let Ok(writer) = self.writer.try_lock() {
            close_socket(&writer);
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn local_address(&self) -> String {
        self.local.to_string()
    }
}
