use crate::tsi::{FrameProtector, TsiError, ZeroCopyProtector};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::{Mutex, MutexGuard};
use tether_core::{CoreError, Endpoint, EndpointRef, SliceBuffer, codes};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, trace};

/// 读写暂存区大小。
pub const STAGING_BUFFER_SIZE: usize = 8192;

/// 握手得到的帧保护器。
pub enum Protector {
    Frame(Box<dyn FrameProtector>),
    ZeroCopy(Box<dyn ZeroCopyProtector>),
}

impl Protector {
    pub fn is_zero_copy(&self) -> bool {
        matches!(self, Protector::ZeroCopy(_))
    }
}

/// 固定大小的暂存区。
///
/// `buf[..cur]` 为已写入字节；`buf[cur..]` 为可写空间。
/// 冲刷时以 `split_to` 切出已写入部分，剩余空间留给下一轮。
struct Staging {
    buf: BytesMut,
    cur: usize,
}

impl Staging {
    fn new() -> Self {
        Self {
            buf: BytesMut::zeroed(STAGING_BUFFER_SIZE),
            cur: 0,
        }
    }

    fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.cur..]
    }

    fn advance(&mut self, written: usize) {
        self.cur += written;
    }

    fn is_full(&self) -> bool {
        self.cur == self.buf.len()
    }

    /// 整块交出并换一块新的暂存区。
    fn flush_full(&mut self, out: &mut SliceBuffer) {
        let full = std::mem::replace(&mut self.buf, BytesMut::zeroed(STAGING_BUFFER_SIZE));
        out.push(full.freeze());
        self.cur = 0;
    }

    /// 交出已写入部分，保留剩余空间。
    fn flush_partial(&mut self, out: &mut SliceBuffer) {
        if self.cur == 0 {
            return;
        }
        out.push(self.buf.split_to(self.cur).freeze());
        self.cur = 0;
        if self.buf.is_empty() {
            self.buf = BytesMut::zeroed(STAGING_BUFFER_SIZE);
        }
    }
}

struct ReadState {
    leftover: Option<SliceBuffer>,
    staging: Staging,
}

struct WriteState {
    staging: Staging,
}

/// 在明文端点之上叠加帧保护的端点。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 安全握手完成后，上层（传输）应当像使用普通端点一样读写，
///   加解密与分帧完全由该包装透明完成。
///
/// ## 逻辑（How）
/// - **读**：优先消费握手残留字节（只消费一次）；否则从底层端点读一批密文，
///   交给保护器解出明文。非零拷贝路径逐片解保护，写入 8 KiB 暂存区，
///   暂存区写满即冻结为一个切片交出；保护器内部仍有明文时继续循环；
/// - **写**：非零拷贝路径逐片保护到暂存区，写满即交出；结束后反复 `protect_flush`
///   直到保护器不再有待出字节，最后交出暂存区的已写部分；
///   零拷贝路径按 `max_frame_size` 切块后逐块保护；
/// - 保护器本身放在同步互斥锁中，读写两条路径各自有一把异步锁，保证各自同一时刻至多一个操作。
///
/// ## 契约（What）
/// - `read` 至少返回一个明文字节，或返回错误；
/// - `shutdown`、`peer`、`local_address` 直接委托给底层端点；
/// - 解保护失败返回 [`codes::SECURE_ENDPOINT_UNPROTECT_FAILED`]（“Unwrap failed”），
///   保护失败返回 [`codes::SECURE_ENDPOINT_PROTECT_FAILED`]。
pub struct SecureEndpoint {
    wrapped: EndpointRef,
    protector: Mutex<Protector>,
    read: AsyncMutex<ReadState>,
    write: AsyncMutex<WriteState>,
    max_frame_size: usize,
}

impl SecureEndpoint {
    pub fn new(
        wrapped: EndpointRef,
        protector: Protector,
        leftover: SliceBuffer,
        max_frame_size: usize,
    ) -> Self {
        trace!(peer = %wrapped.peer(), leftover = leftover.len(), zero_copy = protector.is_zero_copy(), "secure endpoint created");
        Self {
            wrapped,
            protector: Mutex::new(protector),
            read: AsyncMutex::new(ReadState {
                leftover: (!leftover.is_empty()).then_some(leftover),
                staging: Staging::new(),
            }),
            write: AsyncMutex::new(WriteState {
                staging: Staging::new(),
            }),
            max_frame_size: max_frame_size.max(1),
        }
    }

    pub fn wrapped(&self) -> &EndpointRef {
        &self.wrapped
    }

    fn protector(&self) -> MutexGuard<'_, Protector> {
        self.protector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unprotect(
        &self,
        staging: &mut Staging,
        mut source: SliceBuffer,
        out: &mut SliceBuffer,
    ) -> Result<(), TsiError> {
        let mut protector = self.protector();
        match &mut *protector {
            Protector::ZeroCopy(zero_copy) => zero_copy.unprotect(&mut source, out),
            Protector::Frame(frame) => {
                for slice in source.iter() {
                    let mut message: &[u8] = slice;
                    let mut keep_looping = false;
                    while !message.is_empty() || keep_looping {
                        let (consumed, written) = frame.unprotect(message, staging.spare())?;
                        if consumed == 0 && written == 0 && !message.is_empty() {
                            return Err(TsiError::Internal(
                                "frame protector made no progress".to_owned(),
                            ));
                        }
                        message = &message[consumed..];
                        staging.advance(written);
                        if staging.is_full() {
                            staging.flush_full(out);
                            keep_looping = true;
                        } else {
                            keep_looping = written > 0;
                        }
                    }
                }
                staging.flush_partial(out);
                Ok(())
            }
        }
    }

    fn protect(
        &self,
        staging: &mut Staging,
        mut slices: SliceBuffer,
    ) -> Result<SliceBuffer, TsiError> {
        let mut output = SliceBuffer::new();
        let mut protector = self.protector();
        match &mut *protector {
            Protector::ZeroCopy(zero_copy) => {
                let mut chunk = SliceBuffer::new();
                while slices.len() > self.max_frame_size {
                    slices.move_first(self.max_frame_size, &mut chunk);
                    zero_copy.protect(&mut chunk, &mut output)?;
                    chunk.clear();
                }
                if !slices.is_empty() {
                    zero_copy.protect(&mut slices, &mut output)?;
                }
            }
            Protector::Frame(frame) => {
                for slice in slices.iter() {
                    let mut message: &[u8] = slice;
                    while !message.is_empty() {
                        let (consumed, written) = frame.protect(message, staging.spare())?;
                        if consumed == 0 && written == 0 {
                            return Err(TsiError::Internal(
                                "frame protector made no progress".to_owned(),
                            ));
                        }
                        message = &message[consumed..];
                        staging.advance(written);
                        if staging.is_full() {
                            staging.flush_full(&mut output);
                        }
                    }
                }
                loop {
                    let (written, still_pending) = frame.protect_flush(staging.spare())?;
                    staging.advance(written);
                    if staging.is_full() {
                        staging.flush_full(&mut output);
                    }
                    if still_pending == 0 {
                        break;
                    }
                }
                staging.flush_partial(&mut output);
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Endpoint for SecureEndpoint {
    async fn read(&self, slices: &mut SliceBuffer, urgent: bool) -> Result<(), CoreError> {
        slices.clear();
        let mut state = self.read.lock().await;
        loop {
            let source = match state.leftover.take() {
                Some(leftover) => leftover,
                None => {
                    let mut source = SliceBuffer::new();
                    self.wrapped.read(&mut source, urgent).await?;
                    source
                }
            };
            let ReadState { staging, .. } = &mut *state;
            if let Err(err) = self.unprotect(staging, source, slices) {
                error!(peer = %self.wrapped.peer(), error = %err, "Decryption error");
                slices.clear();
                return Err(CoreError::new(
                    codes::SECURE_ENDPOINT_UNPROTECT_FAILED,
                    format!("Unwrap failed ({err})"),
                )
                .with_cause(err));
            }
            if !slices.is_empty() {
                return Ok(());
            }
        }
    }

    async fn write(&self, slices: SliceBuffer) -> Result<(), CoreError> {
        let mut state = self.write.lock().await;
        let output = match self.protect(&mut state.staging, slices) {
            Ok(output) => output,
            Err(err) => {
                error!(peer = %self.wrapped.peer(), error = %err, "Encryption error");
                return Err(CoreError::new(
                    codes::SECURE_ENDPOINT_PROTECT_FAILED,
                    format!("Wrap failed ({err})"),
                )
                .with_cause(err));
            }
        };
        let result = self.wrapped.write(output).await;
        drop(state);
        result
    }

    fn shutdown(&self, why: CoreError) {
        self.wrapped.shutdown(why);
    }

    fn peer(&self) -> String {
        self.wrapped.peer()
    }

    fn local_address(&self) -> String {
        self.wrapped.local_address()
    }
}
