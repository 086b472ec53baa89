//! 测试用的假安全机制。
//!
//! 握手为四条固定消息（`CLIENT_INIT` → `SERVER_INIT` → `CLIENT_FINISHED` → `SERVER_FINISHED`），
//! 每条消息与每个数据帧都以 4 字节小端总长度（含头部）开头。
//! 数据帧不加密，只分帧；用于在没有真实密码学实现时验证握手链与加密端点的字节搬运。

use crate::{
    handshaker::HandshakerRole,
    security::{AuthContext, SecurityConnector},
    tsi::{
        CERTIFICATE_TYPE_PEER_PROPERTY, FrameProtector, SECURITY_LEVEL_PEER_PROPERTY, TsiError,
        TsiHandshaker, TsiHandshakerResult, TsiNextOutput, TsiPeer, ZeroCopyProtector,
    },
};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};
use tether_core::{ChannelArgs, CoreError, SliceBuffer, codes};

/// 证书类型属性值。
pub const FAKE_CERTIFICATE_TYPE: &str = "FAKE";
/// 帧头长度。
pub const FRAME_HEADER_SIZE: usize = 4;
/// 默认最大帧长度（含头部）。
pub const DEFAULT_FRAME_SIZE: usize = 16 * 1024;
/// 允许配置的最小帧长度。
pub const MIN_FRAME_SIZE: usize = 16;

fn frame_size(max: Option<usize>) -> usize {
    max.unwrap_or(DEFAULT_FRAME_SIZE).max(MIN_FRAME_SIZE)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FakeMessage {
    ClientInit,
    ServerInit,
    ClientFinished,
    ServerFinished,
}

impl FakeMessage {
    fn as_str(self) -> &'static str {
        match self {
            FakeMessage::ClientInit => "CLIENT_INIT",
            FakeMessage::ServerInit => "SERVER_INIT",
            FakeMessage::ClientFinished => "CLIENT_FINISHED",
            FakeMessage::ServerFinished => "SERVER_FINISHED",
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Send(FakeMessage),
    Expect(FakeMessage),
}

const CLIENT_SCRIPT: [Step; 4] = [
    Step::Send(FakeMessage::ClientInit),
    Step::Expect(FakeMessage::ServerInit),
    Step::Send(FakeMessage::ClientFinished),
    Step::Expect(FakeMessage::ServerFinished),
];

const SERVER_SCRIPT: [Step; 4] = [
    Step::Expect(FakeMessage::ClientInit),
    Step::Send(FakeMessage::ServerInit),
    Step::Expect(FakeMessage::ClientFinished),
    Step::Send(FakeMessage::ServerFinished),
];

fn put_frame(out: &mut BytesMut, payload: &[u8]) {
    out.put_u32_le((payload.len() + FRAME_HEADER_SIZE) as u32);
    out.put_slice(payload);
}

/// 从 `incoming` 头部取出一个完整帧的负载；不完整时返回 `None`。
fn take_frame(incoming: &mut BytesMut, max: usize) -> Result<Option<Bytes>, TsiError> {
    if incoming.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let size = u32::from_le_bytes([incoming[0], incoming[1], incoming[2], incoming[3]]) as usize;
    if size < FRAME_HEADER_SIZE || size > max {
        return Err(TsiError::DataCorrupted(format!("invalid frame size {size}")));
    }
    if incoming.len() < size {
        return Ok(None);
    }
    let mut frame = incoming.split_to(size);
    frame.advance(FRAME_HEADER_SIZE);
    Ok(Some(frame.freeze()))
}

struct HandshakeState {
    position: usize,
    incoming: BytesMut,
}

/// 假 TSI 握手器。
pub struct FakeTsiHandshaker {
    role: HandshakerRole,
    zero_copy: bool,
    state: Mutex<HandshakeState>,
    shutdown: AtomicBool,
}

impl FakeTsiHandshaker {
    pub fn new(role: HandshakerRole) -> Arc<Self> {
        Self::with_zero_copy(role, false)
    }

    /// `zero_copy` 为真时，握手结果提供零拷贝保护器。
    pub fn with_zero_copy(role: HandshakerRole, zero_copy: bool) -> Arc<Self> {
        Arc::new(Self {
            role,
            zero_copy,
            state: Mutex::new(HandshakeState {
                position: 0,
                incoming: BytesMut::new(),
            }),
            shutdown: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HandshakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn script(&self) -> &'static [Step] {
        match self.role {
            HandshakerRole::Client => &CLIENT_SCRIPT,
            HandshakerRole::Server => &SERVER_SCRIPT,
        }
    }

    fn advance(&self, received: &[u8]) -> Result<TsiNextOutput, TsiError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TsiError::HandshakeShutdown);
        }
        let script = self.script();
        let mut state = self.lock();
        state.incoming.extend_from_slice(received);
        let mut out = BytesMut::new();
        loop {
            match script.get(state.position) {
                None => {
                    let unused = state.incoming.split().freeze();
                    return Ok(TsiNextOutput {
                        bytes_to_send: out.freeze(),
                        result: Some(Box::new(FakeHandshakerResult {
                            unused,
                            zero_copy: self.zero_copy,
                        })),
                    });
                }
                Some(Step::Send(message)) => {
                    put_frame(&mut out, message.as_str().as_bytes());
                    state.position += 1;
                }
                Some(Step::Expect(expected)) => {
                    match take_frame(&mut state.incoming, DEFAULT_FRAME_SIZE)? {
                        None if out.is_empty() => return Err(TsiError::IncompleteData),
                        None => {
                            return Ok(TsiNextOutput {
                                bytes_to_send: out.freeze(),
                                result: None,
                            });
                        }
                        Some(payload) if payload.as_ref() == expected.as_str().as_bytes() => {
                            state.position += 1;
                        }
                        Some(payload) => {
                            return Err(TsiError::ProtocolFailure(format!(
                                "expected {}, received {}",
                                expected.as_str(),
                                String::from_utf8_lossy(&payload)
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TsiHandshaker for FakeTsiHandshaker {
    async fn next(&self, received: Bytes) -> Result<TsiNextOutput, TsiError> {
        // 让出一次调度，行为上接近需要远端服务参与的异步握手。
        tokio::task::yield_now().await;
        self.advance(&received)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

struct FakeHandshakerResult {
    unused: Bytes,
    zero_copy: bool,
}

impl TsiHandshakerResult for FakeHandshakerResult {
    fn extract_peer(&self) -> Result<TsiPeer, TsiError> {
        Ok(TsiPeer::default()
            .with_property(
                CERTIFICATE_TYPE_PEER_PROPERTY,
                Bytes::from_static(FAKE_CERTIFICATE_TYPE.as_bytes()),
            )
            .with_property(
                SECURITY_LEVEL_PEER_PROPERTY,
                Bytes::from_static(b"TSI_SECURITY_NONE"),
            ))
    }

    fn create_zero_copy_protector(
        &self,
        max_output_protected_frame_size: Option<usize>,
    ) -> Result<Box<dyn ZeroCopyProtector>, TsiError> {
        if !self.zero_copy {
            return Err(TsiError::Unimplemented);
        }
        Ok(Box::new(FakeZeroCopyProtector::new(max_output_protected_frame_size)))
    }

    fn create_frame_protector(
        &self,
        max_output_protected_frame_size: Option<usize>,
    ) -> Result<Box<dyn FrameProtector>, TsiError> {
        Ok(Box::new(FakeFrameProtector::new(max_output_protected_frame_size)))
    }

    fn unused_bytes(&self) -> Bytes {
        self.unused.clone()
    }
}

fn drain(pending: &mut BytesMut, out: &mut [u8]) -> usize {
    let n = pending.len().min(out.len());
    out[..n].copy_from_slice(&pending[..n]);
    pending.advance(n);
    n
}

/// 假帧保护器：明文按 `max_frame - 4` 字节分帧，每帧加 4 字节长度头。
pub struct FakeFrameProtector {
    max_frame: usize,
    protect_payload: BytesMut,
    protect_out: BytesMut,
    unprotect_in: BytesMut,
    unprotect_out: BytesMut,
}

impl FakeFrameProtector {
    pub fn new(max_frame: Option<usize>) -> Self {
        Self {
            max_frame: frame_size(max_frame),
            protect_payload: BytesMut::new(),
            protect_out: BytesMut::new(),
            unprotect_in: BytesMut::new(),
            unprotect_out: BytesMut::new(),
        }
    }

    fn max_payload(&self) -> usize {
        self.max_frame - FRAME_HEADER_SIZE
    }

    fn seal_payload(&mut self) {
        let payload = self.protect_payload.split();
        put_frame(&mut self.protect_out, &payload);
    }
}

impl FrameProtector for FakeFrameProtector {
    fn protect(
        &mut self,
        unprotected: &[u8],
        protected_out: &mut [u8],
    ) -> Result<(usize, usize), TsiError> {
        let mut written = drain(&mut self.protect_out, protected_out);
        if !self.protect_out.is_empty() {
            return Ok((0, written));
        }
        let room = self.max_payload() - self.protect_payload.len();
        let consumed = room.min(unprotected.len());
        self.protect_payload
            .extend_from_slice(&unprotected[..consumed]);
        if self.protect_payload.len() == self.max_payload() {
            self.seal_payload();
            written += drain(&mut self.protect_out, &mut protected_out[written..]);
        }
        Ok((consumed, written))
    }

    fn protect_flush(&mut self, protected_out: &mut [u8]) -> Result<(usize, usize), TsiError> {
        if self.protect_out.is_empty() && !self.protect_payload.is_empty() {
            self.seal_payload();
        }
        let written = drain(&mut self.protect_out, protected_out);
        Ok((written, self.protect_out.len()))
    }

    fn unprotect(
        &mut self,
        protected: &[u8],
        unprotected_out: &mut [u8],
    ) -> Result<(usize, usize), TsiError> {
        let mut written = drain(&mut self.unprotect_out, unprotected_out);
        if !self.unprotect_out.is_empty() {
            return Ok((0, written));
        }
        self.unprotect_in.extend_from_slice(protected);
        while let Some(payload) = take_frame(&mut self.unprotect_in, self.max_frame)? {
            self.unprotect_out.extend_from_slice(&payload);
        }
        written += drain(&mut self.unprotect_out, &mut unprotected_out[written..]);
        Ok((protected.len(), written))
    }
}

/// 假零拷贝保护器：帧头单独成片，负载切片原样转交。
pub struct FakeZeroCopyProtector {
    max_frame: usize,
    pending: SliceBuffer,
}

impl FakeZeroCopyProtector {
    pub fn new(max_frame: Option<usize>) -> Self {
        Self {
            max_frame: frame_size(max_frame),
            pending: SliceBuffer::new(),
        }
    }
}

impl ZeroCopyProtector for FakeZeroCopyProtector {
    fn protect(
        &mut self,
        unprotected: &mut SliceBuffer,
        protected: &mut SliceBuffer,
    ) -> Result<(), TsiError> {
        let max_payload = self.max_frame - FRAME_HEADER_SIZE;
        while !unprotected.is_empty() {
            let take = unprotected.len().min(max_payload);
            let mut header = BytesMut::with_capacity(FRAME_HEADER_SIZE);
            header.put_u32_le((take + FRAME_HEADER_SIZE) as u32);
            protected.push(header.freeze());
            unprotected.move_first(take, protected);
        }
        Ok(())
    }

    fn unprotect(
        &mut self,
        protected: &mut SliceBuffer,
        unprotected: &mut SliceBuffer,
    ) -> Result<(), TsiError> {
        self.pending.append(protected);
        loop {
            let mut header = [0u8; FRAME_HEADER_SIZE];
            if self.pending.copy_prefix(&mut header) < FRAME_HEADER_SIZE {
                return Ok(());
            }
            let size = u32::from_le_bytes(header) as usize;
            if size < FRAME_HEADER_SIZE || size > self.max_frame {
                return Err(TsiError::DataCorrupted(format!("invalid frame size {size}")));
            }
            if self.pending.len() < size {
                return Ok(());
            }
            self.pending.advance(FRAME_HEADER_SIZE);
            self.pending.move_first(size - FRAME_HEADER_SIZE, unprotected);
        }
    }
}

/// 假安全连接器。
#[derive(Debug, Default)]
pub struct FakeSecurityConnector {
    zero_copy: bool,
    reject_peer: bool,
}

impl FakeSecurityConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn zero_copy() -> Arc<Self> {
        Arc::new(Self {
            zero_copy: true,
            reject_peer: false,
        })
    }

    /// 对端校验总是失败。
    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            zero_copy: false,
            reject_peer: true,
        })
    }
}

#[async_trait]
impl SecurityConnector for FakeSecurityConnector {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create_tsi_handshaker(
        &self,
        role: HandshakerRole,
        _args: &ChannelArgs,
    ) -> Result<Arc<dyn TsiHandshaker>, CoreError> {
        Ok(FakeTsiHandshaker::with_zero_copy(role, self.zero_copy))
    }

    async fn check_peer(&self, peer: TsiPeer) -> Result<AuthContext, CoreError> {
        let certificate_type = peer.get(CERTIFICATE_TYPE_PEER_PROPERTY);
        let expected = certificate_type.is_some_and(|value| &value[..] == FAKE_CERTIFICATE_TYPE.as_bytes());
        if self.reject_peer || !expected {
            return Err(CoreError::new(
                codes::SECURITY_PEER_CHECK_FAILED,
                "Peer check failed: unexpected certificate type",
            ));
        }
        let mut auth = AuthContext::from_peer(&peer);
        auth.set_peer_identity_property(CERTIFICATE_TYPE_PEER_PROPERTY);
        Ok(auth)
    }
}
