use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// 由多个引用计数切片组成的字节序列。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 端点读写、握手残留字节与加密端点的暂存输出都以“切片序列”交接，
///   整体拷贝成本不可接受；`Bytes` 的引用计数让切片在各层之间零拷贝移动。
///
/// ## 逻辑（How）
/// - 内部是 `VecDeque<Bytes>` 加总长度缓存；空切片在入队时直接丢弃；
/// - [`move_first`](Self::move_first) 在必要时对首个切片做 `split_to`，仍不拷贝负载。
///
/// ## 契约（What）
/// - `len()` 恒等于所有切片长度之和；
/// - 切片顺序即字节顺序。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceBuffer {
    slices: VecDeque<Bytes>,
    len: usize,
}

impl SliceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 字节总数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 切片数量。
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// 追加一个切片；空切片被忽略。
    pub fn push(&mut self, slice: Bytes) {
        if slice.is_empty() {
            return;
        }
        self.len += slice.len();
        self.slices.push_back(slice);
    }

    /// 从字节切片拷贝追加。
    pub fn push_copy(&mut self, data: &[u8]) {
        self.push(Bytes::copy_from_slice(data));
    }

    /// 把 `other` 的全部切片移动到末尾，`other` 随后为空。
    pub fn append(&mut self, other: &mut SliceBuffer) {
        self.len += other.len;
        self.slices.append(&mut other.slices);
        other.len = 0;
    }

    /// 取走全部内容，原缓冲变为空。
    pub fn take(&mut self) -> SliceBuffer {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        self.slices.clear();
        self.len = 0;
    }

    /// 弹出首个切片。
    pub fn pop_front(&mut self) -> Option<Bytes> {
        let slice = self.slices.pop_front()?;
        self.len -= slice.len();
        Some(slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.slices.iter()
    }

    /// 把前 `n` 个字节移动到 `dst` 末尾。
    ///
    /// # Panics
    /// `n > self.len()` 时 panic。
    pub fn move_first(&mut self, n: usize, dst: &mut SliceBuffer) {
        assert!(n <= self.len, "move_first 超出缓冲长度: {n} > {}", self.len);
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut head) = self.slices.pop_front() else {
                break;
            };
            if head.len() <= remaining {
                remaining -= head.len();
                self.len -= head.len();
                dst.push(head);
            } else {
                let part = head.split_to(remaining);
                self.len -= remaining;
                remaining = 0;
                dst.push(part);
                self.slices.push_front(head);
            }
        }
    }

    /// 丢弃前 `n` 个字节。
    pub fn advance(&mut self, n: usize) {
        let mut sink = SliceBuffer::new();
        self.move_first(n, &mut sink);
    }

    /// 把前 `dst.len()` 个字节拷贝到 `dst`，不消费内容；返回实际拷贝字节数。
    pub fn copy_prefix(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for slice in &self.slices {
            if copied == dst.len() {
                break;
            }
            let take = slice.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&slice[..take]);
            copied += take;
        }
        copied
    }

    /// 合并为一段连续字节；单切片时零拷贝。
    pub fn to_bytes(&self) -> Bytes {
        match self.slices.len() {
            0 => Bytes::new(),
            1 => self.slices[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for slice in &self.slices {
                    joined.extend_from_slice(slice);
                }
                joined.freeze()
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl From<Bytes> for SliceBuffer {
    fn from(slice: Bytes) -> Self {
        let mut buffer = SliceBuffer::new();
        buffer.push(slice);
        buffer
    }
}

impl From<Vec<u8>> for SliceBuffer {
    fn from(data: Vec<u8>) -> Self {
        SliceBuffer::from(Bytes::from(data))
    }
}

impl From<&'static [u8]> for SliceBuffer {
    fn from(data: &'static [u8]) -> Self {
        SliceBuffer::from(Bytes::from_static(data))
    }
}

impl From<&'static str> for SliceBuffer {
    fn from(data: &'static str) -> Self {
        SliceBuffer::from(Bytes::from_static(data.as_bytes()))
    }
}

impl Extend<Bytes> for SliceBuffer {
    fn extend<I: IntoIterator<Item = Bytes>>(&mut self, iter: I) {
        for slice in iter {
            self.push(slice);
        }
    }
}

impl FromIterator<Bytes> for SliceBuffer {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut buffer = SliceBuffer::new();
        buffer.extend(iter);
        buffer
    }
}

impl IntoIterator for SliceBuffer {
    type Item = Bytes;
    type IntoIter = std::collections::vec_deque::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.slices.into_iter()
    }
}
