use std::{fmt, mem, ops::Deref, sync::Arc};

use bytes::BytesMut;

use crate::pool::PoolInner;

/// `PooledBuffer` 是池化定长缓冲的唯一所有权句柄。
///
/// # 设计初衷（Why）
/// - 缓冲在“自由链表 → 出站队列 → 在途写操作 → 自由链表”之间流转，
///   任一时刻只能有一个持有者；用可移动、不可克隆的句柄表达这条所有权链，
///   让别名与重复归还成为编译错误，而不是运行期的静默内存破坏；
/// - `Drop` 中自动归还，即便错误路径上遗失了句柄也不会泄漏池内存。
///
/// # 结构说明（How）
/// - `data` 为底层 `BytesMut`，其长度即“已用长度”；容量在创建时固定，
///   [`PooledBuffer::append`] 只在剩余空间内拷贝，绝不扩容；
/// - `origin` 指回所属池，`Drop` 时经 `PoolInner::reclaim` 放回自由链表。
///
/// # 契约（What）
/// - `len() <= capacity()` 恒成立；
/// - 句柄可跨线程移动（`Send`），但不提供共享可变访问。
pub struct PooledBuffer {
    id: u64,
    data: BytesMut,
    origin: Arc<PoolInner>,
}

impl PooledBuffer {
    pub(crate) fn new(id: u64, data: BytesMut, origin: Arc<PoolInner>) -> Self {
        Self { id, data, origin }
    }

    /// 池内编号，仅用于日志关联。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 已写入字节数。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 固定容量，等于所属池的 `buffer_capacity`。
    pub fn capacity(&self) -> usize {
        self.origin.buffer_capacity()
    }

    /// 剩余可追加字节数。
    pub fn spare(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_full(&self) -> bool {
        self.spare() == 0
    }

    /// 追加 `src` 中不超过剩余空间的前缀，返回实际拷贝的字节数。
    pub fn append(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.spare());
        self.data.extend_from_slice(&src[..count]);
        count
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 将已用长度归零，容量保持不变。
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner>) -> bool {
        Arc::ptr_eq(&self.origin, pool)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        self.origin.reclaim(self.id, data);
    }
}
