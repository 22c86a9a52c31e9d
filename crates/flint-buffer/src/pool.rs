use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use crossbeam_queue::SegQueue;

use crate::pooled_buffer::PooledBuffer;

/// 默认单块缓冲容量（字节）。
pub const DEFAULT_BUFFER_CAPACITY: usize = 8000;

/// `BufferPool` 是基于无锁自由链表（Free List）的定长缓冲池。
///
/// # 模块角色（Why）
/// - 为出站队列提供统一的缓冲来源：每次写请求被切分为若干定长块，块用完即归还；
/// - 生产者线程与 reactor 线程会同时租借/归还，池本身不得成为锁竞争点。
///
/// # 核心机制（How）
/// - 自由链表使用 `crossbeam_queue::SegQueue`：无界、多生产者多消费者、基于 CAS，
///   不依赖平台私有的原子链表原语，也不存在裸指针栈的 ABA 风险；
/// - 缓冲编号计数器 `next_id` 属于池实例，而非进程级静态量；
/// - `PoolMetrics` 以原子计数记录创建、复用、租借中数量，`stats` 返回一致性“近似”快照。
///
/// # 契约说明（What）
/// - **线程安全**：`acquire`/`release` 可由任意数量线程并发调用，均不阻塞；
/// - **后置条件**：`acquire` 返回的缓冲 `len() == 0`、`capacity() == buffer_capacity()`；
/// - **失败语义**：内存分配失败由全局分配器直接终止进程，不作为逐次调用的错误返回。
///
/// # 设计权衡（Trade-offs）
/// - 自由链表无上限：流量尖峰后缓存的块不会自动释放，需要时调用 [`BufferPool::shrink_to_fit`]；
/// - 统计字段之间不做整体原子化，读到的快照在并发下可能瞬时不一致，仅用于观测与测试。
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

impl BufferPool {
    /// 创建默认容量（8000 字节）的空池。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建指定单块容量的空池。
    ///
    /// # Panics
    /// `buffer_capacity` 为 0 时 panic；容量来自已校验的配置，0 属于调用方编程错误。
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        assert!(buffer_capacity > 0, "buffer_capacity must be positive");
        Self {
            inner: Arc::new(PoolInner::new(buffer_capacity)),
        }
    }

    /// 单块缓冲的固定容量。
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// 租借一块缓冲：优先复用自由链表，否则新分配。
    pub fn acquire(&self) -> PooledBuffer {
        self.inner.acquire()
    }

    /// 归还缓冲。
    ///
    /// 句柄按值传入，归还后调用方不再持有任何引用；同一缓冲无法被归还两次。
    /// 缓冲始终回到其来源池，若误传给其他池实例，调试构建下会触发断言。
    pub fn release(&self, buffer: PooledBuffer) {
        debug_assert!(
            buffer.belongs_to(&self.inner),
            "buffer #{} released into a foreign pool",
            buffer.id()
        );
        drop(buffer);
    }

    /// 清空自由链表，返回交还给分配器的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        self.inner.snapshot()
    }

    /// 判断两个句柄是否指向同一个池实例。
    pub fn ptr_eq(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// 池统计快照。
///
/// - `allocated`：当前归池所有的缓冲数（租借中 + 空闲）；
/// - `available`：自由链表中的空闲缓冲数；
/// - `leased`：尚未归还的句柄数；
/// - `created`/`reused`：累计新分配次数与累计复用次数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub buffer_capacity: usize,
    pub allocated: usize,
    pub available: usize,
    pub leased: usize,
    pub created: u64,
    pub reused: u64,
}

pub(crate) struct PoolInner {
    buffer_capacity: usize,
    free_list: SegQueue<FreeSlot>,
    next_id: AtomicU64,
    metrics: PoolMetrics,
}

/// 自由链表中的空闲块，保留编号以便日志追踪同一块内存的复用轨迹。
struct FreeSlot {
    id: u64,
    data: BytesMut,
}

impl PoolInner {
    fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity,
            free_list: SegQueue::new(),
            next_id: AtomicU64::new(0),
            metrics: PoolMetrics::default(),
        }
    }

    pub(crate) fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let (id, data) = match self.free_list.pop() {
            Some(FreeSlot { id, mut data }) => {
                data.clear();
                self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                (id, data)
            }
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                self.metrics.allocated.fetch_add(1, Ordering::Relaxed);
                (id, BytesMut::with_capacity(self.buffer_capacity))
            }
        };
        self.metrics.leased.fetch_add(1, Ordering::Relaxed);
        PooledBuffer::new(id, data, Arc::clone(self))
    }

    /// 由 `PooledBuffer::drop` 调用，将底层内存放回自由链表。
    pub(crate) fn reclaim(&self, id: u64, mut data: BytesMut) {
        saturating_sub(&self.metrics.leased, 1);
        data.clear();
        self.free_list.push(FreeSlot { id, data });
    }

    fn shrink_free_list(&self) -> usize {
        let mut reclaimed = 0;
        let mut dropped = 0;
        while let Some(slot) = self.free_list.pop() {
            reclaimed += slot.data.capacity();
            dropped += 1;
        }
        saturating_sub(&self.metrics.allocated, dropped);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            buffer_capacity: self.buffer_capacity,
            allocated: self.metrics.allocated.load(Ordering::Relaxed),
            available: self.free_list.len(),
            leased: self.metrics.leased.load(Ordering::Relaxed),
            created: self.metrics.created.load(Ordering::Relaxed),
            reused: self.metrics.reused.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated: AtomicUsize,
    leased: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
