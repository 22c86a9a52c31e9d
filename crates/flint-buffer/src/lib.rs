//! `flint-buffer` 提供传输层使用的定长缓冲池。
//!
//! # 模块定位（Why）
//! - 出站写路径需要频繁申请、归还固定大小的字节块，直接走全局分配器会带来抖动；
//! - 池实例显式化（不使用文件级静态变量），使多个连接组、多个测试可以各自持有独立的池。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`BufferPool`]：自由链表基于 `crossbeam_queue::SegQueue`，
//!   租借与归还均为无锁操作，任意线程调用都不会阻塞；
//! - `pooled_buffer` 模块实现 [`PooledBuffer`]：唯一所有权句柄，不可克隆，
//!   归还即消费句柄，重复归还在编译期即被拒绝；句柄被丢弃时同样回到所属池，杜绝泄漏。
//!
//! # 契约（What）
//! - 所有公开类型满足 `Send + Sync + 'static`（`PooledBuffer` 为 `Send`），可跨线程移交；
//! - 从自由链表取出的缓冲一定已清空（`len() == 0`）。

mod pool;
mod pooled_buffer;

pub use pool::{BufferPool, DEFAULT_BUFFER_CAPACITY, PoolStats};
pub use pooled_buffer::PooledBuffer;
