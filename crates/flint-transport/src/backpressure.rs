/// 出站积压的高水位线判定。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 慢速对端会让出站队列无限增长；传输层选择“断开慢连接”而不是阻塞生产者或无限占用内存；
/// - 把阈值判定集中在一处，连接只需在入队前询问一次。
///
/// ## 逻辑 (How)
/// - `check` 比较入队前的未刷出字节数（排队中 + 在途）与阈值；
/// - 严格大于阈值才触发，恰好等于阈值仍允许入队。
///
/// ## 契约 (What)
/// - **前置条件**：调用方持有连接互斥锁，`pending` 为一致快照；
/// - **后置条件**：返回 `Err` 时调用方必须丢弃本次写入并关闭连接。
///
/// ## 注意事项 (Trade-offs)
/// - 判定发生在入队之前，因此单次大写入可以让积压短暂超过阈值，下一次写入才会触发断开。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HighWaterMark {
    limit: usize,
}

/// 一次越线事件的快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BackpressureTrip {
    pub pending: usize,
    pub limit: usize,
}

impl HighWaterMark {
    pub(crate) fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn check(&self, pending: usize) -> Result<(), BackpressureTrip> {
        if pending > self.limit {
            Err(BackpressureTrip {
                pending,
                limit: self.limit,
            })
        } else {
            Ok(())
        }
    }
}
