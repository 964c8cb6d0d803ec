//! 帧传输层
//!
//! - **TX**：双优先级出站队列 + 写任务。写任务把阻塞的 `TxAdapter::send`
//!   放到 `spawn_blocking` 中执行，发送结果通过 oneshot 只回给入队者。
//! - **RX**：专用 OS 线程循环调用阻塞的 `RxAdapter::receive`，把帧转发给
//!   tokio `mpsc` 通道，由异步分发任务按功能码分流。
//!
//! 高优先级帧总是先于低优先级帧发出；同优先级保持 FIFO。
//! 已经开始的物理发送不会被打断。

use armbus_can::{ArmFrame, CanError, RxAdapter, TxAdapter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{error, trace, warn};

/// 帧优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramePriority {
    /// 运动/安全相关帧（NMT、SYNC、RPDO）
    High,
    /// 配置与查询帧（SDO、解释器）
    #[default]
    Low,
}

/// 传输层配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportConfig {
    /// 入队到物理发送完成的最长等待
    pub send_timeout: Duration,
    /// RX 线程单次阻塞读超时
    pub receive_timeout: Duration,
    /// 请求/应答交换的默认超时
    pub response_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_millis(2),
            response_timeout: Duration::from_secs(1),
        }
    }
}

/// 入队的帧与其完成信号
pub(crate) struct Outbound {
    pub frame: ArmFrame,
    pub done: oneshot::Sender<Result<(), CanError>>,
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<Outbound>,
    low: VecDeque<Outbound>,
    closed: bool,
}

/// 双优先级出站队列
#[derive(Default)]
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队；队列已关闭时把条目原样退回
    pub fn push(&self, priority: FramePriority, item: Outbound) -> Result<(), Outbound> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            match priority {
                FramePriority::High => state.high.push_back(item),
                FramePriority::Low => state.low.push_back(item),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// 取出下一帧：先高后低
    pub fn pop(&self) -> Option<Outbound> {
        let mut state = self.state.lock();
        state.high.pop_front().or_else(|| state.low.pop_front())
    }

    /// 等待下一帧；队列关闭且已排空时返回 `None`
    pub async fn next(&self) -> Option<Outbound> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.state.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// 关闭队列，尚未发送的帧以 `NotStarted` 失败
    pub fn close(&self) {
        let drained: Vec<Outbound> = {
            let mut state = self.state.lock();
            state.closed = true;
            let mut drained: Vec<Outbound> = state.high.drain(..).collect();
            drained.extend(state.low.drain(..));
            drained
        };
        for item in drained {
            let _ = item.done.send(Err(CanError::NotStarted));
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.high.len() + state.low.len()
    }
}

/// 传输层计数器
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub frames_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_ignored: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// 计数器快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub send_errors: u64,
    pub frames_received: u64,
    pub frames_ignored: u64,
    pub receive_errors: u64,
}

impl TransportMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// 写任务：按优先级排空出站队列
///
/// 适配器所有权在每次发送时移入阻塞任务并随结果一起取回，
/// 因此同一时刻只有一次物理发送在进行。
pub(crate) async fn writer_loop<T>(
    mut tx: T,
    queue: Arc<OutboundQueue>,
    metrics: Arc<TransportMetrics>,
) where
    T: TxAdapter + Send + 'static,
{
    while let Some(Outbound { frame, done }) = queue.next().await {
        let joined = tokio::task::spawn_blocking(move || {
            let result = tx.send(frame);
            (tx, result)
        })
        .await;

        let (adapter, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!("TX blocking task failed: {}", e);
                let _ = done.send(Err(CanError::NotStarted));
                queue.close();
                return;
            },
        };
        tx = adapter;

        match &result {
            Ok(()) => {
                metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                trace!("TX 0x{:03X} {:02X?}", frame.id, frame.data_slice());
            },
            Err(e) => {
                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("TX 0x{:03X} failed: {}", frame.id, e);
            },
        }
        // 入队者可能已超时离开
        let _ = done.send(result);
    }
    trace!("TX writer exiting: queue closed");
}

/// RX 线程主循环
pub(crate) fn rx_loop(
    mut rx: impl RxAdapter,
    frames: mpsc::Sender<ArmFrame>,
    is_running: Arc<AtomicBool>,
    metrics: Arc<TransportMetrics>,
) {
    while is_running.load(Ordering::Acquire) {
        let frame = match rx.receive() {
            Ok(frame) => frame,
            Err(CanError::Timeout) => continue,
            Err(CanError::Device(e)) if e.is_fatal() => {
                error!("RX thread: fatal device error: {}", e);
                metrics.receive_errors.fetch_add(1, Ordering::Relaxed);
                break;
            },
            Err(e) => {
                warn!("RX thread: receive error: {}", e);
                metrics.receive_errors.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(10));
                continue;
            },
        };

        metrics.frames_received.fetch_add(1, Ordering::Relaxed);
        if frames.blocking_send(frame).is_err() {
            trace!("RX thread: dispatcher gone, exiting");
            break;
        }
    }
    trace!("RX thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(id: u32) -> (Outbound, oneshot::Receiver<Result<(), CanError>>) {
        let (done, rx) = oneshot::channel();
        (
            Outbound {
                frame: ArmFrame::new(id, &[]),
                done,
            },
            rx,
        )
    }

    #[test]
    fn test_high_priority_drains_first() {
        let queue = OutboundQueue::new();
        let (low, _r1) = outbound(0x601);
        let (high, _r2) = outbound(0x000);
        queue.push(FramePriority::Low, low).ok().unwrap();
        queue.push(FramePriority::High, high).ok().unwrap();

        assert_eq!(queue.pop().unwrap().frame.id, 0x000);
        assert_eq!(queue.pop().unwrap().frame.id, 0x601);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let queue = OutboundQueue::new();
        let mut keep = Vec::new();
        for id in [0x601, 0x602, 0x603] {
            let (item, rx) = outbound(id);
            keep.push(rx);
            queue.push(FramePriority::Low, item).ok().unwrap();
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(|o| o.frame.id).collect();
        assert_eq!(order, vec![0x601, 0x602, 0x603]);
    }

    #[test]
    fn test_close_fails_pending_and_rejects_new() {
        let queue = OutboundQueue::new();
        let (item, mut rx) = outbound(0x601);
        queue.push(FramePriority::Low, item).ok().unwrap();
        queue.close();

        assert!(matches!(rx.try_recv(), Ok(Err(CanError::NotStarted))));
        let (item, _rx) = outbound(0x602);
        assert!(queue.push(FramePriority::High, item).is_err());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.map(|o| o.frame.id) })
        };
        tokio::task::yield_now().await;
        let (item, _rx) = outbound(0x080);
        queue.push(FramePriority::High, item).ok().unwrap();
        assert_eq!(waiter.await.unwrap(), Some(0x080));
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_secs(1));
    }
}
