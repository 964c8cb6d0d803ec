//! 内存 CAN 总线（测试用）
//!
//! `MockCanBus` 可克隆：一份交给驱动（拆分为 RX/TX），一份留在测试里
//! 注入入站帧、检查已发送帧。可选的应答器在每次发送后同步生成应答帧，
//! 用来模拟驱动器固件。

use crate::{ArmFrame, CanAdapter, CanError, RxAdapter, SplittableAdapter, TxAdapter};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 应答器：根据发出的帧生成入站帧
pub type Responder = Box<dyn FnMut(&ArmFrame) -> Vec<ArmFrame> + Send>;

struct MockInner {
    rx_queue: Mutex<VecDeque<ArmFrame>>,
    rx_ready: Condvar,
    sent: Mutex<Vec<ArmFrame>>,
    responder: Mutex<Option<Responder>>,
    failing_sends: AtomicUsize,
    send_delay: Mutex<Duration>,
    read_timeout: Duration,
}

/// 内存 CAN 总线
#[derive(Clone)]
pub struct MockCanBus {
    inner: Arc<MockInner>,
}

impl Default for MockCanBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCanBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                rx_queue: Mutex::new(VecDeque::new()),
                rx_ready: Condvar::new(),
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                failing_sends: AtomicUsize::new(0),
                send_delay: Mutex::new(Duration::ZERO),
                read_timeout: Duration::from_millis(2),
            }),
        }
    }

    /// 设置应答器
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&ArmFrame) -> Vec<ArmFrame> + Send + 'static,
    {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// 注入一帧入站数据
    pub fn inject(&self, frame: ArmFrame) {
        self.inner.rx_queue.lock().push_back(frame);
        self.inner.rx_ready.notify_all();
    }

    /// 已发送帧快照
    pub fn sent_frames(&self) -> Vec<ArmFrame> {
        self.inner.sent.lock().clone()
    }

    /// 取走已发送帧
    pub fn take_sent_frames(&self) -> Vec<ArmFrame> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    /// 之后的 `count` 次发送失败
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// 模拟物理发送耗时
    pub fn set_send_delay(&self, delay: Duration) {
        *self.inner.send_delay.lock() = delay;
    }

    fn transmit(&self, frame: ArmFrame) -> Result<(), CanError> {
        let delay = *self.inner.send_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let failing = self.inner.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner
                .failing_sends
                .store(failing - 1, Ordering::SeqCst);
            return Err(CanError::BusOff);
        }

        self.inner.sent.lock().push(frame);

        let responses = match self.inner.responder.lock().as_mut() {
            Some(responder) => responder(&frame),
            None => Vec::new(),
        };
        if !responses.is_empty() {
            self.inner.rx_queue.lock().extend(responses);
            self.inner.rx_ready.notify_all();
        }
        Ok(())
    }

    fn next_frame(&self, timeout: Duration) -> Result<ArmFrame, CanError> {
        let mut queue = self.inner.rx_queue.lock();
        if queue.is_empty() {
            self.inner.rx_ready.wait_for(&mut queue, timeout);
        }
        queue.pop_front().ok_or(CanError::Timeout)
    }
}

impl CanAdapter for MockCanBus {
    fn send(&mut self, frame: ArmFrame) -> Result<(), CanError> {
        self.transmit(frame)
    }

    fn receive(&mut self) -> Result<ArmFrame, CanError> {
        self.next_frame(self.inner.read_timeout)
    }
}

/// 接收半部
pub struct MockRxAdapter {
    bus: MockCanBus,
}

/// 发送半部
pub struct MockTxAdapter {
    bus: MockCanBus,
}

impl RxAdapter for MockRxAdapter {
    fn receive(&mut self) -> Result<ArmFrame, CanError> {
        self.bus.next_frame(self.bus.inner.read_timeout)
    }
}

impl TxAdapter for MockTxAdapter {
    fn send(&mut self, frame: ArmFrame) -> Result<(), CanError> {
        self.bus.transmit(frame)
    }
}

impl SplittableAdapter for MockCanBus {
    type RxAdapter = MockRxAdapter;
    type TxAdapter = MockTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        Ok((
            MockRxAdapter { bus: self.clone() },
            MockTxAdapter { bus: self },
        ))
    }
}
