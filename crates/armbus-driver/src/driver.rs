//! `Driver`：传输层与全部协议状态的唯一所有者

use crate::builder::DriverConfig;
use crate::emcy::{FaultEvent, FaultStore};
use crate::error::DriverError;
use crate::interpreter::InterpreterTag;
use crate::nmt::NmtEvent;
use crate::pdo::PdoMappingTable;
use crate::registry::Registry;
use crate::sdo::{SdoLocks, SdoTag};
use crate::state::{FeedbackStore, MotionWaits};
use crate::transport::{
    FramePriority, MetricsSnapshot, Outbound, OutboundQueue, TransportMetrics, rx_loop,
    writer_loop,
};
use armbus_can::{ArmFrame, SplittableAdapter};
use armbus_protocol::{FunctionCode, InterpreterFrame, SdoResponse};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, info, trace, warn};

/// RX 线程 → 分发任务的通道容量
const RX_CHANNEL_CAPACITY: usize = 1024;

/// 分发任务与 API 共享的状态
pub(crate) struct Shared {
    pub config: DriverConfig,
    pub queue: Arc<OutboundQueue>,
    pub metrics: Arc<TransportMetrics>,
    pub sdo: Registry<SdoTag, SdoResponse>,
    pub interpreter: Registry<InterpreterTag, InterpreterFrame>,
    pub sdo_locks: SdoLocks,
    pub pdo_table: RwLock<PdoMappingTable>,
    pub faults: FaultStore,
    pub feedback: FeedbackStore,
    pub waits: MotionWaits,
    pub fault_tx: broadcast::Sender<FaultEvent>,
    pub nmt_tx: broadcast::Sender<NmtEvent>,
}

impl Shared {
    /// 按 `id >> 7` 分流入站帧
    pub(crate) fn dispatch(&self, frame: ArmFrame) {
        trace!("RX 0x{:03X} {:02X?}", frame.id, frame.data_slice());
        match FunctionCode::try_from(frame.function_code()) {
            Ok(FunctionCode::Nmt) => {},
            Ok(FunctionCode::SyncEmcy) => self.handle_emcy(frame),
            Ok(FunctionCode::Tpdo1 | FunctionCode::Tpdo3 | FunctionCode::Tpdo4) => {
                self.handle_tpdo(frame)
            },
            Ok(FunctionCode::Tpdo2) => self.handle_interpreter_response(frame),
            Ok(FunctionCode::SdoResponse) => self.handle_sdo_response(frame),
            Ok(FunctionCode::Heartbeat) => self.handle_heartbeat(frame),
            _ => {
                self.metrics.frames_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Ignoring frame 0x{:03X} (response type {})",
                    frame.id,
                    frame.function_code()
                );
            },
        }
    }

    /// 入队并等待物理发送完成
    pub(crate) async fn enqueue(
        &self,
        frame: ArmFrame,
        priority: FramePriority,
    ) -> Result<(), DriverError> {
        let (done, rx) = oneshot::channel();
        if self.queue.push(priority, Outbound { frame, done }).is_err() {
            return Err(DriverError::ChannelClosed);
        }
        match tokio::time::timeout(self.config.transport.send_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(DriverError::Can(e)),
            Ok(Err(_)) => Err(DriverError::ChannelClosed),
            Err(_) => {
                let timeout = self.config.transport.send_timeout;
                warn!("Frame 0x{:03X} not sent within {:?}", frame.id, timeout);
                Err(DriverError::SendTimeout {
                    id: frame.id,
                    timeout,
                })
            },
        }
    }
}

/// CANopen 主站驱动
///
/// 拥有 CAN 句柄（经传输层）和全部协议状态：关联表、PDO 映射表、
/// 节点故障状态、反馈缓存与运动等待表。
///
/// 协议操作分布在各模块的 `impl Driver` 块中：
/// - [`sdo`](crate::sdo)：SDO 上传/下载
/// - [`pdo`](crate::pdo)：PDO 映射配置
/// - [`emcy`](crate::emcy)：故障查询与订阅
/// - [`interpreter`](crate::interpreter)：二进制 / OS 解释器
/// - [`state`](crate::state)：反馈读取与运动等待
/// - [`nmt`](crate::nmt)：网络管理
pub struct Driver {
    pub(crate) shared: Arc<Shared>,
    is_running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    tasks: Vec<TaskHandle<()>>,
}

impl Driver {
    /// 拆分适配器，启动 RX 线程、写任务和分发任务
    pub(crate) fn start<A>(adapter: A, config: DriverConfig) -> Result<Self, DriverError>
    where
        A: SplittableAdapter,
        A::RxAdapter: Send + 'static,
        A::TxAdapter: Send + 'static,
    {
        let (rx, tx) = adapter.split()?;

        let (fault_tx, _) = broadcast::channel(config.fault_channel_capacity.max(1));
        let (nmt_tx, _) = broadcast::channel(128);
        let shared = Arc::new(Shared {
            config,
            queue: Arc::new(OutboundQueue::new()),
            metrics: Arc::new(TransportMetrics::default()),
            sdo: Registry::new("sdo"),
            interpreter: Registry::new("interpreter"),
            sdo_locks: SdoLocks::default(),
            pdo_table: RwLock::new(PdoMappingTable::default()),
            faults: FaultStore::default(),
            feedback: FeedbackStore::new(),
            waits: MotionWaits::default(),
            fault_tx,
            nmt_tx,
        });

        let is_running = Arc::new(AtomicBool::new(true));
        let (frames_tx, mut frames_rx) = mpsc::channel::<ArmFrame>(RX_CHANNEL_CAPACITY);

        let rx_thread = {
            let is_running = is_running.clone();
            let metrics = shared.metrics.clone();
            std::thread::Builder::new()
                .name("armbus-rx".to_string())
                .spawn(move || rx_loop(rx, frames_tx, is_running, metrics))
                .map_err(|e| DriverError::Can(e.into()))?
        };

        let writer = tokio::spawn(writer_loop(
            tx,
            shared.queue.clone(),
            shared.metrics.clone(),
        ));

        let dispatcher = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames_rx.recv().await {
                    shared.dispatch(frame);
                }
                trace!("Dispatcher exiting: RX channel closed");
            })
        };

        info!("armbus driver started");
        Ok(Self {
            shared,
            is_running,
            rx_thread: Some(rx_thread),
            tasks: vec![writer, dispatcher],
        })
    }

    /// 入队一帧并等待其物理发出（默认 5 s 超时）
    ///
    /// 发送失败只返回给调用者本身。
    pub async fn enqueue(
        &self,
        frame: ArmFrame,
        priority: FramePriority,
    ) -> Result<(), DriverError> {
        self.shared.enqueue(frame, priority).await
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// RX 线程是否仍在运行
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
            && self.rx_thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        self.shared.queue.close();
        for task in &self.tasks {
            task.abort();
        }
        // RX 线程在下一次读超时后自行退出，这里不阻塞运行时
        self.rx_thread.take();
        debug!("armbus driver stopped");
    }
}
