//! 节点反馈与运动等待
//!
//! TPDO 按 PDO 映射表解码后写入每节点的 `ArcSwap<NodeFeedback>`
//! （只有分发任务写，读取无锁）；随后检查该节点的运动等待条件。

use crate::driver::{Driver, Shared};
use crate::error::DriverError;
use arc_swap::ArcSwap;
use armbus_can::ArmFrame;
use armbus_protocol::ds402::{
    OBJ_DIGITAL_INPUTS, OBJ_POSITION_ACTUAL, OBJ_STATUSWORD, OBJ_VELOCITY_ACTUAL, StatusWord,
};
use armbus_protocol::{MAX_NODE_ID, NmtState, PdoSlot, split_pdo_payload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// 节点反馈（来自 TPDO / 心跳）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeFeedback {
    pub status_word: Option<u16>,
    pub position: Option<i32>,
    pub velocity: Option<i32>,
    pub digital_inputs: Option<u32>,
    pub nmt_state: NmtState,
    /// 最近一次更新的接收时间戳（微秒）
    pub timestamp_us: u64,
}

impl NodeFeedback {
    pub fn status(&self) -> Option<StatusWord> {
        self.status_word.map(StatusWord::from)
    }
}

/// 每节点反馈缓存（节点号 0..=127）
pub(crate) struct FeedbackStore {
    nodes: Box<[ArcSwap<NodeFeedback>]>,
}

impl FeedbackStore {
    pub fn new() -> Self {
        let nodes = (0..=MAX_NODE_ID)
            .map(|_| ArcSwap::from_pointee(NodeFeedback::default()))
            .collect();
        Self { nodes }
    }

    pub fn load(&self, node_id: u8) -> Arc<NodeFeedback> {
        self.nodes[(node_id & MAX_NODE_ID) as usize].load_full()
    }

    /// 读-改-写（单写者：分发任务）
    pub fn update(&self, node_id: u8, f: impl FnOnce(&mut NodeFeedback)) -> NodeFeedback {
        let slot = &self.nodes[(node_id & MAX_NODE_ID) as usize];
        let mut next = **slot.load();
        f(&mut next);
        slot.store(Arc::new(next));
        next
    }
}

/// 运动等待条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// 状态字 target reached 置位
    TargetReached,
    /// 数字输入 `mask` 达到给定电平
    InputLevel { mask: u32, active: bool },
}

impl WaitCondition {
    fn evaluate(&self, feedback: &NodeFeedback) -> Option<Result<(), String>> {
        if let Some(status) = feedback.status()
            && status.fault()
        {
            return Some(Err("drive fault bit set in statusword".to_string()));
        }
        match *self {
            WaitCondition::TargetReached => feedback
                .status()
                .filter(|s| s.target_reached())
                .map(|_| Ok(())),
            WaitCondition::InputLevel { mask, active } => feedback
                .digital_inputs
                .filter(|inputs| (inputs & mask != 0) == active)
                .map(|_| Ok(())),
        }
    }
}

struct WaitEntry {
    condition: WaitCondition,
    tx: oneshot::Sender<Result<(), DriverError>>,
}

/// 每轴运动等待表
#[derive(Default)]
pub(crate) struct MotionWaits {
    entries: Mutex<HashMap<u8, WaitEntry>>,
}

impl MotionWaits {
    /// 注册等待；该轴已有存活的等待时返回 `WaitAlreadyPending`
    pub fn register(
        &self,
        node_id: u8,
        condition: WaitCondition,
    ) -> Result<oneshot::Receiver<Result<(), DriverError>>, DriverError> {
        let mut entries = self.entries.lock();
        if entries.get(&node_id).is_some_and(|e| !e.tx.is_closed()) {
            return Err(DriverError::WaitAlreadyPending(node_id));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(node_id, WaitEntry { condition, tx });
        Ok(rx)
    }

    /// 用新反馈检查该轴的等待
    pub fn check(&self, node_id: u8, feedback: &NodeFeedback) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&node_id) else {
            return;
        };
        let Some(outcome) = entry.condition.evaluate(feedback) else {
            return;
        };
        if let Some(entry) = entries.remove(&node_id) {
            let result = outcome.map_err(|description| DriverError::HardwareFault {
                node: node_id,
                description,
            });
            trace!("Motion wait on node {} resolved: {:?}", node_id, result.is_ok());
            let _ = entry.tx.send(result);
        }
    }

    /// 以错误完成所有等待，返回实际唤醒的数量
    pub fn fail_all(&self, error: impl Fn(u8) -> DriverError) -> usize {
        let drained: Vec<(u8, WaitEntry)> = self.entries.lock().drain().collect();
        drained
            .into_iter()
            .map(|(node, entry)| entry.tx.send(Err(error(node))).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    pub fn cancel(&self, node_id: u8) -> bool {
        self.entries.lock().remove(&node_id).is_some()
    }
}

/// 已注册的运动等待
///
/// 必须在发出运动命令之前注册，避免错过完成帧。
#[derive(Debug)]
pub struct MotionWait {
    node_id: u8,
    rx: oneshot::Receiver<Result<(), DriverError>>,
}

impl MotionWait {
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// 等待完成；EMCY 故障会提前以 `HardwareFault` 唤醒
    pub async fn wait(self, timeout: Duration) -> Result<(), DriverError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::ChannelClosed),
            Err(_) => {
                debug!("Motion wait on node {} timed out after {:?}", self.node_id, timeout);
                Err(DriverError::Timeout)
            },
        }
    }
}

impl Shared {
    pub(crate) fn handle_tpdo(&self, frame: ArmFrame) {
        let node = frame.node_id();
        let Some(slot) = PdoSlot::from_tpdo_function(frame.function_code()) else {
            return;
        };
        let values = {
            let table = self.pdo_table.read();
            match table.get(node, slot) {
                Some(objects) => split_pdo_payload(objects, frame.data_slice()),
                None => {
                    self.metrics.frames_ignored.fetch_add(1, Ordering::Relaxed);
                    debug!("Unmapped {:?} from node {}", slot, node);
                    return;
                },
            }
        };

        let feedback = self.feedback.update(node, |fb| {
            for (object, raw) in &values {
                match object.index() {
                    OBJ_STATUSWORD => fb.status_word = Some(*raw as u16),
                    OBJ_POSITION_ACTUAL => fb.position = Some(*raw as i32),
                    OBJ_VELOCITY_ACTUAL => fb.velocity = Some(*raw as i32),
                    OBJ_DIGITAL_INPUTS => fb.digital_inputs = Some(*raw),
                    _ => {},
                }
            }
            fb.timestamp_us = frame.timestamp_us;
        });
        self.waits.check(node, &feedback);
    }
}

impl Driver {
    /// 节点最新反馈
    pub fn feedback(&self, node: u8) -> NodeFeedback {
        *self.shared.feedback.load(node)
    }

    /// 为轴注册运动等待
    pub fn register_motion_wait(
        &self,
        node: u8,
        condition: WaitCondition,
    ) -> Result<MotionWait, DriverError> {
        let rx = self.shared.waits.register(node, condition)?;
        Ok(MotionWait { node_id: node, rx })
    }

    /// 取消该轴的等待（等待方收到 `ChannelClosed`）
    pub fn cancel_motion_wait(&self, node: u8) -> bool {
        self.shared.waits.cancel(node)
    }
}
