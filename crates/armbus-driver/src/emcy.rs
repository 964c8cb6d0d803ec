//! EMCY 解码与节点故障状态
//!
//! 插补族（`0xFF00` / `0xFF02`）按子码切换节点的队列/指针标志；
//! 其余错误码查静态故障表。需要禁用电机的故障先以 `HardwareFault`
//! 完成所有轴上未决的运动等待，再广播故障事件。

use crate::driver::{Driver, Shared};
use crate::error::DriverError;
use armbus_can::ArmFrame;
use armbus_protocol::{EmcyClass, EmcyFrame, InterpolationEvent, classify_emcy};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// 带读写指针的队列标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlag {
    pub state: bool,
    pub write_pointer: u16,
    pub read_pointer: u16,
}

/// 对外广播的故障事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub node_id: u8,
    pub err_code: u16,
    pub elmo_code: u8,
    pub description: &'static str,
    pub disable_motors: bool,
    pub data1: u16,
    pub data2: u16,
}

/// 节点故障/队列状态，只由 EMCY 解码器修改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFaultState {
    pub queue_low: QueueFlag,
    pub queue_full: QueueFlag,
    pub bad_head_pointer: bool,
    pub motion_terminated: bool,
    pub out_of_modulo: bool,
    pub last_fault: Option<FaultEvent>,
}

impl NodeFaultState {
    /// 是否存在阻止运动的状态
    pub fn blocks_motion(&self) -> bool {
        self.bad_head_pointer
            || self.motion_terminated
            || self.out_of_modulo
            || self.last_fault.as_ref().is_some_and(|f| f.disable_motors)
    }

    /// 应用一帧 EMCY，返回需要对外报告的事件（已抑制的返回 `None`）
    pub fn apply(&mut self, emcy: &EmcyFrame) -> Option<FaultEvent> {
        let class = classify_emcy(emcy.err_code, emcy.elmo_code);
        let (description, disable_motors) = match class {
            EmcyClass::Interpolation(event) => {
                match event {
                    InterpolationEvent::QueueLow => {
                        self.queue_low = QueueFlag {
                            state: true,
                            write_pointer: emcy.data1,
                            read_pointer: emcy.data2,
                        };
                    },
                    InterpolationEvent::QueueFull => {
                        self.queue_full = QueueFlag {
                            state: true,
                            write_pointer: emcy.data1,
                            read_pointer: emcy.data2,
                        };
                    },
                    InterpolationEvent::BadHeadPointer => self.bad_head_pointer = true,
                    InterpolationEvent::MotionTerminated => self.motion_terminated = true,
                    InterpolationEvent::OutOfModulo => self.out_of_modulo = true,
                    InterpolationEvent::BufferUnderflow => {
                        debug!("Node {}: interpolation buffer underflow", emcy.node_id);
                        return None;
                    },
                    InterpolationEvent::Other(_) => {},
                }
                (event.description(), false)
            },
            EmcyClass::Fault {
                description,
                disable_motors,
            } => (description, disable_motors),
        };

        let event = FaultEvent {
            node_id: emcy.node_id,
            err_code: emcy.err_code,
            elmo_code: emcy.elmo_code,
            description,
            disable_motors,
            data1: emcy.data1,
            data2: emcy.data2,
        };
        self.last_fault = Some(event.clone());
        Some(event)
    }
}

/// 全部节点的故障状态
#[derive(Default)]
pub(crate) struct FaultStore {
    nodes: Mutex<HashMap<u8, NodeFaultState>>,
}

impl Shared {
    pub(crate) fn handle_emcy(&self, frame: ArmFrame) {
        // 节点号 0 是 SYNC
        if frame.node_id() == 0 {
            return;
        }
        let emcy = match EmcyFrame::try_from(frame) {
            Ok(emcy) => emcy,
            Err(e) => {
                warn!("Malformed EMCY frame 0x{:03X}: {}", frame.id, e);
                return;
            },
        };

        let event = {
            let mut nodes = self.faults.nodes.lock();
            nodes.entry(emcy.node_id).or_default().apply(&emcy)
        };
        let Some(event) = event else {
            return;
        };

        if event.disable_motors {
            error!(
                "Node {} fault 0x{:04X}: {}",
                event.node_id, event.err_code, event.description
            );
            let cancelled = self.waits.fail_all(|_| DriverError::HardwareFault {
                node: event.node_id,
                description: event.description.to_string(),
            });
            if cancelled > 0 {
                warn!("Fault on node {} cancelled {} motion wait(s)", event.node_id, cancelled);
            }
        } else {
            warn!(
                "Node {} EMCY 0x{:04X}/0x{:02X}: {}",
                event.node_id, event.err_code, event.elmo_code, event.description
            );
        }
        // 无订阅者时发送失败，忽略
        let _ = self.fault_tx.send(event);
    }
}

impl Driver {
    /// 订阅故障事件
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.shared.fault_tx.subscribe()
    }

    /// 节点故障状态快照
    pub fn fault_state(&self, node: u8) -> NodeFaultState {
        self.shared
            .faults
            .nodes
            .lock()
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    /// 清除节点故障状态（故障复位之后）
    pub fn clear_faults(&self, node: u8) {
        self.shared.faults.nodes.lock().remove(&node);
    }
}
