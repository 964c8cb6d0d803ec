//! 网络管理：NMT 命令与心跳

use crate::driver::{Driver, Shared};
use crate::error::DriverError;
use crate::transport::FramePriority;
use armbus_can::ArmFrame;
use armbus_protocol::{FunctionCode, NmtCommand, NmtState, cob_id};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 心跳/boot-up 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtEvent {
    pub node_id: u8,
    pub state: NmtState,
}

impl Shared {
    pub(crate) fn handle_heartbeat(&self, frame: ArmFrame) {
        let node = frame.node_id();
        let Some(&raw) = frame.data_slice().first() else {
            warn!("Empty heartbeat from node {}", node);
            return;
        };
        let state = NmtState::from(raw & 0x7F);

        if state == NmtState::BootUp {
            // 重启后驱动器的 PDO 配置已丢失，进行中的请求不会再有应答
            let cleared = self.pdo_table.write().clear_node(node);
            let stale = self.sdo.drop_node(node) + self.interpreter.drop_node(node);
            warn!(
                "Node {} booted up, dropped {} PDO mapping(s) and {} pending request(s)",
                node, cleared, stale
            );
        }

        let previous = self.feedback.load(node).nmt_state;
        if previous != state {
            debug!("Node {} NMT state {:?} -> {:?}", node, previous, state);
        }
        self.feedback.update(node, |fb| fb.nmt_state = state);
        let _ = self.nmt_tx.send(NmtEvent {
            node_id: node,
            state,
        });
    }
}

impl Driver {
    /// 发送 NMT 命令；`node` 为 0 时广播
    pub async fn nmt(&self, command: NmtCommand, node: u8) -> Result<(), DriverError> {
        debug!("NMT {:?} -> node {}", command, node);
        let frame = ArmFrame::new(cob_id(FunctionCode::Nmt, 0), &[command as u8, node]);
        self.shared.enqueue(frame, FramePriority::High).await
    }

    pub fn subscribe_nmt(&self) -> broadcast::Receiver<NmtEvent> {
        self.shared.nmt_tx.subscribe()
    }

    /// 广播复位通信并收集窗口内报告 boot-up 的节点
    ///
    /// `expected` 中的节点全部出现后提前返回。
    pub async fn reset_communication_and_collect(
        &self,
        expected: &[u8],
        window: Duration,
    ) -> Result<BTreeSet<u8>, DriverError> {
        let mut events = self.subscribe_nmt();
        self.nmt(NmtCommand::ResetCommunication, 0).await?;

        let deadline = Instant::now() + window;
        let mut booted = BTreeSet::new();
        while !expected.iter().all(|n| booted.contains(n)) {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) if event.state == NmtState::BootUp => {
                    booted.insert(event.node_id);
                },
                Ok(Ok(_)) => {},
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!("Missed {} NMT event(s) while collecting boot-ups", n);
                },
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(DriverError::ChannelClosed);
                },
                Err(_) => break,
            }
        }
        info!("Boot-up from nodes {:?} (expected {:?})", booted, expected);
        Ok(booted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverBuilder;
    use armbus_can::MockCanBus;
    use armbus_protocol::{MappedObject, PdoSlot};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nmt_frame_layout() {
        let bus = MockCanBus::new();
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();
        driver.nmt(NmtCommand::Start, 3).await.unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent[0].id, 0x000);
        assert_eq!(sent[0].data_slice(), &[0x01, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_collect_boot_ups() {
        let bus = MockCanBus::new();
        bus.set_responder(|frame| {
            if frame.id == 0 && frame.data_slice()[0] == NmtCommand::ResetCommunication as u8 {
                [1u8, 2, 5]
                    .iter()
                    .map(|n| ArmFrame::new(0x700 + *n as u32, &[0x00]))
                    .collect()
            } else {
                vec![]
            }
        });
        let driver = DriverBuilder::new().build(bus).unwrap();

        let booted = driver
            .reset_communication_and_collect(&[1, 2, 3], Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(booted.into_iter().collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(driver.feedback(5).nmt_state, NmtState::BootUp);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_boot_up_clears_pdo_mapping() {
        let bus = MockCanBus::new();
        let driver = DriverBuilder::new().build(bus.clone()).unwrap();
        driver
            .shared
            .pdo_table
            .write()
            .set(4, PdoSlot::Tpdo1, &[MappedObject::new(0x6041, 0, 16)]);

        bus.inject(ArmFrame::new(0x704, &[0x05]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(driver.feedback(4).nmt_state, NmtState::Operational);
        assert!(driver.pdo_mapping(4, PdoSlot::Tpdo1).is_some());

        bus.inject(ArmFrame::new(0x704, &[0x00]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(driver.pdo_mapping(4, PdoSlot::Tpdo1).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_boot_up_fails_pending_sdo() {
        let bus = MockCanBus::new();
        let driver = std::sync::Arc::new(
            DriverBuilder::new()
                .response_timeout(Duration::from_secs(5))
                .build(bus.clone())
                .unwrap(),
        );

        let pending = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.sdo_upload(6, 0x6064, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(driver.shared.sdo.pending(6), 1);

        let start = Instant::now();
        bus.inject(ArmFrame::new(0x706, &[0x00]));
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DriverError::NodeRestarted(6))));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(driver.shared.sdo.pending(6), 0);
    }
}
