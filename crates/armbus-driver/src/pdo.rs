//! PDO 映射配置
//!
//! 映射序列是固定顺序的 SDO 写。任何一步失败都直接返回，PDO 保持禁用、
//! 内存映射表不变；调用方需要从头重试整个序列。

use crate::driver::Driver;
use crate::error::DriverError;
use crate::transport::FramePriority;
use armbus_can::ArmFrame;
use armbus_protocol::{
    ID_SYNC, MappedObject, OBJ_TPDO_EVENT_TRIGGER, PDO_DISABLE_BIT, PdoSlot, ProtocolError,
    TRANSMISSION_ASYNC_MANUFACTURER, cob_id, pack_pdo_payload,
};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, info};

/// 每个槽位最多映射的对象数
pub const MAX_MAPPED_OBJECTS: usize = 4;

/// 单个槽位的映射
pub type SlotMapping = SmallVec<[MappedObject; MAX_MAPPED_OBJECTS]>;

/// 每节点、每槽位的映射对象列表
#[derive(Debug, Clone, Default)]
pub struct PdoMappingTable {
    slots: HashMap<(u8, PdoSlot), SlotMapping>,
}

impl PdoMappingTable {
    pub fn get(&self, node_id: u8, slot: PdoSlot) -> Option<&SlotMapping> {
        self.slots.get(&(node_id, slot))
    }

    pub(crate) fn set(&mut self, node_id: u8, slot: PdoSlot, objects: &[MappedObject]) {
        self.slots
            .insert((node_id, slot), objects.iter().copied().collect());
    }

    /// 清除节点的全部映射（节点重启后映射失效）
    pub(crate) fn clear_node(&mut self, node_id: u8) -> usize {
        let before = self.slots.len();
        self.slots.retain(|(node, _), _| *node != node_id);
        before - self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn validate_objects(slot: PdoSlot, objects: &[MappedObject]) -> Result<(), DriverError> {
    let bits: u32 = objects.iter().map(|o| o.bits() as u32).sum();
    if objects.len() > MAX_MAPPED_OBJECTS || bits > 64 {
        return Err(ProtocolError::InvalidValue {
            field: format!("{:?} mapping", slot),
            value: bits,
        }
        .into());
    }
    Ok(())
}

/// TPDO 映射参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpdoParams {
    /// 事件触发掩码（`0x2F20:n`）
    pub trigger: u32,
    /// 事件定时器（ms，0 = 关闭）
    pub timer_ms: u16,
    /// 禁止时间（100 µs 单位）
    pub inhibit: u16,
}

impl Driver {
    /// 配置 TPDO 映射（9 步）
    ///
    /// 1. COB-ID 置禁用位  2. 映射数清零  3. 传输类型  4. 禁止时间
    /// 5. 事件定时器  6. 厂商事件触发掩码  7. 逐个写入映射对象
    /// 8. 映射数  9. COB-ID 去掉禁用位
    pub async fn map_tpdo(
        &self,
        node: u8,
        slot: PdoSlot,
        objects: &[MappedObject],
        params: TpdoParams,
    ) -> Result<(), DriverError> {
        if !slot.is_transmit() {
            return Err(ProtocolError::InvalidValue {
                field: "TpdoSlot".to_string(),
                value: slot.number() as u32,
            }
            .into());
        }
        validate_objects(slot, objects)?;

        let comm = slot.comm_index();
        let mapping = slot.mapping_index();
        let cob = cob_id(slot.function_code(), node);

        self.sdo_download_u32(node, comm, 1, cob | PDO_DISABLE_BIT).await?;
        self.sdo_download_u8(node, mapping, 0, 0).await?;
        self.sdo_download_u8(node, comm, 2, TRANSMISSION_ASYNC_MANUFACTURER).await?;
        self.sdo_download_u16(node, comm, 3, params.inhibit).await?;
        self.sdo_download_u16(node, comm, 5, params.timer_ms).await?;
        self.sdo_download_u32(node, OBJ_TPDO_EVENT_TRIGGER, slot.number(), params.trigger)
            .await?;
        for (i, object) in objects.iter().enumerate() {
            self.sdo_download_u32(node, mapping, i as u8 + 1, object.code()).await?;
        }
        self.sdo_download_u8(node, mapping, 0, objects.len() as u8).await?;
        self.sdo_download_u32(node, comm, 1, cob).await?;

        self.shared.pdo_table.write().set(node, slot, objects);
        let codes: Vec<u32> = objects.iter().map(|o| o.code()).collect();
        info!("Node {}: {:?} mapped {:08X?}", node, slot, codes);
        Ok(())
    }

    /// 配置 RPDO 映射（6 步，无事件触发）
    pub async fn map_rpdo(
        &self,
        node: u8,
        slot: PdoSlot,
        objects: &[MappedObject],
        transmission_type: u8,
    ) -> Result<(), DriverError> {
        if slot.is_transmit() {
            return Err(ProtocolError::InvalidValue {
                field: "RpdoSlot".to_string(),
                value: slot.number() as u32,
            }
            .into());
        }
        validate_objects(slot, objects)?;

        let comm = slot.comm_index();
        let mapping = slot.mapping_index();
        let cob = cob_id(slot.function_code(), node);

        self.sdo_download_u32(node, comm, 1, cob | PDO_DISABLE_BIT).await?;
        self.sdo_download_u8(node, mapping, 0, 0).await?;
        self.sdo_download_u8(node, comm, 2, transmission_type).await?;
        for (i, object) in objects.iter().enumerate() {
            self.sdo_download_u32(node, mapping, i as u8 + 1, object.code()).await?;
        }
        self.sdo_download_u8(node, mapping, 0, objects.len() as u8).await?;
        self.sdo_download_u32(node, comm, 1, cob).await?;

        self.shared.pdo_table.write().set(node, slot, objects);
        info!("Node {}: {:?} mapped", node, slot);
        Ok(())
    }

    /// 当前映射（副本）
    pub fn pdo_mapping(&self, node: u8, slot: PdoSlot) -> Option<SlotMapping> {
        self.shared.pdo_table.read().get(node, slot).cloned()
    }

    /// 按已记录的 RPDO 映射打包并发送
    pub async fn send_rpdo(
        &self,
        node: u8,
        slot: PdoSlot,
        values: &[u32],
    ) -> Result<(), DriverError> {
        let payload = {
            let table = self.shared.pdo_table.read();
            let objects = table.get(node, slot).ok_or_else(|| {
                DriverError::NotReady(format!("{:?} of node {} is not mapped", slot, node))
            })?;
            if objects.len() != values.len() {
                return Err(ProtocolError::InvalidLength {
                    expected: objects.len(),
                    actual: values.len(),
                }
                .into());
            }
            pack_pdo_payload(objects, values).ok_or_else(|| ProtocolError::InvalidValue {
                field: format!("{:?} payload", slot),
                value: values.len() as u32,
            })?
        };
        let frame = ArmFrame::from_parts(slot.function_code(), node, &payload);
        debug!("RPDO node {} {:?}: {:02X?}", node, slot, payload);
        self.enqueue(frame, FramePriority::High).await
    }

    /// 发送 SYNC（0x080）
    pub async fn send_sync(&self) -> Result<(), DriverError> {
        self.enqueue(ArmFrame::new(ID_SYNC, &[]), FramePriority::High)
            .await
    }
}
