//! CAN ID / 功能码定义
//!
//! 11-bit 标识符 = `(function_code << 7) | node_id`。

use crate::ProtocolError;

/// CANopen 功能码（CAN ID 高 4 位）
///
/// EMCY 与 SYNC 共用功能码 1：节点号为 0 时是 SYNC。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    /// 网络管理（0x000）
    Nmt = 0,
    /// SYNC（0x080）/ EMCY（0x080 + node）
    SyncEmcy = 1,
    /// TPDO1（0x180 + node）
    Tpdo1 = 3,
    /// RPDO1（0x200 + node）
    Rpdo1 = 4,
    /// TPDO2（0x280 + node），二进制解释器应答
    Tpdo2 = 5,
    /// RPDO2（0x300 + node），二进制解释器请求
    Rpdo2 = 6,
    /// TPDO3（0x380 + node）
    Tpdo3 = 7,
    /// RPDO3（0x400 + node）
    Rpdo3 = 8,
    /// TPDO4（0x480 + node）
    Tpdo4 = 9,
    /// RPDO4（0x500 + node）
    Rpdo4 = 10,
    /// SDO 应答，节点 → 主站（0x580 + node）
    SdoResponse = 11,
    /// SDO 请求，主站 → 节点（0x600 + node）
    SdoRequest = 12,
    /// 心跳 / Boot-up（0x700 + node）
    Heartbeat = 14,
}

/// 节点号最大值（7 bit）
pub const MAX_NODE_ID: u8 = 0x7F;

/// SYNC 帧 ID
pub const ID_SYNC: u32 = 0x080;

/// 组地址：一帧广播到整个轴组
pub const GROUP_NODE_ID: u8 = 10;

/// 组合 CAN ID
pub fn cob_id(function: FunctionCode, node_id: u8) -> u32 {
    ((function as u32) << 7) | (node_id & MAX_NODE_ID) as u32
}

/// 拆分 CAN ID 为 (功能码, 节点号)
pub fn split_cob_id(id: u32) -> Result<(FunctionCode, u8), ProtocolError> {
    let code = ((id >> 7) & 0x0F) as u8;
    let function =
        FunctionCode::try_from(code).map_err(|_| ProtocolError::InvalidCanId { id })?;
    Ok((function, (id & 0x7F) as u8))
}

/// NMT 命令字
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    PreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// 心跳帧中的节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, num_enum::FromPrimitive)]
#[repr(u8)]
pub enum NmtState {
    /// Boot-up 报文（驱动器重启）
    BootUp = 0x00,
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7F,
    #[default]
    Unknown = 0xFF,
}
