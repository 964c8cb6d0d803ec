//! PDO 通信/映射对象
//!
//! - RPDO 通信参数 `0x1400 + n`，映射 `0x1600 + n`
//! - TPDO 通信参数 `0x1800 + n`，映射 `0x1A00 + n`
//! - TPDO 事件触发掩码（厂商对象）`0x2F20:n`

use crate::ids::FunctionCode;

/// COB-ID 中的 PDO 禁用位
pub const PDO_DISABLE_BIT: u32 = 0x8000_0000;

/// TPDO 事件触发掩码对象（子索引 = TPDO 编号）
pub const OBJ_TPDO_EVENT_TRIGGER: u16 = 0x2F20;

/// 传输类型：异步（制造商事件触发）
pub const TRANSMISSION_ASYNC_MANUFACTURER: u8 = 0xFE;
/// 传输类型：异步（设备子协议事件触发）
pub const TRANSMISSION_ASYNC_PROFILE: u8 = 0xFF;

/// PDO 槽位
///
/// 只使用 RPDO1/3/4 与 TPDO1/3/4；PDO2 被二进制解释器占用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PdoSlot {
    Rpdo1,
    Rpdo3,
    Rpdo4,
    Tpdo1,
    Tpdo3,
    Tpdo4,
}

impl PdoSlot {
    /// 所有可配置槽位
    pub const ALL: [PdoSlot; 6] = [
        PdoSlot::Rpdo1,
        PdoSlot::Rpdo3,
        PdoSlot::Rpdo4,
        PdoSlot::Tpdo1,
        PdoSlot::Tpdo3,
        PdoSlot::Tpdo4,
    ];

    /// PDO 编号（1-based）
    pub fn number(self) -> u8 {
        match self {
            PdoSlot::Rpdo1 | PdoSlot::Tpdo1 => 1,
            PdoSlot::Rpdo3 | PdoSlot::Tpdo3 => 3,
            PdoSlot::Rpdo4 | PdoSlot::Tpdo4 => 4,
        }
    }

    pub fn is_transmit(self) -> bool {
        matches!(self, PdoSlot::Tpdo1 | PdoSlot::Tpdo3 | PdoSlot::Tpdo4)
    }

    /// 通信参数对象索引
    pub fn comm_index(self) -> u16 {
        let base = if self.is_transmit() { 0x1800 } else { 0x1400 };
        base + (self.number() - 1) as u16
    }

    /// 映射参数对象索引
    pub fn mapping_index(self) -> u16 {
        let base = if self.is_transmit() { 0x1A00 } else { 0x1600 };
        base + (self.number() - 1) as u16
    }

    /// 该槽位帧使用的功能码
    pub fn function_code(self) -> FunctionCode {
        match self {
            PdoSlot::Rpdo1 => FunctionCode::Rpdo1,
            PdoSlot::Rpdo3 => FunctionCode::Rpdo3,
            PdoSlot::Rpdo4 => FunctionCode::Rpdo4,
            PdoSlot::Tpdo1 => FunctionCode::Tpdo1,
            PdoSlot::Tpdo3 => FunctionCode::Tpdo3,
            PdoSlot::Tpdo4 => FunctionCode::Tpdo4,
        }
    }

    /// 由入站 TPDO 功能码反查槽位
    pub fn from_tpdo_function(code: u8) -> Option<PdoSlot> {
        match code {
            3 => Some(PdoSlot::Tpdo1),
            7 => Some(PdoSlot::Tpdo3),
            9 => Some(PdoSlot::Tpdo4),
            _ => None,
        }
    }
}

/// 映射对象码：`index << 16 | sub_index << 8 | bit_length`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MappedObject(pub u32);

impl MappedObject {
    pub const fn new(index: u16, sub_index: u8, bits: u8) -> Self {
        Self(((index as u32) << 16) | ((sub_index as u32) << 8) | bits as u32)
    }

    pub fn index(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn sub_index(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn bits(self) -> u8 {
        self.0 as u8
    }

    pub fn byte_len(self) -> usize {
        self.bits().div_ceil(8) as usize
    }

    pub fn code(self) -> u32 {
        self.0
    }
}

/// 按映射表把 PDO 负载切成 `(对象, 原始值)`
///
/// 负载不足时只返回已完整覆盖的对象。
pub fn split_pdo_payload(objects: &[MappedObject], payload: &[u8]) -> Vec<(MappedObject, u32)> {
    let mut values = Vec::with_capacity(objects.len());
    let mut offset = 0;
    for obj in objects {
        let len = obj.byte_len();
        if len == 0 || len > 4 || offset + len > payload.len() {
            break;
        }
        let mut raw = [0u8; 4];
        raw[..len].copy_from_slice(&payload[offset..offset + len]);
        values.push((*obj, u32::from_le_bytes(raw)));
        offset += len;
    }
    values
}

/// 按映射表打包 RPDO 负载，超出 8 字节返回 `None`
pub fn pack_pdo_payload(objects: &[MappedObject], values: &[u32]) -> Option<Vec<u8>> {
    let mut payload = Vec::with_capacity(8);
    for (obj, value) in objects.iter().zip(values) {
        let len = obj.byte_len();
        if len == 0 || len > 4 {
            return None;
        }
        payload.extend_from_slice(&value.to_le_bytes()[..len]);
    }
    if payload.len() > 8 {
        return None;
    }
    Some(payload)
}
