//! # Armbus Protocol
//!
//! 多轴实验室机械臂 CAN 总线协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `ids`: CAN ID / 功能码定义
//! - `sdo`: CANopen SDO 命令字、中止码表、分段编码
//! - `pdo`: PDO 通信/映射对象地址与映射码
//! - `emcy`: 紧急帧解析与故障表
//! - `interpreter`: 驱动器二进制解释器 / OS 解释器帧
//! - `ds402`: DS402 运动控制对象字典常量
//!
//! ## 字节序
//!
//! CANopen 使用 Intel（LSB）低位在前（小端字节序）。

pub mod ds402;
pub mod emcy;
pub mod ids;
pub mod interpreter;
pub mod pdo;
pub mod sdo;

pub use emcy::*;
pub use ids::*;
pub use interpreter::*;
pub use pdo::*;
pub use sdo::*;

/// CAN 2.0 标准帧的统一抽象
///
/// 协议层和硬件层之间的中间类型：协议层只构建/解析 `ArmFrame`，
/// CAN 层（`armbus-can`）负责与 SocketCAN 等后端互转。
///
/// - **Copy**：入队时所有权直接移交给传输层
/// - **固定 8 字节**：CANopen 只使用经典 CAN 帧
///
/// ```rust
/// use armbus_protocol::ArmFrame;
///
/// let frame = ArmFrame::new(0x601, &[0x40, 0x41, 0x60, 0x00]);
/// assert_eq!(frame.function_code(), 12);
/// assert_eq!(frame.node_id(), 1);
/// assert_eq!(frame.data_slice(), &[0x40, 0x41, 0x60, 0x00]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmFrame {
    /// 11-bit CAN ID
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 接收时间戳（微秒），0 表示不可用
    pub timestamp_us: u64,
}

impl ArmFrame {
    /// 创建标准帧，超过 8 字节的数据被截断
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id: id & 0x7FF,
            data: fixed_data,
            len: len as u8,
            timestamp_us: 0,
        }
    }

    /// 由功能码和节点号创建帧
    pub fn from_parts(function: FunctionCode, node_id: u8, data: &[u8]) -> Self {
        Self::new(cob_id(function, node_id), data)
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 响应类型（功能码）：`id >> 7`
    pub fn function_code(&self) -> u8 {
        ((self.id >> 7) & 0x0F) as u8
    }

    /// 节点号：`id & 0x7F`
    pub fn node_id(&self) -> u8 {
        (self.id & 0x7F) as u8
    }
}

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: u32 },
}

/// 小端 u16 解析（CANopen 字节序）
pub fn u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// 小端 u32 解析（CANopen 字节序）
pub fn u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
