//! 驱动层错误类型定义

use armbus_can::CanError;
use armbus_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// CAN 驱动错误（物理发送/接收失败）
    #[error("CAN driver error: {0}")]
    Can(#[from] CanError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 帧未能在发送超时内发出（传输层错误）
    #[error("Frame 0x{id:03X} not sent within {timeout:?}")]
    SendTimeout { id: u32, timeout: Duration },

    /// 等待应答或状态超时
    #[error("Operation timeout")]
    Timeout,

    /// SDO 应答超时
    #[error("SDO timeout on node {node} object 0x{index:04X}:{sub_index}")]
    SdoTimeout { node: u8, index: u16, sub_index: u8 },

    /// 对端返回 SDO 中止码
    #[error("SDO abort 0x{code:08X} on node {node} object 0x{index:04X}:{sub_index}: {message}")]
    SdoAbort {
        node: u8,
        index: u16,
        sub_index: u8,
        code: u32,
        message: &'static str,
    },

    /// SDO 协议错误（toggle 不匹配、段格式错误等）
    #[error("SDO protocol error on node {node}: {reason}")]
    SdoProtocol { node: u8, reason: String },

    /// 解释器写入回显与设定值不一致
    #[error("Echo mismatch for {command}: expected {expected}, got {actual}")]
    CommandMismatch {
        command: String,
        expected: String,
        actual: String,
    },

    /// 解释器命令在全部尝试后失败
    #[error("Command {command}[{index}] failed on node {node}: {source}")]
    Command {
        command: String,
        index: u16,
        node: u8,
        #[source]
        source: Box<DriverError>,
    },

    /// OS 解释器报告执行错误
    #[error("OS command {command:?} failed on node {node}: {message}")]
    OsCommand {
        node: u8,
        command: String,
        message: String,
    },

    /// 硬件故障（EMCY 表或驱动器故障位）
    #[error("Hardware fault on node {node}: {description}")]
    HardwareFault { node: u8, description: String },

    /// 前置条件不满足
    #[error("Not ready: {0}")]
    NotReady(String),

    /// 请求等待期间节点重启（boot-up），待决请求被丢弃
    #[error("Node {0} restarted while a request was pending")]
    NodeRestarted(u8),

    /// 同一轴上已有未完成的运动等待
    #[error("Motion wait already pending for node {0}")]
    WaitAlreadyPending(u8),

    /// 传输任务已退出
    #[error("Transport channel closed")]
    ChannelClosed,
}

impl DriverError {
    /// 是否为超时类错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout | DriverError::SdoTimeout { .. })
    }

    /// 是否为传输层错误（物理发送失败或发送超时）
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Can(_) | DriverError::SendTimeout { .. })
    }
}
