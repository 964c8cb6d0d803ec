//! EMCY 紧急帧解析
//!
//! 帧布局（小端）：
//!
//! ```text
//! Byte 0-1: err_code (u16)
//! Byte 2  : err_reg  (u8)
//! Byte 3  : elmo_code (u8)，厂商子码
//! Byte 4-5: data1 (u16)
//! Byte 6-7: data2 (u16)
//! ```

use crate::{ArmFrame, ProtocolError, u16_le};

/// DS402 插补模式故障族（厂商定义）
pub const EMCY_INTERPOLATION: u16 = 0xFF00;
/// DS402 插补模式故障族（第二组，含缓冲区下溢提示）
pub const EMCY_INTERPOLATION_EXT: u16 = 0xFF02;

/// 插补子码：队列低水位
pub const IP_QUEUE_LOW: u8 = 0x56;
/// 插补子码：队列满
pub const IP_QUEUE_FULL: u8 = 0x34;
/// 插补子码：头指针错误
pub const IP_BAD_HEAD_POINTER: u8 = 0x5B;
/// 插补子码：运动终止
pub const IP_MOTION_TERMINATED: u8 = 0x5D;
/// 插补子码：超出模数范围
pub const IP_OUT_OF_MODULO: u8 = 0x5E;
/// 插补子码：缓冲区下溢（仅提示，不上报）
pub const IP_BUFFER_UNDERFLOW: u8 = 0x8A;

/// EMCY 帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyFrame {
    pub node_id: u8,
    pub err_code: u16,
    pub err_reg: u8,
    pub elmo_code: u8,
    pub data1: u16,
    pub data2: u16,
}

impl TryFrom<ArmFrame> for EmcyFrame {
    type Error = ProtocolError;

    fn try_from(frame: ArmFrame) -> Result<Self, Self::Error> {
        if frame.function_code() != 1 || frame.node_id() == 0 {
            return Err(ProtocolError::InvalidCanId { id: frame.id });
        }
        if frame.len < 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: frame.len as usize,
            });
        }
        let d = &frame.data;
        Ok(Self {
            node_id: frame.node_id(),
            err_code: u16_le(d, 0),
            err_reg: d[2],
            elmo_code: d[3],
            data1: u16_le(d, 4),
            data2: u16_le(d, 6),
        })
    }
}

/// 插补模式事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationEvent {
    QueueLow,
    QueueFull,
    BadHeadPointer,
    MotionTerminated,
    OutOfModulo,
    BufferUnderflow,
    Other(u8),
}

impl From<u8> for InterpolationEvent {
    fn from(code: u8) -> Self {
        match code {
            IP_QUEUE_LOW => InterpolationEvent::QueueLow,
            IP_QUEUE_FULL => InterpolationEvent::QueueFull,
            IP_BAD_HEAD_POINTER => InterpolationEvent::BadHeadPointer,
            IP_MOTION_TERMINATED => InterpolationEvent::MotionTerminated,
            IP_OUT_OF_MODULO => InterpolationEvent::OutOfModulo,
            IP_BUFFER_UNDERFLOW => InterpolationEvent::BufferUnderflow,
            other => InterpolationEvent::Other(other),
        }
    }
}

impl InterpolationEvent {
    pub fn description(self) -> &'static str {
        match self {
            InterpolationEvent::QueueLow => "Interpolation queue low",
            InterpolationEvent::QueueFull => "Interpolation queue full",
            InterpolationEvent::BadHeadPointer => "Interpolation bad head pointer",
            InterpolationEvent::MotionTerminated => "Interpolated motion terminated",
            InterpolationEvent::OutOfModulo => "Interpolation position out of modulo range",
            InterpolationEvent::BufferUnderflow => "Interpolation buffer underflow",
            InterpolationEvent::Other(_) => "Unknown interpolation event",
        }
    }
}

/// EMCY 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmcyClass {
    /// 0xFF00 / 0xFF02 插补族
    Interpolation(InterpolationEvent),
    /// 查表得到的故障
    Fault {
        description: &'static str,
        disable_motors: bool,
    },
}

/// 故障表：`err_code → (描述, 是否禁用电机)`
const EMCY_TABLE: &[(u16, &str, bool)] = &[
    (0x0000, "Error reset or no error", false),
    (0x1000, "Generic error", true),
    (
        0x2340,
        "Short circuit: the motor or its wiring may be defective, or the drive is faulty",
        true,
    ),
    (
        0x3120,
        "Under-voltage: the power supply is shut down or it has too high an output impedance",
        true,
    ),
    (
        0x3310,
        "Over-voltage: supply too high, or braking energy could not be absorbed",
        true,
    ),
    (0x4310, "Temperature: the drive is overheating", true),
    (0x5280, "ECAM table problem", false),
    (0x5441, "Motor disabled by the inhibit switch input", true),
    (0x6180, "Fatal CPU error: stack overflow", true),
    (0x6181, "CPU exception: fatal exception", true),
    (0x6200, "User program aborted by an error", false),
    (
        0x6300,
        "RPDO-mapped object failed during interpretation, or a referenced motion failed",
        false,
    ),
    (
        0x7121,
        "Motor stuck: powered but not moving as defined by CL[2] and CL[3]",
        true,
    ),
    (0x7300, "Feedback error: resolver or analog encoder feedback failed", true),
    (
        0x7380,
        "Two digital Hall sensors changed at once; only one sensor can be changed at a time",
        true,
    ),
    (0x8110, "CAN message lost (corrupted or overrun)", false),
    (0x8130, "Heartbeat event", true),
    (0x8200, "Protocol error (unrecognized NMT request)", false),
    (0x8210, "Attempt to access an unconfigured RPDO", false),
    (0x8311, "Peak current has been exceeded", true),
    (
        0x8380,
        "Cannot find the electrical zero of the motor when starting with an incremental encoder",
        true,
    ),
    (0x8381, "Cannot tune the current offsets", true),
    (0x8480, "Speed tracking error exceeded", true),
    (0x8481, "Speed limit exceeded", true),
    (0x8611, "Position tracking error exceeded", true),
    (0x8680, "Position limit exceeded", true),
    (0xFF10, "Cannot start the motor", true),
];

/// 未知故障描述
pub const UNKNOWN_EMCY: &str = "Unknown EMCY";

/// 按 `(err_code, elmo_code)` 分类
pub fn classify_emcy(err_code: u16, elmo_code: u8) -> EmcyClass {
    if err_code == EMCY_INTERPOLATION || err_code == EMCY_INTERPOLATION_EXT {
        let event = match InterpolationEvent::from(elmo_code) {
            // 缓冲下溢只在 0xFF02 下抑制
            InterpolationEvent::BufferUnderflow if err_code != EMCY_INTERPOLATION_EXT => {
                InterpolationEvent::Other(elmo_code)
            },
            event => event,
        };
        return EmcyClass::Interpolation(event);
    }
    EMCY_TABLE
        .iter()
        .find(|(code, _, _)| *code == err_code)
        .map(|(_, description, disable_motors)| EmcyClass::Fault {
            description,
            disable_motors: *disable_motors,
        })
        .unwrap_or(EmcyClass::Fault {
            description: UNKNOWN_EMCY,
            disable_motors: false,
        })
}
