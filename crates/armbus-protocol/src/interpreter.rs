//! 驱动器固件命令语言
//!
//! ## 二进制解释器
//!
//! 请求经 RPDO2（`0x300 + node`）发出，应答来自 TPDO2（`0x280 + node`）：
//!
//! ```text
//! Byte 0  : 命令首字母（ASCII）
//! Byte 1  : 命令末字母（ASCII）
//! Byte 2  : 索引低 8 位
//! Byte 3  : bit 0-5 索引高 6 位，bit 6 查询标志，bit 7 浮点标志
//! Byte 4-7: 小端 i32 / f32 数值
//! ```
//!
//! ## OS 解释器
//!
//! 较长的文本命令（如 `XQ##HOME`）经对象 `0x1023` 分段下载执行。

use crate::{ArmFrame, ProtocolError, u32_le};
use crate::ids::{FunctionCode, cob_id};

/// 索引最大值（14 bit）
pub const MAX_REGISTER_INDEX: u16 = 0x3FFF;

/// 浮点回显比较的相对容差
pub const FLOAT_ECHO_TOLERANCE: f32 = 0.01;

/// 驱动器两字母寄存器/命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// 加速度
    Ac,
    /// 开始运动
    Bg,
    /// 减速度
    Dc,
    /// 急停减速度
    Sd,
    /// 速度
    Sp,
    /// 绝对目标位置
    Pa,
    /// 相对目标位置
    Pr,
    /// 主位置
    Px,
    /// 主速度
    Vx,
    /// 停止运动
    St,
    /// 电机使能
    Mo,
    /// 运动状态
    Ms,
    /// 电机故障
    Mf,
    /// 状态寄存器
    Sr,
    /// 保存参数到 Flash
    Sv,
    /// 归零参数
    Hm,
    /// 输入逻辑
    Il,
    /// 数字输入
    Ip,
    /// 数字输出
    Op,
    /// 终止用户程序
    Kl,
    /// 单位模式
    Um,
    /// 用户整型变量
    Ui,
    /// 用户浮点变量
    Uf,
    /// 软件上限
    Vh,
    /// 软件下限
    Vl,
    /// 硬件上限
    Hl,
    /// 硬件下限
    Ll,
    /// 模数范围
    Xm,
    /// 错误寄存器
    Er,
    /// 保护参数
    Cl,
    /// 峰值电流限制
    Pl,
    /// 扭矩命令
    Tc,
    /// 换向参数
    Ca,
    /// 错误码
    Ec,
}

/// 两字母查找表
const REGISTER_TABLE: &[(Register, [u8; 2])] = &[
    (Register::Ac, *b"AC"),
    (Register::Bg, *b"BG"),
    (Register::Dc, *b"DC"),
    (Register::Sd, *b"SD"),
    (Register::Sp, *b"SP"),
    (Register::Pa, *b"PA"),
    (Register::Pr, *b"PR"),
    (Register::Px, *b"PX"),
    (Register::Vx, *b"VX"),
    (Register::St, *b"ST"),
    (Register::Mo, *b"MO"),
    (Register::Ms, *b"MS"),
    (Register::Mf, *b"MF"),
    (Register::Sr, *b"SR"),
    (Register::Sv, *b"SV"),
    (Register::Hm, *b"HM"),
    (Register::Il, *b"IL"),
    (Register::Ip, *b"IP"),
    (Register::Op, *b"OP"),
    (Register::Kl, *b"KL"),
    (Register::Um, *b"UM"),
    (Register::Ui, *b"UI"),
    (Register::Uf, *b"UF"),
    (Register::Vh, *b"VH"),
    (Register::Vl, *b"VL"),
    (Register::Hl, *b"HL"),
    (Register::Ll, *b"LL"),
    (Register::Xm, *b"XM"),
    (Register::Er, *b"ER"),
    (Register::Cl, *b"CL"),
    (Register::Pl, *b"PL"),
    (Register::Tc, *b"TC"),
    (Register::Ca, *b"CA"),
    (Register::Ec, *b"EC"),
];

impl Register {
    /// ASCII 字母
    pub fn letters(self) -> [u8; 2] {
        REGISTER_TABLE
            .iter()
            .find(|(reg, _)| *reg == self)
            .map(|(_, letters)| *letters)
            .unwrap_or(*b"??")
    }

    pub fn as_str(self) -> &'static str {
        REGISTER_TABLE
            .iter()
            .find(|(reg, _)| *reg == self)
            .and_then(|(_, letters)| std::str::from_utf8(letters).ok())
            .unwrap_or("??")
    }

    /// 由首末字母解析，未知命令返回错误
    pub fn from_letters(first: u8, last: u8) -> Result<Self, ProtocolError> {
        let first = first.to_ascii_uppercase();
        let last = last.to_ascii_uppercase();
        REGISTER_TABLE
            .iter()
            .find(|(_, letters)| letters[0] == first && letters[1] == last)
            .map(|(reg, _)| *reg)
            .ok_or_else(|| ProtocolError::InvalidValue {
                field: "Register".to_string(),
                value: u16::from_be_bytes([first, last]) as u32,
            })
    }
}

impl std::str::FromStr for Register {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(ProtocolError::ParseError(format!(
                "register name must be two letters, got {:?}",
                s
            )));
        }
        Register::from_letters(bytes[0], bytes[1])
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 二进制解释器数值
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryValue {
    Int(i32),
    Float(f32),
}

impl BinaryValue {
    pub fn is_float(self) -> bool {
        matches!(self, BinaryValue::Float(_))
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        match self {
            BinaryValue::Int(v) => v.to_le_bytes(),
            BinaryValue::Float(v) => v.to_le_bytes(),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            BinaryValue::Int(v) => v as f64,
            BinaryValue::Float(v) => v as f64,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            BinaryValue::Int(v) => v,
            BinaryValue::Float(v) => v.round() as i32,
        }
    }

    /// 写入回显比较：整型严格相等，浮点 1% 相对容差
    pub fn echo_matches(self, echo: BinaryValue) -> bool {
        match (self, echo) {
            (BinaryValue::Int(a), BinaryValue::Int(b)) => a == b,
            (a, b) => {
                let (a, b) = (a.as_f64() as f32, b.as_f64() as f32);
                if a == b {
                    return true;
                }
                (a - b).abs() <= a.abs() * FLOAT_ECHO_TOLERANCE
            },
        }
    }
}

impl From<i32> for BinaryValue {
    fn from(v: i32) -> Self {
        BinaryValue::Int(v)
    }
}

impl From<f32> for BinaryValue {
    fn from(v: f32) -> Self {
        BinaryValue::Float(v)
    }
}

impl std::fmt::Display for BinaryValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryValue::Int(v) => write!(f, "{}", v),
            BinaryValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// 命令种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// 读
    Query,
    /// 写（回显校验）
    Set,
    /// 执行（确认即可）
    Execute,
}

/// 二进制解释器帧
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpreterFrame {
    pub register: Register,
    pub index: u16,
    pub query: bool,
    /// 数值（Query / Execute 请求为 `None`）
    pub value: Option<BinaryValue>,
}

impl InterpreterFrame {
    pub fn query(register: Register, index: u16) -> Self {
        Self {
            register,
            index,
            query: true,
            value: None,
        }
    }

    pub fn set(register: Register, index: u16, value: BinaryValue) -> Self {
        Self {
            register,
            index,
            query: false,
            value: Some(value),
        }
    }

    pub fn execute(register: Register, index: u16) -> Self {
        Self {
            register,
            index,
            query: false,
            value: None,
        }
    }

    /// 编码为固定 8 字节负载（无值时 4..8 字节为 0）
    pub fn encode(&self) -> Result<[u8; 8], ProtocolError> {
        if self.index > MAX_REGISTER_INDEX {
            return Err(ProtocolError::InvalidValue {
                field: "RegisterIndex".to_string(),
                value: self.index as u32,
            });
        }
        let letters = self.register.letters();
        let float = self.value.is_some_and(BinaryValue::is_float);

        let mut bytes = [0u8; 8];
        bytes[0] = letters[0];
        bytes[1] = letters[1];
        bytes[2] = (self.index & 0xFF) as u8;
        bytes[3] = ((self.index >> 8) as u8 & 0x3F)
            | if self.query { 0x40 } else { 0 }
            | if float { 0x80 } else { 0 };

        if let Some(value) = self.value {
            bytes[4..8].copy_from_slice(&value.to_le_bytes());
        }
        Ok(bytes)
    }

    /// 构建发往节点（或组地址）的请求帧
    pub fn to_frame(&self, node_id: u8) -> Result<ArmFrame, ProtocolError> {
        let bytes = self.encode()?;
        Ok(ArmFrame::new(cob_id(FunctionCode::Rpdo2, node_id), &bytes))
    }

    /// 解码应答帧
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::InvalidLength {
                expected: 4,
                actual: data.len(),
            });
        }
        let register = Register::from_letters(data[0], data[1])?;
        let index = data[2] as u16 | (((data[3] & 0x3F) as u16) << 8);
        let query = data[3] & 0x40 != 0;
        let float = data[3] & 0x80 != 0;

        let value = if data.len() >= 8 {
            let raw = u32_le(data, 4);
            Some(if float {
                BinaryValue::Float(f32::from_bits(raw))
            } else {
                BinaryValue::Int(raw as i32)
            })
        } else {
            None
        };

        Ok(Self {
            register,
            index,
            query,
            value,
        })
    }
}

// ============================================================================
// OS 解释器
// ============================================================================

/// OS 命令对象：sub 1 命令，sub 2 状态，sub 3 应答
pub const OBJ_OS_COMMAND: u16 = 0x1023;
pub const OS_SUB_COMMAND: u8 = 0x01;
pub const OS_SUB_STATUS: u8 = 0x02;
pub const OS_SUB_REPLY: u8 = 0x03;

/// OS 命令模式对象
pub const OBJ_OS_MODE: u16 = 0x1024;
/// 模式：立即求值
pub const OS_MODE_EVALUATE_IMMEDIATELY: u8 = 0x00;

/// OS 命令状态（`0x1023:2`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum OsStatus {
    /// 完成，无错误，无应答
    CompletedNoReply = 0,
    /// 完成，无错误，有应答
    CompletedWithReply = 1,
    /// 完成，有错误，无应答
    ErrorNoReply = 2,
    /// 完成，有错误，有应答
    ErrorWithReply = 3,
    /// 执行中
    Executing = 255,
}

impl OsStatus {
    /// 解析状态字节，未知值报错
    pub fn decode(raw: u8) -> Result<Self, ProtocolError> {
        OsStatus::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
            field: "OsStatus".to_string(),
            value: raw as u32,
        })
    }

    pub fn is_done(self) -> bool {
        self != OsStatus::Executing
    }

    pub fn is_error(self) -> bool {
        matches!(self, OsStatus::ErrorNoReply | OsStatus::ErrorWithReply)
    }
}

/// OS 命令应答
#[derive(Debug, Clone, PartialEq)]
pub enum OsReply {
    /// `N` 标记：数值
    Number(f64),
    /// `E` 标记或无标记：字符串
    Text(String),
}

impl OsReply {
    /// 解析应答字节：首字节为类型标记
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches(['\0', ';', '\r', '\n']).trim();
        match text.as_bytes().first() {
            Some(b'N') => {
                let body = text[1..].trim();
                body.parse::<f64>().map(OsReply::Number).map_err(|_| {
                    ProtocolError::ParseError(format!("invalid numeric OS reply: {:?}", body))
                })
            },
            Some(b'E') => Ok(OsReply::Text(text[1..].trim().to_string())),
            _ => Ok(OsReply::Text(text.to_string())),
        }
    }
}
