//! CANopen SDO 帧编码/解码
//!
//! 请求发往 `0x600 + node`，应答来自 `0x580 + node`。
//!
//! 命令字（Byte 0）布局：
//!
//! ```text
//! bit 7-5: 命令说明符 (ccs/scs)
//! bit 4  : toggle（分段传输）
//! bit 3-1: 未使用字节数 n（分段传输；加速传输时为 bit 3-2）
//! bit 0  : 最后一段 c（分段传输）/ 长度有效 s（初始化）
//! ```

use bilge::prelude::*;

use crate::ids::{FunctionCode, cob_id};
use crate::{ArmFrame, ProtocolError, u16_le, u32_le};

/// 上传初始化请求
pub const CMD_UPLOAD_INITIATE: u8 = 0x40;
/// 分段下载初始化请求（长度有效）
pub const CMD_DOWNLOAD_SEGMENTED_INITIATE: u8 = 0x21;
/// 分段上传请求（toggle = 0）
pub const CMD_UPLOAD_SEGMENT_EVEN: u8 = 0x60;
/// 分段上传请求（toggle = 1）
pub const CMD_UPLOAD_SEGMENT_ODD: u8 = 0x70;
/// 中止传输
pub const CMD_ABORT: u8 = 0x80;
/// 下载初始化应答
pub const CMD_DOWNLOAD_ACK: u8 = 0x60;

/// 加速传输最大字节数
pub const EXPEDITED_MAX: usize = 4;
/// 每个数据段的最大字节数
pub const SEGMENT_MAX: usize = 7;

/// 加速下载命令字：`0x23 | ((4 - len) << 2) | 0x01`
///
/// `len` 必须在 1..=4 之间。
///
/// ```rust
/// use armbus_protocol::sdo::expedited_download_command;
///
/// assert_eq!(expedited_download_command(1), 0x2F);
/// assert_eq!(expedited_download_command(4), 0x23);
/// ```
pub fn expedited_download_command(len: usize) -> u8 {
    debug_assert!((1..=EXPEDITED_MAX).contains(&len));
    0x23 | (((EXPEDITED_MAX - len) as u8) << 2) | 0x01
}

/// 分段命令字位域
///
/// bilge 使用 LSB first 位序，字段顺序即 bit 0 → bit 7。
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCommand {
    /// Bit 0: 最后一段
    pub last: bool,
    /// Bit 1-3: 未使用字节数
    pub unused: u3,
    /// Bit 4: toggle
    pub toggle: bool,
    /// Bit 5-7: 命令说明符（下载段为 0）
    pub specifier: u3,
}

/// 分段命令字：`(toggle << 4) | ((7 - len) << 1) | last`
pub fn segment_command(toggle: bool, len: usize, last: bool) -> u8 {
    debug_assert!(len <= SEGMENT_MAX);
    let cmd = SegmentCommand::new(last, u3::new((SEGMENT_MAX - len) as u8), toggle, u3::new(0));
    u8::from(cmd)
}

/// 分段传输游标
///
/// 把负载切成 7 字节块并生成命令字；toggle 从 0 开始，每块翻转一次，
/// 只有最后一块带结束位。空负载也产生一个结束段（7 个未使用字节）。
/// SDO 分段下载和 OS 解释器命令共用。
#[derive(Debug, Clone)]
pub struct SegmentCursor<'a> {
    payload: &'a [u8],
    toggle: bool,
    sent: usize,
    finished: bool,
}

impl<'a> SegmentCursor<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            toggle: false,
            sent: 0,
            finished: false,
        }
    }

    /// 总长度
    pub fn total(&self) -> usize {
        self.payload.len()
    }

    /// 已发送字节数
    pub fn sent(&self) -> usize {
        self.sent
    }
}

/// 一个待发送的数据段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub toggle: bool,
    pub last: bool,
    /// 完整的 8 字节帧负载（命令字 + 7 字节数据，不足补 0）
    pub bytes: [u8; 8],
}

impl Segment {
    pub fn command(&self) -> u8 {
        self.bytes[0]
    }
}

impl Iterator for SegmentCursor<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.finished {
            return None;
        }
        let end = (self.sent + SEGMENT_MAX).min(self.payload.len());
        let chunk = &self.payload[self.sent..end];
        let last = end == self.payload.len();

        let mut bytes = [0u8; 8];
        bytes[0] = segment_command(self.toggle, chunk.len(), last);
        bytes[1..1 + chunk.len()].copy_from_slice(chunk);

        let segment = Segment {
            toggle: self.toggle,
            last,
            bytes,
        };
        self.sent = end;
        self.toggle = !self.toggle;
        self.finished = last;
        Some(segment)
    }
}

/// 加速下载请求帧
pub fn expedited_download_frame(
    node_id: u8,
    index: u16,
    sub_index: u8,
    data: &[u8],
) -> Result<ArmFrame, ProtocolError> {
    if data.is_empty() || data.len() > EXPEDITED_MAX {
        return Err(ProtocolError::InvalidLength {
            expected: EXPEDITED_MAX,
            actual: data.len(),
        });
    }
    let mut bytes = [0u8; 8];
    bytes[0] = expedited_download_command(data.len());
    bytes[1..3].copy_from_slice(&index.to_le_bytes());
    bytes[3] = sub_index;
    bytes[4..4 + data.len()].copy_from_slice(data);
    Ok(ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &bytes))
}

/// 分段下载初始化请求帧（携带总长度）
pub fn segmented_download_initiate_frame(
    node_id: u8,
    index: u16,
    sub_index: u8,
    size: u32,
) -> ArmFrame {
    let mut bytes = [0u8; 8];
    bytes[0] = CMD_DOWNLOAD_SEGMENTED_INITIATE;
    bytes[1..3].copy_from_slice(&index.to_le_bytes());
    bytes[3] = sub_index;
    bytes[4..8].copy_from_slice(&size.to_le_bytes());
    ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &bytes)
}

/// 数据段帧
pub fn segment_frame(node_id: u8, segment: &Segment) -> ArmFrame {
    ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &segment.bytes)
}

/// 上传初始化请求帧
pub fn upload_initiate_frame(node_id: u8, index: u16, sub_index: u8) -> ArmFrame {
    let mut bytes = [0u8; 8];
    bytes[0] = CMD_UPLOAD_INITIATE;
    bytes[1..3].copy_from_slice(&index.to_le_bytes());
    bytes[3] = sub_index;
    ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &bytes)
}

/// 分段上传请求帧（0x60 / 0x70 交替）
pub fn upload_segment_frame(node_id: u8, toggle: bool) -> ArmFrame {
    let cmd = if toggle {
        CMD_UPLOAD_SEGMENT_ODD
    } else {
        CMD_UPLOAD_SEGMENT_EVEN
    };
    ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &[cmd, 0, 0, 0, 0, 0, 0, 0])
}

/// 中止帧
pub fn abort_frame(node_id: u8, index: u16, sub_index: u8, code: u32) -> ArmFrame {
    let mut bytes = [0u8; 8];
    bytes[0] = CMD_ABORT;
    bytes[1..3].copy_from_slice(&index.to_le_bytes());
    bytes[3] = sub_index;
    bytes[4..8].copy_from_slice(&code.to_le_bytes());
    ArmFrame::from_parts(FunctionCode::SdoRequest, node_id, &bytes)
}

/// 服务端应答（0x580 + node）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoResponse {
    /// 下载初始化应答
    DownloadAck { index: u16, sub_index: u8 },
    /// 下载段应答
    SegmentAck { toggle: bool },
    /// 加速上传应答
    ///
    /// `size_indicated == false` 时设备未给出长度，按 4 字节字符串处理。
    UploadExpedited {
        index: u16,
        sub_index: u8,
        data: [u8; 4],
        len: usize,
        size_indicated: bool,
    },
    /// 分段上传初始化应答
    UploadSegmented { index: u16, sub_index: u8, size: u32 },
    /// 上传数据段
    UploadSegment {
        toggle: bool,
        last: bool,
        data: [u8; 7],
        len: usize,
    },
    /// 中止
    Abort { index: u16, sub_index: u8, code: u32 },
}

impl SdoResponse {
    /// 应答中携带的对象地址（段应答没有）
    pub fn object(&self) -> Option<(u16, u8)> {
        match *self {
            SdoResponse::DownloadAck { index, sub_index }
            | SdoResponse::UploadExpedited {
                index, sub_index, ..
            }
            | SdoResponse::UploadSegmented {
                index, sub_index, ..
            }
            | SdoResponse::Abort {
                index, sub_index, ..
            } => Some((index, sub_index)),
            SdoResponse::SegmentAck { .. } | SdoResponse::UploadSegment { .. } => None,
        }
    }
}

impl TryFrom<ArmFrame> for SdoResponse {
    type Error = ProtocolError;

    fn try_from(frame: ArmFrame) -> Result<Self, Self::Error> {
        if frame.function_code() != FunctionCode::SdoResponse as u8 {
            return Err(ProtocolError::InvalidCanId { id: frame.id });
        }
        if frame.len < 8 {
            return Err(ProtocolError::InvalidLength {
                expected: 8,
                actual: frame.len as usize,
            });
        }
        let d = &frame.data;
        let cmd = d[0];
        let index = u16_le(d, 1);
        let sub_index = d[3];

        match cmd >> 5 {
            // 上传数据段
            0 => {
                let seg = SegmentCommand::from(cmd);
                let len = SEGMENT_MAX - u8::from(seg.unused()) as usize;
                let mut data = [0u8; 7];
                data.copy_from_slice(&d[1..8]);
                Ok(SdoResponse::UploadSegment {
                    toggle: seg.toggle(),
                    last: seg.last(),
                    data,
                    len,
                })
            },
            // 下载段应答
            1 => Ok(SdoResponse::SegmentAck {
                toggle: cmd & 0x10 != 0,
            }),
            // 上传初始化应答
            2 => {
                let expedited = cmd & 0x02 != 0;
                let size_indicated = cmd & 0x01 != 0;
                if expedited {
                    let len = if size_indicated {
                        EXPEDITED_MAX - ((cmd >> 2) & 0x03) as usize
                    } else {
                        EXPEDITED_MAX
                    };
                    let mut data = [0u8; 4];
                    data.copy_from_slice(&d[4..8]);
                    Ok(SdoResponse::UploadExpedited {
                        index,
                        sub_index,
                        data,
                        len,
                        size_indicated,
                    })
                } else {
                    let size = if size_indicated { u32_le(d, 4) } else { 0 };
                    Ok(SdoResponse::UploadSegmented {
                        index,
                        sub_index,
                        size,
                    })
                }
            },
            3 => Ok(SdoResponse::DownloadAck { index, sub_index }),
            4 => Ok(SdoResponse::Abort {
                index,
                sub_index,
                code: u32_le(d, 4),
            }),
            _ => Err(ProtocolError::InvalidValue {
                field: "SdoServerCommand".to_string(),
                value: cmd as u32,
            }),
        }
    }
}

/// SDO 中止码表
const ABORT_CODES: &[(u32, &str)] = &[
    (0x0503_0000, "Toggle bit not alternated"),
    (0x0504_0000, "SDO protocol timed out"),
    (0x0504_0001, "Client/server command specifier not valid or unknown"),
    (0x0504_0002, "Invalid block size"),
    (0x0504_0003, "Invalid sequence number"),
    (0x0504_0004, "CRC error"),
    (0x0504_0005, "Out of memory"),
    (0x0601_0000, "Unsupported access to an object"),
    (0x0601_0001, "Attempt to read a write only object"),
    (0x0601_0002, "Attempt to write a read only object"),
    (0x0602_0000, "Object does not exist in the object dictionary"),
    (0x0604_0041, "Object cannot be mapped to the PDO"),
    (
        0x0604_0042,
        "The number and length of the objects to be mapped would exceed PDO length",
    ),
    (0x0604_0043, "General parameter incompatibility reason"),
    (0x0604_0047, "General internal incompatibility in the device"),
    (0x0606_0000, "Access failed due to a hardware error"),
    (
        0x0607_0010,
        "Data type does not match, length of service parameter does not match",
    ),
    (
        0x0607_0012,
        "Data type does not match, length of service parameter too high",
    ),
    (
        0x0607_0013,
        "Data type does not match, length of service parameter too low",
    ),
    (0x0609_0011, "Sub-index does not exist"),
    (0x0609_0030, "Invalid value for parameter (download only)"),
    (0x0609_0031, "Value of parameter written too high (download only)"),
    (0x0609_0032, "Value of parameter written too low (download only)"),
    (0x0609_0036, "Maximum value is less than minimum value"),
    (0x060A_0023, "Resource not available: SDO connection"),
    (0x0800_0000, "General error"),
    (0x0800_0020, "Data cannot be transferred or stored to the application"),
    (
        0x0800_0021,
        "Data cannot be transferred or stored to the application because of local control",
    ),
    (
        0x0800_0022,
        "Data cannot be transferred or stored to the application because of device state",
    ),
    (
        0x0800_0023,
        "Object dictionary dynamic generation fails or no object dictionary is present",
    ),
    (0x0800_0024, "No data available"),
];

/// 查询中止码的可读描述
pub fn abort_message(code: u32) -> &'static str {
    ABORT_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, msg)| *msg)
        .unwrap_or("Unknown SDO abort code")
}
