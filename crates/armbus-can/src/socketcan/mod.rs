//! SocketCAN 适配器实现
//!
//! - **仅限 Linux 平台**：SocketCAN 是 Linux 内核特性
//! - **接口配置**：波特率等由系统工具（`ip link`）完成，不在应用层设置
//! - **拆分**：`split()` 通过 `try_clone()`（`dup()`）得到独立的 RX/TX socket，
//!   两者共享打开文件描述，因此只用 `SO_RCVTIMEO` 实现超时，严禁 `set_nonblocking()`

use crate::{ArmFrame, CanAdapter, CanError, RxAdapter, SplittableAdapter, TxAdapter};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{trace, warn};

/// 默认读超时
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(2);

/// SocketCAN 适配器
///
/// ```no_run
/// use armbus_can::{ArmFrame, CanAdapter, SocketCanAdapter};
///
/// let mut adapter = SocketCanAdapter::new("can0").unwrap();
/// adapter.send(ArmFrame::new(0x601, &[0x40, 0x00, 0x10, 0x00])).unwrap();
/// let frame = adapter.receive().unwrap();
/// ```
#[derive(Debug)]
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
    read_timeout: Duration,
}

impl SocketCanAdapter {
    /// 打开 CAN 接口
    ///
    /// # 错误
    /// - `CanError::Device`: 接口不存在或无法打开
    pub fn new(interface: impl Into<String>) -> Result<Self, CanError> {
        let interface = interface.into();
        let socket = CanSocket::open(&interface).map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::PermissionDenied => crate::CanDeviceErrorKind::AccessDenied,
                _ => crate::CanDeviceErrorKind::NotFound,
            };
            CanError::Device(crate::CanDeviceError::new(
                kind,
                format!(
                    "Failed to open CAN interface '{}': {}. Bring it up first: \
                     sudo ip link set up {}",
                    interface, e, interface
                ),
            ))
        })?;
        socket.set_read_timeout(DEFAULT_READ_TIMEOUT)?;

        trace!("SocketCAN interface '{}' opened", interface);
        Ok(Self {
            socket,
            interface,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), CanError> {
        self.socket.set_read_timeout(timeout)?;
        self.read_timeout = timeout;
        Ok(())
    }
}

/// ArmFrame -> CanFrame
fn to_can_frame(frame: &ArmFrame) -> Result<CanFrame, CanError> {
    StandardId::new(frame.id as u16)
        .and_then(|id| CanFrame::new(id, frame.data_slice()))
        .ok_or_else(|| {
            CanError::Device(crate::CanDeviceError::new(
                crate::CanDeviceErrorKind::InvalidFrame,
                format!("Failed to create standard frame with ID 0x{:X}", frame.id),
            ))
        })
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn write_frame(socket: &CanSocket, frame: ArmFrame) -> Result<(), CanError> {
    let can_frame = to_can_frame(&frame)?;
    socket.write_frame(&can_frame).map_err(|e| {
        CanError::Io(std::io::Error::other(format!(
            "SocketCAN transmit error: {}",
            e
        )))
    })?;
    trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
    Ok(())
}

/// 阻塞读取一帧，自动过滤错误帧与扩展帧
fn read_frame(socket: &CanSocket) -> Result<ArmFrame, CanError> {
    loop {
        let can_frame = match socket.read_frame() {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(CanError::Timeout);
            }
            Err(e) => return Err(CanError::Io(e)),
        };

        match can_frame {
            CanFrame::Error(err) => {
                warn!("CAN error frame received: {:?}", err);
                continue;
            }
            frame if frame.is_extended() => {
                trace!("Ignoring extended frame 0x{:X}", frame.raw_id());
                continue;
            }
            frame => {
                let mut armed = ArmFrame::new(frame.raw_id(), frame.data());
                armed.timestamp_us = now_us();
                trace!("Received CAN frame: ID=0x{:X}, len={}", armed.id, armed.len);
                return Ok(armed);
            }
        }
    }
}

impl CanAdapter for SocketCanAdapter {
    fn send(&mut self, frame: ArmFrame) -> Result<(), CanError> {
        write_frame(&self.socket, frame)
    }

    fn receive(&mut self) -> Result<ArmFrame, CanError> {
        read_frame(&self.socket)
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        if let Err(e) = self.set_read_timeout(timeout) {
            warn!("Failed to set receive timeout: {}", e);
        }
    }
}

/// 只读半部（RX 线程）
pub struct SocketCanRxAdapter {
    socket: CanSocket,
}

/// 只写半部（TX 阻塞任务）
pub struct SocketCanTxAdapter {
    socket: CanSocket,
}

impl RxAdapter for SocketCanRxAdapter {
    fn receive(&mut self) -> Result<ArmFrame, CanError> {
        read_frame(&self.socket)
    }
}

impl TxAdapter for SocketCanTxAdapter {
    fn send(&mut self, frame: ArmFrame) -> Result<(), CanError> {
        write_frame(&self.socket, frame)
    }
}

impl SplittableAdapter for SocketCanAdapter {
    type RxAdapter = SocketCanRxAdapter;
    type TxAdapter = SocketCanTxAdapter;

    fn split(self) -> Result<(Self::RxAdapter, Self::TxAdapter), CanError> {
        let rx_socket = self
            .socket
            .as_fd()
            .try_clone_to_owned()
            .map(CanSocket::from)
            .map_err(|e| {
                CanError::Io(std::io::Error::other(format!(
                    "Failed to clone SocketCAN socket for RX: {}",
                    e
                )))
            })?;
        rx_socket.set_read_timeout(self.read_timeout)?;

        trace!(
            "SocketCanAdapter split into RX and TX adapters (interface: {})",
            self.interface
        );
        Ok((
            SocketCanRxAdapter { socket: rx_socket },
            SocketCanTxAdapter {
                socket: self.socket,
            },
        ))
    }
}
