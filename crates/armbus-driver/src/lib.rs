//! 驱动层模块
//!
//! 本模块是 CANopen 主站引擎，包括：
//! - 帧传输（RX 线程 + 写任务，高/低优先级出站队列）
//! - 请求/应答关联表（SDO、二进制解释器）
//! - SDO 快速/分段传输
//! - PDO 映射配置与 TPDO 反馈解码（ArcSwap 无锁读取）
//! - EMCY 解码、节点故障状态与运动等待
//! - 驱动器二进制解释器 / OS 解释器
//! - NMT 命令与心跳
//!
//! 所有协议状态由 [`Driver`] 独占；大多数用户应使用 `armbus-client`
//! 提供的轴级接口。

mod builder;
mod driver;
pub mod emcy;
mod error;
pub mod interpreter;
pub mod nmt;
pub mod pdo;
mod registry;
pub mod sdo;
pub mod state;
pub mod transport;

pub use builder::{DriverBuilder, DriverConfig};
pub use driver::Driver;
pub use emcy::{FaultEvent, NodeFaultState, QueueFlag};
pub use error::DriverError;
pub use interpreter::{InterpreterTag, QueryReply};
pub use nmt::NmtEvent;
pub use pdo::{PdoMappingTable, SlotMapping, TpdoParams};
pub use registry::Registry;
pub use sdo::{SdoData, SdoExchange, SdoTag};
pub use state::{MotionWait, NodeFeedback, WaitCondition};
pub use transport::{FramePriority, MetricsSnapshot, TransportConfig};
