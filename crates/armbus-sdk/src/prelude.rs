//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use armbus_sdk::prelude::*;
//! ```

// 客户端层（推荐使用）
pub use crate::client::{
    Arm, ArmConfig, AxisConfig, AxisMove, DirectionPolicy, ElbowSolution, MotorsMovePlan, Pose,
    plan_move,
};

// 驱动层（高级用户使用）
pub use crate::driver::{
    Driver, DriverBuilder, FaultEvent, FramePriority, NodeFaultState, WaitCondition,
};

// CAN 层（常用 Trait）
pub use crate::can::{CanAdapter, SplittableAdapter};

// 协议层
pub use crate::protocol::{ArmFrame, NmtCommand, PdoSlot, Register};

// 错误类型
pub use crate::can::CanError;
pub use crate::client::ClientError;
pub use crate::driver::DriverError;
pub use crate::protocol::ProtocolError;
