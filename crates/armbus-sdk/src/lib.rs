//! Armbus SDK - 多轴实验室机械臂 CAN 总线运动控制
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): CANopen SDO/PDO/EMCY 与驱动器解释器帧编解码
//! - **CAN 层** (`can`): CAN 硬件抽象，支持 SocketCAN 与内存 Mock 总线
//! - **驱动层** (`driver`): 传输、请求关联、SDO/PDO/EMCY/解释器引擎
//! - **客户端层** (`client`): 配置、同步运动规划、运动学、`Arm`
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use armbus_sdk::prelude::*;
//!
//! # async fn demo() -> Result<(), ClientError> {
//! armbus_sdk::init_logger();
//! let config = ArmConfig::load("arm.toml")?;
//! # #[cfg(target_os = "linux")]
//! # {
//! let adapter = armbus_sdk::can::SocketCanAdapter::new(&config.can_interface)
//!     .map_err(DriverError::from)?;
//! let arm = Arm::connect(adapter, config).await?;
//! arm.motor_enable("shoulder", true).await?;
//! if let Some(plan) = arm.plan(&[("shoulder", 45.0)], 50.0, 50.0).await? {
//!     arm.motors_move_absolute_execute(&plan).await?;
//! }
//! # }
//! # Ok(())
//! # }
//! ```

pub use armbus_can as can;
pub use armbus_client as client;
pub use armbus_driver as driver;
pub use armbus_protocol as protocol;

pub mod prelude;

pub use armbus_can::{ArmFrame, CanAdapter, CanError, SplittableAdapter};
pub use armbus_client::{Arm, ArmConfig, ClientError, MotorsMovePlan};
pub use armbus_driver::{Driver, DriverBuilder, DriverError};
pub use armbus_protocol::ProtocolError;

/// 初始化 `tracing` 日志输出
///
/// 过滤规则取自 `RUST_LOG`，未设置时驱动层与客户端层为 `info`。重复调用无副作用。
pub fn init_logger() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("armbus_driver=info,armbus_client=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
