//! 客户端接口模块
//!
//! 本模块提供按轴名操作机械臂的接口，包括：
//! - TOML 配置（轴几何、行程、速度限制）
//! - 多轴同步梯形速度规划
//! - SCARA 正/逆运动学
//! - [`Arm`]：连接、使能、同步运动、回零
//!
//! 需要直接访问 SDO / PDO / 解释器时，使用 [`Arm::driver`]。

pub mod arm;
pub mod config;
mod error;
pub mod kinematics;
pub mod planner;

pub use arm::Arm;
pub use config::{
    ArmConfig, AxisConfig, DirectionPolicy, HomeConfig, KinematicsConfig, TransportSettings,
};
pub use error::ClientError;
pub use kinematics::{ElbowSolution, JointPosition, Pose, Scara};
pub use planner::{AxisMove, MotorMoveParam, MotorsMovePlan, plan_move};
