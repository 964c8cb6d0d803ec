//! 客户端错误类型

use armbus_driver::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// 配置文件读取/解析/校验失败
    #[error("Config error: {0}")]
    Config(String),

    /// 目标超出行程
    #[error("Axis {axis}: target {target} outside travel [{min}, {max}]")]
    OutOfRange {
        axis: String,
        target: f64,
        min: f64,
        max: f64,
    },

    /// 逆运动学无解
    #[error("Pose unreachable: {0}")]
    Unreachable(String),

    #[error("Unknown axis: {0}")]
    UnknownAxis(String),

    /// 运动计划不可执行（如 `move_time` 非有限或为负）
    #[error("Invalid move plan: {0}")]
    InvalidPlan(String),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(e: toml::de::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}
