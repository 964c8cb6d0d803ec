//! # 机械臂配置
//!
//! 轴几何、行程与速度限制、传输超时，从 TOML 加载：
//!
//! ```toml
//! can_interface = "can0"
//!
//! [transport]
//! response_timeout_ms = 1000
//!
//! [axes.shoulder]
//! node_id = 1
//! conversion_factor = 1000.0   # counts / deg
//! min_travel = -170.0
//! max_travel = 170.0
//! max_velocity = 90.0
//! max_acceleration = 180.0
//!
//! [axes.wrist]
//! node_id = 4
//! conversion_factor = 500.0
//! max_velocity = 180.0
//! max_acceleration = 360.0
//! unlimited_travel = true
//! modulo_range = 360.0
//! direction_policy = "shortest"
//! ```

use crate::error::ClientError;
use armbus_driver::{DriverConfig, TransportConfig};
use armbus_protocol::{GROUP_NODE_ID, MAX_NODE_ID};
use armbus_protocol::ds402::DI_HOME_SWITCH;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// 模轴（无限行程）的转向策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionPolicy {
    /// 走较短的一侧
    #[default]
    Shortest,
    /// 只沿正方向
    Clockwise,
    /// 只沿负方向
    CounterClockwise,
}

/// 回零设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    /// 驱动器内回零子程序名（`XQ##name`）
    pub subroutine: String,
    /// 回零开关对应的数字输入位
    pub input_mask: u32,
    /// 触发电平
    pub active_level: bool,
    /// 回零期间放开的软限位（物理单位，±）
    pub search_range: f64,
    /// 回零完成后写入的位置（物理单位）
    pub offset: f64,
    pub timeout_ms: u64,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            subroutine: "HOME".to_string(),
            input_mask: DI_HOME_SWITCH,
            active_level: true,
            search_range: 1000.0,
            offset: 0.0,
            timeout_ms: 30_000,
        }
    }
}

/// 单轴几何与限制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub node_id: u8,
    /// 编码器计数 / 物理单位
    pub conversion_factor: f64,
    #[serde(default)]
    pub min_travel: f64,
    #[serde(default)]
    pub max_travel: f64,
    /// 物理单位 / s
    pub max_velocity: f64,
    /// 物理单位 / s²
    pub max_acceleration: f64,
    #[serde(default)]
    pub unlimited_travel: bool,
    /// 模轴周期（如 360°）
    #[serde(default)]
    pub modulo_range: f64,
    #[serde(default)]
    pub direction_policy: DirectionPolicy,
    #[serde(default)]
    pub home: Option<HomeConfig>,
}

impl AxisConfig {
    /// 物理单位 → 编码器计数
    pub fn to_counts(&self, value: f64) -> f64 {
        value * self.conversion_factor
    }

    pub fn from_counts(&self, counts: i32) -> f64 {
        counts as f64 / self.conversion_factor
    }

    /// 目标是否在行程内（模轴总是在行程内）
    pub fn check_travel(&self, name: &str, target: f64) -> Result<(), ClientError> {
        if self.unlimited_travel || (self.min_travel..=self.max_travel).contains(&target) {
            return Ok(());
        }
        Err(ClientError::OutOfRange {
            axis: name.to_string(),
            target,
            min: self.min_travel,
            max: self.max_travel,
        })
    }
}

/// 传输超时设置（毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub send_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// 二进制解释器最大尝试次数
    pub max_attempts: u32,
    /// 连接时等待 boot-up 的窗口
    pub boot_window_ms: u64,
    /// 运动等待在规划时长之外的余量
    pub move_timeout_margin_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            response_timeout_ms: 1_000,
            max_attempts: 1,
            boot_window_ms: 2_000,
            move_timeout_margin_ms: 2_000,
        }
    }
}

/// SCARA 连杆参数与关节轴名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicsConfig {
    /// 大臂长度（mm）
    pub link1: f64,
    /// 小臂长度（mm）
    pub link2: f64,
    pub shoulder_axis: String,
    pub z_axis: String,
    pub elbow_axis: String,
    pub wrist_axis: String,
}

/// 机械臂配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    pub can_interface: String,
    #[serde(default = "default_group_node_id")]
    pub group_node_id: u8,
    #[serde(default)]
    pub transport: TransportSettings,
    pub axes: BTreeMap<String, AxisConfig>,
    #[serde(default)]
    pub kinematics: Option<KinematicsConfig>,
}

fn default_group_node_id() -> u8 {
    GROUP_NODE_ID
}

impl ArmConfig {
    /// 解析并校验
    pub fn from_toml_str(text: &str) -> Result<Self, ClientError> {
        let config: ArmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.axes.is_empty() {
            return Err(ClientError::Config("no axes configured".to_string()));
        }
        if self.group_node_id != GROUP_NODE_ID {
            return Err(ClientError::Config(format!(
                "group_node_id must be {}, got {}",
                GROUP_NODE_ID, self.group_node_id
            )));
        }

        let mut seen = BTreeSet::new();
        for (name, axis) in &self.axes {
            let fail =
                |reason: &str| Err(ClientError::Config(format!("axis {}: {}", name, reason)));
            let node_id = axis.node_id;
            if node_id == 0 || node_id > MAX_NODE_ID || node_id == self.group_node_id {
                return fail(&format!("invalid node id {}", axis.node_id));
            }
            if !seen.insert(axis.node_id) {
                return fail(&format!("duplicate node id {}", axis.node_id));
            }
            if !(axis.conversion_factor.is_finite() && axis.conversion_factor > 0.0) {
                return fail("conversion_factor must be positive");
            }
            if !(axis.max_velocity > 0.0 && axis.max_acceleration > 0.0) {
                return fail("max_velocity and max_acceleration must be positive");
            }
            if axis.unlimited_travel {
                if axis.modulo_range <= 0.0 {
                    return fail("unlimited_travel requires a positive modulo_range");
                }
            } else if axis.min_travel > axis.max_travel {
                return fail("min_travel exceeds max_travel");
            }
        }

        if let Some(kin) = &self.kinematics {
            if kin.link1 <= 0.0 || kin.link2 <= 0.0 {
                return Err(ClientError::Config("link lengths must be positive".to_string()));
            }
            for joint in [&kin.shoulder_axis, &kin.z_axis, &kin.elbow_axis, &kin.wrist_axis] {
                if !self.axes.contains_key(joint) {
                    return Err(ClientError::UnknownAxis(joint.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn axis(&self, name: &str) -> Result<&AxisConfig, ClientError> {
        self.axes
            .get(name)
            .ok_or_else(|| ClientError::UnknownAxis(name.to_string()))
    }

    /// 全部节点号（升序）
    pub fn node_ids(&self) -> Vec<u8> {
        let ids: BTreeSet<u8> = self.axes.values().map(|a| a.node_id).collect();
        ids.into_iter().collect()
    }

    /// 对应的驱动配置：组地址覆盖全部轴
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            transport: TransportConfig {
                send_timeout: Duration::from_millis(self.transport.send_timeout_ms),
                response_timeout: Duration::from_millis(self.transport.response_timeout_ms),
                ..TransportConfig::default()
            },
            max_attempts: self.transport.max_attempts.max(1),
            group_members: self.node_ids(),
            ..DriverConfig::default()
        }
    }

    pub fn boot_window(&self) -> Duration {
        Duration::from_millis(self.transport.boot_window_ms)
    }

    pub fn move_timeout_margin(&self) -> Duration {
        Duration::from_millis(self.transport.move_timeout_margin_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
can_interface = "can0"

[transport]
response_timeout_ms = 250
max_attempts = 3

[axes.shoulder]
node_id = 1
conversion_factor = 1000.0
min_travel = -170.0
max_travel = 170.0
max_velocity = 90.0
max_acceleration = 180.0

[axes.wrist]
node_id = 4
conversion_factor = 500.0
max_velocity = 180.0
max_acceleration = 360.0
unlimited_travel = true
modulo_range = 360.0
direction_policy = "counter_clockwise"

[axes.wrist.home]
subroutine = "HOMEW"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ArmConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.group_node_id, GROUP_NODE_ID);
        assert_eq!(config.node_ids(), vec![1, 4]);
        assert_eq!(config.transport.send_timeout_ms, 5_000);

        let wrist = config.axis("wrist").unwrap();
        assert_eq!(wrist.direction_policy, DirectionPolicy::CounterClockwise);
        let home = wrist.home.as_ref().unwrap();
        assert_eq!(home.subroutine, "HOMEW");
        assert_eq!(home.input_mask, DI_HOME_SWITCH);

        let driver = config.driver_config();
        assert_eq!(driver.group_members, vec![1, 4]);
        assert_eq!(driver.max_attempts, 3);
        assert_eq!(driver.transport.response_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let text = SAMPLE.replace("node_id = 4", "node_id = 1");
        assert!(matches!(
            ArmConfig::from_toml_str(&text),
            Err(ClientError::Config(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn test_group_node_id_reserved() {
        let text = SAMPLE.replace("node_id = 4", "node_id = 10");
        assert!(ArmConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_modulo_axis_needs_range() {
        let text = SAMPLE.replace("modulo_range = 360.0", "");
        assert!(ArmConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_check_travel() {
        let config = ArmConfig::from_toml_str(SAMPLE).unwrap();
        let shoulder = config.axis("shoulder").unwrap();
        assert!(shoulder.check_travel("shoulder", 170.0).is_ok());
        assert!(matches!(
            shoulder.check_travel("shoulder", 171.0),
            Err(ClientError::OutOfRange { .. })
        ));
        assert!(config.axis("wrist").unwrap().check_travel("wrist", 1e6).is_ok());
        assert!(matches!(config.axis("elbow"), Err(ClientError::UnknownAxis(_))));
    }
}
