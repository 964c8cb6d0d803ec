//! SCARA 正/逆运动学
//!
//! 关节：`[肩 (deg), z (mm), 肘 (deg), 腕 (deg)]`；位姿 `{x, y, z, yaw}`（mm / deg）。

use crate::config::KinematicsConfig;
use crate::error::ClientError;

/// 关节空间坐标
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointPosition {
    pub shoulder: f64,
    pub z: f64,
    pub elbow: f64,
    pub wrist: f64,
}

/// 笛卡尔位姿
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

/// 逆解的肘部构型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElbowSolution {
    /// 肘角为正
    #[default]
    Left,
    /// 肘角为负
    Right,
}

/// 角度归一化到 (-180, 180]
fn normalize_deg(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scara {
    pub link1: f64,
    pub link2: f64,
}

impl Scara {
    pub fn new(link1: f64, link2: f64) -> Self {
        Self { link1, link2 }
    }

    pub fn from_config(config: &KinematicsConfig) -> Self {
        Self::new(config.link1, config.link2)
    }

    pub fn forward(&self, joints: JointPosition) -> Pose {
        let s = joints.shoulder.to_radians();
        let se = (joints.shoulder + joints.elbow).to_radians();
        Pose {
            x: self.link1 * s.cos() + self.link2 * se.cos(),
            y: self.link1 * s.sin() + self.link2 * se.sin(),
            z: joints.z,
            yaw: normalize_deg(joints.shoulder + joints.elbow + joints.wrist),
        }
    }

    /// 逆解；目标超出工作空间时返回 `Unreachable`
    pub fn inverse(
        &self,
        pose: Pose,
        solution: ElbowSolution,
    ) -> Result<JointPosition, ClientError> {
        let (l1, l2) = (self.link1, self.link2);
        let r2 = pose.x * pose.x + pose.y * pose.y;
        let cos_elbow = (r2 - l1 * l1 - l2 * l2) / (2.0 * l1 * l2);
        if !cos_elbow.is_finite() || cos_elbow.abs() > 1.0 + 1e-12 {
            return Err(ClientError::Unreachable(format!(
                "({:.3}, {:.3}) outside reach [{:.3}, {:.3}]",
                pose.x,
                pose.y,
                (l1 - l2).abs(),
                l1 + l2
            )));
        }

        let mut elbow = cos_elbow.clamp(-1.0, 1.0).acos();
        if solution == ElbowSolution::Right {
            elbow = -elbow;
        }
        let shoulder = pose.y.atan2(pose.x) - (l2 * elbow.sin()).atan2(l1 + l2 * elbow.cos());

        let shoulder = normalize_deg(shoulder.to_degrees());
        let elbow = elbow.to_degrees();
        Ok(JointPosition {
            shoulder,
            z: pose.z,
            elbow,
            wrist: normalize_deg(pose.yaw - shoulder - elbow),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_forward_straight() {
        let arm = Scara::new(200.0, 150.0);
        let pose = arm.forward(JointPosition {
            shoulder: 0.0,
            z: 12.0,
            elbow: 0.0,
            wrist: 30.0,
        });
        assert!((pose.x - 350.0).abs() < EPS);
        assert!(pose.y.abs() < EPS);
        assert_eq!(pose.z, 12.0);
        assert!((pose.yaw - 30.0).abs() < EPS);
    }

    #[test]
    fn test_inverse_roundtrip_both_elbows() {
        let arm = Scara::new(200.0, 150.0);
        let joints = JointPosition {
            shoulder: 20.0,
            z: 5.0,
            elbow: 45.0,
            wrist: -10.0,
        };
        let pose = arm.forward(joints);

        let left = arm.inverse(pose, ElbowSolution::Left).unwrap();
        assert!(close(left.shoulder, 20.0) && close(left.elbow, 45.0) && close(left.wrist, -10.0));

        let right = arm.inverse(pose, ElbowSolution::Right).unwrap();
        assert!(close(right.elbow, -45.0));
        let back = arm.forward(right);
        assert!(close(back.x, pose.x) && close(back.y, pose.y) && close(back.yaw, pose.yaw));
    }

    #[test]
    fn test_unreachable() {
        let arm = Scara::new(200.0, 150.0);
        let far = Pose {
            x: 400.0,
            ..Default::default()
        };
        assert!(matches!(arm.inverse(far, ElbowSolution::Left), Err(ClientError::Unreachable(_))));
        let near = Pose {
            x: 10.0,
            ..Default::default()
        };
        assert!(arm.inverse(near, ElbowSolution::Left).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_deg(190.0), -170.0);
        assert_eq!(normalize_deg(-180.0), 180.0);
        assert_eq!(normalize_deg(540.0), 180.0);
    }
}
