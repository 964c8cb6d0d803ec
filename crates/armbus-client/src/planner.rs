//! 多轴同步梯形速度规划
//!
//! # 算法
//!
//! 1. 每轴行程：模轴按 [`DirectionPolicy`] 折叠到一个周期内
//! 2. 梯形曲线：`t_a = v/a`；若 `a·t_a² > d`（到不了指令速度）退化为三角形，
//!    `t_a = sqrt(d/a)`，`v = a·t_a`，`T = 2·t_a`；否则 `T = (d - a·t_a²)/v + 2·t_a`
//! 3. 加速时间同步：以最长 `t_a` 为准，短的轴降加速度 `a' = v/t_lead`，
//!    长的轴降速度 `v' = a·t_lead`
//! 4. 总时间同步：以最长 `T` 为准，其余轴 `v`、`a` 同乘
//!    `k = d / (v·(T_lead - v/a))`
//! 5. 换算到编码器单位；行程 < 0.01 的轴标记为跳过，不参与同步，
//!    仍以最高速度下发
//!
//! 同步后所有非跳过轴的总时间相同。

use crate::config::{AxisConfig, DirectionPolicy};
use crate::error::ClientError;
use std::collections::BTreeMap;
use tracing::debug;

/// 小于该行程（物理单位）的轴视为不动
pub const SKIP_DISTANCE: f64 = 0.01;

/// 百分比下限
const MIN_PERCENT: f64 = 0.1;

/// 单轴运动请求
#[derive(Debug, Clone, PartialEq)]
pub struct AxisMove {
    pub axis: String,
    /// 当前位置（物理单位）
    pub current: f64,
    /// 目标位置（物理单位）
    pub target: f64,
}

impl AxisMove {
    pub fn new(axis: impl Into<String>, current: f64, target: f64) -> Self {
        Self {
            axis: axis.into(),
            current,
            target,
        }
    }
}

/// 单轴下发参数（编码器单位）
#[derive(Debug, Clone, PartialEq)]
pub struct MotorMoveParam {
    pub axis: String,
    pub node_id: u8,
    /// 绝对目标；`relative` 时为增量
    pub position: i32,
    /// counts/s
    pub velocity: u32,
    /// counts/s²
    pub acceleration: u32,
    pub relative: bool,
    pub direction: DirectionPolicy,
    pub skip: bool,
    /// 该轴规划总时间（s）
    pub total_time: f64,
}

/// 同步运动计划
#[derive(Debug, Clone, PartialEq)]
pub struct MotorsMovePlan {
    pub moves: Vec<MotorMoveParam>,
    /// 最长总时间（s）
    pub move_time: f64,
}

/// 单轴时间曲线
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Profile {
    pub velocity: f64,
    pub acceleration: f64,
    pub accel_time: f64,
    pub total_time: f64,
}

impl Profile {
    pub(crate) fn compute(distance: f64, velocity: f64, acceleration: f64) -> Self {
        let accel_time = velocity / acceleration;
        let accel_dist = 0.5 * acceleration * accel_time * accel_time;
        if 2.0 * accel_dist > distance {
            let accel_time = (distance / acceleration).sqrt();
            Self {
                velocity: acceleration * accel_time,
                acceleration,
                accel_time,
                total_time: 2.0 * accel_time,
            }
        } else {
            Self {
                velocity,
                acceleration,
                accel_time,
                total_time: (distance - 2.0 * accel_dist) / velocity + 2.0 * accel_time,
            }
        }
    }
}

/// 模轴增量折叠
pub(crate) fn fold_delta(delta: f64, range: f64, policy: DirectionPolicy) -> f64 {
    let wrapped = delta.rem_euclid(range);
    match policy {
        DirectionPolicy::Shortest => {
            if wrapped > range / 2.0 {
                wrapped - range
            } else {
                wrapped
            }
        },
        DirectionPolicy::Clockwise => wrapped,
        DirectionPolicy::CounterClockwise => {
            if wrapped == 0.0 {
                0.0
            } else {
                wrapped - range
            }
        },
    }
}

fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        return 100.0;
    }
    percent.clamp(MIN_PERCENT, 100.0)
}

struct AxisPlan<'a> {
    name: &'a str,
    config: &'a AxisConfig,
    /// 编码器目标（物理单位）：绝对目标或增量
    command: f64,
    relative: bool,
    distance: f64,
    profile: Profile,
}

impl AxisPlan<'_> {
    fn is_skip(&self) -> bool {
        self.distance < SKIP_DISTANCE
    }
}

fn moving<'p, 'a>(plans: &'p [AxisPlan<'a>]) -> impl Iterator<Item = &'p AxisPlan<'a>> {
    plans.iter().filter(|p| !p.is_skip())
}

/// 规划一次同步多轴运动
///
/// 所有轴都不需要移动时返回 `Ok(None)`。
pub fn plan_move(
    axes: &BTreeMap<String, AxisConfig>,
    moves: &[AxisMove],
    velocity_percent: f64,
    acceleration_percent: f64,
) -> Result<Option<MotorsMovePlan>, ClientError> {
    let v_scale = clamp_percent(velocity_percent) / 100.0;
    let a_scale = clamp_percent(acceleration_percent) / 100.0;

    let mut plans = Vec::with_capacity(moves.len());
    for request in moves {
        let config = axes
            .get(&request.axis)
            .ok_or_else(|| ClientError::UnknownAxis(request.axis.clone()))?;
        config.check_travel(&request.axis, request.target)?;

        let (command, relative, distance) = if config.unlimited_travel {
            let delta = fold_delta(
                request.target - request.current,
                config.modulo_range,
                config.direction_policy,
            );
            (delta, true, delta.abs())
        } else {
            (request.target, false, (request.target - request.current).abs())
        };

        let profile = Profile::compute(
            distance,
            config.max_velocity * v_scale,
            config.max_acceleration * a_scale,
        );
        plans.push(AxisPlan {
            name: &request.axis,
            config,
            command,
            relative,
            distance,
            profile,
        });
    }

    if moving(&plans).next().is_none() {
        debug!("All {} axes within {} of target, nothing to do", plans.len(), SKIP_DISTANCE);
        return Ok(None);
    }

    // 加速时间同步
    let lead_accel = moving(&plans).map(|p| p.profile.accel_time).fold(0.0, f64::max);
    for plan in plans.iter_mut().filter(|p| !p.is_skip()) {
        let Profile {
            mut velocity,
            mut acceleration,
            accel_time,
            ..
        } = plan.profile;
        if accel_time < lead_accel {
            acceleration = velocity / lead_accel;
        } else if accel_time > lead_accel {
            velocity = acceleration * lead_accel;
        }
        plan.profile = Profile::compute(plan.distance, velocity, acceleration);
    }

    // 总时间同步
    let lead_total = moving(&plans).map(|p| p.profile.total_time).fold(0.0, f64::max);
    for plan in plans.iter_mut().filter(|p| !p.is_skip()) {
        let Profile {
            velocity,
            acceleration,
            total_time,
            ..
        } = plan.profile;
        if total_time >= lead_total {
            continue;
        }
        let k = plan.distance / (velocity * (lead_total - velocity / acceleration));
        plan.profile = Profile::compute(plan.distance, velocity * k, acceleration * k);
    }

    let move_time = moving(&plans).map(|p| p.profile.total_time).fold(0.0, f64::max);
    let moves = plans
        .iter()
        .map(|plan| {
            let skip = plan.is_skip();
            let (velocity, acceleration, total_time) = if skip {
                (plan.config.max_velocity, plan.config.max_acceleration, 0.0)
            } else {
                (plan.profile.velocity, plan.profile.acceleration, plan.profile.total_time)
            };
            MotorMoveParam {
                axis: plan.name.to_string(),
                node_id: plan.config.node_id,
                position: plan.config.to_counts(plan.command).round() as i32,
                velocity: plan.config.to_counts(velocity).round().max(1.0) as u32,
                acceleration: plan.config.to_counts(acceleration).round().max(1.0) as u32,
                relative: plan.relative,
                direction: plan.config.direction_policy,
                skip,
                total_time,
            }
        })
        .collect();

    Ok(Some(MotorsMovePlan { moves, move_time }))
}
