//! 轴级机械臂控制
//!
//! [`Arm`] 在 [`Driver`] 之上按轴名操作：上电发现、使能、同步运动、回零。

use crate::config::{ArmConfig, AxisConfig, HomeConfig};
use crate::error::ClientError;
use crate::kinematics::{ElbowSolution, JointPosition, Pose, Scara};
use crate::planner::{AxisMove, MotorsMovePlan, plan_move};
use armbus_can::SplittableAdapter;
use armbus_driver::{
    Driver, DriverBuilder, DriverError, MotionWait, NodeFaultState, TpdoParams, WaitCondition,
};
use armbus_protocol::ds402::{
    CW_ENABLE_OPERATION, CW_NEW_SET_POINT, CW_RELATIVE, CW_SHUTDOWN, CW_SWITCH_ON,
    EVENT_DIGITAL_INPUT, EVENT_MOTION_COMPLETE, MAP_DIGITAL_INPUTS, MAP_POSITION_ACTUAL,
    MAP_STATUSWORD, MODE_PROFILE_POSITION, OBJ_CONTROLWORD, OBJ_MODES_OF_OPERATION,
    OBJ_PROFILE_ACCELERATION, OBJ_PROFILE_DECELERATION, OBJ_PROFILE_VELOCITY,
    OBJ_TARGET_POSITION,
};
use armbus_protocol::{NmtCommand, PdoSlot, Register};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 使能/禁用序列中每步之后的稳定时间
const SETTLE_SHORT: Duration = Duration::from_millis(100);
const SETTLE_LONG: Duration = Duration::from_millis(500);

/// `SV` 写 flash 耗时较长
const SAVE_TIMEOUT: Duration = Duration::from_secs(10);

/// 软限位寄存器索引（`VH[3]` / `VL[3]`）
const SOFT_LIMIT_INDEX: u16 = 3;

/// 机械臂
pub struct Arm {
    driver: Driver,
    config: ArmConfig,
}

impl Arm {
    /// 连接并初始化全部轴
    ///
    /// 1. 广播复位通信，收集 boot-up；与配置的节点集合不一致时返回 `NotReady`
    /// 2. NMT 启动
    /// 3. 每轴：轮廓位置模式，TPDO1（状态字 + 位置，运动完成触发），
    ///    TPDO3（数字输入，输入变化触发）
    pub async fn connect<A>(adapter: A, config: ArmConfig) -> Result<Self, ClientError>
    where
        A: SplittableAdapter,
        A::RxAdapter: Send + 'static,
        A::TxAdapter: Send + 'static,
    {
        config.validate()?;
        let driver = DriverBuilder::new()
            .config(config.driver_config())
            .build(adapter)?;

        let expected = config.node_ids();
        let booted = driver
            .reset_communication_and_collect(&expected, config.boot_window())
            .await?;
        let expected_set: BTreeSet<u8> = expected.iter().copied().collect();
        if booted != expected_set {
            return Err(DriverError::NotReady(format!(
                "expected nodes {:?}, discovered {:?}",
                expected_set, booted
            ))
            .into());
        }

        driver.nmt(NmtCommand::Start, 0).await?;
        for &node in &expected {
            driver
                .sdo_download_u8(node, OBJ_MODES_OF_OPERATION, 0, MODE_PROFILE_POSITION)
                .await?;
            driver
                .map_tpdo(
                    node,
                    PdoSlot::Tpdo1,
                    &[MAP_STATUSWORD, MAP_POSITION_ACTUAL],
                    TpdoParams {
                        trigger: EVENT_MOTION_COMPLETE,
                        timer_ms: 0,
                        inhibit: 0,
                    },
                )
                .await?;
            driver
                .map_tpdo(
                    node,
                    PdoSlot::Tpdo3,
                    &[MAP_DIGITAL_INPUTS],
                    TpdoParams {
                        trigger: EVENT_DIGITAL_INPUT,
                        timer_ms: 0,
                        inhibit: 0,
                    },
                )
                .await?;
        }

        info!("Arm connected on {} with nodes {:?}", config.can_interface, expected);
        Ok(Self { driver, config })
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn config(&self) -> &ArmConfig {
        &self.config
    }

    fn axis(&self, name: &str) -> Result<&AxisConfig, ClientError> {
        self.config.axis(name)
    }

    /// 最近一次 TPDO 上报的位置（物理单位）
    pub fn position(&self, axis: &str) -> Result<Option<f64>, ClientError> {
        let config = self.axis(axis)?;
        Ok(self
            .driver
            .feedback(config.node_id)
            .position
            .map(|counts| config.from_counts(counts)))
    }

    /// 当前位置；没有 TPDO 反馈时查询 `PX`
    pub async fn read_position(&self, axis: &str) -> Result<f64, ClientError> {
        if let Some(position) = self.position(axis)? {
            return Ok(position);
        }
        let config = self.axis(axis)?;
        let counts = self
            .driver
            .query_value(config.node_id, Register::Px, 0)
            .await?
            .as_i32();
        Ok(config.from_counts(counts))
    }

    /// DS402 使能/禁用，最后用 `MO` 查询确认
    pub async fn motor_enable(&self, axis: &str, state: bool) -> Result<(), ClientError> {
        let node = self.axis(axis)?.node_id;
        if state {
            self.write_controlword(node, CW_SHUTDOWN).await?;
            tokio::time::sleep(SETTLE_SHORT).await;
            self.write_controlword(node, CW_SWITCH_ON).await?;
            tokio::time::sleep(SETTLE_SHORT).await;
            self.write_controlword(node, CW_ENABLE_OPERATION).await?;
        } else {
            self.write_controlword(node, CW_SWITCH_ON).await?;
            tokio::time::sleep(SETTLE_SHORT).await;
            self.write_controlword(node, CW_SHUTDOWN).await?;
        }
        tokio::time::sleep(SETTLE_LONG).await;

        let mo = self.driver.query_value(node, Register::Mo, 0).await?.as_i32();
        if (mo == 1) != state {
            return Err(DriverError::CommandMismatch {
                command: format!("MO@{}", node),
                expected: (state as i32).to_string(),
                actual: mo.to_string(),
            }
            .into());
        }
        info!("Axis {} motor {}", axis, if state { "enabled" } else { "disabled" });
        Ok(())
    }

    async fn write_controlword(&self, node: u8, value: u16) -> Result<(), DriverError> {
        self.driver.sdo_download_u16(node, OBJ_CONTROLWORD, 0, value).await
    }

    /// 规划到目标位置（物理单位）的同步运动
    pub async fn plan(
        &self,
        targets: &[(&str, f64)],
        velocity_percent: f64,
        acceleration_percent: f64,
    ) -> Result<Option<MotorsMovePlan>, ClientError> {
        let mut moves = Vec::with_capacity(targets.len());
        for (axis, target) in targets {
            moves.push(AxisMove::new(*axis, self.read_position(axis).await?, *target));
        }
        plan_move(&self.config.axes, &moves, velocity_percent, acceleration_percent)
    }

    /// 下发计划并等待全部轴到位
    ///
    /// 等待超时为 `move_time` 加配置余量；致命 EMCY 以 `HardwareFault` 提前唤醒。
    pub async fn motors_move_absolute_execute(
        &self,
        plan: &MotorsMovePlan,
    ) -> Result<(), ClientError> {
        let move_time = Duration::try_from_secs_f64(plan.move_time).map_err(|e| {
            ClientError::InvalidPlan(format!("move_time {}: {}", plan.move_time, e))
        })?;
        for m in &plan.moves {
            let state = self.driver.fault_state(m.node_id);
            if state.blocks_motion() {
                let description = state
                    .last_fault
                    .map(|f| f.description.to_string())
                    .unwrap_or_else(|| "interpolation fault pending".to_string());
                return Err(DriverError::HardwareFault {
                    node: m.node_id,
                    description,
                }
                .into());
            }
        }

        let waits = self.register_waits(plan)?;
        let result = self.issue_and_wait(plan, move_time, waits).await;
        if result.is_err() {
            for m in plan.moves.iter().filter(|m| !m.skip) {
                self.driver.cancel_motion_wait(m.node_id);
            }
        }
        result
    }

    fn register_waits(&self, plan: &MotorsMovePlan) -> Result<Vec<MotionWait>, ClientError> {
        let mut waits = Vec::with_capacity(plan.moves.len());
        for m in plan.moves.iter().filter(|m| !m.skip) {
            match self.driver.register_motion_wait(m.node_id, WaitCondition::TargetReached) {
                Ok(wait) => waits.push(wait),
                Err(e) => {
                    for wait in &waits {
                        self.driver.cancel_motion_wait(wait.node_id());
                    }
                    return Err(e.into());
                },
            }
        }
        Ok(waits)
    }

    async fn issue_and_wait(
        &self,
        plan: &MotorsMovePlan,
        move_time: Duration,
        waits: Vec<MotionWait>,
    ) -> Result<(), ClientError> {
        for m in &plan.moves {
            let node = m.node_id;
            self.driver
                .sdo_download_u32(node, OBJ_PROFILE_VELOCITY, 0, m.velocity)
                .await?;
            self.driver
                .sdo_download_u32(node, OBJ_PROFILE_ACCELERATION, 0, m.acceleration)
                .await?;
            self.driver
                .sdo_download_u32(node, OBJ_PROFILE_DECELERATION, 0, m.acceleration)
                .await?;
            self.driver
                .sdo_download_i32(node, OBJ_TARGET_POSITION, 0, m.position)
                .await?;

            let mut controlword = CW_ENABLE_OPERATION;
            if m.relative {
                controlword |= CW_RELATIVE;
            }
            // 新设定点在上升沿生效
            self.write_controlword(node, controlword).await?;
            self.write_controlword(node, controlword | CW_NEW_SET_POINT).await?;
            debug!(
                "Axis {} -> {} (v={}, a={}, relative={})",
                m.axis, m.position, m.velocity, m.acceleration, m.relative
            );
        }

        let timeout = move_time + self.config.move_timeout_margin();
        let deadline = Instant::now() + timeout;
        for wait in waits {
            let remaining = deadline.saturating_duration_since(Instant::now());
            wait.wait(remaining).await?;
        }
        Ok(())
    }

    /// 移动到笛卡尔位姿
    pub async fn move_to_pose(
        &self,
        pose: Pose,
        solution: ElbowSolution,
        velocity_percent: f64,
        acceleration_percent: f64,
    ) -> Result<(), ClientError> {
        let kin = self
            .config
            .kinematics
            .as_ref()
            .ok_or_else(|| ClientError::Config("no kinematics configured".to_string()))?;
        let joints = Scara::from_config(kin).inverse(pose, solution)?;
        let targets = [
            (kin.shoulder_axis.as_str(), joints.shoulder),
            (kin.z_axis.as_str(), joints.z),
            (kin.elbow_axis.as_str(), joints.elbow),
            (kin.wrist_axis.as_str(), joints.wrist),
        ];
        match self.plan(&targets, velocity_percent, acceleration_percent).await? {
            Some(plan) => self.motors_move_absolute_execute(&plan).await,
            None => Ok(()),
        }
    }

    /// 由关节反馈计算当前位姿
    pub async fn current_pose(&self) -> Result<Pose, ClientError> {
        let kin = self
            .config
            .kinematics
            .as_ref()
            .ok_or_else(|| ClientError::Config("no kinematics configured".to_string()))?;
        let joints = JointPosition {
            shoulder: self.read_position(&kin.shoulder_axis).await?,
            z: self.read_position(&kin.z_axis).await?,
            elbow: self.read_position(&kin.elbow_axis).await?,
            wrist: self.read_position(&kin.wrist_axis).await?,
        };
        Ok(Scara::from_config(kin).forward(joints))
    }

    /// 回零
    ///
    /// 保存并放开软限位 → `XQ##subroutine` → 等待回零开关 → 写入零点偏移。
    /// 无论成功与否，最后都会 `KL` 停止程序并恢复软限位。
    pub async fn home_motor(&self, axis: &str) -> Result<(), ClientError> {
        let config = self.axis(axis)?;
        let home = config
            .home
            .clone()
            .ok_or_else(|| ClientError::Config(format!("axis {} has no home settings", axis)))?;
        let node = config.node_id;

        let high = self.driver.query_value(node, Register::Vh, SOFT_LIMIT_INDEX).await?;
        let low = self.driver.query_value(node, Register::Vl, SOFT_LIMIT_INDEX).await?;
        debug!("Axis {} saved soft limits [{}, {}]", axis, low, high);

        let outcome = self.run_homing(config, &home).await;

        let mut cleanup: Result<(), DriverError> = Ok(());
        if let Err(e) = self.driver.execute(node, Register::Kl).await {
            warn!("Axis {}: KL after homing failed: {}", axis, e);
            cleanup = Err(e);
        }
        for (register, value) in [(Register::Vh, high), (Register::Vl, low)] {
            if let Err(e) = self.driver.set(node, register, SOFT_LIMIT_INDEX, value).await {
                warn!("Axis {}: restoring {} failed: {}", axis, register, e);
                if cleanup.is_ok() {
                    cleanup = Err(e);
                }
            }
        }

        outcome?;
        cleanup?;
        info!("Axis {} homed", axis);
        Ok(())
    }

    async fn run_homing(&self, config: &AxisConfig, home: &HomeConfig) -> Result<(), ClientError> {
        let node = config.node_id;
        let span = config.to_counts(home.search_range).round() as i32;
        self.driver.set(node, Register::Vh, SOFT_LIMIT_INDEX, span).await?;
        self.driver.set(node, Register::Vl, SOFT_LIMIT_INDEX, -span).await?;

        let wait = self.driver.register_motion_wait(
            node,
            WaitCondition::InputLevel {
                mask: home.input_mask,
                active: home.active_level,
            },
        )?;
        let timeout = Duration::from_millis(home.timeout_ms);
        let command = format!("XQ##{}", home.subroutine);
        if let Err(e) = self
            .driver
            .os_command(node, &command, false, self.driver.config().transport.response_timeout)
            .await
        {
            self.driver.cancel_motion_wait(node);
            return Err(e.into());
        }
        wait.wait(timeout).await?;

        let offset = config.to_counts(home.offset).round() as i32;
        self.driver.set(node, Register::Px, 0, offset).await?;
        Ok(())
    }

    /// `SV` 保存参数到 flash
    pub async fn save_parameters(&self, axis: &str) -> Result<(), ClientError> {
        let node = self.axis(axis)?.node_id;
        self.driver
            .execute_with_timeout(node, Register::Sv, SAVE_TIMEOUT)
            .await?;
        Ok(())
    }

    /// EMCY 记录的故障/队列状态
    pub fn faults(&self, axis: &str) -> Result<NodeFaultState, ClientError> {
        Ok(self.driver.fault_state(self.axis(axis)?.node_id))
    }

    /// 查询驱动器 `MF` 故障位（0 = 无故障）
    pub async fn motor_fault(&self, axis: &str) -> Result<u32, ClientError> {
        let node = self.axis(axis)?.node_id;
        Ok(self.driver.query_value(node, Register::Mf, 0).await?.as_i32() as u32)
    }
}
