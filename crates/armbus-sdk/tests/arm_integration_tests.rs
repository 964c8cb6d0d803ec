//! Arm 高层接口集成测试
//!
//! 使用 MockCanBus + 脚本化驱动器模拟覆盖：
//! - connect（boot-up 发现、PDO 映射）
//! - motor_enable
//! - 规划 + 同步运动执行
//! - 回零（成功与失败时都恢复软限位）

mod common;

use armbus_sdk::can::MockCanBus;
use armbus_sdk::prelude::*;
use armbus_sdk::protocol::BinaryValue;
use armbus_sdk::protocol::ds402::DI_HOME_SWITCH;
use common::DriveSim;
use std::time::Duration;

const CONFIG: &str = r#"
can_interface = "mock"

[transport]
response_timeout_ms = 300
boot_window_ms = 300
move_timeout_margin_ms = 1000

[axes.shoulder]
node_id = 1
conversion_factor = 100.0
min_travel = -170.0
max_travel = 170.0
max_velocity = 400.0
max_acceleration = 4000.0

[axes.elbow]
node_id = 2
conversion_factor = 100.0
min_travel = -150.0
max_travel = 150.0
max_velocity = 400.0
max_acceleration = 4000.0

[axes.elbow.home]
subroutine = "HOME2"
timeout_ms = 300
"#;

async fn connect(sim_nodes: &[u8]) -> Result<(MockCanBus, DriveSim, Arm), ClientError> {
    let bus = MockCanBus::new();
    let sim = DriveSim::new(sim_nodes);
    sim.attach(&bus);
    let config = ArmConfig::from_toml_str(CONFIG)?;
    let arm = Arm::connect(bus.clone(), config).await?;
    Ok((bus, sim, arm))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_maps_pdos() {
    let (bus, sim, arm) = connect(&[1, 2]).await.unwrap();

    for node in [1, 2] {
        let tpdo1 = arm.driver().pdo_mapping(node, PdoSlot::Tpdo1).unwrap();
        assert_eq!(tpdo1.len(), 2);
        assert!(arm.driver().pdo_mapping(node, PdoSlot::Tpdo3).is_some());
        assert_eq!(sim.object(node, 0x6060, 0), Some(vec![1]));
        // TPDO1 COB-ID 最终去掉禁用位
        assert_eq!(
            sim.object(node, 0x1800, 1),
            Some((0x180u32 + node as u32).to_le_bytes().to_vec())
        );
    }

    let sent = bus.sent_frames();
    assert_eq!(sent[0].id, 0x000);
    assert_eq!(sent[0].data_slice(), &[0x82, 0x00]);
    assert!(sent.iter().any(|f| f.id == 0x000 && f.data_slice() == [0x01, 0x00]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_missing_node_is_not_ready() {
    let result = connect(&[1]).await;
    match result {
        Err(ClientError::Driver(DriverError::NotReady(msg))) => assert!(msg.contains("discovered")),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("connect should fail with a missing node"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_motor_enable_verified_by_mo() {
    let (_bus, sim, arm) = connect(&[1, 2]).await.unwrap();
    arm.motor_enable("shoulder", true).await.unwrap();
    assert_eq!(sim.register(1, Register::Mo, 0), Some(BinaryValue::Int(1)));
    arm.motor_enable("shoulder", false).await.unwrap();
    assert_eq!(sim.register(1, Register::Mo, 0), Some(BinaryValue::Int(0)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_synchronized_move_completes() {
    let (_bus, sim, arm) = connect(&[1, 2]).await.unwrap();

    let plan = arm
        .plan(&[("shoulder", 90.0), ("elbow", -30.0)], 50.0, 50.0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.moves.len(), 2);
    assert!((plan.moves[0].total_time - plan.moves[1].total_time).abs() < 1e-6);

    arm.motors_move_absolute_execute(&plan).await.unwrap();

    assert_eq!(sim.object(1, 0x607A, 0), Some(9000i32.to_le_bytes().to_vec()));
    assert_eq!(sim.object(2, 0x607A, 0), Some((-3000i32).to_le_bytes().to_vec()));
    assert_eq!(arm.position("shoulder").unwrap(), Some(90.0));
    assert_eq!(arm.position("elbow").unwrap(), Some(-30.0));

    // 已在目标：无需运动
    let again = arm.plan(&[("shoulder", 90.0)], 50.0, 50.0).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_out_of_range_rejected() {
    let (_bus, _sim, arm) = connect(&[1, 2]).await.unwrap();
    let err = arm.plan(&[("elbow", 200.0)], 50.0, 50.0).await.unwrap_err();
    assert!(matches!(err, ClientError::OutOfRange { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hand_built_plan_with_bad_move_time_rejected() {
    let (bus, _sim, arm) = connect(&[1, 2]).await.unwrap();
    let mut plan = arm.plan(&[("shoulder", 10.0)], 50.0, 50.0).await.unwrap().unwrap();
    let sent_before = bus.sent_frames().len();

    for move_time in [f64::NAN, -1.0, f64::INFINITY] {
        plan.move_time = move_time;
        let err = arm.motors_move_absolute_execute(&plan).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidPlan(_)), "{}", move_time);
    }
    assert_eq!(bus.sent_frames().len(), sent_before);

    // 未留下运动等待
    plan.move_time = 1.0;
    arm.motors_move_absolute_execute(&plan).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_times_out_without_completion() {
    let (_bus, sim, arm) = connect(&[1, 2]).await.unwrap();
    sim.state.lock().unwrap().complete_moves = false;

    let plan = arm.plan(&[("shoulder", 1.0)], 100.0, 100.0).await.unwrap().unwrap();
    let err = arm.motors_move_absolute_execute(&plan).await.unwrap_err();
    assert!(matches!(err, ClientError::Driver(DriverError::Timeout)));

    // 失败后等待已清理，可以再次下发
    sim.state.lock().unwrap().complete_moves = true;
    arm.motors_move_absolute_execute(&plan).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_home_motor_restores_limits() {
    let (bus, sim, arm) = connect(&[1, 2]).await.unwrap();
    sim.set_register(2, Register::Vh, 3, BinaryValue::Int(15_000));
    sim.set_register(2, Register::Vl, 3, BinaryValue::Int(-15_000));
    sim.state.lock().unwrap().home_inputs = Some(DI_HOME_SWITCH);

    arm.home_motor("elbow").await.unwrap();

    assert!(sim.os_commands().contains(&(2, "XQ##HOME2".to_string())));
    assert_eq!(sim.register(2, Register::Vh, 3), Some(BinaryValue::Int(15_000)));
    assert_eq!(sim.register(2, Register::Vl, 3), Some(BinaryValue::Int(-15_000)));
    assert_eq!(sim.register(2, Register::Px, 0), Some(BinaryValue::Int(0)));
    // KL 停止程序
    assert!(bus
        .sent_frames()
        .iter()
        .any(|f| f.id == 0x302 && f.data_slice()[..2] == *b"KL"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_home_motor_failure_still_cleans_up() {
    let (bus, sim, arm) = connect(&[1, 2]).await.unwrap();
    sim.set_register(2, Register::Vh, 3, BinaryValue::Int(15_000));
    sim.set_register(2, Register::Vl, 3, BinaryValue::Int(-15_000));
    // 回零开关不触发

    let err = arm.home_motor("elbow").await.unwrap_err();
    assert!(matches!(err, ClientError::Driver(DriverError::Timeout)));

    assert_eq!(sim.register(2, Register::Vh, 3), Some(BinaryValue::Int(15_000)));
    assert_eq!(sim.register(2, Register::Vl, 3), Some(BinaryValue::Int(-15_000)));
    assert!(bus
        .sent_frames()
        .iter()
        .any(|f| f.id == 0x302 && f.data_slice()[..2] == *b"KL"));

    assert!(matches!(
        arm.home_motor("shoulder").await,
        Err(ClientError::Config(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fault_blocks_motion() {
    let (bus, _sim, arm) = connect(&[1, 2]).await.unwrap();
    bus.inject(ArmFrame::new(0x082, &[0x20, 0x31, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(arm.faults("elbow").unwrap().blocks_motion());
    let plan = arm.plan(&[("elbow", 10.0)], 50.0, 50.0).await.unwrap().unwrap();
    let err = arm.motors_move_absolute_execute(&plan).await.unwrap_err();
    assert!(matches!(err, ClientError::Driver(DriverError::HardwareFault { node: 2, .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_save_parameters() {
    let (bus, _sim, arm) = connect(&[1, 2]).await.unwrap();
    arm.save_parameters("shoulder").await.unwrap();
    assert!(bus
        .sent_frames()
        .iter()
        .any(|f| f.id == 0x301 && f.data_slice()[..2] == *b"SV"));
}
