//! DS402 运动控制对象字典常量

use bilge::prelude::*;

use crate::pdo::MappedObject;

pub const OBJ_CONTROLWORD: u16 = 0x6040;
pub const OBJ_STATUSWORD: u16 = 0x6041;
pub const OBJ_MODES_OF_OPERATION: u16 = 0x6060;
pub const OBJ_POSITION_ACTUAL: u16 = 0x6064;
pub const OBJ_VELOCITY_ACTUAL: u16 = 0x606C;
pub const OBJ_TARGET_POSITION: u16 = 0x607A;
pub const OBJ_PROFILE_VELOCITY: u16 = 0x6081;
pub const OBJ_PROFILE_ACCELERATION: u16 = 0x6083;
pub const OBJ_PROFILE_DECELERATION: u16 = 0x6084;
pub const OBJ_DIGITAL_INPUTS: u16 = 0x60FD;
pub const OBJ_DEVICE_TYPE: u16 = 0x1000;

/// 常用 PDO 映射对象
pub const MAP_STATUSWORD: MappedObject = MappedObject::new(OBJ_STATUSWORD, 0, 16);
pub const MAP_POSITION_ACTUAL: MappedObject = MappedObject::new(OBJ_POSITION_ACTUAL, 0, 32);
pub const MAP_VELOCITY_ACTUAL: MappedObject = MappedObject::new(OBJ_VELOCITY_ACTUAL, 0, 32);
pub const MAP_DIGITAL_INPUTS: MappedObject = MappedObject::new(OBJ_DIGITAL_INPUTS, 0, 32);
pub const MAP_CONTROLWORD: MappedObject = MappedObject::new(OBJ_CONTROLWORD, 0, 16);
pub const MAP_TARGET_POSITION: MappedObject = MappedObject::new(OBJ_TARGET_POSITION, 0, 32);

/// 运行模式：轮廓位置模式
pub const MODE_PROFILE_POSITION: u8 = 1;

/// 控制字：关闭（Ready to switch on）
pub const CW_SHUTDOWN: u16 = 0x0006;
/// 控制字：上电（Switched on）
pub const CW_SWITCH_ON: u16 = 0x0007;
/// 控制字：使能运行
pub const CW_ENABLE_OPERATION: u16 = 0x000F;
/// 控制字：禁用电压
pub const CW_DISABLE_VOLTAGE: u16 = 0x0000;
/// 控制字：故障复位
pub const CW_FAULT_RESET: u16 = 0x0080;
/// 控制字 bit 4：新设定点
pub const CW_NEW_SET_POINT: u16 = 0x0010;
/// 控制字 bit 5：立即变更设定点
pub const CW_CHANGE_IMMEDIATELY: u16 = 0x0020;
/// 控制字 bit 6：相对位置
pub const CW_RELATIVE: u16 = 0x0040;
/// 控制字 bit 8：暂停
pub const CW_HALT: u16 = 0x0100;

/// Elmo TPDO 事件触发位：运动完成
pub const EVENT_MOTION_COMPLETE: u32 = 1 << 0;
/// Elmo TPDO 事件触发位：数字输入变化
pub const EVENT_DIGITAL_INPUT: u32 = 1 << 5;

/// 状态字位域（低 16 位）
#[bitsize(16)]
#[derive(FromBits, DebugBits, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusWord {
    pub ready_to_switch_on: bool,
    pub switched_on: bool,
    pub operation_enabled: bool,
    pub fault: bool,
    pub voltage_enabled: bool,
    pub quick_stop: bool,
    pub switch_on_disabled: bool,
    pub warning: bool,
    pub manufacturer: bool,
    pub remote: bool,
    pub target_reached: bool,
    pub internal_limit: bool,
    pub set_point_acknowledge: bool,
    pub following_error: bool,
    pub manufacturer_high: u2,
}

/// 数字输入（`0x60FD`）位定义
pub const DI_NEGATIVE_LIMIT: u32 = 1 << 0;
pub const DI_POSITIVE_LIMIT: u32 = 1 << 1;
pub const DI_HOME_SWITCH: u32 = 1 << 2;
/// 通用输入从 bit 16 开始
pub const DI_GENERAL_SHIFT: u32 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statusword_bits() {
        // 0x0637: ready + switched on + enabled + voltage + quick stop + remote + target reached
        let sw = StatusWord::from(0x0637u16);
        assert!(sw.ready_to_switch_on());
        assert!(sw.operation_enabled());
        assert!(!sw.fault());
        assert!(sw.remote());
        assert!(sw.target_reached());
    }

    #[test]
    fn test_statusword_fault() {
        let sw = StatusWord::from(0x0008u16);
        assert!(sw.fault());
        assert!(!sw.target_reached());
    }
}
