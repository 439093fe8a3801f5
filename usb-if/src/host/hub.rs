//! USB Hub 设备抽象

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Hub 类请求
///
/// 参照 USB 2.0 规范表 11-15，取值为 `bmRequestType << 8 | bRequest`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum HubRequest {
    ClearHubFeature = 0x2001,
    ClearPortFeature = 0x2301,
    GetHubDescriptor = 0xa006,
    GetHubStatus = 0xa000,
    GetPortStatus = 0xa300,
    SetHubFeature = 0x2003,
    SetPortFeature = 0x2303,
}

/// Hub 特性选择子（表 11-17）
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// 端口特性选择子（表 11-17）
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
}

/// PORT_TEST 的厂商扩展选择子：单步 SET_FEATURE 测试（EHSET）
pub const TEST_SINGLE_STEP_SET_FEATURE: u8 = 0x06;

/// Hub 描述符类型
pub const HUB_DESCRIPTOR_TYPE: u8 = 0x29;

// ============================================================================
// 共享数据结构
// ============================================================================

/// Hub 描述符
///
/// 参照 USB 2.0 规范 11.23.2.1。
#[derive(Debug, Clone)]
pub struct HubDescriptor {
    /// 端口数量
    pub num_ports: u8,

    /// Hub 特性
    pub characteristics: HubCharacteristics,

    /// 电源开通到电源良好的时间（单位：2ms）
    pub power_good_time: u8,

    /// Hub 控制器电流（单位：mA）
    pub hub_current: u8,
}

impl HubDescriptor {
    /// DeviceRemovable 与 PortPwrCtrlMask 位图各自的字节数
    fn bitmap_len(&self) -> usize {
        1 + self.num_ports as usize / 8
    }

    /// 描述符总长度 (bDescLength)
    pub fn len(&self) -> usize {
        7 + 2 * self.bitmap_len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// 按线格式写入 `buf`，返回写入的字节数（截断到 `buf.len()`）。
    ///
    /// 所有端口都标记为不可移除，PortPwrCtrlMask 按 USB 1.0 兼容要求全部置 1。
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        let mut raw = [0u8; 7 + 2 * 32];
        let len = self.len();
        let map = self.bitmap_len();
        let chars = self.characteristics.to_descriptor().to_le_bytes();

        raw[0] = len as u8;
        raw[1] = HUB_DESCRIPTOR_TYPE;
        raw[2] = self.num_ports;
        raw[3] = chars[0];
        raw[4] = chars[1];
        raw[5] = self.power_good_time;
        raw[6] = self.hub_current;
        raw[7..7 + map].fill(0);
        raw[7 + map..7 + 2 * map].fill(0xff);

        let n = len.min(buf.len());
        buf[..n].copy_from_slice(&raw[..n]);
        n
    }
}

/// Hub 特性
///
/// 参照 USB 2.0 规范图 11-16 (wHubCharacteristics)。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubCharacteristics {
    /// 电源切换模式
    pub power_switching: PowerSwitchingMode,

    /// 复合设备
    pub compound_device: bool,

    /// 过流保护模式
    pub over_current_mode: OverCurrentMode,

    /// 端口指示灯支持
    pub port_indicators: bool,
}

/// 电源切换模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitchingMode {
    /// 所有端口同时供电
    Ganged,

    /// 每个端口独立控制
    Individual,

    /// 无电源控制（总是供电）
    AlwaysPower,
}

/// 过流保护模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverCurrentMode {
    /// 全局过流保护
    Global,

    /// 每个端口独立保护
    Individual,

    /// 无过流保护
    None,
}

/// 端口状态
///
/// 参照 USB 2.0 规范表 11-21。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatus {
    /// 当前连接状态
    pub connected: bool,

    /// 端口已启用
    pub enabled: bool,

    /// 已挂起
    pub suspended: bool,

    /// 过流检测
    pub over_current: bool,

    /// 复位中
    pub resetting: bool,

    /// 电源已开启
    pub powered: bool,

    /// 低速设备连接
    pub low_speed: bool,

    /// 高速设备连接
    pub high_speed: bool,

    /// 端口状态变化标志
    pub change: PortStatusChange,
}

/// 端口状态变化标志（表 11-22）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatusChange {
    /// 连接状态变化
    pub connection_changed: bool,

    /// 启用状态变化
    pub enabled_changed: bool,

    /// 复位完成
    pub reset_complete: bool,

    /// 挂起状态变化
    pub suspend_changed: bool,

    /// 过流状态变化
    pub over_current_changed: bool,
}

/// USB 设备速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
    Wireless = 3,
    SuperSpeed = 4,
    SuperSpeedPlus = 5,
}

impl From<u8> for DeviceSpeed {
    fn from(value: u8) -> Self {
        match value {
            0 => DeviceSpeed::Low,
            1 => DeviceSpeed::Full,
            2 => DeviceSpeed::High,
            3 => DeviceSpeed::Wireless,
            4 => DeviceSpeed::SuperSpeed,
            5 => DeviceSpeed::SuperSpeedPlus,
            _ => DeviceSpeed::Full,
        }
    }
}

// ============================================================================
// 辅助函数
// ============================================================================

impl HubCharacteristics {
    /// 从描述符原始数据解析
    ///
    /// 参照 USB 2.0 规范图 11-16。
    pub fn from_descriptor(value: u16) -> Self {
        let power_switching = match value & 0x03 {
            0x00 => PowerSwitchingMode::Ganged,
            0x01 => PowerSwitchingMode::Individual,
            _ => PowerSwitchingMode::AlwaysPower,
        };

        let compound_device = (value & 0x04) != 0;
        let over_current_mode = match value & 0x18 {
            0x00 => OverCurrentMode::Global,
            0x08 => OverCurrentMode::Individual,
            _ => OverCurrentMode::None,
        };
        let port_indicators = (value & 0x80) != 0;

        Self {
            power_switching,
            compound_device,
            over_current_mode,
            port_indicators,
        }
    }

    /// 转换为描述符原始数据
    pub fn to_descriptor(&self) -> u16 {
        let mut value = 0u16;

        value |= match self.power_switching {
            PowerSwitchingMode::Ganged => 0x00,
            PowerSwitchingMode::Individual => 0x01,
            PowerSwitchingMode::AlwaysPower => 0x02,
        };

        if self.compound_device {
            value |= 0x04;
        }

        value |= match self.over_current_mode {
            OverCurrentMode::Global => 0x00,
            OverCurrentMode::Individual => 0x08,
            OverCurrentMode::None => 0x10,
        };

        if self.port_indicators {
            value |= 0x80;
        }

        value
    }
}

// wPortStatus 位定义
const STAT_CONNECTION: u32 = 0x0001;
const STAT_ENABLE: u32 = 0x0002;
const STAT_SUSPEND: u32 = 0x0004;
const STAT_OVERCURRENT: u32 = 0x0008;
const STAT_RESET: u32 = 0x0010;
const STAT_POWER: u32 = 0x0100;
const STAT_LOW_SPEED: u32 = 0x0200;
const STAT_HIGH_SPEED: u32 = 0x0400;

// wPortChange 位定义（位于状态字高 16 位）
const STAT_C_CONNECTION: u32 = 0x0001;
const STAT_C_ENABLE: u32 = 0x0002;
const STAT_C_SUSPEND: u32 = 0x0004;
const STAT_C_OVERCURRENT: u32 = 0x0008;
const STAT_C_RESET: u32 = 0x0010;

impl PortStatus {
    /// 编码为 GetPortStatus 返回的 32 位字：低 16 位 wPortStatus，高 16 位 wPortChange。
    pub fn to_wire(&self) -> u32 {
        let mut status = 0;
        let flags = [
            (self.connected, STAT_CONNECTION),
            (self.enabled, STAT_ENABLE),
            (self.suspended, STAT_SUSPEND),
            (self.over_current, STAT_OVERCURRENT),
            (self.resetting, STAT_RESET),
            (self.powered, STAT_POWER),
            (self.low_speed, STAT_LOW_SPEED),
            (self.high_speed, STAT_HIGH_SPEED),
        ];
        for (set, bit) in flags {
            if set {
                status |= bit;
            }
        }
        status | (self.change.to_wire() << 16)
    }

    pub fn from_wire(raw: u32) -> Self {
        Self {
            connected: raw & STAT_CONNECTION != 0,
            enabled: raw & STAT_ENABLE != 0,
            suspended: raw & STAT_SUSPEND != 0,
            over_current: raw & STAT_OVERCURRENT != 0,
            resetting: raw & STAT_RESET != 0,
            powered: raw & STAT_POWER != 0,
            low_speed: raw & STAT_LOW_SPEED != 0,
            high_speed: raw & STAT_HIGH_SPEED != 0,
            change: PortStatusChange::from_wire(raw >> 16),
        }
    }

    /// 已连接设备的速度，未连接时返回 `None`
    pub fn speed(&self) -> Option<DeviceSpeed> {
        if !self.connected {
            return None;
        }
        Some(if self.low_speed {
            DeviceSpeed::Low
        } else if self.high_speed {
            DeviceSpeed::High
        } else {
            DeviceSpeed::Full
        })
    }
}

impl PortStatusChange {
    pub fn any(&self) -> bool {
        self.to_wire() != 0
    }

    fn to_wire(self) -> u32 {
        let mut change = 0;
        if self.connection_changed {
            change |= STAT_C_CONNECTION;
        }
        if self.enabled_changed {
            change |= STAT_C_ENABLE;
        }
        if self.suspend_changed {
            change |= STAT_C_SUSPEND;
        }
        if self.over_current_changed {
            change |= STAT_C_OVERCURRENT;
        }
        if self.reset_complete {
            change |= STAT_C_RESET;
        }
        change
    }

    fn from_wire(raw: u32) -> Self {
        Self {
            connection_changed: raw & STAT_C_CONNECTION != 0,
            enabled_changed: raw & STAT_C_ENABLE != 0,
            suspend_changed: raw & STAT_C_SUSPEND != 0,
            over_current_changed: raw & STAT_C_OVERCURRENT != 0,
            reset_complete: raw & STAT_C_RESET != 0,
        }
    }
}
