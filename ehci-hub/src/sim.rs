//! 测试用寄存器模型与手动时钟
//!
//! 只模拟 root hub 逻辑依赖的行为：PORTSC 写 1 清零的变化位、PE 只能由软件
//! 清除、OWNER 交接、复位/恢复结束时的硬件反应，以及 USBCMD/USBSTS 的联动。

use alloc::{sync::Arc, vec::Vec};
use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use spin::Mutex;
use usb_if::host::hub::{DeviceSpeed, HubRequest, PortFeature, PortStatus};

use crate::{
    hub::{EhciRootHub, RootHubConfig},
    osal::Kernel,
    quirks::Quirks,
    reg::{
        CMD_ASE, CMD_PSE, CMD_RUN, PORT_RWC_BITS, PORT_WAKE_BITS, PORTSC, Reg, RegisterAccess,
        STS_ASS, STS_HALT, STS_PCD, STS_PSS,
    },
};

const fn bit(field: tock_registers::fields::Field<u32, PORTSC::Register>) -> u32 {
    field.mask << field.shift
}

const CONNECT: u32 = bit(PORTSC::CONNECT);
const CSC: u32 = bit(PORTSC::CSC);
const PE: u32 = bit(PORTSC::PE);
const PEC: u32 = bit(PORTSC::PEC);
const OC: u32 = bit(PORTSC::OC);
const OCC: u32 = bit(PORTSC::OCC);
const RESUME: u32 = bit(PORTSC::RESUME);
const SUSPEND: u32 = bit(PORTSC::SUSPEND);
const RESET: u32 = bit(PORTSC::RESET);
const LINE_STATUS: u32 = bit(PORTSC::LINE_STATUS);
const POWER: u32 = bit(PORTSC::POWER);
const OWNER: u32 = bit(PORTSC::OWNER);
const PSPD: u32 = bit(PORTSC::PSPD);

/// 软件可以直接读写的 PORTSC 位
const SW_BITS: u32 = PORT_WAKE_BITS
    | bit(PORTSC::INDICATOR)
    | bit(PORTSC::TEST)
    | bit(PORTSC::DEV_ADDR)
    | bit(PORTSC::LPM);

#[derive(Debug, Default, Clone)]
pub struct SimPort {
    pub portsc: u32,
    pub hostpc: u32,
    pub device: Option<DeviceSpeed>,
    /// 写 0 也无法结束复位
    pub stuck_reset: bool,
}

pub struct SimHw {
    pub ports: Vec<SimPort>,
    pub hcsparams: u32,
    pub hccparams: u32,
    pub command: u32,
    pub status: u32,
    pub intr: u32,
    pub frindex: u32,
    pub segment: u32,
    pub frame_list: u32,
    pub async_next: u32,
    pub config_flag: u32,
    /// 集成 TT：PSPD 字段报告端口速度
    pub integrated_tt: bool,
    /// 置 RESUME 后硬件自行结束恢复
    pub auto_resume: bool,
    /// 控制器被拔出，读寄存器得到全 1
    pub removed: bool,
    pub accessible: bool,
    /// 所有写操作的记录
    pub writes: Vec<(Reg, u32)>,
}

pub type SimHandle = Arc<Mutex<SimHw>>;

#[derive(Clone)]
pub struct SimRegs(SimHandle);

impl SimHw {
    pub fn new(n_ports: usize, ppc: bool) -> (SimRegs, SimHandle) {
        let hw = SimHw {
            ports: (0..n_ports)
                .map(|_| SimPort {
                    portsc: POWER,
                    ..Default::default()
                })
                .collect(),
            hcsparams: n_ports as u32 | if ppc { 1 << 4 } else { 0 },
            hccparams: 0,
            command: 0,
            status: STS_HALT,
            intr: 0,
            frindex: 0,
            segment: 0,
            frame_list: 0,
            async_next: 0,
            config_flag: 0,
            integrated_tt: false,
            auto_resume: false,
            removed: false,
            accessible: true,
            writes: Vec::new(),
        };
        let handle = Arc::new(Mutex::new(hw));
        (SimRegs(handle.clone()), handle)
    }

    fn ppc(&self) -> bool {
        self.hcsparams & (1 << 4) != 0
    }

    fn has_ppcd(&self) -> bool {
        self.hccparams & (1 << 18) != 0
    }

    /// 硬件置位了端口变化位
    fn port_changed(&mut self, port: usize) {
        self.status |= STS_PCD;
        if self.has_ppcd() {
            self.status |= 1 << (16 + port);
        }
    }

    pub fn connect(&mut self, port: usize, speed: DeviceSpeed) {
        let p = &mut self.ports[port];
        p.device = Some(speed);
        if p.portsc & (POWER | OWNER) == POWER {
            p.portsc |= CONNECT | CSC;
            self.port_changed(port);
        }
    }

    pub fn disconnect(&mut self, port: usize) {
        let p = &mut self.ports[port];
        p.device = None;
        if p.portsc & CONNECT != 0 {
            p.portsc &= !(CONNECT | PE | SUSPEND | RESUME);
            p.portsc |= CSC;
            self.port_changed(port);
        }
    }

    pub fn set_over_current(&mut self, port: usize, active: bool) {
        let p = &mut self.ports[port];
        if active {
            p.portsc |= OC;
        } else {
            p.portsc &= !OC;
        }
        p.portsc |= OCC;
        self.port_changed(port);
    }

    /// 挂起的设备发出远程唤醒
    pub fn remote_wakeup(&mut self, port: usize) {
        let p = &mut self.ports[port];
        if p.portsc & SUSPEND != 0 {
            p.portsc |= RESUME;
            self.port_changed(port);
        }
    }

    /// 硬件因错误禁用端口
    pub fn port_error(&mut self, port: usize) {
        let p = &mut self.ports[port];
        if p.portsc & PE != 0 {
            p.portsc &= !PE;
            p.portsc |= PEC;
            self.port_changed(port);
        }
    }

    /// 掉电：寄存器内容丢失，端口重新路由到本控制器
    pub fn lose_power(&mut self) {
        self.intr = 0;
        self.command = 0;
        self.status = STS_HALT;
        for p in &mut self.ports {
            p.portsc = POWER;
            p.hostpc = 0;
            if p.device.is_some() {
                p.portsc |= CONNECT | CSC;
            }
        }
    }

    pub fn portsc(&self, port: usize) -> u32 {
        self.read_portsc(port)
    }

    fn read_portsc(&self, port: usize) -> u32 {
        let p = &self.ports[port];
        let mut value = p.portsc & !(LINE_STATUS | PSPD);
        if value & (CONNECT | PE) == CONNECT {
            let line = match p.device {
                Some(DeviceSpeed::Low) => 1,
                _ => 2,
            };
            value |= line << 10;
        }
        if self.integrated_tt && value & CONNECT != 0 {
            value |= speed_code(p.device) << 26;
        }
        value
    }

    fn read_hostpc(&self, port: usize) -> u32 {
        let p = &self.ports[port];
        let mut value = p.hostpc & !(3 << 25);
        if p.portsc & CONNECT != 0 {
            value |= speed_code(p.device) << 25;
        }
        value
    }

    fn write_portsc(&mut self, port: usize, value: u32) {
        let ppc = self.ppc();
        let auto_resume = self.auto_resume;
        let integrated_tt = self.integrated_tt;
        let p = &mut self.ports[port];
        let old = p.portsc;

        let mut new = old & !(value & PORT_RWC_BITS);
        new = (new & !SW_BITS) | (value & SW_BITS);

        if value & PE == 0 {
            new &= !PE;
        }

        if ppc && (old ^ value) & POWER != 0 {
            if value & POWER == 0 {
                new &= !(POWER | CONNECT | PE | SUSPEND | RESUME);
                if old & CONNECT != 0 {
                    new |= CSC;
                }
            } else {
                new |= POWER;
                if p.device.is_some() && old & OWNER == 0 {
                    new |= CONNECT | CSC;
                }
            }
        }

        if (old ^ value) & OWNER != 0 {
            if value & OWNER != 0 {
                // 端口使能时控制器不会接受 OWNER
                if old & PE == 0 {
                    new |= OWNER;
                    new &= !(PE | SUSPEND | RESUME);
                    if new & CONNECT != 0 {
                        new &= !CONNECT;
                        new |= CSC;
                    }
                }
            } else {
                new &= !OWNER;
                if p.device.is_some() && new & POWER != 0 {
                    new |= CONNECT | CSC;
                }
            }
        }

        if value & SUSPEND != 0 && new & PE != 0 {
            new |= SUSPEND;
        }

        if value & RESUME != 0 {
            if old & RESUME == 0 && auto_resume {
                new &= !(RESUME | SUSPEND);
            } else {
                new |= RESUME;
            }
        } else if old & RESUME != 0 {
            new &= !(RESUME | SUSPEND);
        }

        if value & RESET != 0 {
            new |= RESET;
            new &= !(PE | SUSPEND);
        } else if old & RESET != 0 {
            if p.stuck_reset {
                new |= RESET;
            } else {
                new &= !RESET;
                // 没有集成 TT 时只有高速设备能完成握手
                if new & CONNECT != 0 && (integrated_tt || p.device == Some(DeviceSpeed::High)) {
                    new |= PE;
                }
            }
        }

        p.portsc = new;
        if new & PORT_RWC_BITS == 0 {
            self.status &= !(1 << (16 + port));
        }
    }

    fn write_command(&mut self, value: u32) {
        self.command = value;
        let mut status = self.status & !(STS_HALT | STS_ASS | STS_PSS);
        if value & CMD_RUN == 0 {
            status |= STS_HALT;
        }
        if value & CMD_ASE != 0 {
            status |= STS_ASS;
        }
        if value & CMD_PSE != 0 {
            status |= STS_PSS;
        }
        self.status = status;
    }
}

fn speed_code(device: Option<DeviceSpeed>) -> u32 {
    match device {
        Some(DeviceSpeed::Full) => 0,
        Some(DeviceSpeed::Low) => 1,
        _ => 2,
    }
}

impl RegisterAccess for SimRegs {
    fn read(&self, reg: Reg) -> u32 {
        let hw = self.0.lock();
        if hw.removed {
            return u32::MAX;
        }
        match reg {
            Reg::HcsParams => hw.hcsparams,
            Reg::HccParams => hw.hccparams,
            Reg::Command => hw.command,
            Reg::Status => hw.status,
            Reg::IntrEnable => hw.intr,
            Reg::FrameIndex => hw.frindex,
            Reg::Segment => hw.segment,
            Reg::FrameList => hw.frame_list,
            Reg::AsyncNext => hw.async_next,
            Reg::ConfigFlag => hw.config_flag,
            Reg::PortSc(i) => hw.read_portsc(i),
            Reg::HostPc(i) => hw.read_hostpc(i),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        let mut hw = self.0.lock();
        hw.writes.push((reg, value));
        match reg {
            Reg::HcsParams | Reg::HccParams => {}
            Reg::Command => hw.write_command(value),
            // 低 6 位与 PPCD 写 1 清零
            Reg::Status => hw.status &= !(value & 0xffff_003f),
            Reg::IntrEnable => hw.intr = value,
            Reg::FrameIndex => hw.frindex = value,
            Reg::Segment => hw.segment = value,
            Reg::FrameList => hw.frame_list = value,
            Reg::AsyncNext => hw.async_next = value,
            Reg::ConfigFlag => hw.config_flag = value,
            Reg::PortSc(i) => hw.write_portsc(i, value),
            Reg::HostPc(i) => hw.ports[i].hostpc = value,
        }
    }

    fn hw_accessible(&self) -> bool {
        self.0.lock().accessible
    }
}

/// 手动推进的时钟，`delay` 直接推进时间
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.0
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Kernel for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::SeqCst))
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub type SimHub = EhciRootHub<SimRegs, ManualClock>;

pub fn setup(
    n_ports: usize,
    ppc: bool,
    quirks: Quirks,
    config: RootHubConfig,
) -> (SimHub, SimHandle, ManualClock) {
    setup_with(n_ports, ppc, quirks, config, |_| {})
}

/// 构造并启动 root hub，`f` 在探测能力之前修改模拟硬件
pub fn setup_with(
    n_ports: usize,
    ppc: bool,
    quirks: Quirks,
    config: RootHubConfig,
    f: impl FnOnce(&mut SimHw),
) -> (SimHub, SimHandle, ManualClock) {
    let (regs, hw) = SimHw::new(n_ports, ppc);
    {
        let mut hw = hw.lock();
        hw.integrated_tt = quirks.contains(Quirks::INTEGRATED_TT);
        f(&mut hw);
    }
    let clock = ManualClock::new();
    let hub = EhciRootHub::new(regs, clock.clone(), quirks, config);
    hub.start();
    (hub, hw, clock)
}

pub fn set_feature(hub: &SimHub, feature: PortFeature, port: usize) -> crate::Result<usize> {
    hub.control(
        HubRequest::SetPortFeature.into(),
        feature.into(),
        port as u16 + 1,
        &mut [],
    )
}

pub fn clear_feature(hub: &SimHub, feature: PortFeature, port: usize) -> crate::Result<usize> {
    hub.control(
        HubRequest::ClearPortFeature.into(),
        feature.into(),
        port as u16 + 1,
        &mut [],
    )
}

pub fn port_status(hub: &SimHub, port: usize) -> crate::Result<PortStatus> {
    let mut buf = [0u8; 4];
    hub.control(
        HubRequest::GetPortStatus.into(),
        0,
        port as u16 + 1,
        &mut buf,
    )?;
    Ok(PortStatus::from_wire(u32::from_le_bytes(buf)))
}

/// 复位端口并等待复位结束，高速设备随后处于使能状态
pub fn enable_port(hub: &SimHub, clock: &ManualClock, port: usize) {
    set_feature(hub, PortFeature::Reset, port).unwrap();
    clock.advance(crate::timer::RESET_SIGNAL_TIME);
    let status = port_status(hub, port).unwrap();
    assert!(status.enabled, "port {port} not enabled after reset");
    clear_feature(hub, PortFeature::CConnection, port).unwrap();
}

pub fn suspend_port(hub: &SimHub, port: usize) {
    set_feature(hub, PortFeature::Suspend, port).unwrap();
}
