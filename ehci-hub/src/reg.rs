//! EHCI 寄存器定义与访问层
//!
//! 位域参照 EHCI 1.0 规范第 2 章以及 EHCI 1.1 附录（LPM、PPCD、HOSTPC）。
//! 控制器逻辑只通过 [`RegisterAccess`] 读写寄存器，MMIO 实现见 [`MmioRegisters`]。

use core::ptr::NonNull;
use core::time::Duration;

use mbarrier::wmb;
use tock_registers::{
    LocalRegisterCopy, RegisterLongName,
    fields::Field,
    interfaces::{Readable, Writeable},
    register_bitfields,
    registers::{ReadOnly, ReadWrite},
};

use crate::{err::HubError, osal::Kernel};

register_bitfields![u32,
    /// Structural Parameters (HCSPARAMS)
    pub HCSPARAMS [
        N_PORTS OFFSET(0) NUMBITS(4) [],
        /// 端口支持独立电源开关
        PPC OFFSET(4) NUMBITS(1) [],
        N_PCC OFFSET(8) NUMBITS(4) [],
        N_CC OFFSET(12) NUMBITS(4) [],
        P_INDICATOR OFFSET(16) NUMBITS(1) [],
        /// Debug port 所在端口号（1-based，0 表示没有）
        DEBUG_N OFFSET(20) NUMBITS(4) []
    ],

    /// Capability Parameters (HCCPARAMS)
    pub HCCPARAMS [
        AC64 OFFSET(0) NUMBITS(1) [],
        /// Link Power Management (EHCI 1.1)
        LPM OFFSET(17) NUMBITS(1) [],
        /// Per-Port Change Detect (EHCI 1.1)
        PPCD OFFSET(18) NUMBITS(1) []
    ],

    /// USB Command (USBCMD)
    pub USBCMD [
        RUN OFFSET(0) NUMBITS(1) [],
        HCRESET OFFSET(1) NUMBITS(1) [],
        PSE OFFSET(4) NUMBITS(1) [],
        ASE OFFSET(5) NUMBITS(1) [],
        IAAD OFFSET(6) NUMBITS(1) [],
        ITC OFFSET(16) NUMBITS(8) []
    ],

    /// USB Status (USBSTS)
    pub USBSTS [
        INT OFFSET(0) NUMBITS(1) [],
        ERR OFFSET(1) NUMBITS(1) [],
        /// Port Change Detect
        PCD OFFSET(2) NUMBITS(1) [],
        FLR OFFSET(3) NUMBITS(1) [],
        FATAL OFFSET(4) NUMBITS(1) [],
        IAA OFFSET(5) NUMBITS(1) [],
        HALT OFFSET(12) NUMBITS(1) [],
        RECLAMATION OFFSET(13) NUMBITS(1) [],
        PSS OFFSET(14) NUMBITS(1) [],
        ASS OFFSET(15) NUMBITS(1) [],
        /// 每端口变化位（需要 HCCPARAMS.PPCD）
        PPCD OFFSET(16) NUMBITS(16) []
    ],

    /// Port Status and Control (PORTSC)
    pub PORTSC [
        /// Current Connect Status (RO)
        CONNECT OFFSET(0) NUMBITS(1) [],
        /// Connect Status Change (RWC)
        CSC OFFSET(1) NUMBITS(1) [],
        /// Port Enabled
        PE OFFSET(2) NUMBITS(1) [],
        /// Port Enable Change (RWC)
        PEC OFFSET(3) NUMBITS(1) [],
        /// Over-current Active (RO)
        OC OFFSET(4) NUMBITS(1) [],
        /// Over-current Change (RWC)
        OCC OFFSET(5) NUMBITS(1) [],
        /// Force Port Resume
        RESUME OFFSET(6) NUMBITS(1) [],
        SUSPEND OFFSET(7) NUMBITS(1) [],
        RESET OFFSET(8) NUMBITS(1) [],
        /// Line Status (RO)，只在端口未使能时有意义
        LINE_STATUS OFFSET(10) NUMBITS(2) [
            SE0 = 0,
            KState = 1,
            JState = 2,
            Undefined = 3
        ],
        POWER OFFSET(12) NUMBITS(1) [],
        /// Port Owner，置 1 后端口交给 companion 控制器
        OWNER OFFSET(13) NUMBITS(1) [],
        INDICATOR OFFSET(14) NUMBITS(2) [],
        /// Port Test Control
        TEST OFFSET(16) NUMBITS(4) [],
        WKCONN_E OFFSET(20) NUMBITS(1) [],
        WKDISC_E OFFSET(21) NUMBITS(1) [],
        WKOC_E OFFSET(22) NUMBITS(1) [],
        // 以下为厂商扩展，各家位置相互重叠，只在对应能力打开时使用
        /// LPM 设备地址
        DEV_ADDR OFFSET(25) NUMBITS(7) [],
        /// 集成 TT 控制器上的端口速度
        PSPD OFFSET(26) NUMBITS(2) [],
        /// LPM transaction
        LPM OFFSET(29) NUMBITS(1) []
    ],

    /// Host Port Power Control (HOSTPC, EHCI 1.1)
    pub HOSTPC [
        /// PHY Low Power Clock Disable
        PHCD OFFSET(22) NUMBITS(1) [],
        PSPD OFFSET(25) NUMBITS(2) []
    ]
];

pub type PortSc = LocalRegisterCopy<u32, PORTSC::Register>;
pub type HostPc = LocalRegisterCopy<u32, HOSTPC::Register>;

const fn bits<R: RegisterLongName>(field: Field<u32, R>) -> u32 {
    field.mask << field.shift
}

pub const PORT_CSC: u32 = bits(PORTSC::CSC);
pub const PORT_PE: u32 = bits(PORTSC::PE);
pub const PORT_OCC: u32 = bits(PORTSC::OCC);
pub const PORT_RESUME: u32 = bits(PORTSC::RESUME);
pub const PORT_RESET: u32 = bits(PORTSC::RESET);

/// PORTSC 中写 1 清零的变化位
pub const PORT_RWC_BITS: u32 = bits(PORTSC::CSC) | bits(PORTSC::PEC) | bits(PORTSC::OCC);
/// PORTSC 远程唤醒使能位
pub const PORT_WAKE_BITS: u32 =
    bits(PORTSC::WKOC_E) | bits(PORTSC::WKDISC_E) | bits(PORTSC::WKCONN_E);

pub const CMD_RUN: u32 = bits(USBCMD::RUN);
pub const CMD_HCRESET: u32 = bits(USBCMD::HCRESET);
pub const CMD_IAAD: u32 = bits(USBCMD::IAAD);
pub const CMD_ASE: u32 = bits(USBCMD::ASE);
pub const CMD_PSE: u32 = bits(USBCMD::PSE);

pub const STS_PCD: u32 = bits(USBSTS::PCD);
pub const STS_HALT: u32 = bits(USBSTS::HALT);
pub const STS_ASS: u32 = bits(USBSTS::ASS);
pub const STS_PSS: u32 = bits(USBSTS::PSS);

/// 控制器运行时打开的中断
pub const INTR_MASK: u32 = bits(USBSTS::IAA)
    | bits(USBSTS::FATAL)
    | bits(USBSTS::PCD)
    | bits(USBSTS::ERR)
    | bits(USBSTS::INT);

pub const HOSTPC_PHCD: u32 = bits(HOSTPC::PHCD);

/// 读 PORTSC 并去掉写 1 清零位，得到可以安全回写的镜像
pub fn portsc_for_write(regs: &impl RegisterAccess, port: usize) -> PortSc {
    PortSc::new(regs.read(Reg::PortSc(port)) & !PORT_RWC_BITS)
}

/// 控制器寄存器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    HcsParams,
    HccParams,
    Command,
    Status,
    IntrEnable,
    FrameIndex,
    Segment,
    FrameList,
    AsyncNext,
    ConfigFlag,
    PortSc(usize),
    HostPc(usize),
}

/// 寄存器访问层
///
/// 读写都是有副作用的原语：PORTSC 的变化位写 1 清零，USBCMD 的写入
/// 立即影响控制器运行状态。
pub trait RegisterAccess: Send {
    fn read(&self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);

    /// 控制器是否仍可访问（例如 PCI 设备已被拔出或断电时返回 false）
    fn hw_accessible(&self) -> bool {
        true
    }
}

/// 轮询等待 `reg & mask == done`，每微秒检查一次，最多 `timeout_us` 微秒。
///
/// 读到全 1 说明控制器已经消失，直接返回 [`HubError::Shutdown`]。
pub fn handshake(
    regs: &impl RegisterAccess,
    kernel: &impl Kernel,
    reg: Reg,
    mask: u32,
    done: u32,
    timeout_us: u32,
) -> Result<(), HubError> {
    let mut usec = timeout_us;
    loop {
        let value = regs.read(reg);
        if value == u32::MAX {
            return Err(HubError::Shutdown);
        }
        if value & mask == done {
            return Ok(());
        }
        if usec == 0 {
            trace!("handshake {reg:?} mask {mask:#x} done {done:#x} timed out: {value:#x}");
            return Err(HubError::Timeout);
        }
        kernel.delay(Duration::from_micros(1));
        usec -= 1;
    }
}

// =============================================================================
// MMIO 实现
// =============================================================================

/// EHCI Capability 寄存器
#[repr(C)]
pub struct EhciCapRegs {
    /// CAPLENGTH (低 8 位) 与 HCIVERSION
    pub caplength: ReadOnly<u32>,
    pub hcsparams: ReadOnly<u32, HCSPARAMS::Register>,
    pub hccparams: ReadOnly<u32, HCCPARAMS::Register>,
}

/// EHCI Operational 寄存器
#[repr(C)]
pub struct EhciOpRegs {
    pub usbcmd: ReadWrite<u32, USBCMD::Register>,
    pub usbsts: ReadWrite<u32, USBSTS::Register>,
    pub usbintr: ReadWrite<u32>,
    pub frindex: ReadWrite<u32>,
    pub ctrldssegment: ReadWrite<u32>,
    pub periodiclistbase: ReadWrite<u32>,
    pub asynclistaddr: ReadWrite<u32>,
    _reserved0: [u32; 9],
    /// 0x40
    pub configflag: ReadWrite<u32>,
    /// 0x44
    pub portsc: [ReadWrite<u32, PORTSC::Register>; 15],
    _reserved1: u32,
    /// 0x84
    pub hostpc: [ReadWrite<u32, HOSTPC::Register>; 15],
}

/// 基于内存映射的寄存器访问
pub struct MmioRegisters {
    cap: NonNull<EhciCapRegs>,
    op: NonNull<EhciOpRegs>,
}

unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `mmio_base` 必须指向已映射的 EHCI 寄存器区域，并在返回值存活期间保持有效。
    pub unsafe fn new(mmio_base: NonNull<u8>) -> Self {
        let cap = mmio_base.cast::<EhciCapRegs>();
        let caplength = unsafe { cap.as_ref() }.caplength.get() & 0xff;
        let op = unsafe { mmio_base.add(caplength as usize) }.cast::<EhciOpRegs>();
        Self { cap, op }
    }

    fn cap(&self) -> &EhciCapRegs {
        unsafe { self.cap.as_ref() }
    }

    fn op(&self) -> &EhciOpRegs {
        unsafe { self.op.as_ref() }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read(&self, reg: Reg) -> u32 {
        let op = self.op();
        match reg {
            Reg::HcsParams => self.cap().hcsparams.get(),
            Reg::HccParams => self.cap().hccparams.get(),
            Reg::Command => op.usbcmd.get(),
            Reg::Status => op.usbsts.get(),
            Reg::IntrEnable => op.usbintr.get(),
            Reg::FrameIndex => op.frindex.get(),
            Reg::Segment => op.ctrldssegment.get(),
            Reg::FrameList => op.periodiclistbase.get(),
            Reg::AsyncNext => op.asynclistaddr.get(),
            Reg::ConfigFlag => op.configflag.get(),
            Reg::PortSc(i) => op.portsc[i].get(),
            Reg::HostPc(i) => op.hostpc[i].get(),
        }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        // 调度器写入的 DMA 结构先于寄存器可见
        wmb();
        let op = self.op();
        match reg {
            Reg::HcsParams | Reg::HccParams => {
                warn!("ignoring write to read-only {reg:?}");
            }
            Reg::Command => op.usbcmd.set(value),
            Reg::Status => op.usbsts.set(value),
            Reg::IntrEnable => op.usbintr.set(value),
            Reg::FrameIndex => op.frindex.set(value),
            Reg::Segment => op.ctrldssegment.set(value),
            Reg::FrameList => op.periodiclistbase.set(value),
            Reg::AsyncNext => op.asynclistaddr.set(value),
            Reg::ConfigFlag => op.configflag.set(value),
            Reg::PortSc(i) => op.portsc[i].set(value),
            Reg::HostPc(i) => op.hostpc[i].set(value),
        }
    }
}
