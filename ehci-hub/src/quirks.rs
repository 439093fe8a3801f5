use tock_registers::LocalRegisterCopy;

use crate::reg::{HCCPARAMS, HCSPARAMS, Reg, RegisterAccess};

bitflags::bitflags! {
    /// 平台声明的控制器怪癖
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// 集成 Transaction Translator，全速/低速设备不交给 companion
        const INTEGRATED_TT = 1 << 0;
        /// 带 HOSTPC 寄存器（PHY 低功耗时钟控制）
        const HOSTPC = 1 << 1;
        /// 不支持单端口挂起
        const NO_SELECTIVE_SUSPEND = 1 << 2;
        /// 挂起端口前必须先停止控制器
        const SUSPEND_SOF_BUG = 1 << 3;
        /// 复位端口期间必须停止控制器
        const RESET_SOF_BUG = 1 << 4;
        /// 总线恢复时端口需要控制器停止状态下手动完成恢复
        const RESUME_SOF_BUG = 1 << 5;
    }
}

/// 端口挂起流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendStrategy {
    #[default]
    Standard,
    /// 先停止控制器再置 SUSPEND
    HaltBeforeSuspend,
}

/// 端口复位流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetStrategy {
    #[default]
    Standard,
    /// 停止控制器、复位 20ms 后立即结束复位并重新运行
    HaltAroundReset,
}

/// 总线恢复流程
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeStrategy {
    #[default]
    Standard,
    /// 控制器停止状态下驱动恢复，逐端口等待 RESUME 清零后再运行
    HaltDuringResume,
}

/// 控制器能力，初始化后不再变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcCapabilities {
    pub n_ports: usize,
    /// 端口电源可独立控制
    pub ppc: bool,
    pub has_ppcd: bool,
    pub has_lpm: bool,
    pub has_hostpc: bool,
    pub integrated_tt: bool,
    pub no_selective_suspend: bool,
    /// debug port 的 0-based 端口下标
    pub debug_port: Option<usize>,
    pub suspend: SuspendStrategy,
    pub reset: ResetStrategy,
    pub resume: ResumeStrategy,
}

impl HcCapabilities {
    /// 由 HCSPARAMS、HCCPARAMS 和平台怪癖推导控制器能力
    pub fn new(hcsparams: u32, hccparams: u32, quirks: Quirks) -> Self {
        let hcs = LocalRegisterCopy::<u32, HCSPARAMS::Register>::new(hcsparams);
        let hcc = LocalRegisterCopy::<u32, HCCPARAMS::Register>::new(hccparams);

        let n_ports = hcs.read(HCSPARAMS::N_PORTS) as usize;
        let debug_n = hcs.read(HCSPARAMS::DEBUG_N) as usize;

        Self {
            n_ports,
            ppc: hcs.is_set(HCSPARAMS::PPC),
            has_ppcd: hcc.is_set(HCCPARAMS::PPCD),
            has_lpm: hcc.is_set(HCCPARAMS::LPM),
            has_hostpc: quirks.contains(Quirks::HOSTPC),
            integrated_tt: quirks.contains(Quirks::INTEGRATED_TT),
            no_selective_suspend: quirks.contains(Quirks::NO_SELECTIVE_SUSPEND),
            debug_port: (debug_n != 0 && debug_n <= n_ports).then(|| debug_n - 1),
            suspend: if quirks.contains(Quirks::SUSPEND_SOF_BUG) {
                SuspendStrategy::HaltBeforeSuspend
            } else {
                SuspendStrategy::Standard
            },
            reset: if quirks.contains(Quirks::RESET_SOF_BUG) {
                ResetStrategy::HaltAroundReset
            } else {
                ResetStrategy::Standard
            },
            resume: if quirks.contains(Quirks::RESUME_SOF_BUG) {
                ResumeStrategy::HaltDuringResume
            } else {
                ResumeStrategy::Standard
            },
        }
    }

    pub fn probe(regs: &impl RegisterAccess, quirks: Quirks) -> Self {
        let caps = Self::new(regs.read(Reg::HcsParams), regs.read(Reg::HccParams), quirks);
        debug!(
            "EHCI root hub: {} ports, ppc {}, ppcd {}, quirks {:?}",
            caps.n_ports, caps.ppc, caps.has_ppcd, quirks
        );
        caps
    }
}
