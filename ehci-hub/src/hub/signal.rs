//! 单端口的挂起、恢复与复位信号

use core::time::Duration;

use super::{EhciRootHub, Guard, HALT_TIMEOUT_US, Inner};
use crate::{
    err::{HubError, Result},
    osal::Kernel,
    port::PortFlags,
    quirks::{ResetStrategy, SuspendStrategy},
    reg::{
        CMD_RUN, HOSTPC_PHCD, PORT_RWC_BITS, PORTSC, PortSc, Reg, RegisterAccess, STS_HALT,
        handshake, portsc_for_write,
    },
    timer::{Deadline, DeadlineKind},
};

/// PHY 进入或离开低功耗时钟模式所需时间
pub(super) const PHY_LOW_POWER_TIME: Duration = Duration::from_millis(5);
/// 复位怪癖：控制器停止期间驱动复位的时长
const HALTED_RESET_TIME: Duration = Duration::from_millis(20);

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    /// ClearPortFeature(SUSPEND)：开始 20ms 恢复信号，完成由 GetPortStatus 检查
    pub(super) fn resume_port<'a>(&'a self, mut g: Guard<'a, R>, port: usize) -> Result<Guard<'a, R>> {
        let mut temp = portsc_for_write(&g.regs, port);
        if temp.is_set(PORTSC::RESET) {
            return Err(HubError::Stall);
        }
        // 挂起还没写入硬件，端口一直处于使能状态
        let deferred = g.ports.contains(port, PortFlags::SUSPEND_DEFERRED)
            && temp.is_set(PORTSC::PE)
            && !temp.is_set(PORTSC::SUSPEND);
        if self.caps.no_selective_suspend || !(temp.is_set(PORTSC::SUSPEND) || deferred) {
            return Ok(g);
        }
        if !temp.is_set(PORTSC::PE) {
            return Err(HubError::Stall);
        }

        if self.caps.has_hostpc {
            let hostpc = g.regs.read(Reg::HostPc(port));
            g.regs.write(Reg::HostPc(port), hostpc & !HOSTPC_PHCD);
            g = self.sleep_unlocked(g, PHY_LOW_POWER_TIME);
            temp = portsc_for_write(&g.regs, port);
        }

        temp.modify(PORTSC::WKCONN_E::CLEAR + PORTSC::WKDISC_E::CLEAR + PORTSC::WKOC_E::CLEAR);
        if deferred {
            g.regs.write(Reg::PortSc(port), temp.get());
            g.ports
                .set_flag(port, PortFlags::SUSPENDED | PortFlags::SUSPEND_DEFERRED, false);
            g.ports.set_flag(port, PortFlags::C_SUSPEND, true);
            debug!("port {} deferred suspend cancelled", port + 1);
            return Ok(g);
        }

        temp.modify(PORTSC::RESUME::SET);
        g.regs.write(Reg::PortSc(port), temp.get());

        let deadline = Deadline::after(self.kernel.now(), DeadlineKind::Resume);
        g.ports.set_deadline(port, deadline);
        g.ports.set_flag(port, PortFlags::RESUMING, true);
        g.rh_timer.arm_no_later_than(deadline.instant());
        debug!("port {} resume signaling", port + 1);
        Ok(g)
    }

    /// SetPortFeature(SUSPEND)
    ///
    /// 带 SUSPEND_SOF_BUG 的控制器必须先停止才能挂起端口，这里只配置唤醒位，
    /// 端口在总线挂起时真正进入挂起。
    pub(super) fn suspend_port<'a>(
        &'a self,
        mut g: Guard<'a, R>,
        port: usize,
        mut temp: PortSc,
    ) -> Result<Guard<'a, R>> {
        if self.caps.no_selective_suspend {
            return Ok(g);
        }
        if !temp.is_set(PORTSC::PE) || temp.is_set(PORTSC::RESET) {
            return Err(HubError::Stall);
        }

        // 端口此时一定有设备连接，只需要断开与过流唤醒
        temp.modify(PORTSC::WKCONN_E::CLEAR + PORTSC::WKDISC_E::SET + PORTSC::WKOC_E::SET);
        if self.caps.suspend == SuspendStrategy::Standard {
            temp.modify(PORTSC::SUSPEND::SET);
        }
        g.regs.write(Reg::PortSc(port), temp.get());

        if self.caps.has_hostpc {
            g = self.sleep_unlocked(g, PHY_LOW_POWER_TIME);
            let hostpc = g.regs.read(Reg::HostPc(port));
            g.regs.write(Reg::HostPc(port), hostpc | HOSTPC_PHCD);
            let hostpc = g.regs.read(Reg::HostPc(port));
            debug!(
                "port {} phy low power mode {}",
                port + 1,
                if hostpc & HOSTPC_PHCD != 0 { "succeeded" } else { "failed" }
            );
        }

        g.ports.set_flag(port, PortFlags::SUSPENDED, true);
        if self.caps.suspend == SuspendStrategy::HaltBeforeSuspend {
            g.ports.set_flag(port, PortFlags::SUSPEND_DEFERRED, true);
        }
        Ok(g)
    }

    /// SetPortFeature(RESET)
    pub(super) fn reset_port<'a>(
        &'a self,
        mut g: Guard<'a, R>,
        port: usize,
        mut temp: PortSc,
    ) -> Result<Guard<'a, R>> {
        if temp.is_set(PORTSC::RESUME) || g.ports.contains(port, PortFlags::RESUMING) {
            return Err(HubError::Stall);
        }

        // 线状态为 K 说明是低速设备；有集成 TT 时交给本控制器处理
        if temp.is_set(PORTSC::CONNECT)
            && !temp.is_set(PORTSC::PE)
            && !self.caps.integrated_tt
            && temp.matches_all(PORTSC::LINE_STATUS::KState)
        {
            debug!("port {} low speed --> companion", port + 1);
            temp.modify(PORTSC::OWNER::SET);
            g.regs.write(Reg::PortSc(port), temp.get());
            g.ports.release_to_companion(port);
            return Ok(g);
        }

        trace!("port {} reset", port + 1);
        temp.modify(PORTSC::RESET::SET + PORTSC::PE::CLEAR);
        // 调用方等待后通过 GetPortStatus 结束复位
        g.ports
            .set_deadline(port, Deadline::after(self.kernel.now(), DeadlineKind::Reset));

        match self.caps.reset {
            ResetStrategy::Standard => g.regs.write(Reg::PortSc(port), temp.get()),
            ResetStrategy::HaltAroundReset => {
                let cmd = g.regs.read(Reg::Command) & !CMD_RUN;
                g.regs.write(Reg::Command, cmd);
                if let Err(e) = handshake(
                    &g.regs,
                    &self.kernel,
                    Reg::Status,
                    STS_HALT,
                    STS_HALT,
                    HALT_TIMEOUT_US,
                ) {
                    info!("controller halt failed: {e:?}");
                }
                g.regs.write(Reg::PortSc(port), temp.get());

                g = self.sleep_unlocked(g, HALTED_RESET_TIME);
                let mut clear = portsc_for_write(&g.regs, port);
                clear.modify(PORTSC::RESET::CLEAR);
                g.regs.write(Reg::PortSc(port), clear.get());
                g.regs.write(Reg::Command, cmd | CMD_RUN);
            }
        }
        Ok(g)
    }

    /// 复位结束后判断端口归属，返回最新的 PORTSC
    pub(super) fn check_reset_complete(&self, g: &mut Inner<R>, port: usize) -> PortSc {
        let temp = PortSc::new(g.regs.read(Reg::PortSc(port)));
        if !temp.is_set(PORTSC::CONNECT) {
            return temp;
        }

        if temp.is_set(PORTSC::PE) {
            debug!("port {} high speed", port + 1);
            return temp;
        }

        // 复位后未使能：全速设备
        if self.caps.integrated_tt {
            debug!("failed to enable port {} on root hub TT", port + 1);
            return temp;
        }
        debug!("port {} full speed --> companion", port + 1);
        let mut owner = PortSc::new(temp.get() & !PORT_RWC_BITS);
        owner.modify(PORTSC::OWNER::SET);
        g.regs.write(Reg::PortSc(port), owner.get());
        g.ports.release_to_companion(port);
        PortSc::new(g.regs.read(Reg::PortSc(port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::RootHubConfig,
        quirks::Quirks,
        reg::{PORT_RESET, PORT_WAKE_BITS},
        sim::{clear_feature, enable_port, port_status, set_feature, setup},
        timer::RESUME_SIGNAL_TIME,
    };
    use usb_if::host::hub::{DeviceSpeed, PortFeature};

    const SUSPEND: u32 = 1 << 7;
    const WKDISC_WKOC: u32 = (1 << 21) | (1 << 22);

    #[test]
    fn test_low_speed_handed_over_before_reset() {
        let (hub, hw, _clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::Low);
        set_feature(&hub, PortFeature::Reset, 0).unwrap();

        assert_eq!(hw.lock().portsc(0) & PORT_RESET, 0);
        assert!(hub.port_handed_over(0));
        assert!(hub.inner.lock().ports.deadline(0).is_none());
    }

    #[test]
    fn test_reset_stalls_while_resuming() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();
        clear_feature(&hub, PortFeature::Suspend, 0).unwrap();

        assert_eq!(set_feature(&hub, PortFeature::Reset, 0), Err(HubError::Stall));
        assert_eq!(hw.lock().portsc(0) & PORT_RESET, 0);
    }

    #[test]
    fn test_suspend_sets_wake_bits() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();

        let portsc = hw.lock().portsc(0);
        assert_ne!(portsc & SUSPEND, 0);
        assert_eq!(portsc & PORT_WAKE_BITS, WKDISC_WKOC);
        assert!(hub.port_flags(0).contains(PortFlags::SUSPENDED));
    }

    #[test]
    fn test_suspend_requires_enabled_port() {
        let (hub, hw, _clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        assert_eq!(set_feature(&hub, PortFeature::Suspend, 0), Err(HubError::Stall));
        assert!(!hub.port_flags(0).contains(PortFlags::SUSPENDED));
    }

    #[test]
    fn test_suspend_erratum_defers_suspend() {
        let (hub, hw, clock) = setup(1, false, Quirks::SUSPEND_SOF_BUG, RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();

        let portsc = hw.lock().portsc(0);
        assert_eq!(portsc & SUSPEND, 0);
        assert_eq!(portsc & PORT_WAKE_BITS, WKDISC_WKOC);
        assert!(hub.port_flags(0).contains(PortFlags::SUSPENDED));
    }

    #[test]
    fn test_no_selective_suspend() {
        let (hub, hw, clock) =
            setup(1, false, Quirks::NO_SELECTIVE_SUSPEND, RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();
        assert_eq!(hw.lock().portsc(0) & SUSPEND, 0);
        assert!(!hub.port_flags(0).contains(PortFlags::SUSPENDED));
    }

    #[test]
    fn test_hostpc_phy_low_power() {
        let (hub, hw, clock) = setup(1, false, Quirks::HOSTPC, RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);

        let before = clock.now();
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();
        assert_eq!(clock.now() - before, PHY_LOW_POWER_TIME);
        assert_ne!(hw.lock().ports[0].hostpc & HOSTPC_PHCD, 0);

        clear_feature(&hub, PortFeature::Suspend, 0).unwrap();
        assert_eq!(hw.lock().ports[0].hostpc & HOSTPC_PHCD, 0);
        assert_ne!(hw.lock().portsc(0) & (1 << 6), 0);
    }

    #[test]
    fn test_resume_completes_after_deadline() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        set_feature(&hub, PortFeature::Suspend, 0).unwrap();
        clear_feature(&hub, PortFeature::Suspend, 0).unwrap();

        assert_eq!(hw.lock().portsc(0) & PORT_WAKE_BITS, 0);
        assert_eq!(hub.timer_expires(), Some(clock.now() + RESUME_SIGNAL_TIME));
        assert!(port_status(&hub, 0).unwrap().suspended);

        clock.advance(RESUME_SIGNAL_TIME);
        let status = port_status(&hub, 0).unwrap();
        assert!(!status.suspended);
        assert!(status.change.suspend_changed);
        assert_eq!(hw.lock().portsc(0) & SUSPEND, 0);
    }

    #[test]
    fn test_reset_erratum_halts_controller() {
        let (hub, hw, clock) = setup(1, false, Quirks::RESET_SOF_BUG, RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        hw.lock().writes.clear();

        let before = clock.now();
        set_feature(&hub, PortFeature::Reset, 0).unwrap();
        assert!(clock.now() - before >= Duration::from_millis(20));

        {
            let hw = hw.lock();
            assert_eq!(hw.command & CMD_RUN, CMD_RUN);
            assert_eq!(hw.portsc(0) & PORT_RESET, 0);
            // 先停止控制器，再写复位
            let halt = hw
                .writes
                .iter()
                .position(|&(reg, v)| reg == Reg::Command && v & CMD_RUN == 0);
            let reset = hw
                .writes
                .iter()
                .position(|&(reg, v)| reg == Reg::PortSc(0) && v & PORT_RESET != 0);
            assert!(halt.unwrap() < reset.unwrap());
        }

        let status = port_status(&hub, 0).unwrap();
        assert!(status.enabled);
        assert!(status.change.reset_complete);
        assert!(!port_status(&hub, 0).unwrap().change.reset_complete);
    }
}
