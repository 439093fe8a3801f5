//! 整个总线的挂起与恢复
//!
//! EHCI 没有总线级挂起，只能逐个挂起已使能的端口，恢复时再把这些端口
//! 逐个恢复。由本流程挂起的端口记为 `BUS_SUSPENDED`，hub 层单独挂起的
//! 端口在总线恢复后仍保持挂起。

use core::time::Duration;

use super::{
    EhciRootHub, Guard, RESUME_SETTLE, RhState, SUSPEND_SETTLE, signal::PHY_LOW_POWER_TIME,
};
use crate::{
    err::{HubError, Result},
    event::RootHubEvent,
    osal::Kernel,
    port::PortFlags,
    quirks::{ResumeStrategy, SuspendStrategy},
    reg::{
        CMD_ASE, CMD_PSE, CMD_RUN, HOSTPC_PHCD, INTR_MASK, PORT_RESUME, PORT_RWC_BITS,
        PORT_WAKE_BITS, PORTSC, PortSc, Reg, RegisterAccess, STS_PCD, portsc_for_write,
    },
    timer::RESUME_SIGNAL_TIME,
};

/// 部分设备在挂起后需要至少一个微帧
const SUSPEND_DELAY: Duration = Duration::from_micros(150);
/// 部分控制器在运行后需要时间重建端口状态
const PORT_SETTLE_TIME: Duration = Duration::from_millis(8);

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    pub(super) fn suspend_bus(&self) -> Result {
        debug!("suspend root hub");
        self.wait_statechange();

        let mut g = self.inner.lock();

        // 控制器停止后正在进行的恢复无法完成
        if g.ports.any(PortFlags::RESUMING) {
            debug!("suspend failed because a port is resuming");
            return Err(HubError::Busy);
        }
        if g.rh_state == RhState::Suspended {
            return Ok(());
        }

        self.quiesce(&mut g);
        g.command = g.regs.read(Reg::Command);
        g.rh_timer.cancel();

        g.ports.clear_all(PortFlags::BUS_SUSPENDED | PortFlags::OWNED);
        let mut changed = false;
        let mut halted = false;

        for port in (0..self.caps.n_ports).rev() {
            let t1 = portsc_for_write(&g.regs, port);
            let mut t2 = PortSc::new(t1.get() & !PORT_WAKE_BITS);

            if t1.is_set(PORTSC::OWNER) {
                g.ports.set_flag(port, PortFlags::OWNED, true);
            } else if t1.is_set(PORTSC::PE) && !t1.is_set(PORTSC::SUSPEND) {
                // 必须在停止状态下置 SUSPEND
                if self.caps.suspend == SuspendStrategy::HaltBeforeSuspend && !halted {
                    self.halt_for_suspend(&mut g)?;
                    halted = true;
                }
                t2.modify(PORTSC::SUSPEND::SET);
                // hub 层已挂起的端口只是推迟到这里写 SUSPEND
                if !g.ports.contains(port, PortFlags::SUSPENDED) {
                    g.ports.set_flag(port, PortFlags::BUS_SUSPENDED, true);
                }
                g.ports.set_flag(port, PortFlags::SUSPEND_DEFERRED, false);
            }

            if self.config.remote_wakeup {
                // 只打开合适的唤醒位，否则 PHY 无法进入低功耗
                if t1.is_set(PORTSC::CONNECT) {
                    t2.modify(PORTSC::WKOC_E::SET + PORTSC::WKDISC_E::SET);
                } else {
                    t2.modify(PORTSC::WKOC_E::SET + PORTSC::WKCONN_E::SET);
                }
            }

            if t1.get() != t2.get() {
                trace!("port {}, {:#010x} -> {:#010x}", port + 1, t1.get(), t2.get());
                g.regs.write(Reg::PortSc(port), t2.get());
                changed = true;
            }
        }

        if changed && self.caps.has_hostpc {
            g = self.sleep_unlocked(g, PHY_LOW_POWER_TIME);
            for port in (0..self.caps.n_ports).rev() {
                let hostpc = g.regs.read(Reg::HostPc(port));
                g.regs.write(Reg::HostPc(port), hostpc | HOSTPC_PHCD);
                let hostpc = g.regs.read(Reg::HostPc(port));
                debug!(
                    "port {} phy low power mode {}",
                    port + 1,
                    if hostpc & HOSTPC_PHCD != 0 { "succeeded" } else { "failed" }
                );
            }
        }

        if g.ports.any(PortFlags::BUS_SUSPENDED) {
            self.kernel.delay(SUSPEND_DELAY);
        }

        if !halted {
            self.halt_for_suspend(&mut g)?;
        }
        g.rh_state = RhState::Suspended;

        let mut mask = INTR_MASK;
        if !self.config.remote_wakeup {
            mask &= !STS_PCD;
        }
        g.regs.write(Reg::IntrEnable, mask);
        g.regs.read(Reg::IntrEnable);

        g.next_statechange = self.kernel.now() + SUSPEND_SETTLE;
        Ok(())
    }

    /// 停止超时不影响挂起，控制器消失则放弃
    fn halt_for_suspend(&self, g: &mut Guard<'_, R>) -> Result {
        match self.halt(g) {
            Err(HubError::Shutdown) => Err(HubError::Shutdown),
            Err(e) => {
                warn!("halt before suspend failed: {e:?}");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    pub(super) fn resume_bus(&self) -> Result {
        self.wait_statechange();

        let mut g = self.inner.lock();
        if !g.regs.hw_accessible() {
            return Err(HubError::Shutdown);
        }

        // 掉电后 USBINTR 会被清零
        let power_okay = g.regs.read(Reg::IntrEnable) != 0;
        debug!(
            "resume root hub{}",
            if power_okay { "" } else { " after power loss" }
        );

        g.regs.write(Reg::IntrEnable, 0);

        let schedule = g.schedule;
        g.regs.write(Reg::Segment, schedule.segment);
        g.regs.write(Reg::FrameList, schedule.periodic_dma);
        g.regs.write(Reg::AsyncNext, schedule.async_dma);

        // RESUME 清零后才能运行
        if self.caps.resume == ResumeStrategy::HaltDuringResume {
            g.command &= !CMD_RUN;
        }
        let command = g.command;
        g.regs.write(Reg::Command, command);
        g.rh_state = RhState::Running;

        g = self.sleep_unlocked(g, PORT_SETTLE_TIME);

        let bus_suspended = g.ports.bitmap(PortFlags::BUS_SUSPENDED);
        if bus_suspended != 0 && self.caps.has_hostpc {
            for port in (0..self.caps.n_ports).rev() {
                if bus_suspended & (1 << port) != 0 {
                    let hostpc = g.regs.read(Reg::HostPc(port));
                    g.regs.write(Reg::HostPc(port), hostpc & !HOSTPC_PHCD);
                }
            }
            g = self.sleep_unlocked(g, PHY_LOW_POWER_TIME);
        }

        let mut resume_needed = 0u32;
        for port in (0..self.caps.n_ports).rev() {
            let raw = g.regs.read(Reg::PortSc(port));
            let mut temp = PortSc::new(raw & !(PORT_RWC_BITS | PORT_WAKE_BITS));
            if bus_suspended & (1 << port) != 0 && temp.is_set(PORTSC::SUSPEND) {
                temp.modify(PORTSC::RESUME::SET);
                resume_needed |= 1 << port;
            }
            g.regs.write(Reg::PortSc(port), temp.get());
        }

        if self.caps.resume == ResumeStrategy::HaltDuringResume && resume_needed != 0 {
            // 只有一个端口，RESUME 由硬件自动清零
            let done = self.wait_unlocked(g, Reg::PortSc(0), PORT_RESUME, 0, RESUME_SIGNAL_TIME);
            g = match done {
                Ok(g) => g,
                Err(HubError::Timeout) => {
                    error!("port 1 resume did not finish");
                    self.inner.lock()
                }
                Err(e) => return Err(e),
            };
            g.command |= CMD_RUN;
            let command = g.command;
            g.regs.write(Reg::Command, command);
        } else {
            if resume_needed != 0 {
                g = self.sleep_unlocked(g, RESUME_SIGNAL_TIME);
            }
            for port in (0..self.caps.n_ports).rev() {
                if resume_needed & (1 << port) != 0 {
                    let temp = g.regs.read(Reg::PortSc(port)) & !(PORT_RWC_BITS | PORT_RESUME);
                    g.regs.write(Reg::PortSc(port), temp);
                    debug!("resumed port {}", port + 1);
                }
            }
        }
        g.regs.read(Reg::Command);
        g.ports.clear_all(PortFlags::BUS_SUSPENDED);

        let mut schedules = 0;
        if schedule.async_pending {
            schedules |= CMD_ASE;
        }
        if schedule.periodic_pending {
            schedules |= CMD_PSE;
        }
        if schedules != 0 {
            g.command |= schedules;
            let command = g.command;
            g.regs.write(Reg::Command, command);
        }

        g.next_statechange = self.kernel.now() + RESUME_SETTLE;
        g.regs.write(Reg::IntrEnable, INTR_MASK);
        drop(g);

        self.handover_companion_ports();
        Ok(())
    }

    /// 控制器本身不允许唤醒而 root hub 允许时，挂起/恢复控制器前调整端口唤醒位
    pub fn adjust_port_wakeup_flags(&self, suspending: bool, do_wakeup: bool) {
        if !self.config.remote_wakeup || do_wakeup {
            return;
        }

        let mut g = self.inner.lock();

        // 修改唤醒位前先退出 PHY 低功耗
        if self.caps.has_hostpc {
            for port in (0..self.caps.n_ports).rev() {
                let hostpc = g.regs.read(Reg::HostPc(port));
                g.regs.write(Reg::HostPc(port), hostpc & !HOSTPC_PHCD);
            }
            g = self.sleep_unlocked(g, PHY_LOW_POWER_TIME);
        }

        for port in (0..self.caps.n_ports).rev() {
            let t1 = portsc_for_write(&g.regs, port);
            let mut t2 = PortSc::new(t1.get() & !PORT_WAKE_BITS);
            if !suspending {
                if t1.is_set(PORTSC::CONNECT) {
                    t2.modify(PORTSC::WKOC_E::SET + PORTSC::WKDISC_E::SET);
                } else {
                    t2.modify(PORTSC::WKOC_E::SET + PORTSC::WKCONN_E::SET);
                }
            }
            trace!("port {}, {:#010x} -> {:#010x}", port + 1, t1.get(), t2.get());
            g.regs.write(Reg::PortSc(port), t2.get());
        }

        if self.caps.has_hostpc {
            for port in (0..self.caps.n_ports).rev() {
                let hostpc = g.regs.read(Reg::HostPc(port));
                g.regs.write(Reg::HostPc(port), hostpc | HOSTPC_PHCD);
            }
        }

        if !suspending && self.port_change(&g) {
            self.events.push(RootHubEvent::ResumeRootHub);
        }
    }
}
