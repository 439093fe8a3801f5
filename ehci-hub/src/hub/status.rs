use usb_if::host::hub::PortStatus;

use super::{EhciRootHub, Inner, RhState};
use crate::{
    err::{HubError, Result},
    osal::Kernel,
    port::PortFlags,
    reg::{
        HOSTPC, HostPc, PORT_OCC, PORT_RESET, PORT_RESUME, PORT_RWC_BITS, PORTSC, PortSc, Reg,
        RegisterAccess, handshake, portsc_for_write,
    },
    timer::{Deadline, DeadlineKind, RESUME_POLL_SLACK},
};

/// RESUME 清零的握手时限
const RESUME_DONE_TIMEOUT_US: u32 = 2000;
/// PR 清零的握手时限
const RESET_DONE_TIMEOUT_US: u32 = 1000;

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    /// GetPortStatus 的状态合成。
    ///
    /// 先收集硬件变化位，再执行断电、结束恢复/复位、移交等有副作用的步骤，
    /// 最后按（可能已更新的）寄存器组成状态字。
    pub(super) fn get_port_status(&self, g: &mut Inner<R>, port: usize) -> Result<PortStatus> {
        let now = self.kernel.now();
        let mut status = PortStatus::default();
        let mut temp = PortSc::new(g.regs.read(Reg::PortSc(port)));
        if temp.get() == u32::MAX {
            return Err(HubError::Shutdown);
        }

        if temp.is_set(PORTSC::CSC) {
            status.change.connection_changed = true;
        }
        if temp.is_set(PORTSC::PEC) {
            status.change.enabled_changed = true;
        }
        if temp.is_set(PORTSC::OCC) && !self.config.ignore_oc {
            status.change.over_current_changed = true;

            // 不能指望硬件在过流时自己断电
            if temp.is_set(PORTSC::OC) && self.caps.ppc {
                debug!("port {} over-current, power off", port + 1);
                let mut off = PortSc::new(temp.get() & !PORT_RWC_BITS);
                off.modify(PORTSC::POWER::CLEAR);
                g.regs.write(Reg::PortSc(port), off.get());
                temp = PortSc::new(g.regs.read(Reg::PortSc(port)));
            }
        }

        // 远程唤醒或 ClearPortFeature(SUSPEND) 发起的恢复
        if temp.is_set(PORTSC::RESUME) {
            match g.ports.deadline(port) {
                None => {
                    let deadline = Deadline::after(now, DeadlineKind::Resume);
                    g.ports.set_deadline(port, deadline);
                    g.ports.set_flag(port, PortFlags::RESUMING, true);
                    g.rh_timer.arm_no_later_than(deadline.instant());
                }
                Some(deadline) if deadline.expired(now) => {
                    g.ports.set_flag(port, PortFlags::SUSPENDED, false);
                    g.ports.set_flag(port, PortFlags::C_SUSPEND, true);
                    g.ports.clear_deadline(port);

                    let mut stop = portsc_for_write(&g.regs, port);
                    stop.modify(PORTSC::RESUME::CLEAR);
                    g.regs.write(Reg::PortSc(port), stop.get());

                    if let Err(e) = handshake(
                        &g.regs,
                        &self.kernel,
                        Reg::PortSc(port),
                        PORT_RESUME,
                        0,
                        RESUME_DONE_TIMEOUT_US,
                    ) {
                        error!("port {} resume error {e:?}", port + 1);
                        return Err(e);
                    }
                    temp.modify(
                        PORTSC::SUSPEND::CLEAR + PORTSC::RESUME::CLEAR + PORTSC::LINE_STATUS::SE0,
                    );
                    debug!("port {} resumed", port + 1);
                }
                Some(_) => {}
            }
        }

        if temp.is_set(PORTSC::RESET) {
            let done = g.ports.deadline(port).is_none_or(|d| d.expired(now));
            if done {
                status.change.reset_complete = true;
                g.ports.clear_deadline(port);

                let mut clear = portsc_for_write(&g.regs, port);
                clear.modify(PORTSC::RESET::CLEAR);
                g.regs.write(Reg::PortSc(port), clear.get());

                if let Err(e) = handshake(
                    &g.regs,
                    &self.kernel,
                    Reg::PortSc(port),
                    PORT_RESET,
                    0,
                    RESET_DONE_TIMEOUT_US,
                ) {
                    error!("port {} reset error {e:?}", port + 1);
                    return Err(e);
                }
                temp = self.check_reset_complete(g, port);
            }
        }

        if !temp.is_set(PORTSC::RESUME) && !temp.is_set(PORTSC::RESET) {
            let stale = g.ports.clear_deadline(port);
            // 复位已由控制器怪癖流程提前结束，这里补上复位完成
            if stale.is_some_and(|d| d.kind() == DeadlineKind::Reset) {
                status.change.reset_complete = true;
                temp = self.check_reset_complete(g, port);
            }
        }

        // 静态分配给 companion 的端口有设备时立即移交
        if temp.is_set(PORTSC::CONNECT) && g.ports.contains(port, PortFlags::COMPANION) {
            let mut owner = PortSc::new(temp.get() & !PORT_RWC_BITS);
            owner.modify(PORTSC::OWNER::SET);
            g.regs.write(Reg::PortSc(port), owner.get());
            g.ports.release_to_companion(port);
            debug!("port {} --> companion", port + 1);
            temp = PortSc::new(g.regs.read(Reg::PortSc(port)));
        }

        if temp.is_set(PORTSC::CONNECT) {
            status.connected = true;
            self.fill_speed(g, port, temp, &mut status);
        }
        if temp.is_set(PORTSC::PE) {
            status.enabled = true;
        }
        if temp.is_set(PORTSC::SUSPEND) || temp.is_set(PORTSC::RESUME) {
            status.suspended = true;
        } else if g.ports.contains(port, PortFlags::SUSPEND_DEFERRED) && temp.is_set(PORTSC::PE) {
            // 等总线挂起时再写 SUSPEND
            status.suspended = true;
        } else if g.ports.contains(port, PortFlags::SUSPENDED) {
            // 端口在软件不知情的情况下离开了挂起
            g.ports
                .set_flag(port, PortFlags::SUSPENDED | PortFlags::SUSPEND_DEFERRED, false);
            g.ports.clear_deadline(port);
            if temp.is_set(PORTSC::PE) {
                g.ports.set_flag(port, PortFlags::C_SUSPEND, true);
            }
        }
        if temp.is_set(PORTSC::OC) {
            status.over_current = true;
        }
        if temp.is_set(PORTSC::RESET) {
            status.resetting = true;
        }
        if temp.is_set(PORTSC::POWER) {
            status.powered = true;
        }
        if g.ports.contains(port, PortFlags::C_SUSPEND) {
            status.change.suspend_changed = true;
        }

        trace!("port {} portsc {:#010x} status {:#010x}", port + 1, temp.get(), status.to_wire());
        Ok(status)
    }

    /// 没有集成 TT 时连接到本控制器的设备一定是高速设备
    fn fill_speed(&self, g: &Inner<R>, port: usize, temp: PortSc, status: &mut PortStatus) {
        if !self.caps.integrated_tt {
            status.high_speed = true;
            return;
        }
        let speed = if self.caps.has_hostpc {
            HostPc::new(g.regs.read(Reg::HostPc(port))).read(HOSTPC::PSPD)
        } else {
            temp.read(PORTSC::PSPD)
        };
        match speed {
            0 => {}
            1 => status.low_speed = true,
            _ => status.high_speed = true,
        }
    }

    /// 端口变化位图：端口 i (< 7) 对应第 0 字节的 bit i+1，其余端口依次进入第 1 字节。
    ///
    /// 返回报告的字节数，没有待处理变化时返回 0。
    pub(super) fn status_data(&self, buf: &mut [u8]) -> usize {
        let n_ports = self.caps.n_ports;
        let len = if n_ports > 7 { 2 } else { 1 };
        if buf.len() < len {
            warn!("hub status buffer too small: {}", buf.len());
            return 0;
        }

        let mut g = self.inner.lock();
        if g.rh_state != RhState::Running {
            return 0;
        }
        buf[..len].fill(0);

        let mut mask = PORT_RWC_BITS;
        if self.config.ignore_oc {
            mask &= !PORT_OCC;
        }
        let ppcd = if self.caps.has_ppcd {
            g.regs.read(Reg::Status) >> 16
        } else {
            u32::MAX
        };
        let now = self.kernel.now();
        let resuming = g.ports.any(PortFlags::RESUMING);
        let mut changed = resuming;

        for port in 0..n_ports {
            if ppcd & (1 << port) == 0 {
                continue;
            }
            let temp = g.regs.read(Reg::PortSc(port));
            let deadline_passed = g.ports.deadline(port).is_some_and(|d| d.expired(now));
            if temp & mask != 0 || g.ports.contains(port, PortFlags::C_SUSPEND) || deadline_passed {
                if port < 7 {
                    buf[0] |= 1 << (port + 1);
                } else {
                    buf[1] |= 1 << (port - 7);
                }
                changed = true;
            }
        }

        // 保证恢复能按时结束
        if resuming {
            g.rh_timer.arm_no_later_than(now + RESUME_POLL_SLACK);
        }

        if changed { len } else { 0 }
    }
}
