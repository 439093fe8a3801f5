//! Companion 控制器移交
//!
//! 全速/低速设备由 companion（OHCI/UHCI）控制器处理。运行时通过 PORT_OWNER
//! 移交；掉电后端口重新路由回本控制器，需要复位这些端口让 companion
//! 再次接管。

use core::time::Duration;

use usb_if::host::hub::{HubRequest, PortFeature};

use super::EhciRootHub;
use crate::{
    osal::Kernel,
    port::PortFlags,
    reg::{PORTSC, PortSc, Reg, RegisterAccess, portsc_for_write},
};

/// 端口使能时控制器不接受 OWNER，至少需要两次：一次禁用端口，一次写 OWNER
const SET_OWNER_TRIES: usize = 4;
const SET_OWNER_INTERVAL: Duration = Duration::from_millis(5);
/// 掉电恢复后等待连接出现
const CONNECT_SETTLE_TIME: Duration = Duration::from_millis(20);
/// 等待恢复流程发起的复位完成
const HANDOVER_RESET_TIME: Duration = Duration::from_millis(90);

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    /// 把端口交给 companion，`port` 为 0-based 下标。集成 TT 时没有 companion。
    pub fn relinquish_port(&self, port: usize) {
        if self.caps.integrated_tt {
            return;
        }
        self.set_owner(port, true);
    }

    /// 端口当前是否归 companion 所有
    pub fn port_handed_over(&self, port: usize) -> bool {
        if self.caps.integrated_tt {
            return false;
        }
        let g = self.inner.lock();
        PortSc::new(g.regs.read(Reg::PortSc(port))).is_set(PORTSC::OWNER)
    }

    fn set_owner(&self, port: usize, owner: bool) {
        for attempt in (1..=SET_OWNER_TRIES).rev() {
            let mut g = self.inner.lock();
            let raw = PortSc::new(g.regs.read(Reg::PortSc(port)));
            if raw.is_set(PORTSC::OWNER) == owner
                || !(raw.is_set(PORTSC::OWNER) || raw.is_set(PORTSC::CONNECT))
            {
                break;
            }

            let mut temp = portsc_for_write(&g.regs, port);
            temp.modify(PORTSC::OWNER.val(owner as u32) + PORTSC::PE::CLEAR);
            g.regs.write(Reg::PortSc(port), temp.get());
            if owner {
                g.ports.release_to_companion(port);
            }
            drop(g);

            if attempt > 1 {
                self.kernel.delay(SET_OWNER_INTERVAL);
            }
        }
    }

    /// 掉电后复位总线挂起时归 companion 所有的端口，让 companion 重新接管。
    ///
    /// 失败只记录日志并禁用端口。
    pub(super) fn handover_companion_ports(&self) {
        let owned = {
            let mut g = self.inner.lock();
            let owned = g.ports.bitmap(PortFlags::OWNED);
            if owned != 0 && self.caps.ppc {
                for port in self.ports_in(owned) {
                    let mut temp = portsc_for_write(&g.regs, port);
                    if !temp.is_set(PORTSC::POWER) {
                        temp.modify(PORTSC::POWER::SET);
                        g.regs.write(Reg::PortSc(port), temp.get());
                    }
                }
            }
            owned
        };
        if owned == 0 {
            return;
        }

        self.kernel.delay(CONNECT_SETTLE_TIME);

        for port in self.ports_in(owned) {
            let mut g = self.inner.lock();
            let mut temp = portsc_for_write(&g.regs, port);
            if temp.is_set(PORTSC::OWNER) {
                // companion 仍然拥有端口，没有掉电
                g.ports.set_flag(port, PortFlags::OWNED, false);
            } else if g.ports.contains(port, PortFlags::COMPANION) {
                temp.modify(PORTSC::PE::CLEAR);
                g.regs.write(Reg::PortSc(port), temp.get());
            } else {
                drop(g);
                let ret = self.control(
                    HubRequest::SetPortFeature.into(),
                    PortFeature::Reset.into(),
                    port as u16 + 1,
                    &mut [],
                );
                if let Err(e) = ret {
                    warn!("port {} handover reset failed: {e:?}", port + 1);
                }
            }
        }

        let owned = self.inner.lock().ports.bitmap(PortFlags::OWNED);
        if owned == 0 {
            return;
        }
        self.kernel.delay(HANDOVER_RESET_TIME);

        for port in self.ports_in(owned) {
            // 结束复位，全速设备在这里交给 companion
            let mut buf = [0u8; 4];
            if let Err(e) = self.control(
                HubRequest::GetPortStatus.into(),
                0,
                port as u16 + 1,
                &mut buf,
            ) {
                warn!("port {} status after handover reset: {e:?}", port + 1);
            }

            let mut g = self.inner.lock();
            let mut temp = portsc_for_write(&g.regs, port);
            if temp.is_set(PORTSC::OWNER) {
                temp.modify(PORTSC::CSC::SET);
            } else {
                warn!("failed handover port {}: {:#010x}", port + 1, temp.get());
                temp.modify(PORTSC::PE::CLEAR);
            }
            g.regs.write(Reg::PortSc(port), temp.get());
        }

        self.inner.lock().ports.clear_all(PortFlags::OWNED);
    }

    /// 位图中的端口，从高到低
    fn ports_in(&self, bitmap: u32) -> impl Iterator<Item = usize> {
        (0..self.caps.n_ports)
            .rev()
            .filter(move |port| bitmap & (1 << port) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::RootHubConfig,
        quirks::Quirks,
        reg::{PORT_CSC, PORT_PE},
        sim::{enable_port, port_status, set_feature, setup},
        timer::RESET_SIGNAL_TIME,
    };
    use usb_if::host::{RootHubOp, hub::DeviceSpeed};

    fn portsc_writes(hw: &crate::sim::SimHw, port: usize) -> usize {
        hw.writes
            .iter()
            .filter(|(reg, _)| *reg == Reg::PortSc(port))
            .count()
    }

    #[test]
    fn test_relinquish_enabled_port() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        hw.lock().writes.clear();

        let before = clock.now();
        hub.relinquish_port(0);
        assert!(hub.port_handed_over(0));
        // 第一次只禁用了端口
        assert_eq!(portsc_writes(&hw.lock(), 0), 2);
        assert_eq!(clock.now() - before, SET_OWNER_INTERVAL * 2);
        assert_eq!(hw.lock().portsc(0) & PORT_PE, 0);
    }

    #[test]
    fn test_relinquish_empty_port_is_noop() {
        let (hub, hw, _clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().writes.clear();
        hub.relinquish_port(0);
        assert!(!hub.port_handed_over(0));
        assert!(hw.lock().writes.is_empty());
    }

    #[test]
    fn test_relinquish_with_integrated_tt() {
        let (hub, hw, clock) = setup(1, false, Quirks::INTEGRATED_TT, RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::Full);
        enable_port(&hub, &clock, 0);
        hub.relinquish_port(0);
        assert!(!hub.port_handed_over(0));
        assert_ne!(hw.lock().portsc(0) & PORT_PE, 0);
    }

    #[test]
    fn test_power_loss_recovery_hands_over_again() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::Full);
        set_feature(&hub, PortFeature::Reset, 0).unwrap();
        clock.advance(RESET_SIGNAL_TIME);
        port_status(&hub, 0).unwrap();
        assert!(hub.port_handed_over(0));

        hub.bus_suspend().unwrap();
        assert!(hub.port_flags(0).contains(PortFlags::OWNED));

        hw.lock().lose_power();
        assert!(!hub.port_handed_over(0));
        hub.bus_resume().unwrap();

        assert!(hub.port_handed_over(0));
        assert!(!hub.port_flags(0).contains(PortFlags::OWNED));
        assert_eq!(hw.lock().portsc(0) & PORT_CSC, 0);
    }

    #[test]
    fn test_power_loss_recovery_failure_disables_port() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        hub.relinquish_port(0);

        hub.bus_suspend().unwrap();
        hw.lock().lose_power();
        hub.bus_resume().unwrap();

        // 高速设备复位后使能，无法移交
        assert!(!hub.port_handed_over(0));
        assert_eq!(hw.lock().portsc(0) & PORT_PE, 0);
        assert!(!hub.port_flags(0).contains(PortFlags::OWNED));
    }

    #[test]
    fn test_resume_without_power_loss_keeps_owner() {
        let (hub, hw, clock) = setup(1, false, Quirks::empty(), RootHubConfig::default());
        hw.lock().connect(0, DeviceSpeed::High);
        enable_port(&hub, &clock, 0);
        hub.relinquish_port(0);

        hub.bus_suspend().unwrap();
        hw.lock().writes.clear();
        hub.bus_resume().unwrap();

        assert!(hub.port_handed_over(0));
        assert!(!hub.port_flags(0).contains(PortFlags::OWNED));
        // 只有恢复流程清唤醒位的一次写
        assert_eq!(portsc_writes(&hw.lock(), 0), 1);
    }
}
