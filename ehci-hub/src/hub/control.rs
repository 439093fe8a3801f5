use usb_if::host::hub::{
    HubCharacteristics, HubDescriptor, HubFeature, HubRequest, PortFeature,
    TEST_SINGLE_STEP_SET_FEATURE,
};

use super::{EhciRootHub, Guard, RhState};
use crate::{
    err::{HubError, Result},
    osal::Kernel,
    port::PortFlags,
    reg::{PORTSC, PortSc, Reg, RegisterAccess, portsc_for_write},
};

/// bPwrOn2PwrGood，单位 2ms
const POWER_GOOD_TIME: u8 = 10;

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    /// Hub 类控制请求入口
    pub(crate) fn control(&self, type_req: u16, value: u16, index: u16, buf: &mut [u8]) -> Result<usize> {
        let req = HubRequest::try_from(type_req).map_err(|_| HubError::Stall)?;
        trace!("hub control {req:?} value {value:#x} index {index:#x}");

        match req {
            HubRequest::ClearHubFeature | HubRequest::SetHubFeature => {
                // 没有需要清除的 hub 级电源或过流状态
                HubFeature::try_from(value).map_err(|_| HubError::Stall)?;
                Ok(0)
            }
            HubRequest::GetHubDescriptor => Ok(self.hub_descriptor().write_to(buf)),
            HubRequest::GetHubStatus => {
                let buf = buf.get_mut(..4).ok_or(HubError::Stall)?;
                buf.fill(0);
                Ok(4)
            }
            HubRequest::GetPortStatus => {
                let port = self.port_index(index)?;
                let buf = buf.get_mut(..4).ok_or(HubError::Stall)?;
                let mut g = self.inner.lock();
                let status = self.get_port_status(&mut g, port)?;
                buf.copy_from_slice(&status.to_wire().to_le_bytes());
                Ok(4)
            }
            HubRequest::ClearPortFeature => {
                let port = self.port_index(index)?;
                let feature = PortFeature::try_from(value).map_err(|_| HubError::Stall)?;
                self.clear_port_feature(port, feature)?;
                Ok(0)
            }
            HubRequest::SetPortFeature => {
                let selector = (index >> 8) as u8;
                let wport = index & 0xff;
                self.check_debug_port(wport)?;
                let port = self.port_index(wport)?;
                let feature = PortFeature::try_from(value).map_err(|_| HubError::Stall)?;
                self.set_port_feature(port, feature, selector)?;
                Ok(0)
            }
        }
    }

    /// 1-based wIndex 转换为端口下标
    fn port_index(&self, index: u16) -> Result<usize> {
        let index = index as usize;
        if index == 0 || index > self.caps.n_ports {
            return Err(HubError::Stall);
        }
        Ok(index - 1)
    }

    fn check_debug_port(&self, wport: u16) -> Result {
        if let Some(debug_port) = self.caps.debug_port
            && debug_port + 1 == wport as usize
            && self.inner.lock().debug_port_active
        {
            return Err(HubError::NoDevice);
        }
        Ok(())
    }

    pub fn hub_descriptor(&self) -> HubDescriptor {
        // 端口独立过流保护，电源开关视 PPC 而定
        let characteristics = 0x0008 | if self.caps.ppc { 0x0001 } else { 0x0002 };
        HubDescriptor {
            num_ports: self.caps.n_ports as u8,
            characteristics: HubCharacteristics::from_descriptor(characteristics),
            power_good_time: POWER_GOOD_TIME,
            hub_current: 0,
        }
    }

    /// 即使端口已交给 companion 也要处理，hub 层需要清除变化位（尤其是 C_CONNECTION）
    fn clear_port_feature(&self, port: usize, feature: PortFeature) -> Result {
        let mut g = self.inner.lock();
        let mut temp = portsc_for_write(&g.regs, port);

        match feature {
            PortFeature::Enable => {
                temp.modify(PORTSC::PE::CLEAR);
                g.regs.write(Reg::PortSc(port), temp.get());
            }
            PortFeature::CEnable => {
                temp.modify(PORTSC::PEC::SET);
                g.regs.write(Reg::PortSc(port), temp.get());
            }
            PortFeature::Suspend => {
                g = self.resume_port(g, port)?;
            }
            PortFeature::CSuspend => {
                g.ports.set_flag(port, PortFlags::C_SUSPEND, false);
            }
            PortFeature::Power => {
                if self.caps.ppc {
                    temp.modify(PORTSC::POWER::CLEAR);
                    g.regs.write(Reg::PortSc(port), temp.get());
                }
            }
            PortFeature::CConnection => {
                if self.caps.has_lpm {
                    // 断开后清除 LPM 状态
                    temp.modify(PORTSC::LPM::CLEAR + PORTSC::DEV_ADDR::CLEAR);
                }
                temp.modify(PORTSC::CSC::SET);
                g.regs.write(Reg::PortSc(port), temp.get());
            }
            PortFeature::COverCurrent => {
                temp.modify(PORTSC::OCC::SET);
                g.regs.write(Reg::PortSc(port), temp.get());
            }
            // 由 GetPortStatus 结束复位
            PortFeature::CReset => {}
            _ => return Err(HubError::Stall),
        }

        // 刷新 posted write
        g.regs.read(Reg::Command);
        Ok(())
    }

    /// 端口已交给 companion 时静默接受
    fn set_port_feature(&self, port: usize, feature: PortFeature, selector: u8) -> Result {
        let mut g = self.inner.lock();
        let raw = g.regs.read(Reg::PortSc(port));
        if PortSc::new(raw).is_set(PORTSC::OWNER) {
            return Ok(());
        }
        let mut temp = portsc_for_write(&g.regs, port);

        match feature {
            PortFeature::Suspend => {
                g = self.suspend_port(g, port, temp)?;
            }
            PortFeature::Power => {
                if self.caps.ppc {
                    temp.modify(PORTSC::POWER::SET);
                    g.regs.write(Reg::PortSc(port), temp.get());
                }
            }
            PortFeature::Reset => {
                g = self.reset_port(g, port, temp)?;
            }
            PortFeature::Test => {
                g = self.enter_test_mode(g, port, selector)?;
            }
            _ => return Err(HubError::Stall),
        }

        g.regs.read(Reg::Command);
        Ok(())
    }

    /// USB 2.0 7.1.20 / EHCI 4.14：端口测试模式，之后控制器需要重新初始化
    fn enter_test_mode<'a>(&'a self, mut g: Guard<'a, R>, port: usize, selector: u8) -> Result<Guard<'a, R>> {
        match selector {
            1..=5 => {
                self.quiesce(&mut g);
                for i in (0..self.caps.n_ports).rev() {
                    let mut temp = portsc_for_write(&g.regs, i);
                    if temp.is_set(PORTSC::PE) {
                        temp.modify(PORTSC::SUSPEND::SET);
                        g.regs.write(Reg::PortSc(i), temp.get());
                    }
                }
                if let Err(e) = self.halt(&mut g) {
                    warn!("controller halt before test mode failed: {e:?}");
                }
                g.rh_state = RhState::Halted;

                let mut temp = portsc_for_write(&g.regs, port);
                temp.modify(PORTSC::TEST.val(selector as u32));
                g.regs.write(Reg::PortSc(port), temp.get());
                info!("port {} test mode {selector}", port + 1);
                Ok(g)
            }
            TEST_SINGLE_STEP_SET_FEATURE => {
                let Some(hook) = self.single_step.as_deref() else {
                    return Err(HubError::Stall);
                };
                drop(g);
                let ret = hook.single_step_set_feature(port);
                let g = self.inner.lock();
                ret.map(|_| g)
            }
            _ => Err(HubError::Stall),
        }
    }
}
