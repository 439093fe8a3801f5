//! EHCI Root Hub
//!
//! 所有寄存器访问与端口影子状态都由同一把锁保护。需要毫秒级等待的流程
//! 在等待前交出锁，等待后重新加锁，再以寄存器为准重新判断状态。

use alloc::boxed::Box;
use core::time::Duration;

use spin::{Mutex, MutexGuard};
use usb_if::host::{RootHubOp, USBError};

use crate::{
    err::{HubError, Result},
    event::{RootHubEvent, RootHubEvents},
    osal::Kernel,
    port::{PortFlags, PortTracker},
    quirks::{HcCapabilities, Quirks},
    reg::{
        CMD_ASE, CMD_HCRESET, CMD_IAAD, CMD_PSE, CMD_RUN, INTR_MASK, PORTSC, PortSc, Reg,
        RegisterAccess, STS_ASS, STS_HALT, STS_PCD, STS_PSS, handshake, portsc_for_write,
    },
    timer::{Deadline, DeadlineKind, RhTimer},
};

mod bus;
mod companion;
mod control;
mod signal;
mod status;

/// 状态变化后下一次总线挂起/恢复之前的最短间隔
const SUSPEND_SETTLE: Duration = Duration::from_millis(10);
const RESUME_SETTLE: Duration = Duration::from_millis(5);

/// 停止控制器、关闭调度的握手时限：16 个微帧
const HALT_TIMEOUT_US: u32 = 16 * 125;

/// Root hub 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhState {
    Halted,
    Suspended,
    Running,
}

/// 运行时配置
#[derive(Debug, Clone, Copy, Default)]
pub struct RootHubConfig {
    /// 忽略过流变化（部分板子过流引脚悬空）
    pub ignore_oc: bool,
    /// Root hub 允许远程唤醒
    pub remote_wakeup: bool,
    /// 静态分配给 companion 的端口位图，第 i 位对应端口 i
    pub companion_ports: u32,
}

/// 调度器在挂起前记录的调度状态，总线恢复时用来重建 operational 寄存器
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleState {
    pub segment: u32,
    pub periodic_dma: u32,
    pub async_dma: u32,
    /// 异步调度上仍有 QH
    pub async_pending: bool,
    /// 周期调度上仍有传输
    pub periodic_pending: bool,
}

/// EHSET 单步 SET_FEATURE 测试
///
/// 在不持有控制器锁的情况下调用，`port` 为 0-based 端口下标。
pub trait SingleStepHook: Send + Sync {
    fn single_step_set_feature(&self, port: usize) -> Result;
}

pub(crate) struct Inner<R> {
    regs: R,
    ports: PortTracker,
    rh_state: RhState,
    rh_timer: RhTimer,
    /// 保存的 USBCMD
    command: u32,
    next_statechange: Duration,
    schedule: ScheduleState,
    debug_port_active: bool,
}

type Guard<'a, R> = MutexGuard<'a, Inner<R>>;

pub struct EhciRootHub<R: RegisterAccess, K: Kernel> {
    caps: HcCapabilities,
    config: RootHubConfig,
    kernel: K,
    inner: Mutex<Inner<R>>,
    events: RootHubEvents,
    single_step: Option<Box<dyn SingleStepHook>>,
}

impl<R: RegisterAccess, K: Kernel> EhciRootHub<R, K> {
    pub fn new(regs: R, kernel: K, quirks: Quirks, config: RootHubConfig) -> Self {
        let caps = HcCapabilities::probe(&regs, quirks);
        let ports = PortTracker::new(caps.n_ports, config.companion_ports);
        let command = regs.read(Reg::Command);
        let now = kernel.now();

        Self {
            caps,
            config,
            kernel,
            inner: Mutex::new(Inner {
                regs,
                ports,
                rh_state: RhState::Halted,
                rh_timer: RhTimer::default(),
                command,
                next_statechange: now,
                schedule: ScheduleState::default(),
                debug_port_active: false,
            }),
            events: RootHubEvents::new(),
            single_step: None,
        }
    }

    pub fn with_single_step(mut self, hook: impl SingleStepHook + 'static) -> Self {
        self.single_step = Some(Box::new(hook));
        self
    }

    pub fn capabilities(&self) -> &HcCapabilities {
        &self.caps
    }

    pub fn events(&self) -> &RootHubEvents {
        &self.events
    }

    pub fn state(&self) -> RhState {
        self.inner.lock().rh_state
    }

    /// 端口软件状态，`port` 为 0-based 下标
    pub fn port_flags(&self, port: usize) -> PortFlags {
        self.inner.lock().ports.get(port)
    }

    /// 启动控制器：运行、端口路由到本控制器、打开中断
    pub fn start(&self) {
        let mut g = self.inner.lock();
        let g = &mut *g;

        g.command = (g.command & !CMD_HCRESET) | CMD_RUN;
        g.regs.write(Reg::Command, g.command);
        g.regs.write(Reg::ConfigFlag, 1);
        // 刷新 posted write
        g.regs.read(Reg::Command);

        if self.caps.ppc {
            for port in 0..self.caps.n_ports {
                let mut temp = portsc_for_write(&g.regs, port);
                if !temp.is_set(PORTSC::POWER) {
                    temp.modify(PORTSC::POWER::SET);
                    g.regs.write(Reg::PortSc(port), temp.get());
                }
            }
        }

        g.regs.write(Reg::IntrEnable, INTR_MASK);
        g.rh_state = RhState::Running;
        g.next_statechange = self.kernel.now();
        info!("EHCI root hub running, {} ports", self.caps.n_ports);
    }

    /// 控制器复位或掉电后重新初始化端口状态
    pub fn reset_state(&self) {
        let mut g = self.inner.lock();
        g.ports.reset();
        g.rh_timer.cancel();
        g.rh_state = RhState::Halted;
        g.command = g.regs.read(Reg::Command);
        debug!("root hub state reset");
    }

    /// 调度器更新挂起前的调度状态
    pub fn set_schedule(&self, schedule: ScheduleState) {
        self.inner.lock().schedule = schedule;
    }

    /// Debug port 被启用时拒绝对该端口的 SetPortFeature
    pub fn set_debug_port_active(&self, active: bool) {
        self.inner.lock().debug_port_active = active;
    }

    /// 轮询定时器的下一次触发时刻
    pub fn timer_expires(&self) -> Option<Duration> {
        self.inner.lock().rh_timer.expires()
    }

    /// 平台定时器回调，定时器到期时通知 hub 层重新查询端口状态
    pub fn poll_timer(&self) -> bool {
        let now = self.kernel.now();
        let fired = self.inner.lock().rh_timer.fire(now);
        if fired {
            self.events.push(RootHubEvent::PollStatus);
        }
        fired
    }

    /// 中断处理：确认 PCD，识别远程唤醒并开始 20ms 恢复信号
    pub fn handle_irq(&self) -> bool {
        let mut g = self.inner.lock();
        let status = g.regs.read(Reg::Status);
        if status == u32::MAX || status & STS_PCD == 0 {
            return false;
        }
        g.regs.write(Reg::Status, STS_PCD);

        if g.rh_state == RhState::Suspended {
            self.events.push(RootHubEvent::ResumeRootHub);
        }

        let ppcd = if self.caps.has_ppcd {
            status >> 16
        } else {
            u32::MAX
        };
        let now = self.kernel.now();

        for port in (0..self.caps.n_ports).rev() {
            if ppcd & (1 << port) == 0 {
                continue;
            }
            let portsc = PortSc::new(g.regs.read(Reg::PortSc(port)));
            if portsc.is_set(PORTSC::OWNER) {
                continue;
            }
            let woke = g.ports.contains(port, PortFlags::SUSPENDED)
                && !g.ports.contains(port, PortFlags::SUSPEND_DEFERRED)
                && (portsc.is_set(PORTSC::RESUME) || !portsc.is_set(PORTSC::SUSPEND))
                && portsc.is_set(PORTSC::PE)
                && g.ports.deadline(port).is_none();
            if !woke {
                continue;
            }
            let deadline = Deadline::after(now, DeadlineKind::Resume);
            g.ports.set_deadline(port, deadline);
            g.ports.set_flag(port, PortFlags::RESUMING, true);
            g.rh_timer.arm_no_later_than(deadline.instant());
            debug!("port {} remote wakeup", port + 1);
        }

        let ports = if self.caps.has_ppcd {
            ppcd & ((1 << self.caps.n_ports) - 1)
        } else {
            (1 << self.caps.n_ports) - 1
        };
        drop(g);
        self.events.push(RootHubEvent::PortChange { ports });
        true
    }

    /// 交出锁等待 `duration`，之后重新加锁
    fn sleep_unlocked<'a>(&'a self, g: Guard<'a, R>, duration: Duration) -> Guard<'a, R> {
        drop(g);
        self.kernel.delay(duration);
        self.inner.lock()
    }

    /// 在不持锁的情况下等待寄存器满足条件
    fn wait_unlocked<'a>(
        &'a self,
        mut g: Guard<'a, R>,
        reg: Reg,
        mask: u32,
        done: u32,
        timeout: Duration,
    ) -> Result<Guard<'a, R>> {
        const STEP: Duration = Duration::from_micros(100);
        let start = self.kernel.now();
        loop {
            let value = g.regs.read(reg);
            if value == u32::MAX {
                return Err(HubError::Shutdown);
            }
            if value & mask == done {
                return Ok(g);
            }
            if self.kernel.now() - start >= timeout {
                return Err(HubError::Timeout);
            }
            g = self.sleep_unlocked(g, STEP);
        }
    }

    /// 距上次总线状态变化太近时先等待
    fn wait_statechange(&self) {
        let early = self.kernel.now() < self.inner.lock().next_statechange;
        if early {
            self.kernel.delay(RESUME_SETTLE);
        }
    }

    /// 关中断并停止控制器
    fn halt(&self, g: &mut Inner<R>) -> Result {
        g.regs.write(Reg::IntrEnable, 0);
        let cmd = g.regs.read(Reg::Command) & !(CMD_RUN | CMD_IAAD);
        g.regs.write(Reg::Command, cmd);
        handshake(&g.regs, &self.kernel, Reg::Status, STS_HALT, STS_HALT, HALT_TIMEOUT_US)
    }

    /// 等待调度开关生效后关闭异步与周期调度
    fn quiesce(&self, g: &mut Inner<R>) {
        if g.rh_state != RhState::Running {
            return;
        }
        let mask = STS_ASS | STS_PSS;
        let pending = (g.command << 10) & mask;
        if let Err(e) = handshake(&g.regs, &self.kernel, Reg::Status, mask, pending, HALT_TIMEOUT_US) {
            debug!("schedule status did not settle: {e:?}");
        }

        g.command &= !(CMD_ASE | CMD_PSE);
        g.regs.write(Reg::Command, g.command);
        if let Err(e) = handshake(&g.regs, &self.kernel, Reg::Status, mask, 0, HALT_TIMEOUT_US) {
            debug!("schedules did not stop: {e:?}");
        }
    }

    /// 控制器或任一端口报告了连接变化
    fn port_change(&self, g: &Inner<R>) -> bool {
        if g.regs.read(Reg::Status) & STS_PCD != 0 {
            return true;
        }
        (0..self.caps.n_ports).any(|port| {
            PortSc::new(g.regs.read(Reg::PortSc(port))).is_set(PORTSC::CSC)
        })
    }
}

impl<R: RegisterAccess, K: Kernel> RootHubOp for EhciRootHub<R, K> {
    fn hub_control(
        &self,
        type_req: u16,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> core::result::Result<usize, USBError> {
        Ok(self.control(type_req, value, index, buf)?)
    }

    fn hub_status_data(&self, buf: &mut [u8]) -> usize {
        self.status_data(buf)
    }

    fn bus_suspend(&self) -> core::result::Result<(), USBError> {
        Ok(self.suspend_bus()?)
    }

    fn bus_resume(&self) -> core::result::Result<(), USBError> {
        Ok(self.resume_bus()?)
    }
}
