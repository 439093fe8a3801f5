use alloc::vec::Vec;

use crate::timer::Deadline;

bitflags::bitflags! {
    /// 软件侧的端口状态
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortFlags: u8 {
        /// 总线挂起时端口归 companion 所有，供掉电恢复使用
        const OWNED = 1 << 0;
        /// 配置时静态分配给 companion
        const COMPANION = 1 << 1;
        /// 软件认为端口处于挂起
        const SUSPENDED = 1 << 2;
        /// 正在发送或等待恢复信号
        const RESUMING = 1 << 3;
        /// 硬件确认的挂起状态变化尚未被读取 (C_SUSPEND)
        const C_SUSPEND = 1 << 4;
        /// 由总线挂起流程挂起，总线恢复时需要恢复
        const BUS_SUSPENDED = 1 << 5;
        /// 已接受 SetPortFeature(SUSPEND)，SUSPEND 位推迟到总线挂起时再写
        const SUSPEND_DEFERRED = 1 << 6;
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PortState {
    flags: PortFlags,
    deadline: Option<Deadline>,
}

/// 每个端口的软件影子状态
///
/// 只在控制器锁内修改。下标越界属于编程错误，直接 panic。
#[derive(Debug)]
pub struct PortTracker {
    ports: Vec<PortState>,
}

impl PortTracker {
    /// `companion_ports` 第 i 位表示端口 i 静态分配给 companion
    pub fn new(n_ports: usize, companion_ports: u32) -> Self {
        let ports = (0..n_ports)
            .map(|i| {
                let mut state = PortState::default();
                if companion_ports & (1 << i) != 0 {
                    state.flags |= PortFlags::COMPANION;
                }
                state
            })
            .collect();
        Self { ports }
    }

    pub fn get(&self, port: usize) -> PortFlags {
        self.ports[port].flags
    }

    pub fn contains(&self, port: usize, flag: PortFlags) -> bool {
        self.ports[port].flags.contains(flag)
    }

    pub fn set_flag(&mut self, port: usize, flag: PortFlags, value: bool) {
        let state = &mut self.ports[port];
        state.flags.set(flag, value);
        debug_assert!(
            !state.flags.contains(PortFlags::RESUMING) || state.deadline.is_some(),
            "port {port} resuming without a deadline"
        );
    }

    pub fn deadline(&self, port: usize) -> Option<Deadline> {
        self.ports[port].deadline
    }

    pub fn set_deadline(&mut self, port: usize, deadline: Deadline) {
        self.ports[port].deadline = Some(deadline);
    }

    /// 取消截止时间，同时清除 RESUMING，返回被取消的截止时间
    pub fn clear_deadline(&mut self, port: usize) -> Option<Deadline> {
        let state = &mut self.ports[port];
        state.flags.remove(PortFlags::RESUMING);
        state.deadline.take()
    }

    /// 是否有端口带着 `flag`
    pub fn any(&self, flag: PortFlags) -> bool {
        self.ports.iter().any(|p| p.flags.contains(flag))
    }

    /// 带着 `flag` 的端口位图
    pub fn bitmap(&self, flag: PortFlags) -> u32 {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.flags.contains(flag))
            .fold(0, |acc, (i, _)| acc | 1 << i)
    }

    pub fn clear_all(&mut self, flag: PortFlags) {
        for p in &mut self.ports {
            p.flags.remove(flag);
        }
    }

    /// 端口交给 companion 后不再跟踪挂起状态
    pub fn release_to_companion(&mut self, port: usize) {
        let state = &mut self.ports[port];
        state.flags.remove(
            PortFlags::SUSPENDED
                | PortFlags::SUSPEND_DEFERRED
                | PortFlags::RESUMING
                | PortFlags::C_SUSPEND
                | PortFlags::BUS_SUSPENDED,
        );
        state.deadline = None;
    }

    /// 控制器复位或掉电后回到“未连接、未移交、未挂起”，只保留静态分配
    pub fn reset(&mut self) {
        for p in &mut self.ports {
            p.flags &= PortFlags::COMPANION;
            p.deadline = None;
        }
    }
}
