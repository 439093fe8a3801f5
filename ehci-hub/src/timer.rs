use core::time::Duration;

/// 恢复信号持续时间（USB 2.0 7.1.7.7 要求至少 20ms）
pub const RESUME_SIGNAL_TIME: Duration = Duration::from_millis(20);
/// Root port 复位信号持续时间
pub const RESET_SIGNAL_TIME: Duration = Duration::from_millis(50);
/// 有端口在恢复时，状态轮询定时器最晚的触发间隔
pub const RESUME_POLL_SLACK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    Reset,
    Resume,
}

/// 端口上正在进行的复位或恢复的结束时刻
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Duration,
    kind: DeadlineKind,
}

impl Deadline {
    pub fn after(now: Duration, kind: DeadlineKind) -> Self {
        let len = match kind {
            DeadlineKind::Reset => RESET_SIGNAL_TIME,
            DeadlineKind::Resume => RESUME_SIGNAL_TIME,
        };
        Self::at(now + len, kind)
    }

    pub fn at(at: Duration, kind: DeadlineKind) -> Self {
        Self { at, kind }
    }

    pub fn instant(&self) -> Duration {
        self.at
    }

    pub fn kind(&self) -> DeadlineKind {
        self.kind
    }

    pub fn expired(&self, now: Duration) -> bool {
        now >= self.at
    }
}

/// Root hub 状态轮询定时器
///
/// 只记录最早的触发时刻；到期后由平台调用 `EhciRootHub::poll_timer`。
#[derive(Debug, Default, Clone, Copy)]
pub struct RhTimer {
    expires: Option<Duration>,
}

impl RhTimer {
    /// 已经设置了更早的触发时刻时保持不变
    pub fn arm_no_later_than(&mut self, at: Duration) {
        match self.expires {
            Some(cur) if cur <= at => {}
            _ => self.expires = Some(at),
        }
    }

    pub fn cancel(&mut self) {
        self.expires = None;
    }

    pub fn expires(&self) -> Option<Duration> {
        self.expires
    }

    /// 到期返回 true 并解除定时器
    pub fn fire(&mut self, now: Duration) -> bool {
        match self.expires {
            Some(at) if now >= at => {
                self.expires = None;
                true
            }
            _ => false,
        }
    }
}
