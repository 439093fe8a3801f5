//! Root hub 事件
//!
//! 中断与定时器产生的事件通过无锁队列交给 hub 层，hub 层再调用
//! `hub_status_data` / `GetPortStatus` 取得具体变化。

use alloc::vec::Vec;
use core::task::Poll;

use crossbeam::queue::SegQueue;
use futures::{future::poll_fn, task::AtomicWaker};

/// Root hub 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootHubEvent {
    /// 端口状态变化（PCD 中断或远程唤醒）
    PortChange {
        /// 发生变化的端口位图；控制器不支持 PPCD 时为全部端口
        ports: u32,
    },
    /// 轮询定时器到期，有复位或恢复需要检查
    PollStatus,
    /// 控制器挂起期间检测到唤醒，需要恢复 root hub
    ResumeRootHub,
}

/// Root hub 事件队列
pub struct RootHubEvents {
    events: SegQueue<RootHubEvent>,
    waker: AtomicWaker,
}

impl RootHubEvents {
    pub fn new() -> Self {
        Self {
            events: SegQueue::new(),
            waker: AtomicWaker::new(),
        }
    }

    pub fn push(&self, event: RootHubEvent) {
        trace!("root hub event: {event:?}");
        self.events.push(event);
        self.waker.wake();
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// 弹出所有待处理事件
    pub fn drain(&self) -> Vec<RootHubEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.pop() {
            events.push(event);
        }
        events
    }

    /// 等待下一个事件
    pub async fn next(&self) -> RootHubEvent {
        poll_fn(|cx| {
            if let Some(event) = self.events.pop() {
                return Poll::Ready(event);
            }
            self.waker.register(cx.waker());
            // 注册后再检查一次，避免错过注册前到达的事件
            match self.events.pop() {
                Some(event) => Poll::Ready(event),
                None => Poll::Pending,
            }
        })
        .await
    }
}

impl Default for RootHubEvents {
    fn default() -> Self {
        Self::new()
    }
}
