use core::time::Duration;

/// 平台提供的时间服务
///
/// `now` 必须单调递增；`delay` 在调用线程上阻塞指定时长，
/// 调用方保证调用时不持有控制器锁（微秒级握手除外）。
pub trait Kernel: Send + Sync {
    fn now(&self) -> Duration;
    fn delay(&self, duration: Duration);
}
