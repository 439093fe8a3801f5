pub mod hub;

use crate::err::TransferError;

/// Root Hub 对上层 Hub 轮询层暴露的操作
///
/// 请求以 USB 2.0 规范 11.24.2 的线格式传递：`type_req` 为
/// `bmRequestType << 8 | bRequest`，`value`/`index` 为 wValue/wIndex。
pub trait RootHubOp: Send + Sync {
    /// 处理一个 Hub 类控制请求，返回写入 `buf` 的字节数。
    fn hub_control(
        &self,
        type_req: u16,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, USBError>;

    /// 填充端口变化位图，返回报告的字节数；没有待处理变化时返回 0。
    fn hub_status_data(&self, buf: &mut [u8]) -> usize;

    fn bus_suspend(&self) -> Result<(), USBError>;

    fn bus_resume(&self) -> Result<(), USBError>;
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Device or resource busy")]
    Busy,
    #[error("Host controller shut down")]
    Shutdown,
    #[error("No such device")]
    NoDevice,
}
