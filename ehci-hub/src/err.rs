use usb_if::{err::TransferError, host::USBError};

pub type Result<T = ()> = core::result::Result<T, HubError>;

/// Root Hub 请求失败原因
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// 非法端口号或不支持的特性，协议层表现为 STALL
    #[error("request stalled")]
    Stall,
    /// 有端口正在恢复，不能挂起总线
    #[error("a port resume is in progress")]
    Busy,
    /// 控制器已不可访问
    #[error("host controller is not accessible")]
    Shutdown,
    /// 寄存器握手未在时限内完成
    #[error("register handshake timed out")]
    Timeout,
    /// 端口被 debug port 占用
    #[error("port is owned by the debug port")]
    NoDevice,
}

impl From<HubError> for USBError {
    fn from(value: HubError) -> Self {
        match value {
            HubError::Stall => USBError::TransferError(TransferError::Stall),
            HubError::Busy => USBError::Busy,
            HubError::Shutdown => USBError::Shutdown,
            HubError::Timeout => USBError::Timeout,
            HubError::NoDevice => USBError::NoDevice,
        }
    }
}
