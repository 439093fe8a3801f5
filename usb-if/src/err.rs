pub use crate::host::USBError;

/// 控制/数据传输错误
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// 端点 STALL，Hub 类请求失败时统一以 STALL 返回
    #[error("Stall")]
    Stall,
    #[error("Timeout")]
    Timeout,
}
