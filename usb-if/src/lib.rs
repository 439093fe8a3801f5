#![no_std]

pub mod err;
pub mod host;

// 重新导出 host::hub::DeviceSpeed，避免重复定义
pub use host::hub::DeviceSpeed;
