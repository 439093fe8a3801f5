//! EHCI Root Hub 端口状态控制器
//!
//! 跟踪每个下游端口的连接、复位、使能、挂起、恢复、过流以及
//! companion 控制器移交状态，并在这些状态之上应答 Hub 类控制请求。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod err;
pub mod event;
pub mod hub;
pub mod osal;
pub mod port;
pub mod quirks;
pub mod reg;
pub mod timer;

#[cfg(test)]
mod sim;

pub use err::{HubError, Result};
pub use event::{RootHubEvent, RootHubEvents};
pub use hub::{EhciRootHub, RhState, RootHubConfig, ScheduleState, SingleStepHook};
pub use osal::Kernel;
pub use port::{PortFlags, PortTracker};
pub use quirks::{HcCapabilities, Quirks, ResetStrategy, ResumeStrategy, SuspendStrategy};
pub use reg::{MmioRegisters, Reg, RegisterAccess};
pub use usb_if::host::RootHubOp;
pub use usb_if::host::hub::{PortStatus, PortStatusChange};
