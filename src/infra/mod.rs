//! 基础设施模块
//!
//! 封装外部依赖（本地进程、SSH 连接）

pub mod command;
pub mod ssh;

pub use command::{CommandError, CommandHandle, CommandRunner, CommandSpec, OutputChunk};
pub use ssh::{RusshConnector, SshConnection, SshConnector};
