//! 配置模块
//!
//! 环境变量解析与项目配置目录

pub mod env;
pub mod project;

pub use env::{EngineSettings, EnvConfig, FanoutMode, PromptSettings, SshClientSettings};
pub use project::ProjectCatalog;
