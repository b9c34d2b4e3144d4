//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod event;
pub mod project;
pub mod prompt;
pub mod run;

// Re-exports for convenience
pub use event::{DeployEvent, EventPayload, OutputType};
pub use project::{
    effective_ssh, EnvVar, InputSpec, Project, SshAuth, SshConfig, Step, SubDeployment,
};
pub use prompt::PromptSession;
pub use run::{DeploymentRun, RunStatus, RunTarget, StepPhase, StepResult};
