//! 运行时状态模块
//!
//! 管理应用状态、事件通道、运行锁和部署历史

pub mod app_state;
pub mod event_hub;
pub mod history;
pub mod run_registry;

pub use app_state::AppState;
pub use event_hub::{EventHub, RunEmitter};
pub use history::{HistoryRecord, HistoryStore};
pub use run_registry::{ActiveRun, RunGuard, RunRegistry};
