//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{EnvConfig, ProjectCatalog};
use crate::infra::ssh::{RusshConnector, SshConnector};
use crate::services::deploy::DeployEngine;

use super::history::HistoryStore;

/// 应用状态
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
    /// 部署引擎
    pub engine: Arc<DeployEngine>,
}

impl AppState {
    /// 按环境配置组装：项目目录文件、磁盘历史、russh 连接器
    pub fn new(config: EnvConfig) -> Self {
        let catalog = Arc::new(ProjectCatalog::from_file(&config.projects_file));
        let history = Arc::new(HistoryStore::new(
            config.history_dir(),
            config.engine.history_limit,
        ));
        let connector: Arc<dyn SshConnector> =
            Arc::new(RusshConnector::new(config.engine.ssh.clone()));
        let engine = DeployEngine::new(catalog, config.engine.clone(), connector, history);
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: EnvConfig, engine: Arc<DeployEngine>) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            engine,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
