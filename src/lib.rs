//! AutoDeploy - 部署编排代理
//!
//! 按项目配置依次执行本地步骤和远程 SSH 步骤，
//! 支持 monorepo 子部署并发、交互式提示转发和部署历史。

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::env::constants::{PROJECTS_FILE_NAME, VERSION};
use crate::config::EnvConfig;
use crate::state::AppState;

/// 命令行覆盖项（优先于环境变量）
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub port_override: Option<u16>,
    pub projects_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// 应用到环境配置
    pub fn apply(&self, config: &mut EnvConfig) {
        if let Some(port) = self.port_override {
            config.port = port;
        }
        if let Some(data_dir) = &self.data_dir {
            // 项目文件仍在旧数据目录默认位置时一起迁移
            if config.projects_file == config.data_dir.join(PROJECTS_FILE_NAME) {
                config.projects_file = data_dir.join(PROJECTS_FILE_NAME);
            }
            config.data_dir = data_dir.clone();
        }
        if let Some(projects_file) = &self.projects_file {
            config.projects_file = projects_file.clone();
        }
    }
}

/// 初始化日志
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autodeploy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// 启动服务，直到收到关闭信号
pub async fn run_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    init_tracing();

    let mut config = EnvConfig::from_env();
    runtime.apply(&mut config);

    tracing::info!(
        version = VERSION,
        port = config.port,
        data_dir = %config.data_dir.display(),
        projects_file = %config.projects_file.display(),
        fanout = ?config.engine.fanout,
        "Starting autodeploy"
    );

    tokio::fs::create_dir_all(config.history_dir())
        .await
        .with_context(|| format!("Failed to create {}", config.history_dir().display()))?;

    let stop_grace = config.engine.stop_grace;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(config));
    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state, stop_grace))
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// 等待 Ctrl-C / SIGTERM，然后停止所有运行并等待其写完历史
async fn shutdown_signal(state: Arc<AppState>, stop_grace: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let stopped = state.engine.stop_all();
    tracing::info!(runs = stopped, "Shutdown signal received, stopping active runs");

    if !state
        .engine
        .wait_idle(stop_grace + Duration::from_secs(2))
        .await
    {
        tracing::warn!("Active runs did not finish before shutdown");
    }
}
