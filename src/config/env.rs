//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 数据目录（历史记录等）
    pub data_dir: PathBuf,
    /// 项目配置文件
    pub projects_file: PathBuf,
    /// 部署引擎参数
    pub engine: EngineSettings,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("AUTODEPLOY_API_KEY", "API_KEY").unwrap_or_else(|| {
            warn!("AUTODEPLOY_API_KEY not set, using insecure default");
            "change-me-in-production".to_string()
        });

        let port = parse_env("PORT").unwrap_or(constants::DEFAULT_PORT);

        let data_dir = env::var("AUTODEPLOY_DATA_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let projects_file = env::var("AUTODEPLOY_PROJECTS_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(constants::PROJECTS_FILE_NAME));

        Self {
            api_key,
            port,
            data_dir,
            projects_file,
            engine: EngineSettings::from_env(),
        }
    }

    /// 历史记录目录
    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }
}

/// 部署引擎参数
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub prompt: PromptSettings,
    /// 等待用户输入的超时，`None` 表示一直等待（直到运行停止）
    pub prompt_timeout: Option<Duration>,
    /// 停止时等待进程退出的宽限期
    pub stop_grace: Duration,
    /// 整个运行的超时
    pub run_timeout: Duration,
    pub ssh: SshClientSettings,
    pub fanout: FanoutMode,
    /// 每个历史集合保留的记录数
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            prompt: PromptSettings::default(),
            prompt_timeout: None,
            stop_grace: Duration::from_millis(3000),
            run_timeout: Duration::from_secs(constants::RUN_TIMEOUT_SECS),
            ssh: SshClientSettings::default(),
            fanout: FanoutMode::Concurrent,
            history_limit: constants::MAX_HISTORY_PER_COLLECTION,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let prompt_timeout = parse_env::<u64>("PROMPT_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let stop_grace = parse_env("STOP_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.stop_grace);

        let run_timeout = parse_env("RUN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.run_timeout);

        let fanout = env::var("FANOUT_MODE")
            .map(|v| FanoutMode::from_str(&v))
            .unwrap_or(defaults.fanout);

        let history_limit = parse_env("HISTORY_LIMIT").unwrap_or(defaults.history_limit);

        Self {
            prompt: PromptSettings::from_env(),
            prompt_timeout,
            stop_grace,
            run_timeout,
            ssh: SshClientSettings::from_env(),
            fanout,
            history_limit,
        }
    }
}

/// 提示检测参数
#[derive(Clone, Debug)]
pub struct PromptSettings {
    /// 以提示后缀结尾的半行，静默多久后视为提示
    pub idle: Duration,
    /// 任意半行静默多久后视为提示
    pub fallback_idle: Duration,
    /// 提示后缀（对去除尾部空白后的文本匹配）
    pub patterns: Vec<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(500),
            fallback_idle: Duration::from_millis(3000),
            patterns: constants::DEFAULT_PROMPT_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PromptSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let idle = parse_env("PROMPT_IDLE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle);

        let fallback_idle = parse_env("PROMPT_FALLBACK_IDLE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.fallback_idle);

        let patterns = env::var("PROMPT_PATTERNS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.patterns);

        Self {
            idle,
            fallback_idle,
            patterns,
        }
    }
}

/// SSH 客户端参数
#[derive(Clone, Debug)]
pub struct SshClientSettings {
    pub connect_timeout: Duration,
    /// 持久会话的 keep-alive 间隔
    pub keepalive_interval: Duration,
    /// 连续无响应的 keep-alive 次数上限
    pub keepalive_max: usize,
}

impl Default for SshClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            keepalive_max: 3,
        }
    }
}

impl SshClientSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: parse_env("SSH_CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            keepalive_interval: parse_env("SSH_KEEPALIVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keepalive_interval),
            keepalive_max: parse_env("SSH_KEEPALIVE_MAX").unwrap_or(defaults.keepalive_max),
        }
    }
}

/// monorepo 子部署的调度方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanoutMode {
    /// 所有子部署同时运行
    Concurrent,
    /// 按配置顺序逐个运行
    Serial,
}

impl FanoutMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "serial" | "sequential" => FanoutMode::Serial,
            _ => FanoutMode::Concurrent,
        }
    }
}

/// 默认数据目录：可执行文件所在目录下的 data，其次当前目录
fn default_data_dir() -> PathBuf {
    if let Ok(exe_path) = env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            return parent.join("data");
        }
    }
    PathBuf::from("data")
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// 常量
pub mod constants {
    pub const DEFAULT_PORT: u16 = 9877;

    pub const PROJECTS_FILE_NAME: &str = "projects.json";

    /// 运行超时（秒）
    pub const RUN_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 每个历史集合最大记录数
    pub const MAX_HISTORY_PER_COLLECTION: usize = 100;

    /// 每个运行的事件通道容量
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

    /// SSE keep-alive 间隔（秒）
    pub const SSE_KEEPALIVE_SECS: u64 = 15;

    pub const DEFAULT_PROMPT_PATTERNS: &[&str] = &[":", "?", ">", "]", ")", "$", "#"];

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("AD_TEST_PRIMARY", "primary_value");
        env::set_var("AD_TEST_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("AD_TEST_PRIMARY", "AD_TEST_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("AD_TEST_PRIMARY");
        assert_eq!(
            load_with_fallback("AD_TEST_PRIMARY", "AD_TEST_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("AD_TEST_FALLBACK");
        assert_eq!(load_with_fallback("AD_TEST_PRIMARY", "AD_TEST_FALLBACK"), None);
    }

    #[test]
    fn test_fanout_mode_parse() {
        assert_eq!(FanoutMode::from_str("serial"), FanoutMode::Serial);
        assert_eq!(FanoutMode::from_str("Concurrent"), FanoutMode::Concurrent);
        assert_eq!(FanoutMode::from_str("bogus"), FanoutMode::Concurrent);
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineSettings::default();
        assert!(settings.prompt_timeout.is_none());
        assert_eq!(settings.history_limit, constants::MAX_HISTORY_PER_COLLECTION);
        assert!(settings.prompt.patterns.iter().any(|p| p == "?"));
    }
}
