//! SSH 客户端
//!
//! 通过 russh 建立认证连接，每个命令在独立的 exec 通道中执行，
//! 输出与输入经由 [`CommandHandle`] 与本地进程统一。

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use tracing::{debug, info, warn};

use crate::config::SshClientSettings;
use crate::domain::event::OutputType;
use crate::domain::project::{EnvVar, SshAuth, SshConfig};
use crate::error::{EngineError, EngineResult};
use crate::infra::command::{take_utf8, CommandError, CommandHandle, CommandIo, OutputChunk};

/// 建立 SSH 连接
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, config: &SshConfig) -> EngineResult<Arc<dyn SshConnection>>;
}

/// 已认证的 SSH 连接
#[async_trait]
pub trait SshConnection: Send + Sync {
    /// 在新通道中执行命令；非交互命令立即关闭输入
    async fn exec(&self, command: &str, interactive: bool) -> EngineResult<CommandHandle>;

    /// 断开连接
    async fn close(&self);
}

/// 基于 russh 的连接器
pub struct RusshConnector {
    settings: SshClientSettings,
}

impl RusshConnector {
    pub fn new(settings: SshClientSettings) -> Self {
        Self { settings }
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            ..Default::default()
        })
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> EngineResult<Arc<dyn SshConnection>> {
        let auth = config.auth()?;
        let target = config.display_target();
        let connection_failed = |message: String| EngineError::ConnectionFailed {
            host: config.host.clone(),
            port: config.port,
            message,
        };

        debug!(target = %target, method = auth.method_name(), "Connecting via SSH");
        let handler = HostKeyLogger {
            host: config.host.clone(),
        };
        let connect = client::connect(
            self.client_config(),
            (config.host.as_str(), config.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(self.settings.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(connection_failed(e.to_string())),
            Err(_) => {
                return Err(connection_failed(format!(
                    "timed out after {}s",
                    self.settings.connect_timeout.as_secs()
                )))
            }
        };

        let auth_failed = || EngineError::AuthenticationFailed {
            user: config.username.clone(),
            host: config.host.clone(),
        };
        let authenticated = match auth {
            SshAuth::Password(password) => handle
                .authenticate_password(config.username.as_str(), password)
                .await
                .map_err(|e| connection_failed(e.to_string()))?,
            SshAuth::PrivateKey { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase).map_err(|e| {
                    warn!(path, error = %e, "Failed to load private key");
                    auth_failed()
                })?;
                handle
                    .authenticate_publickey(config.username.as_str(), Arc::new(key))
                    .await
                    .map_err(|e| connection_failed(e.to_string()))?
            }
        };
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(auth_failed());
        }

        info!(target = %target, "SSH connection established");
        Ok(Arc::new(RusshConnection { handle, target }))
    }
}

/// 记录并接受服务器主机密钥
struct HostKeyLogger {
    host: String,
}

#[async_trait]
impl client::Handler for HostKeyLogger {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key without verification"
        );
        Ok(true)
    }
}

/// 基于 russh 的连接
pub struct RusshConnection {
    handle: Handle<HostKeyLogger>,
    target: String,
}

#[async_trait]
impl SshConnection for RusshConnection {
    async fn exec(&self, command: &str, interactive: bool) -> EngineResult<CommandHandle> {
        let channel_error =
            |e: russh::Error| EngineError::from(CommandError::Channel(e.to_string()));

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel.exec(true, command).await.map_err(channel_error)?;
        if !interactive {
            channel.eof().await.map_err(channel_error)?;
        }
        debug!(target = %self.target, "Remote command started");

        let (handle, io) = CommandHandle::pair();
        let CommandIo {
            output,
            mut input,
            terminate,
            exit,
        } = io;

        tokio::spawn(async move {
            let mut stdout_pending = Vec::new();
            let mut stderr_pending = Vec::new();
            let mut exit_status: Option<u32> = None;
            let mut exit_signal: Option<String> = None;
            let mut input_open = interactive;

            let result = loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            stdout_pending.extend_from_slice(&data);
                            forward(&output, OutputType::Stdout, &mut stdout_pending).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // ext == 1 为 stderr
                            let (stream, pending) = if ext == 1 {
                                (OutputType::Stderr, &mut stderr_pending)
                            } else {
                                (OutputType::Stdout, &mut stdout_pending)
                            };
                            pending.extend_from_slice(&data);
                            forward(&output, stream, pending).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            exit_signal = Some(format!("{:?}", signal_name));
                        }
                        Some(ChannelMsg::Close) | None => {
                            break match (exit_status, exit_signal.take()) {
                                (Some(0), _) => Ok(()),
                                (Some(code), _) => Err(CommandError::NonZeroExit(code as i32)),
                                (None, Some(signal)) => Err(CommandError::Channel(format!(
                                    "remote command killed by signal {}",
                                    signal
                                ))),
                                (None, None) => Err(CommandError::Channel(
                                    "channel closed without exit status".to_string(),
                                )),
                            };
                        }
                        Some(_) => {}
                    },
                    line = input.recv(), if input_open => match line {
                        Some(line) => {
                            if let Err(e) = channel.data(line.as_bytes()).await {
                                warn!(error = %e, "Failed to write to remote command");
                                input_open = false;
                            }
                        }
                        None => {
                            input_open = false;
                            let _ = channel.eof().await;
                        }
                    },
                    _ = terminate.cancelled() => {
                        let _ = channel.close().await;
                        break Err(CommandError::Terminated);
                    }
                }
            };

            for (stream, pending) in [
                (OutputType::Stdout, stdout_pending),
                (OutputType::Stderr, stderr_pending),
            ] {
                if !pending.is_empty() {
                    let data = String::from_utf8_lossy(&pending).into_owned();
                    let _ = output.send(OutputChunk { stream, data }).await;
                }
            }
            drop(output);
            let _ = exit.send(result);
        });

        Ok(handle)
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(target = %self.target, error = %e, "SSH disconnect failed");
        }
        info!(target = %self.target, "SSH connection closed");
    }
}

async fn forward(
    output: &tokio::sync::mpsc::Sender<OutputChunk>,
    stream: OutputType,
    pending: &mut Vec<u8>,
) {
    let data = take_utf8(pending);
    if !data.is_empty() {
        let _ = output.send(OutputChunk { stream, data }).await;
    }
}

/// 单引号转义，用于拼接远程 shell 命令
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// 远程工作目录：绝对路径直接使用，否则相对于远程根目录
///
/// 两者都为空时返回 `None`（使用登录目录）。
pub fn resolve_remote_dir(root: &str, relative: &str) -> Option<String> {
    let root = root.trim();
    let relative = relative.trim();
    match (root.is_empty(), relative.is_empty()) {
        (true, true) => None,
        (_, false) if relative.starts_with('/') => Some(relative.to_string()),
        (true, false) => Some(relative.to_string()),
        (false, true) => Some(root.to_string()),
        (false, false) => Some(format!("{}/{}", root.trim_end_matches('/'), relative)),
    }
}

/// 组装远程命令：切换目录、导出环境变量后执行
pub fn remote_command(dir: Option<&str>, env: &[EnvVar], command: &str) -> String {
    let mut script = String::new();
    if let Some(dir) = dir {
        script.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }
    for var in env {
        script.push_str(&format!("export {}={}\n", var.name, shell_quote(&var.value)));
    }
    script.push_str(command);
    script
}

/// 检查远程目录是否存在的命令
pub fn remote_dir_check(dir: &str) -> String {
    format!("test -d {}", shell_quote(dir))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_resolve_remote_dir() {
        assert_eq!(resolve_remote_dir("", ""), None);
        assert_eq!(resolve_remote_dir("/opt/app/", ""), Some("/opt/app/".to_string()));
        assert_eq!(resolve_remote_dir("/opt/app/", "web"), Some("/opt/app/web".to_string()));
        assert_eq!(resolve_remote_dir("/opt/app", "/var/www"), Some("/var/www".to_string()));
        assert_eq!(resolve_remote_dir("", "releases"), Some("releases".to_string()));
    }

    #[test]
    fn test_remote_command_layout() {
        let env = vec![EnvVar {
            name: "MODE".into(),
            value: "a b".into(),
        }];
        let script = remote_command(Some("/opt/app"), &env, "make deploy");
        assert_eq!(script, "cd '/opt/app' || exit 1\nexport MODE='a b'\nmake deploy");
        assert_eq!(remote_command(None, &[], "uptime"), "uptime");
    }

    #[tokio::test]
    async fn test_loopback_connector_runs_remote_script() {
        let connector = testing::LoopbackConnector::default();
        let config = SshConfig::with_password("127.0.0.1", "deploy", "pw");
        let conn = connector.connect(&config).await.unwrap();

        let env = vec![EnvVar {
            name: "TARGET".into(),
            value: "prod".into(),
        }];
        let mut handle = conn
            .exec(&remote_command(Some("/"), &env, "echo $TARGET; pwd"), false)
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(chunk) = handle.next_output().await {
            out.push_str(&chunk.data);
        }
        assert!(handle.wait().await.is_ok());
        assert_eq!(out, "prod\n/\n");

        conn.close().await;
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test]
    async fn test_loopback_rejects_host() {
        let connector = testing::LoopbackConnector::rejecting("10.0.0.9");
        let config = SshConfig::with_password("10.0.0.9", "deploy", "pw");
        assert!(matches!(
            connector.connect(&config).await,
            Err(EngineError::AuthenticationFailed { .. })
        ));
    }
}
