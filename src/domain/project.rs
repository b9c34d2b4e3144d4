//! 项目配置领域模型
//!
//! 项目、子部署、步骤与 SSH 配置。引擎在运行开始时读取一份不可变快照。

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// 环境变量
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    /// 名称是否是合法的 shell 变量名
    pub fn is_valid_name(&self) -> bool {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// 交互式输入项
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    /// 期望的提示文本（仅用于展示）
    #[serde(default)]
    pub prompt: String,
    /// 自动回答的值，空字符串表示直接回车
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub required: bool,
}

/// 部署步骤（本地与远程同构，仅执行目标不同）
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub command: String,
    /// 相对于项目/子部署根目录
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default, alias = "envVars")]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
}

impl Step {
    /// 便捷构造（主要用于测试和示例）
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_dir: String::new(),
            continue_on_error: false,
            interactive: false,
            env: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("step name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "step '{}' has an empty command",
                self.name
            )));
        }
        if let Some(var) = self.env.iter().find(|v| !v.is_valid_name()) {
            return Err(EngineError::Config(format!(
                "step '{}' has an invalid env var name '{}'",
                self.name, var.name
            )));
        }
        Ok(())
    }
}

fn default_ssh_port() -> u16 {
    22
}

/// SSH 连接配置
///
/// 密码与私钥二选一：都提供或都不提供均无效。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// 认证方式（借用自 `SshConfig`）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SshAuth<'a> {
    Password(&'a str),
    PrivateKey {
        path: &'a str,
        passphrase: Option<&'a str>,
    },
}

impl SshAuth<'_> {
    pub fn method_name(&self) -> &'static str {
        match self {
            SshAuth::Password(_) => "password",
            SshAuth::PrivateKey { .. } => "privateKey",
        }
    }
}

impl SshConfig {
    pub fn with_password(host: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            port: default_ssh_port(),
            password: Some(password.to_string()),
            private_key_path: None,
            passphrase: None,
        }
    }

    /// 解析认证方式，同时校验互斥约束
    pub fn auth(&self) -> EngineResult<SshAuth<'_>> {
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        let key = self.private_key_path.as_deref().filter(|p| !p.trim().is_empty());

        match (password, key) {
            (Some(password), None) => Ok(SshAuth::Password(password)),
            (None, Some(path)) => Ok(SshAuth::PrivateKey {
                path,
                passphrase: self.passphrase.as_deref().filter(|p| !p.is_empty()),
            }),
            (Some(_), Some(_)) => Err(EngineError::InvalidSshConfig(format!(
                "{}: both password and private key configured",
                self.host
            ))),
            (None, None) => Err(EngineError::InvalidSshConfig(format!(
                "{}: no password or private key configured",
                self.host
            ))),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::InvalidSshConfig("host must not be empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(EngineError::InvalidSshConfig(format!(
                "{}: username must not be empty",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(EngineError::InvalidSshConfig(format!("{}: port 0", self.host)));
        }
        self.auth().map(|_| ())
    }

    /// `user@host:port`，用于日志
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// monorepo 子部署
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubDeployment {
    pub name: String,
    /// 相对于父项目 localPath
    #[serde(default)]
    pub relative_path: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub local_steps: Vec<Step>,
    #[serde(default)]
    pub remote_steps: Vec<Step>,
    /// 覆盖父项目 SSH 配置；为空时继承
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub persistent_session: bool,
}

/// 部署项目
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub local_path: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub persistent_session: bool,
    #[serde(default)]
    pub local_steps: Vec<Step>,
    #[serde(default)]
    pub remote_steps: Vec<Step>,
    #[serde(default)]
    pub sub_deployments: Vec<SubDeployment>,
}

impl Project {
    pub fn is_monorepo(&self) -> bool {
        !self.sub_deployments.is_empty()
    }

    pub fn sub_deployment(&self, name: &str) -> Option<&SubDeployment> {
        self.sub_deployments.iter().find(|s| s.name == name)
    }

    /// 结构校验：名称非空、子部署名称唯一、步骤有效
    ///
    /// SSH 配置只在实际需要远程阶段时校验（见 `effective_ssh`）。
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("project name must not be empty".into()));
        }
        for step in self.local_steps.iter().chain(&self.remote_steps) {
            step.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for sub in &self.sub_deployments {
            if sub.name.trim().is_empty() {
                return Err(EngineError::Config(format!(
                    "project '{}' has a sub-deployment without a name",
                    self.name
                )));
            }
            if !seen.insert(sub.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "project '{}' has duplicate sub-deployment '{}'",
                    self.name, sub.name
                )));
            }
            for step in sub.local_steps.iter().chain(&sub.remote_steps) {
                step.validate()?;
            }
        }
        Ok(())
    }
}

/// 计算子部署的有效 SSH 配置
///
/// 子部署有覆盖时使用覆盖，否则继承父项目。不修改任何一方。
pub fn effective_ssh<'a>(
    project: &'a Project,
    sub: Option<&'a SubDeployment>,
) -> Option<&'a SshConfig> {
    sub.and_then(|s| s.ssh.as_ref()).or(project.ssh.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_config() -> SshConfig {
        SshConfig {
            host: "10.0.0.2".into(),
            username: "deploy".into(),
            port: 2222,
            password: None,
            private_key_path: Some("/home/deploy/.ssh/id_ed25519".into()),
            passphrase: Some("secret".into()),
        }
    }

    #[test]
    fn test_ssh_auth_exclusive() {
        let pw = SshConfig::with_password("host", "root", "pw");
        assert_eq!(pw.auth().unwrap(), SshAuth::Password("pw"));

        let key = key_config();
        assert_eq!(
            key.auth().unwrap(),
            SshAuth::PrivateKey {
                path: "/home/deploy/.ssh/id_ed25519",
                passphrase: Some("secret"),
            }
        );

        let mut both = key_config();
        both.password = Some("pw".into());
        assert!(matches!(both.auth(), Err(EngineError::InvalidSshConfig(_))));

        let mut neither = key_config();
        neither.private_key_path = None;
        assert!(matches!(neither.validate(), Err(EngineError::InvalidSshConfig(_))));
    }

    #[test]
    fn test_empty_password_counts_as_absent() {
        let mut cfg = key_config();
        cfg.password = Some(String::new());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_effective_ssh_inherits_and_overrides() {
        let parent = SshConfig::with_password("parent", "root", "pw");
        let mut project = Project {
            name: "mono".into(),
            local_path: "/srv/mono".into(),
            remote_path: "/opt/mono".into(),
            ssh: Some(parent.clone()),
            persistent_session: false,
            local_steps: vec![],
            remote_steps: vec![],
            sub_deployments: vec![
                SubDeployment {
                    name: "api".into(),
                    relative_path: "api".into(),
                    remote_path: "/opt/api".into(),
                    local_steps: vec![],
                    remote_steps: vec![],
                    ssh: None,
                    persistent_session: false,
                },
                SubDeployment {
                    name: "web".into(),
                    relative_path: "web".into(),
                    remote_path: "/opt/web".into(),
                    local_steps: vec![],
                    remote_steps: vec![],
                    ssh: Some(key_config()),
                    persistent_session: true,
                },
            ],
        };

        let api = project.sub_deployment("api").cloned();
        let web = project.sub_deployment("web").cloned();
        assert_eq!(effective_ssh(&project, api.as_ref()), Some(&parent));
        assert_eq!(effective_ssh(&project, web.as_ref()).map(|c| c.port), Some(2222));

        // 父配置不被子部署影响
        assert_eq!(project.ssh.as_ref(), Some(&parent));

        project.sub_deployments.push(project.sub_deployments[0].clone());
        assert!(matches!(project.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_step_deserialize_camel_case() {
        let json = r#"{
            "name": "install",
            "command": "npm ci",
            "workingDir": "frontend",
            "continueOnError": true,
            "interactive": true,
            "envVars": [{"name": "NODE_ENV", "value": "production"}],
            "inputs": [{"prompt": "Proceed?", "defaultValue": "y", "required": true}]
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.working_dir, "frontend");
        assert!(step.continue_on_error);
        assert_eq!(step.env[0].name, "NODE_ENV");
        assert_eq!(step.inputs[0].default_value, "y");
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_step_rejects_bad_env_name() {
        let mut step = Step::new("build", "make");
        step.env.push(EnvVar {
            name: "1BAD".into(),
            value: "x".into(),
        });
        assert!(step.validate().is_err());
    }
}
