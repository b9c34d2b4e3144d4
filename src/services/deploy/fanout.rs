//! monorepo 子部署分发
//!
//! 把运行请求解析为一组独立的序列计划，并发或串行驱动。
//! 单个子部署失败不影响已调度的其它子部署。

use std::path::Path;

use futures::future::join_all;

use crate::config::FanoutMode;
use crate::domain::project::{effective_ssh, Project, SshConfig, SubDeployment};
use crate::domain::run::RunTarget;
use crate::error::{EngineError, EngineResult};

use super::context::RunContext;
use super::sequencer::{run_sequence, SequenceOutcome, SequencePlan};

/// 运行目标选择
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// 普通项目整体运行
    Project,
    /// 指定子部署
    Subs(Vec<String>),
    /// 所有子部署
    All,
}

impl Selection {
    /// 由查询参数构造：`all` 优先，其次子部署列表
    pub fn from_request(subs: Vec<String>, all: bool) -> Self {
        let subs: Vec<String> = subs
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if all {
            Selection::All
        } else if subs.is_empty() {
            Selection::Project
        } else {
            Selection::Subs(subs)
        }
    }
}

/// 解析选择，生成运行目标和各序列计划
///
/// 所有配置错误都在任何步骤执行前返回。
pub fn build_plans(
    project: &Project,
    selection: &Selection,
) -> EngineResult<(RunTarget, Vec<SequencePlan>)> {
    project.validate()?;

    let subs: Vec<&SubDeployment> = match selection {
        Selection::Project if project.is_monorepo() => return Err(EngineError::NoTargetSelected),
        Selection::Project => {
            let plan = project_plan(project)?;
            return Ok((RunTarget::project(&project.name), vec![plan]));
        }
        Selection::All if !project.is_monorepo() => return Err(EngineError::NoTargetSelected),
        Selection::All => project.sub_deployments.iter().collect(),
        Selection::Subs(names) if names.is_empty() => return Err(EngineError::NoTargetSelected),
        Selection::Subs(names) => {
            if let Some(missing) = names.iter().find(|n| project.sub_deployment(n).is_none()) {
                return Err(EngineError::SubDeploymentNotFound {
                    project: project.name.clone(),
                    sub: missing.clone(),
                });
            }
            // 按配置顺序执行
            project
                .sub_deployments
                .iter()
                .filter(|s| names.contains(&s.name))
                .collect()
        }
    };

    let plans = subs
        .into_iter()
        .map(|sub| sub_plan(project, sub))
        .collect::<EngineResult<Vec<_>>>()?;
    let target = RunTarget::with_subs(
        &project.name,
        plans.iter().filter_map(|p| p.sub_deployment.clone()),
    );
    Ok((target, plans))
}

fn project_plan(project: &Project) -> EngineResult<SequencePlan> {
    let ssh = required_ssh(project, None, !project.remote_steps.is_empty())?;
    Ok(SequencePlan {
        project: project.name.clone(),
        sub_deployment: None,
        local_root: Path::new(&project.local_path).to_path_buf(),
        remote_root: project.remote_path.clone(),
        ssh,
        persistent_session: project.persistent_session,
        local_steps: project.local_steps.clone(),
        remote_steps: project.remote_steps.clone(),
    })
}

fn sub_plan(project: &Project, sub: &SubDeployment) -> EngineResult<SequencePlan> {
    let ssh = required_ssh(project, Some(sub), !sub.remote_steps.is_empty())?;
    let local_root = if sub.relative_path.trim().is_empty() {
        Path::new(&project.local_path).to_path_buf()
    } else {
        Path::new(&project.local_path).join(sub.relative_path.trim())
    };
    // 子部署未配置远程路径时沿用父项目
    let remote_root = if sub.remote_path.trim().is_empty() {
        project.remote_path.clone()
    } else {
        sub.remote_path.clone()
    };
    Ok(SequencePlan {
        project: project.name.clone(),
        sub_deployment: Some(sub.name.clone()),
        local_root,
        remote_root,
        ssh,
        persistent_session: sub.persistent_session,
        local_steps: sub.local_steps.clone(),
        remote_steps: sub.remote_steps.clone(),
    })
}

/// 有远程步骤时必须有有效 SSH 配置
fn required_ssh(
    project: &Project,
    sub: Option<&SubDeployment>,
    needed: bool,
) -> EngineResult<Option<SshConfig>> {
    let ssh = effective_ssh(project, sub).cloned();
    if !needed {
        return Ok(ssh);
    }
    match ssh {
        Some(config) => {
            config.validate()?;
            Ok(Some(config))
        }
        None => Err(EngineError::InvalidSshConfig(format!(
            "{} has remote steps but no SSH configuration",
            match sub {
                Some(sub) => format!("sub-deployment '{}'", sub.name),
                None => format!("project '{}'", project.name),
            }
        ))),
    }
}

/// 驱动所有序列，结果与计划顺序一致
pub async fn run_fanout(
    ctx: &RunContext,
    plans: &[SequencePlan],
    mode: FanoutMode,
) -> Vec<SequenceOutcome> {
    if plans.len() <= 1 || mode == FanoutMode::Serial {
        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in plans {
            outcomes.push(run_sequence(ctx, plan).await);
        }
        return outcomes;
    }
    join_all(plans.iter().map(|plan| run_sequence(ctx, plan))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::project::Step;

    fn mono() -> Project {
        serde_json::from_value(serde_json::json!({
            "name": "mono",
            "localPath": "/srv/mono",
            "remotePath": "/opt/mono",
            "ssh": {"host": "10.0.0.5", "username": "deploy", "password": "pw"},
            "subDeployments": [
                {
                    "name": "web",
                    "relativePath": "web",
                    "remotePath": "/opt/web",
                    "remoteSteps": [{"name": "restart", "command": "true"}]
                },
                {
                    "name": "api",
                    "relativePath": "api",
                    "ssh": {"host": "10.0.0.6", "username": "api", "privateKeyPath": "/k"},
                    "remoteSteps": [{"name": "restart", "command": "true"}]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_selection_from_request() {
        assert_eq!(Selection::from_request(vec![], false), Selection::Project);
        assert_eq!(Selection::from_request(vec!["a".into()], true), Selection::All);
        assert_eq!(
            Selection::from_request(vec![" api ".into(), "".into()], false),
            Selection::Subs(vec!["api".into()])
        );
    }

    #[test]
    fn test_monorepo_requires_selection() {
        let project = mono();
        assert!(matches!(
            build_plans(&project, &Selection::Project),
            Err(EngineError::NoTargetSelected)
        ));
        assert!(matches!(
            build_plans(&project, &Selection::Subs(vec![])),
            Err(EngineError::NoTargetSelected)
        ));
    }

    #[test]
    fn test_unknown_sub_rejected() {
        let err = build_plans(&mono(), &Selection::Subs(vec!["cron".into()]))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::SubDeploymentNotFound { sub, .. } if sub == "cron"));
    }

    #[test]
    fn test_plans_follow_config_order_and_resolve_ssh() {
        let project = mono();
        let (target, plans) =
            build_plans(&project, &Selection::Subs(vec!["api".into(), "web".into()])).unwrap();
        assert_eq!(target.key(), "mono[api,web]");

        let names: Vec<_> = plans.iter().map(|p| p.sub_deployment.clone().unwrap()).collect();
        assert_eq!(names, vec!["web", "api"]);

        assert_eq!(plans[0].ssh.as_ref().unwrap().host, "10.0.0.5");
        assert_eq!(plans[0].local_root, Path::new("/srv/mono/web"));
        assert_eq!(plans[0].remote_root, "/opt/web");
        assert_eq!(plans[1].ssh.as_ref().unwrap().host, "10.0.0.6");
        // 未配置远程路径时沿用父项目
        assert_eq!(plans[1].remote_root, "/opt/mono");

        // 父项目配置不变
        assert_eq!(project.ssh.as_ref().unwrap().host, "10.0.0.5");
    }

    #[test]
    fn test_remote_steps_need_valid_ssh() {
        let mut project = mono();
        project.sub_deployments.clear();
        project.remote_steps.push(Step::new("restart", "true"));
        project.ssh = None;
        assert!(matches!(
            build_plans(&project, &Selection::Project),
            Err(EngineError::InvalidSshConfig(_))
        ));

        let mut both = SshConfig::with_password("h", "u", "pw");
        both.private_key_path = Some("/k".into());
        project.ssh = Some(both);
        assert!(matches!(
            build_plans(&project, &Selection::Project),
            Err(EngineError::InvalidSshConfig(_))
        ));

        // 只有本地步骤时不需要 SSH
        project.remote_steps.clear();
        project.local_steps.push(Step::new("build", "true"));
        project.ssh = None;
        let (target, plans) = build_plans(&project, &Selection::Project).unwrap();
        assert_eq!(target.key(), "mono");
        assert_eq!(plans.len(), 1);
    }
}
