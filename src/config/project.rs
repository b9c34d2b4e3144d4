//! 项目配置目录
//!
//! 项目配置由外部（GUI/CLI）维护在 JSON 文件中，引擎只读。
//! 每次运行开始时重新读取，得到一份不可变快照。

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::project::Project;
use crate::error::{EngineError, EngineResult};

/// 配置文件格式：`{"projects": [...]}` 或直接数组
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { projects: Vec<Project> },
    List(Vec<Project>),
}

impl CatalogDocument {
    fn into_projects(self) -> Vec<Project> {
        match self {
            CatalogDocument::Wrapped { projects } | CatalogDocument::List(projects) => projects,
        }
    }
}

enum CatalogSource {
    File(PathBuf),
    Static(HashMap<String, Project>),
}

/// 项目配置目录
pub struct ProjectCatalog {
    source: CatalogSource,
}

impl ProjectCatalog {
    /// 基于配置文件
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: CatalogSource::File(path.into()),
        }
    }

    /// 基于内存中的项目列表
    pub fn from_projects(projects: Vec<Project>) -> EngineResult<Self> {
        Ok(Self {
            source: CatalogSource::Static(index(projects)?),
        })
    }

    /// 读取全部项目
    pub async fn load_all(&self) -> EngineResult<Vec<Project>> {
        let mut projects: Vec<Project> = match &self.source {
            CatalogSource::Static(map) => map.values().cloned().collect(),
            CatalogSource::File(path) => read_file(path).await?.into_values().collect(),
        };
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// 获取单个项目的快照
    pub async fn get(&self, name: &str) -> EngineResult<Project> {
        let project = match &self.source {
            CatalogSource::Static(map) => map.get(name).cloned(),
            CatalogSource::File(path) => read_file(path).await?.remove(name),
        };
        project.ok_or_else(|| EngineError::ProjectNotFound(name.to_string()))
    }
}

async fn read_file(path: &Path) -> EngineResult<HashMap<String, Project>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "Projects file not found, catalog is empty");
        return Ok(HashMap::new());
    }

    let content = tokio::fs::read_to_string(path).await?;
    let document: CatalogDocument = serde_json::from_str(&content).map_err(|e| {
        EngineError::Config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    let projects = document.into_projects();
    debug!(path = %path.display(), count = projects.len(), "Loaded project catalog");

    index(projects)
}

fn index(projects: Vec<Project>) -> EngineResult<HashMap<String, Project>> {
    let mut map = HashMap::with_capacity(projects.len());
    for project in projects {
        project.validate()?;
        let name = project.name.clone();
        if map.insert(name.clone(), project).is_some() {
            return Err(EngineError::Config(format!("duplicate project '{}'", name)));
        }
    }
    Ok(map)
}
