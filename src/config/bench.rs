//! Bench 配置（bench_config.toml）
//!
//! 创建 bench 时生成，任何改变部署状态的操作之后显式保存，不会自动保存

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::config::env::constants::{PRIMARY_SERVICE, PROXY_SERVICE};
use crate::domain::{EnvironmentType, SslCertificate};

/// 配置读写错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Bench config not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid bench config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize bench config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// 应用及其分支
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSpec {
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// 持久化的 bench 配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BenchConfig {
    pub name: String,
    #[serde(default = "default_id")]
    pub userid: u32,
    #[serde(default = "default_id")]
    pub usergroup: u32,
    #[serde(default)]
    pub apps_list: Vec<AppSpec>,
    #[serde(default = "default_frappe_branch")]
    pub frappe_branch: String,
    #[serde(default)]
    pub developer_mode: bool,
    #[serde(default)]
    pub admin_tools: bool,
    pub admin_pass: String,
    #[serde(default)]
    pub environment_type: EnvironmentType,
    #[serde(default)]
    pub ssl: SslCertificate,
    /// 配置文件路径，不写入文件
    #[serde(skip)]
    pub root_path: PathBuf,
    /// 未识别的字段原样保留
    #[serde(flatten)]
    pub extra: toml::Table,
}

fn default_id() -> u32 {
    1000
}

fn default_frappe_branch() -> String {
    "version-15".to_string()
}

/// 描述文件生成输入
///
/// 由 `BenchConfig` 纯投影得到，每次生成都完整覆盖
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposeInputs {
    /// 服务名 -> 环境变量
    pub environment: BTreeMap<String, BTreeMap<String, String>>,
    /// 服务名 -> 标签
    pub labels: BTreeMap<String, BTreeMap<String, String>>,
    /// 服务名 -> (uid, gid)
    pub users: BTreeMap<String, (u32, u32)>,
}

impl BenchConfig {
    /// 新建配置（尚未保存）
    pub fn new(name: impl Into<String>, admin_pass: impl Into<String>, root_path: PathBuf) -> Self {
        let name = name.into();
        Self {
            ssl: SslCertificate::none(name.clone()),
            name,
            userid: default_id(),
            usergroup: default_id(),
            apps_list: Vec::new(),
            frappe_branch: default_frappe_branch(),
            developer_mode: false,
            admin_tools: false,
            admin_pass: admin_pass.into(),
            environment_type: EnvironmentType::Dev,
            root_path,
            extra: toml::Table::new(),
        }
    }

    /// 从 TOML 文件加载
    pub async fn import_from_toml(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: BenchConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if config.ssl.domain.is_empty() {
            config.ssl.domain = config.name.clone();
        }
        config.root_path = path.to_path_buf();

        Ok(config)
    }

    /// 保存到 TOML 文件（原子写入）
    pub async fn export_to_toml(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = toml::to_string_pretty(self)?;
        let temp_path = path.with_extension("toml.tmp");

        fs::write(&temp_path, &content).await.map_err(io_err)?;
        fs::rename(&temp_path, path).await.map_err(io_err)?;

        info!(path = %path.display(), bench = %self.name, "Saved bench config");
        Ok(())
    }

    /// 投影为描述文件生成输入
    pub fn export_to_compose_inputs(&self) -> ComposeInputs {
        let mut inputs = ComposeInputs::default();

        let apps_list = self
            .apps_list
            .iter()
            .map(|a| match &a.branch {
                Some(branch) => format!("{}:{}", a.app, branch),
                None => a.app.clone(),
            })
            .collect::<Vec<_>>()
            .join(",");

        let primary_env = BTreeMap::from([
            ("USERID".to_string(), self.userid.to_string()),
            ("USERGROUP".to_string(), self.usergroup.to_string()),
            ("APPS_LIST".to_string(), apps_list),
            ("FRAPPE_BRANCH".to_string(), self.frappe_branch.clone()),
            (
                "DEVELOPER_MODE".to_string(),
                (self.developer_mode as u8).to_string(),
            ),
            ("ADMIN_PASS".to_string(), self.admin_pass.clone()),
            ("DB_NAME".to_string(), self.name.replace('.', "_")),
            ("SITENAME".to_string(), self.name.clone()),
            (
                "ENVIRONMENT".to_string(),
                self.environment_type.as_str().to_string(),
            ),
        ]);

        let proxy_env = BTreeMap::from([
            ("SITENAME".to_string(), self.name.clone()),
            (
                "ENABLE_SSL".to_string(),
                (!self.ssl.is_none()).to_string(),
            ),
            (
                "ENVIRONMENT".to_string(),
                self.environment_type.as_str().to_string(),
            ),
        ]);

        inputs.environment.insert(PRIMARY_SERVICE.to_string(), primary_env);
        inputs.environment.insert(PROXY_SERVICE.to_string(), proxy_env);

        let devcontainer = serde_json::json!([{ "remoteUser": "frappe" }]).to_string();
        inputs.labels.insert(
            PRIMARY_SERVICE.to_string(),
            BTreeMap::from([("devcontainer.metadata".to_string(), devcontainer)]),
        );

        for service in [PRIMARY_SERVICE, "socketio"] {
            inputs
                .users
                .insert(service.to_string(), (self.userid, self.usergroup));
        }

        inputs
    }
}
