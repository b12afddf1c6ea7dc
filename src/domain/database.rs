//! 数据库相关领域模型

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 共享数据库服务器信息（所有 bench 共用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseServerInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// root 密码 secret 文件路径（挂载进 bench 的主服务）
    pub secret_path: PathBuf,
}

/// bench 自己的数据库连接信息
///
/// 来自站点的 `site_config.json`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchDbInfo {
    pub name: String,
    pub user: String,
    pub password: String,
}

/// site_config.json 中与数据库相关的字段
#[derive(Debug, Deserialize)]
pub(crate) struct SiteDbConfig {
    pub db_name: String,
    #[serde(default)]
    pub db_password: String,
}

impl From<SiteDbConfig> for BenchDbInfo {
    fn from(config: SiteDbConfig) -> Self {
        Self {
            user: config.db_name.clone(),
            name: config.db_name,
            password: config.db_password,
        }
    }
}
