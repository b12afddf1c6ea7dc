//! 管理工具服务组（Mailhog + Adminer）
//!
//! 启用时在 bench 的 nginx 配置中加入 `/mailhog` 与 `/adminer` 两个 location，
//! 新写入 location 后需要重启主服务才能生效

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::config::env::constants::VERSION;
use crate::domain::container_name_prefix;
use crate::error::BenchResult;
use crate::infra::compose_file::{ComposeFile, ComposeTemplate};

use super::sub_deployment::{GroupKind, SubDeployment};

/// nginx location 片段（相对 bench 根目录）
const LOCATION_SNIPPET: &str = "configs/nginx/conf/custom/admin-tools.conf";

/// 管理工具
pub struct AdminTools {
    bench: String,
    snippet_path: PathBuf,
    group: SubDeployment,
}

impl AdminTools {
    pub fn new(bench: impl Into<String>, bench_path: &Path, group: SubDeployment) -> Self {
        debug_assert_eq!(group.kind(), GroupKind::AdminTools);
        Self {
            bench: bench.into(),
            snippet_path: bench_path.join(LOCATION_SNIPPET),
            group,
        }
    }

    pub fn group(&self) -> &SubDeployment {
        &self.group
    }

    pub fn snippet_path(&self) -> &Path {
        &self.snippet_path
    }

    fn location_snippet(&self) -> String {
        let prefix = container_name_prefix(&self.bench);
        format!(
            "location /mailhog/ {{\n    proxy_pass http://{prefix}-mailhog:8025/;\n    proxy_http_version 1.1;\n    proxy_set_header Upgrade $http_upgrade;\n    proxy_set_header Connection \"upgrade\";\n}}\n\n\
             location /adminer/ {{\n    proxy_pass http://{prefix}-adminer:8080/;\n}}\n",
            prefix = prefix
        )
    }

    /// 生成描述文件，Adminer 默认连接共享数据库
    pub fn generate_compose(&self, db_host: &str) -> BenchResult<()> {
        let mut compose =
            ComposeFile::from_template(self.group.compose_path(), ComposeTemplate::AdminTools)?;

        let envs = BTreeMap::from([(
            "ADMINER_DEFAULT_SERVER".to_string(),
            db_host.to_string(),
        )]);
        compose.set_envs("adminer", &envs)?;

        let prefix = container_name_prefix(&self.bench);
        compose.set_container_names(&prefix);
        compose.set_top_networks_name("site-network", &prefix);
        compose.set_version(VERSION);
        compose.write()?;

        info!(bench = %self.bench, "Generated admin tools compose");
        Ok(())
    }

    /// 启动管理工具并写入 location，返回是否需要重启主服务
    pub async fn enable(&self, force_recreate: bool) -> BenchResult<bool> {
        if !self.group.start(force_recreate).await? {
            return Ok(false);
        }

        let snippet = self.location_snippet();
        let current = fs::read_to_string(&self.snippet_path).await.ok();
        if current.as_deref() == Some(snippet.as_str()) {
            return Ok(false);
        }

        if let Some(parent) = self.snippet_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.snippet_path, snippet).await?;
        info!(bench = %self.bench, "Enabled admin tools");
        Ok(true)
    }

    /// 停止管理工具并移除 location，返回是否需要重启主服务
    pub async fn disable(&self) -> BenchResult<bool> {
        self.group.stop(&[]).await?;

        if !self.snippet_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.snippet_path).await?;
        info!(bench = %self.bench, "Disabled admin tools");
        Ok(true)
    }
}
