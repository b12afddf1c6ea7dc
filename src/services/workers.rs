//! 后台 worker 服务组
//!
//! worker 列表来自拆分后的 `*.workers.fm.supervisor.conf` 文件，
//! 每个 worker 对应 workers 描述文件中的一个服务

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::config::env::constants::{PRIMARY_SERVICE, VERSION, WORKERS_CONF_SUFFIX};
use crate::domain::container_name_prefix;
use crate::error::BenchResult;
use crate::infra::compose_file::{ComposeFile, ComposeTemplate};

use super::sub_deployment::{GroupKind, SubDeployment};

/// 模板中的占位服务名
const TEMPLATE_SERVICE: &str = "worker-name";
/// 容器内 bench 配置目录
const CONTAINER_CONFIG_DIR: &str = "/workspace/frappe-bench/config";
/// 拆分文件名前缀
const SPLIT_FILE_PREFIX: &str = "frappe-bench-frappe-";

/// bench 的 workers
pub struct BenchWorkers {
    bench: String,
    config_dir: PathBuf,
    group: SubDeployment,
}

impl BenchWorkers {
    pub fn new(bench: impl Into<String>, bench_path: &Path, group: SubDeployment) -> Self {
        debug_assert_eq!(group.kind(), GroupKind::Workers);
        Self {
            bench: bench.into(),
            config_dir: bench_path
                .join("workspace")
                .join("frappe-bench")
                .join("config"),
            group,
        }
    }

    pub fn group(&self) -> &SubDeployment {
        &self.group
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// `bench setup supervisor` 生成的原始配置
    pub fn supervisor_config_path(&self) -> PathBuf {
        self.config_dir.join("supervisor.conf")
    }

    /// worker 名 -> 拆分后的配置文件名
    pub async fn expected_workers(&self) -> BenchResult<BTreeMap<String, String>> {
        let mut workers = BTreeMap::new();
        if !self.config_dir.is_dir() {
            return Ok(workers);
        }

        let mut entries = fs::read_dir(&self.config_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = file_name.strip_suffix(WORKERS_CONF_SUFFIX) else {
                continue;
            };
            let worker = stem.strip_prefix(SPLIT_FILE_PREFIX).unwrap_or(stem);
            workers.insert(worker.to_string(), file_name);
        }
        Ok(workers)
    }

    /// 由期望的 worker 列表生成描述文件（不落盘）
    ///
    /// 镜像与运行用户跟随主服务组
    pub async fn render_compose(&self, primary: &ComposeFile) -> BenchResult<ComposeFile> {
        let mut compose = ComposeFile::from_template(self.group.compose_path(), ComposeTemplate::Workers)?;
        let template = compose
            .remove_service(TEMPLATE_SERVICE)
            .unwrap_or(Value::Mapping(Default::default()));

        let primary_env = primary.get_envs(PRIMARY_SERVICE);
        let image = primary.image(PRIMARY_SERVICE);
        let user = primary
            .service(PRIMARY_SERVICE)
            .and_then(|s| s.get("user"))
            .cloned();

        for (worker, file_name) in self.expected_workers().await? {
            let mut definition = template.clone();
            if let (Some(image), Value::Mapping(map)) = (&image, &mut definition) {
                map.insert(Value::from("image"), Value::from(image.as_str()));
            }
            if let (Some(user), Value::Mapping(map)) = (&user, &mut definition) {
                map.insert(Value::from("user"), user.clone());
            }
            compose.set_service(&worker, definition);

            let conf_path = format!("{}/{}", CONTAINER_CONFIG_DIR, file_name);
            let mut envs = BTreeMap::from([
                ("WAIT_FOR".to_string(), conf_path.clone()),
                ("COMMAND".to_string(), format!("supervisord -c {}", conf_path)),
            ]);
            for key in ["USERID", "USERGROUP"] {
                if let Some(value) = primary_env.get(key) {
                    envs.insert(key.to_string(), value.clone());
                }
            }
            compose.set_envs(&worker, &envs)?;
        }

        let prefix = container_name_prefix(&self.bench);
        compose.set_container_names(&prefix);
        compose.set_top_networks_name("site-network", &prefix);
        compose.set_version(VERSION);
        Ok(compose)
    }

    /// 新生成的描述文件与已落盘的是否语义一致（未落盘视为不一致）
    pub fn is_unchanged(&self, candidate: &ComposeFile) -> BenchResult<bool> {
        let current = ComposeFile::fingerprint_on_disk(self.group.compose_path())?;
        let Some(current) = current else {
            return Ok(false);
        };
        let unchanged = current == candidate.fingerprint()?;
        debug!(bench = %self.bench, unchanged, "Compared workers compose");
        Ok(unchanged)
    }
}
