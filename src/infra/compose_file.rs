//! Compose 描述文件读写
//!
//! 对 docker-compose YAML 的最小修改接口：环境变量、标签、用户、网络别名、
//! 容器名、secret 路径与版本戳。文件不存在时从内置模板加载

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 版本戳字段
const VERSION_KEY: &str = "x-version";

/// 描述文件错误
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid compose file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize compose file: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("Failed to canonicalize compose file: {0}")]
    Canonicalize(#[from] serde_json::Error),

    #[error("Service '{0}' not found in compose file")]
    MissingService(String),
}

/// 内置模板
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeTemplate {
    Bench,
    Workers,
    AdminTools,
}

impl ComposeTemplate {
    fn source(&self) -> &'static str {
        match self {
            ComposeTemplate::Bench => include_str!("../../templates/docker-compose.tmpl.yml"),
            ComposeTemplate::Workers => {
                include_str!("../../templates/docker-compose.workers.tmpl.yml")
            }
            ComposeTemplate::AdminTools => {
                include_str!("../../templates/docker-compose.admin-tools.tmpl.yml")
            }
        }
    }
}

/// Compose 描述文件
#[derive(Clone, Debug)]
pub struct ComposeFile {
    path: PathBuf,
    yml: Value,
}

impl ComposeFile {
    /// 加载已有文件，不存在时使用模板
    pub fn load(path: &Path, template: ComposeTemplate) -> Result<Self, DescriptorError> {
        if !path.exists() {
            return Self::from_template(path, template);
        }

        let content = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let yml = serde_yaml::from_str(&content).map_err(|source| DescriptorError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            yml,
        })
    }

    /// 忽略已有文件，直接从模板构造
    pub fn from_template(path: &Path, template: ComposeTemplate) -> Result<Self, DescriptorError> {
        let yml = serde_yaml::from_str(template.source()).map_err(|source| {
            DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            yml,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件是否已落盘
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn services(&self) -> Option<&Mapping> {
        self.yml.get("services").and_then(Value::as_mapping)
    }

    fn services_mut(&mut self) -> &mut Mapping {
        let root = ensure_mapping(&mut self.yml);
        let services = root
            .entry(Value::from("services"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        ensure_mapping(services)
    }

    fn service_mut(&mut self, service: &str) -> Option<&mut Mapping> {
        self.services_mut()
            .get_mut(service)
            .map(ensure_mapping)
    }

    /// 服务名列表（已排序）
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services()
            .map(|s| s.keys().filter_map(|k| k.as_str().map(String::from)).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn service(&self, service: &str) -> Option<&Value> {
        self.services().and_then(|s| s.get(service))
    }

    pub fn set_service(&mut self, service: &str, definition: Value) {
        self.services_mut().insert(Value::from(service), definition);
    }

    pub fn remove_service(&mut self, service: &str) -> Option<Value> {
        self.services_mut().remove(service)
    }

    /// 合并某个服务的环境变量
    pub fn set_envs(
        &mut self,
        service: &str,
        envs: &BTreeMap<String, String>,
    ) -> Result<(), DescriptorError> {
        let definition = self
            .service_mut(service)
            .ok_or_else(|| DescriptorError::MissingService(service.to_string()))?;
        let environment = definition
            .entry(Value::from("environment"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        list_to_mapping(environment);
        let environment = ensure_mapping(environment);
        for (key, value) in envs {
            environment.insert(Value::from(key.as_str()), Value::from(value.as_str()));
        }
        Ok(())
    }

    /// 按服务批量设置环境变量，模板中不存在的服务跳过
    pub fn set_all_envs(&mut self, envs: &BTreeMap<String, BTreeMap<String, String>>) {
        for (service, values) in envs {
            if self.set_envs(service, values).is_err() {
                tracing::debug!(service = %service, "Skipping envs for unknown service");
            }
        }
    }

    pub fn get_envs(&self, service: &str) -> BTreeMap<String, String> {
        self.service(service)
            .and_then(|s| s.get("environment"))
            .map(string_map)
            .unwrap_or_default()
    }

    /// 合并某个服务的标签
    pub fn set_labels(
        &mut self,
        service: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DescriptorError> {
        let definition = self
            .service_mut(service)
            .ok_or_else(|| DescriptorError::MissingService(service.to_string()))?;
        let existing = definition
            .entry(Value::from("labels"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        list_to_mapping(existing);
        let existing = ensure_mapping(existing);
        for (key, value) in labels {
            existing.insert(Value::from(key.as_str()), Value::from(value.as_str()));
        }
        Ok(())
    }

    pub fn set_all_labels(&mut self, labels: &BTreeMap<String, BTreeMap<String, String>>) {
        for (service, values) in labels {
            if self.set_labels(service, values).is_err() {
                tracing::debug!(service = %service, "Skipping labels for unknown service");
            }
        }
    }

    pub fn get_labels(&self, service: &str) -> BTreeMap<String, String> {
        self.service(service)
            .and_then(|s| s.get("labels"))
            .map(string_map)
            .unwrap_or_default()
    }

    /// 设置服务运行用户 `uid:gid`
    pub fn set_user(&mut self, service: &str, uid: u32, gid: u32) -> Result<(), DescriptorError> {
        let definition = self
            .service_mut(service)
            .ok_or_else(|| DescriptorError::MissingService(service.to_string()))?;
        definition.insert(Value::from("user"), Value::from(format!("{}:{}", uid, gid)));
        Ok(())
    }

    /// 设置服务在指定网络上的别名
    pub fn set_network_alias(
        &mut self,
        service: &str,
        network: &str,
        aliases: &[String],
    ) -> Result<(), DescriptorError> {
        let definition = self
            .service_mut(service)
            .ok_or_else(|| DescriptorError::MissingService(service.to_string()))?;
        let networks = definition
            .entry(Value::from("networks"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        list_to_mapping(networks);
        let entry = ensure_mapping(networks)
            .entry(Value::from(network))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        let alias_values = aliases.iter().map(|a| Value::from(a.as_str())).collect();
        ensure_mapping(entry).insert(Value::from("aliases"), Value::Sequence(alias_values));
        Ok(())
    }

    /// 所有服务容器名设置为 `<prefix>-<service>`
    pub fn set_container_names(&mut self, prefix: &str) {
        for (name, definition) in self.services_mut().iter_mut() {
            let Some(name) = name.as_str() else { continue };
            let container_name = format!("{}-{}", prefix, name);
            ensure_mapping(definition)
                .insert(Value::from("container_name"), Value::from(container_name));
        }
    }

    pub fn get_container_names(&self) -> BTreeMap<String, String> {
        self.services()
            .map(|services| {
                services
                    .iter()
                    .filter_map(|(name, definition)| {
                        let name = name.as_str()?;
                        let container = definition.get("container_name")?.as_str()?;
                        Some((name.to_string(), container.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 设置顶层 secret 的文件路径
    pub fn set_secret_file_path(&mut self, secret: &str, file: &str) {
        let root = ensure_mapping(&mut self.yml);
        let secrets = root
            .entry(Value::from("secrets"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        let entry = ensure_mapping(secrets)
            .entry(Value::from(secret))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        ensure_mapping(entry).insert(Value::from("file"), Value::from(file));
    }

    /// 移除服务上挂载的 secrets
    pub fn remove_secrets_from_container(&mut self, service: &str) {
        if let Some(definition) = self.service_mut(service) {
            definition.remove("secrets");
        }
    }

    /// 移除顶层 secrets 定义
    pub fn remove_root_secrets(&mut self) {
        if let Some(root) = self.yml.as_mapping_mut() {
            root.remove("secrets");
        }
    }

    pub fn has_secrets(&self) -> bool {
        self.yml.get("secrets").is_some()
            || self
                .services()
                .map(|s| s.values().any(|d| d.get("secrets").is_some()))
                .unwrap_or(false)
    }

    pub fn set_version(&mut self, version: &str) {
        ensure_mapping(&mut self.yml).insert(Value::from(VERSION_KEY), Value::from(version));
    }

    pub fn get_version(&self) -> Option<String> {
        self.yml.get(VERSION_KEY).and_then(scalar_to_string)
    }

    /// 设置顶层网络名为 `<prefix>-<network>`
    pub fn set_top_networks_name(&mut self, network: &str, prefix: &str) {
        let root = ensure_mapping(&mut self.yml);
        let networks = root
            .entry(Value::from("networks"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        let entry = ensure_mapping(networks)
            .entry(Value::from(network))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        ensure_mapping(entry).insert(
            Value::from("name"),
            Value::from(format!("{}-{}", prefix, network)),
        );
    }

    /// 服务名 -> 镜像
    pub fn get_all_images(&self) -> BTreeMap<String, String> {
        self.services()
            .map(|services| {
                services
                    .iter()
                    .filter_map(|(name, definition)| {
                        let image = definition.get("image")?.as_str()?;
                        Some((name.as_str()?.to_string(), image.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn image(&self, service: &str) -> Option<String> {
        self.service(service)
            .and_then(|s| s.get("image"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    pub fn to_yaml_string(&self) -> Result<String, DescriptorError> {
        Ok(serde_yaml::to_string(&self.yml)?)
    }

    /// 写入文件（原子写入）
    pub fn write(&self) -> Result<(), DescriptorError> {
        let io_err = |source| DescriptorError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = self.to_yaml_string()?;
        let temp_path = self.path.with_extension("yml.tmp");
        std::fs::write(&temp_path, content).map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;

        tracing::debug!(path = %self.path.display(), "Wrote compose file");
        Ok(())
    }

    /// 语义指纹
    ///
    /// YAML 转为键有序的 JSON 后取 SHA-256，格式、键顺序与注释不影响结果
    pub fn fingerprint(&self) -> Result<String, DescriptorError> {
        let canonical = serde_json::to_value(&self.yml)?;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// 已落盘文件的语义指纹，文件不存在返回 None
    pub fn fingerprint_on_disk(path: &Path) -> Result<Option<String>, DescriptorError> {
        if !path.exists() {
            return Ok(None);
        }
        // 模板不会被用到：文件存在
        let existing = Self::load(path, ComposeTemplate::Bench)?;
        existing.fingerprint().map(Some)
    }
}

fn ensure_mapping(value: &mut Value) -> &mut Mapping {
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    match value {
        Value::Mapping(mapping) => mapping,
        _ => unreachable!("value was just replaced with a mapping"),
    }
}

/// `["KEY=value", ...]` / `["network"]` 形式转为映射
fn list_to_mapping(value: &mut Value) {
    let Value::Sequence(items) = value else { return };
    let mut mapping = Mapping::new();
    for item in items.iter() {
        let Some(item) = item.as_str() else { continue };
        match item.split_once('=') {
            Some((k, v)) => mapping.insert(Value::from(k), Value::from(v)),
            None => mapping.insert(Value::from(item), Value::Null),
        };
    }
    *value = Value::Mapping(mapping);
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    match value {
        Value::Mapping(mapping) => {
            for (k, v) in mapping {
                if let Some(k) = k.as_str() {
                    map.insert(k.to_string(), scalar_to_string(v).unwrap_or_default());
                }
            }
        }
        Value::Sequence(items) => {
            for item in items.iter().filter_map(Value::as_str) {
                let (k, v) = item.split_once('=').unwrap_or((item, ""));
                map.insert(k.to_string(), v.to_string());
            }
        }
        _ => {}
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bench_compose(dir: &TempDir) -> ComposeFile {
        ComposeFile::load(&dir.path().join("docker-compose.yml"), ComposeTemplate::Bench).unwrap()
    }

    #[test]
    fn test_load_falls_back_to_template() {
        let dir = TempDir::new().unwrap();
        let compose = bench_compose(&dir);
        assert!(!compose.exists());
        assert!(compose.service_names().contains(&"frappe".to_string()));
        assert!(compose.has_secrets());
    }

    #[test]
    fn test_container_names_and_network() {
        let dir = TempDir::new().unwrap();
        let mut compose = bench_compose(&dir);
        compose.set_container_names("shop");
        compose.set_top_networks_name("site-network", "shop");
        compose
            .set_network_alias("nginx", "site-network", &["shop.localhost".to_string()])
            .unwrap();

        let names = compose.get_container_names();
        assert_eq!(names["frappe"], "shop-frappe");
        assert_eq!(names["nginx"], "shop-nginx");

        let alias = &compose.service("nginx").unwrap()["networks"]["site-network"]["aliases"][0];
        assert_eq!(alias.as_str(), Some("shop.localhost"));
        assert_eq!(
            compose.yml["networks"]["site-network"]["name"].as_str(),
            Some("shop-site-network")
        );
    }

    #[test]
    fn test_envs_labels_and_user() {
        let dir = TempDir::new().unwrap();
        let mut compose = bench_compose(&dir);

        let envs = BTreeMap::from([("SITENAME".to_string(), "shop.localhost".to_string())]);
        compose.set_envs("frappe", &envs).unwrap();
        assert_eq!(compose.get_envs("frappe")["SITENAME"], "shop.localhost");
        // 模板中原有的变量保留
        assert_eq!(compose.get_envs("frappe")["USERID"], "1000");

        let labels = BTreeMap::from([("a.b".to_string(), "c".to_string())]);
        compose.set_labels("frappe", &labels).unwrap();
        assert_eq!(compose.get_labels("frappe")["a.b"], "c");

        compose.set_user("frappe", 1001, 1002).unwrap();
        assert_eq!(compose.service("frappe").unwrap()["user"].as_str(), Some("1001:1002"));

        assert!(matches!(
            compose.set_envs("missing", &envs),
            Err(DescriptorError::MissingService(_))
        ));
    }

    #[test]
    fn test_remove_secrets() {
        let dir = TempDir::new().unwrap();
        let mut compose = bench_compose(&dir);
        compose.set_secret_file_path("db_root_password", "/srv/secrets/db_root_password.txt");
        assert!(compose.has_secrets());

        compose.remove_secrets_from_container("frappe");
        compose.remove_root_secrets();
        assert!(!compose.has_secrets());
    }

    #[test]
    fn test_write_and_reload_with_version() {
        let dir = TempDir::new().unwrap();
        let mut compose = bench_compose(&dir);
        compose.set_version("1.2.3");
        compose.write().unwrap();
        assert!(compose.exists());

        let reloaded = bench_compose(&dir);
        assert_eq!(reloaded.get_version(), Some("1.2.3".to_string()));
        assert_eq!(
            reloaded.image("redis-cache"),
            Some("redis:6.2-alpine".to_string())
        );
    }

    #[test]
    fn test_fingerprint_ignores_formatting_and_key_order() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.yml");
        let b = dir.path().join("b.yml");
        std::fs::write(&a, "services:\n  w:\n    image: x\n    command: run\n").unwrap();
        std::fs::write(
            &b,
            "# regenerated\nservices:\n  w: {command: run,   image: x}\n",
        )
        .unwrap();

        let fa = ComposeFile::fingerprint_on_disk(&a).unwrap();
        let fb = ComposeFile::fingerprint_on_disk(&b).unwrap();
        assert!(fa.is_some());
        assert_eq!(fa, fb);

        std::fs::write(&b, "services:\n  w: {command: run, image: y}\n").unwrap();
        assert_ne!(fa, ComposeFile::fingerprint_on_disk(&b).unwrap());

        assert_eq!(
            ComposeFile::fingerprint_on_disk(&dir.path().join("none.yml")).unwrap(),
            None
        );
    }
}
