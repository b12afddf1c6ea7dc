//! Bench 编排
//!
//! 一个 bench 由主服务组、workers 组与管理工具组组成。
//! 所有操作严格按顺序执行：主服务组先于 workers 与管理工具

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use crate::config::env::constants::{
    BENCH_CONFIG_FILE_NAME, PRIMARY_SERVICE, PROXY_SERVICE, SPLIT_CONF_SUFFIX,
    SUPERVISOR_STARTED_SENTINEL, VERSION,
};
use crate::config::{BenchConfig, ComposeInputs, ProbeMode};
use crate::domain::certificate::format_time_remaining;
use crate::domain::database::SiteDbConfig;
use crate::domain::{
    container_name_prefix, normalize_bench_name, BenchDbInfo, EnvironmentType, ServiceStatuses,
    SslCertificate,
};
use crate::error::{BenchError, BenchResult};
use crate::infra::command::CommandRunner;
use crate::infra::compose::{ExecOptions, RuntimeError};
use crate::infra::compose_file::{ComposeFile, ComposeTemplate};
use crate::state::BenchContext;

use super::admin_tools::AdminTools;
use super::backup::BackupSet;
use super::certificate::CertificateLifecycle;
use super::devcontainer;
use super::readiness::{wait_for_sentinel, ComposeExecProbe, HttpProbe, ProbeTransport, ReadinessProbe};
use super::sub_deployment::{forward_lines, GroupKind, SubDeployment, TeardownOutcome};
use super::workers::BenchWorkers;

/// 生成 supervisor 配置
const SETUP_SUPERVISOR_COMMAND: &str =
    "bench setup supervisor --skip-redis --skip-supervisord --yes --user frappe";
/// 按进程组拆分 supervisor 配置
const SPLIT_SUPERVISOR_COMMAND: &str = "/scripts/divide-supervisor-conf.py config/supervisor.conf";
const RESTART_SERVER_COMMAND: &str = "supervisorctl -c /opt/user/supervisord.conf restart all";
const BENCH_WORKDIR: &str = "/workspace/frappe-bench";
const FRAPPE_USER: &str = "frappe";
const WORKERS_BACKUP_ARTIFACT: &str = "workers";
/// 保留的 workers 备份数量
const WORKERS_BACKUP_KEEP: usize = 5;
/// 只有 sh 的服务
const SH_ONLY_SERVICES: [&str; 3] = ["redis-cache", "redis-socketio", "redis-queue"];
const FRAPPE_SHELL: &str = "/usr/bin/zsh";
/// 跟随日志文件时的轮询间隔
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEVCONTAINER_LABEL: &str = "devcontainer.metadata";

/// 加载时执行的对账检查
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    pub workers_check: bool,
    pub admin_tools_check: bool,
}

impl LoadOptions {
    pub fn reconcile() -> Self {
        Self {
            workers_check: true,
            admin_tools_check: true,
        }
    }
}

/// workers 同步结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkersSync {
    /// 配置未变化，未重启
    Unchanged,
    /// 重新生成描述文件并启动
    Regenerated,
}

/// 管理工具对账动作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminToolsAction {
    None,
    Enabled,
    Disabled,
}

/// 销毁报告
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: Vec<GroupKind>,
    pub skipped: Vec<GroupKind>,
}

/// bench 信息
#[derive(Clone, Debug)]
pub struct BenchInfo {
    pub url: String,
    pub root: PathBuf,
    pub admin_user: String,
    pub admin_password: String,
    pub root_db_user: String,
    pub root_db_password: String,
    pub root_db_host: String,
    pub db: BenchDbInfo,
    /// "Not Enabled" 或 "<类型> (<剩余时间>)"
    pub https: String,
    /// 未启用时为 None
    pub admin_tools: Option<Vec<(String, String)>>,
    /// 应用 -> 版本
    pub apps: BTreeMap<String, String>,
    pub services: ServiceStatuses,
    pub workers: ServiceStatuses,
}

impl fmt::Display for BenchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("Bench Url", self.url.clone()),
            ("Bench Root", self.root.display().to_string()),
            ("Frappe Username", self.admin_user.clone()),
            ("Frappe Password", self.admin_password.clone()),
            ("Root DB User", self.root_db_user.clone()),
            ("Root DB Password", self.root_db_password.clone()),
            ("Root DB Host", self.root_db_host.clone()),
            ("DB Name", self.db.name.clone()),
            ("DB User", self.db.user.clone()),
            ("DB Password", self.db.password.clone()),
            ("HTTPS", self.https.clone()),
        ];
        for (key, value) in rows {
            writeln!(f, "{:<18} {}", key, value)?;
        }

        match &self.admin_tools {
            None => writeln!(f, "{:<18} Not Enabled", "Admin Tools")?,
            Some(tools) => {
                writeln!(f, "Admin Tools")?;
                for (tool, url) in tools {
                    writeln!(f, "  {:<16} {}", tool, url)?;
                }
            }
        }

        let sections = [
            ("Bench Apps", self.apps.clone()),
            ("Bench Services", status_strings(&self.services)),
            ("Bench Workers", status_strings(&self.workers)),
        ];
        for (title, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            writeln!(f, "{}", title)?;
            for (name, value) in entries {
                writeln!(f, "  {:<16} {}", name, value)?;
            }
        }
        Ok(())
    }
}

fn status_strings(statuses: &ServiceStatuses) -> BTreeMap<String, String> {
    statuses
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

/// 一个 bench
pub struct Bench {
    name: String,
    path: PathBuf,
    pub config: BenchConfig,
    ctx: Arc<BenchContext>,
    primary: SubDeployment,
    workers: BenchWorkers,
    admin_tools: AdminTools,
    certificates: CertificateLifecycle,
}

impl Bench {
    /// 以给定配置构造（不读取磁盘，不做对账）
    pub fn new(ctx: Arc<BenchContext>, mut config: BenchConfig) -> Self {
        let name = normalize_bench_name(&config.name);
        let path = ctx.settings.bench_path(&name);

        config.name = name.clone();
        config.root_path = path.join(BENCH_CONFIG_FILE_NAME);
        if config.ssl.domain.is_empty() {
            config.ssl.domain = name.clone();
        }

        let runtime = ctx.runtime.clone();
        let primary = SubDeployment::new(GroupKind::Primary, &name, &path, runtime.clone());
        let workers = BenchWorkers::new(
            &name,
            &path,
            SubDeployment::new(GroupKind::Workers, &name, &path, runtime.clone()),
        );
        let admin_tools = AdminTools::new(
            &name,
            &path,
            SubDeployment::new(GroupKind::AdminTools, &name, &path, runtime),
        );
        let certificates = CertificateLifecycle::new(
            ctx.certificates.clone(),
            &name,
            path.join("configs").join("nginx").join("html"),
        );

        Self {
            name,
            path,
            config,
            ctx,
            primary,
            workers,
            admin_tools,
            certificates,
        }
    }

    /// 从 `<benches_root>/<name>/bench_config.toml` 加载，按选项执行一次对账
    pub async fn load(ctx: Arc<BenchContext>, name: &str, options: LoadOptions) -> BenchResult<Self> {
        let name = normalize_bench_name(name);
        let config_path = ctx.settings.bench_path(&name).join(BENCH_CONFIG_FILE_NAME);
        let mut config = BenchConfig::import_from_toml(&config_path).await?;
        config.name = name;

        let bench = Self::new(ctx, config);
        if options.workers_check {
            bench.ensure_workers_running_if_available().await?;
        }
        if options.admin_tools_check {
            bench.ensure_admin_tools_running_if_available().await?;
        }
        Ok(bench)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn context(&self) -> &Arc<BenchContext> {
        &self.ctx
    }

    pub fn primary(&self) -> &SubDeployment {
        &self.primary
    }

    pub fn workers(&self) -> &BenchWorkers {
        &self.workers
    }

    pub fn admin_tools(&self) -> &AdminTools {
        &self.admin_tools
    }

    pub fn backups_path(&self) -> PathBuf {
        self.path.join("backups")
    }

    fn sites_path(&self) -> PathBuf {
        self.path.join("workspace").join("frappe-bench").join("sites")
    }

    pub async fn save_config(&self) -> BenchResult<()> {
        self.config.export_to_toml(&self.config.root_path).await?;
        Ok(())
    }

    // ========== 对账 ==========

    /// workers 描述文件存在、workers 未运行且主服务组在运行时启动 workers
    pub async fn ensure_workers_running_if_available(&self) -> BenchResult<bool> {
        let group = self.workers.group();
        if !group.exists() || group.is_running().await? || !self.primary.is_running().await? {
            return Ok(false);
        }
        info!(bench = %self.name, "Workers are not running, starting them");
        group.start(false).await
    }

    /// 管理工具双向对账：期望启用但未运行则启用，期望禁用但仍有服务运行则禁用
    pub async fn ensure_admin_tools_running_if_available(&self) -> BenchResult<AdminToolsAction> {
        let group = self.admin_tools.group();
        if !group.exists() {
            return Ok(AdminToolsAction::None);
        }

        let action = if self.config.admin_tools {
            if group.is_running().await? || !self.primary.is_running().await? {
                return Ok(AdminToolsAction::None);
            }
            info!(bench = %self.name, "Admin tools enabled but not running, enabling");
            if self.admin_tools.enable(false).await? {
                self.restart_frappe_server().await?;
            }
            AdminToolsAction::Enabled
        } else {
            if !group.is_running().await? {
                return Ok(AdminToolsAction::None);
            }
            info!(bench = %self.name, "Admin tools disabled but running, disabling");
            if self.admin_tools.disable().await? && self.primary.is_running().await? {
                self.restart_frappe_server().await?;
            }
            AdminToolsAction::Disabled
        };
        Ok(action)
    }

    // ========== 描述文件与目录 ==========

    /// 由配置完整投影出主服务组描述文件并写入
    pub fn generate_compose(&self, inputs: &ComposeInputs) -> BenchResult<()> {
        let mut compose =
            ComposeFile::from_template(self.primary.compose_path(), ComposeTemplate::Bench)?;

        compose.set_all_envs(&inputs.environment);
        compose.set_all_labels(&inputs.labels);
        for (service, (uid, gid)) in &inputs.users {
            compose.set_user(service, *uid, *gid)?;
        }

        let prefix = container_name_prefix(&self.name);
        compose.set_network_alias(PROXY_SERVICE, "site-network", &[self.name.clone()])?;
        compose.set_container_names(&prefix);
        let secret_path = &self.ctx.services.database_server_info().secret_path;
        compose.set_secret_file_path("db_root_password", &secret_path.display().to_string());
        compose.set_version(VERSION);
        compose.set_top_networks_name("site-network", &prefix);
        compose.write()?;

        info!(bench = %self.name, path = %self.primary.compose_path().display(), "Generated bench compose");
        Ok(())
    }

    /// 准备 workspace 与 nginx 目录
    pub async fn create_compose_dirs(&self) -> BenchResult<()> {
        let compose = self.primary.compose_file()?;

        let workspace = self.path.join("workspace");
        if !workspace.exists() {
            if let Some(image) = compose.image(PRIMARY_SERVICE) {
                self.ctx
                    .runtime
                    .copy_from_image(&image, "/workspace", &workspace)
                    .await?;
            }
        }

        let nginx_dir = self.path.join("configs").join("nginx");
        fs::create_dir_all(&nginx_dir).await?;

        let conf_dir = nginx_dir.join("conf");
        if !conf_dir.exists() {
            if let Some(image) = compose.image(PROXY_SERVICE) {
                self.ctx
                    .runtime
                    .copy_from_image(&image, "/etc/nginx", &conf_dir)
                    .await?;
            }
        }

        for sub in ["logs", "cache", "run", "html"] {
            fs::create_dir_all(nginx_dir.join(sub)).await?;
        }

        info!(bench = %self.name, "Created all required directories");
        Ok(())
    }

    /// 合并写入 `common_site_config.json`
    pub async fn common_bench_config_set(&self, values: Map<String, Value>) -> BenchResult<()> {
        let path = self.sites_path().join("common_site_config.json");
        if !path.exists() {
            return Err(BenchError::ConfigNotFound(path));
        }

        let content = fs::read_to_string(&path).await?;
        let mut config: Map<String, Value> = serde_json::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.extend(values);

        let content = serde_json::to_string_pretty(&config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, content).await?;
        Ok(())
    }

    /// 同步共享数据库与本 bench 的 redis 地址
    pub async fn sync_bench_common_site_config(&self, db_host: &str, db_port: u16) -> BenchResult<()> {
        let prefix = container_name_prefix(&self.name);
        let values = json!({
            "socketio_port": "80",
            "db_host": db_host,
            "db_port": db_port,
            "redis_cache": format!("redis://{}-redis-cache:6379", prefix),
            "redis_queue": format!("redis://{}-redis-queue:6379", prefix),
            "redis_socketio": format!("redis://{}-redis-cache:6379", prefix),
        });
        match values {
            Value::Object(map) => self.common_bench_config_set(map).await,
            _ => Ok(()),
        }
    }

    // ========== 启停 ==========

    /// 启动全部服务组，等待进程管理器启动后同步 workers
    pub async fn start(&self, force: bool) -> BenchResult<()> {
        if !self.primary.exists() {
            return Err(BenchError::DescriptorMissing(
                self.primary.compose_path().to_path_buf(),
            ));
        }

        let db = self.ctx.services.database_server_info();
        self.sync_bench_common_site_config(&db.host, db.port).await?;

        self.primary.start(force).await?;
        self.workers.group().start(force).await?;
        self.admin_tools.group().start(force).await?;

        self.wait_for_supervisor().await?;
        self.sync_workers_compose(false).await?;
        Ok(())
    }

    pub async fn stop(&self) -> BenchResult<()> {
        self.primary.stop(&[]).await?;
        self.workers.group().stop(&[]).await?;
        self.admin_tools.group().stop(&[]).await?;
        Ok(())
    }

    /// 跟随主服务日志直到进程管理器启动
    pub async fn wait_for_supervisor(&self) -> BenchResult<()> {
        info!(bench = %self.name, "Waiting for the frappe server to start");
        let stream = self.primary.logs(PRIMARY_SERVICE, true).await?;
        wait_for_sentinel(
            &self.name,
            stream,
            SUPERVISOR_STARTED_SENTINEL,
            self.ctx.settings.supervisor_wait,
            &self.ctx.cancel,
        )
        .await?;
        info!(bench = %self.name, "Frappe server started");
        Ok(())
    }

    pub async fn restart_frappe_server(&self) -> BenchResult<()> {
        info!(bench = %self.name, "Restarting frappe server");
        let output = self
            .primary
            .exec(PRIMARY_SERVICE, RESTART_SERVER_COMMAND, &ExecOptions::default())
            .await;
        match output {
            Ok(output) if output.success() => {
                info!(bench = %self.name, "Restarted frappe server");
                Ok(())
            }
            Ok(output) => {
                error!(bench = %self.name, code = output.exit_code, stderr = %output.stderr, "Failed to restart frappe server");
                Err(BenchError::ServerRestartFailed(self.name.clone()))
            }
            Err(e) => {
                error!(bench = %self.name, error = %e, "Failed to restart frappe server");
                Err(BenchError::ServerRestartFailed(self.name.clone()))
            }
        }
    }

    // ========== 就绪检测 ==========

    fn probe_transport(&self) -> BenchResult<Box<dyn ProbeTransport>> {
        let prod_host = (self.config.environment_type == EnvironmentType::Prod)
            .then(|| self.name.clone());
        Ok(match self.ctx.settings.probe.mode {
            ProbeMode::Exec => Box::new(ComposeExecProbe::new(
                self.ctx.runtime.clone(),
                self.primary.compose_path().to_path_buf(),
                PRIMARY_SERVICE,
                prod_host,
            )),
            ProbeMode::Http => Box::new(HttpProbe::new(
                "http://127.0.0.1",
                Some(self.name.clone()),
                Duration::from_secs(5),
            )?),
        })
    }

    /// 站点是否已可访问
    pub async fn is_bench_created(&self) -> BenchResult<bool> {
        let probe = ReadinessProbe::new(self.ctx.settings.probe.clone(), self.ctx.cancel.clone());
        let transport = self.probe_transport()?;
        probe.wait_until_ready(transport.as_ref()).await
    }

    // ========== workers ==========

    /// 重新生成 workers 配置，仅在描述文件语义变化时重启 workers
    pub async fn sync_workers_compose(&self, force_recreate: bool) -> BenchResult<WorkersSync> {
        self.regenerate_workers_supervisor_conf().await?;

        if self.workers.expected_workers().await?.is_empty() {
            if self.workers.group().exists() {
                info!(bench = %self.name, "No workers configured, removing workers group");
                self.workers.group().teardown().await?;
                fs::remove_file(self.workers.group().compose_path()).await?;
                return Ok(WorkersSync::Regenerated);
            }
            info!(bench = %self.name, "No workers configured");
            return Ok(WorkersSync::Unchanged);
        }

        let primary = self.primary.compose_file()?;
        let candidate = self.workers.render_compose(&primary).await?;
        if self.workers.is_unchanged(&candidate)? {
            info!(bench = %self.name, "Workers configuration remains unchanged");
            return Ok(WorkersSync::Unchanged);
        }

        candidate.write()?;
        self.workers.group().start(force_recreate).await?;
        info!(bench = %self.name, "Workers configuration regenerated");
        Ok(WorkersSync::Regenerated)
    }

    /// 备份 supervisor.conf 与所有拆分文件
    pub async fn backup_workers_supervisor_conf(&self) -> BenchResult<BackupSet> {
        let backups = self.backups_path();
        let mut backup = BackupSet::begin(&backups, WORKERS_BACKUP_ARTIFACT).await?;
        BackupSet::prune(&backups, WORKERS_BACKUP_ARTIFACT, WORKERS_BACKUP_KEEP).await?;
        let supervisor_conf = self.workers.supervisor_config_path();
        backup.snapshot(&supervisor_conf).await?;

        if supervisor_conf.exists() {
            let mut split_files = Vec::new();
            let mut entries = fs::read_dir(self.workers.config_dir()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_split = path
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(SPLIT_CONF_SUFFIX))
                    .unwrap_or(false);
                if path.is_file() && is_split {
                    split_files.push(path);
                }
            }
            split_files.sort();
            for path in split_files {
                backup.snapshot(&path).await?;
            }
        }
        Ok(backup)
    }

    /// 备份后在主服务内重新生成并拆分 supervisor 配置
    pub async fn regenerate_workers_supervisor_conf(&self) -> BenchResult<BackupSet> {
        info!(bench = %self.name, "Regenerating supervisor.conf");
        let backup = self.backup_workers_supervisor_conf().await?;
        let options = ExecOptions::user(FRAPPE_USER).workdir(BENCH_WORKDIR);

        for command in [SETUP_SUPERVISOR_COMMAND, SPLIT_SUPERVISOR_COMMAND] {
            let result: BenchResult<i32> = async {
                let stream = self.primary.exec_stream(PRIMARY_SERVICE, command, &options).await?;
                forward_lines(&self.name, stream).await
            }
            .await;

            match result {
                Ok(0) => {}
                Ok(code) => {
                    error!(bench = %self.name, command, code, "Workers supervisor config generation failed");
                    return Err(BenchError::WorkersSupervisorConfigGenerate {
                        bench: self.name.clone(),
                    });
                }
                Err(BenchError::Cancelled) => return Err(BenchError::Cancelled),
                Err(e) => {
                    error!(bench = %self.name, command, error = %e, "Workers supervisor config generation failed");
                    return Err(BenchError::WorkersSupervisorConfigGenerate {
                        bench: self.name.clone(),
                    });
                }
            }
        }
        Ok(backup)
    }

    /// 从最近一次备份恢复 workers 配置（强制覆盖）
    pub async fn restore_workers_supervisor_conf(&self) -> BenchResult<usize> {
        match BackupSet::latest(&self.backups_path(), WORKERS_BACKUP_ARTIFACT).await? {
            Some(backup) => {
                info!(bench = %self.name, dir = %backup.dir.display(), "Rolling back to previous workers configuration");
                Ok(backup.restore_all(true).await?)
            }
            None => {
                warn!(bench = %self.name, "No workers configuration backup found");
                Ok(0)
            }
        }
    }

    // ========== secrets ==========

    /// 移除描述文件中的数据库 root 密码 secret
    ///
    /// 运行中的服务组先停止，改写后重新启动
    pub async fn remove_attached_secrets(&self) -> BenchResult<()> {
        info!(bench = %self.name, "Removing bench attached secrets");
        let running = self.primary.is_running().await?;

        if running {
            self.primary.stop(&[PRIMARY_SERVICE.to_string()]).await?;
            self.workers.group().stop(&[]).await?;
        }

        let mut compose = self.primary.compose_file()?;
        compose.remove_secrets_from_container(PRIMARY_SERVICE);
        compose.remove_root_secrets();
        compose.write()?;

        if running {
            self.start(false).await?;
        }
        info!(bench = %self.name, "Removed bench attached secrets");
        Ok(())
    }

    // ========== 证书 ==========

    pub async fn has_certificate(&self) -> bool {
        self.certificates.has_certificate(&self.config.ssl).await
    }

    /// 按当前描述签发并保存配置
    pub async fn create_certificate(&self) -> BenchResult<()> {
        self.certificates.generate(&self.config.ssl).await?;
        self.save_config().await
    }

    pub async fn update_certificate(&mut self, requested: SslCertificate) -> BenchResult<()> {
        self.certificates
            .update(&mut self.config.ssl, requested)
            .await?;
        self.save_config().await
    }

    pub async fn remove_certificate(&mut self) -> BenchResult<()> {
        self.certificates.remove(&mut self.config.ssl).await?;
        self.save_config().await
    }

    pub async fn renew_certificate(&self) -> BenchResult<()> {
        let proxy_running = self.primary.is_service_running(PROXY_SERVICE).await?;
        self.certificates
            .renew(&self.config.ssl, proxy_running)
            .await
    }

    // ========== 管理工具 ==========

    /// 生成管理工具描述文件并启用，返回是否需要重启主服务
    pub async fn sync_admin_tools_compose(&self) -> BenchResult<bool> {
        let db_host = &self.ctx.services.database_server_info().host;
        self.admin_tools.generate_compose(db_host)?;
        self.admin_tools.enable(true).await
    }

    // ========== 信息 ==========

    pub async fn db_connection_info(&self) -> BenchDbInfo {
        let path = self.sites_path().join(&self.name).join("site_config.json");
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return BenchDbInfo::default(),
        };
        match serde_json::from_str::<SiteDbConfig>(&content) {
            Ok(config) => config.into(),
            Err(e) => {
                warn!(bench = %self.name, error = %e, "Invalid site_config.json");
                BenchDbInfo::default()
            }
        }
    }

    /// `sites/apps.json` 中的应用与版本
    pub async fn installed_apps(&self) -> BTreeMap<String, String> {
        let path = self.sites_path().join("apps.json");
        let Ok(content) = fs::read_to_string(&path).await else {
            return BTreeMap::new();
        };
        let Ok(Value::Object(apps)) = serde_json::from_str::<Value>(&content) else {
            return BTreeMap::new();
        };
        apps.into_iter()
            .map(|(app, data)| {
                let version = data
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (app, version)
            })
            .collect()
    }

    pub async fn info(&self) -> BenchResult<BenchInfo> {
        let has_certificate = self.has_certificate().await;
        let protocol = if has_certificate { "https" } else { "http" };
        let services_db = self.ctx.services.database_server_info();

        let https = if has_certificate {
            let remaining = match self.certificates.expiry(&self.config.ssl).await {
                Some(expiry) => format_time_remaining(expiry, chrono::Utc::now()),
                None => "unknown".to_string(),
            };
            format!("{} ({})", self.config.ssl.ssl_type, remaining)
        } else {
            "Not Enabled".to_string()
        };

        let admin_tools = self.config.admin_tools.then(|| {
            vec![
                ("Mailhog".to_string(), format!("{}://{}/mailhog", protocol, self.name)),
                ("Adminer".to_string(), format!("{}://{}/adminer", protocol, self.name)),
            ]
        });

        Ok(BenchInfo {
            url: format!("{}://{}", protocol, self.name),
            root: self.path.clone(),
            admin_user: "administrator".to_string(),
            admin_password: self.config.admin_pass.clone(),
            root_db_user: services_db.user.clone(),
            root_db_password: services_db.password.clone(),
            root_db_host: services_db.host.clone(),
            db: self.db_connection_info().await,
            https,
            admin_tools,
            apps: self.installed_apps().await,
            services: self.primary.service_statuses().await?,
            workers: self.workers.group().service_statuses().await?,
        })
    }

    // ========== 日志与 shell ==========

    /// 应用服务器写入的日志文件
    pub fn log_file_paths(&self) -> Vec<PathBuf> {
        let base = self.path.join("workspace").join("frappe-bench").join("logs");
        match self.config.environment_type {
            EnvironmentType::Dev => vec![base.join("web.dev.log")],
            EnvironmentType::Prod => vec![base.join("web.error.log"), base.join("web.log")],
        }
    }

    /// 输出日志
    ///
    /// 指定服务时读取该服务的容器日志，否则读取应用服务器的日志文件
    pub async fn logs<W>(&self, follow: bool, service: Option<&str>, out: &mut W) -> BenchResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match service {
            Some(service) => self.service_logs(service, follow, out).await?,
            None => self.server_file_logs(follow, out).await?,
        }
        out.flush().await?;
        Ok(())
    }

    async fn service_logs<W>(&self, service: &str, follow: bool, out: &mut W) -> BenchResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !self.primary.is_service_running(service).await? {
            return Err(BenchError::ServiceNotRunning {
                bench: self.name.clone(),
                service: service.to_string(),
            });
        }

        let mut stream = self.primary.logs(service, follow).await?;
        loop {
            let line = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => None,
                line = stream.next_line() => Some(line),
            };
            match line {
                Some(Some(line)) => write_line(out, &line.content).await?,
                Some(None) => break,
                None => {
                    info!(bench = %self.name, service, "Stopped following logs");
                    stream.kill().await;
                    return Ok(());
                }
            }
        }
        stream.finish().await?;
        Ok(())
    }

    /// 多个日志文件逐行交错输出，跟随时轮询新内容直到取消
    async fn server_file_logs<W>(&self, follow: bool, out: &mut W) -> BenchResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut readers = Vec::new();
        for path in self.log_file_paths() {
            if path.is_file() {
                readers.push(BufReader::new(fs::File::open(&path).await?).lines());
            }
        }
        if readers.is_empty() {
            warn!(bench = %self.name, "No log files found");
            return Ok(());
        }

        loop {
            let mut printed = false;
            for reader in readers.iter_mut() {
                if let Some(line) = reader.next_line().await? {
                    write_line(out, line.trim_end()).await?;
                    printed = true;
                }
            }
            if printed {
                continue;
            }
            if !follow {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(LOG_POLL_INTERVAL) => {}
            }
        }
    }

    /// 进入服务的交互式 shell，返回 shell 的退出码
    ///
    /// 主服务默认以 frappe 用户在 bench 目录下使用 zsh
    pub async fn shell(&self, service: &str, user: Option<&str>) -> BenchResult<i32> {
        if !self.primary.is_service_running(service).await? {
            return Err(BenchError::ServiceNotRunning {
                bench: self.name.clone(),
                service: service.to_string(),
            });
        }

        let mut options = ExecOptions {
            user: user.map(str::to_string),
            workdir: None,
        };
        let program = if service == PRIMARY_SERVICE {
            options.user.get_or_insert_with(|| FRAPPE_USER.to_string());
            options.workdir = Some(BENCH_WORKDIR.to_string());
            FRAPPE_SHELL
        } else if SH_ONLY_SERVICES.contains(&service) {
            "sh"
        } else {
            "/bin/bash"
        };

        info!(bench = %self.name, service, program, "Spawning shell");
        let code = self.primary.exec_interactive(service, program, &options).await?;
        if code != 0 {
            warn!(bench = %self.name, service, code, "Shell exited with error code");
        }
        Ok(code)
    }

    // ========== attach ==========

    /// 用 VS Code 附加到主服务容器
    pub async fn attach_to_bench(
        &self,
        user: &str,
        extensions: &[String],
        workdir: &str,
        debugger: bool,
    ) -> BenchResult<()> {
        if !self.primary.is_running().await? {
            return Err(BenchError::NotRunning(self.name.clone()));
        }
        let code = CommandRunner::which("code")
            .await
            .ok_or(BenchError::CodeBinaryNotFound)?;

        let mut compose = self.primary.compose_file()?;
        let container = compose
            .get_container_names()
            .remove(PRIMARY_SERVICE)
            .unwrap_or_else(|| format!("{}-{}", container_name_prefix(&self.name), PRIMARY_SERVICE));

        let mut extensions = extensions.to_vec();
        extensions.sort();
        let labels = compose.get_labels(PRIMARY_SERVICE);
        let previous = labels.get(DEVCONTAINER_LABEL).map(String::as_str);

        if devcontainer::metadata_extensions(previous) != extensions
            || devcontainer::metadata_user(previous).as_deref() != Some(user)
        {
            info!(bench = %self.name, "Configuration changed, regenerating label in bench compose");
            let label = BTreeMap::from([(
                DEVCONTAINER_LABEL.to_string(),
                devcontainer::devcontainer_metadata(user, &extensions).to_string(),
            )]);
            compose.set_labels(PRIMARY_SERVICE, &label)?;
            compose.write()?;
            self.start(false).await?;
        }

        if debugger {
            self.sync_debugger_config().await?;
        }

        let folder_uri = format!(
            "--folder-uri=vscode-remote://attached-container+{}+{}",
            devcontainer::container_name_hex(&container),
            workdir
        );
        let output =
            CommandRunner::run_simple(&code, &[folder_uri], None, Duration::from_secs(120)).await?;
        if !output.status.success() {
            return Err(BenchError::AttachFailed(self.name.clone()));
        }
        info!(bench = %self.name, "Attached to frappe service container");
        Ok(())
    }

    /// 写入 `.vscode/{tasks,launch,settings}.json`，已有文件带时间戳备份
    pub async fn sync_debugger_config(&self) -> BenchResult<()> {
        let dot_vscode = self.path.join("workspace").join("frappe-bench").join(".vscode");
        fs::create_dir_all(&dot_vscode).await?;

        let files = [
            ("launch", devcontainer::launch_json()),
            ("tasks", devcontainer::tasks_json()),
            ("settings", devcontainer::settings_json()),
        ];
        let stamp = chrono::Local::now().format("%d-%b-%y--%H-%M-%S").to_string();

        for (name, content) in files {
            let target = dot_vscode.join(format!("{}.json", name));
            if target.exists() {
                let backup = dot_vscode.join(format!("{}.{}.json", name, stamp));
                fs::copy(&target, &backup).await?;
                info!(bench = %self.name, backup = %backup.display(), "Backed up previous {}.json", name);
            }
            let content = serde_json::to_string_pretty(&content)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(&target, content).await?;
        }

        let install = self
            .primary
            .exec(
                PRIMARY_SERVICE,
                "/workspace/frappe-bench/env/bin/pip install black",
                &ExecOptions::user(FRAPPE_USER),
            )
            .await;
        match install {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(bench = %self.name, code = output.exit_code, "Not able to install black in env"),
            Err(e) => warn!(bench = %self.name, error = %e, "Not able to install black in env"),
        }

        info!(bench = %self.name, "Synced vscode debugger configuration");
        Ok(())
    }

    // ========== 删除 ==========

    /// 删除 bench 的数据库与用户，已不存在时告警跳过
    pub async fn remove_database_and_user(&self) -> BenchResult<()> {
        let db = self.db_connection_info().await;
        if db.name.is_empty() {
            return Ok(());
        }
        let services = &self.ctx.services;
        let db_err = |e: RuntimeError| BenchError::Database(e.to_string());

        if services.db_exists(&db.name).await.map_err(db_err)? {
            services.remove_db(&db.name).await.map_err(db_err)?;
            info!(bench = %self.name, db = %db.name, "Removed bench db");
        } else {
            warn!(bench = %self.name, db = %db.name, "Bench db not found, skipping");
        }

        if services.user_exists(&db.user).await.map_err(db_err)? {
            services.remove_user(&db.user).await.map_err(db_err)?;
            info!(bench = %self.name, user = %db.user, "Removed bench db user");
        } else {
            warn!(bench = %self.name, user = %db.user, "Bench db user not found, skipping");
        }
        Ok(())
    }

    /// 依次销毁三个服务组，然后删除 bench 目录
    pub async fn remove_containers_and_dirs(&self) -> BenchResult<TeardownReport> {
        let mut report = TeardownReport::default();
        for group in [&self.primary, self.workers.group(), self.admin_tools.group()] {
            match group.teardown().await? {
                TeardownOutcome::Removed => report.removed.push(group.kind()),
                TeardownOutcome::Skipped => report.skipped.push(group.kind()),
            }
        }

        // 目录删除后描述文件也不在了，先取出镜像
        let image = self
            .primary
            .compose_file()?
            .get_all_images()
            .remove(PRIMARY_SERVICE);

        info!(bench = %self.name, "Removing all bench files and directories");
        self.remove_bench_dir(image, |path| fs::remove_dir_all(path)).await?;
        info!(bench = %self.name, "Removed all bench files and directories");
        Ok(report)
    }

    /// 删除 bench 目录，权限不足时修正属主后重试一次
    async fn remove_bench_dir<F, Fut>(&self, image: Option<String>, mut remove: F) -> BenchResult<()>
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        match remove(self.path.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(bench = %self.name, error = %e, "Permission denied, fixing ownership and retrying");
                self.fix_permissions(image).await?;
                remove(self.path.clone()).await.map_err(|e| {
                    error!(bench = %self.name, error = %e, "Failed to remove bench directory after ownership fix");
                    self.remove_directory_error()
                })
            }
            Err(e) => {
                error!(bench = %self.name, error = %e, "Failed to remove bench directory");
                Err(self.remove_directory_error())
            }
        }
    }

    fn remove_directory_error(&self) -> BenchError {
        BenchError::RemoveDirectory {
            bench: self.name.clone(),
            path: self.path.clone(),
        }
    }

    async fn fix_permissions(&self, image: Option<String>) -> BenchResult<()> {
        let image = image.ok_or_else(|| self.remove_directory_error())?;
        let command = format!(
            "chown -R {}:{} /workspace",
            self.ctx.settings.uid, self.ctx.settings.gid
        );
        let volumes = [(self.path.join("workspace"), "/workspace".to_string())];

        match self.ctx.runtime.run_image(&image, &command, &volumes).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                error!(bench = %self.name, code = output.exit_code, "Ownership fix failed");
                return Err(self.remove_directory_error());
            }
            Err(e) => {
                error!(bench = %self.name, error = %e, "Ownership fix failed");
                return Err(self.remove_directory_error());
            }
        }
        Ok(())
    }

    /// 确认后删除 bench
    ///
    /// `default_choice` 为 true 时默认回答 no，否则必须明确回答
    pub async fn remove_bench(&mut self, default_choice: bool) -> BenchResult<bool> {
        let default = default_choice.then_some(false);
        let question = format!("Do you want to remove '{}'?", self.name);
        if !self.ctx.prompt.confirm(&question, default) {
            return Ok(false);
        }

        info!(bench = %self.name, "Removing bench");
        if let Err(e) = self.remove_certificate().await {
            warn!(bench = %self.name, error = %e, "Certificate not removed");
        }

        self.remove_database_and_user().await?;
        self.remove_containers_and_dirs().await?;
        Ok(true)
    }
}

async fn write_line<W>(out: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await
}
