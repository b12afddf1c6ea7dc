//! 测试用的协作方替身
//!
//! 记录每个描述文件上的 up/stop/down/exec 调用，供断言使用

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::SUPERVISOR_STARTED_SENTINEL;
use crate::config::{EnvConfig, ProbeConfig};
use crate::domain::{DatabaseServerInfo, LogLine, ServiceState, ServiceStatuses, SslCertificate};
use crate::infra::command::LineStream;
use crate::infra::compose::{ComposeRuntime, ExecOptions, ExecOutput, RuntimeError};
use crate::infra::compose_file::{ComposeFile, ComposeTemplate};
use crate::services::certificate::{CertificateBackend, CertificateError};
use crate::services::prompt::Prompt;
use crate::services::registry::ServicesRegistry;
use crate::state::BenchContext;

#[derive(Default)]
struct RuntimeState {
    statuses: BTreeMap<PathBuf, ServiceStatuses>,
    ups: Vec<(PathBuf, bool)>,
    stops: Vec<(PathBuf, Vec<String>)>,
    downs: Vec<PathBuf>,
    execs: Vec<(PathBuf, String, String)>,
    streams: Vec<(PathBuf, String, String)>,
    exec_outputs: VecDeque<ExecOutput>,
    failing_streams: Vec<String>,
    copies: Vec<(String, String, PathBuf)>,
    runs: Vec<(String, String)>,
    failing_runs: bool,
    logs: Vec<(String, bool)>,
    shells: Vec<(String, String, ExecOptions)>,
    silent_logs: Option<mpsc::Sender<LogLine>>,
    hang_logs: bool,
}

/// 内存中的 compose 运行时
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn with_state<T>(&self, f: impl FnOnce(&mut RuntimeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// 直接设定服务状态
    pub fn set_running(&self, compose: &Path, services: &[&str]) {
        self.with_state(|s| {
            let statuses = s.statuses.entry(compose.to_path_buf()).or_default();
            for service in services {
                statuses.insert(service.to_string(), ServiceState::Running);
            }
        });
    }

    pub fn push_exec_output(&self, output: ExecOutput) {
        self.with_state(|s| s.exec_outputs.push_back(output));
    }

    /// 包含该片段的流式命令以退出码 1 结束
    pub fn fail_streams_containing(&self, fragment: &str) {
        self.with_state(|s| s.failing_streams.push(fragment.to_string()));
    }

    /// `run_image` 以退出码 1 结束
    pub fn fail_runs(&self) {
        self.with_state(|s| s.failing_runs = true);
    }

    /// 跟随日志时返回永不结束且没有输出的流
    pub fn hang_logs(&self) {
        self.with_state(|s| s.hang_logs = true);
    }

    pub fn up_count(&self, compose: &Path) -> usize {
        self.with_state(|s| s.ups.iter().filter(|(p, _)| p == compose).count())
    }

    pub fn forced_up_count(&self, compose: &Path) -> usize {
        self.with_state(|s| s.ups.iter().filter(|(p, f)| p == compose && *f).count())
    }

    pub fn stop_count(&self, compose: &Path) -> usize {
        self.with_state(|s| s.stops.iter().filter(|(p, _)| p == compose).count())
    }

    pub fn down_count(&self, compose: &Path) -> usize {
        self.with_state(|s| s.downs.iter().filter(|p| *p == compose).count())
    }

    pub fn total_downs(&self) -> usize {
        self.with_state(|s| s.downs.len())
    }

    pub fn exec_commands(&self) -> Vec<String> {
        self.with_state(|s| s.execs.iter().map(|(_, _, c)| c.clone()).collect())
    }

    pub fn stream_commands(&self) -> Vec<String> {
        self.with_state(|s| s.streams.iter().map(|(_, _, c)| c.clone()).collect())
    }

    pub fn run_commands(&self) -> Vec<String> {
        self.with_state(|s| s.runs.iter().map(|(_, c)| c.clone()).collect())
    }

    /// (服务, 是否跟随)
    pub fn log_requests(&self) -> Vec<(String, bool)> {
        self.with_state(|s| s.logs.clone())
    }

    /// (服务, 程序, 选项)
    pub fn shells(&self) -> Vec<(String, String, ExecOptions)> {
        self.with_state(|s| s.shells.clone())
    }

    pub fn copy_count(&self) -> usize {
        self.with_state(|s| s.copies.len())
    }
}

#[async_trait]
impl ComposeRuntime for FakeRuntime {
    async fn up(&self, compose: &Path, force_recreate: bool) -> Result<(), RuntimeError> {
        let services = ComposeFile::load(compose, ComposeTemplate::Bench)
            .map(|c| c.service_names())
            .unwrap_or_default();
        self.with_state(|s| {
            s.ups.push((compose.to_path_buf(), force_recreate));
            let statuses = s.statuses.entry(compose.to_path_buf()).or_default();
            for service in services {
                statuses.insert(service, ServiceState::Running);
            }
        });
        Ok(())
    }

    async fn stop(&self, compose: &Path, services: &[String]) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.stops.push((compose.to_path_buf(), services.to_vec()));
            if let Some(statuses) = s.statuses.get_mut(compose) {
                for (name, state) in statuses.iter_mut() {
                    if services.is_empty() || services.contains(name) {
                        *state = ServiceState::Exited;
                    }
                }
            }
        });
        Ok(())
    }

    async fn down(
        &self,
        compose: &Path,
        _remove_orphans: bool,
        _remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.downs.push(compose.to_path_buf());
            s.statuses.remove(compose);
        });
        Ok(())
    }

    async fn exec(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        _options: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError> {
        Ok(self.with_state(|s| {
            s.execs
                .push((compose.to_path_buf(), service.to_string(), command.to_string()));
            s.exec_outputs.pop_front().unwrap_or_else(|| {
                let stdout = if command.starts_with("curl") {
                    "HTTP/1.1 200 OK\r\n".to_string()
                } else {
                    String::new()
                };
                ExecOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                }
            })
        }))
    }

    async fn exec_stream(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        _options: &ExecOptions,
    ) -> Result<LineStream, RuntimeError> {
        let failing = self.with_state(|s| {
            s.streams
                .push((compose.to_path_buf(), service.to_string(), command.to_string()));
            s.failing_streams.iter().any(|f| command.contains(f.as_str()))
        });
        let exit_code = if failing { 1 } else { 0 };
        Ok(LineStream::from_lines(vec![LogLine::stdout(command)], exit_code))
    }

    async fn logs(
        &self,
        _compose: &Path,
        service: &str,
        follow: bool,
    ) -> Result<LineStream, RuntimeError> {
        let hang = self.with_state(|s| {
            s.logs.push((service.to_string(), follow));
            s.hang_logs
        });
        if !follow {
            return Ok(LineStream::from_lines(
                vec![LogLine::stdout(format!("{} ready", service))],
                0,
            ));
        }
        if hang {
            let (tx, rx) = mpsc::channel(1);
            self.with_state(|s| s.silent_logs = Some(tx));
            return Ok(LineStream::from_receiver(rx, 0));
        }
        Ok(LineStream::from_lines(
            vec![
                LogLine::stdout("Updating files: 100%"),
                LogLine::stdout(format!("{} 42", SUPERVISOR_STARTED_SENTINEL)),
            ],
            0,
        ))
    }

    async fn exec_interactive(
        &self,
        _compose: &Path,
        service: &str,
        program: &str,
        options: &ExecOptions,
    ) -> Result<i32, RuntimeError> {
        self.with_state(|s| {
            s.shells
                .push((service.to_string(), program.to_string(), options.clone()))
        });
        Ok(0)
    }

    async fn service_statuses(&self, compose: &Path) -> Result<ServiceStatuses, RuntimeError> {
        Ok(self.with_state(|s| s.statuses.get(compose).cloned().unwrap_or_default()))
    }

    async fn copy_from_image(
        &self,
        image: &str,
        source: &str,
        destination: &Path,
    ) -> Result<(), RuntimeError> {
        self.with_state(|s| {
            s.copies
                .push((image.to_string(), source.to_string(), destination.to_path_buf()))
        });
        std::fs::create_dir_all(destination).map_err(|e| RuntimeError::CommandFailed {
            action: "cp".to_string(),
            compose: destination.to_path_buf(),
            code: -1,
            stderr: e.to_string(),
        })
    }

    async fn run_image(
        &self,
        image: &str,
        command: &str,
        _volumes: &[(PathBuf, String)],
    ) -> Result<ExecOutput, RuntimeError> {
        let failing = self.with_state(|s| {
            s.runs.push((image.to_string(), command.to_string()));
            s.failing_runs
        });
        Ok(ExecOutput {
            exit_code: if failing { 1 } else { 0 },
            ..ExecOutput::default()
        })
    }
}

/// 内存中的共享服务
pub struct FakeServices {
    info: DatabaseServerInfo,
    dbs: Mutex<BTreeSet<String>>,
    users: Mutex<BTreeSet<String>>,
}

impl Default for FakeServices {
    fn default() -> Self {
        Self {
            info: DatabaseServerInfo {
                host: "global-db".to_string(),
                port: 3306,
                user: "root".to_string(),
                password: "root-pass".to_string(),
                secret_path: PathBuf::from("/srv/services/secrets/db_root_password.txt"),
            },
            dbs: Mutex::new(BTreeSet::new()),
            users: Mutex::new(BTreeSet::new()),
        }
    }
}

impl FakeServices {
    pub fn add_db(&self, name: &str) {
        self.dbs.lock().unwrap().insert(name.to_string());
    }

    pub fn add_user(&self, name: &str) {
        self.users.lock().unwrap().insert(name.to_string());
    }

    pub fn has_db(&self, name: &str) -> bool {
        self.dbs.lock().unwrap().contains(name)
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.users.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl ServicesRegistry for FakeServices {
    fn database_server_info(&self) -> &DatabaseServerInfo {
        &self.info
    }

    async fn db_exists(&self, db_name: &str) -> Result<bool, RuntimeError> {
        Ok(self.has_db(db_name))
    }

    async fn remove_db(&self, db_name: &str) -> Result<(), RuntimeError> {
        self.dbs.lock().unwrap().remove(db_name);
        Ok(())
    }

    async fn user_exists(&self, user: &str) -> Result<bool, RuntimeError> {
        Ok(self.has_user(user))
    }

    async fn remove_user(&self, user: &str) -> Result<(), RuntimeError> {
        self.users.lock().unwrap().remove(user);
        Ok(())
    }
}

/// 内存中的证书后端
#[derive(Default)]
pub struct FakeCertificates {
    domains: Mutex<BTreeSet<String>>,
    issued: AtomicUsize,
    renewed: AtomicUsize,
    revoked: AtomicUsize,
}

impl FakeCertificates {
    pub fn insert(&self, domain: &str) {
        self.domains.lock().unwrap().insert(domain.to_string());
    }

    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn renewed_count(&self) -> usize {
        self.renewed.load(Ordering::SeqCst)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateBackend for FakeCertificates {
    async fn issue(
        &self,
        certificate: &SslCertificate,
        _webroot: &Path,
    ) -> Result<(), CertificateError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.insert(&certificate.domain);
        Ok(())
    }

    async fn renew(&self, _certificate: &SslCertificate) -> Result<(), CertificateError> {
        self.renewed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn revoke(&self, certificate: &SslCertificate) -> Result<(), CertificateError> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().remove(&certificate.domain);
        Ok(())
    }

    async fn has_certificate(&self, domain: &str) -> bool {
        self.domains.lock().unwrap().contains(domain)
    }

    async fn expiry(&self, domain: &str) -> Result<DateTime<Utc>, CertificateError> {
        if self.has_certificate(domain).await {
            Ok(Utc::now() + ChronoDuration::days(60))
        } else {
            Err(CertificateError::NotConfigured)
        }
    }
}

/// 按顺序给出预设回答
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<(String, Option<bool>)>>,
}

impl ScriptedPrompt {
    pub fn answering(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<(String, Option<bool>)> {
        self.asked.lock().unwrap().clone()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&self, question: &str, default: Option<bool>) -> bool {
        self.asked
            .lock()
            .unwrap()
            .push((question.to_string(), default));
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .or(default)
            .unwrap_or(false)
    }
}

/// 一组替身与基于临时目录的上下文
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub services: Arc<FakeServices>,
    pub certificates: Arc<FakeCertificates>,
    pub prompt: Arc<ScriptedPrompt>,
    pub ctx: Arc<BenchContext>,
}

impl Harness {
    pub fn new(home: &Path) -> Self {
        Self::with_prompt(home, ScriptedPrompt::default())
    }

    pub fn with_prompt(home: &Path, prompt: ScriptedPrompt) -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let services = Arc::new(FakeServices::default());
        let certificates = Arc::new(FakeCertificates::default());
        let prompt = Arc::new(prompt);

        let mut settings = EnvConfig::with_home(home);
        settings.probe = ProbeConfig {
            attempts: 3,
            ..ProbeConfig::default()
        };

        let ctx = Arc::new(BenchContext {
            settings,
            runtime: runtime.clone(),
            services: services.clone(),
            certificates: certificates.clone(),
            prompt: prompt.clone(),
            cancel: CancellationToken::new(),
        });

        Self {
            runtime,
            services,
            certificates,
            prompt,
            ctx,
        }
    }
}
