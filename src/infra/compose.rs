//! Docker Compose 执行运行时
//!
//! `ComposeRuntime` 是对进程执行层的抽象：启动、停止、销毁服务组，
//! 在服务内执行命令，读取服务状态。默认实现驱动 docker compose CLI

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::command::{CommandError, CommandRunner, LineStream};
use crate::domain::{ServiceState, ServiceStatuses};

/// up/down/pull 等可能耗时较长的操作上限
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// 状态查询与一次性 exec 的上限
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// 运行时错误
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("`{action}` failed for {compose} (exit code {code}): {stderr}")]
    CommandFailed {
        action: String,
        compose: PathBuf,
        code: i32,
        stderr: String,
    },

    #[error("Docker command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Failed to parse compose status output: {0}")]
    StatusParse(#[from] serde_json::Error),
}

/// exec 选项
#[derive(Clone, Debug, Default)]
pub struct ExecOptions {
    pub user: Option<String>,
    pub workdir: Option<String>,
}

impl ExecOptions {
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            workdir: None,
        }
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// 一次性命令的输出
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<std::process::Output> for ExecOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// 执行运行时
#[async_trait]
pub trait ComposeRuntime: Send + Sync {
    /// 启动服务组（后台运行）
    async fn up(&self, compose: &Path, force_recreate: bool) -> Result<(), RuntimeError>;

    /// 停止服务组，`services` 为空时停止全部
    async fn stop(&self, compose: &Path, services: &[String]) -> Result<(), RuntimeError>;

    /// 销毁服务组
    async fn down(
        &self,
        compose: &Path,
        remove_orphans: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError>;

    /// 在服务内执行命令并收集输出
    async fn exec(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError>;

    /// 在服务内执行命令，逐行返回输出
    async fn exec_stream(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<LineStream, RuntimeError>;

    /// 服务日志，`follow` 为 true 时持续跟随
    async fn logs(
        &self,
        compose: &Path,
        service: &str,
        follow: bool,
    ) -> Result<LineStream, RuntimeError>;

    /// 在服务内交互式执行程序，继承终端，返回退出码
    async fn exec_interactive(
        &self,
        compose: &Path,
        service: &str,
        program: &str,
        options: &ExecOptions,
    ) -> Result<i32, RuntimeError>;

    /// 各服务当前状态
    async fn service_statuses(&self, compose: &Path) -> Result<ServiceStatuses, RuntimeError>;

    /// 从镜像中拷贝文件或目录到宿主机
    async fn copy_from_image(
        &self,
        image: &str,
        source: &str,
        destination: &Path,
    ) -> Result<(), RuntimeError>;

    /// 以 root 身份运行一次性容器
    async fn run_image(
        &self,
        image: &str,
        command: &str,
        volumes: &[(PathBuf, String)],
    ) -> Result<ExecOutput, RuntimeError>;
}

/// 基于 docker compose CLI 的运行时
#[derive(Clone, Debug)]
pub struct DockerComposeRuntime {
    program: String,
    base_args: Vec<String>,
}

impl DockerComposeRuntime {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// 检测可用的 compose 命令（优先 docker-compose，其次 docker compose）
    pub async fn detect() -> Self {
        if CommandRunner::which("docker-compose").await.is_some() {
            Self::new("docker-compose", Vec::new())
        } else {
            Self::new("docker", vec!["compose".to_string()])
        }
    }

    fn compose_args(&self, compose: &Path, rest: &[&str]) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("-f".to_string());
        args.push(compose.display().to_string());
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    fn exec_prefix(
        &self,
        compose: &Path,
        service: &str,
        options: &ExecOptions,
        tty: bool,
    ) -> Vec<String> {
        let rest: &[&str] = if tty { &["exec"] } else { &["exec", "-T"] };
        let mut args = self.compose_args(compose, rest);
        if let Some(user) = &options.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(workdir) = &options.workdir {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        args.push(service.to_string());
        args
    }

    fn exec_args(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Vec<String> {
        let mut args = self.exec_prefix(compose, service, options, false);
        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }

    async fn run_compose(
        &self,
        action: &str,
        compose: &Path,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, RuntimeError> {
        tracing::debug!(program = %self.program, args = ?args, "Running compose command");
        let output: ExecOutput =
            CommandRunner::run_simple(&self.program, &args, compose.parent(), timeout)
                .await?
                .into();

        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                action: action.to_string(),
                compose: compose.to_path_buf(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn docker(&self, action: &str, args: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        let output: ExecOutput = CommandRunner::run_simple("docker", &args, None, COMPOSE_TIMEOUT)
            .await?
            .into();
        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                action: action.to_string(),
                compose: PathBuf::new(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl ComposeRuntime for DockerComposeRuntime {
    async fn up(&self, compose: &Path, force_recreate: bool) -> Result<(), RuntimeError> {
        let mut rest = vec!["up", "-d"];
        if force_recreate {
            rest.push("--force-recreate");
        }
        let args = self.compose_args(compose, &rest);
        self.run_compose("up", compose, args, COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    async fn stop(&self, compose: &Path, services: &[String]) -> Result<(), RuntimeError> {
        let mut args = self.compose_args(compose, &["stop"]);
        args.extend(services.iter().cloned());
        self.run_compose("stop", compose, args, COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    async fn down(
        &self,
        compose: &Path,
        remove_orphans: bool,
        remove_volumes: bool,
    ) -> Result<(), RuntimeError> {
        let mut rest = vec!["down"];
        if remove_orphans {
            rest.push("--remove-orphans");
        }
        if remove_volumes {
            rest.push("--volumes");
        }
        let args = self.compose_args(compose, &rest);
        self.run_compose("down", compose, args, COMPOSE_TIMEOUT).await?;
        Ok(())
    }

    async fn exec(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput, RuntimeError> {
        let args = self.exec_args(compose, service, command, options);
        // 非零退出码交给调用方判断
        let output = CommandRunner::run_simple(&self.program, &args, compose.parent(), COMPOSE_TIMEOUT)
            .await?;
        Ok(output.into())
    }

    async fn exec_stream(
        &self,
        compose: &Path,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<LineStream, RuntimeError> {
        let args = self.exec_args(compose, service, command, options);
        Ok(CommandRunner::spawn_lines(&self.program, &args, compose.parent())?)
    }

    async fn logs(
        &self,
        compose: &Path,
        service: &str,
        follow: bool,
    ) -> Result<LineStream, RuntimeError> {
        let mut rest = vec!["logs", "--no-log-prefix"];
        if follow {
            rest.push("-f");
        }
        rest.push(service);
        let args = self.compose_args(compose, &rest);
        Ok(CommandRunner::spawn_lines(&self.program, &args, compose.parent())?)
    }

    async fn exec_interactive(
        &self,
        compose: &Path,
        service: &str,
        program: &str,
        options: &ExecOptions,
    ) -> Result<i32, RuntimeError> {
        let mut args = self.exec_prefix(compose, service, options, true);
        args.push(program.to_string());
        Ok(CommandRunner::run_interactive(&self.program, &args, compose.parent()).await?)
    }

    async fn service_statuses(&self, compose: &Path) -> Result<ServiceStatuses, RuntimeError> {
        let args = self.compose_args(compose, &["ps", "--all", "--format", "json"]);
        let output = self.run_compose("ps", compose, args, QUERY_TIMEOUT).await?;
        parse_ps_output(&output.stdout)
    }

    async fn copy_from_image(
        &self,
        image: &str,
        source: &str,
        destination: &Path,
    ) -> Result<(), RuntimeError> {
        let created = self
            .docker("create", vec!["create".to_string(), image.to_string()])
            .await?;
        let container_id = created.stdout.trim().to_string();

        let copied = self
            .docker(
                "cp",
                vec![
                    "cp".to_string(),
                    format!("{}:{}", container_id, source),
                    destination.display().to_string(),
                ],
            )
            .await;

        // 无论拷贝是否成功都清理临时容器
        if let Err(e) = self
            .docker("rm", vec!["rm".to_string(), "-f".to_string(), container_id.clone()])
            .await
        {
            tracing::warn!(container = %container_id, error = %e, "Failed to remove temporary container");
        }

        copied.map(|_| ())
    }

    async fn run_image(
        &self,
        image: &str,
        command: &str,
        volumes: &[(PathBuf, String)],
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--user".to_string(),
            "0:0".to_string(),
            "--entrypoint".to_string(),
            "sh".to_string(),
        ];
        for (host, container) in volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host.display(), container));
        }
        args.push(image.to_string());
        args.push("-c".to_string());
        args.push(command.to_string());

        let output = CommandRunner::run_simple("docker", &args, None, COMPOSE_TIMEOUT).await?;
        Ok(output.into())
    }
}

#[derive(serde::Deserialize)]
struct PsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// 解析 `docker compose ps --format json`
///
/// 旧版本输出一个 JSON 数组，新版本每行一个对象
fn parse_ps_output(stdout: &str) -> Result<ServiceStatuses, RuntimeError> {
    let trimmed = stdout.trim();
    let entries: Vec<PsEntry> = if trimmed.is_empty() {
        Vec::new()
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    Ok(entries
        .into_iter()
        .map(|e| (e.service, ServiceState::parse(&e.state)))
        .collect())
}
