//! 服务组句柄
//!
//! 主服务组、workers 组与管理工具组行为一致，只有描述文件路径不同。
//! 描述文件不存在时所有操作都是空操作

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::domain::container::any_running;
use crate::domain::ServiceStatuses;
use crate::error::BenchResult;
use crate::infra::command::LineStream;
use crate::infra::compose::{ComposeRuntime, ExecOptions, ExecOutput};
use crate::infra::compose_file::{ComposeFile, ComposeTemplate};

/// 服务组类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupKind {
    Primary,
    Workers,
    AdminTools,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Primary => "primary",
            GroupKind::Workers => "workers",
            GroupKind::AdminTools => "admin-tools",
        }
    }

    /// 描述文件名
    pub fn compose_file_name(&self) -> &'static str {
        match self {
            GroupKind::Primary => "docker-compose.yml",
            GroupKind::Workers => "docker-compose.workers.yml",
            GroupKind::AdminTools => "docker-compose.admin-tools.yml",
        }
    }

    pub fn template(&self) -> ComposeTemplate {
        match self {
            GroupKind::Primary => ComposeTemplate::Bench,
            GroupKind::Workers => ComposeTemplate::Workers,
            GroupKind::AdminTools => ComposeTemplate::AdminTools,
        }
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 销毁结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    /// 描述文件不存在
    Skipped,
}

/// 一个服务组
#[derive(Clone)]
pub struct SubDeployment {
    kind: GroupKind,
    bench: String,
    compose_path: PathBuf,
    runtime: Arc<dyn ComposeRuntime>,
}

impl SubDeployment {
    pub fn new(
        kind: GroupKind,
        bench: impl Into<String>,
        bench_path: &Path,
        runtime: Arc<dyn ComposeRuntime>,
    ) -> Self {
        Self {
            kind,
            bench: bench.into(),
            compose_path: bench_path.join(kind.compose_file_name()),
            runtime,
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn compose_path(&self) -> &Path {
        &self.compose_path
    }

    pub fn exists(&self) -> bool {
        self.compose_path.exists()
    }

    /// 加载描述文件（不存在时为模板内容）
    pub fn compose_file(&self) -> BenchResult<ComposeFile> {
        Ok(ComposeFile::load(&self.compose_path, self.kind.template())?)
    }

    pub async fn service_statuses(&self) -> BenchResult<ServiceStatuses> {
        if !self.exists() {
            return Ok(ServiceStatuses::new());
        }
        Ok(self.runtime.service_statuses(&self.compose_path).await?)
    }

    /// 至少一个服务在运行
    pub async fn is_running(&self) -> BenchResult<bool> {
        Ok(any_running(&self.service_statuses().await?))
    }

    pub async fn is_service_running(&self, service: &str) -> BenchResult<bool> {
        Ok(self
            .service_statuses()
            .await?
            .get(service)
            .map(|s| s.is_running())
            .unwrap_or(false))
    }

    /// 启动服务组，描述文件不存在时返回 false
    pub async fn start(&self, force_recreate: bool) -> BenchResult<bool> {
        if !self.exists() {
            warn!(bench = %self.bench, group = %self.kind, "Compose file not found, skipping start");
            return Ok(false);
        }
        info!(bench = %self.bench, group = %self.kind, force_recreate, "Starting services");
        self.runtime.up(&self.compose_path, force_recreate).await?;
        info!(bench = %self.bench, group = %self.kind, "Started services");
        Ok(true)
    }

    /// 停止服务组，`services` 为空时停止全部
    pub async fn stop(&self, services: &[String]) -> BenchResult<bool> {
        if !self.exists() {
            return Ok(false);
        }
        info!(bench = %self.bench, group = %self.kind, "Stopping services");
        self.runtime.stop(&self.compose_path, services).await?;
        info!(bench = %self.bench, group = %self.kind, "Stopped services");
        Ok(true)
    }

    /// 销毁容器、孤儿容器与卷
    pub async fn teardown(&self) -> BenchResult<TeardownOutcome> {
        if !self.exists() {
            warn!(
                bench = %self.bench,
                group = %self.kind,
                "Compose file not found, skipping containers removal"
            );
            return Ok(TeardownOutcome::Skipped);
        }
        info!(bench = %self.bench, group = %self.kind, "Removing containers");
        self.runtime.down(&self.compose_path, true, true).await?;
        info!(bench = %self.bench, group = %self.kind, "Removed containers");
        Ok(TeardownOutcome::Removed)
    }

    pub async fn exec(
        &self,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> BenchResult<ExecOutput> {
        Ok(self
            .runtime
            .exec(&self.compose_path, service, command, options)
            .await?)
    }

    pub async fn exec_stream(
        &self,
        service: &str,
        command: &str,
        options: &ExecOptions,
    ) -> BenchResult<LineStream> {
        Ok(self
            .runtime
            .exec_stream(&self.compose_path, service, command, options)
            .await?)
    }

    pub async fn logs(&self, service: &str, follow: bool) -> BenchResult<LineStream> {
        Ok(self.runtime.logs(&self.compose_path, service, follow).await?)
    }

    /// 交互式进入服务，返回 shell 的退出码
    pub async fn exec_interactive(
        &self,
        service: &str,
        program: &str,
        options: &ExecOptions,
    ) -> BenchResult<i32> {
        Ok(self
            .runtime
            .exec_interactive(&self.compose_path, service, program, options)
            .await?)
    }
}

/// 转发流式输出到日志，返回退出码
pub async fn forward_lines(bench: &str, mut stream: LineStream) -> BenchResult<i32> {
    while let Some(line) = stream.next_line().await {
        info!(bench = %bench, stream = %line.stream, "{}", line.content);
    }
    Ok(stream.finish().await?)
}
