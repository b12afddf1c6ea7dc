//! 就绪检测
//!
//! 两种等待方式：
//! - 有界 HTTP 探测：固定次数、固定间隔，任何传输错误都重试
//! - 日志哨兵：跟随主服务日志直到出现进程管理器启动的标志行，
//!   由超时与取消令牌约束

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::error::{BenchError, BenchResult};
use crate::infra::command::LineStream;
use crate::infra::compose::{ComposeRuntime, ExecOptions, RuntimeError};

/// 单次探测错误
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("HTTP probe failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Probe command exited with code {0}")]
    ExitCode(i32),

    #[error("No HTTP status line in probe output")]
    NoStatus,
}

/// 一次探测，返回 HTTP 状态码
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self) -> Result<u16, ProbeError>;
}

/// 在主服务容器内用 curl 探测
pub struct ComposeExecProbe {
    runtime: Arc<dyn ComposeRuntime>,
    compose_path: PathBuf,
    service: String,
    /// prod 环境需要带 Host 头
    host: Option<String>,
    max_time_secs: u64,
}

impl ComposeExecProbe {
    pub fn new(
        runtime: Arc<dyn ComposeRuntime>,
        compose_path: PathBuf,
        service: impl Into<String>,
        host: Option<String>,
    ) -> Self {
        Self {
            runtime,
            compose_path,
            service: service.into(),
            host,
            max_time_secs: 60,
        }
    }

    fn command(&self) -> String {
        let headers = self
            .host
            .as_ref()
            .map(|h| format!(" -H 'Host: {}'", h))
            .unwrap_or_default();
        format!(
            "curl -I --max-time {t} --connect-timeout {t}{headers} http://localhost",
            t = self.max_time_secs,
            headers = headers
        )
    }
}

#[async_trait]
impl ProbeTransport for ComposeExecProbe {
    async fn probe(&self) -> Result<u16, ProbeError> {
        let output = self
            .runtime
            .exec(&self.compose_path, &self.service, &self.command(), &ExecOptions::default())
            .await?;
        if !output.success() {
            return Err(ProbeError::ExitCode(output.exit_code));
        }
        parse_status_line(&output.stdout).ok_or(ProbeError::NoStatus)
    }
}

/// 从宿主机直接发起 HTTP 请求
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    host: Option<String>,
}

impl HttpProbe {
    pub fn new(
        url: impl Into<String>,
        host: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            host,
        })
    }
}

#[async_trait]
impl ProbeTransport for HttpProbe {
    async fn probe(&self) -> Result<u16, ProbeError> {
        let mut request = self.client.head(&self.url);
        if let Some(host) = &self.host {
            request = request.header(reqwest::header::HOST, host);
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

/// `HTTP/1.1 200 OK` -> 200
fn parse_status_line(output: &str) -> Option<u16> {
    output
        .lines()
        .find(|l| l.trim_start().starts_with("HTTP/"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
}

/// 有界就绪探测
pub struct ReadinessProbe {
    config: ProbeConfig,
    cancel: CancellationToken,
}

impl ReadinessProbe {
    pub fn new(config: ProbeConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// 探测直到收到成功状态或次数耗尽
    ///
    /// 返回值只有“已确认可用”与“重试耗尽”两种，间隔只发生在两次尝试之间
    pub async fn wait_until_ready(&self, transport: &dyn ProbeTransport) -> BenchResult<bool> {
        let attempts = self.config.attempts.max(1);

        for attempt in 1..=attempts {
            match transport.probe().await {
                Ok(status) if (200..300).contains(&status) => {
                    info!(attempt, status, "Site is active and responding");
                    return Ok(true);
                }
                Ok(status) => debug!(attempt, status, "Site not ready yet"),
                Err(e) => debug!(attempt, error = %e, "Probe attempt failed"),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(BenchError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        warn!(attempts, "Site did not become ready");
        Ok(false)
    }
}

enum LogEvent {
    Line(String),
    Ended,
    TimedOut,
    Cancelled,
}

/// 跟随日志直到出现哨兵行（忽略大小写）
///
/// 流提前结束视为进程已退出日志跟随，记录告警后继续；
/// 超时或取消时终止日志进程，服务组保持现状
pub async fn wait_for_sentinel(
    bench: &str,
    mut stream: LineStream,
    sentinel: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> BenchResult<()> {
    let sentinel = sentinel.to_lowercase();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => LogEvent::Cancelled,
            _ = &mut deadline => LogEvent::TimedOut,
            line = stream.next_line() => match line {
                Some(line) => LogEvent::Line(line.content),
                None => LogEvent::Ended,
            },
        };

        match event {
            LogEvent::Line(content) => {
                let lower = content.to_lowercase();
                // git checkout 进度行
                if lower.contains("updating files:") {
                    continue;
                }
                info!(bench = %bench, "{}", content);
                if lower.contains(&sentinel) {
                    stream.kill().await;
                    return Ok(());
                }
            }
            LogEvent::Ended => {
                warn!(bench = %bench, "Log stream ended before the supervisor reported start");
                return Ok(());
            }
            LogEvent::TimedOut => {
                stream.kill().await;
                return Err(BenchError::SupervisorWaitTimedOut {
                    bench: bench.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            LogEvent::Cancelled => {
                stream.kill().await;
                return Err(BenchError::Cancelled);
            }
        }
    }
}
