//! 统一错误处理
//!
//! `BenchError` 是核心对外暴露的唯一错误类型，基础设施层错误通过 `#[from]` 转换

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::infra::command::CommandError;
use crate::infra::compose::RuntimeError;
use crate::infra::compose_file::DescriptorError;
use crate::services::certificate::CertificateError;
use crate::services::readiness::ProbeError;

/// Bench 操作错误
#[derive(Debug, Error)]
pub enum BenchError {
    // 前置条件
    #[error("Bench {0} is not running")]
    NotRunning(String),

    #[error("Service '{service}' of bench {bench} is not running")]
    ServiceNotRunning { bench: String, service: String },

    #[error("SSL certificate for {0} is already issued")]
    SslCertificateAlreadyIssued(String),

    #[error("SSL certificate for {0} is not issued")]
    SslCertificateNotIssued(String),

    #[error("Compose file not found: {0}")]
    DescriptorMissing(PathBuf),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("`code` binary not found in PATH")]
    CodeBinaryNotFound,

    // 重试耗尽 / 等待中断
    #[error("Bench {0} is not responding after all probe attempts")]
    SiteInactive(String),

    #[error("Timed out after {secs}s waiting for the supervisor of {bench}")]
    SupervisorWaitTimedOut { bench: String, secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // 配置重新生成
    #[error("Failed to generate workers supervisor config for {bench}, restore the backup with `sync-workers --rollback`")]
    WorkersSupervisorConfigGenerate { bench: String },

    // 文件系统
    #[error("Failed to remove directory {path} of bench {bench}")]
    RemoveDirectory { bench: String, path: PathBuf },

    #[error("Failed to attach to bench {0}")]
    AttachFailed(String),

    #[error("Failed to restart the application server of {0}")]
    ServerRestartFailed(String),

    // 协作方错误
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Config(ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// 是否为可由用户直接处理的前置条件错误
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BenchError::NotRunning(_)
                | BenchError::ServiceNotRunning { .. }
                | BenchError::SslCertificateAlreadyIssued(_)
                | BenchError::SslCertificateNotIssued(_)
                | BenchError::DescriptorMissing(_)
                | BenchError::ConfigNotFound(_)
                | BenchError::CodeBinaryNotFound
        )
    }
}

impl From<ConfigError> for BenchError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(path) => BenchError::ConfigNotFound(path),
            other => BenchError::Config(other),
        }
    }
}

impl From<CommandError> for BenchError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Cancelled => BenchError::Cancelled,
            other => BenchError::Runtime(RuntimeError::Command(other)),
        }
    }
}

/// 便捷类型别名
pub type BenchResult<T> = Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_not_found_maps_to_precondition() {
        let err: BenchError = ConfigError::NotFound(PathBuf::from("/x/bench_config.toml")).into();
        assert!(matches!(err, BenchError::ConfigNotFound(_)));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_cancelled_command_maps_to_cancelled() {
        let err: BenchError = CommandError::Cancelled.into();
        assert!(matches!(err, BenchError::Cancelled));
        assert!(!err.is_precondition());

        let err: BenchError = CommandError::Timeout.into();
        assert!(matches!(err, BenchError::Runtime(_)));
    }

    #[test]
    fn test_error_messages_name_the_bench() {
        let err = BenchError::ServiceNotRunning {
            bench: "shop.localhost".to_string(),
            service: "nginx".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Service 'nginx' of bench shop.localhost is not running"
        );
    }
}
