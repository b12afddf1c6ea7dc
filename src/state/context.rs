//! 进程级上下文
//!
//! 共享服务、运行时与证书后端在进程内只构造一次，由每个 Bench 持有同一份引用

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EnvConfig;
use crate::infra::compose::{ComposeRuntime, DockerComposeRuntime};
use crate::services::certificate::{CertificateBackend, CommandCertificateBackend};
use crate::services::prompt::Prompt;
use crate::services::registry::{ComposeServicesRegistry, ServicesRegistry};

/// 全局 shutdown token，Ctrl-C 时取消
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

/// Bench 操作所需的协作方
pub struct BenchContext {
    pub settings: EnvConfig,
    pub runtime: Arc<dyn ComposeRuntime>,
    pub services: Arc<dyn ServicesRegistry>,
    pub certificates: Arc<dyn CertificateBackend>,
    pub prompt: Arc<dyn Prompt>,
    pub cancel: CancellationToken,
}

impl BenchContext {
    /// 默认协作方：docker compose CLI、共享服务数据库、外部证书工具
    pub async fn from_settings(settings: EnvConfig, prompt: Arc<dyn Prompt>) -> Self {
        let runtime: Arc<dyn ComposeRuntime> = Arc::new(DockerComposeRuntime::detect().await);
        let services =
            Arc::new(ComposeServicesRegistry::load(runtime.clone(), &settings.services_root).await);
        let certificates = Arc::new(CommandCertificateBackend::new(settings.cert_command.clone()));

        Self {
            settings,
            runtime,
            services,
            certificates,
            prompt,
            cancel: get_shutdown_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_token_is_shared() {
        let a = get_shutdown_token();
        let b = get_shutdown_token();
        assert!(!a.is_cancelled());
        trigger_shutdown();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
