//! SSL 证书生命周期
//!
//! 期望模式与当前状态决定动作：
//! - 未签发 + 请求签发 -> 签发
//! - 已签发 + 请求签发 -> 拒绝（already issued）
//! - 已签发 + 请求 none -> 吊销并重置为 none
//! - 未签发 + 请求 none -> 拒绝（not issued）
//!
//! 签发本身交给 `CertificateBackend`，默认实现调用外部证书工具

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{SslCertificate, SslType};
use crate::error::{BenchError, BenchResult};
use crate::infra::command::{CommandError, CommandRunner};

const CERT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 证书后端错误
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate backend is not configured (set BENCH_CERT_COMMAND)")]
    NotConfigured,

    #[error("Certificate `{action}` failed for {domain} (exit code {code}): {stderr}")]
    CommandFailed {
        action: String,
        domain: String,
        code: i32,
        stderr: String,
    },

    #[error("Certificate command failed: {0}")]
    Command(#[from] CommandError),

    #[error("Invalid certificate expiry '{0}'")]
    InvalidExpiry(String),
}

/// 证书后端
#[async_trait]
pub trait CertificateBackend: Send + Sync {
    /// 签发证书，`webroot` 为 HTTP-01 校验目录
    async fn issue(&self, certificate: &SslCertificate, webroot: &Path)
        -> Result<(), CertificateError>;

    async fn renew(&self, certificate: &SslCertificate) -> Result<(), CertificateError>;

    async fn revoke(&self, certificate: &SslCertificate) -> Result<(), CertificateError>;

    async fn has_certificate(&self, domain: &str) -> bool;

    async fn expiry(&self, domain: &str) -> Result<DateTime<Utc>, CertificateError>;
}

/// 证书状态机要求的动作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateAction {
    Issue,
    Revoke,
}

/// 根据当前状态与请求模式决定动作
pub fn plan_certificate_action(
    bench: &str,
    has_certificate: bool,
    requested: SslType,
) -> BenchResult<CertificateAction> {
    match (has_certificate, requested) {
        (false, SslType::LetsEncrypt) => Ok(CertificateAction::Issue),
        (true, SslType::LetsEncrypt) => {
            Err(BenchError::SslCertificateAlreadyIssued(bench.to_string()))
        }
        (true, SslType::None) => Ok(CertificateAction::Revoke),
        (false, SslType::None) => Err(BenchError::SslCertificateNotIssued(bench.to_string())),
    }
}

/// 证书生命周期
///
/// 只负责执行动作并修改证书描述，持久化由调用方完成
#[derive(Clone)]
pub struct CertificateLifecycle {
    backend: Arc<dyn CertificateBackend>,
    bench: String,
    webroot: PathBuf,
}

impl CertificateLifecycle {
    pub fn new(backend: Arc<dyn CertificateBackend>, bench: impl Into<String>, webroot: PathBuf) -> Self {
        Self {
            backend,
            bench: bench.into(),
            webroot,
        }
    }

    pub async fn has_certificate(&self, current: &SslCertificate) -> bool {
        !current.is_none() && self.backend.has_certificate(&current.domain).await
    }

    /// 按描述签发（描述为 none 时跳过）
    pub async fn generate(&self, current: &SslCertificate) -> BenchResult<()> {
        if current.is_none() {
            info!(bench = %self.bench, "HTTPS not requested, skipping certificate");
            return Ok(());
        }
        info!(bench = %self.bench, domain = %current.domain, "Issuing certificate");
        self.backend.issue(current, &self.webroot).await?;
        info!(bench = %self.bench, "Certificate issued");
        Ok(())
    }

    /// 切换到请求的证书模式，成功后 `current` 为新的描述
    pub async fn update(
        &self,
        current: &mut SslCertificate,
        requested: SslCertificate,
    ) -> BenchResult<()> {
        let has = self.has_certificate(current).await;
        match plan_certificate_action(&self.bench, has, requested.ssl_type)? {
            CertificateAction::Issue => {
                self.backend.issue(&requested, &self.webroot).await?;
                *current = requested;
            }
            CertificateAction::Revoke => self.remove(current).await?,
        }
        Ok(())
    }

    /// 吊销并重置为 none
    pub async fn remove(&self, current: &mut SslCertificate) -> BenchResult<()> {
        if !self.has_certificate(current).await {
            return Err(BenchError::SslCertificateNotIssued(self.bench.clone()));
        }
        self.backend.revoke(current).await?;
        *current = SslCertificate::none(self.bench.clone());
        info!(bench = %self.bench, "Certificate removed");
        Ok(())
    }

    /// 续期：代理服务必须在运行，且证书已存在
    pub async fn renew(&self, current: &SslCertificate, proxy_running: bool) -> BenchResult<()> {
        if !proxy_running {
            return Err(BenchError::ServiceNotRunning {
                bench: self.bench.clone(),
                service: crate::config::env::constants::PROXY_SERVICE.to_string(),
            });
        }
        if !self.has_certificate(current).await {
            return Err(BenchError::SslCertificateNotIssued(self.bench.clone()));
        }
        self.backend.renew(current).await?;
        info!(bench = %self.bench, "Certificate renewed");
        Ok(())
    }

    pub async fn expiry(&self, current: &SslCertificate) -> Option<DateTime<Utc>> {
        match self.backend.expiry(&current.domain).await {
            Ok(expiry) => Some(expiry),
            Err(e) => {
                warn!(bench = %self.bench, error = %e, "Failed to read certificate expiry");
                None
            }
        }
    }
}

/// 调用外部证书工具：`<command> <issue|renew|revoke|expiry> <domain> [webroot] [email]`
#[derive(Clone, Debug)]
pub struct CommandCertificateBackend {
    command: Option<String>,
}

impl CommandCertificateBackend {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    async fn run(&self, action: &str, domain: &str, extra: &[String]) -> Result<String, CertificateError> {
        let program = self.command.as_deref().ok_or(CertificateError::NotConfigured)?;
        let mut args = vec![action.to_string(), domain.to_string()];
        args.extend(extra.iter().cloned());

        let output = CommandRunner::run_simple(program, &args, None, CERT_COMMAND_TIMEOUT).await?;
        if !output.status.success() {
            return Err(CertificateError::CommandFailed {
                action: action.to_string(),
                domain: domain.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl CertificateBackend for CommandCertificateBackend {
    async fn issue(
        &self,
        certificate: &SslCertificate,
        webroot: &Path,
    ) -> Result<(), CertificateError> {
        let mut extra = vec![webroot.display().to_string()];
        if let Some(email) = &certificate.email {
            extra.push(email.clone());
        }
        self.run("issue", &certificate.domain, &extra).await?;
        Ok(())
    }

    async fn renew(&self, certificate: &SslCertificate) -> Result<(), CertificateError> {
        self.run("renew", &certificate.domain, &[]).await?;
        Ok(())
    }

    async fn revoke(&self, certificate: &SslCertificate) -> Result<(), CertificateError> {
        self.run("revoke", &certificate.domain, &[]).await?;
        Ok(())
    }

    async fn has_certificate(&self, domain: &str) -> bool {
        self.expiry(domain).await.is_ok()
    }

    async fn expiry(&self, domain: &str) -> Result<DateTime<Utc>, CertificateError> {
        let raw = self.run("expiry", domain, &[]).await?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| CertificateError::InvalidExpiry(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCertificates;

    fn lifecycle(fake: &Arc<FakeCertificates>) -> CertificateLifecycle {
        CertificateLifecycle::new(fake.clone(), "shop.localhost", PathBuf::from("/tmp/html"))
    }

    #[test]
    fn test_action_table() {
        use CertificateAction::*;
        assert_eq!(plan_certificate_action("b", false, SslType::LetsEncrypt).unwrap(), Issue);
        assert_eq!(plan_certificate_action("b", true, SslType::None).unwrap(), Revoke);
        assert!(matches!(
            plan_certificate_action("b", true, SslType::LetsEncrypt),
            Err(BenchError::SslCertificateAlreadyIssued(_))
        ));
        assert!(matches!(
            plan_certificate_action("b", false, SslType::None),
            Err(BenchError::SslCertificateNotIssued(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_twice_is_rejected_and_none_resets() {
        let fake = Arc::new(FakeCertificates::default());
        let lifecycle = lifecycle(&fake);
        let mut current = SslCertificate::none("shop.localhost");
        let requested = SslCertificate::new("shop.localhost", SslType::LetsEncrypt);

        lifecycle.update(&mut current, requested.clone()).await.unwrap();
        assert!(lifecycle.has_certificate(&current).await);
        assert_eq!(current.ssl_type, SslType::LetsEncrypt);

        let err = lifecycle.update(&mut current, requested).await.unwrap_err();
        assert!(matches!(err, BenchError::SslCertificateAlreadyIssued(_)));
        assert_eq!(fake.issued_count(), 1);

        lifecycle
            .update(&mut current, SslCertificate::none("shop.localhost"))
            .await
            .unwrap();
        assert!(!lifecycle.has_certificate(&current).await);
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn test_renew_preconditions() {
        let fake = Arc::new(FakeCertificates::default());
        let lifecycle = lifecycle(&fake);
        let current = SslCertificate::new("shop.localhost", SslType::LetsEncrypt);

        let err = lifecycle.renew(&current, false).await.unwrap_err();
        assert!(matches!(err, BenchError::ServiceNotRunning { ref service, .. } if service == "nginx"));

        let err = lifecycle.renew(&current, true).await.unwrap_err();
        assert!(matches!(err, BenchError::SslCertificateNotIssued(_)));

        fake.insert("shop.localhost");
        lifecycle.renew(&current, true).await.unwrap();
        assert_eq!(fake.renewed_count(), 1);
    }

    #[tokio::test]
    async fn test_command_backend_not_configured() {
        let backend = CommandCertificateBackend::new(None);
        assert!(!backend.has_certificate("shop.localhost").await);
        assert!(matches!(
            backend.renew(&SslCertificate::none("shop.localhost")).await,
            Err(CertificateError::NotConfigured)
        ));
    }
}
