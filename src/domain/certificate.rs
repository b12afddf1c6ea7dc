//! SSL 证书描述

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 证书类型
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslType {
    /// 未启用 HTTPS
    #[default]
    None,
    /// 由外部签发（Let's Encrypt）
    #[serde(alias = "le")]
    LetsEncrypt,
}

impl SslType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslType::None => "none",
            SslType::LetsEncrypt => "letsencrypt",
        }
    }
}

impl std::fmt::Display for SslType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 证书描述（持久化在 bench 配置中）
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SslCertificate {
    pub domain: String,
    #[serde(default)]
    pub ssl_type: SslType,
    /// 签发通知邮箱
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SslCertificate {
    pub fn new(domain: impl Into<String>, ssl_type: SslType) -> Self {
        Self {
            domain: domain.into(),
            ssl_type,
            email: None,
        }
    }

    /// 未启用 HTTPS 的描述
    pub fn none(domain: impl Into<String>) -> Self {
        Self::new(domain, SslType::None)
    }

    pub fn is_none(&self) -> bool {
        self.ssl_type == SslType::None
    }
}

/// 格式化证书剩余有效期
pub fn format_time_remaining(expiry: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = expiry - now;
    if remaining.num_seconds() <= 0 {
        return "expired".to_string();
    }
    match remaining.num_days() {
        0 => format!("{} hours left", remaining.num_hours()),
        1 => "1 day left".to_string(),
        days => format!("{} days left", days),
    }
}
