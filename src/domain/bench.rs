//! Bench 标识相关领域模型

use serde::{Deserialize, Serialize};

use crate::config::env::constants::LOCAL_TLD;

/// 运行环境类型
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    #[default]
    Dev,
    Prod,
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Dev => "dev",
            EnvironmentType::Prod => "prod",
        }
    }

    /// 解析字符串，未知值返回 None
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dev" => Some(EnvironmentType::Dev),
            "prod" => Some(EnvironmentType::Prod),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 域名层级（即名称中 `.` 的数量）
pub fn domain_level(name: &str) -> usize {
    name.matches('.').count()
}

/// 规范化 bench 名称
///
/// 不带点的名称自动追加本地顶级域，如 `shop` -> `shop.localhost`
pub fn normalize_bench_name(name: &str) -> String {
    let name = name.trim().trim_end_matches('.');
    if domain_level(name) == 0 {
        format!("{}.{}", name, LOCAL_TLD)
    } else {
        name.to_string()
    }
}

/// 容器名前缀
///
/// 去掉本地顶级域后，剩余的点替换为下划线
pub fn container_name_prefix(bench_name: &str) -> String {
    let local_suffix = format!(".{}", LOCAL_TLD);
    let base = bench_name.strip_suffix(&local_suffix).unwrap_or(bench_name);
    base.replace('.', "_")
}

/// 是否为本地域名（无需修改 hosts 文件即可访问）
pub fn is_local_domain(bench_name: &str) -> bool {
    bench_name.ends_with(&format!(".{}", LOCAL_TLD))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bench_name() {
        assert_eq!(normalize_bench_name("shop"), "shop.localhost");
        assert_eq!(normalize_bench_name("shop.localhost"), "shop.localhost");
        assert_eq!(normalize_bench_name("erp.example.com"), "erp.example.com");
        assert_eq!(normalize_bench_name(" shop. "), "shop.localhost");
    }

    #[test]
    fn test_container_name_prefix() {
        assert_eq!(container_name_prefix("shop.localhost"), "shop");
        assert_eq!(container_name_prefix("erp.example.com"), "erp_example_com");
    }

    #[test]
    fn test_environment_type_parse() {
        assert_eq!(EnvironmentType::parse("PROD"), Some(EnvironmentType::Prod));
        assert_eq!(EnvironmentType::parse("dev"), Some(EnvironmentType::Dev));
        assert_eq!(EnvironmentType::parse("staging"), None);
        assert!(!is_local_domain("erp.example.com"));
        assert!(is_local_domain("shop.localhost"));
    }
}
