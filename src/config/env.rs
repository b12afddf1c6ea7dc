//! 环境变量配置加载

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use constants::{DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_INTERVAL_MS, DEFAULT_SUPERVISOR_WAIT_SECS};

/// 就绪探测方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeMode {
    /// 在主服务容器内执行 curl
    Exec,
    /// 从宿主机直接发起 HTTP 请求
    Http,
}

impl ProbeMode {
    pub fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "http" => ProbeMode::Http,
            "exec" => ProbeMode::Exec,
            other => {
                warn!(mode = %other, "Unknown probe mode, falling back to exec");
                ProbeMode::Exec
            }
        }
    }
}

/// 就绪探测配置
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// 最大尝试次数
    pub attempts: u32,
    /// 两次尝试之间的间隔
    pub interval: Duration,
    pub mode: ProbeMode,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROBE_ATTEMPTS,
            interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            mode: ProbeMode::Exec,
        }
    }
}

/// 进程级配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 根目录
    pub home: PathBuf,
    /// 所有 bench 所在目录
    pub benches_root: PathBuf,
    /// 全局共享服务（数据库/反向代理）目录
    pub services_root: PathBuf,
    /// 日志目录
    pub logs_dir: PathBuf,
    pub probe: ProbeConfig,
    /// 等待进程管理器启动日志的上限
    pub supervisor_wait: Duration,
    /// 外部证书工具
    pub cert_command: Option<String>,
    pub uid: u32,
    pub gid: u32,
}

impl EnvConfig {
    /// 以指定根目录构造默认配置
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            benches_root: home.join("sites"),
            services_root: home.join("services"),
            logs_dir: home.join("logs"),
            home,
            probe: ProbeConfig::default(),
            supervisor_wait: Duration::from_secs(DEFAULT_SUPERVISOR_WAIT_SECS),
            cert_command: None,
            uid: 1000,
            gid: 1000,
        }
    }

    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let home = env::var("BENCH_MANAGER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home());

        let mut config = Self::with_home(home);

        config.probe.attempts = parse_env("BENCH_PROBE_ATTEMPTS").unwrap_or(DEFAULT_PROBE_ATTEMPTS);
        config.probe.interval = Duration::from_millis(
            parse_env("BENCH_PROBE_INTERVAL_MS").unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
        );
        config.probe.mode = env::var("BENCH_PROBE_MODE")
            .map(|v| ProbeMode::from_str(&v))
            .unwrap_or(ProbeMode::Exec);

        config.supervisor_wait = Duration::from_secs(
            parse_env("BENCH_SUPERVISOR_WAIT_SECS").unwrap_or(DEFAULT_SUPERVISOR_WAIT_SECS),
        );

        config.cert_command = env::var("BENCH_CERT_COMMAND").ok().filter(|s| !s.is_empty());

        config.uid = parse_env("BENCH_UID").unwrap_or(1000);
        config.gid = parse_env("BENCH_GID").unwrap_or(1000);

        if config.probe.attempts == 0 {
            warn!("BENCH_PROBE_ATTEMPTS=0 would never probe, using 1");
            config.probe.attempts = 1;
        }

        config
    }

    /// bench 目录
    pub fn bench_path(&self, bench_name: &str) -> PathBuf {
        self.benches_root.join(bench_name)
    }

    /// 日志文件路径
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join(constants::LOG_FILE_NAME)
    }
}

fn default_home() -> PathBuf {
    env::var("HOME")
        .map(|h| Path::new(&h).join("bench-manager"))
        .unwrap_or_else(|_| PathBuf::from("/opt/bench-manager"))
}

/// 读取并解析环境变量，解析失败时告警并返回 None
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// 常量
pub mod constants {
    /// 版本号（同时作为描述文件的版本戳）
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// bench 配置文件名
    pub const BENCH_CONFIG_FILE_NAME: &str = "bench_config.toml";

    /// 日志文件名
    pub const LOG_FILE_NAME: &str = "bench-manager.log";

    /// 本地顶级域
    pub const LOCAL_TLD: &str = "localhost";

    /// 主服务名
    pub const PRIMARY_SERVICE: &str = "frappe";

    /// 反向代理服务名
    pub const PROXY_SERVICE: &str = "nginx";

    /// 进程管理器启动完成的日志标记
    pub const SUPERVISOR_STARTED_SENTINEL: &str = "INFO supervisord started with pid";

    /// 拆分后的 supervisor 配置文件后缀
    pub const SPLIT_CONF_SUFFIX: &str = ".fm.supervisor.conf";

    /// worker 的 supervisor 配置文件后缀
    pub const WORKERS_CONF_SUFFIX: &str = ".workers.fm.supervisor.conf";

    pub const DEFAULT_PROBE_ATTEMPTS: u32 = 60;

    pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;

    /// 15 分钟
    pub const DEFAULT_SUPERVISOR_WAIT_SECS: u64 = 900;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_home_layout() {
        let config = EnvConfig::with_home("/tmp/bm");
        assert_eq!(config.benches_root, PathBuf::from("/tmp/bm/sites"));
        assert_eq!(config.services_root, PathBuf::from("/tmp/bm/services"));
        assert_eq!(
            config.bench_path("shop.localhost"),
            PathBuf::from("/tmp/bm/sites/shop.localhost")
        );
        assert_eq!(config.log_file(), PathBuf::from("/tmp/bm/logs/bench-manager.log"));
        assert_eq!(config.probe.attempts, 60);
        assert_eq!(config.probe.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_env() {
        env::set_var("BENCH_TEST_PARSE_OK", "42");
        env::set_var("BENCH_TEST_PARSE_BAD", "forty-two");

        assert_eq!(parse_env::<u32>("BENCH_TEST_PARSE_OK"), Some(42));
        assert_eq!(parse_env::<u32>("BENCH_TEST_PARSE_BAD"), None);
        assert_eq!(parse_env::<u32>("BENCH_TEST_PARSE_MISSING"), None);

        env::remove_var("BENCH_TEST_PARSE_OK");
        env::remove_var("BENCH_TEST_PARSE_BAD");
    }

    #[test]
    fn test_probe_mode_from_str() {
        assert_eq!(ProbeMode::from_str("HTTP"), ProbeMode::Http);
        assert_eq!(ProbeMode::from_str("exec"), ProbeMode::Exec);
        assert_eq!(ProbeMode::from_str("carrier-pigeon"), ProbeMode::Exec);
    }
}
