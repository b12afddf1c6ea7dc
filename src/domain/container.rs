//! 容器（compose 服务）状态模型

use serde::Serialize;
use std::collections::BTreeMap;

/// 服务运行状态
///
/// 取自 `docker compose ps` 的 `State` 字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Created,
    Restarting,
    Paused,
    Exited,
    Dead,
    Unknown(String),
}

impl ServiceState {
    pub fn parse(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "running" => ServiceState::Running,
            "created" => ServiceState::Created,
            "restarting" => ServiceState::Restarting,
            "paused" => ServiceState::Paused,
            "exited" => ServiceState::Exited,
            "dead" => ServiceState::Dead,
            other => ServiceState::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Created => "created",
            ServiceState::Restarting => "restarting",
            ServiceState::Paused => "paused",
            ServiceState::Exited => "exited",
            ServiceState::Dead => "dead",
            ServiceState::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务名 -> 状态
pub type ServiceStatuses = BTreeMap<String, ServiceState>;

/// 是否至少有一个服务在运行
pub fn any_running(statuses: &ServiceStatuses) -> bool {
    statuses.values().any(ServiceState::is_running)
}
