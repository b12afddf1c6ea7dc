//! Bench 生命周期相关领域模型

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 创建流程状态
///
/// 每个状态只有一个后继状态，`Failed` 记录出错时所处的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationState {
    Absent,
    DirectoryCreated,
    DescriptorGenerated,
    PrimaryStarted,
    ApplicationMaterialized,
    SiteActive,
    SecretsPurged,
    CertificateIssued,
    AdminToolsConfigured,
    InfoReported,
}

impl CreationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationState::Absent => "absent",
            CreationState::DirectoryCreated => "directory_created",
            CreationState::DescriptorGenerated => "descriptor_generated",
            CreationState::PrimaryStarted => "primary_started",
            CreationState::ApplicationMaterialized => "application_materialized",
            CreationState::SiteActive => "site_active",
            CreationState::SecretsPurged => "secrets_purged",
            CreationState::CertificateIssued => "certificate_issued",
            CreationState::AdminToolsConfigured => "admin_tools_configured",
            CreationState::InfoReported => "info_reported",
        }
    }

    /// 下一个状态，终态返回 None
    pub fn next(&self) -> Option<CreationState> {
        use CreationState::*;
        match self {
            Absent => Some(DirectoryCreated),
            DirectoryCreated => Some(DescriptorGenerated),
            DescriptorGenerated => Some(PrimaryStarted),
            PrimaryStarted => Some(ApplicationMaterialized),
            ApplicationMaterialized => Some(SiteActive),
            SiteActive => Some(SecretsPurged),
            SecretsPurged => Some(CertificateIssued),
            CertificateIssued => Some(AdminToolsConfigured),
            AdminToolsConfigured => Some(InfoReported),
            InfoReported => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

impl std::fmt::Display for CreationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤状态
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

/// 单个步骤的执行记录
#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    /// 执行该步骤后到达的状态
    pub target: CreationState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: StepStatus,
    pub message: Option<String>,
}

impl StepRecord {
    pub fn start(target: CreationState) -> Self {
        Self {
            target,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            status: StepStatus::Running,
            message: None,
        }
    }

    pub fn finish(&mut self, status: StepStatus, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.status = status;
        self.message = message;
    }
}

/// 命令输出的一行
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_state_chain_reaches_terminal() {
        let mut state = CreationState::Absent;
        let mut steps = 0;
        while let Some(next) = state.next() {
            state = next;
            steps += 1;
        }
        assert_eq!(state, CreationState::InfoReported);
        assert!(state.is_terminal());
        assert_eq!(steps, 9);
    }

    #[test]
    fn test_step_record_finish() {
        let mut step = StepRecord::start(CreationState::DirectoryCreated);
        assert_eq!(step.status, StepStatus::Running);

        step.finish(StepStatus::Success, None);
        assert_eq!(step.status, StepStatus::Success);
        assert!(step.finished_at.is_some());
        assert!(step.duration_ms.is_some());
    }
}
