//! Bench 创建流程
//!
//! 显式状态机：每个状态只有一个后继，每次转移由一个处理函数完成。
//! 任一转移失败时流程中止，若目录已创建则询问是否删除

use tokio::fs;
use tracing::{error, info, warn};

use crate::domain::bench::is_local_domain;
use crate::domain::{CreationState, StepRecord, StepStatus};
use crate::error::{BenchError, BenchResult};

use super::bench::{Bench, BenchInfo};

/// 创建选项
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    /// 模板 bench：只生成描述文件与目录，不启动
    pub template: bool,
}

/// 创建结果
#[derive(Debug)]
pub enum CreationOutcome {
    Created(Box<BenchInfo>),
    Template,
    Failed {
        /// 出错时所处的状态
        at: CreationState,
        error: BenchError,
        /// 是否已删除残留
        removed: bool,
    },
}

impl CreationOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, CreationOutcome::Created(_))
    }
}

/// 创建报告
#[derive(Debug)]
pub struct CreationReport {
    pub outcome: CreationOutcome,
    pub steps: Vec<StepRecord>,
}

/// 创建流水线
pub struct CreationPipeline<'a> {
    bench: &'a mut Bench,
    options: CreateOptions,
    state: CreationState,
    steps: Vec<StepRecord>,
    info: Option<BenchInfo>,
}

impl<'a> CreationPipeline<'a> {
    pub fn new(bench: &'a mut Bench, options: CreateOptions) -> Self {
        Self {
            bench,
            options,
            state: CreationState::Absent,
            steps: Vec::new(),
            info: None,
        }
    }

    pub fn state(&self) -> CreationState {
        self.state
    }

    /// 依次执行全部转移
    pub async fn run(mut self) -> CreationReport {
        info!(bench = %self.bench.name(), template = self.options.template, "Creating bench");

        while let Some(target) = self.state.next() {
            let mut record = StepRecord::start(target);
            info!(bench = %self.bench.name(), step = %target, "Step started");

            match self.transition(target).await {
                Ok(()) => {
                    record.finish(StepStatus::Success, None);
                    self.steps.push(record);
                    self.state = target;
                    info!(bench = %self.bench.name(), step = %target, "Step finished");
                }
                Err(error) => {
                    record.finish(StepStatus::Failed, Some(error.to_string()));
                    self.steps.push(record);
                    return self.fail(error).await;
                }
            }

            if self.options.template && self.state == CreationState::DescriptorGenerated {
                return self.finish_template().await;
            }
        }

        let outcome = match self.info.take() {
            Some(info) => CreationOutcome::Created(Box::new(info)),
            None => CreationOutcome::Template,
        };
        CreationReport {
            outcome,
            steps: self.steps,
        }
    }

    async fn transition(&mut self, target: CreationState) -> BenchResult<()> {
        match target {
            CreationState::Absent => Ok(()),
            CreationState::DirectoryCreated => self.create_directory().await,
            CreationState::DescriptorGenerated => self.generate_descriptor().await,
            CreationState::PrimaryStarted => self.start_primary().await,
            CreationState::ApplicationMaterialized => self.materialize_application().await,
            CreationState::SiteActive => self.check_site_active().await,
            CreationState::SecretsPurged => self.bench.remove_attached_secrets().await,
            CreationState::CertificateIssued => self.bench.create_certificate().await,
            CreationState::AdminToolsConfigured => self.configure_admin_tools().await,
            CreationState::InfoReported => self.report_info().await,
        }
    }

    async fn create_directory(&mut self) -> BenchResult<()> {
        fs::create_dir_all(self.bench.path()).await?;
        Ok(())
    }

    async fn generate_descriptor(&mut self) -> BenchResult<()> {
        let inputs = self.bench.config.export_to_compose_inputs();
        self.bench.generate_compose(&inputs)?;
        self.bench.create_compose_dirs().await
    }

    async fn start_primary(&mut self) -> BenchResult<()> {
        self.bench.primary().start(true).await?;
        Ok(())
    }

    async fn materialize_application(&mut self) -> BenchResult<()> {
        self.bench.wait_for_supervisor().await?;
        self.bench.sync_workers_compose(true).await?;
        Ok(())
    }

    async fn check_site_active(&mut self) -> BenchResult<()> {
        info!(bench = %self.bench.name(), "Checking bench site status");
        if !self.bench.is_bench_created().await? {
            return Err(BenchError::SiteInactive(self.bench.name().to_string()));
        }
        info!(bench = %self.bench.name(), "Bench site is active and responding");
        Ok(())
    }

    async fn configure_admin_tools(&mut self) -> BenchResult<()> {
        if !self.bench.config.admin_tools {
            return Ok(());
        }
        self.bench.sync_admin_tools_compose().await?;
        self.bench.restart_frappe_server().await
    }

    async fn report_info(&mut self) -> BenchResult<()> {
        self.bench.save_config().await?;
        let info = self.bench.info().await?;
        info!(bench = %self.bench.name(), "Bench created\n{}", info);

        if !is_local_domain(self.bench.name()) {
            info!(
                bench = %self.bench.name(),
                "Bench name is not local, add '127.0.0.1 {}' to /etc/hosts to access it",
                self.bench.name()
            );
        }
        self.info = Some(info);
        Ok(())
    }

    async fn finish_template(mut self) -> CreationReport {
        let result = async {
            self.bench.remove_attached_secrets().await?;
            self.bench.save_config().await
        }
        .await;

        match result {
            Ok(()) => {
                info!(bench = %self.bench.name(), "Template bench created");
                CreationReport {
                    outcome: CreationOutcome::Template,
                    steps: self.steps,
                }
            }
            Err(error) => self.fail(error).await,
        }
    }

    /// 失败转移：记录日志位置，目录存在时询问是否删除
    async fn fail(mut self, error: BenchError) -> CreationReport {
        let log_file = self.bench.context().settings.log_file();
        error!(
            bench = %self.bench.name(),
            state = %self.state,
            error = %error,
            "There has been some error creating/starting the bench, see {} for details",
            log_file.display()
        );

        let mut removed = false;
        if self.bench.exists() {
            match self.bench.remove_bench(false).await {
                Ok(true) => removed = true,
                Ok(false) => match self.bench.info().await {
                    Ok(info) => info!(bench = %self.bench.name(), "Bench kept\n{}", info),
                    Err(e) => warn!(bench = %self.bench.name(), error = %e, "Bench info unavailable"),
                },
                Err(e) => error!(bench = %self.bench.name(), error = %e, "Failed to remove bench"),
            }
        }

        CreationReport {
            outcome: CreationOutcome::Failed {
                at: self.state,
                error,
                removed,
            },
            steps: self.steps,
        }
    }
}

/// 创建 bench
pub async fn create_bench(bench: &mut Bench, options: CreateOptions) -> CreationReport {
    CreationPipeline::new(bench, options).run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::testing::{Harness, ScriptedPrompt};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const NAME: &str = "shop.localhost";

    /// 预置镜像拷贝出来的 workspace
    fn seed_workspace(harness: &Harness) {
        let sites = harness
            .ctx
            .settings
            .bench_path(NAME)
            .join("workspace/frappe-bench/sites");
        std::fs::create_dir_all(sites.join(NAME)).unwrap();
        std::fs::create_dir_all(sites.parent().unwrap().join("config")).unwrap();
        std::fs::write(sites.join("common_site_config.json"), "{}").unwrap();
    }

    fn new_bench(harness: &Harness) -> Bench {
        Bench::new(harness.ctx.clone(), BenchConfig::new(NAME, "admin", PathBuf::new()))
    }

    #[tokio::test]
    async fn test_create_local_bench() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(dir.path());
        seed_workspace(&harness);
        let mut bench = new_bench(&harness);

        let report = create_bench(&mut bench, CreateOptions::default()).await;
        let info = match report.outcome {
            CreationOutcome::Created(info) => info,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let primary = bench.primary().compose_path().to_path_buf();
        let compose = bench.primary().compose_file().unwrap();
        assert_eq!(compose.get_container_names()["frappe"], "shop-frappe");
        assert!(!compose.has_secrets());

        assert_eq!(harness.runtime.forced_up_count(&primary), 1);
        assert_eq!(harness.runtime.stop_count(&primary), 1);
        assert_eq!(harness.certificates.issued_count(), 0);
        assert_eq!(info.https, "Not Enabled");
        assert!(info.admin_tools.is_none());

        assert_eq!(report.steps.len(), 9);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Success));
        assert!(bench.config.root_path.exists());
    }

    #[tokio::test]
    async fn test_create_template_bench_stops_after_descriptor() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(dir.path());
        seed_workspace(&harness);
        let mut bench = new_bench(&harness);

        let report = create_bench(&mut bench, CreateOptions { template: true }).await;
        assert!(matches!(report.outcome, CreationOutcome::Template));
        assert_eq!(report.steps.len(), 2);

        let primary = bench.primary().compose_path().to_path_buf();
        assert_eq!(harness.runtime.up_count(&primary), 0);
        assert!(!bench.primary().compose_file().unwrap().has_secrets());
        assert!(bench.config.root_path.exists());
    }

    #[tokio::test]
    async fn test_create_with_admin_tools_restarts_server() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(dir.path());
        seed_workspace(&harness);
        let mut bench = new_bench(&harness);
        bench.config.admin_tools = true;

        let report = create_bench(&mut bench, CreateOptions::default()).await;
        assert!(report.outcome.is_created());

        let admin = bench.admin_tools().group().compose_path().to_path_buf();
        assert_eq!(harness.runtime.forced_up_count(&admin), 1);
        assert!(bench.admin_tools().snippet_path().exists());
        assert!(harness
            .runtime
            .exec_commands()
            .iter()
            .any(|c| c.contains("supervisorctl") && c.contains("restart all")));
    }

    #[tokio::test]
    async fn test_regeneration_failure_removes_bench_when_confirmed() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::with_prompt(dir.path(), ScriptedPrompt::answering(&[true]));
        seed_workspace(&harness);
        harness.runtime.fail_streams_containing("bench setup supervisor");
        let mut bench = new_bench(&harness);

        let report = create_bench(&mut bench, CreateOptions::default()).await;
        match report.outcome {
            CreationOutcome::Failed { at, error, removed } => {
                assert_eq!(at, CreationState::PrimaryStarted);
                assert!(matches!(error, BenchError::WorkersSupervisorConfigGenerate { .. }));
                assert!(removed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // 失败后的删除询问必须明确回答
        assert_eq!(harness.prompt.asked()[0].1, None);
        assert!(!bench.exists());
        assert_eq!(
            harness.runtime.down_count(bench.primary().compose_path()),
            1
        );
        assert_eq!(report.steps.last().unwrap().status, StepStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_wait_timeout_keeps_bench_when_declined() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::with_prompt(dir.path(), ScriptedPrompt::answering(&[false]));
        seed_workspace(&harness);
        harness.runtime.hang_logs();
        let mut bench = new_bench(&harness);

        let report = create_bench(&mut bench, CreateOptions::default()).await;
        match report.outcome {
            CreationOutcome::Failed { at, error, removed } => {
                assert_eq!(at, CreationState::PrimaryStarted);
                assert!(matches!(error, BenchError::SupervisorWaitTimedOut { .. }));
                assert!(!removed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(bench.exists());
        assert_eq!(harness.runtime.total_downs(), 0);
    }
}
