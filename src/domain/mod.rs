//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio 与外部进程

pub mod bench;
pub mod certificate;
pub mod container;
pub mod database;
pub mod lifecycle;

// Re-exports for convenience
pub use bench::{container_name_prefix, normalize_bench_name, EnvironmentType};
pub use certificate::{SslCertificate, SslType};
pub use container::{ServiceState, ServiceStatuses};
pub use database::{BenchDbInfo, DatabaseServerInfo};
pub use lifecycle::{CreationState, LogLine, StepRecord, StepStatus};
