//! 服务层模块
//!
//! 包含核心业务逻辑：服务组、workers、管理工具、证书与创建流程

pub mod admin_tools;
pub mod backup;
pub mod bench;
pub mod certificate;
pub mod creation;
pub mod devcontainer;
pub mod prompt;
pub mod readiness;
pub mod registry;
pub mod sub_deployment;
pub mod workers;

pub use bench::{Bench, BenchInfo, LoadOptions};
pub use creation::{create_bench, CreateOptions, CreationOutcome};
