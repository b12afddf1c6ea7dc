//! 配置模块
//!
//! 进程级环境变量配置与 bench 持久化配置

pub mod bench;
pub mod env;

pub use bench::{AppSpec, BenchConfig, ComposeInputs, ConfigError};
pub use env::{EnvConfig, ProbeConfig, ProbeMode};
