//! Bench Manager - bench 生命周期与配置对账
//!
//! 库入口

pub mod error;
pub mod logging;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EnvConfig;
pub use error::{BenchError, BenchResult};
pub use services::{Bench, LoadOptions};
pub use state::BenchContext;
