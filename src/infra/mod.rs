//! 基础设施模块
//!
//! 封装外部依赖（命令执行、docker compose、compose 文件）

pub mod command;
pub mod compose;
pub mod compose_file;

pub use command::{CommandError, CommandRunner, LineStream};
pub use compose::{ComposeRuntime, DockerComposeRuntime, ExecOptions, ExecOutput, RuntimeError};
pub use compose_file::{ComposeFile, ComposeTemplate, DescriptorError};
