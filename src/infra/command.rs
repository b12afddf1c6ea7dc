//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 逐行读取 stdout/stderr（`LineStream`）
//! - 超时控制
//! - 子进程随 `LineStream` 一起释放（kill on drop）

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::LogLine;

/// 行缓冲通道容量
const LINE_CHANNEL_CAPACITY: usize = 256;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时
    Timeout,
    /// 命令被取消
    Cancelled,
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout => write!(f, "Command timed out"),
            CommandError::Cancelled => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 逐行输出流
///
/// 由子进程（docker compose logs -f / exec）或内存通道驱动。
/// 丢弃时子进程会被终止，调用方无需额外清理
pub struct LineStream {
    rx: mpsc::Receiver<LogLine>,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    /// 非进程流的退出码
    exit_code: i32,
}

impl LineStream {
    /// 由预置的行构造（已结束的流）
    pub fn from_lines(lines: Vec<LogLine>, exit_code: i32) -> Self {
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            let _ = tx.try_send(line);
        }
        Self::from_receiver(rx, exit_code)
    }

    /// 由外部通道构造，发送端全部关闭时流结束
    pub fn from_receiver(rx: mpsc::Receiver<LogLine>, exit_code: i32) -> Self {
        Self {
            rx,
            child: None,
            readers: Vec::new(),
            exit_code,
        }
    }

    /// 读取下一行，流结束返回 None
    pub async fn next_line(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    /// 读完剩余输出并返回退出码
    pub async fn finish(mut self) -> Result<i32, CommandError> {
        while self.rx.recv().await.is_some() {}

        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }

        match self.child.take() {
            Some(mut child) => {
                let status = child.wait().await.map_err(CommandError::WaitFailed)?;
                Ok(status.code().unwrap_or(-1))
            }
            None => Ok(self.exit_code),
        }
    }

    /// 终止底层进程
    pub async fn kill(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

impl CommandRunner {
    /// 启动命令，返回逐行输出流
    ///
    /// stdout 与 stderr 合并到同一个流中，按到达顺序输出
    pub fn spawn_lines(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
    ) -> Result<LineStream, CommandError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let stdout_tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stdout_tx.send(LogLine::stdout(line)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let stderr_tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if stderr_tx.send(LogLine::stderr(line)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(LineStream {
            rx,
            child: Some(child),
            readers,
            exit_code: -1,
        })
    }

    /// 执行简单命令（无流式输出）
    pub async fn run_simple(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        tokio::select! {
            result = command.output() => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout)
            }
        }
    }

    /// 交互式执行命令，标准输入输出直接继承当前终端
    pub async fn run_interactive(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
    ) -> Result<i32, CommandError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let status = command.status().await.map_err(CommandError::SpawnFailed)?;
        Ok(status.code().unwrap_or(-1))
    }

    /// 命令是否存在于 PATH 中
    pub async fn which(program: &str) -> Option<String> {
        let output = Self::run_simple(
            "which",
            &[program.to_string()],
            None,
            Duration::from_secs(5),
        )
        .await
        .ok()?;

        if !output.status.success() {
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!path.is_empty()).then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_simple_success() {
        let output = CommandRunner::run_simple(
            "echo",
            &["hello".to_string()],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            None,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_lines_streams_and_reports_exit_code() {
        let mut stream = CommandRunner::spawn_lines(
            "sh",
            &["-c".to_string(), "echo one; echo two >&2; exit 3".to_string()],
            None,
        )
        .unwrap();

        let mut contents = Vec::new();
        while let Some(line) = stream.next_line().await {
            contents.push(line.content);
        }
        contents.sort();
        assert_eq!(contents, vec!["one".to_string(), "two".to_string()]);

        assert_eq!(stream.finish().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_from_lines_stream() {
        let mut stream =
            LineStream::from_lines(vec![LogLine::stdout("a"), LogLine::stdout("b")], 0);
        assert_eq!(stream.next_line().await.unwrap().content, "a");
        assert_eq!(stream.finish().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_interactive_reports_exit_code() {
        let code = CommandRunner::run_interactive("sh", &["-c".to_string(), "exit 4".to_string()], None)
            .await
            .unwrap();
        assert_eq!(code, 4);

        let result = CommandRunner::run_interactive("nonexistent_command_12345", &[], None).await;
        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }
}
