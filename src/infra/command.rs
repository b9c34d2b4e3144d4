//! 命令执行器
//!
//! 提供统一的命令句柄，本地进程与 SSH 通道共用：
//! - stdout/stderr 分块流式输出，`LineBuffer` 按行切分并保留末尾半行
//! - 向命令写入输入行
//! - 取消支持（宽限期内终止）

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::event::OutputType;
use crate::domain::project::EnvVar;
use crate::error::{EngineError, EngineResult};

/// 输出通道容量（块）
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// 单次读取的缓冲区大小
const READ_BUF_SIZE: usize = 4096;

/// 半行超过该长度时直接作为输出发出
const MAX_PARTIAL_LEN: usize = 8192;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    /// 非零退出
    #[error("Command exited with code {0}")]
    NonZeroExit(i32),
    /// 命令被终止
    #[error("Command was terminated")]
    Terminated,
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
    /// SSH 通道或内部通道错误
    #[error("Channel error: {0}")]
    Channel(String),
}

impl From<CommandError> for EngineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Terminated => EngineError::Stopped,
            other => EngineError::ProcessFailed(other.to_string()),
        }
    }
}

/// 一段输出
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputType,
    pub data: String,
}

/// 按行切分输出
///
/// 每个流各自缓冲末尾没有换行的半行，直到换行到达或调用 `flush`。
#[derive(Debug, Default)]
pub struct LineBuffer {
    stdout: String,
    stderr: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn partial_mut(&mut self, stream: OutputType) -> &mut String {
        match stream {
            OutputType::Stdout => &mut self.stdout,
            OutputType::Stderr => &mut self.stderr,
        }
    }

    /// 当前缓冲的半行
    pub fn partial(&self, stream: OutputType) -> &str {
        match stream {
            OutputType::Stdout => &self.stdout,
            OutputType::Stderr => &self.stderr,
        }
    }

    /// 输入一段输出，返回其中完整的行（每行一个块，含换行符）
    pub fn push(&mut self, chunk: OutputChunk) -> Vec<OutputChunk> {
        let stream = chunk.stream;
        let partial = self.partial_mut(stream);
        partial.push_str(&chunk.data);

        let mut lines = Vec::new();
        if let Some(end) = partial.rfind('\n') {
            let rest = partial.split_off(end + 1);
            let complete = std::mem::replace(partial, rest);
            lines.extend(complete.split_inclusive('\n').map(|line| OutputChunk {
                stream,
                data: line.to_string(),
            }));
        }
        if partial.len() > MAX_PARTIAL_LEN {
            lines.push(OutputChunk {
                stream,
                data: std::mem::take(partial),
            });
        }
        lines
    }

    /// 取出某个流的半行
    pub fn take_partial(&mut self, stream: OutputType) -> String {
        std::mem::take(self.partial_mut(stream))
    }

    /// 取出剩余的半行
    pub fn flush(&mut self) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        for stream in [OutputType::Stdout, OutputType::Stderr] {
            let data = self.take_partial(stream);
            if !data.is_empty() {
                chunks.push(OutputChunk { stream, data });
            }
        }
        chunks
    }
}

/// 要执行的命令
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: Vec<EnvVar>,
    /// 非交互命令的 stdin 直接关闭
    pub interactive: bool,
}

/// 运行中命令的句柄
///
/// 输出按到达顺序产出一次，不可重放。
pub struct CommandHandle {
    output: mpsc::Receiver<OutputChunk>,
    input: mpsc::Sender<String>,
    terminate: CancellationToken,
    exit: oneshot::Receiver<Result<(), CommandError>>,
}

/// 命令句柄的驱动端，由具体执行器（本地进程 / SSH 通道）持有
pub struct CommandIo {
    pub output: mpsc::Sender<OutputChunk>,
    pub input: mpsc::Receiver<String>,
    pub terminate: CancellationToken,
    pub exit: oneshot::Sender<Result<(), CommandError>>,
}

impl CommandHandle {
    /// 创建一对句柄/驱动端
    pub fn pair() -> (CommandHandle, CommandIo) {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminate = CancellationToken::new();

        let handle = CommandHandle {
            output: output_rx,
            input: input_tx,
            terminate: terminate.clone(),
            exit: exit_rx,
        };
        let io = CommandIo {
            output: output_tx,
            input: input_rx,
            terminate,
            exit: exit_tx,
        };
        (handle, io)
    }

    /// 下一段输出，命令结束且输出耗尽后返回 `None`
    pub async fn next_output(&mut self) -> Option<OutputChunk> {
        self.output.recv().await
    }

    /// 写入一行输入（自动追加换行）
    pub async fn write_line(&self, line: &str) -> Result<(), CommandError> {
        self.input
            .send(format!("{}\n", line))
            .await
            .map_err(|_| CommandError::Channel("input closed".to_string()))
    }

    /// 请求终止命令
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// 等待命令结束；未读取的输出会被丢弃
    pub async fn wait(mut self) -> Result<(), CommandError> {
        while self.output.recv().await.is_some() {}
        match self.exit.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Channel("command driver dropped".to_string())),
        }
    }
}

/// 命令执行器
pub struct CommandRunner;

impl CommandRunner {
    /// 以 `sh -c` 启动本地命令
    ///
    /// `grace` 为终止时等待进程及输出读取结束的时长。
    pub fn spawn_local(spec: &CommandSpec, grace: Duration) -> Result<CommandHandle, CommandError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .stdin(if spec.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in &spec.env {
            cmd.env(&var.name, &var.value);
        }
        // 独立进程组，终止时连同子进程一起结束
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(CommandError::SpawnFailed)?;
        debug!(pid = ?child.id(), command = %spec.command, "Spawned local command");

        let (handle, io) = CommandHandle::pair();
        let CommandIo {
            output,
            mut input,
            terminate,
            exit,
        } = io;

        let stdout_task = child
            .stdout
            .take()
            .map(|r| tokio::spawn(pump_output(r, OutputType::Stdout, output.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|r| tokio::spawn(pump_output(r, OutputType::Stderr, output.clone())));
        drop(output);

        let mut stdin = child.stdin.take();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = input.recv().await {
                let Some(ref mut pipe) = stdin else {
                    continue;
                };
                if let Err(e) = pipe.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Failed to write to command stdin");
                    stdin = None;
                    continue;
                }
                let _ = pipe.flush().await;
            }
        });

        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(CommandError::NonZeroExit(status.code().unwrap_or(-1))),
                    Err(e) => Err(CommandError::WaitFailed(e)),
                },
                _ = terminate.cancelled() => {
                    terminate_child(&mut child, grace).await;
                    Err(CommandError::Terminated)
                }
            };

            // 后台孙进程可能仍持有管道，超过宽限期不再等待输出
            let readers: Vec<_> = stdout_task.into_iter().chain(stderr_task).collect();
            let aborts: Vec<_> = readers.iter().map(|t| t.abort_handle()).collect();
            let drained = tokio::time::timeout(grace, async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;
            if drained.is_err() {
                warn!("Command output still open after exit, detaching readers");
                for abort in aborts {
                    abort.abort();
                }
            }
            writer_task.abort();

            let _ = exit.send(result);
        });

        Ok(handle)
    }
}

/// 先对进程组发送 SIGTERM，宽限期后强制结束
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group("TERM", pid).await;
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(pid, ?status, "Command exited after SIGTERM");
            return;
        }
        signal_group("KILL", pid).await;
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill command");
    }
}

#[cfg(unix)]
async fn signal_group(signal: &str, pgid: u32) {
    let result = Command::new("kill")
        .args(["-s", signal, "--", &format!("-{}", pgid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(error = %e, signal, pgid, "Failed to signal process group");
    }
}

/// 读取原始字节并按 UTF-8 边界切块转发
async fn pump_output<R>(mut reader: R, stream: OutputType, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let data = take_utf8(&mut pending);
                if !data.is_empty() && tx.send(OutputChunk { stream, data }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, stream = stream.as_str(), "Output read failed");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let data = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputChunk { stream, data }).await;
    }
}

/// 取出 `pending` 中可解码的前缀，末尾不完整的多字节序列留待下次
pub fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = pending.split_off(valid);
            let out = String::from_utf8_lossy(pending).into_owned();
            *pending = rest;
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

/// 解析本地工作目录：相对于根目录，必须存在且为目录
pub fn resolve_local_dir(root: &Path, relative: &str) -> EngineResult<PathBuf> {
    let relative = relative.trim();
    let dir = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(EngineError::InvalidWorkingDir(dir.display().to_string()))
    }
}
