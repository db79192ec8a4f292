//! 子进程生命周期 - 启动、流式读取 stdout、信号控制
//!
//! 读取循环必须先把 stdout 读到 EOF 再检查退出状态，否则退出通知可能
//! 先于管道中剩余数据到达，导致丢失输出。

use crate::core::command::RsyncCommand;
use crate::core::error::SyncError;
use crate::core::parser::LineBuffer;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 对一个已启动子进程的信号控制能力。
/// 任务持有一组句柄用于暂停/恢复/终止，进程退出后信号调用变为空操作。
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// 暂停（SIGSTOP）：冻结传输，不终止进程
    pub fn suspend(&self) {
        self.signal(Signal::Stop);
    }

    /// 恢复（SIGCONT）：从暂停处继续
    pub fn resume(&self) {
        self.signal(Signal::Continue);
    }

    /// 终止（SIGTERM）
    pub fn terminate(&self) {
        self.signal(Signal::Terminate);
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) {
        if !self.is_running() {
            return;
        }
        let signo = match signal {
            Signal::Stop => libc::SIGSTOP,
            Signal::Continue => libc::SIGCONT,
            Signal::Terminate => libc::SIGTERM,
        };
        // 只对仍在运行的子进程发信号；失败只记日志，不向上传播
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, signo) };
        if ret != 0 {
            warn!("向进程 {} 发送信号 {:?} 失败", self.pid, signal);
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, signal: Signal) {
        warn!("当前平台不支持进程信号 {:?}（pid={}）", signal, self.pid);
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Continue,
    Terminate,
}

/// stdout 读取事件：每次 read 产生一个原始块和其中的完整行
pub struct StdoutChunk<'a> {
    pub raw: &'a str,
    pub lines: &'a [String],
}

/// 一个在跑的子进程：stdout 流式读取，stderr 后台收集
pub struct ProcessRunner {
    child: Child,
    handle: ProcessHandle,
    stderr_task: JoinHandle<String>,
}

impl ProcessRunner {
    /// 启动子进程，stdout/stderr 均接管道
    pub fn spawn(command: &RsyncCommand) -> Result<Self, SyncError> {
        debug!("启动子进程: {}", command.display_line());

        let mut child = Command::new(&command.program)
            .args(command.all_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::Launch(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SyncError::Launch("子进程没有 pid".to_string()))?;
        let handle = ProcessHandle::new(pid);

        // stderr 单独收集，避免管道写满阻塞子进程
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SyncError::Launch("无法获取 stderr 管道".to_string()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        Ok(Self {
            child,
            handle,
            stderr_task,
        })
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// 读空 stdout 直到 EOF，再等待进程退出并归类结果。
    ///
    /// 回调对每个读取块调用一次；返回 false 表示停止消费后续输出
    /// （取消时的协作式退出，进程本身由外部信号终止）。
    pub async fn run<F>(
        mut self,
        cancelled: &AtomicBool,
        mut on_chunk: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut(StdoutChunk<'_>) -> bool,
    {
        let mut stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Launch("无法获取 stdout 管道".to_string()))?;

        let mut buf = [0u8; 8192];
        let mut line_buf = LineBuffer::new();
        let mut consuming = true;

        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break, // EOF：进程已关闭 stdout
                Ok(n) => n,
                Err(e) => {
                    warn!("读取 stdout 失败: {}", e);
                    break;
                }
            };

            if !consuming {
                // 取消后继续排空管道但不再回调，避免子进程写满阻塞
                continue;
            }

            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            let lines = line_buf.push(&chunk);
            let keep_going = on_chunk(StdoutChunk {
                raw: &chunk,
                lines: &lines,
            });
            if !keep_going || cancelled.load(Ordering::SeqCst) {
                consuming = false;
            }
        }

        // 流结束时刷出最后的残行
        if consuming {
            if let Some(rest) = line_buf.flush() {
                on_chunk(StdoutChunk {
                    raw: "",
                    lines: std::slice::from_ref(&rest),
                });
            }
        }

        // 管道已读空，此时再等退出状态
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SyncError::Process(e.to_string()))?;
        self.handle.mark_exited();

        let stderr_text = self.stderr_task.await.unwrap_or_default();
        classify_exit(status, &stderr_text, cancelled.load(Ordering::SeqCst))
    }
}

/// 退出状态归类：0 成功；20 用户取消；被信号杀死且任务已取消也视为取消；
/// 其余按错误输出内容区分网络断开与一般错误
fn classify_exit(
    status: std::process::ExitStatus,
    stderr_text: &str,
    cancelled: bool,
) -> Result<(), SyncError> {
    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(20) => Err(SyncError::Cancelled),
        Some(code) => {
            let text = stderr_text.trim();
            if text.contains("connection") || text.contains("network") {
                Err(SyncError::NetworkDisconnected)
            } else if text.is_empty() {
                Err(SyncError::Process(format!("退出码 {}", code)))
            } else {
                Err(SyncError::Process(text.to_string()))
            }
        }
        // 无退出码（被信号终止）
        None => {
            if cancelled {
                Err(SyncError::Cancelled)
            } else {
                Err(SyncError::Process("进程被信号终止".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    fn sh_command(script: &str) -> RsyncCommand {
        // 借用 RsyncCommand 结构直接驱动 /bin/sh，源/目标作为脚本参数占位
        RsyncCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            source: "src".to_string(),
            destination: "dst".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_collects_all_lines_before_exit() {
        let cmd = sh_command("printf 'one\\ntwo\\nthree\\n'");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let cancelled = AtomicBool::new(false);

        let mut seen = Vec::new();
        let result = runner
            .run(&cancelled, |chunk| {
                seen.extend(chunk.lines.iter().cloned());
                true
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_run_flushes_trailing_partial_line() {
        let cmd = sh_command("printf 'complete\\npartial-tail'");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let cancelled = AtomicBool::new(false);

        let mut seen = Vec::new();
        runner
            .run(&cancelled, |chunk| {
                seen.extend(chunk.lines.iter().cloned());
                true
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["complete", "partial-tail"]);
    }

    #[tokio::test]
    async fn test_exit_code_20_maps_to_cancelled() {
        let cmd = sh_command("exit 20");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let cancelled = AtomicBool::new(false);

        let result = runner.run(&cancelled, |_| true).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_network_substring_reclassifies_failure() {
        let cmd = sh_command("echo 'rsync: connection unexpectedly closed' >&2; exit 12");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let cancelled = AtomicBool::new(false);

        let result = runner.run(&cancelled, |_| true).await;
        assert!(matches!(result, Err(SyncError::NetworkDisconnected)));
    }

    #[tokio::test]
    async fn test_generic_failure_carries_stderr_text() {
        let cmd = sh_command("echo 'some rsync failure' >&2; exit 23");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let cancelled = AtomicBool::new(false);

        match runner.run(&cancelled, |_| true).await {
            Err(SyncError::Process(msg)) => assert!(msg.contains("some rsync failure")),
            other => panic!("意外结果: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_launch_error() {
        let cmd = RsyncCommand {
            program: PathBuf::from("/nonexistent/rsync-binary"),
            args: vec![],
            source: "a/".to_string(),
            destination: "b/".to_string(),
        };
        assert!(matches!(
            ProcessRunner::spawn(&cmd),
            Err(SyncError::Launch(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_long_running_child() {
        let cmd = sh_command("sleep 30");
        let runner = ProcessRunner::spawn(&cmd).unwrap();
        let handle = runner.handle();
        let cancelled = Arc::new(AtomicBool::new(false));

        let cancelled2 = cancelled.clone();
        let join = tokio::spawn(async move { runner.run(&cancelled2, |_| true).await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancelled.store(true, Ordering::SeqCst);
        handle.terminate();

        let result = join.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(!handle.is_running());
    }
}
