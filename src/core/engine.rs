//! 同步引擎 - 驱动 rsync 完成预览与传输
//!
//! 预览结果以增量批次发往通道，调用方边收边展示。同步支持单进程和
//! 多进程两条路径：多进程按顶层条目轮转切分，每个子进程处理一个
//! 列表文件，进度增量汇聚到共享的进度结构上。

use crate::core::command::{CommandBuilder, RsyncCommand};
use crate::core::error::SyncError;
use crate::core::parser::{parse_itemized, parse_progress};
use crate::core::process::ProcessRunner;
use crate::core::rsync_bin;
use crate::core::task::TaskRun;
use crate::db::models::{SyncProfile, SyncProgress};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 同步引擎。不持有任务状态，同一实例可服务多个任务。
pub struct SyncEngine {
    binary: PathBuf,
}

impl SyncEngine {
    pub fn new() -> Self {
        let binary = rsync_bin::locate();
        match rsync_bin::version(&binary) {
            Some(version) => info!("使用 rsync: {} ({})", binary.display(), version),
            None => warn!("无法读取 rsync 版本: {}", binary.display()),
        }
        Self { binary }
    }

    /// 指定可执行文件路径（测试用）
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// 预览命令行（控制台回显用）
    pub fn preview_command(&self, profile: &SyncProfile) -> RsyncCommand {
        CommandBuilder::new(profile, &self.binary).build_preview()
    }

    /// 同步命令行（控制台回显用）
    pub fn sync_command(&self, profile: &SyncProfile) -> RsyncCommand {
        CommandBuilder::new(profile, &self.binary).build_sync()
    }

    /// 执行 dry-run 预览，变更批次按到达顺序发往 `batch_tx`。
    /// 一个读取块内解析出的变更合并为一批，空批不发送。
    pub async fn preview(
        &self,
        profile: &SyncProfile,
        run: &Arc<TaskRun>,
        batch_tx: UnboundedSender<Vec<crate::db::models::FileAction>>,
        console_tx: UnboundedSender<String>,
    ) -> Result<(), SyncError> {
        if run.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let command = CommandBuilder::new(profile, &self.binary).build_preview();
        let runner = ProcessRunner::spawn(&command)?;
        run.register(runner.handle());

        let result = runner
            .run(run.cancelled_flag(), |chunk| {
                let mut batch = Vec::new();
                for line in chunk.lines {
                    let _ = console_tx.send(line.clone());
                    if let Some(action) = parse_itemized(line) {
                        batch.push(action);
                    }
                }
                if !batch.is_empty() {
                    let _ = batch_tx.send(batch);
                }
                !run.is_cancelled()
            })
            .await;

        if run.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        result
    }

    /// 执行同步。`thread_count` 大于 1 且源目录可切分时走多进程路径，
    /// 否则单进程。进度快照在每次采样后发往 `progress_tx`。
    pub async fn sync(
        &self,
        profile: &SyncProfile,
        run: &Arc<TaskRun>,
        progress: Arc<Mutex<SyncProgress>>,
        progress_tx: Option<UnboundedSender<SyncProgress>>,
        console_tx: UnboundedSender<String>,
    ) -> Result<(), SyncError> {
        if profile.thread_count > 1 {
            match top_level_entries(Path::new(&profile.source_path)) {
                Ok(entries) if entries.len() > 1 => {
                    return self
                        .sync_parallel(profile, run, entries, progress, progress_tx, console_tx)
                        .await;
                }
                Ok(_) => {
                    debug!("顶层条目不足，退回单进程同步");
                }
                Err(e) => {
                    warn!("枚举源目录失败，退回单进程同步: {}", e);
                }
            }
        }
        self.sync_single(profile, run, progress, progress_tx, console_tx)
            .await
    }

    async fn sync_single(
        &self,
        profile: &SyncProfile,
        run: &Arc<TaskRun>,
        progress: Arc<Mutex<SyncProgress>>,
        progress_tx: Option<UnboundedSender<SyncProgress>>,
        console_tx: UnboundedSender<String>,
    ) -> Result<(), SyncError> {
        if run.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let command = CommandBuilder::new(profile, &self.binary).build_sync();
        let runner = ProcessRunner::spawn(&command)?;
        run.register(runner.handle());

        let result = runner
            .run(run.cancelled_flag(), |chunk| {
                for line in chunk.lines {
                    if let Some(sample) = parse_progress(line) {
                        let snapshot = match progress.lock() {
                            Ok(mut p) => {
                                // 字节计数只进不退
                                p.transferred_bytes = p.transferred_bytes.max(sample.bytes);
                                p.update_speed(sample.speed);
                                if let Some(files) = sample.files_completed {
                                    p.completed_files = p.completed_files.max(files);
                                }
                                Some(p.clone())
                            }
                            Err(_) => None,
                        };
                        if let (Some(tx), Some(snap)) = (&progress_tx, snapshot) {
                            if !run.is_cancelled() {
                                let _ = tx.send(snap);
                            }
                        }
                    } else {
                        let _ = console_tx.send(line.clone());
                    }
                }
                !run.is_cancelled()
            })
            .await;

        if run.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        result
    }

    async fn sync_parallel(
        &self,
        profile: &SyncProfile,
        run: &Arc<TaskRun>,
        entries: Vec<String>,
        progress: Arc<Mutex<SyncProgress>>,
        progress_tx: Option<UnboundedSender<SyncProgress>>,
        console_tx: UnboundedSender<String>,
    ) -> Result<(), SyncError> {
        let chunks = round_robin_split(entries, profile.thread_count);
        info!("并行同步: {} 个子进程", chunks.len());

        // 每个子进程一个速度槽位，汇总后喂给平滑器
        let speeds: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(vec![0.0; chunks.len()]));
        let mut workers = Vec::with_capacity(chunks.len());
        let mut launch_failure: Option<SyncError> = None;

        for (index, chunk) in chunks.into_iter().enumerate() {
            if run.is_cancelled() {
                break;
            }

            let list_path = match write_list_file(&chunk) {
                Ok(path) => path,
                Err(e) => {
                    launch_failure =
                        Some(SyncError::Launch(format!("写入文件列表失败: {}", e)));
                    break;
                }
            };
            let command =
                CommandBuilder::new(profile, &self.binary).build_partial_sync(&list_path);
            let runner = match ProcessRunner::spawn(&command) {
                Ok(r) => r,
                Err(e) => {
                    let _ = std::fs::remove_file(&list_path);
                    launch_failure = Some(e);
                    break;
                }
            };
            run.register(runner.handle());

            let run = run.clone();
            let progress = progress.clone();
            let progress_tx = progress_tx.clone();
            let console_tx = console_tx.clone();
            let speeds = speeds.clone();
            workers.push(tokio::spawn(async move {
                // 子进程退出后再清理列表文件
                let _cleanup = scopeguard::guard(list_path, |p| {
                    let _ = std::fs::remove_file(p);
                });

                let mut last_bytes: u64 = 0;
                let mut last_files: u64 = 0;
                runner
                    .run(run.cancelled_flag(), |chunk| {
                        for line in chunk.lines {
                            let Some(sample) = parse_progress(line) else {
                                let _ = console_tx.send(line.clone());
                                continue;
                            };

                            // 子进程报告的是自身累计值，转成增量并入总进度
                            let byte_delta = sample.bytes.saturating_sub(last_bytes);
                            last_bytes = last_bytes.max(sample.bytes);
                            let file_delta = sample
                                .files_completed
                                .map(|f| f.saturating_sub(last_files))
                                .unwrap_or(0);
                            if let Some(f) = sample.files_completed {
                                last_files = last_files.max(f);
                            }

                            let total_speed = match speeds.lock() {
                                Ok(mut s) => {
                                    s[index] = sample.speed;
                                    s.iter().sum()
                                }
                                Err(_) => sample.speed,
                            };

                            let snapshot = match progress.lock() {
                                Ok(mut p) => {
                                    p.transferred_bytes += byte_delta;
                                    p.completed_files += file_delta;
                                    p.update_speed(total_speed);
                                    Some(p.clone())
                                }
                                Err(_) => None,
                            };
                            if let (Some(tx), Some(snap)) = (&progress_tx, snapshot) {
                                if !run.is_cancelled() {
                                    let _ = tx.send(snap);
                                }
                            }
                        }
                        !run.is_cancelled()
                    })
                    .await
            }));
        }

        // 启动中途失败时立即终止已启动的兄弟进程，不让它们脱管继续传输
        if launch_failure.is_some() {
            for handle in run.handles() {
                if handle.is_running() {
                    handle.terminate();
                }
            }
        }

        // 等所有子进程结束；正常情况下不因个别失败提前中断其余传输
        let mut outcomes = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(Err(SyncError::Process(format!(
                    "子任务异常退出: {}",
                    e
                )))),
            }
        }

        if run.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(e) = launch_failure {
            return Err(e);
        }

        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// 列出源目录的顶层条目名（跳过隐藏条目），排序保证切分确定
fn top_level_entries(source: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        entries.push(name);
    }
    entries.sort();
    Ok(entries)
}

/// 轮转切分：第 i 组取下标模 n 等于 i 的条目，空组丢弃
fn round_robin_split(entries: Vec<String>, n: usize) -> Vec<Vec<String>> {
    let n = n.max(1);
    let mut chunks: Vec<Vec<String>> = vec![Vec::new(); n];
    for (i, entry) in entries.into_iter().enumerate() {
        chunks[i % n].push(entry);
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// 把一组顶层条目写成 --files-from 列表文件
fn write_list_file(entries: &[String]) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("syncpilot_files_{}.txt", Uuid::new_v4()));
    let mut content = entries.join("\n");
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(path)
}
