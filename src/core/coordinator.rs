//! 任务协调器 - 任务的创建、推进、控制与收尾
//!
//! 协调器是任务生命周期的唯一入口：对比（预览）、执行同步、
//! 暂停/恢复/停止、以及结束后的历史落库。任务结束不会自动消失，
//! 由调用方在读取完结果后显式移除。

use crate::access::{PathAccessChecker, PathRole};
use crate::config::ProfileStore;
use crate::core::engine::SyncEngine;
use crate::core::error::SyncError;
use crate::core::task::SyncTask;
use crate::db::models::{CompletedTask, FileAction, SyncProfile, SyncProgress, TaskPhase};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 历史记录落库抽象，同步结束后协调器调用
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn save(&self, task: &CompletedTask) -> Result<()>;
}

/// 任务协调器。克隆开销只有几个 Arc。
#[derive(Clone)]
pub struct TaskCoordinator {
    engine: Arc<SyncEngine>,
    access: Arc<dyn PathAccessChecker>,
    history: Arc<dyn HistorySink>,
    profiles: Arc<ProfileStore>,
    active: Arc<Mutex<Vec<Arc<SyncTask>>>>,
}

impl TaskCoordinator {
    pub fn new(
        engine: Arc<SyncEngine>,
        access: Arc<dyn PathAccessChecker>,
        history: Arc<dyn HistorySink>,
        profiles: Arc<ProfileStore>,
    ) -> Self {
        Self {
            engine,
            access,
            history,
            profiles,
            active: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<Arc<SyncTask>> {
        self.active
            .lock()
            .ok()?
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub fn list_tasks(&self) -> Vec<Arc<SyncTask>> {
        self.active.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// 创建任务并启动对比（dry-run 预览）。
    /// 同一配置同时只允许一个活动任务。
    pub fn compare_task(&self, profile: SyncProfile) -> Result<Arc<SyncTask>> {
        {
            let active = self
                .active
                .lock()
                .map_err(|_| anyhow::anyhow!("任务列表锁中毒"))?;
            if active
                .iter()
                .any(|t| t.profile.id == profile.id && t.phase().is_active())
            {
                bail!("该配置已有进行中的任务");
            }
        }

        let task = Arc::new(SyncTask::new(profile));
        if let Ok(mut active) = self.active.lock() {
            active.push(task.clone());
        }
        info!("创建任务 {} (配置: {})", task.id, task.profile.name);

        task.set_phase(TaskPhase::Comparing);
        let this = self.clone();
        let task_bg = task.clone();
        tokio::spawn(async move { this.run_compare(task_bg).await });

        Ok(task)
    }

    async fn run_compare(&self, task: Arc<SyncTask>) {
        // 预检不通过不会启动任何子进程
        if let Some(msg) = self
            .access
            .check_path_access(&task.profile.source_path, PathRole::Source)
            .await
        {
            warn!("任务 {} 源路径预检失败: {}", task.id, msg);
            task.fail(SyncError::PathAccess(msg).to_string());
            return;
        }
        if let Some(msg) = self
            .access
            .check_path_access(&task.profile.destination_path, PathRole::Destination)
            .await
        {
            warn!("任务 {} 目标路径预检失败: {}", task.id, msg);
            task.fail(SyncError::PathAccess(msg).to_string());
            return;
        }

        let command = self.engine.preview_command(&task.profile);
        task.append_console(&format!("$ {}", command.display_line()));

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
        let (console_tx, mut console_rx) = mpsc::unbounded_channel::<String>();

        let batch_task = task.clone();
        let batch_drain = tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                batch_task.append_preview(batch);
            }
        });
        let console_task = task.clone();
        let console_drain = tokio::spawn(async move {
            while let Some(line) = console_rx.recv().await {
                console_task.append_console(&line);
            }
        });

        let run = task.run();
        let result = self
            .engine
            .preview(&task.profile, &run, batch_tx, console_tx)
            .await;
        let _ = batch_drain.await;
        let _ = console_drain.await;

        match result {
            Ok(()) => {
                let count = task.preview_results().len();
                info!("任务 {} 对比完成，共 {} 条变更", task.id, count);
                task.set_phase(TaskPhase::Previewing);
            }
            Err(SyncError::Cancelled) => {
                // stop_task 通常已把任务置为失败态，避免重复迁移
                info!("任务 {} 对比被取消", task.id);
                if !task.phase().is_terminal() {
                    task.fail(SyncError::Cancelled.to_string());
                }
            }
            Err(e) => {
                error!("任务 {} 对比失败: {}", task.id, e);
                task.fail(e.to_string());
            }
        }
    }

    /// 从预览进入实际同步。总量按预览结果中的复制动作统计。
    pub fn execute_sync_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
        if task.phase() != TaskPhase::Previewing {
            bail!("任务当前阶段不允许开始同步");
        }

        let preview = task.preview_results();
        let (total_files, total_bytes) = preview_totals(&preview);
        let cell = task.progress_cell();
        let guard = cell.lock();
        if let Ok(mut p) = guard {
            *p = SyncProgress::new(chrono::Utc::now().timestamp_millis());
            p.total_files = total_files;
            p.total_bytes = total_bytes;
        }

        if !task.set_phase(TaskPhase::Syncing) {
            bail!("任务当前阶段不允许开始同步");
        }

        let this = self.clone();
        let task_bg = task.clone();
        tokio::spawn(async move { this.run_sync(task_bg).await });
        Ok(())
    }

    async fn run_sync(&self, task: Arc<SyncTask>) {
        let command = self.engine.sync_command(&task.profile);
        task.append_console("--- 同步开始 ---");
        task.append_console(&format!("$ {}", command.display_line()));

        let (console_tx, mut console_rx) = mpsc::unbounded_channel::<String>();
        let drain_task = task.clone();
        let drain = tokio::spawn(async move {
            while let Some(line) = console_rx.recv().await {
                drain_task.append_console(&line);
            }
        });

        let run = task.run();
        let result = self
            .engine
            .sync(
                &task.profile,
                &run,
                task.progress_cell(),
                None,
                console_tx,
            )
            .await;
        let _ = drain.await;

        match result {
            Ok(()) => {
                info!("任务 {} 同步完成", task.id);
                task.append_console("--- 同步完成 ---");
                task.set_phase(TaskPhase::Completed);
                self.finish(&task, true).await;
                if let Err(e) = self.profiles.touch_last_synced(&task.profile.id) {
                    warn!("更新配置最近同步时间失败: {}", e);
                }
            }
            Err(SyncError::Cancelled) => {
                // 用户取消不写历史；stop_task 通常已置失败态
                info!("任务 {} 被用户取消", task.id);
                task.append_console("--- 同步已取消 ---");
                if !task.phase().is_terminal() {
                    task.fail(SyncError::Cancelled.to_string());
                }
            }
            Err(e) => {
                error!("任务 {} 同步失败: {}", task.id, e);
                task.append_console(&format!("--- 同步失败: {} ---", e));
                task.fail(e.to_string());
                self.finish(&task, false).await;
            }
        }
    }

    /// 结束收尾：从最终进度生成历史记录并落库
    async fn finish(&self, task: &Arc<SyncTask>, success: bool) {
        let progress = task.progress_snapshot();
        let record = CompletedTask {
            id: Uuid::new_v4().to_string(),
            profile_name: task.profile.name.clone(),
            sync_mode: task.profile.sync_mode,
            start_time: progress.start_time,
            end_time: chrono::Utc::now().timestamp_millis(),
            files_transferred: progress.completed_files,
            bytes_transferred: progress.transferred_bytes,
            errors: if success { 0 } else { 1 },
            success,
        };
        if let Err(e) = self.history.save(&record).await {
            error!("写入历史记录失败: {}", e);
        }
    }

    /// 暂停：向所有在跑的子进程发送停止信号，传输冻结但不丢进度
    pub fn pause_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
        if task.phase() != TaskPhase::Syncing {
            bail!("只有同步中的任务可以暂停");
        }

        for handle in task.run().handles() {
            if handle.is_running() {
                handle.suspend();
            }
        }
        task.set_phase(TaskPhase::Paused);
        info!("任务 {} 已暂停", task_id);
        Ok(())
    }

    /// 恢复暂停中的任务
    pub fn resume_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
        if task.phase() != TaskPhase::Paused {
            bail!("只有暂停中的任务可以恢复");
        }

        for handle in task.run().handles() {
            if handle.is_running() {
                handle.resume();
            }
        }
        task.set_phase(TaskPhase::Syncing);
        info!("任务 {} 已恢复", task_id);
        Ok(())
    }

    /// 停止：置取消标志并终止所有子进程。暂停中的进程先恢复再终止，
    /// 否则 SIGTERM 要等进程被唤醒才会生效。
    pub fn stop_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
        let phase = task.phase();
        if phase.is_terminal() {
            return Ok(());
        }

        let run = task.run();
        run.cancel();
        for handle in run.handles() {
            if handle.is_running() {
                if phase == TaskPhase::Paused {
                    handle.resume();
                }
                handle.terminate();
            }
        }
        task.fail(SyncError::Cancelled.to_string());
        info!("任务 {} 已停止", task_id);
        Ok(())
    }

    /// 移除已结束的任务，活动中的任务必须先停止
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
        if task.phase().is_active() {
            bail!("任务仍在进行中，请先停止");
        }

        if let Ok(mut active) = self.active.lock() {
            active.retain(|t| t.id != task_id);
        }
        Ok(())
    }
}

/// 进度分母：文件数只统计复制动作，字节数取每条记录的已知大小
fn preview_totals(actions: &[FileAction]) -> (u64, u64) {
    let files = actions
        .iter()
        .filter(|a| !a.excluded && a.action.is_copy())
        .count() as u64;
    let bytes = actions
        .iter()
        .filter(|a| !a.excluded)
        .filter_map(|a| a.known_size())
        .sum();
    (files, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ActionType, FileAction};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 永远放行的检查器
    struct AllowAll;

    #[async_trait]
    impl PathAccessChecker for AllowAll {
        async fn check_path_access(&self, _path: &str, _role: PathRole) -> Option<String> {
            None
        }
    }

    /// 只拒绝目标路径
    struct RejectDestination;

    #[async_trait]
    impl PathAccessChecker for RejectDestination {
        async fn check_path_access(&self, path: &str, role: PathRole) -> Option<String> {
            (role == PathRole::Destination).then(|| format!("无权限: {}", path))
        }
    }

    /// 记录落库次数与成败的假历史库
    #[derive(Default)]
    struct RecordingSink {
        saves: AtomicUsize,
        records: Mutex<Vec<CompletedTask>>,
    }

    #[async_trait]
    impl HistorySink for RecordingSink {
        async fn save(&self, task: &CompletedTask) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut records) = self.records.lock() {
                records.push(task.clone());
            }
            Ok(())
        }
    }

    fn fake_rsync(dir: &std::path::Path, body: &str) -> PathBuf {
        let script = dir.join("fake_rsync");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        script
    }

    fn coordinator(
        binary: PathBuf,
        access: Arc<dyn PathAccessChecker>,
        sink: Arc<RecordingSink>,
        config_dir: &std::path::Path,
    ) -> TaskCoordinator {
        TaskCoordinator::new(
            Arc::new(SyncEngine::with_binary(binary)),
            access,
            sink,
            Arc::new(ProfileStore::load(config_dir).unwrap()),
        )
    }

    fn test_profile(dir: &std::path::Path) -> SyncProfile {
        let src = dir.join("src");
        let dst = dir.join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        let mut p = SyncProfile::new(
            "测试配置",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        );
        p.thread_count = 1;
        p
    }

    #[test]
    fn test_preview_totals_count_copies_but_sum_all_known_sizes() {
        let mut copy = FileAction::new("a.txt", ActionType::CopyToDest);
        copy.source_size = Some(100);
        let mut back = FileAction::new("b.txt", ActionType::CopyToSource);
        back.dest_size = Some(50);
        let mut equal = FileAction::new("same.txt", ActionType::Equal);
        equal.source_size = Some(7);
        let delete = FileAction::new("gone.txt", ActionType::DeleteDest);
        let mut skipped = FileAction::new("skip.txt", ActionType::CopyToDest);
        skipped.source_size = Some(999);
        skipped.excluded = true;

        let (files, bytes) = preview_totals(&[copy, back, equal, delete, skipped]);
        // 文件数只算复制动作，字节数覆盖所有未排除记录
        assert_eq!(files, 2);
        assert_eq!(bytes, 157);
    }

    #[tokio::test]
    async fn test_compare_then_sync_records_success_history() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(
            dir.path(),
            "case \"$*\" in *--dry-run*) printf '<f+++++++++ a.txt\\n<f+++++++++ b.txt\\n';; *) printf '2,048  100%%  1.00MB/s  0:00:00 (xfr#2, to-chk=0/2)\\n';; esac",
        );
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink.clone(), dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        // 等对比结束（进入 Previewing，非终态，轮询等待）
        for _ in 0..100 {
            if task.phase() == TaskPhase::Previewing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(task.phase(), TaskPhase::Previewing);
        assert_eq!(task.preview_results().len(), 2);

        coord.execute_sync_task(&task.id).unwrap();
        task.wait_settled().await;

        assert_eq!(task.phase(), TaskPhase::Completed);
        assert_eq!(sink.saves.load(Ordering::SeqCst), 1);
        let records = sink.records.lock().unwrap();
        assert!(records[0].success);
        assert_eq!(records[0].errors, 0);
        assert_eq!(records[0].files_transferred, 2);
        assert_eq!(records[0].bytes_transferred, 2048);
    }

    #[tokio::test]
    async fn test_failed_sync_records_failure_history() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(
            dir.path(),
            "case \"$*\" in *--dry-run*) printf '<f+++++++++ a.txt\\n';; *) echo 'disk full' >&2; exit 11;; esac",
        );
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink.clone(), dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        for _ in 0..100 {
            if task.phase() == TaskPhase::Previewing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        coord.execute_sync_task(&task.id).unwrap();
        task.wait_settled().await;

        assert_eq!(task.phase(), TaskPhase::Failed);
        assert!(task.error_message().unwrap().contains("disk full"));
        assert_eq!(sink.saves.load(Ordering::SeqCst), 1);
        assert!(!sink.records.lock().unwrap()[0].success);
        assert_eq!(sink.records.lock().unwrap()[0].errors, 1);
    }

    #[tokio::test]
    async fn test_stopped_sync_writes_no_history() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(
            dir.path(),
            "case \"$*\" in *--dry-run*) printf '<f+++++++++ a.txt\\n';; *) sleep 30;; esac",
        );
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink.clone(), dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        for _ in 0..100 {
            if task.phase() == TaskPhase::Previewing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        coord.execute_sync_task(&task.id).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        coord.stop_task(&task.id).unwrap();
        task.wait_settled().await;

        assert_eq!(task.phase(), TaskPhase::Failed);
        assert_eq!(task.error_message().as_deref(), Some("用户已取消"));
        assert_eq!(sink.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_precheck_failure_never_launches_rsync() {
        let dir = tempfile::tempdir().unwrap();
        // 脚本一旦被执行就留下痕迹文件
        let marker = dir.path().join("launched");
        let binary = fake_rsync(dir.path(), &format!("touch {}", marker.display()));
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(RejectDestination), sink.clone(), dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        task.wait_settled().await;

        assert_eq!(task.phase(), TaskPhase::Failed);
        assert!(task.error_message().unwrap().contains("路径无法访问"));
        assert!(!marker.exists());
        assert_eq!(sink.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_active_task_per_profile() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(dir.path(), "sleep 5");
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink, dir.path());

        let profile = test_profile(dir.path());
        let task = coord.compare_task(profile.clone()).unwrap();
        assert!(coord.compare_task(profile.clone()).is_err());

        // 等子进程登记完成再停止
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        coord.stop_task(&task.id).unwrap();
        task.wait_settled().await;
        // 结束后同一配置可以再次发起
        assert!(coord.compare_task(profile).is_ok());
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_phase() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(dir.path(), "sleep 5");
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink, dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(coord.remove_task(&task.id).is_err());

        coord.stop_task(&task.id).unwrap();
        task.wait_settled().await;
        coord.remove_task(&task.id).unwrap();
        assert!(coord.get_task(&task.id).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_resume_keeps_progress_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(
            dir.path(),
            concat!(
                "case \"$*\" in *--dry-run*) printf '<f+++++++++ a.txt\\n';; *)\n",
                "i=1\n",
                "while [ $i -le 10 ]; do\n",
                "  printf '%s,000  %s0%%  1.00MB/s  0:00:01 (xfr#%s, to-chk=0/10)\\n' $i $i $i\n",
                "  sleep 0.2\n",
                "  i=$((i+1))\n",
                "done;; esac",
            ),
        );
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink, dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        for _ in 0..100 {
            if task.phase() == TaskPhase::Previewing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        coord.execute_sync_task(&task.id).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        coord.pause_task(&task.id).unwrap();
        assert_eq!(task.phase(), TaskPhase::Paused);
        let before_pause = task.progress_snapshot().transferred_bytes;

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        coord.resume_task(&task.id).unwrap();
        assert_eq!(task.phase(), TaskPhase::Syncing);
        task.wait_settled().await;

        assert_eq!(task.phase(), TaskPhase::Completed);
        let after = task.progress_snapshot().transferred_bytes;
        assert!(after >= before_pause);
    }

    #[tokio::test]
    async fn test_pause_resume_guard_rails() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_rsync(dir.path(), "sleep 5");
        let sink = Arc::new(RecordingSink::default());
        let coord = coordinator(binary, Arc::new(AllowAll), sink, dir.path());

        let task = coord.compare_task(test_profile(dir.path())).unwrap();
        // 对比阶段不可暂停
        assert!(coord.pause_task(&task.id).is_err());
        assert!(coord.resume_task(&task.id).is_err());
        coord.stop_task(&task.id).unwrap();
        task.wait_settled().await;
    }
}
