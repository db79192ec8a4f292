//! 同步任务状态 - 阶段机、预览结果累积、控制台输出
//!
//! 任务状态被 UI 轮询和后台执行体并发访问，读写锁只保护短临界区，
//! 子进程句柄与取消标志单独放在 [`TaskRun`] 里，避免执行体持锁等待。

use crate::core::process::ProcessHandle;
use crate::db::models::{FileAction, SyncProfile, SyncProgress, TaskPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

/// 控制台缓冲上限，超出后截断到保留长度
const CONSOLE_CAP: usize = 1024 * 1024;
const CONSOLE_KEEP: usize = 800 * 1024;
const TRUNCATION_MARKER: &str = "[... 输出过长，已截断 ...]\n";

/// 一次运行的共享控制面：取消标志 + 活跃子进程句柄。
/// 取消标志只从 false 置为 true，置位后不再回退。
#[derive(Debug, Default)]
pub struct TaskRun {
    cancelled: AtomicBool,
    processes: Mutex<Vec<ProcessHandle>>,
}

impl TaskRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancelled_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// 登记一个新启动的子进程句柄
    pub fn register(&self, handle: ProcessHandle) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.push(handle);
        }
    }

    /// 当前登记的所有句柄快照（含已退出的）
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.processes
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

/// 任务的可变状态，读写锁保护
#[derive(Debug)]
pub struct TaskState {
    pub phase: TaskPhase,
    /// 预览结果，只追加
    pub preview_results: Vec<FileAction>,
    pub error_message: Option<String>,
    /// 预览阶段最近扫描到的路径
    pub last_scanned_path: Option<String>,
    pub console_output: String,
    /// 对比阶段开始时刻（毫秒时间戳）
    pub comparison_start: Option<i64>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            phase: TaskPhase::Idle,
            preview_results: Vec::new(),
            error_message: None,
            last_scanned_path: None,
            console_output: String::new(),
            comparison_start: None,
        }
    }
}

/// 一个同步任务：从创建、对比、预览、同步到结束的完整生命周期
pub struct SyncTask {
    pub id: String,
    pub profile: SyncProfile,
    state: RwLock<TaskState>,
    progress: Arc<Mutex<SyncProgress>>,
    run: Arc<TaskRun>,
    settled: Notify,
}

impl SyncTask {
    pub fn new(profile: SyncProfile) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            profile,
            state: RwLock::new(TaskState::new()),
            progress: Arc::new(Mutex::new(SyncProgress::new(
                chrono::Utc::now().timestamp_millis(),
            ))),
            run: Arc::new(TaskRun::new()),
            settled: Notify::new(),
        }
    }

    pub fn run(&self) -> Arc<TaskRun> {
        self.run.clone()
    }

    pub fn progress_cell(&self) -> Arc<Mutex<SyncProgress>> {
        self.progress.clone()
    }

    pub fn phase(&self) -> TaskPhase {
        self.state.read().map(|s| s.phase).unwrap_or(TaskPhase::Failed)
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.read().ok().and_then(|s| s.error_message.clone())
    }

    pub fn progress_snapshot(&self) -> SyncProgress {
        self.progress
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|_| SyncProgress::new(0))
    }

    /// 阶段迁移。非法迁移拒绝并返回 false，终态迁移会唤醒等待者。
    pub fn set_phase(&self, next: TaskPhase) -> bool {
        let changed = match self.state.write() {
            Ok(mut state) => {
                if !state.phase.can_transition_to(next) {
                    warn!(
                        "任务 {} 拒绝非法阶段迁移: {:?} -> {:?}",
                        self.id, state.phase, next
                    );
                    return false;
                }
                info!("任务 {} 阶段: {:?} -> {:?}", self.id, state.phase, next);
                state.phase = next;
                if next == TaskPhase::Comparing {
                    state.comparison_start = Some(chrono::Utc::now().timestamp_millis());
                }
                true
            }
            Err(_) => false,
        };

        if changed && next.is_terminal() {
            self.settled.notify_waiters();
        }
        changed
    }

    /// 标记失败并记录原因
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        if let Ok(mut state) = self.state.write() {
            state.error_message = Some(message);
        }
        self.set_phase(TaskPhase::Failed)
    }

    /// 追加预览批次，更新最近扫描路径。结果列表只追加不回收。
    pub fn append_preview(&self, batch: Vec<FileAction>) {
        if batch.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.write() {
            if let Some(last) = batch.last() {
                state.last_scanned_path = Some(last.relative_path.clone());
            }
            state.preview_results.extend(batch);
        }
    }

    pub fn preview_results(&self) -> Vec<FileAction> {
        self.state
            .read()
            .map(|s| s.preview_results.clone())
            .unwrap_or_default()
    }

    pub fn last_scanned_path(&self) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.last_scanned_path.clone())
    }

    /// 追加一行控制台输出，超限时截断头部
    pub fn append_console(&self, line: &str) {
        if let Ok(mut state) = self.state.write() {
            state.console_output.push_str(line);
            state.console_output.push('\n');

            if state.console_output.len() > CONSOLE_CAP {
                let keep_from = state.console_output.len() - CONSOLE_KEEP;
                // 对齐到字符边界再截断
                let keep_from = (keep_from..state.console_output.len())
                    .find(|&i| state.console_output.is_char_boundary(i))
                    .unwrap_or(keep_from);
                let tail = state.console_output.split_off(keep_from);
                state.console_output = format!("{}{}", TRUNCATION_MARKER, tail);
            }
        }
    }

    pub fn console_output(&self) -> String {
        self.state
            .read()
            .map(|s| s.console_output.clone())
            .unwrap_or_default()
    }

    pub fn comparison_start(&self) -> Option<i64> {
        self.state.read().ok().and_then(|s| s.comparison_start)
    }

    /// 等待任务进入终态
    pub async fn wait_settled(&self) {
        loop {
            if self.phase().is_terminal() {
                return;
            }
            let notified = self.settled.notified();
            // 注册之后再查一次，避免错过通知
            if self.phase().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}
