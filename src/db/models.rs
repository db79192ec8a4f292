use serde::{Deserialize, Serialize};

/// 同步模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// 双向同步：由调用方执行两次单向同步，引擎本身不加特殊参数
    Synchronize,
    /// 镜像：目标成为源的精确副本（包含删除）
    Mirror,
    /// 更新：只复制更新的文件，从不删除
    Update,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Synchronize => "synchronize",
            SyncMode::Mirror => "mirror",
            SyncMode::Update => "update",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_matches('"') {
            "synchronize" => Ok(SyncMode::Synchronize),
            "mirror" => Ok(SyncMode::Mirror),
            "update" => Ok(SyncMode::Update),
            other => Err(anyhow::anyhow!("Invalid sync mode: {}", other)),
        }
    }
}

/// 删除策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// 直接永久删除
    Permanent,
    /// 移入临时回收目录（--backup 到临时目录）
    Trash,
    /// 版本化：备份到用户指定目录
    Versioning { path: String },
}

/// 包含/排除过滤规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".syncpilot_partial/".to_string(),
                "._*".to_string(),
            ],
        }
    }
}

impl FilterConfig {
    /// 展开为 rsync 的 --include/--exclude 参数对，保持声明顺序
    pub fn rsync_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        for pattern in &self.include_patterns {
            flags.push("--include".to_string());
            flags.push(pattern.clone());
        }
        for pattern in &self.exclude_patterns {
            flags.push("--exclude".to_string());
            flags.push(pattern.clone());
        }
        flags
    }
}

/// 同步配置（profile）：一次运行期间只读
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProfile {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub destination_path: String,
    pub sync_mode: SyncMode,
    pub deletion_policy: DeletionPolicy,
    /// 并行子进程数，<= 1 时走单进程路径
    pub thread_count: usize,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub extra_flags: Vec<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
}

impl SyncProfile {
    pub fn new(name: &str, source_path: &str, destination_path: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_path: source_path.to_string(),
            destination_path: destination_path.to_string(),
            sync_mode: SyncMode::Mirror,
            deletion_policy: DeletionPolicy::Trash,
            thread_count: 4,
            filters: FilterConfig::default(),
            extra_flags: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
            last_synced_at: None,
        }
    }
}

/// 变更记录的动作类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    /// 源 -> 目标复制
    CopyToDest,
    /// 目标 -> 源复制
    CopyToSource,
    /// 两侧一致
    Equal,
    /// 删除源侧文件
    DeleteSource,
    /// 删除目标侧文件
    DeleteDest,
    /// 冲突（引擎不做解决）
    Conflict,
}

impl ActionType {
    /// 是否为需要实际传输的复制动作（进度分母的计数依据）
    pub fn is_copy(&self) -> bool {
        matches!(self, ActionType::CopyToDest | ActionType::CopyToSource)
    }
}

/// 一条解析后的比较输出（变更记录）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAction {
    pub relative_path: String,
    pub action: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_modified: Option<i64>,
    /// 展示层可标记排除，引擎不修改
    #[serde(default)]
    pub excluded: bool,
}

impl FileAction {
    pub fn new(relative_path: impl Into<String>, action: ActionType) -> Self {
        Self {
            relative_path: relative_path.into(),
            action,
            source_size: None,
            dest_size: None,
            source_modified: None,
            dest_modified: None,
            excluded: false,
        }
    }

    /// 已知的传输字节数（源侧优先，都未知时为 None）
    pub fn known_size(&self) -> Option<u64> {
        self.source_size.or(self.dest_size)
    }
}

/// 同步进度采样
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// 瞬时速度（字节/秒）
    pub current_speed: f64,
    /// 指数平滑速度：0.8 * 上次 + 0.2 * 瞬时
    pub smoothed_speed: f64,
    pub start_time: i64,
}

impl SyncProgress {
    pub fn new(start_time: i64) -> Self {
        Self {
            total_files: 0,
            completed_files: 0,
            total_bytes: 0,
            transferred_bytes: 0,
            current_speed: 0.0,
            smoothed_speed: 0.0,
            start_time,
        }
    }

    /// 用一次瞬时速度更新当前速度与平滑速度
    pub fn update_speed(&mut self, instant: f64) {
        self.current_speed = instant;
        self.smoothed_speed = 0.8 * self.smoothed_speed + 0.2 * instant;
    }

    /// 完成比例（0..=1），总量未知时为 0
    pub fn fraction_completed(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    /// 预计剩余秒数，速度为 0 时为 None
    pub fn eta_secs(&self) -> Option<u64> {
        if self.smoothed_speed <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        Some((remaining as f64 / self.smoothed_speed) as u64)
    }
}

/// 任务阶段状态机
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Idle,
    Comparing,
    Previewing,
    Syncing,
    Paused,
    Completed,
    Failed,
}

impl TaskPhase {
    /// 是否占用配置（同一配置同时只允许一个活动任务）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskPhase::Comparing | TaskPhase::Syncing | TaskPhase::Paused
        )
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }

    /// 状态机允许的迁移：
    /// idle -> comparing -> previewing -> syncing <-> paused -> completed | failed
    pub fn can_transition_to(&self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        matches!(
            (self, next),
            (Idle, Comparing)
                | (Comparing, Previewing)
                | (Comparing, Failed)
                | (Previewing, Syncing)
                | (Previewing, Failed)
                | (Syncing, Paused)
                | (Syncing, Completed)
                | (Syncing, Failed)
                | (Paused, Syncing)
                | (Paused, Failed)
        )
    }
}

/// 一次运行结束时写入历史的不可变快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTask {
    pub id: String,
    pub profile_name: String,
    pub sync_mode: SyncMode,
    pub start_time: i64,
    pub end_time: i64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub errors: u32,
    pub success: bool,
}

/// 历史记录数据库行
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CompletedTaskRow {
    pub id: String,
    pub profile_name: String,
    pub sync_mode: String,
    pub start_time: i64,
    pub end_time: i64,
    pub files_transferred: i64,
    pub bytes_transferred: i64,
    pub errors: i64,
    pub success: bool,
}

impl TryFrom<CompletedTaskRow> for CompletedTask {
    type Error = anyhow::Error;

    fn try_from(row: CompletedTaskRow) -> Result<Self, Self::Error> {
        Ok(CompletedTask {
            id: row.id,
            profile_name: row.profile_name,
            sync_mode: row.sync_mode.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            files_transferred: row.files_transferred as u64,
            bytes_transferred: row.bytes_transferred as u64,
            errors: row.errors as u32,
            success: row.success,
        })
    }
}
