//! syncpilot - 基于 rsync 的目录同步引擎
//!
//! 核心流程：构建 rsync 命令、解析 itemize/progress 输出、
//! 管理并行子进程、以任务状态机组织整次同步的生命周期。

pub mod access;
pub mod config;
pub mod core;
pub mod db;
pub mod logging;

pub use crate::core::{SyncEngine, SyncError, TaskCoordinator};
pub use crate::db::models::{SyncProfile, TaskPhase};

use crate::access::FsAccessChecker;
use crate::config::{AppConfig, ProfileStore};
use crate::db::HistoryStore;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

const HISTORY_DB: &str = "history.db";

/// 应用全局状态：配置、历史库与任务协调器
pub struct AppState {
    pub config_dir: PathBuf,
    pub app_config: AppConfig,
    pub profiles: Arc<ProfileStore>,
    pub history: HistoryStore,
    pub coordinator: TaskCoordinator,
}

impl AppState {
    /// 初始化应用状态。`config_dir` 为 None 时使用默认配置目录。
    pub async fn init(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => default_config_dir()?,
        };
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("创建配置目录失败: {}", config_dir.display()))?;

        let app_config = AppConfig::load(&config_dir);
        let profiles = Arc::new(ProfileStore::load(&config_dir)?);

        let data_dir = app_config
            .data_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.clone());
        let pool = db::init_pool(&data_dir.join(HISTORY_DB)).await?;
        let history = HistoryStore::new(pool);

        let coordinator = TaskCoordinator::new(
            Arc::new(SyncEngine::new()),
            Arc::new(FsAccessChecker),
            Arc::new(history.clone()),
            profiles.clone(),
        );

        Ok(Self {
            config_dir,
            app_config,
            profiles,
            history,
            coordinator,
        })
    }
}

/// 默认配置目录：$SYNCPILOT_CONFIG_DIR，其次 $XDG_CONFIG_HOME/syncpilot，
/// 最后 ~/.config/syncpilot
pub fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("SYNCPILOT_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("syncpilot"));
    }
    let home = std::env::var("HOME").context("无法确定用户主目录")?;
    Ok(PathBuf::from(home).join(".config").join("syncpilot"))
}
